//! Shared session state for one translated guest.
//!
//! [`Session`] owns the code cache, the debug registries, the symbol
//! database, and the cooperative halt flag, and enforces the ordering
//! contract between them: a debug-registry mutation and the code-cache
//! invalidation it implies happen under one lock, so translation can never
//! observe a breakpoint or memory check without the matching cache state.
//!
//! Lock acquisition follows a fixed order (symbols, then debug registries,
//! then code cache); no path takes them in any other order.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use gekko_debug::{
    Breakpoints, DescribeAddress, EventLog, MemCheck, MemCheckEvent, MemChecks,
};
use gekko_jit::{CodeCache, CodeCacheConfig};
use gekko_symbols::SymbolDb;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("debug state i/o failed")]
    Io(#[from] io::Error),
    #[error("event export failed")]
    Json(#[from] serde_json::Error),
}

/// Breakpoints, memory checks, and the hit log, guarded together so a
/// registry change and its cache invalidation are a single critical section.
struct DebugState {
    breakpoints: Breakpoints,
    memchecks: MemChecks,
    events: EventLog,
}

pub struct Session {
    cache: Mutex<CodeCache>,
    debug: Mutex<DebugState>,
    symbols: RwLock<SymbolDb>,
    halt: Arc<AtomicBool>,
    // Lock-free mirrors of registry emptiness so instrumented paths can skip
    // the mutex when nothing is registered.
    have_breakpoints: AtomicBool,
    have_memchecks: AtomicBool,
}

impl Default for Session {
    fn default() -> Self {
        Self::new(CodeCacheConfig::default())
    }
}

impl Session {
    pub fn new(config: CodeCacheConfig) -> Self {
        Self {
            cache: Mutex::new(CodeCache::with_config(config)),
            debug: Mutex::new(DebugState {
                breakpoints: Breakpoints::new(),
                memchecks: MemChecks::new(),
                events: EventLog::new(1024),
            }),
            symbols: RwLock::new(SymbolDb::new()),
            halt: Arc::new(AtomicBool::new(false)),
            have_breakpoints: AtomicBool::new(false),
            have_memchecks: AtomicBool::new(false),
        }
    }

    // --- halt flag ---

    /// Cloneable handle for dispatch loops that poll the flag at trap points.
    pub fn halt_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.halt)
    }

    pub fn request_halt(&self) {
        self.halt.store(true, Ordering::Relaxed);
    }

    pub fn clear_halt(&self) {
        self.halt.store(false, Ordering::Relaxed);
    }

    pub fn halt_requested(&self) -> bool {
        self.halt.load(Ordering::Relaxed)
    }

    // --- code cache / symbols ---

    pub fn cache(&self) -> MutexGuard<'_, CodeCache> {
        self.cache.lock().unwrap()
    }

    pub fn symbols(&self) -> RwLockReadGuard<'_, SymbolDb> {
        self.symbols.read().unwrap()
    }

    pub fn symbols_mut(&self) -> RwLockWriteGuard<'_, SymbolDb> {
        self.symbols.write().unwrap()
    }

    // --- breakpoints ---

    pub fn add_breakpoint(&self, address: u32, temporary: bool) {
        let mut debug = self.debug.lock().unwrap();
        let mut cache = self.cache.lock().unwrap();
        debug.breakpoints.add(address, temporary, &mut cache);
        self.have_breakpoints
            .store(!debug.breakpoints.is_empty(), Ordering::Relaxed);
    }

    pub fn remove_breakpoint(&self, address: u32) -> bool {
        let mut debug = self.debug.lock().unwrap();
        let mut cache = self.cache.lock().unwrap();
        let removed = debug.breakpoints.remove(address, &mut cache);
        self.have_breakpoints
            .store(!debug.breakpoints.is_empty(), Ordering::Relaxed);
        removed
    }

    pub fn clear_temporary_breakpoints(&self) {
        let mut debug = self.debug.lock().unwrap();
        let mut cache = self.cache.lock().unwrap();
        debug.breakpoints.clear_temporary(&mut cache);
        self.have_breakpoints
            .store(!debug.breakpoints.is_empty(), Ordering::Relaxed);
    }

    pub fn set_breakpoint_enabled(&self, address: u32, enabled: bool) -> bool {
        let mut debug = self.debug.lock().unwrap();
        let mut cache = self.cache.lock().unwrap();
        debug.breakpoints.set_enabled(address, enabled, &mut cache)
    }

    /// Consulted by translation at every block head. The atomic emptiness
    /// check keeps the common no-breakpoints case off the mutex.
    pub fn is_breakpoint(&self, address: u32) -> bool {
        if !self.have_breakpoints.load(Ordering::Relaxed) {
            return false;
        }
        self.debug.lock().unwrap().breakpoints.is_breakpoint(address)
    }

    // --- memory checks ---

    pub fn add_memcheck(&self, check: MemCheck) {
        let mut debug = self.debug.lock().unwrap();
        let mut cache = self.cache.lock().unwrap();
        debug.memchecks.add(check, &mut cache);
        self.have_memchecks
            .store(!debug.memchecks.is_empty(), Ordering::Relaxed);
    }

    pub fn remove_memcheck(&self, start: u32) -> bool {
        let mut debug = self.debug.lock().unwrap();
        let mut cache = self.cache.lock().unwrap();
        let removed = debug.memchecks.remove(start, &mut cache);
        self.have_memchecks
            .store(!debug.memchecks.is_empty(), Ordering::Relaxed);
        removed
    }

    pub fn has_memchecks(&self) -> bool {
        self.have_memchecks.load(Ordering::Relaxed)
    }

    /// Instrumented load/store callback. Hit records carry symbol
    /// descriptions for both `pc` and the faulting address, resolved here
    /// against the session's symbol database. Records any hit in the event
    /// log and raises the halt flag when the check asks for a break; the
    /// caller only needs the returned event for its own reporting.
    pub fn memcheck_action(
        &self,
        value: u64,
        address: u32,
        is_write: bool,
        size: u8,
        pc: u32,
    ) -> Option<MemCheckEvent> {
        if !self.have_memchecks.load(Ordering::Relaxed) {
            return None;
        }
        let symbols = self.symbols.read().unwrap();
        let mut debug = self.debug.lock().unwrap();
        let event = debug
            .memchecks
            .action(&SymbolNames(&symbols), value, address, is_write, size, pc)?;
        if event.should_break {
            self.request_halt();
        }
        debug.events.record(event.clone());
        Some(event)
    }

    pub fn drain_events(&self, max: usize) -> Vec<MemCheckEvent> {
        self.debug.lock().unwrap().events.drain(max)
    }

    pub fn export_events_json(&self) -> Result<Vec<u8>, SessionError> {
        Ok(self.debug.lock().unwrap().events.export_json()?)
    }

    // --- persistence ---

    /// Write `<key>_breakpoints.txt` and `<key>_memchecks.txt` under `dir`.
    pub fn save_debug_state(&self, dir: &Path, key: &str) -> Result<(), SessionError> {
        let (bp_lines, mc_lines) = {
            let debug = self.debug.lock().unwrap();
            (debug.breakpoints.get_strings(), debug.memchecks.get_strings())
        };
        fs::write(state_path(dir, key, "breakpoints"), join_lines(&bp_lines))?;
        fs::write(state_path(dir, key, "memchecks"), join_lines(&mc_lines))?;
        tracing::debug!(
            key,
            breakpoints = bp_lines.len(),
            memchecks = mc_lines.len(),
            "saved debug state"
        );
        Ok(())
    }

    /// Restore both registries from the files [`Session::save_debug_state`]
    /// writes. Missing files load as empty; a read error leaves the
    /// in-memory state untouched.
    pub fn load_debug_state(&self, dir: &Path, key: &str) -> Result<(), SessionError> {
        let bp_lines = read_lines(&state_path(dir, key, "breakpoints"))?;
        let mc_lines = read_lines(&state_path(dir, key, "memchecks"))?;

        let mut debug = self.debug.lock().unwrap();
        let mut cache = self.cache.lock().unwrap();
        debug.breakpoints.clear(&mut cache);
        debug.memchecks.clear(&mut cache);
        debug.breakpoints.add_from_strings(&bp_lines, &mut cache);
        debug.memchecks.add_from_strings(&mc_lines, &mut cache);
        self.have_breakpoints
            .store(!debug.breakpoints.is_empty(), Ordering::Relaxed);
        self.have_memchecks
            .store(!debug.memchecks.is_empty(), Ordering::Relaxed);
        Ok(())
    }

    pub fn breakpoint_strings(&self) -> Vec<String> {
        self.debug.lock().unwrap().breakpoints.get_strings()
    }

    pub fn memcheck_strings(&self) -> Vec<String> {
        self.debug.lock().unwrap().memchecks.get_strings()
    }
}

/// Describes an address as the name of its containing symbol, empty when
/// no symbol covers it.
struct SymbolNames<'a>(&'a SymbolDb);

impl DescribeAddress for SymbolNames<'_> {
    fn describe(&self, address: u32) -> String {
        self.0
            .get_symbol_from_addr(address)
            .map(|sym| sym.name.clone())
            .unwrap_or_default()
    }
}

fn state_path(dir: &Path, key: &str, which: &str) -> PathBuf {
    dir.join(format!("{key}_{which}.txt"))
}

fn join_lines(lines: &[String]) -> String {
    let mut out = lines.join("\n");
    if !out.is_empty() {
        out.push('\n');
    }
    out
}

fn read_lines(path: &Path) -> io::Result<Vec<String>> {
    match fs::read_to_string(path) {
        Ok(text) => Ok(text.lines().map(str::to_string).collect()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e),
    }
}
