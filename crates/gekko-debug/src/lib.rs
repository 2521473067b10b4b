//! Breakpoint and memory-check registries.
//!
//! Both registries are mutated from the debugger/UI thread while the
//! emulation thread executes translated code; the session wraps them (and
//! the invalidation call into the code cache) in a single mutex, which is
//! why every mutating operation here takes the [`CodeCache`] explicitly.
//!
//! Mutations invalidate exactly the compiled blocks that straddle the
//! changed guest addresses: the emitted code for those blocks must gain (or
//! lose) trap checks, and that only happens through retranslation. A block
//! already dispatched runs to completion; the invalidation is observable at
//! the next dispatch.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use gekko_jit::CodeCache;
use gekko_types::GUEST_INSTR_BYTES;

/// An instruction breakpoint. Unique per address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Breakpoint {
    pub address: u32,
    pub enabled: bool,
    /// Temporary breakpoints ("run to cursor") are swept in one call rather
    /// than removed individually.
    pub temporary: bool,
}

/// Instruction breakpoint registry.
#[derive(Debug, Default)]
pub struct Breakpoints {
    entries: Vec<Breakpoint>,
}

impl Breakpoints {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[Breakpoint] {
        &self.entries
    }

    pub fn is_breakpoint(&self, address: u32) -> bool {
        self.entries
            .iter()
            .any(|bp| bp.address == address && bp.enabled)
    }

    /// Insert a breakpoint and invalidate the blocks containing its
    /// instruction. Adding a duplicate address is a no-op.
    pub fn add(&mut self, address: u32, temporary: bool, cache: &mut CodeCache) {
        if self.entries.iter().any(|bp| bp.address == address) {
            return;
        }
        self.entries.push(Breakpoint {
            address,
            enabled: true,
            temporary,
        });
        invalidate_instruction(cache, address);
    }

    pub fn remove(&mut self, address: u32, cache: &mut CodeCache) -> bool {
        let before = self.entries.len();
        self.entries.retain(|bp| bp.address != address);
        let removed = self.entries.len() != before;
        if removed {
            invalidate_instruction(cache, address);
        }
        removed
    }

    /// Enable or disable an existing breakpoint without forgetting it.
    /// Returns false when no breakpoint exists at `address`. A state change
    /// invalidates the instruction's blocks: the trap check appears or
    /// disappears only through retranslation.
    pub fn set_enabled(&mut self, address: u32, enabled: bool, cache: &mut CodeCache) -> bool {
        let Some(bp) = self.entries.iter_mut().find(|bp| bp.address == address) else {
            return false;
        };
        if bp.enabled != enabled {
            bp.enabled = enabled;
            invalidate_instruction(cache, address);
        }
        true
    }

    /// Remove exactly the temporary subset, invalidating each address as an
    /// individual remove would.
    pub fn clear_temporary(&mut self, cache: &mut CodeCache) {
        let swept: Vec<u32> = self
            .entries
            .iter()
            .filter(|bp| bp.temporary)
            .map(|bp| bp.address)
            .collect();
        self.entries.retain(|bp| !bp.temporary);
        for address in swept {
            invalidate_instruction(cache, address);
        }
    }

    pub fn clear(&mut self, cache: &mut CodeCache) {
        let all: Vec<u32> = self.entries.iter().map(|bp| bp.address).collect();
        self.entries.clear();
        for address in all {
            invalidate_instruction(cache, address);
        }
    }

    /// One line per entry: `<addr-hex>` plus ` n` for non-temporary entries.
    pub fn get_strings(&self) -> Vec<String> {
        self.entries
            .iter()
            .map(|bp| {
                if bp.temporary {
                    format!("{:08x}", bp.address)
                } else {
                    format!("{:08x} n", bp.address)
                }
            })
            .collect()
    }

    /// Re-add entries from [`Breakpoints::get_strings`] output. Malformed
    /// lines are skipped.
    pub fn add_from_strings(&mut self, lines: &[String], cache: &mut CodeCache) {
        for line in lines {
            let mut tokens = line.split_whitespace();
            let Some(addr_str) = tokens.next() else {
                continue;
            };
            let Ok(address) = u32::from_str_radix(addr_str, 16) else {
                tracing::warn!(line = %line, "skipping malformed breakpoint line");
                continue;
            };
            let temporary = !tokens.any(|t| t.contains('n'));
            self.add(address, temporary, cache);
        }
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MemCheckFlags: u8 {
        /// Trigger on guest reads.
        const READ = 1 << 0;
        /// Trigger on guest writes.
        const WRITE = 1 << 1;
        /// Emit a structured log record on hit.
        const LOG = 1 << 2;
        /// Request a cooperative halt on hit.
        const BREAK = 1 << 3;
    }
}

/// A memory watch over `[start, end]` (end inclusive; `end == start` when
/// not ranged). Unique per start address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemCheck {
    pub start: u32,
    pub end: u32,
    pub flags: MemCheckFlags,
}

impl MemCheck {
    #[inline]
    pub fn is_ranged(&self) -> bool {
        self.end != self.start
    }

    #[inline]
    pub fn contains(&self, address: u32) -> bool {
        (self.start..=self.end).contains(&address)
    }
}

/// Structured record of one memory-check hit, handed to the external log
/// sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemCheckEvent {
    pub pc: u32,
    /// Symbol/location description for `pc`, empty when unresolved.
    pub pc_description: String,
    pub address: u32,
    /// Symbol/location description for `address`, empty when unresolved.
    pub address_description: String,
    pub value: u64,
    pub size: u8,
    pub is_write: bool,
    /// Whether the registry asks the emulation loop to halt at the next safe
    /// point.
    pub should_break: bool,
}

/// Resolves a guest address to a human-readable location (typically the
/// containing function's name). Hit records embed the result so log sinks
/// need no symbol access of their own.
pub trait DescribeAddress {
    fn describe(&self, address: u32) -> String;
}

/// Describer for contexts without symbol information.
pub struct NoDescriptions;

impl DescribeAddress for NoDescriptions {
    fn describe(&self, _address: u32) -> String {
        String::new()
    }
}

/// Memory-check registry.
#[derive(Debug, Default)]
pub struct MemChecks {
    entries: Vec<MemCheck>,
}

impl MemChecks {
    pub fn new() -> Self {
        Self::default()
    }

    /// The instrumented load/store path must consult this before any lookup;
    /// an empty registry makes `action` unreachable at negligible cost.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[MemCheck] {
        &self.entries
    }

    pub fn get(&self, address: u32) -> Option<&MemCheck> {
        self.entries.iter().find(|mc| mc.contains(address))
    }

    /// Insert a check, or merge into the existing entry with the same start
    /// address. Flags merge by union; the range grows to the union of both.
    /// Only newly covered addresses are invalidated, so re-adding a check with
    /// no new coverage does not disturb the code cache.
    pub fn add(&mut self, check: MemCheck, cache: &mut CodeCache) {
        let check = normalize(check);
        if let Some(existing) = self.entries.iter_mut().find(|mc| mc.start == check.start) {
            existing.flags |= check.flags;
            if check.end > existing.end {
                let newly_covered_from = existing.end.saturating_add(1);
                existing.end = check.end;
                invalidate_span(cache, newly_covered_from, check.end);
            }
            return;
        }
        self.entries.push(check);
        invalidate_span(cache, check.start, check.end);
    }

    pub fn remove(&mut self, start: u32, cache: &mut CodeCache) -> bool {
        let Some(pos) = self.entries.iter().position(|mc| mc.start == start) else {
            return false;
        };
        let check = self.entries.remove(pos);
        invalidate_span(cache, check.start, check.end);
        true
    }

    pub fn clear(&mut self, cache: &mut CodeCache) {
        let all: Vec<MemCheck> = self.entries.drain(..).collect();
        for check in all {
            invalidate_span(cache, check.start, check.end);
        }
    }

    /// Evaluate an instrumented guest access against the registry.
    /// Descriptions for `pc` and `address` are resolved only on a hit.
    pub fn action(
        &self,
        describe: &dyn DescribeAddress,
        value: u64,
        address: u32,
        is_write: bool,
        size: u8,
        pc: u32,
    ) -> Option<MemCheckEvent> {
        let check = self.get(address)?;
        let hit = if is_write {
            check.flags.contains(MemCheckFlags::WRITE)
        } else {
            check.flags.contains(MemCheckFlags::READ)
        };
        if !hit {
            return None;
        }

        let event = MemCheckEvent {
            pc,
            pc_description: describe.describe(pc),
            address,
            address_description: describe.describe(address),
            value,
            size,
            is_write,
            should_break: check.flags.contains(MemCheckFlags::BREAK),
        };
        if check.flags.contains(MemCheckFlags::LOG) {
            tracing::info!(
                pc = format_args!("{pc:08x}"),
                pc_description = %event.pc_description,
                address = format_args!("{address:08x}"),
                address_description = %event.address_description,
                value = format_args!("{value:#x}"),
                size,
                direction = if is_write { "write" } else { "read" },
                "memory check hit"
            );
        }
        Some(event)
    }

    /// One line per entry: `<start-hex> <end-hex> <flags>` where flags are
    /// the literal characters `n` (ranged), `r`, `w`, `l`, `p`.
    pub fn get_strings(&self) -> Vec<String> {
        self.entries
            .iter()
            .map(|mc| {
                let mut flags = String::new();
                if mc.is_ranged() {
                    flags.push('n');
                }
                if mc.flags.contains(MemCheckFlags::READ) {
                    flags.push('r');
                }
                if mc.flags.contains(MemCheckFlags::WRITE) {
                    flags.push('w');
                }
                if mc.flags.contains(MemCheckFlags::LOG) {
                    flags.push('l');
                }
                if mc.flags.contains(MemCheckFlags::BREAK) {
                    flags.push('p');
                }
                format!("{:08x} {:08x} {}", mc.start, mc.end, flags)
            })
            .collect()
    }

    /// Re-add entries from [`MemChecks::get_strings`] output. Malformed
    /// lines are skipped.
    pub fn add_from_strings(&mut self, lines: &[String], cache: &mut CodeCache) {
        for line in lines {
            let mut tokens = line.split_whitespace();
            let (Some(start_str), Some(end_str)) = (tokens.next(), tokens.next()) else {
                continue;
            };
            let (Ok(start), Ok(end)) = (
                u32::from_str_radix(start_str, 16),
                u32::from_str_radix(end_str, 16),
            ) else {
                tracing::warn!(line = %line, "skipping malformed memory check line");
                continue;
            };
            let flag_str = tokens.next().unwrap_or("");
            let mut flags = MemCheckFlags::empty();
            for c in flag_str.chars() {
                match c {
                    'r' => flags |= MemCheckFlags::READ,
                    'w' => flags |= MemCheckFlags::WRITE,
                    'l' => flags |= MemCheckFlags::LOG,
                    'p' => flags |= MemCheckFlags::BREAK,
                    'n' => {}
                    _ => {}
                }
            }
            let ranged = flag_str.contains('n');
            let end = if ranged { end } else { start };
            self.add(
                MemCheck { start, end, flags },
                cache,
            );
        }
    }
}

/// Bounded buffer of memory-check hit records awaiting the external sink.
#[derive(Debug)]
pub struct EventLog {
    max_events: usize,
    events: VecDeque<MemCheckEvent>,
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new(4096)
    }
}

impl EventLog {
    pub fn new(max_events: usize) -> Self {
        Self {
            max_events: max_events.max(1),
            events: VecDeque::new(),
        }
    }

    pub fn record(&mut self, event: MemCheckEvent) {
        if self.events.len() == self.max_events {
            self.events.pop_front();
        }
        self.events.push_back(event);
    }

    pub fn drain(&mut self, max: usize) -> Vec<MemCheckEvent> {
        let max = max.min(self.events.len());
        self.events.drain(..max).collect()
    }

    pub fn export_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&self.events.iter().collect::<Vec<_>>())
    }
}

fn normalize(check: MemCheck) -> MemCheck {
    MemCheck {
        end: check.end.max(check.start),
        ..check
    }
}

/// Invalidate the compiled blocks containing the instruction at `address`.
fn invalidate_instruction(cache: &mut CodeCache, address: u32) {
    let removed = cache.invalidate_range(address, address.wrapping_add(GUEST_INSTR_BYTES));
    if !removed.is_empty() {
        tracing::debug!(
            address = format_args!("{address:08x}"),
            blocks = removed.len(),
            "invalidated blocks for breakpoint change"
        );
    }
}

/// Invalidate blocks overlapping the inclusive guest span `[start, end]`.
fn invalidate_span(cache: &mut CodeCache, start: u32, end: u32) {
    let removed = cache.invalidate_range(start, end.saturating_add(1));
    if !removed.is_empty() {
        tracing::debug!(
            start = format_args!("{start:08x}"),
            end = format_args!("{end:08x}"),
            blocks = removed.len(),
            "invalidated blocks for memory check change"
        );
    }
}
