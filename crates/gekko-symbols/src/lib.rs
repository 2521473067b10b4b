//! Guest function symbol database.
//!
//! Symbols are discovered opportunistically as translation first reaches new
//! guest addresses (via an external function-boundary analyzer), registered
//! explicitly by the debugger, or bulk-loaded from linker map files. The
//! database owns every [`Symbol`]; callers get references.
//!
//! A symbol's identity is its start address. Re-registration mutates the
//! existing entry in place so recorded call-graph edges stay valid.

use std::collections::{BTreeMap, HashMap};
use std::io::{self, BufRead, Write};

/// Guest addresses below this are interrupt vectors and other non-code
/// state; function registration there is always rejected.
pub const LOW_MEM_GUARD: u32 = 0x8000_0010;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolKind {
    Function,
    Data,
    Unknown,
}

/// One edge of the call graph. In a symbol's `calls` list, `function` is the
/// callee start address; in `callers`, it is the caller's.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallEdge {
    pub function: u32,
    pub call_address: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Symbol {
    pub address: u32,
    pub size: u32,
    pub name: String,
    pub checksum: u64,
    pub kind: SymbolKind,
    /// Outgoing call sites recorded by boundary analysis.
    pub calls: Vec<CallEdge>,
    /// Incoming edges, rebuilt by [`SymbolDb::fill_in_callers`].
    pub callers: Vec<CallEdge>,
}

impl Symbol {
    #[inline]
    pub fn end(&self) -> u32 {
        self.address.saturating_add(self.size)
    }

    #[inline]
    pub fn contains(&self, address: u32) -> bool {
        (self.address..self.end()).contains(&address)
    }
}

/// External function-boundary analyzer and content checksummer.
pub trait BoundaryAnalyzer {
    /// Determine where the function starting at `start` ends (exclusive).
    /// `None` means analysis failed and no symbol should be recorded.
    fn find_end(&self, start: u32, size_hint: Option<u32>) -> Option<u32>;

    /// 64-bit content checksum over guest `[start, end)`.
    fn checksum(&self, start: u32, end: u32) -> u64;

    /// Outgoing call sites discovered while analyzing `[start, end)`.
    fn call_sites(&self, start: u32, end: u32) -> Vec<CallEdge> {
        let _ = (start, end);
        Vec::new()
    }
}

#[derive(Debug, Default)]
pub struct SymbolDb {
    symbols: BTreeMap<u32, Symbol>,
    checksum_index: HashMap<u64, Vec<u32>>,
}

impl SymbolDb {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    pub fn symbols(&self) -> impl Iterator<Item = &Symbol> {
        self.symbols.values()
    }

    /// Register a function discovered at `start`, running boundary analysis.
    ///
    /// Returns the (possibly pre-existing) symbol, or `None` when the
    /// address is below the low-memory guard or analysis fails. Never aborts
    /// the session; a bad address is a guest/debugger input, not a bug.
    pub fn add_function(
        &mut self,
        start: u32,
        analyzer: &dyn BoundaryAnalyzer,
    ) -> Option<&Symbol> {
        if start < LOW_MEM_GUARD {
            return None;
        }
        if self.symbols.contains_key(&start) {
            return self.symbols.get(&start);
        }

        let end = analyzer.find_end(start, None)?;
        let checksum = analyzer.checksum(start, end);
        let symbol = Symbol {
            address: start,
            size: end.saturating_sub(start),
            name: format!("zz_{start:08x}"),
            checksum,
            kind: SymbolKind::Function,
            calls: analyzer.call_sites(start, end),
            callers: Vec::new(),
        };
        self.index_checksum(checksum, start);
        self.symbols.insert(start, symbol);
        self.symbols.get(&start)
    }

    /// Upsert a symbol known from an external source (map file, debugger).
    ///
    /// An existing symbol at `start` is updated in place: identity and any
    /// caller edges recorded against it are preserved. For new function
    /// symbols, `size` serves as the boundary-analysis hint.
    pub fn add_known_symbol(
        &mut self,
        start: u32,
        size: u32,
        name: &str,
        kind: SymbolKind,
        analyzer: &dyn BoundaryAnalyzer,
    ) {
        if let Some(symbol) = self.symbols.get_mut(&start) {
            let old_checksum = symbol.checksum;
            symbol.name = name.to_string();
            symbol.size = size;
            symbol.kind = kind;
            symbol.checksum = analyzer.checksum(start, start.saturating_add(size));
            let new_checksum = symbol.checksum;
            self.unindex_checksum(old_checksum, start);
            self.index_checksum(new_checksum, start);
            return;
        }

        let (size, calls) = if kind == SymbolKind::Function {
            let end = analyzer
                .find_end(start, Some(size))
                .unwrap_or_else(|| start.saturating_add(size));
            (end.saturating_sub(start), analyzer.call_sites(start, end))
        } else {
            (size, Vec::new())
        };
        let checksum = analyzer.checksum(start, start.saturating_add(size));
        self.index_checksum(checksum, start);
        self.symbols.insert(
            start,
            Symbol {
                address: start,
                size,
                name: name.to_string(),
                checksum,
                kind,
                calls,
                callers: Vec::new(),
            },
        );
    }

    /// Record an outgoing call edge on the symbol starting at `caller_start`.
    pub fn record_call(&mut self, caller_start: u32, call_address: u32, target: u32) {
        if let Some(symbol) = self.symbols.get_mut(&caller_start) {
            let edge = CallEdge {
                function: target,
                call_address,
            };
            if !symbol.calls.contains(&edge) {
                symbol.calls.push(edge);
            }
        }
    }

    /// Exact-match lookup, then a linear range-containment scan.
    ///
    /// The fallback is O(n) over all symbols, fine for interactive debugger
    /// queries, unsuitable for hot paths. The scan runs in ascending address
    /// order, so the lowest-addressed containing symbol wins.
    pub fn get_symbol_from_addr(&self, address: u32) -> Option<&Symbol> {
        if let Some(symbol) = self.symbols.get(&address) {
            return Some(symbol);
        }
        self.symbols.values().find(|s| s.contains(address))
    }

    pub fn get_symbols_from_checksum(&self, checksum: u64) -> Vec<&Symbol> {
        self.checksum_index
            .get(&checksum)
            .map(|addrs| {
                addrs
                    .iter()
                    .filter_map(|addr| self.symbols.get(addr))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Rebuild every symbol's caller list from the recorded outgoing calls.
    /// Clears first, so repeated calls converge instead of doubling edges.
    pub fn fill_in_callers(&mut self) {
        for symbol in self.symbols.values_mut() {
            symbol.callers.clear();
        }

        let edges: Vec<(u32, CallEdge)> = self
            .symbols
            .values()
            .flat_map(|caller| {
                caller.calls.iter().map(|call| {
                    (
                        call.function,
                        CallEdge {
                            function: caller.address,
                            call_address: call.call_address,
                        },
                    )
                })
            })
            .collect();
        for (target, edge) in edges {
            if let Some(symbol) = self.symbols.get_mut(&target) {
                symbol.callers.push(edge);
            }
        }
    }

    pub fn clear(&mut self) {
        self.symbols.clear();
        self.checksum_index.clear();
    }

    /// Load a linker map: whitespace-separated rows of
    /// `<address-hex> <size-hex> <vaddr-hex> <flag> <name>`.
    ///
    /// Section/header keyword lines are skipped, malformed numeric fields
    /// parse as zero, and rows without a usable address or name are dropped.
    /// Returns `(added, skipped)` row counts.
    pub fn load_map(
        &mut self,
        reader: impl BufRead,
        analyzer: &dyn BoundaryAnalyzer,
    ) -> io::Result<(usize, usize)> {
        const SKIP_KEYWORDS: &[&str] = &[
            "section layout",
            "Memory map",
            "Starting",
            "address",
            "-----",
            ".text",
            ".init",
            ".data",
            ".rodata",
            ".sdata",
            ".sbss",
            ".bss",
            "extab",
        ];

        let mut added = 0usize;
        let mut skipped = 0usize;
        for line in reader.lines() {
            let line = line?;
            let trimmed = line.trim();
            if trimmed.is_empty() || SKIP_KEYWORDS.iter().any(|k| trimmed.contains(k)) {
                continue;
            }

            let tokens: Vec<&str> = trimmed.split_whitespace().collect();
            if tokens.len() < 5 {
                skipped += 1;
                continue;
            }
            let address = parse_hex_or_zero(tokens[0]);
            let size = parse_hex_or_zero(tokens[1]);
            let vaddr = parse_hex_or_zero(tokens[2]);
            let name = tokens[4..].join(" ");

            // Prefer the virtual address column; fall back to the raw one.
            let start = if vaddr != 0 { vaddr } else { address };
            if start == 0 || name.is_empty() {
                skipped += 1;
                continue;
            }
            self.add_known_symbol(start, size, &name, SymbolKind::Function, analyzer);
            added += 1;
        }
        tracing::info!(added, skipped, "loaded symbol map");
        Ok((added, skipped))
    }

    /// Write the database back out in the map format [`SymbolDb::load_map`]
    /// accepts.
    pub fn save_map(&self, writer: &mut impl Write) -> io::Result<()> {
        for symbol in self.symbols.values() {
            writeln!(
                writer,
                "{:08x} {:08x} {:08x} 0 {}",
                symbol.address, symbol.size, symbol.address, symbol.name
            )?;
        }
        Ok(())
    }

    fn index_checksum(&mut self, checksum: u64, address: u32) {
        let addrs = self.checksum_index.entry(checksum).or_default();
        if !addrs.contains(&address) {
            addrs.push(address);
        }
    }

    fn unindex_checksum(&mut self, checksum: u64, address: u32) {
        if let Some(addrs) = self.checksum_index.get_mut(&checksum) {
            addrs.retain(|&a| a != address);
            if addrs.is_empty() {
                self.checksum_index.remove(&checksum);
            }
        }
    }
}

fn parse_hex_or_zero(token: &str) -> u32 {
    u32::from_str_radix(token.trim_start_matches("0x"), 16).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    /// Analyzer with a fixed function table: start → (end, call sites).
    struct FakeAnalyzer {
        functions: HashMap<u32, (u32, Vec<CallEdge>)>,
    }

    impl FakeAnalyzer {
        fn new() -> Self {
            Self {
                functions: HashMap::new(),
            }
        }

        fn with_function(mut self, start: u32, end: u32) -> Self {
            self.functions.insert(start, (end, Vec::new()));
            self
        }

        fn with_calls(mut self, start: u32, end: u32, calls: Vec<CallEdge>) -> Self {
            self.functions.insert(start, (end, calls));
            self
        }
    }

    impl BoundaryAnalyzer for FakeAnalyzer {
        fn find_end(&self, start: u32, size_hint: Option<u32>) -> Option<u32> {
            match self.functions.get(&start) {
                Some(&(end, _)) => Some(end),
                None => size_hint.map(|hint| start + hint),
            }
        }

        fn checksum(&self, start: u32, end: u32) -> u64 {
            (u64::from(start) << 32) | u64::from(end)
        }

        fn call_sites(&self, start: u32, _end: u32) -> Vec<CallEdge> {
            self.functions
                .get(&start)
                .map(|(_, calls)| calls.clone())
                .unwrap_or_default()
        }
    }

    #[test]
    fn low_memory_addresses_are_rejected() {
        let analyzer = FakeAnalyzer::new().with_function(0x4, 0x8);
        let mut db = SymbolDb::new();
        assert!(db.add_function(0x4, &analyzer).is_none());
        assert!(db.is_empty());
    }

    #[test]
    fn failed_analysis_records_nothing() {
        let analyzer = FakeAnalyzer::new();
        let mut db = SymbolDb::new();
        assert!(db.add_function(0x8000_3000, &analyzer).is_none());
        assert!(db.is_empty());
    }

    #[test]
    fn add_function_records_checksum_and_reverse_index() {
        let analyzer = FakeAnalyzer::new().with_function(0x8000_3000, 0x8000_3040);
        let mut db = SymbolDb::new();
        let symbol = db.add_function(0x8000_3000, &analyzer).unwrap();
        assert_eq!(symbol.size, 0x40);
        assert_eq!(symbol.name, "zz_80003000");

        let hash = analyzer.checksum(0x8000_3000, 0x8000_3040);
        let matches = db.get_symbols_from_checksum(hash);
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].address, 0x8000_3000);
    }

    #[test]
    fn upsert_preserves_identity_and_caller_edges() {
        let analyzer = FakeAnalyzer::new().with_function(0x8000_2000, 0x8000_2040);
        let mut db = SymbolDb::new();
        db.add_known_symbol(0x8000_2000, 64, "Foo", SymbolKind::Function, &analyzer);

        // Give Foo a caller, then re-register it.
        db.add_known_symbol(0x8000_1000, 32, "Caller", SymbolKind::Function, &analyzer);
        db.record_call(0x8000_1000, 0x8000_1010, 0x8000_2000);
        db.fill_in_callers();

        db.add_known_symbol(0x8000_2000, 96, "Foo2", SymbolKind::Function, &analyzer);
        assert_eq!(db.len(), 2);
        let foo = db.get_symbol_from_addr(0x8000_2000).unwrap();
        assert_eq!(foo.name, "Foo2");
        assert_eq!(foo.size, 96);
        assert_eq!(foo.callers.len(), 1);
        assert_eq!(foo.callers[0].function, 0x8000_1000);
    }

    #[test]
    fn fill_in_callers_is_idempotent() {
        let analyzer = FakeAnalyzer::new()
            .with_calls(
                0x8000_1000,
                0x8000_1040,
                vec![CallEdge {
                    function: 0x8000_2000,
                    call_address: 0x8000_1010,
                }],
            )
            .with_function(0x8000_2000, 0x8000_2040);
        let mut db = SymbolDb::new();
        db.add_function(0x8000_1000, &analyzer).unwrap();
        db.add_function(0x8000_2000, &analyzer).unwrap();

        db.fill_in_callers();
        db.fill_in_callers();
        let callee = db.get_symbol_from_addr(0x8000_2000).unwrap();
        assert_eq!(callee.callers.len(), 1);
        assert_eq!(
            callee.callers[0],
            CallEdge {
                function: 0x8000_1000,
                call_address: 0x8000_1010
            }
        );
    }

    #[test]
    fn lookup_falls_back_to_containment_scan() {
        let analyzer = FakeAnalyzer::new().with_function(0x8000_3000, 0x8000_3040);
        let mut db = SymbolDb::new();
        db.add_function(0x8000_3000, &analyzer).unwrap();

        assert!(db.get_symbol_from_addr(0x8000_3010).is_some());
        assert!(db.get_symbol_from_addr(0x8000_3040).is_none());
    }

    #[test]
    fn map_load_skips_headers_and_zeroes_malformed_fields() {
        let analyzer = FakeAnalyzer::new();
        let mut db = SymbolDb::new();
        let map = "\
.text section layout
  Starting        Virtual
  address  Size   address
  -----------------------
80003100 00000040 80003100 4 main
80003200 zzzzzzzz 80003200 4 helper
not a map row
";
        let (added, skipped) = db.load_map(Cursor::new(map), &analyzer).unwrap();
        assert_eq!(added, 2);
        assert_eq!(skipped, 1);

        assert_eq!(db.get_symbol_from_addr(0x8000_3100).unwrap().name, "main");
        // Malformed size column parses as zero rather than poisoning the row.
        let helper = db.get_symbol_from_addr(0x8000_3200).unwrap();
        assert_eq!(helper.name, "helper");
        assert_eq!(helper.size, 0);
    }

    #[test]
    fn map_save_load_round_trips_names() {
        let analyzer = FakeAnalyzer::new();
        let mut db = SymbolDb::new();
        db.add_known_symbol(0x8000_4000, 32, "OSInit", SymbolKind::Function, &analyzer);
        db.add_known_symbol(0x8000_5000, 16, "DVDRead", SymbolKind::Function, &analyzer);

        let mut out = Vec::new();
        db.save_map(&mut out).unwrap();

        let mut reloaded = SymbolDb::new();
        reloaded.load_map(Cursor::new(out), &analyzer).unwrap();
        assert_eq!(reloaded.len(), 2);
        assert_eq!(
            reloaded.get_symbol_from_addr(0x8000_4000).unwrap().name,
            "OSInit"
        );
    }
}
