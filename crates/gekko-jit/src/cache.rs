//! Code cache: guest entry address → compiled translation block.
//!
//! The cache owns every [`TranslationBlock`] for the session. Capacity is
//! bounded both by block count and by total host-code bytes; either cap
//! evicts least-recently-dispatched blocks. Invalidation (breakpoint or
//! memory-check mutation, self-modifying code) removes whole blocks whose
//! guest range overlaps the changed addresses; a block is never patched in
//! place, the next dispatch simply retranslates.

use std::collections::HashMap;

/// One compiled unit of guest code: a contiguous guest range plus the host
/// code generated for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranslationBlock {
    pub entry_addr: u32,
    /// Guest bytes covered, starting at `entry_addr`.
    pub guest_len: u32,
    pub host_code: Vec<u8>,
}

impl TranslationBlock {
    #[inline]
    pub fn guest_end(&self) -> u32 {
        self.entry_addr.saturating_add(self.guest_len)
    }

    /// Whether the block's guest range overlaps `[start, end)`.
    #[inline]
    pub fn overlaps(&self, start: u32, end: u32) -> bool {
        self.entry_addr < end && start < self.guest_end()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodeCacheConfig {
    pub max_blocks: usize,
    pub max_bytes: usize,
}

impl Default for CodeCacheConfig {
    fn default() -> Self {
        Self {
            max_blocks: 4096,
            max_bytes: 16 * 1024 * 1024,
        }
    }
}

#[derive(Debug)]
pub struct CodeCache {
    blocks: HashMap<u32, TranslationBlock>,
    /// Entry addresses ordered LRU-first.
    recency: Vec<u32>,
    current_bytes: usize,
    config: CodeCacheConfig,
}

impl CodeCache {
    pub fn new(max_blocks: usize, max_bytes: usize) -> Self {
        Self::with_config(CodeCacheConfig {
            max_blocks,
            max_bytes,
        })
    }

    pub fn with_config(config: CodeCacheConfig) -> Self {
        Self {
            blocks: HashMap::new(),
            recency: Vec::new(),
            current_bytes: 0,
            config,
        }
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn current_bytes(&self) -> usize {
        self.current_bytes
    }

    pub fn contains(&self, entry_addr: u32) -> bool {
        self.blocks.contains_key(&entry_addr)
    }

    /// Insert (or replace) the block for its entry address and return the
    /// entry addresses evicted to satisfy the caps.
    pub fn insert(&mut self, block: TranslationBlock) -> Vec<u32> {
        let entry = block.entry_addr;
        if let Some(old) = self.blocks.insert(entry, block) {
            self.current_bytes -= old.host_code.len();
        } else {
            self.recency.push(entry);
        }
        self.current_bytes += self.blocks[&entry].host_code.len();
        self.touch(entry);

        let mut evicted = Vec::new();
        while self.blocks.len() > self.config.max_blocks
            || self.current_bytes > self.config.max_bytes
        {
            // Never evict the block just inserted, even if it alone exceeds
            // the byte budget.
            let Some(pos) = self.recency.iter().position(|&a| a != entry) else {
                break;
            };
            let victim = self.recency.remove(pos);
            if let Some(block) = self.blocks.remove(&victim) {
                self.current_bytes -= block.host_code.len();
            }
            evicted.push(victim);
        }
        evicted
    }

    /// Dispatch lookup: returns the block and marks it most recently used.
    pub fn get(&mut self, entry_addr: u32) -> Option<&TranslationBlock> {
        if !self.blocks.contains_key(&entry_addr) {
            return None;
        }
        self.touch(entry_addr);
        self.blocks.get(&entry_addr)
    }

    /// Non-recency-updating lookup for debugger/inspection paths.
    pub fn peek(&self, entry_addr: u32) -> Option<&TranslationBlock> {
        self.blocks.get(&entry_addr)
    }

    /// Remove every block whose guest range overlaps `[start, end)`; returns
    /// the removed entry addresses in ascending order.
    pub fn invalidate_range(&mut self, start: u32, end: u32) -> Vec<u32> {
        let mut removed: Vec<u32> = self
            .blocks
            .values()
            .filter(|b| b.overlaps(start, end))
            .map(|b| b.entry_addr)
            .collect();
        removed.sort_unstable();
        for &entry in &removed {
            if let Some(block) = self.blocks.remove(&entry) {
                self.current_bytes -= block.host_code.len();
            }
            self.recency.retain(|&a| a != entry);
        }
        removed
    }

    pub fn clear(&mut self) {
        self.blocks.clear();
        self.recency.clear();
        self.current_bytes = 0;
    }

    fn touch(&mut self, entry_addr: u32) {
        if let Some(pos) = self.recency.iter().position(|&a| a == entry_addr) {
            let addr = self.recency.remove(pos);
            self.recency.push(addr);
        }
    }
}

impl Default for CodeCache {
    fn default() -> Self {
        Self::with_config(CodeCacheConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(entry_addr: u32, guest_len: u32, host_len: usize) -> TranslationBlock {
        TranslationBlock {
            entry_addr,
            guest_len,
            host_code: vec![0x90; host_len],
        }
    }

    #[test]
    fn get_updates_recency_for_byte_cap_eviction() {
        let mut cache = CodeCache::new(10, 25);
        assert!(cache.insert(block(0, 4, 10)).is_empty());
        assert!(cache.insert(block(1, 4, 10)).is_empty());
        assert_eq!(cache.current_bytes(), 20);

        // Touch the LRU entry; the next insert must evict `1`, not `0`.
        assert!(cache.get(0).is_some());
        let evicted = cache.insert(block(2, 4, 10));
        assert_eq!(evicted, vec![1]);
        assert!(cache.contains(0));
        assert!(!cache.contains(1));
        assert!(cache.contains(2));
        assert_eq!(cache.current_bytes(), 20);
    }

    #[test]
    fn block_count_cap_evicts_lru() {
        let mut cache = CodeCache::new(2, usize::MAX);
        cache.insert(block(0x100, 4, 1));
        cache.insert(block(0x200, 4, 1));
        let evicted = cache.insert(block(0x300, 4, 1));
        assert_eq!(evicted, vec![0x100]);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn replacing_a_block_updates_bytes_without_eviction() {
        let mut cache = CodeCache::new(10, 100);
        cache.insert(block(0x100, 4, 10));
        assert!(cache.insert(block(0x100, 8, 30)).is_empty());
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.current_bytes(), 30);
        assert_eq!(cache.peek(0x100).unwrap().guest_len, 8);
    }

    #[test]
    fn invalidate_range_removes_straddling_blocks() {
        let mut cache = CodeCache::default();
        cache.insert(block(0x8000_0FF0, 0x20, 8)); // [0x8000_0FF0, 0x8000_1010)
        cache.insert(block(0x8000_2000, 0x10, 8));

        let removed = cache.invalidate_range(0x8000_1000, 0x8000_1004);
        assert_eq!(removed, vec![0x8000_0FF0]);
        assert!(!cache.contains(0x8000_0FF0));
        assert!(cache.contains(0x8000_2000));
        assert_eq!(cache.current_bytes(), 8);
    }

    #[test]
    fn invalidate_range_is_end_exclusive() {
        let mut cache = CodeCache::default();
        cache.insert(block(0x1000, 0x10, 4));
        assert!(cache.invalidate_range(0x1010, 0x1014).is_empty());
        assert_eq!(cache.invalidate_range(0x100C, 0x1010), vec![0x1000]);
    }
}
