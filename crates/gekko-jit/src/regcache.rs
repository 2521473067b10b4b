//! Host XMM register cache for the guest paired-single register file.
//!
//! During translation of a block the cache binds guest slots ([`FprSlot`]) to
//! host XMM registers, tracking per-binding age and dirtiness. Eviction is
//! least-recently-used over the fixed pool; the pool is small enough that a
//! linear scan beats any fancier structure.
//!
//! The cache never touches memory itself. Every fill and writeback is routed
//! through [`ContextOps`], which the translator implements by emitting
//! `movsd` against the guest-context register and tests implement by moving
//! values in a simulated [`gekko_types::GuestContext`].

use gekko_types::FprSlot;

use crate::emit::{Assembler, Xmm, CTX_REG};
use crate::JitError;

/// Size of the allocatable host XMM pool.
pub const XMM_POOL: usize = 16;

/// Fill/writeback sink for the register cache.
pub trait ContextOps {
    /// Load the guest value at `offset` within the guest context into `host`.
    fn emit_load_slot(&mut self, host: Xmm, offset: usize);
    /// Store `host` to the guest value at `offset` within the guest context.
    fn emit_store_slot(&mut self, host: Xmm, offset: usize);
}

impl ContextOps for Assembler {
    fn emit_load_slot(&mut self, host: Xmm, offset: usize) {
        self.movsd_load(host, CTX_REG, offset as i32);
    }

    fn emit_store_slot(&mut self, host: Xmm, offset: usize) {
        self.movsd_store(CTX_REG, offset as i32, host);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushMode {
    /// Write dirty bindings back but keep them live (guest state must become
    /// externally visible mid-block, e.g. before a helper that may read it).
    WriteBackOnly,
    /// Write back and drop every binding (true block exit).
    WriteBackAndRelease,
}

#[derive(Debug, Clone, Copy)]
struct Binding {
    slot: FprSlot,
    age: u32,
    dirty: bool,
}

#[derive(Debug, Clone, Copy, Default)]
struct HostSlot {
    binding: Option<Binding>,
    locked: bool,
}

/// Per-block host register allocator. Single-threaded by construction; only
/// the emulation thread touches it, and only during translation.
#[derive(Debug)]
pub struct FprCache {
    host: [HostSlot; XMM_POOL],
    guest: [Option<Xmm>; FprSlot::COUNT],
}

impl FprCache {
    pub fn new() -> Self {
        Self {
            host: [HostSlot::default(); XMM_POOL],
            guest: [None; FprSlot::COUNT],
        }
    }

    /// Begin a new translation epoch. Dirty bindings are written back before
    /// everything (bindings, ages, locks) is reset, so no stale binding ever
    /// crosses a block boundary.
    pub fn start(&mut self, epoch_hint: u32, ops: &mut dyn ContextOps) {
        tracing::trace!(epoch = format_args!("{epoch_hint:#010x}"), "regcache epoch start");
        self.flush(FlushMode::WriteBackAndRelease, ops);
        for host in &mut self.host {
            host.locked = false;
        }
    }

    /// Resolve `slot` to a host register, binding (and optionally preloading)
    /// it on a miss. `preload = false` leaves the register contents undefined
    /// for a pure write target.
    pub fn get(
        &mut self,
        slot: FprSlot,
        preload: bool,
        ops: &mut dyn ContextOps,
    ) -> Result<Xmm, JitError> {
        if let Some(host) = self.guest[slot.flat_index()] {
            self.age_all_except(host);
            return Ok(host);
        }

        let host = match self.free_slot() {
            Some(host) => host,
            None => {
                let victim = self.eviction_candidate().ok_or(JitError::AllocatorExhausted)?;
                self.evict(victim, ops);
                victim
            }
        };

        if preload {
            ops.emit_load_slot(host, slot.context_offset());
        }
        self.host[host.index()].binding = Some(Binding {
            slot,
            age: 0,
            dirty: false,
        });
        self.guest[slot.flat_index()] = Some(host);
        self.age_all_except(host);
        Ok(host)
    }

    /// Mark the binding for `slot` as holding a value the guest context does
    /// not yet have. No-op for unbound slots.
    pub fn mark_dirty(&mut self, slot: FprSlot) {
        if let Some(host) = self.guest[slot.flat_index()] {
            if let Some(binding) = &mut self.host[host.index()].binding {
                binding.dirty = true;
            }
        }
    }

    /// Remove `host` from the allocatable pool. An existing binding stays
    /// live (and can still be hit) but will not be evicted while locked.
    pub fn lock(&mut self, host: Xmm) {
        self.host[host.index()].locked = true;
    }

    pub fn unlock(&mut self, host: Xmm) {
        self.host[host.index()].locked = false;
    }

    /// Write every dirty binding back to the guest context.
    pub fn flush(&mut self, mode: FlushMode, ops: &mut dyn ContextOps) {
        for i in 0..XMM_POOL {
            let Some(mut binding) = self.host[i].binding else {
                continue;
            };
            if binding.dirty {
                ops.emit_store_slot(Xmm(i as u8), binding.slot.context_offset());
                binding.dirty = false;
            }
            match mode {
                FlushMode::WriteBackAndRelease => {
                    self.guest[binding.slot.flat_index()] = None;
                    self.host[i].binding = None;
                }
                FlushMode::WriteBackOnly => self.host[i].binding = Some(binding),
            }
        }
    }

    /// Single-slot writeback + release, independent of a full flush.
    pub fn store_from_register(&mut self, slot: FprSlot, ops: &mut dyn ContextOps) {
        if let Some(host) = self.guest[slot.flat_index()].take() {
            if let Some(binding) = self.host[host.index()].binding.take() {
                if binding.dirty {
                    ops.emit_store_slot(host, binding.slot.context_offset());
                }
            }
        }
    }

    /// Warm the cache for slots known-live at block entry (`mask` bit `n` =
    /// flat slot `n`). Stops as soon as the free pool runs out; preloading
    /// never evicts.
    pub fn preload_registers(
        &mut self,
        mask: u64,
        ops: &mut dyn ContextOps,
    ) -> Result<(), JitError> {
        for index in 0..FprSlot::COUNT {
            if mask & (1 << index) == 0 {
                continue;
            }
            let slot = FprSlot::from_flat_index(index);
            if self.guest[index].is_none() && self.free_slot().is_none() {
                break;
            }
            self.get(slot, true, ops)?;
        }
        Ok(())
    }

    /// Host register currently bound to `slot`, if any.
    pub fn binding_of(&self, slot: FprSlot) -> Option<Xmm> {
        self.guest[slot.flat_index()]
    }

    pub fn is_dirty(&self, slot: FprSlot) -> bool {
        self.guest[slot.flat_index()]
            .and_then(|host| self.host[host.index()].binding)
            .is_some_and(|b| b.dirty)
    }

    fn free_slot(&self) -> Option<Xmm> {
        self.host
            .iter()
            .position(|h| h.binding.is_none() && !h.locked)
            .map(|i| Xmm(i as u8))
    }

    /// Unlocked binding with the greatest age; ties go to the lowest guest
    /// slot index so eviction order is deterministic.
    fn eviction_candidate(&self) -> Option<Xmm> {
        let mut best: Option<(u32, usize, Xmm)> = None;
        for (i, host) in self.host.iter().enumerate() {
            if host.locked {
                continue;
            }
            let Some(binding) = host.binding else { continue };
            let key = (binding.age, binding.slot.flat_index());
            let better = match best {
                None => true,
                Some((age, slot_index, _)) => {
                    binding.age > age || (binding.age == age && key.1 < slot_index)
                }
            };
            if better {
                best = Some((binding.age, key.1, Xmm(i as u8)));
            }
        }
        best.map(|(_, _, host)| host)
    }

    fn evict(&mut self, host: Xmm, ops: &mut dyn ContextOps) {
        if let Some(binding) = self.host[host.index()].binding.take() {
            if binding.dirty {
                ops.emit_store_slot(host, binding.slot.context_offset());
            }
            self.guest[binding.slot.flat_index()] = None;
        }
    }

    fn age_all_except(&mut self, touched: Xmm) {
        for (i, host) in self.host.iter_mut().enumerate() {
            if let Some(binding) = &mut host.binding {
                if i == touched.index() {
                    binding.age = 0;
                } else {
                    binding.age = binding.age.saturating_add(1);
                }
            }
        }
    }
}

impl Default for FprCache {
    fn default() -> Self {
        Self::new()
    }
}
