//! Guest-visible types shared by the Gekko JIT support crates.
//!
//! The guest is a PowerPC-style CPU whose floating-point register file is
//! *paired*: each of the 32 architectural FPRs holds two 64-bit elements
//! (`ps0`/`ps1`). Translated code shadows individual elements in host
//! registers, so the addressable unit here is one element of one pair
//! ([`FprSlot`]), not the whole register.
//!
//! [`GuestContext`] is the fixed-layout in-memory CPU state that translated
//! code reads and writes through *byte offsets*; its layout is part of the
//! JIT ABI and is locked down with compile-time assertions.

use core::mem::offset_of;

/// Width of one guest instruction in bytes. Breakpoint invalidation and the
/// symbol database both operate at this granularity.
pub const GUEST_INSTR_BYTES: u32 = 4;

/// Number of architectural floating-point registers.
pub const FPR_COUNT: usize = 32;

/// One architectural floating-point register index (0..31).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Fpr(pub u8);

impl Fpr {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Which element of a paired-single register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PsHalf {
    Ps0,
    Ps1,
}

/// One element of the guest floating-point register file: a register index
/// plus which half of the pair. Immutable identity; never destroyed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FprSlot {
    pub fpr: Fpr,
    pub half: PsHalf,
}

impl FprSlot {
    pub const COUNT: usize = FPR_COUNT * 2;

    #[inline]
    pub const fn new(fpr: u8, half: PsHalf) -> Self {
        Self { fpr: Fpr(fpr), half }
    }

    /// Flat index 0..63 (`ps0` and `ps1` of f0, then f1, ...).
    #[inline]
    pub const fn flat_index(self) -> usize {
        (self.fpr.0 as usize) * 2
            + match self.half {
                PsHalf::Ps0 => 0,
                PsHalf::Ps1 => 1,
            }
    }

    #[inline]
    pub const fn from_flat_index(index: usize) -> Self {
        let half = if index % 2 == 0 { PsHalf::Ps0 } else { PsHalf::Ps1 };
        Self::new((index / 2) as u8, half)
    }

    /// Byte offset of this slot within [`GuestContext`].
    #[inline]
    pub const fn context_offset(self) -> usize {
        GuestContext::PS_OFFSET + self.flat_index() * 8
    }
}

/// Fixed-layout guest CPU state block shared with translated code.
///
/// All accesses from emitted host code go through the byte offsets below, so
/// the layout is frozen: `ps0` of pair `n` lives at `PS_OFFSET + 16*n`, `ps1`
/// at `PS_OFFSET + 16*n + 8`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C, align(16))]
pub struct GuestContext {
    /// Current guest program counter.
    pub pc: u32,
    /// "Last exception" flags word, written by slow-path helpers.
    pub last_exception: u32,
    _pad: [u8; 8],
    /// Paired-single register file: `ps[n][0]` = ps0, `ps[n][1]` = ps1.
    pub ps: [[u64; 2]; FPR_COUNT],
}

impl GuestContext {
    pub const PC_OFFSET: usize = offset_of!(GuestContext, pc);
    pub const LAST_EXCEPTION_OFFSET: usize = offset_of!(GuestContext, last_exception);
    pub const PS_OFFSET: usize = offset_of!(GuestContext, ps);

    pub fn new() -> Self {
        Self {
            pc: 0,
            last_exception: 0,
            _pad: [0; 8],
            ps: [[0; 2]; FPR_COUNT],
        }
    }

    #[inline]
    pub fn ps_slot(&self, slot: FprSlot) -> u64 {
        let half = match slot.half {
            PsHalf::Ps0 => 0,
            PsHalf::Ps1 => 1,
        };
        self.ps[slot.fpr.index()][half]
    }

    #[inline]
    pub fn set_ps_slot(&mut self, slot: FprSlot, value: u64) {
        let half = match slot.half {
            PsHalf::Ps0 => 0,
            PsHalf::Ps1 => 1,
        };
        self.ps[slot.fpr.index()][half] = value;
    }
}

impl Default for GuestContext {
    fn default() -> Self {
        Self::new()
    }
}

const _: () = {
    // The register-file base must be 16-byte aligned so pair loads/stores can
    // use aligned vector moves, and each pair occupies exactly 16 bytes.
    assert!(GuestContext::PS_OFFSET % 16 == 0);
    assert!(core::mem::size_of::<GuestContext>() % 16 == 0);
    assert!(
        core::mem::size_of::<GuestContext>()
            == GuestContext::PS_OFFSET + FPR_COUNT * 16
    );
};
