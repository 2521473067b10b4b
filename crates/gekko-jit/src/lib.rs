//! Translation-time machinery for the Gekko dynamic recompiler.
//!
//! This crate is the single-threaded half of the JIT support core: everything
//! here runs on the emulation thread while a block is being translated.
//!
//! - [`emit`]: a small x86-64 byte assembler (just the encodings the stub and
//!   register-cache paths need).
//! - [`regcache`]: the host XMM register cache shadowing the guest
//!   paired-single register file.
//! - [`abi`]: host calling-convention strategies and call-stub emission for
//!   slow-path helper calls.
//! - [`cache`]: the per-session code cache mapping guest entry addresses to
//!   compiled translation blocks.

pub mod abi;
pub mod cache;
pub mod emit;
pub mod regcache;

use thiserror::Error;

/// Fatal translation-pipeline errors.
///
/// Both variants signal a defect in the code *emitting* translations, never a
/// guest or debugger condition; callers abort the current block on either.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum JitError {
    /// `regcache` was asked for a host slot while every slot in the pool was
    /// locked out of allocation.
    #[error("host register pool exhausted: every slot is locked")]
    AllocatorExhausted,
    /// A helper call requested more register arguments than the host calling
    /// convention provides.
    #[error("helper call has {requested} arguments but the ABI provides {available} registers")]
    TooManyArguments { requested: usize, available: usize },
}

pub use abi::{compute_frame, CallConv, CallStubPlan, SystemV, Win64};
pub use cache::{CodeCache, CodeCacheConfig, TranslationBlock};
pub use emit::{Assembler, Gpr, Xmm};
pub use regcache::{ContextOps, FlushMode, FprCache};
