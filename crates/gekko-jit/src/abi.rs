//! Host calling-convention knowledge and call-stub emission.
//!
//! Translated code falls back to slow-path helpers (memory access, exception
//! raising) through stubs that must reproduce the host C ABI bit-for-bit.
//! The convention itself is an injectable strategy ([`CallConv`]) so the same
//! emission logic serves both System V and Windows x64 hosts without
//! platform branching at the call sites.

use crate::emit::{Assembler, Gpr, Xmm};
use crate::JitError;

/// Host calling convention strategy.
pub trait CallConv {
    fn name(&self) -> &'static str;
    /// Bytes of callee-owned shadow space below the return address (0 on
    /// System V, 32 on Windows x64).
    fn shadow_bytes(&self) -> u32;
    /// Integer argument registers, in argument order.
    fn arg_regs(&self) -> &'static [Gpr];
    /// Caller-saved XMM registers as a bitmask (bit `n` = XMMn).
    fn volatile_xmm_mask(&self) -> u16;
    /// Scratch register used to materialize far call targets. RAX is
    /// call-clobbered and never carries an argument in either convention.
    fn scratch_reg(&self) -> Gpr {
        Gpr::Rax
    }
}

/// System V AMD64 (Linux, macOS).
pub struct SystemV;

impl CallConv for SystemV {
    fn name(&self) -> &'static str {
        "sysv"
    }

    fn shadow_bytes(&self) -> u32 {
        0
    }

    fn arg_regs(&self) -> &'static [Gpr] {
        &[Gpr::Rdi, Gpr::Rsi, Gpr::Rdx, Gpr::Rcx, Gpr::R8, Gpr::R9]
    }

    fn volatile_xmm_mask(&self) -> u16 {
        0xFFFF
    }
}

/// Windows x64.
pub struct Win64;

impl CallConv for Win64 {
    fn name(&self) -> &'static str {
        "win64"
    }

    fn shadow_bytes(&self) -> u32 {
        32
    }

    fn arg_regs(&self) -> &'static [Gpr] {
        &[Gpr::Rcx, Gpr::Rdx, Gpr::R8, Gpr::R9]
    }

    fn volatile_xmm_mask(&self) -> u16 {
        0x003F
    }
}

/// Frame bookkeeping for one helper call site. Ephemeral: computed, consumed
/// during emission, never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallStubPlan {
    pub shadow_bytes: u32,
    /// Bytes subtracted from RSP by the stub prologue (excluding GPR pushes).
    pub total_stack_adjustment: u32,
    /// Offset from post-adjustment RSP of the first saved vector register.
    pub vector_save_base_offset: u32,
}

#[inline]
fn align16(bytes: u32) -> u32 {
    (bytes + 15) & !15
}

/// Compute the stack frame for a helper call with `live_xmm_mask` volatile
/// vector registers to preserve and `extra_scratch_bytes` of caller scratch.
///
/// The dispatcher prologue performs an odd number of GPR pushes, so with the
/// return address included RSP is 16-byte aligned inside translated code; a
/// 16-byte-multiple adjustment keeps it aligned at the call instruction.
pub fn compute_frame(
    conv: &dyn CallConv,
    live_xmm_mask: u16,
    extra_scratch_bytes: u32,
) -> CallStubPlan {
    let vector_save_bytes = 16 * (live_xmm_mask & conv.volatile_xmm_mask()).count_ones();
    let shadow_bytes = conv.shadow_bytes();
    let total_stack_adjustment = align16(vector_save_bytes + extra_scratch_bytes) + shadow_bytes;
    CallStubPlan {
        shadow_bytes,
        total_stack_adjustment,
        // Vector saves sit at the top of the adjustment, scratch below them.
        vector_save_base_offset: total_stack_adjustment - vector_save_bytes,
    }
}

/// Push live GPRs, adjust RSP per `plan`, and save live volatile XMMs.
///
/// An odd GPR push count gets 8 bytes of padding folded into the RSP
/// adjustment so the 16-byte alignment invariant survives. Returns the full
/// RSP adjustment actually emitted (for the matching pop).
pub fn emit_push_registers_and_adjust(
    asm: &mut Assembler,
    conv: &dyn CallConv,
    live_gpr_mask: u16,
    live_xmm_mask: u16,
    plan: &CallStubPlan,
) -> u32 {
    let mut pushes = 0u32;
    for i in 0..16u8 {
        if live_gpr_mask & (1 << i) != 0 {
            asm.push_r64(gpr_from_index(i));
            pushes += 1;
        }
    }
    let pad = if pushes % 2 == 1 { 8 } else { 0 };
    let adjustment = plan.total_stack_adjustment + pad;
    if adjustment != 0 {
        asm.sub_rsp_imm32(adjustment);
    }

    let mut save_offset = plan.vector_save_base_offset + pad;
    let to_save = live_xmm_mask & conv.volatile_xmm_mask();
    for i in 0..16u8 {
        if to_save & (1 << i) != 0 {
            asm.movups_store_rsp(save_offset as i32, Xmm(i));
            save_offset += 16;
        }
    }
    adjustment
}

/// Mirror of [`emit_push_registers_and_adjust`]: restore XMMs, release the
/// frame, pop GPRs in reverse order.
pub fn emit_pop_registers_and_adjust(
    asm: &mut Assembler,
    conv: &dyn CallConv,
    live_gpr_mask: u16,
    live_xmm_mask: u16,
    plan: &CallStubPlan,
) {
    let pushes = live_gpr_mask.count_ones();
    let pad = if pushes % 2 == 1 { 8 } else { 0 };

    let mut restore_offset = plan.vector_save_base_offset + pad;
    let to_restore = live_xmm_mask & conv.volatile_xmm_mask();
    for i in 0..16u8 {
        if to_restore & (1 << i) != 0 {
            asm.movups_load_rsp(Xmm(i), restore_offset as i32);
            restore_offset += 16;
        }
    }

    let adjustment = plan.total_stack_adjustment + pad;
    if adjustment != 0 {
        asm.add_rsp_imm32(adjustment);
    }
    for i in (0..16u8).rev() {
        if live_gpr_mask & (1 << i) != 0 {
            asm.pop_r64(gpr_from_index(i));
        }
    }
}

/// Emit a call to `target`. A direct `call rel32` is used when the
/// displacement from the end of the 5-byte call fits in a signed 32-bit
/// field; otherwise the target is materialized into the convention's scratch
/// register for an indirect call. Decided fresh at every call site: code
/// cache placement is not stable relative to helper addresses.
pub fn emit_call(asm: &mut Assembler, conv: &dyn CallConv, target: u64) {
    let rip_after = asm.current_addr().wrapping_add(5);
    let distance = target.wrapping_sub(rip_after);
    if (0x8000_0000..0xFFFF_FFFF_8000_0000).contains(&distance) {
        asm.mov_r64_imm64(conv.scratch_reg(), target);
        asm.call_r64(conv.scratch_reg());
    } else {
        asm.call_rel32(distance as u32 as i32);
    }
}

/// Move `srcs[i]` into the convention's i-th argument register.
///
/// Moves where destination already equals source are skipped. The
/// two-element swap hazard (`dst[i] == src[j]`, `dst[j] == src[i]`) is
/// resolved with `xchg` rather than two clobbering moves; longer cycles
/// degrade to repeated exchanges.
pub fn emit_argument_moves(
    asm: &mut Assembler,
    conv: &dyn CallConv,
    srcs: &[Gpr],
) -> Result<(), JitError> {
    let arg_regs = conv.arg_regs();
    if srcs.len() > arg_regs.len() {
        return Err(JitError::TooManyArguments {
            requested: srcs.len(),
            available: arg_regs.len(),
        });
    }

    emit_moves_to(asm, &arg_regs[..srcs.len()], srcs);
    Ok(())
}

/// One argument to a helper call emitted through [`emit_call_with_args`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallArg {
    Imm32(u32),
    Imm64(u64),
    Reg(Gpr),
}

/// Load arguments and call `target`. Register arguments are scheduled first
/// (their sources must not be clobbered by immediate loads into earlier
/// argument registers).
pub fn emit_call_with_args(
    asm: &mut Assembler,
    conv: &dyn CallConv,
    target: u64,
    args: &[CallArg],
) -> Result<(), JitError> {
    let arg_regs = conv.arg_regs();
    if args.len() > arg_regs.len() {
        return Err(JitError::TooManyArguments {
            requested: args.len(),
            available: arg_regs.len(),
        });
    }

    let reg_args: Vec<Gpr> = args
        .iter()
        .filter_map(|a| match a {
            CallArg::Reg(r) => Some(*r),
            _ => None,
        })
        .collect();
    let reg_dests: Vec<Gpr> = args
        .iter()
        .zip(arg_regs.iter())
        .filter(|(a, _)| matches!(a, CallArg::Reg(_)))
        .map(|(_, &d)| d)
        .collect();
    emit_moves_to(asm, &reg_dests, &reg_args);

    for (arg, &dst) in args.iter().zip(arg_regs.iter()) {
        match *arg {
            CallArg::Imm32(v) => asm.mov_r32_imm32(dst, v),
            CallArg::Imm64(v) => asm.mov_r64_imm64(dst, v),
            CallArg::Reg(_) => {}
        }
    }

    emit_call(asm, conv, target);
    Ok(())
}

fn emit_moves_to(asm: &mut Assembler, dests: &[Gpr], srcs: &[Gpr]) {
    let mut moves: Vec<(Gpr, Gpr)> = dests
        .iter()
        .zip(srcs.iter())
        .filter(|(dst, src)| dst != src)
        .map(|(&dst, &src)| (dst, src))
        .collect();

    while !moves.is_empty() {
        // A move is safe once no remaining move still reads its destination.
        if let Some(i) = moves
            .iter()
            .position(|&(dst, _)| !moves.iter().any(|&(_, src)| src == dst))
        {
            let (dst, src) = moves.swap_remove(i);
            asm.mov_r64_r64(dst, src);
            continue;
        }

        // Every destination is still live as a source: a cycle. Exchange one
        // pair and retarget the remaining reads.
        let (dst, src) = moves.swap_remove(0);
        asm.xchg_r64_r64(dst, src);
        for (_, s) in &mut moves {
            if *s == dst {
                *s = src;
            } else if *s == src {
                *s = dst;
            }
        }
        moves.retain(|(dst, src)| dst != src);
    }
}

fn gpr_from_index(i: u8) -> Gpr {
    match i {
        0 => Gpr::Rax,
        1 => Gpr::Rcx,
        2 => Gpr::Rdx,
        3 => Gpr::Rbx,
        4 => Gpr::Rsp,
        5 => Gpr::Rbp,
        6 => Gpr::Rsi,
        7 => Gpr::Rdi,
        8 => Gpr::R8,
        9 => Gpr::R9,
        10 => Gpr::R10,
        11 => Gpr::R11,
        12 => Gpr::R12,
        13 => Gpr::R13,
        14 => Gpr::R14,
        _ => Gpr::R15,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_with_shadow_space_and_two_vectors() {
        let plan = compute_frame(&Win64, 0b11, 0);
        assert_eq!(plan.shadow_bytes, 32);
        assert_eq!(plan.total_stack_adjustment % 16, 0);
        assert!(plan.total_stack_adjustment >= 32 + 2 * 16);
        assert_eq!(plan.vector_save_base_offset, plan.total_stack_adjustment - 32);
    }

    #[test]
    fn frame_without_shadow_space() {
        let plan = compute_frame(&SystemV, 0, 0);
        assert_eq!(plan.total_stack_adjustment, 0);

        let plan = compute_frame(&SystemV, 0, 24);
        assert_eq!(plan.total_stack_adjustment, 32);
    }

    #[test]
    fn win64_masks_out_nonvolatile_vectors() {
        // XMM6..XMM15 are callee-saved on Windows; only XMM0..5 need saving.
        let plan = compute_frame(&Win64, 0xFFC0, 0);
        assert_eq!(plan.total_stack_adjustment, 32);
    }

    #[test]
    fn near_target_uses_direct_call() {
        let mut asm = Assembler::new(0x1000);
        emit_call(&mut asm, &SystemV, 0x1000 + 100);
        assert_eq!(asm.len(), 5);
        assert_eq!(asm.bytes()[0], 0xE8);
        let disp = i32::from_le_bytes(asm.bytes()[1..5].try_into().unwrap());
        assert_eq!(disp, 100 - 5);
    }

    #[test]
    fn near_backward_target_uses_direct_call() {
        let mut asm = Assembler::new(0x8000_0000);
        emit_call(&mut asm, &SystemV, 0x7FFF_F000);
        assert_eq!(asm.bytes()[0], 0xE8);
        let disp = i32::from_le_bytes(asm.bytes()[1..5].try_into().unwrap());
        assert_eq!(disp, -(0x1000 + 5));
    }

    #[test]
    fn far_target_goes_indirect() {
        let mut asm = Assembler::new(0x1000);
        let five_gb = 5u64 << 30;
        emit_call(&mut asm, &SystemV, 0x1000 + five_gb);
        // mov rax, imm64; call rax
        assert_eq!(asm.bytes()[..2], [0x48, 0xB8]);
        assert_eq!(asm.bytes()[10..], [0xFF, 0xD0]);
    }

    #[test]
    fn displacement_boundary() {
        // Exactly at the positive i32 limit: still a direct call.
        let mut asm = Assembler::new(0);
        emit_call(&mut asm, &SystemV, 5 + 0x7FFF_FFFF);
        assert_eq!(asm.bytes()[0], 0xE8);

        // One past: indirect.
        let mut asm = Assembler::new(0);
        emit_call(&mut asm, &SystemV, 5 + 0x8000_0000);
        assert_eq!(asm.bytes()[..2], [0x48, 0xB8]);
    }

    #[test]
    fn argument_moves_skip_in_place_values() {
        let mut asm = Assembler::new(0);
        emit_argument_moves(&mut asm, &SystemV, &[Gpr::Rdi, Gpr::Rsi]).unwrap();
        assert!(asm.is_empty());
    }

    #[test]
    fn swap_hazard_emits_single_exchange() {
        // arg0 <- rsi, arg1 <- rdi on System V is exactly the two-element
        // swap hazard: two sequential moves would clobber RDI.
        let mut asm = Assembler::new(0);
        emit_argument_moves(&mut asm, &SystemV, &[Gpr::Rsi, Gpr::Rdi]).unwrap();
        let mut expect = Assembler::new(0);
        expect.xchg_r64_r64(Gpr::Rdi, Gpr::Rsi);
        assert_eq!(asm.bytes(), expect.bytes());
    }

    #[test]
    fn dependent_moves_are_ordered_not_clobbered() {
        // arg0 <- r10, arg1 <- rdi: rdi must be read before it is written.
        let mut asm = Assembler::new(0);
        emit_argument_moves(&mut asm, &SystemV, &[Gpr::R10, Gpr::Rdi]).unwrap();
        let mut expect = Assembler::new(0);
        expect.mov_r64_r64(Gpr::Rsi, Gpr::Rdi);
        expect.mov_r64_r64(Gpr::Rdi, Gpr::R10);
        assert_eq!(asm.bytes(), expect.bytes());
    }

    #[test]
    fn too_many_arguments_is_a_translator_bug() {
        let mut asm = Assembler::new(0);
        let five = [Gpr::Rax; 5];
        assert_eq!(
            emit_argument_moves(&mut asm, &Win64, &five),
            Err(JitError::TooManyArguments {
                requested: 5,
                available: 4
            })
        );
    }

    #[test]
    fn push_pop_round_trip_is_symmetric() {
        let conv = SystemV;
        let plan = compute_frame(&conv, 0b101, 8);
        let gprs = 0b0000_0011_0000_0010u16; // rcx, r8, r9

        let mut asm = Assembler::new(0);
        let adjustment = emit_push_registers_and_adjust(&mut asm, &conv, gprs, 0b101, &plan);
        // Odd push count folds 8 bytes of padding into the adjustment.
        assert_eq!(adjustment, plan.total_stack_adjustment + 8);
        emit_pop_registers_and_adjust(&mut asm, &conv, gprs, 0b101, &plan);

        let mut expect = Assembler::new(0);
        expect.push_r64(Gpr::Rcx);
        expect.push_r64(Gpr::R8);
        expect.push_r64(Gpr::R9);
        expect.sub_rsp_imm32(adjustment);
        expect.movups_store_rsp((plan.vector_save_base_offset + 8) as i32, Xmm(0));
        expect.movups_store_rsp((plan.vector_save_base_offset + 24) as i32, Xmm(2));
        expect.movups_load_rsp(Xmm(0), (plan.vector_save_base_offset + 8) as i32);
        expect.movups_load_rsp(Xmm(2), (plan.vector_save_base_offset + 24) as i32);
        expect.add_rsp_imm32(adjustment);
        expect.pop_r64(Gpr::R9);
        expect.pop_r64(Gpr::R8);
        expect.pop_r64(Gpr::Rcx);
        assert_eq!(asm.bytes(), expect.bytes());
    }

    #[test]
    fn call_with_immediate_args() {
        let mut asm = Assembler::new(0x2000);
        emit_call_with_args(
            &mut asm,
            &SystemV,
            0x3000,
            &[CallArg::Imm32(0x8000_1000), CallArg::Reg(Gpr::R11)],
        )
        .unwrap();

        let mut expect = Assembler::new(0x2000);
        expect.mov_r64_r64(Gpr::Rsi, Gpr::R11);
        expect.mov_r32_imm32(Gpr::Rdi, 0x8000_1000);
        emit_call(&mut expect, &SystemV, 0x3000);
        assert_eq!(asm.bytes(), expect.bytes());
    }
}
