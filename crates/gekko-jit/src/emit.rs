//! Minimal x86-64 byte assembler.
//!
//! Only the encodings the register cache and call-stub generator actually
//! emit are implemented. The assembler is handed the host address its output
//! will be placed at so that displacement decisions (near vs. far call) can
//! be made and tested without mapping executable memory.

/// General-purpose host register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Gpr {
    Rax = 0,
    Rcx = 1,
    Rdx = 2,
    Rbx = 3,
    Rsp = 4,
    Rbp = 5,
    Rsi = 6,
    Rdi = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
}

impl Gpr {
    #[inline]
    pub fn encoding(self) -> u8 {
        self as u8
    }
}

/// Host vector register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Xmm(pub u8);

impl Xmm {
    #[inline]
    pub fn encoding(self) -> u8 {
        self.0
    }

    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Register that translated code keeps the [`gekko_types::GuestContext`]
/// pointer in for the whole lifetime of a block.
pub const CTX_REG: Gpr = Gpr::Rbp;

pub struct Assembler {
    base_addr: u64,
    bytes: Vec<u8>,
}

impl Assembler {
    pub fn new(base_addr: u64) -> Self {
        Self {
            base_addr,
            bytes: Vec::with_capacity(256),
        }
    }

    /// Host address the *next* emitted byte will land at.
    #[inline]
    pub fn current_addr(&self) -> u64 {
        self.base_addr + self.bytes.len() as u64
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    #[inline]
    fn emit_u8(&mut self, b: u8) {
        self.bytes.push(b);
    }

    #[inline]
    fn emit_u32(&mut self, v: u32) {
        self.bytes.extend_from_slice(&v.to_le_bytes());
    }

    #[inline]
    fn emit_u64(&mut self, v: u64) {
        self.bytes.extend_from_slice(&v.to_le_bytes());
    }

    /// REX prefix; skipped when it would be the no-op `0x40`.
    #[inline]
    fn emit_rex(&mut self, w: bool, reg: u8, index: u8, rm: u8) {
        let rex = 0x40
            | ((w as u8) << 3)
            | (((reg >> 3) & 1) << 2)
            | (((index >> 3) & 1) << 1)
            | ((rm >> 3) & 1);
        if rex != 0x40 {
            self.emit_u8(rex);
        }
    }

    #[inline]
    fn emit_modrm(&mut self, mode: u8, reg: u8, rm: u8) {
        self.emit_u8(((mode & 0x3) << 6) | ((reg & 0x7) << 3) | (rm & 0x7));
    }

    #[inline]
    fn emit_sib(&mut self, scale: u8, index: u8, base: u8) {
        self.emit_u8(((scale & 0x3) << 6) | ((index & 0x7) << 3) | (base & 0x7));
    }

    /// `[base + disp32]` operand. RSP/R12 as base require a SIB byte.
    fn emit_mem_disp32(&mut self, reg_field: u8, base: u8, disp: i32) {
        if (base & 0x7) == 0x4 {
            self.emit_modrm(0b10, reg_field, 0x4);
            self.emit_sib(0, 0x4, base);
        } else {
            self.emit_modrm(0b10, reg_field, base);
        }
        self.emit_u32(disp as u32);
    }

    // ---- General-purpose moves ----------------------------------------------------------------

    pub fn mov_r64_imm64(&mut self, dst: Gpr, imm: u64) {
        let d = dst.encoding();
        self.emit_rex(true, 0, 0, d);
        self.emit_u8(0xB8 + (d & 0x7));
        self.emit_u64(imm);
    }

    pub fn mov_r32_imm32(&mut self, dst: Gpr, imm: u32) {
        let d = dst.encoding();
        self.emit_rex(false, 0, 0, d);
        self.emit_u8(0xB8 + (d & 0x7));
        self.emit_u32(imm);
    }

    pub fn mov_r64_r64(&mut self, dst: Gpr, src: Gpr) {
        let (d, s) = (dst.encoding(), src.encoding());
        self.emit_rex(true, s, 0, d);
        self.emit_u8(0x89);
        self.emit_modrm(0b11, s, d);
    }

    pub fn xchg_r64_r64(&mut self, a: Gpr, b: Gpr) {
        let (a, b) = (a.encoding(), b.encoding());
        self.emit_rex(true, a, 0, b);
        self.emit_u8(0x87);
        self.emit_modrm(0b11, a, b);
    }

    pub fn push_r64(&mut self, reg: Gpr) {
        let r = reg.encoding();
        self.emit_rex(false, 0, 0, r);
        self.emit_u8(0x50 + (r & 0x7));
    }

    pub fn pop_r64(&mut self, reg: Gpr) {
        let r = reg.encoding();
        self.emit_rex(false, 0, 0, r);
        self.emit_u8(0x58 + (r & 0x7));
    }

    pub fn sub_rsp_imm32(&mut self, imm: u32) {
        self.emit_rex(true, 0, 0, Gpr::Rsp.encoding());
        self.emit_u8(0x81);
        self.emit_modrm(0b11, 5, Gpr::Rsp.encoding());
        self.emit_u32(imm);
    }

    pub fn add_rsp_imm32(&mut self, imm: u32) {
        self.emit_rex(true, 0, 0, Gpr::Rsp.encoding());
        self.emit_u8(0x81);
        self.emit_modrm(0b11, 0, Gpr::Rsp.encoding());
        self.emit_u32(imm);
    }

    // ---- Calls --------------------------------------------------------------------------------

    pub fn call_rel32(&mut self, disp: i32) {
        self.emit_u8(0xE8);
        self.emit_u32(disp as u32);
    }

    pub fn call_r64(&mut self, reg: Gpr) {
        let r = reg.encoding();
        self.emit_rex(false, 0, 0, r);
        self.emit_u8(0xFF);
        self.emit_modrm(0b11, 2, r);
    }

    // ---- Scalar/vector moves ------------------------------------------------------------------

    /// `movsd xmm, qword [base + disp]`
    pub fn movsd_load(&mut self, dst: Xmm, base: Gpr, disp: i32) {
        self.emit_u8(0xF2);
        self.emit_rex(false, dst.encoding(), 0, base.encoding());
        self.emit_u8(0x0F);
        self.emit_u8(0x10);
        self.emit_mem_disp32(dst.encoding(), base.encoding(), disp);
    }

    /// `movsd qword [base + disp], xmm`
    pub fn movsd_store(&mut self, base: Gpr, disp: i32, src: Xmm) {
        self.emit_u8(0xF2);
        self.emit_rex(false, src.encoding(), 0, base.encoding());
        self.emit_u8(0x0F);
        self.emit_u8(0x11);
        self.emit_mem_disp32(src.encoding(), base.encoding(), disp);
    }

    /// `movups xmm, xmmword [rsp + disp]`
    pub fn movups_load_rsp(&mut self, dst: Xmm, disp: i32) {
        self.emit_rex(false, dst.encoding(), 0, Gpr::Rsp.encoding());
        self.emit_u8(0x0F);
        self.emit_u8(0x10);
        self.emit_mem_disp32(dst.encoding(), Gpr::Rsp.encoding(), disp);
    }

    /// `movups xmmword [rsp + disp], xmm`
    pub fn movups_store_rsp(&mut self, disp: i32, src: Xmm) {
        self.emit_rex(false, src.encoding(), 0, Gpr::Rsp.encoding());
        self.emit_u8(0x0F);
        self.emit_u8(0x11);
        self.emit_mem_disp32(src.encoding(), Gpr::Rsp.encoding(), disp);
    }

    pub fn int3(&mut self) {
        self.emit_u8(0xCC);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mov_imm64_encoding() {
        let mut asm = Assembler::new(0);
        asm.mov_r64_imm64(Gpr::Rax, 0x1122_3344_5566_7788);
        assert_eq!(
            asm.bytes(),
            &[0x48, 0xB8, 0x88, 0x77, 0x66, 0x55, 0x44, 0x33, 0x22, 0x11]
        );

        let mut asm = Assembler::new(0);
        asm.mov_r64_imm64(Gpr::R10, 1);
        assert_eq!(asm.bytes()[..2], [0x49, 0xBA]);
    }

    #[test]
    fn call_encodings() {
        let mut asm = Assembler::new(0);
        asm.call_rel32(-5);
        assert_eq!(asm.bytes(), &[0xE8, 0xFB, 0xFF, 0xFF, 0xFF]);

        let mut asm = Assembler::new(0);
        asm.call_r64(Gpr::Rax);
        assert_eq!(asm.bytes(), &[0xFF, 0xD0]);

        let mut asm = Assembler::new(0);
        asm.call_r64(Gpr::R11);
        assert_eq!(asm.bytes(), &[0x41, 0xFF, 0xD3]);
    }

    #[test]
    fn movsd_uses_sib_for_rsp_base() {
        let mut asm = Assembler::new(0);
        asm.movsd_load(Xmm(1), Gpr::Rsp, 8);
        // F2 0F 10 /r with mod=10, rm=100 (SIB), base=rsp.
        assert_eq!(asm.bytes(), &[0xF2, 0x0F, 0x10, 0x8C, 0x24, 8, 0, 0, 0]);

        let mut asm = Assembler::new(0);
        asm.movsd_store(Gpr::Rbp, 0x40, Xmm(9));
        assert_eq!(asm.bytes(), &[0xF2, 0x44, 0x0F, 0x11, 0x8D, 0x40, 0, 0, 0]);
    }

    #[test]
    fn xchg_and_push_pop() {
        let mut asm = Assembler::new(0);
        asm.xchg_r64_r64(Gpr::Rdi, Gpr::Rsi);
        assert_eq!(asm.bytes(), &[0x48, 0x87, 0xFE]);

        let mut asm = Assembler::new(0);
        asm.push_r64(Gpr::R12);
        asm.pop_r64(Gpr::R12);
        assert_eq!(asm.bytes(), &[0x41, 0x54, 0x41, 0x5C]);
    }

    #[test]
    fn stack_adjustment_encoding() {
        let mut asm = Assembler::new(0);
        asm.sub_rsp_imm32(0x30);
        asm.add_rsp_imm32(0x30);
        assert_eq!(
            asm.bytes(),
            &[0x48, 0x81, 0xEC, 0x30, 0, 0, 0, 0x48, 0x81, 0xC4, 0x30, 0, 0, 0]
        );
    }

    #[test]
    fn current_addr_tracks_emitted_bytes() {
        let mut asm = Assembler::new(0x7000_0000);
        assert_eq!(asm.current_addr(), 0x7000_0000);
        asm.int3();
        assert_eq!(asm.current_addr(), 0x7000_0001);
    }
}
