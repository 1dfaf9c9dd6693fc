//! x86-64 instruction encoding.
//!
//! Every emitter picks the shortest legal form: REX only when a bit is set,
//! imm8 or disp8 whenever the value fits, accumulator short forms for
//! 32-bit immediates on RAX.

use super::codebuf::CodeBuffer;
use crate::error::{JitError, JitResult};

/// x86-64 general-purpose registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Reg {
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

impl Reg {
    /// Full register number, 0..=15.
    pub fn number(self) -> u8 {
        self as u8
    }

    /// Low three bits, as they appear in ModR/M and opcode bytes.
    pub fn code(self) -> u8 {
        (self as u8) & 0x7
    }

    /// R8..R15 need a REX extension bit.
    pub fn needs_rex_ext(self) -> bool {
        (self as u8) >= 8
    }
}

/// Condition codes, in encoding order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Cond {
    O = 0x0,
    No = 0x1,
    B = 0x2,
    Ae = 0x3,
    E = 0x4,
    Ne = 0x5,
    Be = 0x6,
    A = 0x7,
    S = 0x8,
    Ns = 0x9,
    P = 0xA,
    Np = 0xB,
    L = 0xC,
    Ge = 0xD,
    Le = 0xE,
    G = 0xF,
}

impl Cond {
    const ALL: [Cond; 16] = [
        Cond::O,
        Cond::No,
        Cond::B,
        Cond::Ae,
        Cond::E,
        Cond::Ne,
        Cond::Be,
        Cond::A,
        Cond::S,
        Cond::Ns,
        Cond::P,
        Cond::Np,
        Cond::L,
        Cond::Ge,
        Cond::Le,
        Cond::G,
    ];

    /// The opposite condition; pairs differ only in the low bit.
    pub fn invert(self) -> Self {
        Self::ALL[(self as u8 ^ 1) as usize]
    }
}

pub(crate) fn fits_i8(v: i64) -> bool {
    i8::try_from(v).is_ok()
}

pub(crate) fn fits_i32(v: i64) -> bool {
    i32::try_from(v).is_ok()
}

/// Addresses whose bits 47..63 are all equal.
fn is_canonical(addr: usize) -> bool {
    let upper = (addr as u64) >> 47;
    upper == 0 || upper == 0x1_ffff
}

/// x86-64 assembler writing into a [`CodeBuffer`].
pub struct X86_64Assembler<'a> {
    buf: &'a mut CodeBuffer,
}

impl<'a> X86_64Assembler<'a> {
    pub fn new(buf: &'a mut CodeBuffer) -> Self {
        Self { buf }
    }

    pub(crate) fn buffer(&mut self) -> &mut CodeBuffer {
        self.buf
    }

    pub fn offset(&self) -> usize {
        self.buf.offset()
    }

    // ==================== Prefix and operand bytes ====================

    /// REX prefix; omitted when no bit would be set.
    /// `reg` and `rm` are full register numbers (or an opcode extension).
    fn rex(&mut self, w: bool, reg: u8, rm: u8) {
        let rex = 0x40 | ((w as u8) << 3) | ((reg >> 3) & 1) << 2 | ((rm >> 3) & 1);
        if rex != 0x40 {
            self.buf.emit_u8(rex);
        }
    }

    fn modrm(&mut self, mode: u8, reg: u8, rm: u8) {
        self.buf
            .emit_u8(((mode & 0x3) << 6) | ((reg & 0x7) << 3) | (rm & 0x7));
    }

    /// ModR/M (and SIB, displacement) for `[base + disp]`.
    fn mem(&mut self, reg: u8, base: Reg, disp: i32) {
        let rm = base.code();
        // RBP and R13 have no disp0 form.
        let mode = if disp == 0 && rm != 0b101 {
            0
        } else if fits_i8(disp as i64) {
            1
        } else {
            2
        };
        self.modrm(mode, reg, rm);
        // RSP and R12 as base need a SIB byte with no index.
        if rm == 0b100 {
            self.buf.emit_u8(0x24);
        }
        match mode {
            1 => self.buf.emit_u8(disp as i8 as u8),
            2 => self.buf.emit_u32(disp as u32),
            _ => {}
        }
    }

    // ==================== Data movement ====================

    /// MOV dst, src (64-bit)
    pub fn mov_rr(&mut self, dst: Reg, src: Reg) {
        self.rex(true, src.number(), dst.number());
        self.buf.emit_u8(0x89);
        self.modrm(3, src.code(), dst.code());
    }

    /// MOV dst, imm using the shortest encoding for the value.
    pub fn mov_ri(&mut self, dst: Reg, imm: i64) {
        if (0..=u32::MAX as i64).contains(&imm) {
            // 32-bit move zero-extends
            self.rex(false, 0, dst.number());
            self.buf.emit_u8(0xB8 + dst.code());
            self.buf.emit_u32(imm as u32);
        } else if fits_i32(imm) {
            self.rex(true, 0, dst.number());
            self.buf.emit_u8(0xC7);
            self.modrm(3, 0, dst.code());
            self.buf.emit_u32(imm as i32 as u32);
        } else {
            self.rex(true, 0, dst.number());
            self.buf.emit_u8(0xB8 + dst.code());
            self.buf.emit_u64(imm as u64);
        }
    }

    /// MOV dst, [base + disp] (64-bit)
    pub fn mov_rm(&mut self, dst: Reg, base: Reg, disp: i32) {
        self.rex(true, dst.number(), base.number());
        self.buf.emit_u8(0x8B);
        self.mem(dst.code(), base, disp);
    }

    /// MOV dst32, [base + disp], zero-extending into the full register.
    pub fn mov_rm32(&mut self, dst: Reg, base: Reg, disp: i32) {
        self.rex(false, dst.number(), base.number());
        self.buf.emit_u8(0x8B);
        self.mem(dst.code(), base, disp);
    }

    /// MOVZX dst32, word [base + disp]
    pub fn movzx_rm16(&mut self, dst: Reg, base: Reg, disp: i32) {
        self.rex(false, dst.number(), base.number());
        self.buf.emit_bytes(&[0x0F, 0xB7]);
        self.mem(dst.code(), base, disp);
    }

    /// MOV [base + disp], src (64-bit)
    pub fn mov_mr(&mut self, base: Reg, disp: i32, src: Reg) {
        self.rex(true, src.number(), base.number());
        self.buf.emit_u8(0x89);
        self.mem(src.code(), base, disp);
    }

    /// MOV qword [base + disp], imm32 (sign-extended)
    pub fn mov_mi(&mut self, base: Reg, disp: i32, imm: i32) {
        self.rex(true, 0, base.number());
        self.buf.emit_u8(0xC7);
        self.mem(0, base, disp);
        self.buf.emit_u32(imm as u32);
    }

    /// MOV dword [base + disp], imm32
    pub fn mov_mi32(&mut self, base: Reg, disp: i32, imm: i32) {
        self.rex(false, 0, base.number());
        self.buf.emit_u8(0xC7);
        self.mem(0, base, disp);
        self.buf.emit_u32(imm as u32);
    }

    /// LEA dst, [base + disp]
    pub fn lea(&mut self, dst: Reg, base: Reg, disp: i32) {
        self.rex(true, dst.number(), base.number());
        self.buf.emit_u8(0x8D);
        self.mem(dst.code(), base, disp);
    }

    /// Everything of a RIP-relative LEA up to its displacement.
    pub(crate) fn rip_prefix(&mut self, dst: Reg) {
        self.rex(true, dst.number(), 0);
        self.buf.emit_u8(0x8D);
        self.modrm(0, dst.code(), 0b101);
    }

    /// dst = src + imm, as a single ADD, MOV or LEA.
    pub fn add_rri(&mut self, dst: Reg, src: Reg, imm: i64) -> JitResult<()> {
        let disp = i32::try_from(imm).map_err(|_| JitError::DisplacementOutOfRange(imm))?;
        if dst == src {
            self.add_ri(dst, disp);
        } else if disp == 0 {
            self.mov_rr(dst, src);
        } else {
            self.lea(dst, src, disp);
        }
        Ok(())
    }

    // ==================== Arithmetic ====================

    /// Group-1 ALU op with an immediate: /ext with imm8 or imm32, or the
    /// accumulator short form `acc` on RAX.
    fn alu_ri(&mut self, w: bool, ext: u8, acc: u8, dst: Reg, imm: i32) {
        self.rex(w, 0, dst.number());
        if fits_i8(imm as i64) {
            self.buf.emit_u8(0x83);
            self.modrm(3, ext, dst.code());
            self.buf.emit_u8(imm as i8 as u8);
        } else if dst == Reg::Rax {
            self.buf.emit_u8(acc);
            self.buf.emit_u32(imm as u32);
        } else {
            self.buf.emit_u8(0x81);
            self.modrm(3, ext, dst.code());
            self.buf.emit_u32(imm as u32);
        }
    }

    /// ADD dst, imm. Adding zero emits nothing.
    pub fn add_ri(&mut self, dst: Reg, imm: i32) {
        if imm != 0 {
            self.alu_ri(true, 0, 0x05, dst, imm);
        }
    }

    /// SUB dst, imm. Subtracting zero emits nothing.
    pub fn sub_ri(&mut self, dst: Reg, imm: i32) {
        if imm != 0 {
            self.alu_ri(true, 5, 0x2D, dst, imm);
        }
    }

    pub fn and_ri(&mut self, dst: Reg, imm: i32) {
        self.alu_ri(true, 4, 0x25, dst, imm);
    }

    /// CMP dst, imm (64-bit)
    pub fn cmp_ri(&mut self, dst: Reg, imm: i32) {
        self.alu_ri(true, 7, 0x3D, dst, imm);
    }

    /// CMP dst32, imm (32-bit)
    pub fn cmp_r32i(&mut self, dst: Reg, imm: i32) {
        self.alu_ri(false, 7, 0x3D, dst, imm);
    }

    /// ADD dword [base + disp], imm; ±1 become INC and DEC.
    pub fn add_mi32(&mut self, base: Reg, disp: i32, imm: i32) {
        match imm {
            0 => {}
            1 | -1 => {
                self.rex(false, 0, base.number());
                self.buf.emit_u8(0xFF);
                self.mem(if imm == 1 { 0 } else { 1 }, base, disp);
            }
            _ => {
                self.rex(false, 0, base.number());
                if fits_i8(imm as i64) {
                    self.buf.emit_u8(0x83);
                    self.mem(0, base, disp);
                    self.buf.emit_u8(imm as i8 as u8);
                } else {
                    self.buf.emit_u8(0x81);
                    self.mem(0, base, disp);
                    self.buf.emit_u32(imm as u32);
                }
            }
        }
    }

    /// CMP a, b (64-bit)
    pub fn cmp_rr(&mut self, a: Reg, b: Reg) {
        self.rex(true, b.number(), a.number());
        self.buf.emit_u8(0x39);
        self.modrm(3, b.code(), a.code());
    }

    /// TEST a, b (64-bit)
    pub fn test_rr(&mut self, a: Reg, b: Reg) {
        self.rex(true, b.number(), a.number());
        self.buf.emit_u8(0x85);
        self.modrm(3, b.code(), a.code());
    }

    /// XOR r32, r32: zeroes the full register.
    pub fn clear(&mut self, reg: Reg) {
        self.rex(false, reg.number(), reg.number());
        self.buf.emit_u8(0x31);
        self.modrm(3, reg.code(), reg.code());
    }

    /// SHL dst, imm (64-bit)
    pub fn shl_ri(&mut self, dst: Reg, imm: u8) {
        self.rex(true, 0, dst.number());
        self.buf.emit_u8(0xC1);
        self.modrm(3, 4, dst.code());
        self.buf.emit_u8(imm);
    }

    // ==================== Stack ====================

    pub fn push(&mut self, reg: Reg) {
        self.rex(false, 0, reg.number());
        self.buf.emit_u8(0x50 + reg.code());
    }

    pub fn pop(&mut self, reg: Reg) {
        self.rex(false, 0, reg.number());
        self.buf.emit_u8(0x58 + reg.code());
    }

    // ==================== Control flow ====================

    pub fn jmp_rel8(&mut self, offset: i8) {
        self.buf.emit_u8(0xEB);
        self.buf.emit_u8(offset as u8);
    }

    pub fn jmp_rel32(&mut self, offset: i32) {
        self.buf.emit_u8(0xE9);
        self.buf.emit_u32(offset as u32);
    }

    pub fn jcc_rel8(&mut self, cond: Cond, offset: i8) {
        self.buf.emit_u8(0x70 + cond as u8);
        self.buf.emit_u8(offset as u8);
    }

    pub fn jcc_rel32(&mut self, cond: Cond, offset: i32) {
        self.buf.emit_bytes(&[0x0F, 0x80 + cond as u8]);
        self.buf.emit_u32(offset as u32);
    }

    /// CALL reg
    pub fn call_r(&mut self, reg: Reg) {
        self.rex(false, 0, reg.number());
        self.buf.emit_u8(0xFF);
        self.modrm(3, 2, reg.code());
    }

    /// JMP reg
    pub fn jmp_r(&mut self, reg: Reg) {
        self.rex(false, 0, reg.number());
        self.buf.emit_u8(0xFF);
        self.modrm(3, 4, reg.code());
    }

    pub fn ret(&mut self) {
        self.buf.emit_u8(0xC3);
    }

    /// Calls an absolute address through RAX.
    ///
    /// Addresses between 2^32 and 2^35 that are 8-aligned load as a 32-bit
    /// immediate shifted left by three, one byte shorter than MOVABS.
    pub fn call_abs(&mut self, target: usize) -> JitResult<()> {
        if !is_canonical(target) {
            return Err(JitError::CallTargetOutOfRange(target));
        }
        let addr = target as u64;
        if addr > u32::MAX as u64 && addr < 1 << 35 && addr & 0x7 == 0 {
            self.mov_ri(Reg::Rax, (addr >> 3) as i64);
            self.shl_ri(Reg::Rax, 3);
        } else {
            self.mov_ri(Reg::Rax, addr as i64);
        }
        self.call_r(Reg::Rax);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(f: impl FnOnce(&mut X86_64Assembler)) -> Vec<u8> {
        let mut buf = CodeBuffer::new();
        f(&mut X86_64Assembler::new(&mut buf));
        buf.into_code()
    }

    #[test]
    fn test_mov_rr() {
        // MOV RAX, RBX = 48 89 D8
        assert_eq!(encode(|a| a.mov_rr(Reg::Rax, Reg::Rbx)), [0x48, 0x89, 0xD8]);
        // MOV R15, RDI = 49 89 FF
        assert_eq!(encode(|a| a.mov_rr(Reg::R15, Reg::Rdi)), [0x49, 0x89, 0xFF]);
    }

    #[test]
    fn test_mov_ri_forms() {
        // MOV EAX, 1 = B8 01 00 00 00
        assert_eq!(encode(|a| a.mov_ri(Reg::Rax, 1)), [0xB8, 0x01, 0, 0, 0]);
        // MOV R10D, 0xFFFFFFFF = 41 BA FF FF FF FF
        assert_eq!(
            encode(|a| a.mov_ri(Reg::R10, 0xFFFF_FFFF)),
            [0x41, 0xBA, 0xFF, 0xFF, 0xFF, 0xFF]
        );
        // MOV RAX, -1 = 48 C7 C0 FF FF FF FF
        assert_eq!(
            encode(|a| a.mov_ri(Reg::Rax, -1)),
            [0x48, 0xC7, 0xC0, 0xFF, 0xFF, 0xFF, 0xFF]
        );
        // MOVABS RAX, imm64 = 48 B8 F0 DE BC 9A 78 56 34 12
        assert_eq!(
            encode(|a| a.mov_ri(Reg::Rax, 0x1234_5678_9ABC_DEF0)),
            [0x48, 0xB8, 0xF0, 0xDE, 0xBC, 0x9A, 0x78, 0x56, 0x34, 0x12]
        );
    }

    #[test]
    fn test_mem_operand_special_bases() {
        // MOV R13, [R15] = 4D 8B 2F
        assert_eq!(encode(|a| a.mov_rm(Reg::R13, Reg::R15, 0)), [0x4D, 0x8B, 0x2F]);
        // MOV RAX, [R13] needs disp8 0: 49 8B 45 00
        assert_eq!(encode(|a| a.mov_rm(Reg::Rax, Reg::R13, 0)), [0x49, 0x8B, 0x45, 0x00]);
        // MOV RAX, [RBP] = 48 8B 45 00
        assert_eq!(encode(|a| a.mov_rm(Reg::Rax, Reg::Rbp, 0)), [0x48, 0x8B, 0x45, 0x00]);
        // MOV RAX, [R12] needs SIB: 49 8B 04 24
        assert_eq!(encode(|a| a.mov_rm(Reg::Rax, Reg::R12, 0)), [0x49, 0x8B, 0x04, 0x24]);
        // MOV RAX, [RSP+8] = 48 8B 44 24 08
        assert_eq!(
            encode(|a| a.mov_rm(Reg::Rax, Reg::Rsp, 8)),
            [0x48, 0x8B, 0x44, 0x24, 0x08]
        );
        // MOV [R12], RAX = 49 89 04 24
        assert_eq!(encode(|a| a.mov_mr(Reg::R12, 0, Reg::Rax)), [0x49, 0x89, 0x04, 0x24]);
    }

    #[test]
    fn test_mem_operand_displacements() {
        // MOV RAX, [R13-16] = 49 8B 45 F0
        assert_eq!(encode(|a| a.mov_rm(Reg::Rax, Reg::R13, -16)), [0x49, 0x8B, 0x45, 0xF0]);
        // MOV RCX, [RAX+0x100] = 48 8B 88 00 01 00 00
        assert_eq!(
            encode(|a| a.mov_rm(Reg::Rcx, Reg::Rax, 0x100)),
            [0x48, 0x8B, 0x88, 0x00, 0x01, 0x00, 0x00]
        );
        // MOV EAX, [R13-16] = 41 8B 45 F0
        assert_eq!(encode(|a| a.mov_rm32(Reg::Rax, Reg::R13, -16)), [0x41, 0x8B, 0x45, 0xF0]);
        // MOVZX EDX, word [RDX+16] = 0F B7 52 10
        assert_eq!(encode(|a| a.movzx_rm16(Reg::Rdx, Reg::Rdx, 16)), [0x0F, 0xB7, 0x52, 0x10]);
    }

    #[test]
    fn test_store_immediates() {
        // MOV qword [R13], 8 = 49 C7 45 00 08 00 00 00
        assert_eq!(
            encode(|a| a.mov_mi(Reg::R13, 0, 8)),
            [0x49, 0xC7, 0x45, 0x00, 0x08, 0, 0, 0]
        );
        // MOV dword [R14+32], 0x20001 = 41 C7 46 20 01 00 02 00
        assert_eq!(
            encode(|a| a.mov_mi32(Reg::R14, 32, 0x0002_0001)),
            [0x41, 0xC7, 0x46, 0x20, 0x01, 0x00, 0x02, 0x00]
        );
    }

    #[test]
    fn test_alu_immediate_forms() {
        // ADD R13, 16 = 49 83 C5 10
        assert_eq!(encode(|a| a.add_ri(Reg::R13, 16)), [0x49, 0x83, 0xC5, 0x10]);
        // ADD RAX, 0x1000 uses the accumulator form: 48 05 00 10 00 00
        assert_eq!(
            encode(|a| a.add_ri(Reg::Rax, 0x1000)),
            [0x48, 0x05, 0x00, 0x10, 0x00, 0x00]
        );
        // ADD RCX, 0x1000 = 48 81 C1 00 10 00 00
        assert_eq!(
            encode(|a| a.add_ri(Reg::Rcx, 0x1000)),
            [0x48, 0x81, 0xC1, 0x00, 0x10, 0x00, 0x00]
        );
        assert!(encode(|a| a.add_ri(Reg::Rcx, 0)).is_empty());
        // SUB RAX, 0x200 = 48 2D 00 02 00 00
        assert_eq!(encode(|a| a.sub_ri(Reg::Rax, 0x200)), [0x48, 0x2D, 0x00, 0x02, 0, 0]);
        // AND RAX, 0x1F = 48 83 E0 1F
        assert_eq!(encode(|a| a.and_ri(Reg::Rax, 0x1F)), [0x48, 0x83, 0xE0, 0x1F]);
        // CMP RAX, 7 = 48 83 F8 07
        assert_eq!(encode(|a| a.cmp_ri(Reg::Rax, 7)), [0x48, 0x83, 0xF8, 0x07]);
        // CMP RAX, 1024 = 48 3D 00 04 00 00
        assert_eq!(encode(|a| a.cmp_ri(Reg::Rax, 1024)), [0x48, 0x3D, 0x00, 0x04, 0, 0]);
        // CMP EAX, 1024 = 3D 00 04 00 00
        assert_eq!(encode(|a| a.cmp_r32i(Reg::Rax, 1024)), [0x3D, 0x00, 0x04, 0, 0]);
    }

    #[test]
    fn test_memory_add_forms() {
        // INC dword [RAX] = FF 00
        assert_eq!(encode(|a| a.add_mi32(Reg::Rax, 0, 1)), [0xFF, 0x00]);
        // DEC dword [RAX] = FF 08
        assert_eq!(encode(|a| a.add_mi32(Reg::Rax, 0, -1)), [0xFF, 0x08]);
        // INC dword [R15+24] = 41 FF 47 18
        assert_eq!(encode(|a| a.add_mi32(Reg::R15, 24, 1)), [0x41, 0xFF, 0x47, 0x18]);
        // ADD dword [RAX], 5 = 83 00 05
        assert_eq!(encode(|a| a.add_mi32(Reg::Rax, 0, 5)), [0x83, 0x00, 0x05]);
        // ADD dword [RAX], 0x1000 = 81 00 00 10 00 00
        assert_eq!(
            encode(|a| a.add_mi32(Reg::Rax, 0, 0x1000)),
            [0x81, 0x00, 0x00, 0x10, 0x00, 0x00]
        );
        assert!(encode(|a| a.add_mi32(Reg::Rax, 0, 0)).is_empty());
    }

    #[test]
    fn test_add_rri_choices() {
        // same register: ADD R13, -16 = 49 83 C5 F0
        assert_eq!(
            encode(|a| a.add_rri(Reg::R13, Reg::R13, -16).unwrap()),
            [0x49, 0x83, 0xC5, 0xF0]
        );
        // zero: MOV RDI, R13 = 4C 89 EF
        assert_eq!(
            encode(|a| a.add_rri(Reg::Rdi, Reg::R13, 0).unwrap()),
            [0x4C, 0x89, 0xEF]
        );
        // LEA R10, [R13-16] = 4D 8D 55 F0
        assert_eq!(
            encode(|a| a.add_rri(Reg::R10, Reg::R13, -16).unwrap()),
            [0x4D, 0x8D, 0x55, 0xF0]
        );
        let mut buf = CodeBuffer::new();
        let mut asm = X86_64Assembler::new(&mut buf);
        assert!(matches!(
            asm.add_rri(Reg::Rax, Reg::Rcx, 1 << 40),
            Err(JitError::DisplacementOutOfRange(_))
        ));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_compare_and_test() {
        // TEST RAX, RAX = 48 85 C0
        assert_eq!(encode(|a| a.test_rr(Reg::Rax, Reg::Rax)), [0x48, 0x85, 0xC0]);
        // CMP RAX, R11 = 4C 39 D8
        assert_eq!(encode(|a| a.cmp_rr(Reg::Rax, Reg::R11)), [0x4C, 0x39, 0xD8]);
        // XOR EAX, EAX = 31 C0
        assert_eq!(encode(|a| a.clear(Reg::Rax)), [0x31, 0xC0]);
        // SHL RAX, 3 = 48 C1 E0 03
        assert_eq!(encode(|a| a.shl_ri(Reg::Rax, 3)), [0x48, 0xC1, 0xE0, 0x03]);
    }

    #[test]
    fn test_push_pop() {
        assert_eq!(encode(|a| a.push(Reg::Rbp)), [0x55]);
        assert_eq!(encode(|a| a.push(Reg::R15)), [0x41, 0x57]);
        assert_eq!(encode(|a| a.pop(Reg::Rbx)), [0x5B]);
        assert_eq!(encode(|a| a.pop(Reg::R12)), [0x41, 0x5C]);
    }

    #[test]
    fn test_jumps() {
        assert_eq!(encode(|a| a.jmp_rel8(-2)), [0xEB, 0xFE]);
        assert_eq!(encode(|a| a.jmp_rel32(0x100)), [0xE9, 0x00, 0x01, 0x00, 0x00]);
        assert_eq!(encode(|a| a.jcc_rel8(Cond::G, 4)), [0x7F, 0x04]);
        assert_eq!(
            encode(|a| a.jcc_rel32(Cond::Ne, -6)),
            [0x0F, 0x85, 0xFA, 0xFF, 0xFF, 0xFF]
        );
        // CALL RAX = FF D0, JMP RAX = FF E0
        assert_eq!(encode(|a| a.call_r(Reg::Rax)), [0xFF, 0xD0]);
        assert_eq!(encode(|a| a.jmp_r(Reg::Rax)), [0xFF, 0xE0]);
        assert_eq!(encode(|a| a.ret()), [0xC3]);
    }

    #[test]
    fn test_cond_invert() {
        assert_eq!(Cond::E.invert(), Cond::Ne);
        assert_eq!(Cond::Ne.invert(), Cond::E);
        assert_eq!(Cond::Le.invert(), Cond::G);
        assert_eq!(Cond::B.invert(), Cond::Ae);
        for c in Cond::ALL {
            assert_eq!(c.invert().invert(), c);
        }
    }

    #[test]
    fn test_call_abs_forms() {
        // low address: MOV EAX, imm32; CALL RAX
        assert_eq!(
            encode(|a| a.call_abs(0x0040_1000).unwrap()),
            [0xB8, 0x00, 0x10, 0x40, 0x00, 0xFF, 0xD0]
        );
        // 8-aligned below 2^35: MOV EAX, addr>>3; SHL RAX, 3; CALL RAX
        assert_eq!(
            encode(|a| a.call_abs(0x4_0000_0008).unwrap()),
            [0xB8, 0x01, 0x00, 0x00, 0x80, 0x48, 0xC1, 0xE0, 0x03, 0xFF, 0xD0]
        );
        // unaligned: MOVABS
        let code = encode(|a| a.call_abs(0x4_0000_0009).unwrap());
        assert_eq!(&code[..2], &[0x48, 0xB8]);
        assert_eq!(code.len(), 12);
        // typical user-space address: MOVABS
        assert_eq!(encode(|a| a.call_abs(0x7f12_3456_7890).unwrap()).len(), 12);
    }

    #[test]
    fn test_call_abs_rejects_non_canonical() {
        let mut buf = CodeBuffer::new();
        let mut asm = X86_64Assembler::new(&mut buf);
        assert!(matches!(
            asm.call_abs(0x0001_0000_0000_0000),
            Err(JitError::CallTargetOutOfRange(_))
        ));
        assert!(asm.call_abs(0xffff_8000_0000_0000).is_ok());
    }
}
