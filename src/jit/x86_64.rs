//! x86-64 instruction encoding.
//!
//! Only the instructions the code generator needs are encoded here. Uses
//! System V AMD64 ABI register conventions.

use super::codebuf::{CodeBuffer, FixupKind};
use super::object::RelocKind;

/// x86-64 general-purpose registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Reg {
    Rax = 0, // Return value
    Rcx = 1, // 4th argument
    Rdx = 2, // 3rd argument
    Rbx = 3,
    Rsp = 4,
    Rbp = 5,
    Rsi = 6, // 2nd argument
    Rdi = 7, // 1st argument
    R8 = 8,  // 5th argument
    R9 = 9,  // 6th argument
    R10 = 10,
    R11 = 11,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
}

impl Reg {
    /// Integer argument registers in System V order.
    pub const ARGS: [Reg; 6] = [Reg::Rdi, Reg::Rsi, Reg::Rdx, Reg::Rcx, Reg::R8, Reg::R9];

    /// Register code (lower 3 bits).
    pub fn code(self) -> u8 {
        (self as u8) & 0x7
    }

    pub fn needs_rex_ext(self) -> bool {
        (self as u8) >= 8
    }

    /// REX.B bit for this register (when used as base/rm).
    pub fn rex_b(self) -> u8 {
        if self.needs_rex_ext() { 0x01 } else { 0x00 }
    }

    /// REX.R bit for this register (when used as reg).
    pub fn rex_r(self) -> u8 {
        if self.needs_rex_ext() { 0x04 } else { 0x00 }
    }
}

/// x86-64 condition codes (for Jcc, SETcc).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Cond {
    E = 0x4,  // Equal
    Ne = 0x5, // Not equal
    L = 0xC,  // Less (signed <)
    Ge = 0xD, // Greater or equal (signed >=)
    Le = 0xE, // Less or equal (signed <=)
    G = 0xF,  // Greater (signed >)
}

/// x86-64 assembler.
pub struct X86_64Assembler<'a> {
    buf: &'a mut CodeBuffer,
}

impl<'a> X86_64Assembler<'a> {
    pub fn new(buf: &'a mut CodeBuffer) -> Self {
        Self { buf }
    }

    /// REX.W prefix for 64-bit operations.
    fn emit_rex_w(&mut self, reg: Reg, rm: Reg) {
        let rex = 0x48 | reg.rex_r() | rm.rex_b();
        self.buf.emit_u8(rex);
    }

    fn emit_rex_w_single(&mut self, rm: Reg) {
        let rex = 0x48 | rm.rex_b();
        self.buf.emit_u8(rex);
    }

    /// Encode ModR/M byte.
    fn modrm(mode: u8, reg: u8, rm: u8) -> u8 {
        ((mode & 0x3) << 6) | ((reg & 0x7) << 3) | (rm & 0x7)
    }

    /// ModR/M (+SIB, +displacement) for a `[base + disp]` operand.
    fn emit_mem_operand(&mut self, reg: Reg, base: Reg, disp: i32) {
        let needs_sib = base == Reg::Rsp || base == Reg::R12;
        let rm = if needs_sib { 0b100 } else { base.code() };
        // RBP/R13 cannot be encoded with mod=00
        let force_disp = base == Reg::Rbp || base == Reg::R13;

        if disp == 0 && !force_disp {
            self.buf.emit_u8(Self::modrm(0b00, reg.code(), rm));
            if needs_sib {
                self.buf.emit_u8(0x24);
            }
        } else if (-128..=127).contains(&disp) {
            self.buf.emit_u8(Self::modrm(0b01, reg.code(), rm));
            if needs_sib {
                self.buf.emit_u8(0x24);
            }
            self.buf.emit_u8(disp as u8);
        } else {
            self.buf.emit_u8(Self::modrm(0b10, reg.code(), rm));
            if needs_sib {
                self.buf.emit_u8(0x24);
            }
            self.buf.emit_u32(disp as u32);
        }
    }

    // ==================== Data Movement ====================

    /// MOV r64, r64
    pub fn mov_rr(&mut self, dst: Reg, src: Reg) {
        self.emit_rex_w(src, dst);
        self.buf.emit_u8(0x89); // MOV r/m64, r64
        self.buf.emit_u8(Self::modrm(0b11, src.code(), dst.code()));
    }

    /// MOV r64, imm64
    pub fn mov_ri64(&mut self, dst: Reg, imm: i64) {
        self.emit_rex_w_single(dst);
        self.buf.emit_u8(0xB8 + dst.code());
        self.buf.emit_u64(imm as u64);
    }

    /// MOV r64, imm64 whose immediate is the address of `symbol`.
    pub fn mov_ri64_symbol(&mut self, dst: Reg, symbol: &str) {
        self.emit_rex_w_single(dst);
        self.buf.emit_u8(0xB8 + dst.code());
        let field = self.buf.offset();
        self.buf.emit_u64(0);
        self.buf.add_relocation(field, RelocKind::Abs64, symbol);
    }

    /// MOV r64, imm32 (sign-extended)
    pub fn mov_ri32(&mut self, dst: Reg, imm: i32) {
        self.emit_rex_w_single(dst);
        self.buf.emit_u8(0xC7);
        self.buf.emit_u8(Self::modrm(0b11, 0, dst.code()));
        self.buf.emit_u32(imm as u32);
    }

    /// MOV r64, [base + disp]
    pub fn mov_rm(&mut self, dst: Reg, base: Reg, disp: i32) {
        self.emit_rex_w(dst, base);
        self.buf.emit_u8(0x8B);
        self.emit_mem_operand(dst, base, disp);
    }

    /// MOV [base + disp], r64
    pub fn mov_mr(&mut self, base: Reg, disp: i32, src: Reg) {
        self.emit_rex_w(src, base);
        self.buf.emit_u8(0x89);
        self.emit_mem_operand(src, base, disp);
    }

    // ==================== Arithmetic ====================

    /// ADD r64, r64
    pub fn add_rr(&mut self, dst: Reg, src: Reg) {
        self.emit_rex_w(src, dst);
        self.buf.emit_u8(0x01);
        self.buf.emit_u8(Self::modrm(0b11, src.code(), dst.code()));
    }

    /// ADD r64, imm32 (sign-extended)
    pub fn add_ri32(&mut self, dst: Reg, imm: i32) {
        self.emit_group1_imm(0, dst, imm);
    }

    /// SUB r64, r64
    pub fn sub_rr(&mut self, dst: Reg, src: Reg) {
        self.emit_rex_w(src, dst);
        self.buf.emit_u8(0x29);
        self.buf.emit_u8(Self::modrm(0b11, src.code(), dst.code()));
    }

    /// SUB r64, imm32 (sign-extended)
    pub fn sub_ri32(&mut self, dst: Reg, imm: i32) {
        self.emit_group1_imm(5, dst, imm);
    }

    /// Group-1 ALU op with immediate, picking the imm8 form when it fits.
    fn emit_group1_imm(&mut self, ext: u8, dst: Reg, imm: i32) {
        self.emit_rex_w_single(dst);
        if (-128..=127).contains(&imm) {
            self.buf.emit_u8(0x83);
            self.buf.emit_u8(Self::modrm(0b11, ext, dst.code()));
            self.buf.emit_u8(imm as u8);
        } else {
            self.buf.emit_u8(0x81);
            self.buf.emit_u8(Self::modrm(0b11, ext, dst.code()));
            self.buf.emit_u32(imm as u32);
        }
    }

    /// IMUL r64, r64
    pub fn imul_rr(&mut self, dst: Reg, src: Reg) {
        self.emit_rex_w(dst, src);
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(0xAF);
        self.buf.emit_u8(Self::modrm(0b11, dst.code(), src.code()));
    }

    /// IDIV r64 (RDX:RAX / r64, quotient in RAX, remainder in RDX)
    pub fn idiv(&mut self, src: Reg) {
        self.emit_rex_w_single(src);
        self.buf.emit_u8(0xF7);
        self.buf.emit_u8(Self::modrm(0b11, 7, src.code()));
    }

    /// CQO (sign-extend RAX into RDX:RAX)
    pub fn cqo(&mut self) {
        self.buf.emit_u8(0x48);
        self.buf.emit_u8(0x99);
    }

    /// AND r64, r64
    pub fn and_rr(&mut self, dst: Reg, src: Reg) {
        self.emit_rex_w(src, dst);
        self.buf.emit_u8(0x21);
        self.buf.emit_u8(Self::modrm(0b11, src.code(), dst.code()));
    }

    /// OR r64, r64
    pub fn or_rr(&mut self, dst: Reg, src: Reg) {
        self.emit_rex_w(src, dst);
        self.buf.emit_u8(0x09);
        self.buf.emit_u8(Self::modrm(0b11, src.code(), dst.code()));
    }

    /// XOR r64, r64
    pub fn xor_rr(&mut self, dst: Reg, src: Reg) {
        self.emit_rex_w(src, dst);
        self.buf.emit_u8(0x31);
        self.buf.emit_u8(Self::modrm(0b11, src.code(), dst.code()));
    }

    /// SHL r64, CL
    pub fn shl_cl(&mut self, dst: Reg) {
        self.emit_rex_w_single(dst);
        self.buf.emit_u8(0xD3);
        self.buf.emit_u8(Self::modrm(0b11, 4, dst.code()));
    }

    /// SAR r64, CL (arithmetic right shift)
    pub fn sar_cl(&mut self, dst: Reg) {
        self.emit_rex_w_single(dst);
        self.buf.emit_u8(0xD3);
        self.buf.emit_u8(Self::modrm(0b11, 7, dst.code()));
    }

    /// NEG r64
    pub fn neg(&mut self, dst: Reg) {
        self.emit_rex_w_single(dst);
        self.buf.emit_u8(0xF7);
        self.buf.emit_u8(Self::modrm(0b11, 3, dst.code()));
    }

    /// CMP r64, r64
    pub fn cmp_rr(&mut self, dst: Reg, src: Reg) {
        self.emit_rex_w(src, dst);
        self.buf.emit_u8(0x39);
        self.buf.emit_u8(Self::modrm(0b11, src.code(), dst.code()));
    }

    /// TEST r64, r64
    pub fn test_rr(&mut self, dst: Reg, src: Reg) {
        self.emit_rex_w(src, dst);
        self.buf.emit_u8(0x85);
        self.buf.emit_u8(Self::modrm(0b11, src.code(), dst.code()));
    }

    /// SETcc r8
    pub fn setcc(&mut self, cond: Cond, dst: Reg) {
        if dst.needs_rex_ext()
            || dst == Reg::Rsp
            || dst == Reg::Rbp
            || dst == Reg::Rsi
            || dst == Reg::Rdi
        {
            // SPL, BPL, SIL, DIL and R8B-R15B need a REX prefix
            self.buf.emit_u8(0x40 | dst.rex_b());
        }
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(0x90 + cond as u8);
        self.buf.emit_u8(Self::modrm(0b11, 0, dst.code()));
    }

    /// MOVZX r64, r8
    pub fn movzx_r64_r8(&mut self, dst: Reg, src: Reg) {
        self.emit_rex_w(dst, src);
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(0xB6);
        self.buf.emit_u8(Self::modrm(0b11, dst.code(), src.code()));
    }

    // ==================== Stack ====================

    /// PUSH r64
    pub fn push(&mut self, reg: Reg) {
        if reg.needs_rex_ext() {
            self.buf.emit_u8(0x41);
        }
        self.buf.emit_u8(0x50 + reg.code());
    }

    /// POP r64
    pub fn pop(&mut self, reg: Reg) {
        if reg.needs_rex_ext() {
            self.buf.emit_u8(0x41);
        }
        self.buf.emit_u8(0x58 + reg.code());
    }

    // ==================== Control Flow ====================

    /// JMP rel32 to an IR label.
    pub fn jmp_label(&mut self, label: u32) {
        self.buf.emit_u8(0xE9);
        let field = self.buf.offset();
        self.buf.emit_u32(0);
        self.buf.add_fixup(field, label, FixupKind::Rel32);
    }

    /// Jcc rel32 to an IR label.
    pub fn jcc_label(&mut self, cond: Cond, label: u32) {
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(0x80 + cond as u8);
        let field = self.buf.offset();
        self.buf.emit_u32(0);
        self.buf.add_fixup(field, label, FixupKind::Rel32);
    }

    /// CALL r64
    pub fn call_r(&mut self, reg: Reg) {
        if reg.needs_rex_ext() {
            self.buf.emit_u8(0x41);
        }
        self.buf.emit_u8(0xFF);
        self.buf.emit_u8(Self::modrm(0b11, 2, reg.code()));
    }

    /// RET
    pub fn ret(&mut self) {
        self.buf.emit_u8(0xC3);
    }
}
