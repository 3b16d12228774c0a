//! AArch64 instruction encoding.
//!
//! Only the instructions the code generator needs are encoded here. Branches
//! to IR labels are recorded as fixups in the code buffer.

use super::codebuf::{CodeBuffer, FixupKind};
use super::object::RelocKind;

/// AArch64 general-purpose registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Reg {
    X0 = 0, X1 = 1, X2 = 2, X3 = 3,
    X4 = 4, X5 = 5, X6 = 6, X7 = 7,
    X8 = 8, X9 = 9, X10 = 10, X11 = 11,
    X16 = 16, X17 = 17,
    Fp = 29,  // Frame pointer
    Lr = 30,  // Link register
    Sp = 31,  // Stack pointer / Zero register (XZR in some contexts)
}

impl Reg {
    /// Alias for SP when used as zero register
    pub const XZR: Reg = Reg::Sp;

    /// Integer argument registers in AAPCS64 order.
    pub const ARGS: [Reg; 8] = [
        Reg::X0, Reg::X1, Reg::X2, Reg::X3,
        Reg::X4, Reg::X5, Reg::X6, Reg::X7,
    ];

    pub fn code(self) -> u8 {
        self as u8
    }
}

/// AArch64 condition codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Cond {
    Eq = 0b0000, // Equal
    Ne = 0b0001, // Not equal
    Ge = 0b1010, // Signed greater than or equal
    Lt = 0b1011, // Signed less than
    Gt = 0b1100, // Signed greater than
    Le = 0b1101, // Signed less than or equal
}

impl Cond {
    fn invert(self) -> u32 {
        (self as u32) ^ 1
    }
}

/// AArch64 assembler.
pub struct AArch64Assembler<'a> {
    buf: &'a mut CodeBuffer,
}

fn rrr(base: u32, rd: Reg, rn: Reg, rm: Reg) -> u32 {
    base | ((rm.code() as u32) << 16) | ((rn.code() as u32) << 5) | (rd.code() as u32)
}

impl<'a> AArch64Assembler<'a> {
    pub fn new(buf: &'a mut CodeBuffer) -> Self {
        Self { buf }
    }

    /// Emit a raw 32-bit instruction.
    pub fn emit_raw(&mut self, inst: u32) {
        self.buf.emit_u32(inst);
    }

    // ==================== Data Processing ====================

    /// ADD Xd, Xn, Xm
    pub fn add(&mut self, rd: Reg, rn: Reg, rm: Reg) {
        self.emit_raw(rrr(0x8B000000, rd, rn, rm));
    }

    /// ADD Xd, Xn, #imm12 (Xn/Xd may be SP)
    pub fn add_imm(&mut self, rd: Reg, rn: Reg, imm12: u16) {
        let inst = 0x91000000
            | (((imm12 as u32) & 0xFFF) << 10)
            | ((rn.code() as u32) << 5)
            | (rd.code() as u32);
        self.emit_raw(inst);
    }

    /// SUB Xd, Xn, Xm
    pub fn sub(&mut self, rd: Reg, rn: Reg, rm: Reg) {
        self.emit_raw(rrr(0xCB000000, rd, rn, rm));
    }

    /// SUB Xd, Xn, #imm12 (Xn/Xd may be SP)
    pub fn sub_imm(&mut self, rd: Reg, rn: Reg, imm12: u16) {
        let inst = 0xD1000000
            | (((imm12 as u32) & 0xFFF) << 10)
            | ((rn.code() as u32) << 5)
            | (rd.code() as u32);
        self.emit_raw(inst);
    }

    /// MUL Xd, Xn, Xm (MADD with XZR)
    pub fn mul(&mut self, rd: Reg, rn: Reg, rm: Reg) {
        self.emit_raw(rrr(0x9B007C00, rd, rn, rm));
    }

    /// MSUB Xd, Xn, Xm, Xa (Xd = Xa - Xn * Xm)
    pub fn msub(&mut self, rd: Reg, rn: Reg, rm: Reg, ra: Reg) {
        self.emit_raw(rrr(0x9B008000, rd, rn, rm) | ((ra.code() as u32) << 10));
    }

    /// SDIV Xd, Xn, Xm (division by zero yields zero)
    pub fn sdiv(&mut self, rd: Reg, rn: Reg, rm: Reg) {
        self.emit_raw(rrr(0x9AC00C00, rd, rn, rm));
    }

    /// AND Xd, Xn, Xm
    pub fn and(&mut self, rd: Reg, rn: Reg, rm: Reg) {
        self.emit_raw(rrr(0x8A000000, rd, rn, rm));
    }

    /// ORR Xd, Xn, Xm
    pub fn orr(&mut self, rd: Reg, rn: Reg, rm: Reg) {
        self.emit_raw(rrr(0xAA000000, rd, rn, rm));
    }

    /// EOR Xd, Xn, Xm
    pub fn eor(&mut self, rd: Reg, rn: Reg, rm: Reg) {
        self.emit_raw(rrr(0xCA000000, rd, rn, rm));
    }

    /// LSLV Xd, Xn, Xm (shift amount taken modulo 64)
    pub fn lslv(&mut self, rd: Reg, rn: Reg, rm: Reg) {
        self.emit_raw(rrr(0x9AC02000, rd, rn, rm));
    }

    /// ASRV Xd, Xn, Xm (shift amount taken modulo 64)
    pub fn asrv(&mut self, rd: Reg, rn: Reg, rm: Reg) {
        self.emit_raw(rrr(0x9AC02800, rd, rn, rm));
    }

    /// NEG Xd, Xm (SUB Xd, XZR, Xm)
    pub fn neg(&mut self, rd: Reg, rm: Reg) {
        self.sub(rd, Reg::XZR, rm);
    }

    /// MOVZ Xd, #imm16, LSL #(16 * hw)
    pub fn movz(&mut self, rd: Reg, imm16: u16, hw: u8) {
        let inst = 0xD2800000
            | (((hw & 0x3) as u32) << 21)
            | ((imm16 as u32) << 5)
            | (rd.code() as u32);
        self.emit_raw(inst);
    }

    /// MOVK Xd, #imm16, LSL #(16 * hw)
    pub fn movk(&mut self, rd: Reg, imm16: u16, hw: u8) {
        let inst = 0xF2800000
            | (((hw & 0x3) as u32) << 21)
            | ((imm16 as u32) << 5)
            | (rd.code() as u32);
        self.emit_raw(inst);
    }

    /// Materialize a full 64-bit constant (MOVZ + 3×MOVK).
    pub fn mov_imm64(&mut self, rd: Reg, imm: i64) {
        let value = imm as u64;
        self.movz(rd, value as u16, 0);
        for hw in 1..4u8 {
            self.movk(rd, (value >> (16 * hw as u64)) as u16, hw);
        }
    }

    /// Materialize the address of `symbol`; the four instructions are
    /// patched by the linker.
    pub fn mov_symbol(&mut self, rd: Reg, symbol: &str) {
        let at = self.buf.offset();
        self.movz(rd, 0, 0);
        for hw in 1..4u8 {
            self.movk(rd, 0, hw);
        }
        self.buf.add_relocation(at, RelocKind::Aarch64MovWide, symbol);
    }

    // ==================== Comparison ====================

    /// CMP Xn, Xm (SUBS XZR, Xn, Xm)
    pub fn cmp(&mut self, rn: Reg, rm: Reg) {
        self.emit_raw(rrr(0xEB000000, Reg::XZR, rn, rm));
    }

    /// CSET Xd, cond (CSINC Xd, XZR, XZR, invert(cond))
    pub fn cset(&mut self, rd: Reg, cond: Cond) {
        let inst = 0x9A800400
            | ((Reg::XZR.code() as u32) << 16)
            | (cond.invert() << 12)
            | ((Reg::XZR.code() as u32) << 5)
            | (rd.code() as u32);
        self.emit_raw(inst);
    }

    // ==================== Loads and Stores ====================

    /// LDR Xt, [Xn, #imm] (unsigned offset, multiple of 8)
    pub fn ldr(&mut self, rt: Reg, rn: Reg, imm: u16) {
        let scaled = (imm / 8) as u32;
        let inst = 0xF9400000
            | ((scaled & 0xFFF) << 10)
            | ((rn.code() as u32) << 5)
            | (rt.code() as u32);
        self.emit_raw(inst);
    }

    /// STR Xt, [Xn, #imm] (unsigned offset, multiple of 8)
    pub fn str(&mut self, rt: Reg, rn: Reg, imm: u16) {
        let scaled = (imm / 8) as u32;
        let inst = 0xF9000000
            | ((scaled & 0xFFF) << 10)
            | ((rn.code() as u32) << 5)
            | (rt.code() as u32);
        self.emit_raw(inst);
    }

    /// LDR Xt, [Xn], #imm9 (post-index)
    pub fn ldr_post(&mut self, rt: Reg, rn: Reg, imm9: i16) {
        let inst = 0xF8400400
            | (((imm9 as u32) & 0x1FF) << 12)
            | ((rn.code() as u32) << 5)
            | (rt.code() as u32);
        self.emit_raw(inst);
    }

    /// STR Xt, [Xn, #imm9]! (pre-index)
    pub fn str_pre(&mut self, rt: Reg, rn: Reg, imm9: i16) {
        let inst = 0xF8000C00
            | (((imm9 as u32) & 0x1FF) << 12)
            | ((rn.code() as u32) << 5)
            | (rt.code() as u32);
        self.emit_raw(inst);
    }

    /// STP Xt1, Xt2, [SP, #imm]! (pre-index)
    pub fn stp_pre(&mut self, rt1: Reg, rt2: Reg, imm: i16) {
        let scaled = ((imm / 8) as u32) & 0x7F;
        let inst = 0xA9800000
            | (scaled << 15)
            | ((rt2.code() as u32) << 10)
            | ((Reg::Sp.code() as u32) << 5)
            | (rt1.code() as u32);
        self.emit_raw(inst);
    }

    /// LDP Xt1, Xt2, [SP], #imm (post-index)
    pub fn ldp_post(&mut self, rt1: Reg, rt2: Reg, imm: i16) {
        let scaled = ((imm / 8) as u32) & 0x7F;
        let inst = 0xA8C00000
            | (scaled << 15)
            | ((rt2.code() as u32) << 10)
            | ((Reg::Sp.code() as u32) << 5)
            | (rt1.code() as u32);
        self.emit_raw(inst);
    }

    // ==================== Branches ====================

    /// B to an IR label.
    pub fn b_label(&mut self, label: u32) {
        let at = self.buf.offset();
        self.emit_raw(0x14000000);
        self.buf.add_fixup(at, label, FixupKind::AArch64Branch26);
    }

    /// CBZ Xn to an IR label.
    pub fn cbz_label(&mut self, rn: Reg, label: u32) {
        let at = self.buf.offset();
        self.emit_raw(0xB4000000 | (rn.code() as u32));
        self.buf.add_fixup(at, label, FixupKind::AArch64Branch19);
    }

    /// CBNZ Xn to an IR label.
    pub fn cbnz_label(&mut self, rn: Reg, label: u32) {
        let at = self.buf.offset();
        self.emit_raw(0xB5000000 | (rn.code() as u32));
        self.buf.add_fixup(at, label, FixupKind::AArch64Branch19);
    }

    /// BLR Xn
    pub fn blr(&mut self, rn: Reg) {
        self.emit_raw(0xD63F0000 | ((rn.code() as u32) << 5));
    }

    /// RET (X30)
    pub fn ret(&mut self) {
        self.emit_raw(0xD65F03C0);
    }
}
