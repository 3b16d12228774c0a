//! IR to AArch64 machine code.
//!
//! Each operand stack value takes a 16-byte slot so SP stays aligned.
//! Parameters and locals live below the frame pointer at
//! `fp - 8 * (i + 1)`. Calls and symbol references materialize a 64-bit
//! absolute address with MOVZ/MOVK, patched by the linker.

use super::aarch64::{AArch64Assembler, Cond, Reg};
use super::codebuf::CodeBuffer;
use super::symbols::MangleAndInterner;
use crate::ir::verify::StackHeights;
use crate::ir::{Function, Inst};

/// Largest frame `sub sp, sp, #imm12` can allocate.
pub const MAX_FRAME_BYTES: usize = 4080;

fn slot_offset(slot: usize) -> u16 {
    (8 * (slot + 1)) as u16
}

fn push(asm: &mut AArch64Assembler<'_>, reg: Reg) {
    asm.str_pre(reg, Reg::Sp, -16);
}

fn pop(asm: &mut AArch64Assembler<'_>, reg: Reg) {
    asm.ldr_post(reg, Reg::Sp, 16);
}

/// Emit one function at the current end of `buf`.
pub fn emit_function(
    buf: &mut CodeBuffer,
    func: &Function,
    heights: &StackHeights,
    mangler: &MangleAndInterner,
) -> Result<(), String> {
    let params = func.params.len();
    let slots = params + func.locals.len();
    let frame = (slots * 8).next_multiple_of(16);
    if frame > MAX_FRAME_BYTES {
        return Err(format!("frame of {} bytes is too large", frame));
    }

    {
        let mut asm = AArch64Assembler::new(buf);
        asm.stp_pre(Reg::Fp, Reg::Lr, -16);
        asm.add_imm(Reg::Fp, Reg::Sp, 0);
        if frame > 0 {
            asm.sub_imm(Reg::Sp, Reg::Sp, frame as u16);
        }
        for (i, reg) in Reg::ARGS.iter().take(params).enumerate() {
            asm.sub_imm(Reg::X9, Reg::Fp, slot_offset(i));
            asm.str(*reg, Reg::X9, 0);
        }
        for j in 0..func.locals.len() {
            asm.sub_imm(Reg::X9, Reg::Fp, slot_offset(params + j));
            asm.str(Reg::XZR, Reg::X9, 0);
        }
    }

    for (pc, inst) in func.body.iter().enumerate() {
        if let Inst::Label(label) = inst {
            buf.define_label(*label);
            continue;
        }
        if heights.at(pc).is_none() {
            // unreachable
            continue;
        }
        emit_inst(&mut AArch64Assembler::new(buf), inst, params, mangler);
    }

    buf.finish_function()
}

fn emit_inst(asm: &mut AArch64Assembler<'_>, inst: &Inst, params: usize, mangler: &MangleAndInterner) {
    match inst {
        Inst::Const(value) => {
            if (0..=0xFFFF).contains(value) {
                asm.movz(Reg::X0, *value as u16, 0);
            } else {
                asm.mov_imm64(Reg::X0, *value);
            }
            push(asm, Reg::X0);
        }
        Inst::Arg(index) => {
            asm.sub_imm(Reg::X9, Reg::Fp, slot_offset(*index as usize));
            asm.ldr(Reg::X0, Reg::X9, 0);
            push(asm, Reg::X0);
        }
        Inst::LocalGet(index) => {
            asm.sub_imm(Reg::X9, Reg::Fp, slot_offset(params + *index as usize));
            asm.ldr(Reg::X0, Reg::X9, 0);
            push(asm, Reg::X0);
        }
        Inst::LocalSet(index) => {
            pop(asm, Reg::X0);
            asm.sub_imm(Reg::X9, Reg::Fp, slot_offset(params + *index as usize));
            asm.str(Reg::X0, Reg::X9, 0);
        }
        Inst::Add
        | Inst::Sub
        | Inst::Mul
        | Inst::Div
        | Inst::Rem
        | Inst::And
        | Inst::Or
        | Inst::Xor
        | Inst::Shl
        | Inst::Shr => {
            pop(asm, Reg::X1);
            pop(asm, Reg::X0);
            match inst {
                Inst::Add => asm.add(Reg::X0, Reg::X0, Reg::X1),
                Inst::Sub => asm.sub(Reg::X0, Reg::X0, Reg::X1),
                Inst::Mul => asm.mul(Reg::X0, Reg::X0, Reg::X1),
                // SDIV yields 0 for a zero divisor and wraps i64::MIN / -1
                Inst::Div => asm.sdiv(Reg::X0, Reg::X0, Reg::X1),
                Inst::Rem => {
                    asm.sdiv(Reg::X2, Reg::X0, Reg::X1);
                    asm.msub(Reg::X0, Reg::X2, Reg::X1, Reg::X0);
                }
                Inst::And => asm.and(Reg::X0, Reg::X0, Reg::X1),
                Inst::Or => asm.orr(Reg::X0, Reg::X0, Reg::X1),
                Inst::Xor => asm.eor(Reg::X0, Reg::X0, Reg::X1),
                Inst::Shl => asm.lslv(Reg::X0, Reg::X0, Reg::X1),
                _ => asm.asrv(Reg::X0, Reg::X0, Reg::X1),
            }
            push(asm, Reg::X0);
        }
        Inst::Neg => {
            pop(asm, Reg::X0);
            asm.neg(Reg::X0, Reg::X0);
            push(asm, Reg::X0);
        }
        Inst::Eq | Inst::Ne | Inst::Lt | Inst::Le | Inst::Gt | Inst::Ge => {
            let cond = match inst {
                Inst::Eq => Cond::Eq,
                Inst::Ne => Cond::Ne,
                Inst::Lt => Cond::Lt,
                Inst::Le => Cond::Le,
                Inst::Gt => Cond::Gt,
                _ => Cond::Ge,
            };
            pop(asm, Reg::X1);
            pop(asm, Reg::X0);
            asm.cmp(Reg::X0, Reg::X1);
            asm.cset(Reg::X0, cond);
            push(asm, Reg::X0);
        }
        Inst::Dup => {
            asm.ldr(Reg::X0, Reg::Sp, 0);
            push(asm, Reg::X0);
        }
        Inst::Drop => asm.add_imm(Reg::Sp, Reg::Sp, 16),
        Inst::Jump(label) => asm.b_label(*label),
        Inst::BranchIfZero(label) => {
            pop(asm, Reg::X0);
            asm.cbz_label(Reg::X0, *label);
        }
        Inst::BranchIfNonZero(label) => {
            pop(asm, Reg::X0);
            asm.cbnz_label(Reg::X0, *label);
        }
        Inst::Call { callee, argc } => {
            for reg in Reg::ARGS.iter().take(*argc as usize).rev() {
                pop(asm, *reg);
            }
            asm.mov_symbol(Reg::X16, &mangler.mangle(callee));
            asm.blr(Reg::X16);
            push(asm, Reg::X0);
        }
        Inst::SymbolAddr(name) => {
            asm.mov_symbol(Reg::X0, &mangler.mangle(name));
            push(asm, Reg::X0);
        }
        Inst::Load => {
            pop(asm, Reg::X0);
            asm.ldr(Reg::X0, Reg::X0, 0);
            push(asm, Reg::X0);
        }
        Inst::Store => {
            pop(asm, Reg::X1);
            pop(asm, Reg::X0);
            asm.str(Reg::X1, Reg::X0, 0);
        }
        Inst::Ret => {
            pop(asm, Reg::X0);
            asm.add_imm(Reg::Sp, Reg::Fp, 0);
            asm.ldp_post(Reg::Fp, Reg::Lr, 16);
            asm.ret();
        }
        Inst::Label(_) => {}
    }
}
