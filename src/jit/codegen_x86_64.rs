//! IR to x86-64 machine code.
//!
//! The IR operand stack lives on the machine stack (one `push` per value).
//! Frame layout, System V AMD64:
//!
//! ```text
//! [rbp + 8]            return address
//! [rbp]                saved rbp
//! [rbp - 8 * (i + 1)]  parameter i, then locals
//! ...                  operand stack below the slots
//! ```
//!
//! Every call and symbol reference goes through a 64-bit absolute address
//! (`mov rax, imm64` + relocation), so code can be placed anywhere.

use super::codebuf::CodeBuffer;
use super::symbols::MangleAndInterner;
use super::x86_64::{Cond, Reg, X86_64Assembler};
use crate::ir::verify::StackHeights;
use crate::ir::{Function, Inst};

/// Fresh labels for branches the IR does not have.
struct LabelAllocator {
    next: u32,
}

impl LabelAllocator {
    fn after(func: &Function) -> Result<Self, String> {
        let max = func
            .body
            .iter()
            .filter_map(|inst| match inst {
                Inst::Label(l) => Some(*l),
                _ => None,
            })
            .max();
        let next = match max {
            Some(m) => m.checked_add(1).ok_or("label ids exhausted")?,
            None => 0,
        };
        Ok(Self { next })
    }

    fn fresh(&mut self) -> Result<u32, String> {
        let label = self.next;
        self.next = self.next.checked_add(1).ok_or("label ids exhausted")?;
        Ok(label)
    }
}

fn slot_offset(slot: usize) -> i32 {
    -8 * (slot as i32 + 1)
}

/// Emit one function at the current end of `buf`.
pub fn emit_function(
    buf: &mut CodeBuffer,
    func: &Function,
    heights: &StackHeights,
    mangler: &MangleAndInterner,
) -> Result<(), String> {
    let mut labels = LabelAllocator::after(func)?;
    let params = func.params.len();
    let slots = params + func.locals.len();
    let frame = (slots * 8).next_multiple_of(16);

    {
        let mut asm = X86_64Assembler::new(buf);
        asm.push(Reg::Rbp);
        asm.mov_rr(Reg::Rbp, Reg::Rsp);
        if frame > 0 {
            asm.sub_ri32(Reg::Rsp, frame as i32);
        }
        for (i, reg) in Reg::ARGS.iter().take(params).enumerate() {
            asm.mov_mr(Reg::Rbp, slot_offset(i), *reg);
        }
        if !func.locals.is_empty() {
            asm.xor_rr(Reg::Rax, Reg::Rax);
            for j in 0..func.locals.len() {
                asm.mov_mr(Reg::Rbp, slot_offset(params + j), Reg::Rax);
            }
        }
    }

    for (pc, inst) in func.body.iter().enumerate() {
        if let Inst::Label(label) = inst {
            buf.define_label(*label);
            continue;
        }
        let Some(height) = heights.at(pc) else {
            // unreachable
            continue;
        };
        emit_inst(buf, inst, height, params, &mut labels, mangler)?;
    }

    buf.finish_function()
}

fn emit_inst(
    buf: &mut CodeBuffer,
    inst: &Inst,
    height: usize,
    params: usize,
    labels: &mut LabelAllocator,
    mangler: &MangleAndInterner,
) -> Result<(), String> {
    match inst {
        Inst::Div | Inst::Rem => return emit_division(buf, matches!(inst, Inst::Rem), labels),
        Inst::Call { callee, argc } => {
            let argc = *argc as usize;
            let mut asm = X86_64Assembler::new(buf);
            for reg in Reg::ARGS.iter().take(argc).rev() {
                asm.pop(*reg);
            }
            // rsp is 16-aligned with an even number of values left
            let pad = (height - argc) % 2 == 1;
            if pad {
                asm.sub_ri32(Reg::Rsp, 8);
            }
            asm.mov_ri64_symbol(Reg::Rax, &mangler.mangle(callee));
            asm.call_r(Reg::Rax);
            if pad {
                asm.add_ri32(Reg::Rsp, 8);
            }
            asm.push(Reg::Rax);
            return Ok(());
        }
        _ => {}
    }

    let mut asm = X86_64Assembler::new(buf);
    match inst {
        Inst::Const(value) => {
            if let Ok(imm) = i32::try_from(*value) {
                asm.mov_ri32(Reg::Rax, imm);
            } else {
                asm.mov_ri64(Reg::Rax, *value);
            }
            asm.push(Reg::Rax);
        }
        Inst::Arg(index) => {
            asm.mov_rm(Reg::Rax, Reg::Rbp, slot_offset(*index as usize));
            asm.push(Reg::Rax);
        }
        Inst::LocalGet(index) => {
            asm.mov_rm(Reg::Rax, Reg::Rbp, slot_offset(params + *index as usize));
            asm.push(Reg::Rax);
        }
        Inst::LocalSet(index) => {
            asm.pop(Reg::Rax);
            asm.mov_mr(Reg::Rbp, slot_offset(params + *index as usize), Reg::Rax);
        }
        Inst::Add | Inst::Sub | Inst::Mul | Inst::And | Inst::Or | Inst::Xor | Inst::Shl | Inst::Shr => {
            asm.pop(Reg::Rcx);
            asm.pop(Reg::Rax);
            match inst {
                Inst::Add => asm.add_rr(Reg::Rax, Reg::Rcx),
                Inst::Sub => asm.sub_rr(Reg::Rax, Reg::Rcx),
                Inst::Mul => asm.imul_rr(Reg::Rax, Reg::Rcx),
                Inst::And => asm.and_rr(Reg::Rax, Reg::Rcx),
                Inst::Or => asm.or_rr(Reg::Rax, Reg::Rcx),
                Inst::Xor => asm.xor_rr(Reg::Rax, Reg::Rcx),
                // The CPU masks the count in CL to 6 bits
                Inst::Shl => asm.shl_cl(Reg::Rax),
                _ => asm.sar_cl(Reg::Rax),
            }
            asm.push(Reg::Rax);
        }
        Inst::Neg => {
            asm.pop(Reg::Rax);
            asm.neg(Reg::Rax);
            asm.push(Reg::Rax);
        }
        Inst::Eq | Inst::Ne | Inst::Lt | Inst::Le | Inst::Gt | Inst::Ge => {
            let cond = match inst {
                Inst::Eq => Cond::E,
                Inst::Ne => Cond::Ne,
                Inst::Lt => Cond::L,
                Inst::Le => Cond::Le,
                Inst::Gt => Cond::G,
                _ => Cond::Ge,
            };
            asm.pop(Reg::Rcx);
            asm.pop(Reg::Rax);
            asm.cmp_rr(Reg::Rax, Reg::Rcx);
            asm.setcc(cond, Reg::Rax);
            asm.movzx_r64_r8(Reg::Rax, Reg::Rax);
            asm.push(Reg::Rax);
        }
        Inst::Dup => {
            asm.mov_rm(Reg::Rax, Reg::Rsp, 0);
            asm.push(Reg::Rax);
        }
        Inst::Drop => asm.add_ri32(Reg::Rsp, 8),
        Inst::Jump(label) => asm.jmp_label(*label),
        Inst::BranchIfZero(label) | Inst::BranchIfNonZero(label) => {
            asm.pop(Reg::Rax);
            asm.test_rr(Reg::Rax, Reg::Rax);
            let cond = if matches!(inst, Inst::BranchIfZero(_)) { Cond::E } else { Cond::Ne };
            asm.jcc_label(cond, *label);
        }
        Inst::SymbolAddr(name) => {
            asm.mov_ri64_symbol(Reg::Rax, &mangler.mangle(name));
            asm.push(Reg::Rax);
        }
        Inst::Load => {
            asm.pop(Reg::Rax);
            asm.mov_rm(Reg::Rax, Reg::Rax, 0);
            asm.push(Reg::Rax);
        }
        Inst::Store => {
            asm.pop(Reg::Rcx);
            asm.pop(Reg::Rax);
            asm.mov_mr(Reg::Rax, 0, Reg::Rcx);
        }
        Inst::Ret => {
            asm.pop(Reg::Rax);
            asm.mov_rr(Reg::Rsp, Reg::Rbp);
            asm.pop(Reg::Rbp);
            asm.ret();
        }
        Inst::Label(_) | Inst::Div | Inst::Rem | Inst::Call { .. } => {}
    }
    Ok(())
}

/// Signed division without hardware traps: a zero divisor gives a quotient
/// of 0 and a remainder equal to the dividend, and `i64::MIN / -1` wraps.
fn emit_division(buf: &mut CodeBuffer, remainder: bool, labels: &mut LabelAllocator) -> Result<(), String> {
    let nonzero = labels.fresh()?;
    let normal = labels.fresh()?;
    let done = labels.fresh()?;

    let mut asm = X86_64Assembler::new(buf);
    asm.pop(Reg::Rcx);
    asm.pop(Reg::Rax);

    asm.test_rr(Reg::Rcx, Reg::Rcx);
    asm.jcc_label(Cond::Ne, nonzero);
    if !remainder {
        asm.xor_rr(Reg::Rax, Reg::Rax);
    }
    asm.jmp_label(done);

    buf.define_label(nonzero);
    let mut asm = X86_64Assembler::new(buf);
    asm.mov_ri32(Reg::Rdx, -1);
    asm.cmp_rr(Reg::Rcx, Reg::Rdx);
    asm.jcc_label(Cond::Ne, normal);
    if remainder {
        asm.xor_rr(Reg::Rax, Reg::Rax);
    } else {
        asm.neg(Reg::Rax);
    }
    asm.jmp_label(done);

    buf.define_label(normal);
    let mut asm = X86_64Assembler::new(buf);
    asm.cqo();
    asm.idiv(Reg::Rcx);
    if remainder {
        asm.mov_rr(Reg::Rax, Reg::Rdx);
    }

    buf.define_label(done);
    X86_64Assembler::new(buf).push(Reg::Rax);
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::ir::Verifier;
    use crate::jit::object::RelocKind;
    use crate::jit::symbols::SymbolStringPool;

    fn compile(func: &Function) -> (Vec<u8>, Vec<crate::jit::object::Relocation>) {
        let heights = Verifier::new().verify_function(func).unwrap();
        let mangler = MangleAndInterner::new(Arc::new(SymbolStringPool::new()), None);
        let mut buf = CodeBuffer::new();
        emit_function(&mut buf, func, &heights, &mangler).unwrap();
        buf.into_parts()
    }

    #[test]
    fn test_add_prologue_and_epilogue() {
        let func = Function::new("add", &["a", "b"])
            .with_body(vec![Inst::Arg(0), Inst::Arg(1), Inst::Add, Inst::Ret]);
        let (code, relocs) = compile(&func);

        // push rbp; mov rbp, rsp; sub rsp, 16
        assert_eq!(&code[..8], &[0x55, 0x48, 0x89, 0xE5, 0x48, 0x83, 0xEC, 0x10]);
        // ... pop rax; mov rsp, rbp; pop rbp; ret
        assert_eq!(&code[code.len() - 6..], &[0x58, 0x48, 0x89, 0xEC, 0x5D, 0xC3]);
        assert!(relocs.is_empty());
    }

    #[test]
    fn test_call_records_relocation() {
        let func = Function::new("f", &["x"]).with_body(vec![
            Inst::Arg(0),
            Inst::Call {
                callee: "labs".into(),
                argc: 1,
            },
            Inst::Ret,
        ]);
        let (code, relocs) = compile(&func);
        assert_eq!(relocs.len(), 1);
        assert_eq!(relocs[0].target, "labs");
        assert_eq!(relocs[0].kind, RelocKind::Abs64);
        // movabs rax, imm64 precedes the patched field
        assert_eq!(&code[relocs[0].offset - 2..relocs[0].offset], &[0x48, 0xB8]);
    }

    #[test]
    fn test_unreachable_code_is_skipped() {
        let reachable = Function::new("f", &[]).with_body(vec![Inst::Const(1), Inst::Ret]);
        let with_dead = Function::new("f", &[]).with_body(vec![
            Inst::Const(1),
            Inst::Ret,
            Inst::Const(2),
            Inst::Ret,
        ]);
        assert_eq!(compile(&reachable).0, compile(&with_dead).0);
    }

    #[test]
    fn test_branches_are_patched() {
        let func = Function::new("f", &["x"]).with_body(vec![
            Inst::Arg(0),
            Inst::BranchIfZero(0),
            Inst::Const(1),
            Inst::Ret,
            Inst::Label(0),
            Inst::Const(2),
            Inst::Arg(0),
            Inst::Div,
            Inst::Ret,
        ]);
        let (code, _) = compile(&func);
        assert!(!code.is_empty());
    }
}
