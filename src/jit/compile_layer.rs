//! Compile layer: IR module to relocatable object.
//!
//! Compilation reads nothing but the immutable target description, so any
//! number of modules can be compiled concurrently on worker threads.

use std::sync::Arc;

use super::codebuf::CodeBuffer;
use super::codegen_aarch64::{self, MAX_FRAME_BYTES};
use super::codegen_x86_64;
use super::object::{ObjectBuffer, ObjectSymbol, SectionKind};
use super::symbols::MangleAndInterner;
use super::target::{Arch, TargetDescription};
use crate::error::CompileError;
use crate::ir::{Inst, Module, Verifier};

/// Function entry alignment.
const FUNCTION_ALIGN: usize = 16;

pub struct CompileLayer {
    target: Arc<TargetDescription>,
    mangler: MangleAndInterner,
    verifier: Verifier,
}

impl CompileLayer {
    pub fn new(target: Arc<TargetDescription>, mangler: MangleAndInterner, max_stack: usize) -> Self {
        Self {
            target,
            mangler,
            verifier: Verifier::with_max_stack(max_stack),
        }
    }

    pub fn target(&self) -> &TargetDescription {
        &self.target
    }

    /// Verify and compile a module, consuming it.
    pub fn compile(&self, module: Module) -> Result<ObjectBuffer, CompileError> {
        let name = module.name().to_string();
        let heights = self
            .verifier
            .verify_module(&module)
            .map_err(|e| CompileError::Verify {
                module: name.clone(),
                message: e.to_string(),
            })?;
        self.check_target_limits(&module)?;

        let mut object = ObjectBuffer::new(name.clone());
        let mut buf = CodeBuffer::with_capacity(256 * module.functions().len());
        let fill = match self.target.arch {
            Arch::X86_64 => 0xCC, // int3
            Arch::AArch64 => 0x00, // udf
        };

        for (func, heights) in module.functions().iter().zip(&heights) {
            buf.align(FUNCTION_ALIGN, fill);
            let start = buf.offset();
            let result = match self.target.arch {
                Arch::X86_64 => codegen_x86_64::emit_function(&mut buf, func, heights, &self.mangler),
                Arch::AArch64 => codegen_aarch64::emit_function(&mut buf, func, heights, &self.mangler),
            };
            result.map_err(|message| CompileError::Codegen {
                module: name.clone(),
                message: format!("function `{}`: {}", func.name, message),
            })?;
            object.symbols.push(ObjectSymbol {
                name: self.mangler.mangle(&func.name),
                section: SectionKind::Text,
                offset: start,
                size: buf.offset() - start,
                exported: func.is_exported(),
            });
        }

        for global in module.globals() {
            let (section, bytes) = if global.mutable {
                (SectionKind::Data, &mut object.data)
            } else {
                (SectionKind::ReadOnlyData, &mut object.rodata)
            };
            let offset = bytes.len();
            for word in &global.words {
                bytes.extend_from_slice(&word.to_le_bytes());
            }
            object.symbols.push(ObjectSymbol {
                name: self.mangler.mangle(&global.name),
                section,
                offset,
                size: global.words.len() * 8,
                exported: global.is_exported(),
            });
        }

        let (text, relocations) = buf.into_parts();
        object.text = text;
        object.relocations = relocations;

        tracing::debug!(
            module = %name,
            text = object.text.len(),
            rodata = object.rodata.len(),
            data = object.data.len(),
            relocations = object.relocations.len(),
            "compiled module"
        );
        Ok(object)
    }

    /// Reject constructs the target's calling convention cannot express.
    fn check_target_limits(&self, module: &Module) -> Result<(), CompileError> {
        let max_args = self.target.max_register_args;
        let unsupported = |message: String| CompileError::Unsupported {
            module: module.name().to_string(),
            message,
        };

        for func in module.functions() {
            if func.params.len() > max_args {
                return Err(unsupported(format!(
                    "function `{}` takes {} parameters, at most {} supported",
                    func.name,
                    func.params.len(),
                    max_args
                )));
            }
            let frame = ((func.params.len() + func.locals.len()) * 8).next_multiple_of(16);
            if frame > MAX_FRAME_BYTES {
                return Err(unsupported(format!(
                    "function `{}` needs a {} byte frame, at most {} supported",
                    func.name, frame, MAX_FRAME_BYTES
                )));
            }
            for inst in &func.body {
                if let Inst::Call { callee, argc } = inst
                    && *argc as usize > max_args
                {
                    return Err(unsupported(format!(
                        "call to `{}` in `{}` passes {} arguments, at most {} supported",
                        callee, func.name, argc, max_args
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Function, Global};
    use crate::jit::symbols::SymbolStringPool;
    use crate::jit::target::Os;

    fn layer(arch: Arch, os: Os) -> CompileLayer {
        let target = TargetDescription::new(arch, os);
        let mangler = MangleAndInterner::new(Arc::new(SymbolStringPool::new()), target.global_prefix());
        CompileLayer::new(Arc::new(target), mangler, 1024)
    }

    fn add_module() -> Module {
        Module::new("arith")
            .with_function(
                Function::new("add", &["a", "b"])
                    .with_body(vec![Inst::Arg(0), Inst::Arg(1), Inst::Add, Inst::Ret]),
            )
            .with_function(
                Function::new("twice", &["x"]).internal().with_body(vec![
                    Inst::Arg(0),
                    Inst::Arg(0),
                    Inst::Call {
                        callee: "add".into(),
                        argc: 2,
                    },
                    Inst::Ret,
                ]),
            )
            .with_global(Global::new("limits", vec![1, 2]))
            .with_global(Global::new("counter", vec![0]).mutable())
    }

    #[test]
    fn test_compile_layout() {
        for arch in [Arch::X86_64, Arch::AArch64] {
            let object = layer(arch, Os::Linux).compile(add_module()).unwrap();
            let symbols = object.symbol_map();

            assert_eq!(symbols["add"].offset, 0);
            assert_eq!(symbols["twice"].offset % FUNCTION_ALIGN, 0);
            assert!(!symbols["twice"].exported);
            assert_eq!(symbols["limits"].section, SectionKind::ReadOnlyData);
            assert_eq!(symbols["counter"].section, SectionKind::Data);
            assert_eq!(object.rodata, [1i64.to_le_bytes(), 2i64.to_le_bytes()].concat());
            // The call to `add` resolves inside the object
            assert!(object.external_references().is_empty());
        }
    }

    #[test]
    fn test_mach_o_names_are_prefixed() {
        let object = layer(Arch::AArch64, Os::MacOs).compile(add_module()).unwrap();
        assert!(object.symbol_map().contains_key("_add"));
        assert!(object.relocations.iter().all(|r| r.target == "_add"));
    }

    #[test]
    fn test_verify_failure() {
        let module = Module::new("bad").with_function(Function::new("f", &[]).with_body(vec![Inst::Add, Inst::Ret]));
        let err = layer(Arch::X86_64, Os::Linux).compile(module).unwrap_err();
        assert!(matches!(err, CompileError::Verify { ref module, .. } if module == "bad"));
    }

    #[test]
    fn test_too_many_arguments() {
        let params = ["a", "b", "c", "d", "e", "f", "g"];
        let module = Module::new("wide")
            .with_function(Function::new("f", &params).with_body(vec![Inst::Const(0), Inst::Ret]));
        let err = layer(Arch::X86_64, Os::Linux).compile(module).unwrap_err();
        assert!(matches!(err, CompileError::Unsupported { .. }));

        // AArch64 passes eight arguments in registers
        let module = Module::new("wide")
            .with_function(Function::new("f", &params).with_body(vec![Inst::Const(0), Inst::Ret]));
        assert!(layer(Arch::AArch64, Os::Linux).compile(module).is_ok());
    }
}
