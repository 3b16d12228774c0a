//! IR verifier.
//!
//! Checks performed per function:
//! - Control flow: labels are defined once and every branch target exists
//! - Operands: argument and local indices are in range
//! - Stack height consistency: every label is reached with one height
//! - Stack effect validation: no underflow, height bounded by `max_stack`
//! - Termination: the body ends in `ret` or `jump`, and `ret` leaves
//!   exactly one value
//!
//! Module-wide, definitions must have unique, valid names and calls to
//! functions of the same module must pass the declared argument count.

use std::collections::{HashMap, HashSet, VecDeque};

use super::{Function, Inst, Module};

/// Verification error types
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VerifyError {
    #[error("function has an empty body")]
    EmptyFunction,

    #[error("function does not end with `ret` or `jump`")]
    MissingTerminator,

    #[error("label {label} defined twice (pc={pc})")]
    DuplicateLabel { pc: usize, label: u32 },

    #[error("branch to undefined label {label} at pc={pc}")]
    UndefinedLabel { pc: usize, label: u32 },

    #[error("argument {index} out of range at pc={pc} (function has {count} parameters)")]
    ArgOutOfRange { pc: usize, index: u32, count: usize },

    #[error("local {index} out of range at pc={pc} (function has {count} locals)")]
    LocalOutOfRange { pc: usize, index: u32, count: usize },

    #[error("stack height mismatch at pc={pc}: expected {expected}, got {actual}")]
    StackHeightMismatch {
        pc: usize,
        expected: usize,
        actual: usize,
    },

    #[error("stack underflow at pc={pc}: requires {required} values, but only {actual} on stack")]
    StackUnderflow {
        pc: usize,
        required: usize,
        actual: usize,
    },

    #[error("stack overflow at pc={pc}: height {height} exceeds max_stack {max}")]
    StackOverflow { pc: usize, height: usize, max: usize },

    #[error("`ret` at pc={pc} with {height} values on the stack, expected 1")]
    ReturnHeight { pc: usize, height: usize },

    #[error("invalid symbol name {0:?}")]
    InvalidName(String),

    #[error("`{0}` is defined more than once")]
    DuplicateDefinition(String),

    #[error("global `{0}` has no words")]
    EmptyGlobal(String),

    #[error("call to `{callee}` at pc={pc} passes {argc} arguments, expected {expected}")]
    ArityMismatch {
        pc: usize,
        callee: String,
        argc: u32,
        expected: usize,
    },

    #[error("function `{name}`: {error}")]
    Function {
        name: String,
        error: Box<VerifyError>,
    },
}

/// Operand stack height before each instruction; `None` for unreachable
/// instructions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackHeights {
    heights: Vec<Option<usize>>,
    max: usize,
}

impl StackHeights {
    pub fn at(&self, pc: usize) -> Option<usize> {
        self.heights.get(pc).copied().flatten()
    }

    /// Largest height reached anywhere in the function.
    pub fn max(&self) -> usize {
        self.max
    }
}

/// IR verifier
pub struct Verifier {
    /// Maximum operand stack height (configurable, default 1024)
    pub max_stack: usize,
}

impl Default for Verifier {
    fn default() -> Self {
        Self { max_stack: 1024 }
    }
}

impl Verifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_stack(max_stack: usize) -> Self {
        Self { max_stack }
    }

    /// Verify a whole module, returning the stack heights of each function
    /// in definition order.
    pub fn verify_module(&self, module: &Module) -> Result<Vec<StackHeights>, VerifyError> {
        let mut seen = HashSet::new();
        let names = module
            .functions()
            .iter()
            .map(|f| f.name.as_str())
            .chain(module.globals().iter().map(|g| g.name.as_str()));
        for name in names {
            if name.is_empty() || name.contains('\0') {
                return Err(VerifyError::InvalidName(name.to_string()));
            }
            if !seen.insert(name) {
                return Err(VerifyError::DuplicateDefinition(name.to_string()));
            }
        }

        if let Some(global) = module.globals().iter().find(|g| g.words.is_empty()) {
            return Err(VerifyError::EmptyGlobal(global.name.clone()));
        }

        let arity: HashMap<&str, usize> = module
            .functions()
            .iter()
            .map(|f| (f.name.as_str(), f.params.len()))
            .collect();

        module
            .functions()
            .iter()
            .map(|func| {
                self.verify_calls(func, &arity)
                    .and_then(|()| self.verify_function(func))
                    .map_err(|error| VerifyError::Function {
                        name: func.name.clone(),
                        error: Box::new(error),
                    })
            })
            .collect()
    }

    fn verify_calls(&self, func: &Function, arity: &HashMap<&str, usize>) -> Result<(), VerifyError> {
        for (pc, inst) in func.body.iter().enumerate() {
            if let Some(name) = inst.referenced_symbol()
                && (name.is_empty() || name.contains('\0'))
            {
                return Err(VerifyError::InvalidName(name.to_string()));
            }
            if let Inst::Call { callee, argc } = inst
                && let Some(&expected) = arity.get(callee.as_str())
                && *argc as usize != expected
            {
                return Err(VerifyError::ArityMismatch {
                    pc,
                    callee: callee.clone(),
                    argc: *argc,
                    expected,
                });
            }
        }
        Ok(())
    }

    /// Verify a single function and compute its stack heights.
    pub fn verify_function(&self, func: &Function) -> Result<StackHeights, VerifyError> {
        let code = &func.body;
        let last = code.last().ok_or(VerifyError::EmptyFunction)?;
        if !last.is_terminator() {
            return Err(VerifyError::MissingTerminator);
        }

        let labels = self.collect_labels(func)?;

        // Abstract interpretation over instructions; each pc is queued once,
        // when its entry height first becomes known.
        let mut heights: Vec<Option<usize>> = vec![None; code.len()];
        let mut worklist = VecDeque::from([0usize]);
        heights[0] = Some(0);
        let mut max = 0;

        while let Some(pc) = worklist.pop_front() {
            let inst = &code[pc];
            let Some(height) = heights[pc] else {
                continue;
            };
            let (pops, pushes) = inst.stack_effect();

            if height < pops {
                return Err(VerifyError::StackUnderflow {
                    pc,
                    required: pops,
                    actual: height,
                });
            }
            if matches!(inst, Inst::Ret) && height != 1 {
                return Err(VerifyError::ReturnHeight { pc, height });
            }

            let next = height - pops + pushes;
            if next > self.max_stack {
                return Err(VerifyError::StackOverflow {
                    pc,
                    height: next,
                    max: self.max_stack,
                });
            }
            max = max.max(next);

            let mut successors = Vec::with_capacity(2);
            if !inst.is_terminator() {
                successors.push(pc + 1);
            }
            if let Some(label) = inst.branch_target() {
                successors.push(labels[&label]);
            }

            for succ in successors {
                match heights[succ] {
                    None => {
                        heights[succ] = Some(next);
                        worklist.push_back(succ);
                    }
                    Some(existing) if existing != next => {
                        return Err(VerifyError::StackHeightMismatch {
                            pc: succ,
                            expected: existing,
                            actual: next,
                        });
                    }
                    Some(_) => {}
                }
            }
        }

        Ok(StackHeights { heights, max })
    }

    /// Map labels to their pc and check operands that need no flow analysis.
    fn collect_labels(&self, func: &Function) -> Result<HashMap<u32, usize>, VerifyError> {
        let mut labels = HashMap::new();
        for (pc, inst) in func.body.iter().enumerate() {
            match inst {
                Inst::Label(label) => {
                    if labels.insert(*label, pc).is_some() {
                        return Err(VerifyError::DuplicateLabel { pc, label: *label });
                    }
                }
                Inst::Arg(index) if *index as usize >= func.params.len() => {
                    return Err(VerifyError::ArgOutOfRange {
                        pc,
                        index: *index,
                        count: func.params.len(),
                    });
                }
                Inst::LocalGet(index) | Inst::LocalSet(index)
                    if *index as usize >= func.locals.len() =>
                {
                    return Err(VerifyError::LocalOutOfRange {
                        pc,
                        index: *index,
                        count: func.locals.len(),
                    });
                }
                _ => {}
            }
        }

        for (pc, inst) in func.body.iter().enumerate() {
            if let Some(label) = inst.branch_target()
                && !labels.contains_key(&label)
            {
                return Err(VerifyError::UndefinedLabel { pc, label });
            }
        }
        Ok(labels)
    }
}
