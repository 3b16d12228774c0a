//! Intermediate representation consumed by the engine.
//!
//! A `Module` is a compilation unit of functions and globals. Function
//! bodies are stack-machine instructions over 64-bit signed integers;
//! pointers are integers too. Modules are move-only: handing one to the
//! engine consumes it.

pub mod parser;
pub mod search;
pub mod verify;

use std::fmt;

pub use parser::{ParseError, parse_module};
pub use verify::{Verifier, VerifyError};

/// Symbol visibility outside the defining module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Linkage {
    /// Published into the target library
    Export,
    /// Only reachable through relocations inside the same module
    Internal,
}

/// Stack-machine instructions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inst {
    // Values
    Const(i64),
    Arg(u32),
    LocalGet(u32),
    LocalSet(u32),

    // Arithmetic: [a, b] -> [a op b]
    Add,
    Sub,
    Mul,
    /// Signed division; dividing by zero yields 0
    Div,
    /// Signed remainder; a remainder by zero yields the dividend
    Rem,
    And,
    Or,
    Xor,
    /// Shift count taken modulo 64
    Shl,
    /// Arithmetic shift, count taken modulo 64
    Shr,
    Neg,

    // Comparisons: [a, b] -> [0 or 1]
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,

    // Stack
    Dup,
    Drop,

    // Control flow
    Label(u32),
    Jump(u32),
    BranchIfZero(u32),
    BranchIfNonZero(u32),
    /// Pops `argc` arguments (first argument deepest), pushes the result
    Call { callee: String, argc: u32 },
    /// Pushes the address of a function or global
    SymbolAddr(String),

    // Memory
    /// [addr] -> [*addr]
    Load,
    /// [addr, value] -> []
    Store,

    Ret,
}

impl Inst {
    /// Values popped and pushed.
    pub fn stack_effect(&self) -> (usize, usize) {
        match self {
            Inst::Const(_) | Inst::Arg(_) | Inst::LocalGet(_) | Inst::SymbolAddr(_) => (0, 1),
            Inst::LocalSet(_) | Inst::Drop => (1, 0),
            Inst::Add
            | Inst::Sub
            | Inst::Mul
            | Inst::Div
            | Inst::Rem
            | Inst::And
            | Inst::Or
            | Inst::Xor
            | Inst::Shl
            | Inst::Shr
            | Inst::Eq
            | Inst::Ne
            | Inst::Lt
            | Inst::Le
            | Inst::Gt
            | Inst::Ge => (2, 1),
            Inst::Neg | Inst::Load => (1, 1),
            Inst::Dup => (1, 2),
            Inst::Label(_) | Inst::Jump(_) => (0, 0),
            Inst::BranchIfZero(_) | Inst::BranchIfNonZero(_) => (1, 0),
            Inst::Call { argc, .. } => (*argc as usize, 1),
            Inst::Store => (2, 0),
            Inst::Ret => (1, 0),
        }
    }

    /// Label this instruction may transfer control to.
    pub fn branch_target(&self) -> Option<u32> {
        match self {
            Inst::Jump(l) | Inst::BranchIfZero(l) | Inst::BranchIfNonZero(l) => Some(*l),
            _ => None,
        }
    }

    /// True if control never falls through to the next instruction.
    pub fn is_terminator(&self) -> bool {
        matches!(self, Inst::Jump(_) | Inst::Ret)
    }

    /// Symbol referenced by this instruction, if any.
    pub fn referenced_symbol(&self) -> Option<&str> {
        match self {
            Inst::Call { callee, .. } => Some(callee),
            Inst::SymbolAddr(name) => Some(name),
            _ => None,
        }
    }
}

impl fmt::Display for Inst {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Inst::Const(v) => write!(f, "const {}", v),
            Inst::Arg(i) => write!(f, "arg {}", i),
            Inst::LocalGet(i) => write!(f, "local.get {}", i),
            Inst::LocalSet(i) => write!(f, "local.set {}", i),
            Inst::Add => write!(f, "add"),
            Inst::Sub => write!(f, "sub"),
            Inst::Mul => write!(f, "mul"),
            Inst::Div => write!(f, "div"),
            Inst::Rem => write!(f, "rem"),
            Inst::And => write!(f, "and"),
            Inst::Or => write!(f, "or"),
            Inst::Xor => write!(f, "xor"),
            Inst::Shl => write!(f, "shl"),
            Inst::Shr => write!(f, "shr"),
            Inst::Neg => write!(f, "neg"),
            Inst::Eq => write!(f, "eq"),
            Inst::Ne => write!(f, "ne"),
            Inst::Lt => write!(f, "lt"),
            Inst::Le => write!(f, "le"),
            Inst::Gt => write!(f, "gt"),
            Inst::Ge => write!(f, "ge"),
            Inst::Dup => write!(f, "dup"),
            Inst::Drop => write!(f, "drop"),
            Inst::Label(l) => write!(f, "L{}:", l),
            Inst::Jump(l) => write!(f, "jump L{}", l),
            Inst::BranchIfZero(l) => write!(f, "br_zero L{}", l),
            Inst::BranchIfNonZero(l) => write!(f, "br_nonzero L{}", l),
            Inst::Call { callee, argc } => write!(f, "call {} {}", callee, argc),
            Inst::SymbolAddr(name) => write!(f, "addr {}", name),
            Inst::Load => write!(f, "load"),
            Inst::Store => write!(f, "store"),
            Inst::Ret => write!(f, "ret"),
        }
    }
}

/// A function following the host C calling convention:
/// `extern "C" fn(i64, ...) -> i64`.
#[derive(Debug, PartialEq, Eq)]
pub struct Function {
    pub name: String,
    pub params: Vec<String>,
    pub locals: Vec<String>,
    pub linkage: Linkage,
    pub body: Vec<Inst>,
}

impl Function {
    /// An exported function with the given parameter names and an empty body.
    pub fn new(name: impl Into<String>, params: &[&str]) -> Self {
        Self {
            name: name.into(),
            params: params.iter().map(|p| p.to_string()).collect(),
            locals: Vec::new(),
            linkage: Linkage::Export,
            body: Vec::new(),
        }
    }

    pub fn internal(mut self) -> Self {
        self.linkage = Linkage::Internal;
        self
    }

    pub fn with_locals(mut self, locals: &[&str]) -> Self {
        self.locals = locals.iter().map(|l| l.to_string()).collect();
        self
    }

    pub fn with_body(mut self, body: Vec<Inst>) -> Self {
        self.body = body;
        self
    }

    pub fn push(&mut self, inst: Inst) -> &mut Self {
        self.body.push(inst);
        self
    }

    pub fn is_exported(&self) -> bool {
        self.linkage == Linkage::Export
    }
}

/// A global array of 64-bit words.
#[derive(Debug, PartialEq, Eq)]
pub struct Global {
    pub name: String,
    pub linkage: Linkage,
    /// Mutable globals are placed in writable memory, others in read-only
    /// memory.
    pub mutable: bool,
    pub words: Vec<i64>,
}

impl Global {
    /// An exported, immutable global.
    pub fn new(name: impl Into<String>, words: Vec<i64>) -> Self {
        Self {
            name: name.into(),
            linkage: Linkage::Export,
            mutable: false,
            words,
        }
    }

    pub fn mutable(mut self) -> Self {
        self.mutable = true;
        self
    }

    pub fn internal(mut self) -> Self {
        self.linkage = Linkage::Internal;
        self
    }

    pub fn is_exported(&self) -> bool {
        self.linkage == Linkage::Export
    }
}

/// An IR compilation unit.
#[derive(Debug, PartialEq, Eq)]
pub struct Module {
    name: String,
    functions: Vec<Function>,
    globals: Vec<Global>,
}

impl Module {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            functions: Vec::new(),
            globals: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn add_function(&mut self, function: Function) -> &mut Self {
        self.functions.push(function);
        self
    }

    pub fn add_global(&mut self, global: Global) -> &mut Self {
        self.globals.push(global);
        self
    }

    pub fn with_function(mut self, function: Function) -> Self {
        self.functions.push(function);
        self
    }

    pub fn with_global(mut self, global: Global) -> Self {
        self.globals.push(global);
        self
    }

    pub fn functions(&self) -> &[Function] {
        &self.functions
    }

    pub fn globals(&self) -> &[Global] {
        &self.globals
    }

    pub fn function(&self, name: &str) -> Option<&Function> {
        self.functions.iter().find(|f| f.name == name)
    }

    /// Source-level names of exported definitions, functions first.
    pub fn exported_names(&self) -> Vec<&str> {
        self.functions
            .iter()
            .filter(|f| f.is_exported())
            .map(|f| f.name.as_str())
            .chain(
                self.globals
                    .iter()
                    .filter(|g| g.is_exported())
                    .map(|g| g.name.as_str()),
            )
            .collect()
    }

    /// Whether the module defines `name` (exported or internal).
    pub fn defines(&self, name: &str) -> bool {
        self.functions.iter().any(|f| f.name == name) || self.globals.iter().any(|g| g.name == name)
    }
}

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "module {}", self.name)?;
        for global in &self.globals {
            write!(f, "global ")?;
            if global.is_exported() {
                write!(f, "export ")?;
            }
            if global.mutable {
                write!(f, "mut ")?;
            }
            let words: Vec<String> = global.words.iter().map(|w| w.to_string()).collect();
            writeln!(f, "{} = {}", global.name, words.join(", "))?;
        }
        for func in &self.functions {
            if func.is_exported() {
                write!(f, "export ")?;
            }
            writeln!(f, "func {}({}) {{", func.name, func.params.join(", "))?;
            if !func.locals.is_empty() {
                writeln!(f, "    local {}", func.locals.join(" "))?;
            }
            for inst in &func.body {
                match inst {
                    Inst::Label(_) => writeln!(f, "{}", inst)?,
                    _ => writeln!(f, "    {}", inst)?,
                }
            }
            writeln!(f, "}}")?;
        }
        Ok(())
    }
}
