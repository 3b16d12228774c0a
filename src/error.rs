//! Error types for the orca JIT engine.
//!
//! Each stage of the pipeline has its own error enum so callers can tell a
//! rejected module apart from a failed link or a missing symbol. `JitError`
//! wraps all of them at the submission boundary.

use crate::jit::memory::MemoryError;

/// A symbol name that cannot be interned.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid symbol name {0:?}")]
pub struct InvalidSymbolName(pub String);

/// Errors raised while constructing an engine.
#[derive(Debug, thiserror::Error)]
pub enum CreationError {
    /// The host architecture or operating system has no code generator.
    #[error("unsupported host target: {arch}-{os}")]
    UnsupportedHost { arch: String, os: String },

    /// No data layout is known for the detected target.
    #[error("data layout unavailable: {0}")]
    DataLayout(String),

    /// The running process could not be opened for symbol search.
    #[error("cannot search process symbols: {0}")]
    ProcessSymbols(String),

    /// The compile worker threads could not be spawned.
    #[error("failed to start compile workers: {0}")]
    Workers(std::io::Error),

    /// The main library could not be created.
    #[error("failed to create library: {0}")]
    Library(#[source] JitError),

    /// The engine configuration is unusable.
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
}

/// Errors raised while loading an engine configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("{0}")]
    Invalid(String),
}

/// Errors raised while turning an IR module into an object.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CompileError {
    /// The module is malformed.
    #[error("module `{module}`: {message}")]
    Verify { module: String, message: String },

    /// The module is well formed but uses something the target cannot express.
    #[error("module `{module}`: unsupported construct: {message}")]
    Unsupported { module: String, message: String },

    /// The code generator failed internally.
    #[error("module `{module}`: code generation failed: {message}")]
    Codegen { module: String, message: String },
}

/// Errors raised while placing an object in memory and publishing its symbols.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LinkError {
    #[error("memory allocation failed: {0}")]
    Allocation(MemoryError),

    #[error("relocation against `{symbol}` failed: {message}")]
    Relocation { symbol: String, message: String },

    #[error("unresolved symbol `{symbol}` referenced from module `{module}`")]
    UnresolvedSymbol { symbol: String, module: String },

    #[error("duplicate definition of `{symbol}` in library `{library}`")]
    DuplicateSymbol { symbol: String, library: String },

    /// A module whose addresses this one took failed before it was published.
    #[error("module `{module}` depends on a module that failed: {reason}")]
    DependencyFailed { module: String, reason: String },

    #[error("execution session has ended")]
    SessionEnded,
}

/// Errors raised by symbol lookup.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LookupError {
    #[error("symbol not found: {0}")]
    SymbolNotFound(String),

    #[error("execution session has ended")]
    SessionEnded,

    /// The module that would have defined the symbol failed to compile or link.
    #[error("failed to materialize `{symbol}`: {reason}")]
    MaterializationFailed { symbol: String, reason: String },

    #[error(transparent)]
    InvalidName(#[from] InvalidSymbolName),
}

/// Errors surfaced at the engine's submission boundary.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JitError {
    #[error(transparent)]
    Compile(#[from] CompileError),

    #[error(transparent)]
    Link(#[from] LinkError),

    #[error(transparent)]
    Lookup(#[from] LookupError),

    #[error(transparent)]
    InvalidName(#[from] InvalidSymbolName),

    #[error("library `{0}` already exists")]
    LibraryExists(String),

    #[error("execution session has ended")]
    SessionEnded,
}

impl JitError {
    /// True if this error reports a duplicate symbol definition.
    pub fn is_duplicate_symbol(&self) -> bool {
        matches!(self, JitError::Link(LinkError::DuplicateSymbol { .. }))
    }
}

pub type JitResult<T> = std::result::Result<T, JitError>;
