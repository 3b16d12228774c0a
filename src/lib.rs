//! Orca - a JIT compile, link and resolve engine
//!
//! This library compiles IR modules to native code for the host, links them
//! into the running process and resolves symbols against both JIT-compiled
//! code and the process itself. For C/C++ embedding, use the FFI module
//! functions.

pub mod config;
pub mod error;
pub mod ffi;
pub mod ir;
pub mod jit;

// Re-export commonly used types
pub use config::EngineConfig;
pub use error::{CompileError, CreationError, JitError, LinkError, LookupError};
pub use ir::{Function, Global, Inst, Module};
pub use jit::{Engine, Symbol};

// Re-export FFI types for C bindings
pub use ffi::*;
