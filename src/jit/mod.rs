//! JIT compile, link and resolve engine.
//!
//! Layers, leaves first:
//! - `symbols`: name mangling and interning
//! - `memory`: mmap'd section memory with final protections
//! - `link_layer`: places objects in memory, relocates, publishes symbols
//! - `compile_layer`: IR module to relocatable object (`codegen_*`)
//! - `generator`: fallback resolution from the host process
//! - `session`: libraries, workers, submission and lookup
//! - `engine`: the facade tying them together for the host target

pub mod aarch64;
pub mod codebuf;
pub mod codegen_aarch64;
pub mod codegen_x86_64;
pub mod compile_layer;
pub mod engine;
pub mod generator;
pub mod library;
pub mod link_layer;
pub mod memory;
pub mod object;
pub mod session;
pub mod symbols;
pub mod target;
pub mod workers;
pub mod x86_64;

pub use engine::Engine;
pub use generator::{AbsoluteSymbolGenerator, DefinitionGenerator, ProcessSymbolGenerator};
pub use library::Library;
pub use session::ExecutionSession;
pub use symbols::{Symbol, SymbolFlags, SymbolName};
pub use target::TargetDescription;
