//! Engine facade: one host target, one session, one main library.

use std::sync::Arc;

use super::generator::{AbsoluteSymbolGenerator, DefinitionGenerator, ProcessSymbolGenerator};
use super::library::Library;
use super::session::ExecutionSession;
use super::symbols::Symbol;
use super::target::TargetDescription;
use crate::config::EngineConfig;
use crate::error::{CreationError, JitResult, LookupError};
use crate::ir::Module;

/// A JIT engine for the host process.
///
/// ```no_run
/// use orca::ir::{Function, Inst, Module};
/// use orca::jit::Engine;
///
/// let engine = Engine::create().unwrap();
/// let module = Module::new("demo").with_function(
///     Function::new("add", &["a", "b"]).with_body(vec![Inst::Arg(0), Inst::Arg(1), Inst::Add, Inst::Ret]),
/// );
/// engine.add_module(module).unwrap();
/// let add: extern "C" fn(i64, i64) -> i64 = unsafe { engine.get_function("add").unwrap() };
/// assert_eq!(add(2, 3), 5);
/// ```
#[derive(Debug)]
pub struct Engine {
    session: ExecutionSession,
    main: Library,
}

impl Engine {
    /// Create an engine with the default configuration.
    pub fn create() -> Result<Self, CreationError> {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Result<Self, CreationError> {
        let target = TargetDescription::detect_host()?;
        let prefix = target.global_prefix();
        let session = ExecutionSession::new(target, &config)?;

        let main = session
            .create_library(&config.main_library)
            .map_err(CreationError::Library)?;
        if config.process_symbols {
            let generator = ProcessSymbolGenerator::for_current_process(prefix)?;
            main.add_generator(Arc::new(generator));
        }

        tracing::debug!(
            triple = %session.target().triple(),
            library = main.name(),
            process_symbols = config.process_symbols,
            "engine created"
        );
        Ok(Self { session, main })
    }

    pub fn session(&self) -> &ExecutionSession {
        &self.session
    }

    pub fn target(&self) -> &TargetDescription {
        self.session.target()
    }

    pub fn main_library(&self) -> &Library {
        &self.main
    }

    /// Submit a module to the main library without waiting for it to compile.
    pub fn add_module(&self, module: Module) -> JitResult<()> {
        self.session.add_module(&self.main, module)
    }

    /// Submit a module and wait until it is linked.
    pub fn add_module_blocking(&self, module: Module) -> JitResult<()> {
        self.session.add_module_blocking(&self.main, module)
    }

    /// Resolve a source-level name in the main library.
    pub fn lookup_symbol(&self, name: &str) -> Result<Symbol, LookupError> {
        self.session.lookup(std::slice::from_ref(&self.main), name)
    }

    pub fn get_symbol_address(&self, name: &str) -> Result<u64, LookupError> {
        self.lookup_symbol(name).map(|symbol| symbol.address)
    }

    /// Resolve `name` and reinterpret its address as a function pointer.
    ///
    /// # Safety
    /// `F` must be an `extern "C"` function pointer type matching the
    /// symbol's real signature, and the engine must outlive every call.
    pub unsafe fn get_function<F: Copy>(&self, name: &str) -> Result<F, LookupError> {
        const { assert!(std::mem::size_of::<F>() == std::mem::size_of::<usize>()) };
        let address = self.get_symbol_address(name)? as usize;
        Ok(unsafe { std::mem::transmute_copy::<usize, F>(&address) })
    }

    /// Attach another fallback generator to the main library.
    pub fn add_generator(&self, generator: Arc<dyn DefinitionGenerator>) {
        self.main.add_generator(generator);
    }

    /// Make host-provided addresses resolvable by source-level name.
    pub fn define_absolute_symbols<'a, I>(&self, symbols: I) -> JitResult<()>
    where
        I: IntoIterator<Item = (&'a str, u64)>,
    {
        let generator = symbols
            .into_iter()
            .map(|(name, address)| -> JitResult<_> { Ok((self.session.intern(name)?, address)) })
            .collect::<JitResult<AbsoluteSymbolGenerator>>()?;
        self.add_generator(Arc::new(generator));
        Ok(())
    }

    /// End the session. Lookups and submissions fail afterwards.
    pub fn end(&self) {
        self.session.end();
    }
}
