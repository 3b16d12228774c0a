//! Execution session: the process-wide coordinator.
//!
//! The session owns the libraries, the symbol pool, the compile and link
//! layers and the worker pool. Submitting a module reserves its exported
//! names in the target library and queues it for a worker; the worker
//! compiles, links and publishes it, or records why it failed.
//!
//! A module's exported addresses are emitted into its library as soon as it
//! is placed in memory, before its own references are resolved. Relocations
//! of other modules may take those addresses, so modules that call each
//! other link without waiting on one another. A module that took emitted
//! addresses is published together with the modules it took them from, once
//! all of them are relocated; if one of them fails, so does the module.
//!
//! Lookups wait for reserved names to be published. If the owning module is
//! still queued, the waiter runs it on its own thread instead, so waits never
//! depend on a free worker.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};

use crossbeam::channel::{self, Sender};

use super::compile_layer::CompileLayer;
use super::library::{Library, Status, Ticket};
use super::link_layer::{LinkedObject, ObjectLinkingLayer};
use super::memory::MemoryManager;
use super::symbols::{MangleAndInterner, Symbol, SymbolName, SymbolStringPool};
use super::target::TargetDescription;
use super::workers::{WorkerPool, default_worker_count};
use crate::config::EngineConfig;
use crate::error::{CreationError, InvalidSymbolName, JitError, JitResult, LinkError, LookupError};
use crate::ir::Module;

/// A submitted module's bookkeeping, apart from its IR.
struct Task {
    ticket: Ticket,
    library: Library,
    names: Vec<SymbolName>,
    module: String,
    done: Option<Sender<JitResult<()>>>,
}

/// A module waiting for a worker.
struct Job {
    task: Task,
    module: Module,
}

/// Progress of a module between loading and publishing.
enum Stage {
    /// Placed in memory, resolving and relocating
    Emitted,
    /// Relocated, waiting on the modules whose addresses it took
    Linked {
        task: Task,
        object: LinkedObject,
        deps: HashSet<Ticket>,
    },
}

/// A linked module taken out of the stage table, with the reason it must
/// fail if it cannot be published.
struct Settled {
    task: Task,
    object: LinkedObject,
    failure: Option<String>,
}

enum Readiness {
    Ready,
    Waiting,
    Failed(String),
}

#[derive(Default)]
struct Emission {
    stages: HashMap<Ticket, Stage>,
    /// Failed modules, kept so that modules holding their addresses fail
    failed: HashMap<Ticket, String>,
}

impl Emission {
    /// Modules that are neither staged nor failed have been published.
    fn readiness(&self, root: Ticket) -> Readiness {
        let mut seen = HashSet::new();
        let mut stack = vec![root];
        let mut waiting = false;
        while let Some(ticket) = stack.pop() {
            if !seen.insert(ticket) {
                continue;
            }
            if let Some(reason) = self.failed.get(&ticket) {
                return Readiness::Failed(reason.clone());
            }
            match self.stages.get(&ticket) {
                Some(Stage::Emitted) => waiting = true,
                Some(Stage::Linked { deps, .. }) => stack.extend(deps.iter().copied()),
                None => {}
            }
        }
        if waiting { Readiness::Waiting } else { Readiness::Ready }
    }

    /// Take every linked module that can now be published or has to fail.
    fn settle(&mut self) -> Vec<Settled> {
        let mut settled = Vec::new();
        loop {
            let decided: Vec<(Ticket, Option<String>)> = self
                .stages
                .iter()
                .filter(|(_, stage)| matches!(stage, Stage::Linked { .. }))
                .filter_map(|(&ticket, _)| match self.readiness(ticket) {
                    Readiness::Ready => Some((ticket, None)),
                    Readiness::Failed(reason) => Some((ticket, Some(reason))),
                    Readiness::Waiting => None,
                })
                .collect();
            if decided.is_empty() {
                return settled;
            }

            for (ticket, failure) in decided {
                if let Some(Stage::Linked { task, object, .. }) = self.stages.remove(&ticket) {
                    if let Some(reason) = &failure {
                        self.failed.insert(ticket, reason.clone());
                    }
                    settled.push(Settled {
                        task,
                        object,
                        failure,
                    });
                }
            }
        }
    }
}

/// Why a name could not be resolved, before it is mapped to the caller's
/// error type.
#[derive(Debug)]
enum ResolveError {
    NotFound,
    Ended,
    Failed(String),
    Generator(LookupError),
}

impl ResolveError {
    fn into_lookup_error(self, name: &str) -> LookupError {
        match self {
            ResolveError::NotFound => LookupError::SymbolNotFound(name.to_string()),
            ResolveError::Ended => LookupError::SessionEnded,
            ResolveError::Failed(reason) => LookupError::MaterializationFailed {
                symbol: name.to_string(),
                reason,
            },
            ResolveError::Generator(err) => err,
        }
    }

    fn into_link_error(self, name: &str, module: &str) -> LinkError {
        match self {
            ResolveError::Ended => LinkError::SessionEnded,
            ResolveError::Failed(reason) => {
                tracing::warn!(symbol = name, module, reason = %reason, "dependency failed to materialize");
                LinkError::UnresolvedSymbol {
                    symbol: name.to_string(),
                    module: module.to_string(),
                }
            }
            ResolveError::NotFound | ResolveError::Generator(_) => LinkError::UnresolvedSymbol {
                symbol: name.to_string(),
                module: module.to_string(),
            },
        }
    }
}

struct SessionInner {
    target: Arc<TargetDescription>,
    mangler: MangleAndInterner,
    memory: Arc<MemoryManager>,
    compile: CompileLayer,
    link: ObjectLinkingLayer,
    libraries: RwLock<Vec<Library>>,
    queued: Mutex<HashMap<Ticket, Job>>,
    emission: Mutex<Emission>,
    next_ticket: AtomicU64,
    ended: AtomicBool,
    trace_jit: bool,
    workers: Mutex<Option<WorkerPool<Ticket>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl SessionInner {
    fn is_ended(&self) -> bool {
        self.ended.load(Ordering::Acquire)
    }

    fn find_library(&self, name: &str) -> Option<Library> {
        self.libraries
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .find(|lib| lib.name() == name)
            .cloned()
    }

    /// Worker entry point. The job may already have been taken by a waiter.
    fn run_queued(&self, ticket: Ticket) {
        let job = lock(&self.queued).remove(&ticket);
        if let Some(job) = job {
            self.run_job(job);
        }
    }

    fn run_job(&self, job: Job) {
        let Job { task, module } = job;
        match self.materialize(&task, module) {
            Ok((object, deps)) => {
                let settled = {
                    let mut emission = lock(&self.emission);
                    emission
                        .stages
                        .insert(task.ticket, Stage::Linked { task, object, deps });
                    emission.settle()
                };
                self.finish(settled);
            }
            Err(err) => self.fail(task, err),
        }
    }

    /// Compile, load and relocate a module. Returns the linked object and
    /// the in-flight modules whose emitted addresses it took.
    fn materialize(&self, task: &Task, module: Module) -> JitResult<(LinkedObject, HashSet<Ticket>)> {
        if self.is_ended() {
            return Err(JitError::SessionEnded);
        }
        let object = self.compile.compile(module)?;

        lock(&self.emission).stages.insert(task.ticket, Stage::Emitted);
        let loaded = self.link.load(object, &task.library, task.ticket)?;
        tracing::debug!(ticket = task.ticket, module = %task.module, symbols = loaded.symbols().len(), "emitted module");

        let search = self.link_search_order(&task.library);
        let mut deps = HashSet::new();
        let linked = self.link.relocate(loaded, &task.library, |name| {
            let interned = self.mangler.intern_mangled(name);
            let (symbol, owner) = self
                .resolve(&search, &interned, true)
                .map_err(|e| e.into_link_error(name, &task.module))?;
            deps.extend(owner);
            Ok(symbol.address)
        })?;
        Ok((linked, deps))
    }

    /// Publish settled modules, failing those whose dependencies failed.
    fn finish(&self, mut settled: Vec<Settled>) {
        while let Some(Settled {
            task,
            object,
            failure,
        }) = settled.pop()
        {
            let result = match failure {
                None => self.link.publish(object, &task.library, task.ticket),
                Some(reason) => {
                    self.link.discard(object);
                    Err(LinkError::DependencyFailed {
                        module: task.module.clone(),
                        reason,
                    })
                }
            };

            match result {
                Ok(symbols) => {
                    if self.trace_jit {
                        for symbol in &symbols {
                            tracing::info!(
                                symbol = %symbol.name,
                                address = format_args!("{:#x}", symbol.address),
                                library = task.library.name(),
                                module = %task.module,
                                "published symbol"
                            );
                        }
                    }
                    if let Some(done) = task.done {
                        // The submitter may have stopped waiting
                        let _ = done.send(Ok(()));
                    }
                }
                Err(err) => {
                    let err = JitError::from(err);
                    settled.extend(self.record_failure(task.ticket, &err));
                    self.reject(task, err);
                }
            }
        }
    }

    fn fail(&self, task: Task, err: JitError) {
        let settled = self.record_failure(task.ticket, &err);
        self.reject(task, err);
        self.finish(settled);
    }

    /// Mark a module failed so modules that took its addresses fail too.
    fn record_failure(&self, ticket: Ticket, err: &JitError) -> Vec<Settled> {
        let mut emission = lock(&self.emission);
        emission.stages.remove(&ticket);
        emission.failed.insert(ticket, err.to_string());
        emission.settle()
    }

    fn reject(&self, task: Task, err: JitError) {
        tracing::warn!(module = %task.module, library = task.library.name(), error = %err, "module failed");
        task.library.fail(task.ticket, &task.names, &err.to_string());
        if let Some(done) = task.done {
            let _ = done.send(Err(err));
        }
    }

    fn link_search_order(&self, library: &Library) -> Vec<Library> {
        library
            .link_order()
            .iter()
            .filter_map(|name| {
                if name == library.name() {
                    Some(library.clone())
                } else {
                    self.find_library(name)
                }
            })
            .collect()
    }

    /// Search `libraries` in order: JIT definitions first, then each
    /// library's generators.
    ///
    /// Lookups wait for in-flight definitions to be published. Relocations
    /// (`relocating`) also accept emitted addresses and report the module
    /// that emitted them.
    fn resolve(
        &self,
        libraries: &[Library],
        name: &SymbolName,
        relocating: bool,
    ) -> Result<(Symbol, Option<Ticket>), ResolveError> {
        if self.is_ended() {
            return Err(ResolveError::Ended);
        }

        for library in libraries {
            let mut status = library.status(name);
            loop {
                match status {
                    Status::Published(symbol) => return Ok((symbol, None)),
                    Status::Emitted(owner, symbol) if relocating => return Ok((symbol, Some(owner))),
                    Status::Ended => return Err(ResolveError::Ended),
                    Status::Failed(reason) => return Err(ResolveError::Failed(reason)),
                    Status::Pending(owner) | Status::Emitted(owner, _) => {
                        status = self.await_owner(library, name, owner, relocating)
                    }
                    Status::Absent => break,
                }
            }

            for generator in library.generators() {
                if let Some(symbol) = generator
                    .try_generate(library, name)
                    .map_err(ResolveError::Generator)?
                {
                    return Ok((symbol, None));
                }
            }
        }

        Err(ResolveError::NotFound)
    }

    /// Run the owning module inline if it is still queued, otherwise wait
    /// for it to make progress on `name`.
    fn await_owner(&self, library: &Library, name: &SymbolName, owner: Ticket, relocating: bool) -> Status {
        let queued = lock(&self.queued).remove(&owner);
        match queued {
            Some(job) => {
                tracing::debug!(ticket = owner, symbol = %name, "running queued module inline");
                self.run_job(job);
                library.status(name)
            }
            None => library.wait_for(name, owner, relocating),
        }
    }
}

/// Coordinates libraries, compilation and lookup. Ends itself on drop.
pub struct ExecutionSession {
    inner: Arc<SessionInner>,
}

impl ExecutionSession {
    pub fn new(target: TargetDescription, config: &EngineConfig) -> Result<Self, CreationError> {
        config.validate()?;

        let target = Arc::new(target);
        let pool = Arc::new(SymbolStringPool::new());
        let mangler = MangleAndInterner::new(pool, target.global_prefix());
        let memory = Arc::new(MemoryManager::new(config.memory_limit));

        let inner = Arc::new(SessionInner {
            compile: CompileLayer::new(Arc::clone(&target), mangler.clone(), config.max_stack),
            link: ObjectLinkingLayer::new(Arc::clone(&memory), mangler.clone()),
            target,
            mangler,
            memory,
            libraries: RwLock::new(Vec::new()),
            queued: Mutex::new(HashMap::new()),
            emission: Mutex::new(Emission::default()),
            next_ticket: AtomicU64::new(1),
            ended: AtomicBool::new(false),
            trace_jit: config.trace_jit,
            workers: Mutex::new(None),
        });

        let weak: Weak<SessionInner> = Arc::downgrade(&inner);
        let count = config.compile_workers.unwrap_or_else(default_worker_count);
        let workers = WorkerPool::start(count, move |ticket: Ticket| {
            if let Some(inner) = weak.upgrade() {
                inner.run_queued(ticket);
            }
        })
        .map_err(CreationError::Workers)?;
        *lock(&inner.workers) = Some(workers);

        tracing::debug!(triple = %inner.target.triple(), workers = count, "execution session started");
        Ok(Self { inner })
    }

    pub fn target(&self) -> &TargetDescription {
        &self.inner.target
    }

    pub fn mangler(&self) -> &MangleAndInterner {
        &self.inner.mangler
    }

    /// Mangle and intern a source-level name.
    pub fn intern(&self, name: &str) -> Result<SymbolName, InvalidSymbolName> {
        self.inner.mangler.intern(name)
    }

    pub fn create_library(&self, name: &str) -> JitResult<Library> {
        if self.is_ended() {
            return Err(JitError::SessionEnded);
        }
        let mut libraries = self
            .inner
            .libraries
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if libraries.iter().any(|lib| lib.name() == name) {
            return Err(JitError::LibraryExists(name.to_string()));
        }
        let library = Library::new(name);
        libraries.push(library.clone());
        Ok(library)
    }

    pub fn library(&self, name: &str) -> Option<Library> {
        self.inner.find_library(name)
    }

    pub fn libraries(&self) -> Vec<Library> {
        self.inner
            .libraries
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Queue `module` for compilation into `library`.
    ///
    /// Returns once the module's exported names are reserved. Duplicate
    /// definitions are rejected here; compile and link failures surface
    /// later through lookups of the module's names.
    pub fn add_module(&self, library: &Library, module: Module) -> JitResult<()> {
        self.submit(library, module, None)
    }

    /// Like `add_module`, but waits for the module to be linked and returns
    /// its compile or link error.
    pub fn add_module_blocking(&self, library: &Library, module: Module) -> JitResult<()> {
        let (done, outcome) = channel::bounded(1);
        self.submit(library, module, Some(done))?;
        outcome.recv().unwrap_or(Err(JitError::SessionEnded))
    }

    fn submit(&self, library: &Library, module: Module, done: Option<Sender<JitResult<()>>>) -> JitResult<()> {
        if self.is_ended() {
            return Err(JitError::SessionEnded);
        }

        let names = module
            .exported_names()
            .into_iter()
            .map(|name| self.inner.mangler.intern(name))
            .collect::<Result<Vec<_>, _>>()?;
        let ticket = self.inner.next_ticket.fetch_add(1, Ordering::Relaxed);
        library.reserve(ticket, &names)?;

        let module_name = module.name().to_string();
        lock(&self.inner.queued).insert(
            ticket,
            Job {
                task: Task {
                    ticket,
                    library: library.clone(),
                    names,
                    module: module_name.clone(),
                    done,
                },
                module,
            },
        );

        // `end` sets the flag before draining the queue, so a job inserted
        // after the drain is caught here.
        if self.is_ended() {
            lock(&self.inner.queued).remove(&ticket);
            return Err(JitError::SessionEnded);
        }

        let sent = match lock(&self.inner.workers).as_ref() {
            Some(workers) => workers.submit(ticket).is_ok(),
            None => false,
        };
        if !sent {
            if let Some(job) = lock(&self.inner.queued).remove(&ticket) {
                job.task
                    .library
                    .fail(ticket, &job.task.names, "execution session has ended");
            }
            return Err(JitError::SessionEnded);
        }

        tracing::debug!(module = %module_name, library = library.name(), ticket, "queued module");
        Ok(())
    }

    /// Look up a source-level name in `libraries`, in order.
    pub fn lookup(&self, libraries: &[Library], name: &str) -> Result<Symbol, LookupError> {
        let interned = self.intern(name)?;
        self.lookup_interned(libraries, &interned)
            .map_err(|e| e.into_lookup_error(name))
    }

    /// Look up a name already in linker form.
    pub fn lookup_mangled(&self, libraries: &[Library], name: &str) -> Result<Symbol, LookupError> {
        let interned = self.inner.mangler.intern_mangled(name);
        self.lookup_interned(libraries, &interned)
            .map_err(|e| e.into_lookup_error(name))
    }

    fn lookup_interned(&self, libraries: &[Library], name: &SymbolName) -> Result<Symbol, ResolveError> {
        self.inner.resolve(libraries, name, false).map(|(symbol, _)| symbol)
    }

    /// End the session: fail every waiter and queued module, stop the
    /// workers and release all JIT memory. Idempotent.
    pub fn end(&self) {
        if self.inner.ended.swap(true, Ordering::AcqRel) {
            return;
        }

        let libraries = self.libraries();
        for library in &libraries {
            library.end();
        }

        let drained: Vec<Job> = lock(&self.inner.queued).drain().map(|(_, job)| job).collect();
        for job in drained {
            if let Some(done) = job.task.done {
                let _ = done.send(Err(JitError::SessionEnded));
            }
        }

        let staged: Vec<Stage> = lock(&self.inner.emission)
            .stages
            .drain()
            .map(|(_, stage)| stage)
            .collect();
        for stage in staged {
            if let Stage::Linked { task, object, .. } = stage {
                self.inner.link.discard(object);
                if let Some(done) = task.done {
                    let _ = done.send(Err(JitError::SessionEnded));
                }
            }
        }

        let workers = lock(&self.inner.workers).take();
        if let Some(mut workers) = workers {
            workers.shutdown();
        }

        tracing::debug!(
            libraries = libraries.len(),
            live_bytes = self.inner.memory.live_bytes(),
            "execution session ended"
        );
    }

    pub fn is_ended(&self) -> bool {
        self.inner.is_ended()
    }

    /// Bytes of JIT section memory currently mapped.
    pub fn memory_in_use(&self) -> usize {
        self.inner.memory.live_bytes()
    }
}

impl Drop for ExecutionSession {
    fn drop(&mut self) {
        self.end();
    }
}

impl std::fmt::Debug for ExecutionSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionSession")
            .field("target", &self.inner.target.triple())
            .field("ended", &self.is_ended())
            .finish()
    }
}

#[cfg(all(test, unix, any(target_arch = "x86_64", target_arch = "aarch64")))]
mod tests {
    use super::*;
    use crate::ir::{Function, Inst};
    use std::thread;

    fn session(workers: usize) -> ExecutionSession {
        let config = EngineConfig {
            compile_workers: Some(workers),
            ..Default::default()
        };
        ExecutionSession::new(TargetDescription::detect_host().unwrap(), &config).unwrap()
    }

    fn constant(module: &str, name: &str, value: i64) -> Module {
        Module::new(module).with_function(Function::new(name, &[]).with_body(vec![Inst::Const(value), Inst::Ret]))
    }

    fn caller(module: &str, name: &str, callee: &str) -> Module {
        Module::new(module).with_function(Function::new(name, &[]).with_body(vec![
            Inst::Call {
                callee: callee.into(),
                argc: 0,
            },
            Inst::Const(1),
            Inst::Add,
            Inst::Ret,
        ]))
    }

    fn call(symbol: &Symbol) -> i64 {
        let f: extern "C" fn() -> i64 = unsafe { std::mem::transmute(symbol.address as usize) };
        f()
    }

    #[test]
    fn test_create_library() {
        let session = session(1);
        let main = session.create_library("main").unwrap();
        assert_eq!(session.library("main"), Some(main));
        assert!(matches!(session.create_library("main"), Err(JitError::LibraryExists(_))));
    }

    #[test]
    fn test_lookup_waits_for_in_flight_module() {
        let session = session(1);
        let main = session.create_library("main").unwrap();
        session.add_module(&main, constant("m", "seven", 7)).unwrap();

        let symbol = session.lookup(&[main.clone()], "seven").unwrap();
        assert_eq!(call(&symbol), 7);
        assert_eq!(session.lookup(&[main], "seven").unwrap(), symbol);
    }

    #[test]
    fn test_cross_module_call_waits_for_dependency() {
        let session = session(2);
        let main = session.create_library("main").unwrap();
        // The caller is submitted first and has to wait for its callee
        session.add_module(&main, caller("a", "eight", "seven")).unwrap();
        session.add_module(&main, constant("b", "seven", 7)).unwrap();

        let symbol = session.lookup(&[main], "eight").unwrap();
        assert_eq!(call(&symbol), 8);
    }

    /// `name(n)` returns `base` for zero, otherwise `other(n - 1)`.
    fn parity(module: &str, name: &str, other: &str, base: i64) -> Module {
        Module::new(module).with_function(Function::new(name, &["n"]).with_body(vec![
            Inst::Arg(0),
            Inst::BranchIfNonZero(0),
            Inst::Const(base),
            Inst::Ret,
            Inst::Label(0),
            Inst::Arg(0),
            Inst::Const(1),
            Inst::Sub,
            Inst::Call {
                callee: other.into(),
                argc: 1,
            },
            Inst::Ret,
        ]))
    }

    #[test]
    fn test_mutually_recursive_modules() {
        for workers in [1, 2] {
            let session = session(workers);
            let main = session.create_library("main").unwrap();
            session.add_module(&main, parity("even", "is_even", "is_odd", 1)).unwrap();
            session.add_module(&main, parity("odd", "is_odd", "is_even", 0)).unwrap();

            let is_even = session.lookup(&[main.clone()], "is_even").unwrap();
            let is_odd = session.lookup(&[main], "is_odd").unwrap();
            let is_even: extern "C" fn(i64) -> i64 = unsafe { std::mem::transmute(is_even.address as usize) };
            let is_odd: extern "C" fn(i64) -> i64 = unsafe { std::mem::transmute(is_odd.address as usize) };
            assert_eq!(is_even(10), 1);
            assert_eq!(is_even(7), 0);
            assert_eq!(is_odd(7), 1);
        }
    }

    #[test]
    fn test_failure_spreads_to_modules_holding_its_addresses() {
        let session = session(1);
        let main = session.create_library("main").unwrap();
        session.add_module(&main, caller("a", "f", "g")).unwrap();
        session.add_module(&main, caller("b", "g", "missing")).unwrap();

        assert!(matches!(
            session.lookup(&[main.clone()], "g"),
            Err(LookupError::MaterializationFailed { .. })
        ));
        assert!(matches!(
            session.lookup(&[main.clone()], "f"),
            Err(LookupError::MaterializationFailed { .. })
        ));
        assert_eq!(session.memory_in_use(), 0);

        // Both names can be defined again
        session.add_module_blocking(&main, constant("c", "g", 41)).unwrap();
        session.add_module_blocking(&main, caller("d", "f", "g")).unwrap();
        assert_eq!(call(&session.lookup(&[main], "f").unwrap()), 42);
    }

    #[test]
    fn test_link_order_reaches_other_library() {
        let session = session(1);
        let runtime = session.create_library("runtime").unwrap();
        let app = session.create_library("app").unwrap();
        app.set_link_order(vec!["app".into(), "runtime".into()]);

        session.add_module_blocking(&runtime, constant("rt", "seven", 7)).unwrap();
        session.add_module_blocking(&app, caller("app", "eight", "seven")).unwrap();

        // Not visible from `app` alone
        assert!(matches!(
            session.lookup(&[app.clone()], "seven"),
            Err(LookupError::SymbolNotFound(_))
        ));
        assert_eq!(call(&session.lookup(&[app], "eight").unwrap()), 8);
    }

    #[test]
    fn test_end_wakes_waiters() {
        let session = Arc::new(session(1));
        let main = session.create_library("main").unwrap();
        // A reservation whose module never runs
        let stuck = session.intern("stuck").unwrap();
        main.reserve(u64::MAX, &[stuck]).unwrap();

        let lookups: Vec<_> = (0..4)
            .map(|_| {
                let session = Arc::clone(&session);
                let main = main.clone();
                thread::spawn(move || session.lookup(&[main], "stuck"))
            })
            .collect();
        thread::sleep(std::time::Duration::from_millis(20));
        session.end();

        for lookup in lookups {
            assert_eq!(lookup.join().unwrap(), Err(LookupError::SessionEnded));
        }
        assert!(matches!(
            session.add_module(&main, constant("m", "x", 1)),
            Err(JitError::SessionEnded)
        ));
        assert_eq!(session.memory_in_use(), 0);
    }
}
