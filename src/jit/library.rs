//! Dynamic libraries: named resolution scopes.
//!
//! A library holds the symbols published by modules linked into it, the
//! names reserved by modules still in flight (with their addresses once the
//! module is placed in memory), the names whose module failed, and the memory
//! blocks backing its code. Waiters for a reserved name block on the
//! library's condition variable until the reservation is published, failed
//! or the session ends. Waiters that only need an address may also stop once
//! the name is emitted.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, RwLock};

use super::generator::DefinitionGenerator;
use super::memory::MemoryBlock;
use super::symbols::{Symbol, SymbolName};
use crate::error::LinkError;

/// Identifies one submitted module for its whole lifetime.
pub type Ticket = u64;

/// What a library currently knows about a name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Status {
    Published(Symbol),
    Pending(Ticket),
    /// Reserved by an in-flight module that already has an address for it
    Emitted(Ticket, Symbol),
    Failed(String),
    Absent,
    Ended,
}

#[derive(Default)]
struct LibraryState {
    symbols: HashMap<SymbolName, Symbol>,
    pending: HashMap<SymbolName, Ticket>,
    emitted: HashMap<SymbolName, Symbol>,
    failed: HashMap<SymbolName, String>,
    blocks: Vec<MemoryBlock>,
    ended: bool,
}

struct LibraryInner {
    name: String,
    state: Mutex<LibraryState>,
    cond: Condvar,
    link_lock: Mutex<()>,
    generators: RwLock<Vec<Arc<dyn DefinitionGenerator>>>,
    link_order: RwLock<Vec<String>>,
}

/// A named resolution scope. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Library {
    inner: Arc<LibraryInner>,
}

impl Library {
    pub(crate) fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            inner: Arc::new(LibraryInner {
                link_order: RwLock::new(vec![name.clone()]),
                name,
                state: Mutex::new(LibraryState::default()),
                cond: Condvar::new(),
                link_lock: Mutex::new(()),
                generators: RwLock::new(Vec::new()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    fn state(&self) -> MutexGuard<'_, LibraryState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Attach a fallback generator. Generators run in attachment order.
    pub fn add_generator(&self, generator: Arc<dyn DefinitionGenerator>) {
        self.inner
            .generators
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(generator);
    }

    pub(crate) fn generators(&self) -> Vec<Arc<dyn DefinitionGenerator>> {
        self.inner
            .generators
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Libraries searched, in order, when resolving relocations of objects
    /// linked into this one. Defaults to the library itself.
    pub fn set_link_order(&self, names: Vec<String>) {
        *self
            .inner
            .link_order
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = names;
    }

    pub fn link_order(&self) -> Vec<String> {
        self.inner
            .link_order
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Snapshot of the published symbols, sorted by name.
    pub fn symbols(&self) -> Vec<Symbol> {
        let mut symbols: Vec<Symbol> = self.state().symbols.values().cloned().collect();
        symbols.sort_by(|a, b| a.name.as_str().cmp(b.name.as_str()));
        symbols
    }

    /// True if `name` is published or reserved by an in-flight module.
    pub fn defines(&self, name: &SymbolName) -> bool {
        let state = self.state();
        state.symbols.contains_key(name) || state.pending.contains_key(name)
    }

    pub fn is_ended(&self) -> bool {
        self.state().ended
    }

    pub(crate) fn status(&self, name: &SymbolName) -> Status {
        Self::status_locked(&self.state(), name)
    }

    fn status_locked(state: &LibraryState, name: &SymbolName) -> Status {
        if state.ended {
            return Status::Ended;
        }
        if let Some(symbol) = state.symbols.get(name) {
            return Status::Published(symbol.clone());
        }
        if let Some(&ticket) = state.pending.get(name) {
            return match state.emitted.get(name) {
                Some(symbol) => Status::Emitted(ticket, symbol.clone()),
                None => Status::Pending(ticket),
            };
        }
        if let Some(reason) = state.failed.get(name) {
            return Status::Failed(reason.clone());
        }
        Status::Absent
    }

    /// Block until `name` is no longer reserved by `ticket`, then report its status.
    /// With `until_emitted`, also stop as soon as the name has an address.
    pub(crate) fn wait_for(&self, name: &SymbolName, ticket: Ticket, until_emitted: bool) -> Status {
        let mut state = self.state();
        while !state.ended
            && state.pending.get(name) == Some(&ticket)
            && !(until_emitted && state.emitted.contains_key(name))
        {
            state = self
                .inner
                .cond
                .wait(state)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
        Self::status_locked(&state, name)
    }

    /// Reserve names for an in-flight module.
    ///
    /// Fails without reserving anything if any name is already published or
    /// reserved.
    pub(crate) fn reserve(&self, ticket: Ticket, names: &[SymbolName]) -> Result<(), LinkError> {
        let mut state = self.state();
        if state.ended {
            return Err(LinkError::SessionEnded);
        }
        for name in names {
            if state.symbols.contains_key(name) || state.pending.contains_key(name) {
                return Err(LinkError::DuplicateSymbol {
                    symbol: name.to_string(),
                    library: self.inner.name.clone(),
                });
            }
        }
        for name in names {
            state.pending.insert(name.clone(), ticket);
        }
        Ok(())
    }

    /// Record the addresses of an in-flight module's exported symbols before
    /// its relocations are applied. Wakes waiters that only need addresses.
    pub(crate) fn emit(&self, ticket: Ticket, symbols: &[Symbol]) -> Result<(), LinkError> {
        let mut state = self.state();
        if state.ended {
            return Err(LinkError::SessionEnded);
        }
        for symbol in symbols {
            if state.pending.get(&symbol.name) == Some(&ticket) {
                state.emitted.insert(symbol.name.clone(), symbol.clone());
            }
        }
        drop(state);

        self.inner.cond.notify_all();
        Ok(())
    }

    /// Publish a linked module's symbols and take ownership of its memory.
    ///
    /// All-or-nothing: on error nothing is published and the block is
    /// dropped, releasing its memory.
    pub(crate) fn publish(
        &self,
        ticket: Ticket,
        symbols: Vec<Symbol>,
        block: Option<MemoryBlock>,
    ) -> Result<(), LinkError> {
        let mut state = self.state();
        if state.ended {
            return Err(LinkError::SessionEnded);
        }
        for symbol in &symbols {
            if state.symbols.contains_key(&symbol.name)
                || state.pending.get(&symbol.name).is_some_and(|&owner| owner != ticket)
            {
                return Err(LinkError::DuplicateSymbol {
                    symbol: symbol.name.to_string(),
                    library: self.inner.name.clone(),
                });
            }
        }

        let LibraryState { pending, emitted, .. } = &mut *state;
        emitted.retain(|name, _| pending.get(name) != Some(&ticket));
        pending.retain(|_, owner| *owner != ticket);
        for symbol in symbols {
            state.failed.remove(&symbol.name);
            state.symbols.insert(symbol.name.clone(), symbol);
        }
        state.blocks.extend(block);
        drop(state);

        self.inner.cond.notify_all();
        Ok(())
    }

    /// Release a failed module's reservations, recording why.
    pub(crate) fn fail(&self, ticket: Ticket, names: &[SymbolName], reason: &str) {
        let mut state = self.state();
        for name in names {
            if state.pending.get(name) == Some(&ticket) {
                state.pending.remove(name);
                state.emitted.remove(name);
                state.failed.insert(name.clone(), reason.to_string());
            }
        }
        drop(state);

        self.inner.cond.notify_all();
    }

    /// Take the exclusive link lock held across allocate, relocate and publish.
    pub(crate) fn lock_for_link(&self) -> MutexGuard<'_, ()> {
        self.inner
            .link_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Forget every symbol and release all memory. Wakes every waiter.
    pub(crate) fn end(&self) {
        let blocks = {
            let mut state = self.state();
            state.ended = true;
            state.symbols.clear();
            state.pending.clear();
            state.emitted.clear();
            state.failed.clear();
            std::mem::take(&mut state.blocks)
        };
        self.inner.cond.notify_all();

        let bytes: usize = blocks.iter().map(MemoryBlock::size).sum();
        drop(blocks);
        tracing::debug!(library = %self.inner.name, bytes, "released library memory");
    }
}

impl fmt::Debug for Library {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state();
        f.debug_struct("Library")
            .field("name", &self.inner.name)
            .field("symbols", &state.symbols.len())
            .field("pending", &state.pending.len())
            .field("ended", &state.ended)
            .finish()
    }
}

impl PartialEq for Library {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Library {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jit::memory::MemoryManager;
    use crate::jit::object::SectionSizes;
    use crate::jit::symbols::{SymbolFlags, SymbolStringPool};
    use std::thread;
    use std::time::Duration;

    fn block(memory: &MemoryManager) -> MemoryBlock {
        memory
            .allocate(SectionSizes {
                text: 16,
                ..Default::default()
            })
            .unwrap()
    }

    #[test]
    fn test_reserve_rejects_duplicates() {
        let pool = SymbolStringPool::new();
        let lib = Library::new("main");
        let f = pool.intern("f");
        let g = pool.intern("g");

        lib.reserve(1, &[f.clone()]).unwrap();
        let err = lib.reserve(2, &[g.clone(), f.clone()]).unwrap_err();
        assert!(matches!(err, LinkError::DuplicateSymbol { ref symbol, .. } if symbol == "f"));
        // Nothing from the rejected reservation sticks
        assert_eq!(lib.status(&g), Status::Absent);
        assert_eq!(lib.status(&f), Status::Pending(1));
    }

    #[test]
    fn test_publish_wakes_waiter() {
        let memory = MemoryManager::default();
        let pool = SymbolStringPool::new();
        let lib = Library::new("main");
        let f = pool.intern("f");
        lib.reserve(7, &[f.clone()]).unwrap();

        let waiter = {
            let lib = lib.clone();
            let f = f.clone();
            thread::spawn(move || lib.wait_for(&f, 7, false))
        };
        thread::sleep(Duration::from_millis(20));

        let symbol = Symbol::new(f.clone(), 0x1000, SymbolFlags::FUNCTION);
        lib.publish(7, vec![symbol.clone()], Some(block(&memory))).unwrap();
        assert_eq!(waiter.join().unwrap(), Status::Published(symbol));
        assert!(lib.defines(&f));
    }

    #[test]
    fn test_emitted_address_before_publish() {
        let pool = SymbolStringPool::new();
        let lib = Library::new("main");
        let f = pool.intern("f");
        lib.reserve(5, &[f.clone()]).unwrap();

        let waiter = {
            let lib = lib.clone();
            let f = f.clone();
            thread::spawn(move || lib.wait_for(&f, 5, true))
        };
        thread::sleep(Duration::from_millis(20));

        let symbol = Symbol::new(f.clone(), 0x2000, SymbolFlags::FUNCTION);
        lib.emit(5, &[symbol.clone()]).unwrap();
        assert_eq!(waiter.join().unwrap(), Status::Emitted(5, symbol.clone()));
        // Not visible as published until the module finishes
        assert!(lib.symbols().is_empty());

        lib.fail(5, &[f.clone()], "relocation failed");
        assert_eq!(lib.status(&f), Status::Failed("relocation failed".to_string()));
    }

    #[test]
    fn test_fail_records_reason() {
        let pool = SymbolStringPool::new();
        let lib = Library::new("main");
        let f = pool.intern("f");
        lib.reserve(3, &[f.clone()]).unwrap();
        lib.fail(3, &[f.clone()], "bad module");
        assert_eq!(lib.status(&f), Status::Failed("bad module".to_string()));

        // A failed name can be defined again
        lib.reserve(4, &[f.clone()]).unwrap();
        assert_eq!(lib.status(&f), Status::Pending(4));
    }

    #[test]
    fn test_end_releases_memory_and_waiters() {
        let memory = MemoryManager::default();
        let pool = SymbolStringPool::new();
        let lib = Library::new("main");
        let f = pool.intern("f");
        let g = pool.intern("g");
        lib.reserve(1, &[f.clone()]).unwrap();
        lib.publish(1, vec![Symbol::new(f, 0x1000, SymbolFlags::FUNCTION)], Some(block(&memory)))
            .unwrap();
        lib.reserve(2, &[g.clone()]).unwrap();
        assert!(memory.live_bytes() > 0);

        let waiter = {
            let lib = lib.clone();
            thread::spawn(move || lib.wait_for(&g, 2, false))
        };
        lib.end();
        assert_eq!(waiter.join().unwrap(), Status::Ended);
        assert_eq!(memory.live_bytes(), 0);
        assert!(lib.symbols().is_empty());
        assert_eq!(lib.reserve(3, &[]), Err(LinkError::SessionEnded));
    }

    #[test]
    fn test_link_order_defaults_to_self() {
        let lib = Library::new("main");
        assert_eq!(lib.link_order(), vec!["main".to_string()]);
        lib.set_link_order(vec!["main".into(), "runtime".into()]);
        assert_eq!(lib.link_order().len(), 2);
    }
}
