//! Symbol names and resolved symbols.
//!
//! Names are interned in a `SymbolStringPool` so two handles for the same
//! name share one allocation; equality and hashing use the pointer, never
//! the string contents. `MangleAndInterner` applies the target's global
//! prefix before interning, so every name stored in a library is already in
//! linker form.

use std::collections::HashSet;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};

use serde::Serialize;

use crate::error::InvalidSymbolName;

/// Interned, mangled symbol name.
#[derive(Clone)]
pub struct SymbolName(Arc<str>);

impl SymbolName {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl PartialEq for SymbolName {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for SymbolName {}

impl Hash for SymbolName {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (Arc::as_ptr(&self.0) as *const u8 as usize).hash(state);
    }
}

impl fmt::Debug for SymbolName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", &*self.0)
    }
}

impl fmt::Display for SymbolName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Serialize for SymbolName {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

/// Deduplicating string pool shared by a session.
#[derive(Default)]
pub struct SymbolStringPool {
    entries: Mutex<HashSet<Arc<str>>>,
}

impl SymbolStringPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern an already-mangled name.
    pub fn intern(&self, name: &str) -> SymbolName {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = entries.get(name) {
            return SymbolName(Arc::clone(existing));
        }
        let entry: Arc<str> = Arc::from(name);
        entries.insert(Arc::clone(&entry));
        SymbolName(entry)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Mangles names for the target, then interns them.
#[derive(Clone)]
pub struct MangleAndInterner {
    pool: Arc<SymbolStringPool>,
    prefix: Option<char>,
}

impl MangleAndInterner {
    pub fn new(pool: Arc<SymbolStringPool>, prefix: Option<char>) -> Self {
        Self { pool, prefix }
    }

    /// Check that a source-level name can be used as a symbol.
    pub fn validate(name: &str) -> Result<(), InvalidSymbolName> {
        if name.is_empty() || name.contains('\0') {
            return Err(InvalidSymbolName(name.to_string()));
        }
        Ok(())
    }

    /// Apply the global prefix to a source-level name.
    pub fn mangle(&self, name: &str) -> String {
        match self.prefix {
            Some(prefix) => format!("{prefix}{name}"),
            None => name.to_string(),
        }
    }

    /// Mangle and intern a source-level name.
    pub fn intern(&self, name: &str) -> Result<SymbolName, InvalidSymbolName> {
        Self::validate(name)?;
        Ok(self.pool.intern(&self.mangle(name)))
    }

    /// Intern a name that is already in linker form.
    pub fn intern_mangled(&self, name: &str) -> SymbolName {
        self.pool.intern(name)
    }

    /// Strip the global prefix from a linker name.
    ///
    /// Names lacking the prefix are not visible as source-level names and
    /// yield `None`.
    pub fn demangle<'n>(&self, name: &'n str) -> Option<&'n str> {
        match self.prefix {
            Some(prefix) => name.strip_prefix(prefix),
            None => Some(name),
        }
    }

    pub fn prefix(&self) -> Option<char> {
        self.prefix
    }
}

/// Properties of a resolved symbol.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SymbolFlags {
    /// Visible to lookups from outside the defining module
    pub exported: bool,
    /// Refers to code rather than data
    pub callable: bool,
    /// Address came from outside the JIT (process or host-provided)
    pub absolute: bool,
}

impl SymbolFlags {
    pub const FUNCTION: SymbolFlags = SymbolFlags {
        exported: true,
        callable: true,
        absolute: false,
    };

    pub const DATA: SymbolFlags = SymbolFlags {
        exported: true,
        callable: false,
        absolute: false,
    };

    pub const ABSOLUTE: SymbolFlags = SymbolFlags {
        exported: true,
        callable: false,
        absolute: true,
    };
}

/// A resolved symbol: name, address and flags.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Symbol {
    pub name: SymbolName,
    pub address: u64,
    pub flags: SymbolFlags,
}

impl Symbol {
    pub fn new(name: SymbolName, address: u64, flags: SymbolFlags) -> Self {
        Self {
            name,
            address,
            flags,
        }
    }
}
