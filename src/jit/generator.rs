//! Fallback symbol generators.
//!
//! A library consults its generators, in attachment order, only after its
//! own published and in-flight definitions. Generators answer `Ok(None)` for
//! names they do not know. Generated symbols are not cached in the library,
//! so a later JIT definition of the same name is still accepted.

use std::collections::{HashMap, HashSet};
use std::ffi::c_void;

#[cfg(unix)]
use libloading::os::unix::Library as ProcessHandle;
#[cfg(windows)]
use libloading::os::windows::Library as ProcessHandle;

use super::library::Library;
use super::symbols::{Symbol, SymbolFlags, SymbolName};
use crate::error::{CreationError, LookupError};

/// Produces definitions for names a library does not define itself.
pub trait DefinitionGenerator: Send + Sync {
    fn try_generate(&self, library: &Library, name: &SymbolName) -> Result<Option<Symbol>, LookupError>;
}

/// Searches symbols already loaded into the running process.
pub struct ProcessSymbolGenerator {
    process: ProcessHandle,
    prefix: Option<char>,
    allow: Option<HashSet<String>>,
}

impl ProcessSymbolGenerator {
    /// Open the running process for symbol search.
    ///
    /// `prefix` is the target's global symbol prefix: names without it are
    /// not searched, and it is stripped before the lookup.
    pub fn for_current_process(prefix: Option<char>) -> Result<Self, CreationError> {
        #[cfg(unix)]
        let process = ProcessHandle::this();
        #[cfg(windows)]
        let process = ProcessHandle::this().map_err(|e| CreationError::ProcessSymbols(e.to_string()))?;

        Ok(Self {
            process,
            prefix,
            allow: None,
        })
    }

    /// Only resolve the given (unprefixed) names.
    pub fn with_allow_list<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allow = Some(names.into_iter().map(Into::into).collect());
        self
    }

    fn strip<'n>(&self, name: &'n str) -> Option<&'n str> {
        match self.prefix {
            Some(prefix) => name.strip_prefix(prefix),
            None => Some(name),
        }
    }
}

impl DefinitionGenerator for ProcessSymbolGenerator {
    fn try_generate(&self, _library: &Library, name: &SymbolName) -> Result<Option<Symbol>, LookupError> {
        let Some(bare) = self.strip(name.as_str()) else {
            return Ok(None);
        };
        if bare.is_empty() {
            return Ok(None);
        }
        if let Some(allow) = &self.allow
            && !allow.contains(bare)
        {
            return Ok(None);
        }
        // Missing names and names with interior NULs both come back as errors
        let address = match unsafe { self.process.get::<*const c_void>(bare.as_bytes()) } {
            Ok(symbol) => *symbol,
            Err(_) => return Ok(None),
        };
        if address.is_null() {
            return Ok(None);
        }
        tracing::trace!(symbol = %name, address = address as u64, "resolved from process");
        Ok(Some(Symbol::new(name.clone(), address as u64, SymbolFlags::ABSOLUTE)))
    }
}

/// Resolves a fixed set of host-provided addresses.
#[derive(Debug, Default)]
pub struct AbsoluteSymbolGenerator {
    symbols: HashMap<SymbolName, u64>,
}

impl AbsoluteSymbolGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a definition. `name` must already be mangled for the target.
    pub fn define(&mut self, name: SymbolName, address: u64) -> &mut Self {
        self.symbols.insert(name, address);
        self
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }
}

impl FromIterator<(SymbolName, u64)> for AbsoluteSymbolGenerator {
    fn from_iter<I: IntoIterator<Item = (SymbolName, u64)>>(iter: I) -> Self {
        Self {
            symbols: iter.into_iter().collect(),
        }
    }
}

impl DefinitionGenerator for AbsoluteSymbolGenerator {
    fn try_generate(&self, _library: &Library, name: &SymbolName) -> Result<Option<Symbol>, LookupError> {
        Ok(self
            .symbols
            .get(name)
            .map(|&address| Symbol::new(name.clone(), address, SymbolFlags::ABSOLUTE)))
    }
}
