//! FFI type definitions for the C API.

use std::ffi::CString;

use crate::error::{JitError, LinkError, LookupError};
use crate::jit::Engine;

/// Result codes for FFI operations.
///
/// These map to the `OrcaResult` enum in C (`ORCA_RESULT_*`).
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrcaResult {
    /// Operation succeeded
    Ok = 0,
    /// Invalid argument passed to function
    ErrorInvalidArg = 1,
    /// Module text could not be parsed
    ErrorParse = 2,
    /// Module failed verification or code generation
    ErrorCompile = 3,
    /// Module failed to link
    ErrorLink = 4,
    /// A symbol is already defined
    ErrorDuplicateSymbol = 5,
    /// Symbol not found
    ErrorNotFound = 6,
    /// The engine has been ended
    ErrorEnded = 7,
}

impl OrcaResult {
    pub fn is_ok(self) -> bool {
        self == OrcaResult::Ok
    }

    pub fn is_err(self) -> bool {
        self != OrcaResult::Ok
    }
}

impl From<&JitError> for OrcaResult {
    fn from(error: &JitError) -> Self {
        match error {
            JitError::Compile(_) => OrcaResult::ErrorCompile,
            JitError::Link(LinkError::DuplicateSymbol { .. }) => OrcaResult::ErrorDuplicateSymbol,
            JitError::Link(LinkError::SessionEnded) | JitError::SessionEnded => OrcaResult::ErrorEnded,
            JitError::Link(_) => OrcaResult::ErrorLink,
            JitError::Lookup(error) => error.into(),
            JitError::InvalidName(_) | JitError::LibraryExists(_) => OrcaResult::ErrorInvalidArg,
        }
    }
}

impl From<&LookupError> for OrcaResult {
    fn from(error: &LookupError) -> Self {
        match error {
            LookupError::SymbolNotFound(_) => OrcaResult::ErrorNotFound,
            LookupError::SessionEnded => OrcaResult::ErrorEnded,
            LookupError::MaterializationFailed { .. } => OrcaResult::ErrorCompile,
            LookupError::InvalidName(_) => OrcaResult::ErrorInvalidArg,
        }
    }
}

/// Opaque engine instance type.
///
/// All operations require a valid `OrcaEngine` pointer created by
/// `orca_engine_new()`.
#[repr(C)]
pub struct OrcaEngine {
    _private: [u8; 0],
}

/// Internal wrapper that holds the engine and FFI state.
pub(crate) struct EngineWrapper {
    pub engine: Engine,
    /// Last error message (as CString for FFI compatibility)
    pub last_error: Option<CString>,
}

impl EngineWrapper {
    pub fn new(engine: Engine) -> Self {
        Self {
            engine,
            last_error: None,
        }
    }

    pub fn set_error(&mut self, message: impl Into<String>) {
        let message = message.into().replace('\0', " ");
        self.last_error = CString::new(message).ok();
    }

    pub fn clear_error(&mut self) {
        self.last_error = None;
    }
}

/// Helper to get a mutable reference to the wrapper from a raw pointer.
///
/// Returns None if the pointer is null.
pub(crate) unsafe fn get_wrapper_mut<'a>(engine: *mut OrcaEngine) -> Option<&'a mut EngineWrapper> {
    if engine.is_null() {
        None
    } else {
        Some(unsafe { &mut *(engine as *mut EngineWrapper) })
    }
}

/// Helper to get an immutable reference to the wrapper from a raw pointer.
pub(crate) unsafe fn get_wrapper<'a>(engine: *const OrcaEngine) -> Option<&'a EngineWrapper> {
    if engine.is_null() {
        None
    } else {
        Some(unsafe { &*(engine as *const EngineWrapper) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CompileError;

    #[test]
    fn test_result_codes() {
        assert!(OrcaResult::Ok.is_ok());
        assert!(OrcaResult::ErrorParse.is_err());

        let dup = JitError::Link(LinkError::DuplicateSymbol {
            symbol: "f".into(),
            library: "main".into(),
        });
        assert_eq!(OrcaResult::from(&dup), OrcaResult::ErrorDuplicateSymbol);

        let compile = JitError::Compile(CompileError::Verify {
            module: "m".into(),
            message: "empty".into(),
        });
        assert_eq!(OrcaResult::from(&compile), OrcaResult::ErrorCompile);
        assert_eq!(
            OrcaResult::from(&LookupError::SymbolNotFound("f".into())),
            OrcaResult::ErrorNotFound
        );
    }
}
