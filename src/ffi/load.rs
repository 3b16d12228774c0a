//! Module loading FFI functions.

use std::ffi::{CStr, c_char};

use super::types::{OrcaEngine, OrcaResult, get_wrapper_mut};
use crate::ir::parse_module;

/// Parse a textual IR module and submit it to the engine's main library.
///
/// # Arguments
/// - `engine`: Valid engine instance
/// - `source`: Module text (null-terminated)
/// - `wait`: If true, return only after the module is linked, reporting
///   compile and link failures; otherwise return once it is queued
///
/// # Returns
/// - `ORCA_RESULT_OK` on success
/// - `ORCA_RESULT_ERROR_INVALID_ARG` if source is NULL or not UTF-8
/// - `ORCA_RESULT_ERROR_PARSE` if the text is malformed
/// - `ORCA_RESULT_ERROR_DUPLICATE_SYMBOL` if a name is already defined
/// - `ORCA_RESULT_ERROR_COMPILE` / `ORCA_RESULT_ERROR_LINK` on failure when waiting
///
/// # Safety
///
/// `engine` must be a valid engine pointer and `source` NULL or a valid
/// null-terminated string.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn orca_engine_add_module_text(
    engine: *mut OrcaEngine,
    source: *const c_char,
    wait: bool,
) -> OrcaResult {
    let Some(wrapper) = (unsafe { get_wrapper_mut(engine) }) else {
        return OrcaResult::ErrorInvalidArg;
    };
    if source.is_null() {
        wrapper.set_error("source pointer is NULL");
        return OrcaResult::ErrorInvalidArg;
    }
    let Ok(source) = unsafe { CStr::from_ptr(source) }.to_str() else {
        wrapper.set_error("source is not valid UTF-8");
        return OrcaResult::ErrorInvalidArg;
    };

    let module = match parse_module(source) {
        Ok(module) => module,
        Err(e) => {
            wrapper.set_error(format!("parse error: {}", e));
            return OrcaResult::ErrorParse;
        }
    };

    let result = if wait {
        wrapper.engine.add_module_blocking(module)
    } else {
        wrapper.engine.add_module(module)
    };
    match result {
        Ok(()) => {
            wrapper.clear_error();
            OrcaResult::Ok
        }
        Err(e) => {
            let code = OrcaResult::from(&e);
            wrapper.set_error(e.to_string());
            code
        }
    }
}
