//! Engine lifecycle FFI functions.

use std::ffi::{CStr, c_char};

use super::error::set_creation_error;
use super::types::{EngineWrapper, OrcaEngine, get_wrapper};
use crate::config::EngineConfig;
use crate::jit::Engine;

/// Create a new engine for the host.
///
/// `config` is an optional TOML configuration (NULL for defaults). Returns
/// NULL on failure; `orca_get_error(NULL)` then describes why. The returned
/// engine must be freed with `orca_engine_free()`.
///
/// # Example (C)
/// ```c
/// OrcaEngine *engine = orca_engine_new(NULL);
/// if (engine == NULL) {
///     fprintf(stderr, "%s\n", orca_get_error(NULL));
/// }
/// // ... use engine ...
/// orca_engine_free(engine);
/// ```
///
/// # Safety
///
/// `config` must be NULL or a valid null-terminated string.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn orca_engine_new(config: *const c_char) -> *mut OrcaEngine {
    let config = if config.is_null() {
        EngineConfig::default()
    } else {
        let text = match unsafe { CStr::from_ptr(config) }.to_str() {
            Ok(text) => text,
            Err(_) => {
                set_creation_error("configuration is not valid UTF-8");
                return std::ptr::null_mut();
            }
        };
        match EngineConfig::from_toml_str(text) {
            Ok(config) => config,
            Err(e) => {
                set_creation_error(e.to_string());
                return std::ptr::null_mut();
            }
        }
    };

    match Engine::with_config(config) {
        Ok(engine) => Box::into_raw(Box::new(EngineWrapper::new(engine))) as *mut OrcaEngine,
        Err(e) => {
            set_creation_error(e.to_string());
            std::ptr::null_mut()
        }
    }
}

/// Free an engine instance, ending its session first.
///
/// After this call, the engine pointer and every function pointer obtained
/// from it are invalid.
///
/// # Safety
///
/// - `engine` must be a valid pointer returned by `orca_engine_new()`
/// - `engine` must not have been freed already
/// - No other operations may be in progress on this engine
#[unsafe(no_mangle)]
pub unsafe extern "C" fn orca_engine_free(engine: *mut OrcaEngine) {
    if engine.is_null() {
        return;
    }
    // Reconstruct the Box and let it drop
    let _ = unsafe { Box::from_raw(engine as *mut EngineWrapper) };
}

/// End the engine's session. Later submissions and lookups fail with
/// `ORCA_RESULT_ERROR_ENDED`; the engine must still be freed.
///
/// # Safety
///
/// `engine` must be NULL or a valid engine pointer.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn orca_engine_end(engine: *mut OrcaEngine) {
    if let Some(wrapper) = unsafe { get_wrapper(engine) } {
        wrapper.engine.end();
    }
}
