//! Symbol lookup FFI functions.

use std::ffi::{CStr, c_char};

use super::types::{OrcaEngine, OrcaResult, get_wrapper_mut};

/// Resolve a symbol in the engine's main library.
///
/// Waits for the defining module if it is still being compiled. On success
/// the address is written to `out_address`.
///
/// # Example (C)
/// ```c
/// uint64_t addr;
/// if (orca_engine_lookup(engine, "add", &addr) == ORCA_RESULT_OK) {
///     int64_t (*add)(int64_t, int64_t) = (void *)addr;
///     printf("%lld\n", add(2, 3));
/// }
/// ```
///
/// # Safety
///
/// `engine` must be a valid engine pointer, `name` NULL or a valid
/// null-terminated string, and `out_address` NULL or writable.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn orca_engine_lookup(
    engine: *mut OrcaEngine,
    name: *const c_char,
    out_address: *mut u64,
) -> OrcaResult {
    let Some(wrapper) = (unsafe { get_wrapper_mut(engine) }) else {
        return OrcaResult::ErrorInvalidArg;
    };
    if name.is_null() || out_address.is_null() {
        wrapper.set_error("name or output pointer is NULL");
        return OrcaResult::ErrorInvalidArg;
    }
    let Ok(name) = unsafe { CStr::from_ptr(name) }.to_str() else {
        wrapper.set_error("symbol name is not valid UTF-8");
        return OrcaResult::ErrorInvalidArg;
    };

    match wrapper.engine.get_symbol_address(name) {
        Ok(address) => {
            unsafe { *out_address = address };
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

#[cfg(all(test, unix, any(target_arch = "x86_64", target_arch = "aarch64")))]
mod tests {
    use super::*;
    use crate::ffi::engine_ffi::{orca_engine_end, orca_engine_free, orca_engine_new};
    use crate::ffi::load::orca_engine_add_module_text;

    #[test]
    fn test_lookup_and_call() {
        unsafe {
            let engine = orca_engine_new(std::ptr::null());
            let source = c"module m\nexport func add(a, b) {\n  arg a\n  arg b\n  add\n  ret\n}\n";
            assert_eq!(orca_engine_add_module_text(engine, source.as_ptr(), false), OrcaResult::Ok);

            let mut address = 0u64;
            assert_eq!(orca_engine_lookup(engine, c"add".as_ptr(), &mut address), OrcaResult::Ok);
            let add: extern "C" fn(i64, i64) -> i64 = std::mem::transmute(address as usize);
            assert_eq!(add(2, 3), 5);

            assert_eq!(
                orca_engine_lookup(engine, c"orca_missing_symbol".as_ptr(), &mut address),
                OrcaResult::ErrorNotFound
            );

            orca_engine_end(engine);
            assert_eq!(orca_engine_lookup(engine, c"add".as_ptr(), &mut address), OrcaResult::ErrorEnded);
            orca_engine_free(engine);
        }
    }
}
