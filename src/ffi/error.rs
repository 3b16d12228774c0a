//! Error handling FFI functions.

use std::cell::RefCell;
use std::ffi::{CString, c_char};

use super::types::{OrcaEngine, get_wrapper, get_wrapper_mut};

thread_local! {
    /// Why the last `orca_engine_new` on this thread failed.
    static CREATION_ERROR: RefCell<Option<CString>> = const { RefCell::new(None) };
}

pub(crate) fn set_creation_error(message: impl Into<String>) {
    let message = CString::new(message.into().replace('\0', " ")).ok();
    CREATION_ERROR.with(|slot| *slot.borrow_mut() = message);
}

/// Get the last error message.
///
/// With a NULL engine, returns why the last `orca_engine_new` on this thread
/// failed. Returns NULL if there is no error. The returned pointer is valid
/// until the next API call that may set an error.
///
/// # Example (C)
/// ```c
/// OrcaResult res = orca_engine_add_module_text(engine, source, true);
/// if (res != ORCA_RESULT_OK) {
///     printf("Error: %s\n", orca_get_error(engine));
/// }
/// ```
///
/// # Safety
///
/// `engine` must be NULL or a valid engine pointer.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn orca_get_error(engine: *const OrcaEngine) -> *const c_char {
    if engine.is_null() {
        return CREATION_ERROR.with(|slot| {
            slot.borrow()
                .as_ref()
                .map_or(std::ptr::null(), |message| message.as_ptr())
        });
    }
    match unsafe { get_wrapper(engine) }.and_then(|wrapper| wrapper.last_error.as_ref()) {
        Some(message) => message.as_ptr(),
        None => std::ptr::null(),
    }
}

/// Clear the last error.
///
/// # Safety
///
/// `engine` must be NULL or a valid engine pointer.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn orca_clear_error(engine: *mut OrcaEngine) {
    match unsafe { get_wrapper_mut(engine) } {
        Some(wrapper) => wrapper.clear_error(),
        None => CREATION_ERROR.with(|slot| *slot.borrow_mut() = None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ffi::engine_ffi::{orca_engine_free, orca_engine_new};
    use std::ffi::CStr;

    #[test]
    fn test_get_error() {
        unsafe {
            let engine = orca_engine_new(std::ptr::null());

            // No error initially
            assert!(orca_get_error(engine).is_null());

            get_wrapper_mut(engine).unwrap().set_error("test error message");
            let error = CStr::from_ptr(orca_get_error(engine));
            assert_eq!(error.to_str().unwrap(), "test error message");

            orca_clear_error(engine);
            assert!(orca_get_error(engine).is_null());

            orca_engine_free(engine);
        }
    }

    #[test]
    fn test_creation_error_is_per_thread() {
        set_creation_error("boom");
        let other = std::thread::spawn(|| unsafe { orca_get_error(std::ptr::null()).is_null() });
        assert!(other.join().unwrap());
        unsafe {
            assert!(!orca_get_error(std::ptr::null()).is_null());
            orca_clear_error(std::ptr::null_mut());
            assert!(orca_get_error(std::ptr::null()).is_null());
        }
    }
}
