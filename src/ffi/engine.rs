//! Engine lifecycle, module loading and host function registration.

#![allow(unsafe_op_in_unsafe_fn)]

use std::ffi::{CStr, c_char, c_void};
use std::sync::Arc;

use super::types::{CadenceCall, CadenceEngine, CadenceHostFn, CadenceResult, EngineWrapper};
use crate::config::EngineConfig;
use crate::vm::image::{ImageError, ModuleImage};
use crate::vm::{Engine, FunctionBuilder, FunctionId, Module, Signature, SystemCall};

/// Create a new engine with the default configuration.
///
/// The returned engine must be freed with `cadence_engine_free()`.
///
/// # Example (C)
/// ```c
/// CadenceEngine *engine = cadence_engine_new();
/// // ... load modules, create contexts ...
/// cadence_engine_free(engine);
/// ```
#[unsafe(no_mangle)]
pub extern "C" fn cadence_engine_new() -> *mut CadenceEngine {
    cadence_engine_new_with_config(EngineConfig::default().initial_context_stack_words, 0)
}

/// Create a new engine with explicit stack sizes in 32-bit words.
///
/// `max_stack_words` of 0 means unlimited.
#[unsafe(no_mangle)]
pub extern "C" fn cadence_engine_new_with_config(
    initial_stack_words: u32,
    max_stack_words: u32,
) -> *mut CadenceEngine {
    let config = EngineConfig {
        initial_context_stack_words: initial_stack_words,
        max_context_stack_words: max_stack_words,
        ..EngineConfig::default()
    };
    let wrapper = Box::new(EngineWrapper::new(Engine::new(config)));
    Box::into_raw(wrapper) as *mut CadenceEngine
}

/// Free an engine handle.
///
/// Contexts created from the engine keep it alive until they are freed.
///
/// # Safety
///
/// - `engine` must be a pointer returned by `cadence_engine_new()`
/// - `engine` must not have been freed already
#[unsafe(no_mangle)]
pub unsafe extern "C" fn cadence_engine_free(engine: *mut CadenceEngine) {
    if engine.is_null() {
        return;
    }
    let _ = Box::from_raw(engine as *mut EngineWrapper);
}

fn load_image(wrapper: &mut EngineWrapper, image: Result<ModuleImage, ImageError>) -> CadenceResult {
    let module = match image.and_then(|image| image.build(&wrapper.engine)) {
        Ok(module) => module,
        Err(ImageError::Io(e)) => {
            wrapper.last_error.set(format!("failed to read image: {}", e));
            return CadenceResult::ErrorNotFound;
        }
        Err(e) => {
            wrapper.last_error.set(e.to_string());
            return CadenceResult::ErrorLoad;
        }
    };
    if let Err(e) = wrapper.engine.reset_globals(&module) {
        wrapper.last_error.set(e.to_string());
        return CadenceResult::ErrorLoad;
    }
    wrapper.last_error.clear();
    CadenceResult::Ok
}

/// Load a JSON module image from a file and run its initializer.
///
/// Imports are left unbound; call `cadence_engine_bind_imports` once every
/// module they refer to has been loaded.
///
/// # Returns
/// - `Ok` on success
/// - `ErrorInvalidArg` if a pointer is NULL or the path is not UTF-8
/// - `ErrorNotFound` if the file cannot be read
/// - `ErrorLoad` if the image is malformed or fails verification
#[unsafe(no_mangle)]
pub unsafe extern "C" fn cadence_engine_load_image(
    engine: *mut CadenceEngine,
    path: *const c_char,
) -> CadenceResult {
    let Some(wrapper) = get_engine_mut(engine) else {
        return CadenceResult::ErrorInvalidArg;
    };
    let Some(path) = c_str(path) else {
        wrapper.last_error.set("invalid path");
        return CadenceResult::ErrorInvalidArg;
    };
    load_image(wrapper, ModuleImage::load(path))
}

/// Load a JSON module image from memory.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn cadence_engine_load_image_json(
    engine: *mut CadenceEngine,
    json: *const c_char,
    len: usize,
) -> CadenceResult {
    let Some(wrapper) = get_engine_mut(engine) else {
        return CadenceResult::ErrorInvalidArg;
    };
    if json.is_null() {
        wrapper.last_error.set("json pointer is NULL");
        return CadenceResult::ErrorInvalidArg;
    }
    let bytes = std::slice::from_raw_parts(json as *const u8, len);
    let Ok(text) = std::str::from_utf8(bytes) else {
        wrapper.last_error.set("image is not valid UTF-8");
        return CadenceResult::ErrorInvalidArg;
    };
    load_image(wrapper, ModuleImage::from_json(text))
}

fn find_module(wrapper: &mut EngineWrapper, name: &str) -> Option<Arc<Module>> {
    let module = wrapper.engine.module(name);
    if module.is_none() {
        wrapper.last_error.set(format!("no module named '{}'", name));
    }
    module
}

/// Look up a function id by module and function name.
///
/// Returns 0 if either is not found.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn cadence_engine_find_function(
    engine: *mut CadenceEngine,
    module: *const c_char,
    name: *const c_char,
) -> u32 {
    let Some(wrapper) = get_engine_mut(engine) else {
        return 0;
    };
    let (Some(module_name), Some(name)) = (c_str(module), c_str(name)) else {
        wrapper.last_error.set("invalid name");
        return 0;
    };
    let Some(module) = find_module(wrapper, module_name) else {
        return 0;
    };
    match module.function_by_name(name) {
        Some(function) => function.id.0,
        None => {
            wrapper.last_error.set(format!("no function named '{}'", name));
            0
        }
    }
}

/// Bind every import of a module by name.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn cadence_engine_bind_imports(
    engine: *mut CadenceEngine,
    module: *const c_char,
) -> CadenceResult {
    let Some(wrapper) = get_engine_mut(engine) else {
        return CadenceResult::ErrorInvalidArg;
    };
    let Some(name) = c_str(module) else {
        return CadenceResult::ErrorInvalidArg;
    };
    let Some(module) = find_module(wrapper, name) else {
        return CadenceResult::ErrorNotFound;
    };
    match wrapper.engine.bind_all_imported_functions(&module) {
        Ok(()) => CadenceResult::Ok,
        Err(e) => {
            wrapper.last_error.set(e.to_string());
            CadenceResult::ErrorBind
        }
    }
}

/// Discard a module. It is deleted once no context or import uses it.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn cadence_engine_discard_module(
    engine: *mut CadenceEngine,
    module: *const c_char,
) -> CadenceResult {
    let Some(wrapper) = get_engine_mut(engine) else {
        return CadenceResult::ErrorInvalidArg;
    };
    let Some(name) = c_str(module) else {
        return CadenceResult::ErrorInvalidArg;
    };
    match wrapper.engine.discard_module(name) {
        Ok(()) => CadenceResult::Ok,
        Err(e) => {
            wrapper.last_error.set(e.to_string());
            CadenceResult::ErrorNotFound
        }
    }
}

/// `userdata` is only handed back to the host function.
struct HostData(*mut c_void);

unsafe impl Send for HostData {}
unsafe impl Sync for HostData {}

/// Register a host function callable from scripts with `CallSys`.
///
/// `returns` and each entry of `params` are type declarations such as
/// `"int"` or `"double"`. Returns the function id, or 0 on failure.
///
/// # Safety
///
/// `params` must point to `param_count` valid C strings. `func` is called
/// on whichever thread executes the script.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn cadence_engine_register_function(
    engine: *mut CadenceEngine,
    name: *const c_char,
    returns: *const c_char,
    params: *const *const c_char,
    param_count: usize,
    func: CadenceHostFn,
    userdata: *mut c_void,
) -> u32 {
    let Some(wrapper) = get_engine_mut(engine) else {
        return 0;
    };
    let Some(name) = c_str(name) else {
        wrapper.last_error.set("invalid name");
        return 0;
    };
    let Some(return_type) = c_str(returns).and_then(|decl| wrapper.engine.parse_type(decl)) else {
        wrapper.last_error.set("invalid return type");
        return 0;
    };
    let mut param_types = Vec::with_capacity(param_count);
    if param_count > 0 {
        if params.is_null() {
            wrapper.last_error.set("params pointer is NULL");
            return 0;
        }
        for &decl in std::slice::from_raw_parts(params, param_count) {
            match c_str(decl).and_then(|decl| wrapper.engine.parse_type(decl)) {
                Some(ty) => param_types.push(ty),
                None => {
                    wrapper.last_error.set("invalid parameter type");
                    return 0;
                }
            }
        }
    }

    let desc = FunctionBuilder::system(name)
        .signature(Signature::new(return_type, param_types))
        .build();
    let data = HostData(userdata);
    let id: FunctionId = wrapper.engine.register_function(desc, move |call| {
        let data = &data;
        let result = unsafe { func(call as *mut SystemCall<'_> as *mut CadenceCall, data.0) };
        match result {
            CadenceResult::Ok => Ok(()),
            code => Err(format!("host function failed with {:?}", code)),
        }
    });
    wrapper.last_error.clear();
    id.0
}

/// Get the last error message, or NULL if none.
///
/// The pointer is valid until the next call on this engine.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn cadence_engine_get_error(engine: *const CadenceEngine) -> *const c_char {
    match get_engine(engine) {
        Some(wrapper) => wrapper.last_error.as_ptr(),
        None => std::ptr::null(),
    }
}

pub(crate) unsafe fn c_str<'a>(ptr: *const c_char) -> Option<&'a str> {
    if ptr.is_null() {
        return None;
    }
    CStr::from_ptr(ptr).to_str().ok()
}

/// Helper to get a mutable reference to the wrapper from a raw pointer.
pub(crate) unsafe fn get_engine_mut(engine: *mut CadenceEngine) -> Option<&'static mut EngineWrapper> {
    if engine.is_null() {
        None
    } else {
        Some(&mut *(engine as *mut EngineWrapper))
    }
}

pub(crate) unsafe fn get_engine(engine: *const CadenceEngine) -> Option<&'static EngineWrapper> {
    if engine.is_null() {
        None
    } else {
        Some(&*(engine as *const EngineWrapper))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::CString;

    const IMAGE: &str = r#"{
        "name": "m",
        "functions": [
            { "name": "answer", "returns": "int", "locals": 1,
              "code": [{ "SetV4": [1, 42] }, { "CpyVtoR4": 1 }, { "Ret": 0 }] }
        ]
    }"#;

    #[test]
    fn test_engine_lifecycle() {
        unsafe {
            let engine = cadence_engine_new();
            assert!(!engine.is_null());
            assert!(cadence_engine_get_error(engine).is_null());
            cadence_engine_free(engine);
            cadence_engine_free(std::ptr::null_mut());
        }
    }

    #[test]
    fn test_load_and_find() {
        unsafe {
            let engine = cadence_engine_new();
            let result = cadence_engine_load_image_json(engine, IMAGE.as_ptr() as *const c_char, IMAGE.len());
            assert_eq!(result, CadenceResult::Ok);

            let module = CString::new("m").unwrap();
            let name = CString::new("answer").unwrap();
            assert_ne!(cadence_engine_find_function(engine, module.as_ptr(), name.as_ptr()), 0);

            let missing = CString::new("missing").unwrap();
            assert_eq!(cadence_engine_find_function(engine, module.as_ptr(), missing.as_ptr()), 0);
            assert!(!cadence_engine_get_error(engine).is_null());
            cadence_engine_free(engine);
        }
    }

    #[test]
    fn test_load_missing_file() {
        unsafe {
            let engine = cadence_engine_new();
            let path = CString::new("/nonexistent/image.json").unwrap();
            assert_eq!(
                cadence_engine_load_image(engine, path.as_ptr()),
                CadenceResult::ErrorNotFound
            );
            cadence_engine_free(engine);
        }
    }

    #[test]
    fn test_null_engine() {
        unsafe {
            let path = CString::new("x").unwrap();
            assert_eq!(
                cadence_engine_load_image(std::ptr::null_mut(), path.as_ptr()),
                CadenceResult::ErrorInvalidArg
            );
            assert!(cadence_engine_get_error(std::ptr::null()).is_null());
        }
    }
}
