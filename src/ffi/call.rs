//! Argument and return access for host functions registered from C.

#![allow(unsafe_op_in_unsafe_fn)]

use std::ffi::c_char;

use super::engine::c_str;
use super::types::{CadenceCall, CadenceResult};
use crate::vm::SystemCall;

unsafe fn get_call<'a>(call: *mut CadenceCall) -> Option<&'a mut SystemCall<'a>> {
    if call.is_null() {
        None
    } else {
        Some(&mut *(call as *mut SystemCall<'a>))
    }
}

/// Number of declared parameters.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn cadence_call_arg_count(call: *mut CadenceCall) -> usize {
    get_call(call).map_or(0, |c| c.arg_count())
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn cadence_call_arg_int(call: *mut CadenceCall, index: usize) -> i32 {
    get_call(call).map_or(0, |c| c.arg_int(index))
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn cadence_call_arg_int64(call: *mut CadenceCall, index: usize) -> i64 {
    get_call(call).map_or(0, |c| c.arg_int64(index))
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn cadence_call_arg_float(call: *mut CadenceCall, index: usize) -> f32 {
    get_call(call).map_or(0.0, |c| c.arg_float(index))
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn cadence_call_arg_double(call: *mut CadenceCall, index: usize) -> f64 {
    get_call(call).map_or(0.0, |c| c.arg_double(index))
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn cadence_call_arg_bool(call: *mut CadenceCall, index: usize) -> bool {
    get_call(call).is_some_and(|c| c.arg_bool(index))
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn cadence_call_return_int(call: *mut CadenceCall, value: i32) {
    if let Some(c) = get_call(call) {
        c.set_return_int(value);
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn cadence_call_return_int64(call: *mut CadenceCall, value: i64) {
    if let Some(c) = get_call(call) {
        c.set_return_int64(value);
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn cadence_call_return_float(call: *mut CadenceCall, value: f32) {
    if let Some(c) = get_call(call) {
        c.set_return_float(value);
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn cadence_call_return_double(call: *mut CadenceCall, value: f64) {
    if let Some(c) = get_call(call) {
        c.set_return_double(value);
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn cadence_call_return_bool(call: *mut CadenceCall, value: bool) {
    if let Some(c) = get_call(call) {
        c.set_return_bool(value);
    }
}

/// Raise a script exception once the host function returns.
///
/// The host function should still return `Ok`; the message becomes the
/// exception string of the calling context.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn cadence_call_set_exception(
    call: *mut CadenceCall,
    message: *const c_char,
) -> CadenceResult {
    let Some(c) = get_call(call) else {
        return CadenceResult::ErrorInvalidArg;
    };
    let message = c_str(message).unwrap_or("host exception");
    match c.set_exception(message) {
        Ok(()) => CadenceResult::Ok,
        Err(_) => CadenceResult::ErrorState,
    }
}

/// Request that the calling context suspend once this call returns.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn cadence_call_suspend(call: *mut CadenceCall) {
    if let Some(c) = get_call(call) {
        c.suspend();
    }
}
