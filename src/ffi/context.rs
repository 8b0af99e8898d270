//! Context FFI functions: prepare, pass arguments, execute, read results.

#![allow(unsafe_op_in_unsafe_fn)]

use std::ffi::c_char;

use super::engine::get_engine;
use super::types::{
    CadenceContext, CadenceEngine, CadenceOutcome, CadenceResult, CadenceState, ContextWrapper,
};
use crate::vm::FunctionId;

/// Create a context for running functions of `engine`.
///
/// Returns NULL if `engine` is NULL. Free with `cadence_context_free()`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn cadence_context_new(engine: *const CadenceEngine) -> *mut CadenceContext {
    let Some(wrapper) = get_engine(engine) else {
        return std::ptr::null_mut();
    };
    let ctx = wrapper.engine.create_context();
    Box::into_raw(Box::new(ContextWrapper::new(ctx))) as *mut CadenceContext
}

/// Free a context, releasing everything it still holds.
///
/// # Safety
///
/// - `ctx` must be a pointer returned by `cadence_context_new()`
/// - `ctx` must not be executing on another thread
#[unsafe(no_mangle)]
pub unsafe extern "C" fn cadence_context_free(ctx: *mut CadenceContext) {
    if ctx.is_null() {
        return;
    }
    let _ = Box::from_raw(ctx as *mut ContextWrapper);
}

/// Prepare the context to run function `function_id`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn cadence_context_prepare(ctx: *mut CadenceContext, function_id: u32) -> CadenceResult {
    let Some(w) = get_context_mut(ctx) else {
        return CadenceResult::ErrorInvalidArg;
    };
    let result = w.ctx.prepare(FunctionId(function_id));
    w.check(result)
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn cadence_context_unprepare(ctx: *mut CadenceContext) -> CadenceResult {
    let Some(w) = get_context_mut(ctx) else {
        return CadenceResult::ErrorInvalidArg;
    };
    let result = w.ctx.unprepare();
    w.check(result)
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn cadence_context_set_arg_int(ctx: *mut CadenceContext, index: usize, value: i32) -> CadenceResult {
    let Some(w) = get_context_mut(ctx) else {
        return CadenceResult::ErrorInvalidArg;
    };
    let result = w.ctx.set_arg_dword(index, value as u32);
    w.check(result)
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn cadence_context_set_arg_int64(ctx: *mut CadenceContext, index: usize, value: i64) -> CadenceResult {
    let Some(w) = get_context_mut(ctx) else {
        return CadenceResult::ErrorInvalidArg;
    };
    let result = w.ctx.set_arg_qword(index, value as u64);
    w.check(result)
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn cadence_context_set_arg_float(ctx: *mut CadenceContext, index: usize, value: f32) -> CadenceResult {
    let Some(w) = get_context_mut(ctx) else {
        return CadenceResult::ErrorInvalidArg;
    };
    let result = w.ctx.set_arg_float(index, value);
    w.check(result)
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn cadence_context_set_arg_double(ctx: *mut CadenceContext, index: usize, value: f64) -> CadenceResult {
    let Some(w) = get_context_mut(ctx) else {
        return CadenceResult::ErrorInvalidArg;
    };
    let result = w.ctx.set_arg_double(index, value);
    w.check(result)
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn cadence_context_set_arg_bool(ctx: *mut CadenceContext, index: usize, value: bool) -> CadenceResult {
    let Some(w) = get_context_mut(ctx) else {
        return CadenceResult::ErrorInvalidArg;
    };
    let result = w.ctx.set_arg_byte(index, value as u8);
    w.check(result)
}

/// Run or resume the prepared function.
///
/// Returns `Error` if the context is neither prepared nor suspended.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn cadence_context_execute(ctx: *mut CadenceContext) -> CadenceOutcome {
    let Some(w) = get_context_mut(ctx) else {
        return CadenceOutcome::Error;
    };
    w.exception.clear();
    match w.ctx.execute() {
        Ok(outcome) => {
            w.last_error.clear();
            outcome.into()
        }
        Err(err) => {
            w.fail(err);
            CadenceOutcome::Error
        }
    }
}

/// Request suspension at the next yield point.
///
/// Only this flag is touched, but the pointer must stay valid while the
/// executing thread runs.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn cadence_context_suspend(ctx: *const CadenceContext) {
    if let Some(w) = get_context(ctx) {
        w.ctx.suspend();
    }
}

/// Request abortion at the next yield point. A suspended context is
/// aborted by its next execute, prepare or unprepare call.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn cadence_context_abort(ctx: *const CadenceContext) {
    if let Some(w) = get_context(ctx) {
        w.ctx.interrupt_handle().abort();
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn cadence_context_state(ctx: *const CadenceContext) -> CadenceState {
    get_context(ctx).map_or(CadenceState::Uninitialized, |w| w.ctx.state().into())
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn cadence_context_return_int(ctx: *const CadenceContext) -> i32 {
    get_context(ctx).map_or(0, |w| w.ctx.return_dword() as i32)
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn cadence_context_return_int64(ctx: *const CadenceContext) -> i64 {
    get_context(ctx).map_or(0, |w| w.ctx.return_qword() as i64)
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn cadence_context_return_float(ctx: *const CadenceContext) -> f32 {
    get_context(ctx).map_or(0.0, |w| w.ctx.return_float())
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn cadence_context_return_double(ctx: *const CadenceContext) -> f64 {
    get_context(ctx).map_or(0.0, |w| w.ctx.return_double())
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn cadence_context_return_bool(ctx: *const CadenceContext) -> bool {
    get_context(ctx).is_some_and(|w| w.ctx.return_byte() != 0)
}

/// The exception message, or NULL if the context is not in the exception
/// state. Valid until the next execute or free.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn cadence_context_exception_string(ctx: *mut CadenceContext) -> *const c_char {
    let Some(w) = get_context_mut(ctx) else {
        return std::ptr::null();
    };
    match w.ctx.exception_string().map(str::to_string) {
        Some(message) => {
            w.exception.set(message);
            w.exception.as_ptr()
        }
        None => std::ptr::null(),
    }
}

/// Line of the instruction that raised the exception; 0 if unknown.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn cadence_context_exception_line(ctx: *const CadenceContext) -> u32 {
    get_context(ctx).and_then(|w| w.ctx.exception_line()).unwrap_or(0)
}

/// Column of the instruction that raised the exception; 0 if unknown.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn cadence_context_exception_column(ctx: *const CadenceContext) -> u32 {
    get_context(ctx).and_then(|w| w.ctx.exception_column()).unwrap_or(0)
}

/// Id of the function that raised the exception; 0 if none.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn cadence_context_exception_function(ctx: *const CadenceContext) -> u32 {
    get_context(ctx)
        .and_then(|w| w.ctx.exception_function())
        .map_or(0, |id| id.0)
}

/// Number of saved frames below the current function.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn cadence_context_call_stack_size(ctx: *const CadenceContext) -> usize {
    get_context(ctx).map_or(0, |w| w.ctx.call_stack_size())
}

/// Get the last rejected request's message, or NULL if none.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn cadence_context_get_error(ctx: *const CadenceContext) -> *const c_char {
    match get_context(ctx) {
        Some(w) => w.last_error.as_ptr(),
        None => std::ptr::null(),
    }
}

pub(crate) unsafe fn get_context_mut(ctx: *mut CadenceContext) -> Option<&'static mut ContextWrapper> {
    if ctx.is_null() {
        None
    } else {
        Some(&mut *(ctx as *mut ContextWrapper))
    }
}

pub(crate) unsafe fn get_context(ctx: *const CadenceContext) -> Option<&'static ContextWrapper> {
    if ctx.is_null() {
        None
    } else {
        Some(&*(ctx as *const ContextWrapper))
    }
}
