//! FFI type definitions for the C API.

use std::ffi::{CString, c_char, c_void};
use std::sync::Arc;

use crate::vm::{Context, ContextError, ContextState, Engine, ExecutionOutcome};

/// Result codes for FFI operations.
///
/// These map to the `CadenceResult` enum in C.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CadenceResult {
    /// Operation succeeded
    Ok = 0,
    /// Invalid argument passed to function
    ErrorInvalidArg = 1,
    /// Function, module or file not found
    ErrorNotFound = 2,
    /// Operation not valid in the context's current state
    ErrorState = 3,
    /// Module image could not be loaded or verified
    ErrorLoad = 4,
    /// Imported functions could not be bound
    ErrorBind = 5,
    /// Value does not match the declared type
    ErrorType = 6,
}

impl CadenceResult {
    pub fn is_ok(self) -> bool {
        self == CadenceResult::Ok
    }

    pub fn is_err(self) -> bool {
        self != CadenceResult::Ok
    }
}

impl From<&ContextError> for CadenceResult {
    fn from(err: &ContextError) -> Self {
        match err {
            ContextError::ContextBusy | ContextError::InvalidState(_) | ContextError::NotPrepared => {
                CadenceResult::ErrorState
            }
            ContextError::InvalidArgIndex(_) => CadenceResult::ErrorInvalidArg,
            ContextError::ArgTypeMismatch { .. } => CadenceResult::ErrorType,
            ContextError::NoFunction(_) | ContextError::UnboundFunction(_) => {
                CadenceResult::ErrorNotFound
            }
            ContextError::NoSystemCall | ContextError::NotAMethod => CadenceResult::ErrorState,
        }
    }
}

/// Outcome of `cadence_context_execute`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CadenceOutcome {
    Finished = 0,
    Suspended = 1,
    Exception = 2,
    Aborted = 3,
    /// The request was rejected; see `cadence_context_get_error`.
    Error = 4,
}

impl From<ExecutionOutcome> for CadenceOutcome {
    fn from(outcome: ExecutionOutcome) -> Self {
        match outcome {
            ExecutionOutcome::Finished => CadenceOutcome::Finished,
            ExecutionOutcome::Suspended => CadenceOutcome::Suspended,
            ExecutionOutcome::Exception => CadenceOutcome::Exception,
            ExecutionOutcome::Aborted => CadenceOutcome::Aborted,
        }
    }
}

/// Context state as seen from C.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CadenceState {
    Uninitialized = 0,
    Prepared = 1,
    Active = 2,
    Suspended = 3,
    Finished = 4,
    Exception = 5,
    Aborted = 6,
}

impl From<ContextState> for CadenceState {
    fn from(state: ContextState) -> Self {
        match state {
            ContextState::Uninitialized => CadenceState::Uninitialized,
            ContextState::Prepared => CadenceState::Prepared,
            ContextState::Active => CadenceState::Active,
            ContextState::Suspended => CadenceState::Suspended,
            ContextState::Finished => CadenceState::Finished,
            ContextState::Exception => CadenceState::Exception,
            ContextState::Aborted => CadenceState::Aborted,
        }
    }
}

/// Host function type.
///
/// Reads its arguments with `cadence_call_arg_*`, stores its result with
/// `cadence_call_return_*`, and returns `Ok` or raises a script exception
/// with `cadence_call_set_exception`.
pub type CadenceHostFn = unsafe extern "C" fn(call: *mut CadenceCall, userdata: *mut c_void) -> CadenceResult;

/// Opaque engine handle created by `cadence_engine_new()`.
#[repr(C)]
pub struct CadenceEngine {
    _private: [u8; 0],
}

/// Opaque context handle created by `cadence_context_new()`.
#[repr(C)]
pub struct CadenceContext {
    _private: [u8; 0],
}

/// Opaque view of one host function invocation.
#[repr(C)]
pub struct CadenceCall {
    _private: [u8; 0],
}

/// Holds the last error message as a C string.
#[derive(Debug, Default)]
pub(crate) struct LastError(Option<CString>);

impl LastError {
    pub fn set(&mut self, message: impl Into<String>) {
        self.0 = Some(CString::new(message.into()).unwrap_or_default());
    }

    pub fn clear(&mut self) {
        self.0 = None;
    }

    pub fn as_ptr(&self) -> *const c_char {
        self.0.as_ref().map_or(std::ptr::null(), |s| s.as_ptr())
    }

    pub fn is_set(&self) -> bool {
        self.0.is_some()
    }
}

/// Internal engine wrapper behind a `CadenceEngine` pointer.
pub(crate) struct EngineWrapper {
    pub engine: Arc<Engine>,
    pub last_error: LastError,
}

impl EngineWrapper {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            last_error: LastError::default(),
        }
    }
}

/// Internal context wrapper behind a `CadenceContext` pointer.
pub(crate) struct ContextWrapper {
    pub ctx: Context,
    pub last_error: LastError,
    /// Cached copy of the exception message handed out to C.
    pub exception: LastError,
}

impl ContextWrapper {
    pub fn new(ctx: Context) -> Self {
        Self {
            ctx,
            last_error: LastError::default(),
            exception: LastError::default(),
        }
    }

    /// Records a rejected request and converts it to a result code.
    pub fn fail(&mut self, err: ContextError) -> CadenceResult {
        let code = CadenceResult::from(&err);
        self.last_error.set(err.to_string());
        code
    }

    pub fn check(&mut self, result: Result<(), ContextError>) -> CadenceResult {
        match result {
            Ok(()) => {
                self.last_error.clear();
                CadenceResult::Ok
            }
            Err(err) => self.fail(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_codes() {
        assert!(CadenceResult::Ok.is_ok());
        assert!(!CadenceResult::Ok.is_err());
        assert!(CadenceResult::ErrorState.is_err());
        assert_eq!(
            CadenceResult::from(&ContextError::ContextBusy),
            CadenceResult::ErrorState
        );
    }

    #[test]
    fn test_last_error() {
        let mut error = LastError::default();
        assert!(error.as_ptr().is_null());
        error.set("test error");
        assert!(error.is_set());
        let text = unsafe { std::ffi::CStr::from_ptr(error.as_ptr()) };
        assert_eq!(text.to_str().unwrap(), "test error");
        error.clear();
        assert!(!error.is_set());
    }
}
