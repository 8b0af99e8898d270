//! Error types surfaced by the execution core.
//!
//! Request errors are returned synchronously and leave the context untouched.
//! Runtime faults move the context into the exception state and are reported
//! through the exception accessors instead of as `Err` values.

use thiserror::Error;

use super::verifier::VerifyError;

/// Errors returned by context operations invoked by the host.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContextError {
    /// The context is active or suspended and cannot be re-prepared.
    #[error("context is busy")]
    ContextBusy,
    /// The operation is not valid in the current state.
    #[error("operation is not valid in state {0}")]
    InvalidState(&'static str),
    /// Arguments can only be set on a prepared context.
    #[error("context is not prepared")]
    NotPrepared,
    /// The argument index is outside the parameter list.
    #[error("argument index {0} is out of range")]
    InvalidArgIndex(usize),
    /// The value does not match the declared parameter type.
    #[error("argument {index} expects {expected}")]
    ArgTypeMismatch { index: usize, expected: String },
    /// No function with the requested id exists.
    #[error("no function with id {0:#x}")]
    NoFunction(u32),
    /// The entry function is an import that is not bound to any target.
    #[error("function {0:#x} is not bound")]
    UnboundFunction(u32),
    /// Script exceptions may only be raised from inside a system function.
    #[error("not calling a system function")]
    NoSystemCall,
    /// `this` can only be set when the prepared function is a method.
    #[error("prepared function is not a method")]
    NotAMethod,
}

/// Faults raised while executing bytecode.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuntimeFault {
    #[error("Null pointer access")]
    NullPointerAccess,
    #[error("Divide by zero")]
    DivideByZero,
    #[error("Stack overflow")]
    StackOverflow,
    #[error("Unrecognized byte code")]
    UnrecognizedBytecode,
    #[error("Unbound function called")]
    UnboundFunction,
    /// Raised by a system function through its call view.
    #[error("{0}")]
    Host(String),
}

/// Errors from building, binding, and discarding modules.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ModuleError {
    #[error("a module named '{0}' already exists")]
    DuplicateModule(String),
    #[error("a type named '{0}' already exists")]
    DuplicateType(String),
    #[error("no module named '{0}'")]
    NoSuchModule(String),
    #[error("no imported function at index {0}")]
    NoSuchImport(usize),
    #[error("no function named '{0}'")]
    NoSuchFunction(String),
    #[error("function '{name}' is declared but never defined")]
    UndefinedFunction { name: String },
    #[error("signature of '{target}' does not match import '{import}'")]
    IncompatibleSignature { import: String, target: String },
    #[error("{0} imported function(s) could not be bound")]
    UnresolvedImports(usize),
    #[error("module '{0}' is still in use")]
    ModuleInUse(String),
    #[error("another build is in progress")]
    BuildInProgress,
    #[error("initializer failed: {0}")]
    InitFailed(String),
    #[error(transparent)]
    Verify(#[from] VerifyError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fault_messages() {
        assert_eq!(RuntimeFault::DivideByZero.to_string(), "Divide by zero");
        assert_eq!(
            RuntimeFault::NullPointerAccess.to_string(),
            "Null pointer access"
        );
        assert_eq!(RuntimeFault::Host("boom".into()).to_string(), "boom");
    }

    #[test]
    fn test_request_error_display() {
        let err = ContextError::ArgTypeMismatch {
            index: 1,
            expected: "double".into(),
        };
        assert_eq!(err.to_string(), "argument 1 expects double");
        assert_eq!(
            ContextError::NoFunction(0x10).to_string(),
            "no function with id 0x10"
        );
    }
}
