//! Cadence - a bytecode virtual machine for embedded scripting
//!
//! This library provides the execution engine: modules of compiled
//! functions, contexts that run them, and the host function interface.
//! For C/C++ embedding, use the FFI module functions.

pub mod config;
pub mod ffi;
pub mod vm;

// Re-export commonly used types
pub use config::{ConfigError, EngineConfig};
pub use vm::image::{ImageError, ModuleImage};
pub use vm::{
    Context, ContextError, ContextState, Engine, ExecutionOutcome, FunctionBuilder, FunctionId,
    Module, Op, RuntimeFault,
};

// Re-export FFI types for C bindings
pub use ffi::*;
