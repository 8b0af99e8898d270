//! C FFI for embedding cadence
//!
//! This module provides a C-compatible API over the engine and its
//! contexts. All public functions use `extern "C"` ABI; the header is
//! generated into `include/cadence.h` at build time.
//!
//! # Safety
//!
//! All FFI functions that take raw pointers require:
//! - Non-null pointers (unless documented otherwise)
//! - Engines created by `cadence_engine_new()` and contexts created by
//!   `cadence_context_new()`
//! - No concurrent use of one context, except `cadence_context_suspend` and
//!   `cadence_context_abort`

mod call;
mod context;
mod engine;
mod types;

// Re-export all FFI types and functions for public use
#[allow(unused_imports)]
pub use call::*;
#[allow(unused_imports)]
pub use context::*;
#[allow(unused_imports)]
pub use engine::*;
#[allow(unused_imports)]
pub use types::*;

/// Version information
pub const CADENCE_VERSION_MAJOR: u32 = 0;
pub const CADENCE_VERSION_MINOR: u32 = 1;
pub const CADENCE_VERSION_PATCH: u32 = 0;

/// Get the version string
#[unsafe(no_mangle)]
pub extern "C" fn cadence_version() -> *const std::ffi::c_char {
    static VERSION: &[u8] = b"0.1.0\0";
    VERSION.as_ptr() as *const std::ffi::c_char
}
