// src/engine/common.rs
//
// Common utilities shared across engine modules.
// Provides unified error handling and type aliases.

use crate::error::ViewerError;
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};

/// Result type used throughout the engine.
pub type EngineResult<T> = std::result::Result<T, ViewerError>;

/// Turn a panic payload into a readable message.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Run third-party codec code so that a panic inside it becomes an
/// `InternalPanic` error instead of unwinding through the worker thread.
pub fn run_with_panic_policy<T, F>(stage: &'static str, f: F) -> EngineResult<T>
where
    F: FnOnce() -> EngineResult<T>,
{
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            tracing::error!(stage, %message, "codec panicked");
            Err(ViewerError::internal_panic(format!("{stage}: {message}")))
        }
    }
}
