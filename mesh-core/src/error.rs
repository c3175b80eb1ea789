//! Error types shared across the core substrate.

use thiserror::Error;

/// Error returned by an event handler.
///
/// Handler failures are local and non-fatal: the bus logs them per handler
/// and continues delivery to the remaining subscribers. They never
/// propagate to the emitter.
#[derive(Debug, Error)]
#[error("handler failed: {0}")]
pub struct HandlerError(pub String);

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self(message)
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self(message.to_string())
    }
}
