//! Error types for the permission engine.
//!
//! Only malformed mutations surface as errors. Denied checks are
//! structured results, unknown ids are logged no-ops, and persistence
//! failures degrade to non-durable in-memory state.

use thiserror::Error;

/// Errors raised synchronously by mutating engine APIs.
#[derive(Debug, Error)]
pub enum PermissionError {
    /// A grant or request failed schema validation.
    #[error("Validation failed: {0}")]
    Validation(String),
}
