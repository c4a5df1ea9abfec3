//! Protocol error types.

use thiserror::Error;

/// Errors raised while encoding or decoding shared types.
#[derive(Debug, Error)]
pub enum Error {
    /// Serialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Deserialization failed.
    #[error("deserialization error: {0}")]
    Deserialization(String),

    /// Operation name not recognised.
    #[error("unknown operation: {0}")]
    UnknownOperation(String),

    /// Bindings document could not be parsed.
    #[error("invalid bindings document: {0}")]
    InvalidBindings(String),
}
