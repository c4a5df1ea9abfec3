//! Server error types.

use thiserror::Error;

/// Server errors.
#[derive(Debug, Error)]
pub enum Error {
    /// Queue, lease or binding error.
    #[error("core error: {0}")]
    Core(#[from] chanq_core::Error),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// A background task could not be joined.
    #[error("task error: {0}")]
    Join(#[from] tokio::task::JoinError),

    /// JSON encoding error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Error returned by a notification callback.
///
/// Callback failures leave the record queued for another attempt; they never
/// stop the dispatcher.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// The callback reported a failure.
    #[error("handler failed: {0}")]
    Failed(String),

    /// The callback panicked.
    #[error("handler panicked: {0}")]
    Panicked(String),
}

impl HandlerError {
    /// Create a failure with a message.
    pub fn new(message: impl Into<String>) -> Self {
        HandlerError::Failed(message.into())
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        HandlerError::Failed(message)
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        HandlerError::Failed(message.to_string())
    }
}
