//! Core error types.

use thiserror::Error;

/// Core errors.
#[derive(Debug, Error)]
pub enum Error {
    /// Storage layer error. Treated as transient by dispatchers.
    #[error("storage error: {0}")]
    Storage(#[from] sled::Error),

    /// Record encoding error.
    #[error("protocol error: {0}")]
    Protocol(#[from] chanq_proto::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Deserialization error.
    #[error("deserialization error: {0}")]
    Deserialization(String),

    /// Key decoding error.
    #[error("invalid key format")]
    InvalidKey,

    /// A binding conflicts with one already registered.
    #[error("binding {name} -> {entity_type} conflicts with existing binding {existing}")]
    DuplicateBinding {
        name: String,
        entity_type: String,
        existing: String,
    },

    /// No binding exists for the entity type.
    #[error("no channel bound to entity type {0}")]
    UnknownEntity(String),

    /// No binding exists with the channel name.
    #[error("unknown channel {0}")]
    UnknownChannel(String),

    /// Binding declaration is malformed.
    #[error("invalid binding: {0}")]
    InvalidBinding(String),

    /// The lease on a record expired and is no longer held by this token.
    #[error("lease on {channel}#{seq} expired")]
    LeaseExpired { channel: String, seq: u64 },

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether retrying the same operation later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Storage(_))
    }

    /// Whether the error comes from the binding declarations. These abort startup.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Error::DuplicateBinding { .. }
                | Error::UnknownEntity(_)
                | Error::UnknownChannel(_)
                | Error::InvalidBinding(_)
                | Error::Config(_)
        )
    }
}
