//! Change record types.

use std::fmt;
use std::str::FromStr;

use rkyv::{Archive, Deserialize, Serialize};
use serde::{Deserialize as SerdeDeserialize, Serialize as SerdeSerialize};

use crate::error::Error;

/// Kind of mutation a change record describes.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Archive, Serialize, Deserialize, SerdeSerialize, SerdeDeserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    /// A new row was inserted.
    Insert,
    /// An existing row was updated.
    Update,
    /// A row was deleted.
    Delete,
}

impl Operation {
    /// Lowercase name used in logs and on the command line.
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Insert => "insert",
            Operation::Update => "update",
            Operation::Delete => "delete",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "insert" => Ok(Operation::Insert),
            "update" => Ok(Operation::Update),
            "delete" => Ok(Operation::Delete),
            other => Err(Error::UnknownOperation(other.to_string())),
        }
    }
}

/// One committed mutation of a tracked entity.
///
/// Records are created by the producer at commit time and are never
/// mutated afterwards. The optional `old` and `new` fields carry JSON
/// images of the row before and after the mutation.
#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize, SerdeSerialize, SerdeDeserialize)]
pub struct ChangeRecord {
    /// Entity type the mutated row belongs to (e.g. "NixEvaluation").
    pub entity_type: String,
    /// Primary key of the mutated row, rendered as text.
    pub primary_key: String,
    /// Kind of mutation.
    pub operation: Operation,
    /// Commit timestamp in microseconds since the Unix epoch.
    pub timestamp: u64,
    /// Row image before the mutation. None for inserts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old: Option<String>,
    /// Row image after the mutation. None for deletes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new: Option<String>,
}

impl ChangeRecord {
    /// Create a record without row images, stamped with the current time.
    pub fn new(
        entity_type: impl Into<String>,
        primary_key: impl Into<String>,
        operation: Operation,
    ) -> Self {
        Self {
            entity_type: entity_type.into(),
            primary_key: primary_key.into(),
            operation,
            timestamp: current_timestamp(),
            old: None,
            new: None,
        }
    }

    /// Record for an inserted row.
    pub fn insert(
        entity_type: impl Into<String>,
        primary_key: impl Into<String>,
        new: impl Into<String>,
    ) -> Self {
        Self::new(entity_type, primary_key, Operation::Insert).with_new(new)
    }

    /// Record for an updated row.
    pub fn update(
        entity_type: impl Into<String>,
        primary_key: impl Into<String>,
        old: impl Into<String>,
        new: impl Into<String>,
    ) -> Self {
        Self::new(entity_type, primary_key, Operation::Update)
            .with_old(old)
            .with_new(new)
    }

    /// Record for a deleted row.
    pub fn delete(
        entity_type: impl Into<String>,
        primary_key: impl Into<String>,
        old: impl Into<String>,
    ) -> Self {
        Self::new(entity_type, primary_key, Operation::Delete).with_old(old)
    }

    /// Attach the row image before the mutation.
    pub fn with_old(mut self, old: impl Into<String>) -> Self {
        self.old = Some(old.into());
        self
    }

    /// Attach the row image after the mutation.
    pub fn with_new(mut self, new: impl Into<String>) -> Self {
        self.new = Some(new.into());
        self
    }

    /// Override the commit timestamp.
    pub fn with_timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Serialize the record using rkyv.
    pub fn to_bytes(&self) -> Result<Vec<u8>, Error> {
        rkyv::to_bytes::<rkyv::rancor::Error>(self)
            .map(|v| v.to_vec())
            .map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Deserialize a record from rkyv bytes.
    ///
    /// The input is copied into an aligned buffer first; values read back
    /// from the store carry no alignment guarantee.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        let mut aligned = rkyv::util::AlignedVec::<16>::with_capacity(bytes.len());
        aligned.extend_from_slice(bytes);
        rkyv::from_bytes::<Self, rkyv::rancor::Error>(&aligned)
            .map_err(|e| Error::Deserialization(e.to_string()))
    }
}

/// Current time in microseconds since the Unix epoch.
pub fn current_timestamp() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}
