//! chanq shared types.
//!
//! This crate defines the data exchanged between producers, the queue and
//! consumers.
//!
//! # Modules
//!
//! - [`record`] - Change records and mutation kinds
//! - [`binding`] - Channel binding declarations and the bindings document
//! - [`error`] - Encoding error types
//!
//! # Serialization
//!
//! [`ChangeRecord`] derives `rkyv::Archive` for storage and serde for the
//! JSON surfaces (bindings file, CLI output).

pub mod binding;
pub mod error;
pub mod record;

pub use error::Error;

pub use binding::{BindingsDocument, ChannelBinding};
pub use record::{current_timestamp, ChangeRecord, Operation};
