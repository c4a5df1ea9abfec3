//! chanq Core - binding registry, durable queue and lease coordination.
//!
//! This crate provides the synchronous engine behind chanq channels. The
//! async dispatch layer lives in `chanq-server`.

#[cfg(feature = "mimalloc")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

pub mod config;
pub mod error;
pub mod lease;
pub mod queue;
pub mod registry;
pub mod store;

pub use config::{LeaseConfig, StoreConfig};
pub use error::Error;
pub use lease::{LeaseToken, LockCoordinator, ReclaimReport};
pub use queue::{NotificationQueue, QueueStats, QueuedRecord, VisibilityMode};
pub use registry::{BindingRegistry, RegistryBuilder};
pub use store::NotificationStore;

/// Re-export shared types.
pub use chanq_proto as proto;
