//! chanq Server library.
//!
//! Async runtime for chanq channels: dispatchers that deliver queued change
//! records to registered handlers, the in-process producer hook and the
//! lease reaper.

pub mod backoff;
pub mod config;
pub mod consumer;
pub mod dispatcher;
pub mod error;
pub mod producer;
pub mod reaper;
pub mod service;
pub mod sinks;
pub mod wakeup;

pub use config::{Args, DispatchConfig, ServerConfig, SinkKind};
pub use consumer::{handler_fn, ConsumerRegistry, FnHandler, NotificationHandler};
pub use dispatcher::{DispatchStats, DispatchStatsSnapshot, Dispatcher, DispatcherState, PollOutcome};
pub use error::{Error, HandlerError};
pub use producer::ChangeProducer;
pub use reaper::LeaseReaper;
pub use service::{DispatcherStatus, NotificationService, ServiceHandle, ServiceStats};
pub use sinks::{JsonLinesSink, LogSink};
pub use wakeup::Wakeups;
