//! In-process wakeups from producers to idle dispatchers.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Notify;

/// Per-channel wakeup signals.
///
/// Dispatchers waiting on an empty channel park on the channel's [`Notify`];
/// producers signal it after every enqueue. Signals are hints only: a
/// dispatcher that misses one still polls again after its poll interval.
#[derive(Default)]
pub struct Wakeups {
    channels: DashMap<String, Arc<Notify>>,
}

impl Wakeups {
    /// Create an empty set of signals.
    pub fn new() -> Self {
        Self::default()
    }

    /// The signal for a channel, created on first use.
    pub fn channel(&self, channel: &str) -> Arc<Notify> {
        if let Some(notify) = self.channels.get(channel) {
            return notify.clone();
        }
        self.channels
            .entry(channel.to_string())
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone()
    }

    /// Wake every dispatcher parked on a channel.
    pub fn wake(&self, channel: &str) {
        if let Some(notify) = self.channels.get(channel) {
            notify.notify_waiters();
        }
    }
}
