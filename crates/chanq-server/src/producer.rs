//! Producer hook: enqueue change records and wake local dispatchers.

use std::sync::Arc;

use chanq_core::NotificationQueue;
use chanq_proto::{ChangeRecord, Operation};

use crate::error::Error;
use crate::wakeup::Wakeups;

/// Entry point for code that changes bound entities.
///
/// Cloning is cheap; every clone writes to the same queue.
#[derive(Clone)]
pub struct ChangeProducer {
    queue: Arc<NotificationQueue>,
    wakeups: Arc<Wakeups>,
}

impl ChangeProducer {
    /// Create a producer over a queue.
    pub fn new(queue: Arc<NotificationQueue>, wakeups: Arc<Wakeups>) -> Self {
        Self { queue, wakeups }
    }

    /// Record a change without row images.
    pub fn notify(
        &self,
        entity_type: &str,
        primary_key: impl Into<String>,
        operation: Operation,
    ) -> Result<u64, Error> {
        self.notify_record(ChangeRecord::new(entity_type, primary_key, operation))
    }

    /// Enqueue a complete change record on its entity's channel.
    ///
    /// Returns the record's sequence number.
    pub fn notify_record(&self, record: ChangeRecord) -> Result<u64, Error> {
        let channel = self.queue.registry().resolve(&record.entity_type)?.name.clone();
        let seq = self.queue.enqueue(record)?;
        self.wakeups.wake(&channel);
        Ok(seq)
    }

    /// Record an insert carrying the new row image.
    pub fn insert(
        &self,
        entity_type: &str,
        primary_key: impl Into<String>,
        new: impl Into<String>,
    ) -> Result<u64, Error> {
        self.notify_record(ChangeRecord::insert(entity_type, primary_key, new))
    }

    /// Record an update carrying both row images.
    pub fn update(
        &self,
        entity_type: &str,
        primary_key: impl Into<String>,
        old: impl Into<String>,
        new: impl Into<String>,
    ) -> Result<u64, Error> {
        self.notify_record(ChangeRecord::update(entity_type, primary_key, old, new))
    }

    /// Record a delete carrying the old row image.
    pub fn delete(
        &self,
        entity_type: &str,
        primary_key: impl Into<String>,
        old: impl Into<String>,
    ) -> Result<u64, Error> {
        self.notify_record(ChangeRecord::delete(entity_type, primary_key, old))
    }

    /// The underlying queue.
    pub fn queue(&self) -> &Arc<NotificationQueue> {
        &self.queue
    }
}
