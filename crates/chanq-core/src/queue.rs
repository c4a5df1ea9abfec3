//! Durable per-channel notification queue.
//!
//! Each channel owns a sled tree of change records keyed by a big-endian
//! sequence number, so scans return records in enqueue order.
//!
//! ```text
//! Producer:
//!   enqueue(record) → resolve channel → queue:<channel>.insert(seq, record)
//!
//! Dispatcher:
//!   dequeue_batch() → [try_acquire()] → callback → acknowledge()
//! ```

use std::sync::Arc;

use sled::transaction::{ConflictableTransactionError, TransactionError};
use sled::Transactional;

use chanq_proto::{current_timestamp, ChangeRecord, ChannelBinding};

use crate::error::Error;
use crate::lease::{LeaseEntry, LeaseToken};
use crate::registry::BindingRegistry;
use crate::store::{decode_seq, encode_seq, NotificationStore};

/// A change record together with its position in a channel's queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedRecord {
    /// Sequence number, unique within the store.
    pub seq: u64,
    /// Channel the record is queued on.
    pub channel: String,
    /// The change itself.
    pub record: ChangeRecord,
}

/// Which records a batch may include.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VisibilityMode {
    /// Skip records carrying a live lease. Used by locked channels.
    SkipLeased,
    /// Include every queued record. Used by unlocked channels.
    All,
}

impl VisibilityMode {
    /// The mode matching a binding's lock policy.
    pub fn for_binding(binding: &ChannelBinding) -> Self {
        if binding.lock_required {
            VisibilityMode::SkipLeased
        } else {
            VisibilityMode::All
        }
    }
}

/// Point-in-time counts for one channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Records awaiting acknowledgement.
    pub queued: usize,
    /// Records under a live lease.
    pub leased: usize,
    /// Leases past their expiry that have not been reclaimed yet.
    pub expired_leases: usize,
}

impl QueueStats {
    /// Records a consumer could claim right now.
    pub fn available(&self) -> usize {
        self.queued.saturating_sub(self.leased)
    }
}

/// Appends change records and hands them out to dispatchers.
pub struct NotificationQueue {
    store: Arc<NotificationStore>,
    registry: Arc<BindingRegistry>,
}

impl NotificationQueue {
    /// Create a queue over a store.
    pub fn new(store: Arc<NotificationStore>, registry: Arc<BindingRegistry>) -> Self {
        Self { store, registry }
    }

    /// Bindings this queue routes by.
    pub fn registry(&self) -> &BindingRegistry {
        &self.registry
    }

    /// Append a record to its entity's channel and return its sequence number.
    ///
    /// A single tree insert; the producer never waits on consumers.
    pub fn enqueue(&self, record: ChangeRecord) -> Result<u64, Error> {
        let binding = self.registry.resolve(&record.entity_type)?;
        let trees = self.store.channel_trees(&binding.name)?;

        let seq = self.store.next_id()?;
        let value = record.to_bytes()?;
        trees.queue.insert(encode_seq(seq), value)?;

        tracing::trace!(
            channel = %binding.name,
            seq,
            entity_type = %record.entity_type,
            primary_key = %record.primary_key,
            operation = %record.operation,
            "record enqueued"
        );

        Ok(seq)
    }

    /// Lazily read up to `max_items` records from a channel, oldest first.
    ///
    /// With [`VisibilityMode::SkipLeased`] records under a live lease are
    /// passed over. The batch is a snapshot hint, not a claim: locked
    /// channels must still win `try_acquire` before processing.
    pub fn dequeue_batch(
        &self,
        channel: &str,
        max_items: usize,
        visibility: VisibilityMode,
    ) -> Result<impl Iterator<Item = Result<QueuedRecord, Error>>, Error> {
        self.dequeue_batch_from(channel, 0, max_items, visibility)
    }

    /// [`dequeue_batch`](Self::dequeue_batch) starting at sequence number
    /// `from_seq` instead of the head of the queue.
    ///
    /// Dispatchers resume from just past the last record they handled, so
    /// records that keep failing at the head do not hide the ones behind
    /// them.
    pub fn dequeue_batch_from(
        &self,
        channel: &str,
        from_seq: u64,
        max_items: usize,
        visibility: VisibilityMode,
    ) -> Result<impl Iterator<Item = Result<QueuedRecord, Error>>, Error> {
        let binding = self.registry.channel(channel)?;
        let trees = self.store.channel_trees(&binding.name)?;
        let channel = binding.name.clone();
        let leases = trees.leases.clone();
        let now = current_timestamp();

        let iter = trees
            .queue
            .range(encode_seq(from_seq)..)
            .map(move |item| -> Result<Option<QueuedRecord>, Error> {
                let (key, value) = item?;
                if visibility == VisibilityMode::SkipLeased {
                    if let Some(lease) = leases.get(&key)? {
                        if LeaseEntry::from_bytes(&lease)?.is_live(now) {
                            return Ok(None);
                        }
                    }
                }
                Ok(Some(QueuedRecord {
                    seq: decode_seq(&key)?,
                    channel: channel.clone(),
                    record: ChangeRecord::from_bytes(&value)?,
                }))
            })
            .filter_map(Result::transpose)
            .take(max_items);

        Ok(iter)
    }

    /// Remove a processed record.
    ///
    /// Without a lease the record is removed unconditionally; removing an
    /// already acknowledged record is a no-op. With a lease, the record and
    /// the lease are removed together, and only while the lease is still
    /// held by `lease`; otherwise [`Error::LeaseExpired`] is returned and
    /// the record stays for its current holder.
    ///
    /// Returns whether a record was removed.
    pub fn acknowledge(
        &self,
        channel: &str,
        seq: u64,
        lease: Option<&LeaseToken>,
    ) -> Result<bool, Error> {
        let binding = self.registry.channel(channel)?;
        let trees = self.store.channel_trees(&binding.name)?;
        let key = encode_seq(seq);

        let Some(token) = lease else {
            let removed = trees.queue.remove(key)?.is_some();
            tracing::trace!(channel = %binding.name, seq, removed, "record acknowledged");
            return Ok(removed);
        };

        let result: Result<Ack, TransactionError<Error>> =
            (&trees.queue, &trees.leases).transaction(|(queue_tx, lease_tx)| {
                let held = match lease_tx.get(key)? {
                    Some(current) => token
                        .matches(&current)
                        .map_err(ConflictableTransactionError::Abort)?,
                    None => false,
                };
                if !held {
                    return Ok(if queue_tx.get(key)?.is_some() {
                        Ack::LeaseLost
                    } else {
                        Ack::Missing
                    });
                }
                lease_tx.remove(&key[..])?;
                queue_tx.remove(&key[..])?;
                Ok(Ack::Removed)
            });

        match result {
            Ok(Ack::Removed) => {
                tracing::trace!(channel = %binding.name, seq, holder = %token.holder, "record acknowledged");
                Ok(true)
            }
            Ok(Ack::Missing) => Ok(false),
            Ok(Ack::LeaseLost) => Err(Error::LeaseExpired {
                channel: binding.name.clone(),
                seq,
            }),
            Err(TransactionError::Abort(e)) => Err(e),
            Err(TransactionError::Storage(e)) => Err(Error::Storage(e)),
        }
    }

    /// Fetch a queued record by sequence number.
    pub fn get(&self, channel: &str, seq: u64) -> Result<Option<QueuedRecord>, Error> {
        let binding = self.registry.channel(channel)?;
        let trees = self.store.channel_trees(&binding.name)?;

        match trees.queue.get(encode_seq(seq))? {
            Some(value) => Ok(Some(QueuedRecord {
                seq,
                channel: binding.name.clone(),
                record: ChangeRecord::from_bytes(&value)?,
            })),
            None => Ok(None),
        }
    }

    /// Number of records queued on a channel.
    pub fn len(&self, channel: &str) -> Result<usize, Error> {
        let binding = self.registry.channel(channel)?;
        Ok(self.store.channel_trees(&binding.name)?.queue.len())
    }

    /// Whether a channel has no queued records.
    pub fn is_empty(&self, channel: &str) -> Result<bool, Error> {
        Ok(self.len(channel)? == 0)
    }

    /// Queue and lease counts for a channel.
    pub fn stats(&self, channel: &str) -> Result<QueueStats, Error> {
        self.stats_at(channel, current_timestamp())
    }

    /// [`stats`](Self::stats) with an explicit clock reading.
    pub fn stats_at(&self, channel: &str, now: u64) -> Result<QueueStats, Error> {
        let binding = self.registry.channel(channel)?;
        let trees = self.store.channel_trees(&binding.name)?;

        let mut stats = QueueStats {
            queued: trees.queue.len(),
            ..Default::default()
        };
        for item in trees.leases.iter() {
            let (_, value) = item?;
            if LeaseEntry::from_bytes(&value)?.is_live(now) {
                stats.leased += 1;
            } else {
                stats.expired_leases += 1;
            }
        }

        Ok(stats)
    }

    /// Flush pending writes to disk.
    pub fn flush(&self) -> Result<(), Error> {
        self.store.flush()?;
        Ok(())
    }
}

enum Ack {
    Removed,
    Missing,
    LeaseLost,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LeaseConfig;
    use crate::lease::LockCoordinator;
    use chanq_proto::Operation;

    fn setup() -> (NotificationQueue, LockCoordinator) {
        let store = Arc::new(NotificationStore::temporary().unwrap());
        let mut builder = BindingRegistry::builder();
        builder
            .register("nix_evaluation_channel", "NixEvaluation", true)
            .unwrap()
            .register("nix_derivation_channel", "NixDerivation", false)
            .unwrap();
        let registry = Arc::new(builder.build());

        (
            NotificationQueue::new(store.clone(), registry.clone()),
            LockCoordinator::new(store, registry, LeaseConfig::default()),
        )
    }

    fn collect(
        queue: &NotificationQueue,
        channel: &str,
        max: usize,
        mode: VisibilityMode,
    ) -> Vec<QueuedRecord> {
        queue
            .dequeue_batch(channel, max, mode)
            .unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap()
    }

    #[test]
    fn test_enqueue_routes_by_entity_type() {
        let (queue, _) = setup();

        queue
            .enqueue(ChangeRecord::new("NixEvaluation", "1", Operation::Insert))
            .unwrap();
        queue
            .enqueue(ChangeRecord::new("NixDerivation", "2", Operation::Update))
            .unwrap();
        queue
            .enqueue(ChangeRecord::new("NixDerivation", "3", Operation::Delete))
            .unwrap();

        assert_eq!(queue.len("nix_evaluation_channel").unwrap(), 1);
        assert_eq!(queue.len("nix_derivation_channel").unwrap(), 2);
    }

    #[test]
    fn test_enqueue_unknown_entity_fails() {
        let (queue, _) = setup();
        let err = queue
            .enqueue(ChangeRecord::new("User", "1", Operation::Insert))
            .unwrap_err();
        assert!(matches!(err, Error::UnknownEntity(_)));
    }

    #[test]
    fn test_batch_preserves_order_and_limit() {
        let (queue, _) = setup();
        for pk in ["a", "b", "c", "d"] {
            queue
                .enqueue(ChangeRecord::new("NixDerivation", pk, Operation::Insert))
                .unwrap();
        }

        let batch = collect(&queue, "nix_derivation_channel", 3, VisibilityMode::All);
        let keys: Vec<&str> = batch.iter().map(|r| r.record.primary_key.as_str()).collect();
        assert_eq!(keys, vec!["a", "b", "c"]);
        assert!(batch.windows(2).all(|w| w[0].seq < w[1].seq));
    }

    #[test]
    fn test_batch_from_resumes_mid_queue() {
        let (queue, _) = setup();
        let mut seqs = Vec::new();
        for pk in ["a", "b", "c"] {
            seqs.push(
                queue
                    .enqueue(ChangeRecord::new("NixDerivation", pk, Operation::Insert))
                    .unwrap(),
            );
        }

        let rest: Vec<String> = queue
            .dequeue_batch_from("nix_derivation_channel", seqs[0] + 1, 10, VisibilityMode::All)
            .unwrap()
            .map(|r| r.unwrap().record.primary_key)
            .collect();
        assert_eq!(rest, vec!["b", "c"]);

        assert_eq!(
            queue
                .dequeue_batch_from("nix_derivation_channel", seqs[2] + 1, 10, VisibilityMode::All)
                .unwrap()
                .count(),
            0
        );
    }

    #[test]
    fn test_skip_leased_hides_live_leases() {
        let (queue, locks) = setup();
        for pk in ["1", "2"] {
            queue
                .enqueue(ChangeRecord::new("NixEvaluation", pk, Operation::Insert))
                .unwrap();
        }

        let first = collect(&queue, "nix_evaluation_channel", 1, VisibilityMode::SkipLeased)
            .pop()
            .unwrap();
        locks.try_acquire(&first, "worker-a").unwrap().unwrap();

        let visible = collect(&queue, "nix_evaluation_channel", 10, VisibilityMode::SkipLeased);
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].record.primary_key, "2");

        let all = collect(&queue, "nix_evaluation_channel", 10, VisibilityMode::All);
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn test_unlocked_acknowledge_is_idempotent() {
        let (queue, _) = setup();
        let seq = queue
            .enqueue(ChangeRecord::new("NixDerivation", "x", Operation::Insert))
            .unwrap();

        assert!(queue.acknowledge("nix_derivation_channel", seq, None).unwrap());
        assert!(!queue.acknowledge("nix_derivation_channel", seq, None).unwrap());
        assert!(queue.is_empty("nix_derivation_channel").unwrap());
    }

    #[test]
    fn test_locked_acknowledge_removes_record_and_lease() {
        let (queue, locks) = setup();
        let seq = queue
            .enqueue(ChangeRecord::new("NixEvaluation", "9", Operation::Update))
            .unwrap();
        let record = queue.get("nix_evaluation_channel", seq).unwrap().unwrap();
        let token = locks.try_acquire(&record, "worker-a").unwrap().unwrap();

        assert!(queue
            .acknowledge("nix_evaluation_channel", seq, Some(&token))
            .unwrap());

        let stats = queue.stats("nix_evaluation_channel").unwrap();
        assert_eq!(stats, QueueStats::default());
    }

    #[test]
    fn test_acknowledge_with_lost_lease_keeps_record() {
        let (queue, locks) = setup();
        let seq = queue
            .enqueue(ChangeRecord::new("NixEvaluation", "9", Operation::Update))
            .unwrap();
        let record = queue.get("nix_evaluation_channel", seq).unwrap().unwrap();

        let stale = locks.try_acquire_at(&record, "worker-a", 0).unwrap().unwrap();
        let far_future = stale.expires_at + 1;
        let fresh = locks.try_acquire_at(&record, "worker-b", far_future).unwrap().unwrap();

        let err = queue
            .acknowledge("nix_evaluation_channel", seq, Some(&stale))
            .unwrap_err();
        assert!(matches!(err, Error::LeaseExpired { .. }));
        assert_eq!(queue.len("nix_evaluation_channel").unwrap(), 1);

        assert!(queue
            .acknowledge("nix_evaluation_channel", seq, Some(&fresh))
            .unwrap());
    }

    #[test]
    fn test_stats_split_live_and_expired() {
        let (queue, locks) = setup();
        let mut records = Vec::new();
        for pk in ["1", "2", "3"] {
            let seq = queue
                .enqueue(ChangeRecord::new("NixEvaluation", pk, Operation::Insert))
                .unwrap();
            records.push(queue.get("nix_evaluation_channel", seq).unwrap().unwrap());
        }

        let live = locks.try_acquire_at(&records[0], "a", 1_000).unwrap().unwrap();
        locks.try_acquire_at(&records[1], "b", 0).unwrap().unwrap();

        let stats = queue.stats_at("nix_evaluation_channel", live.expires_at - 1).unwrap();
        assert_eq!(stats.queued, 3);
        assert_eq!(stats.leased, 1);
        assert_eq!(stats.expired_leases, 1);
        assert_eq!(stats.available(), 2);
    }

    #[test]
    fn test_records_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let config = crate::config::StoreConfig::new(dir.path());
        let registry = Arc::new(
            BindingRegistry::from_bindings([ChannelBinding::new("nix_derivation_channel", "NixDerivation")])
                .unwrap(),
        );

        let seq = {
            let store = Arc::new(NotificationStore::open(&config).unwrap());
            let queue = NotificationQueue::new(store, registry.clone());
            let seq = queue
                .enqueue(ChangeRecord::insert("NixDerivation", "hello", r#"{"name":"hello"}"#))
                .unwrap();
            queue.flush().unwrap();
            seq
        };

        let store = Arc::new(NotificationStore::open(&config).unwrap());
        let queue = NotificationQueue::new(store, registry);
        let record = queue.get("nix_derivation_channel", seq).unwrap().unwrap();
        assert_eq!(record.record.new.as_deref(), Some(r#"{"name":"hello"}"#));

        let next = queue
            .enqueue(ChangeRecord::new("NixDerivation", "again", Operation::Update))
            .unwrap();
        assert!(next > seq);
    }
}
