//! Durable store backing the queues and leases.

use dashmap::DashMap;
use sled::{Db, Tree};

use crate::config::StoreConfig;
use crate::error::Error;

/// Tree name prefix for per-channel queues.
const QUEUE_TREE_PREFIX: &str = "queue:";

/// Tree name prefix for per-channel leases.
const LEASE_TREE_PREFIX: &str = "lease:";

/// Size of an encoded sequence number.
pub const SEQ_SIZE: usize = 8;

/// The pair of trees belonging to one channel.
///
/// Both trees are keyed by the record's sequence number, so a lease and the
/// record it covers share a key.
#[derive(Clone)]
pub struct ChannelTrees {
    /// Queued records (seq -> ChangeRecord).
    pub(crate) queue: Tree,
    /// Live and expired leases (seq -> lease entry).
    pub(crate) leases: Tree,
}

/// Shared sled database holding every channel's queue and lease trees.
pub struct NotificationStore {
    db: Db,
    trees: DashMap<String, ChannelTrees>,
}

impl NotificationStore {
    /// Open or create a store with the given configuration.
    pub fn open(config: &StoreConfig) -> Result<Self, Error> {
        let db = config.to_sled_config().open()?;
        tracing::debug!(
            path = %config.path.display(),
            temporary = config.temporary,
            recovered = db.was_recovered(),
            "notification store opened"
        );

        Ok(Self {
            db,
            trees: DashMap::new(),
        })
    }

    /// Open a throwaway store, removed when dropped.
    pub fn temporary() -> Result<Self, Error> {
        Self::open(&StoreConfig::temporary())
    }

    /// Check if the store was recovered from a previous run.
    pub fn was_recovered(&self) -> bool {
        self.db.was_recovered()
    }

    /// Trees for a channel, opened on first use.
    pub(crate) fn channel_trees(&self, channel: &str) -> Result<ChannelTrees, Error> {
        if let Some(trees) = self.trees.get(channel) {
            return Ok(trees.clone());
        }

        let trees = ChannelTrees {
            queue: self.db.open_tree(format!("{QUEUE_TREE_PREFIX}{channel}"))?,
            leases: self.db.open_tree(format!("{LEASE_TREE_PREFIX}{channel}"))?,
        };
        self.trees.insert(channel.to_string(), trees.clone());
        Ok(trees)
    }

    /// Allocate the next identifier.
    ///
    /// Identifiers increase monotonically across restarts and are shared by
    /// record sequence numbers and lease tokens.
    pub(crate) fn next_id(&self) -> Result<u64, Error> {
        Ok(self.db.generate_id()?)
    }

    /// Flush all pending writes to disk.
    pub fn flush(&self) -> Result<usize, Error> {
        Ok(self.db.flush()?)
    }
}

/// Encode a sequence number as a tree key.
///
/// Big-endian so that key order matches enqueue order.
pub(crate) fn encode_seq(seq: u64) -> [u8; SEQ_SIZE] {
    seq.to_be_bytes()
}

/// Decode a tree key back to a sequence number.
pub(crate) fn decode_seq(bytes: &[u8]) -> Result<u64, Error> {
    let bytes: [u8; SEQ_SIZE] = bytes.try_into().map_err(|_| Error::InvalidKey)?;
    Ok(u64::from_be_bytes(bytes))
}
