//! Lease coordination for locked channels.
//!
//! A consumer claims a record by writing a lease entry under the record's
//! sequence number. The claim runs as a sled transaction over the channel's
//! queue and lease trees, so concurrent consumers each see either the
//! record unclaimed or claimed, never both. Consumers that lose the race
//! move on to the next record instead of waiting (skip-locked).
//!
//! Leases expire after [`LeaseConfig::lease_timeout`]. An expired lease may
//! be taken over by the next claimant, and the periodic reclaim sweep
//! removes the ones nobody picked up.

use std::sync::Arc;

use rkyv::{Archive, Deserialize, Serialize};
use sled::transaction::{ConflictableTransactionError, TransactionError};
use sled::Transactional;

use chanq_proto::current_timestamp;

use crate::config::LeaseConfig;
use crate::error::Error;
use crate::queue::QueuedRecord;
use crate::registry::BindingRegistry;
use crate::store::{decode_seq, encode_seq, NotificationStore};

/// Lease entry as persisted in a channel's lease tree.
#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
pub(crate) struct LeaseEntry {
    pub token_id: u64,
    pub holder: String,
    pub acquired_at: u64,
    pub expires_at: u64,
}

impl LeaseEntry {
    /// A lease is live strictly before its expiry instant.
    pub fn is_live(&self, now: u64) -> bool {
        now < self.expires_at
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, Error> {
        rkyv::to_bytes::<rkyv::rancor::Error>(self)
            .map(|v| v.to_vec())
            .map_err(|e| Error::Serialization(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        let mut aligned = rkyv::util::AlignedVec::<16>::with_capacity(bytes.len());
        aligned.extend_from_slice(bytes);
        rkyv::from_bytes::<Self, rkyv::rancor::Error>(&aligned)
            .map_err(|e| Error::Deserialization(e.to_string()))
    }
}

/// Proof of an exclusive claim on one queued record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseToken {
    /// Channel the record is queued on.
    pub channel: String,
    /// Sequence number of the leased record.
    pub seq: u64,
    /// Identifier of the consumer holding the lease.
    pub holder: String,
    /// Unique id of this particular claim.
    pub token_id: u64,
    /// Acquisition time in microseconds since the Unix epoch.
    pub acquired_at: u64,
    /// Expiry time in microseconds since the Unix epoch.
    pub expires_at: u64,
}

impl LeaseToken {
    /// Whether the lease is still live at `now`.
    pub fn is_live(&self, now: u64) -> bool {
        now < self.expires_at
    }

    /// Whether the stored lease bytes belong to this token.
    pub(crate) fn matches(&self, stored: &[u8]) -> Result<bool, Error> {
        Ok(LeaseEntry::from_bytes(stored)?.token_id == self.token_id)
    }
}

/// Outcome of one reclaim sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReclaimReport {
    /// Locked channels visited.
    pub channels_scanned: usize,
    /// Expired leases removed; their records are available again.
    pub leases_reclaimed: usize,
    /// Leases removed because their record was already gone.
    pub orphans_removed: usize,
}

impl ReclaimReport {
    /// Whether the sweep removed anything.
    pub fn did_reclaim(&self) -> bool {
        self.leases_reclaimed > 0 || self.orphans_removed > 0
    }
}

enum Claim {
    Acquired,
    TookOver(String),
    Held(String),
    Gone,
}

/// Grants, releases and reclaims leases on queued records.
pub struct LockCoordinator {
    store: Arc<NotificationStore>,
    registry: Arc<BindingRegistry>,
    config: LeaseConfig,
}

impl LockCoordinator {
    /// Create a coordinator over a store.
    pub fn new(
        store: Arc<NotificationStore>,
        registry: Arc<BindingRegistry>,
        config: LeaseConfig,
    ) -> Self {
        Self {
            store,
            registry,
            config,
        }
    }

    /// Lease configuration in effect.
    pub fn config(&self) -> &LeaseConfig {
        &self.config
    }

    /// Try to claim a record for `holder`.
    ///
    /// Never blocks on other consumers. Returns `None` when the record is
    /// leased by someone else or has already been acknowledged.
    pub fn try_acquire(&self, record: &QueuedRecord, holder: &str) -> Result<Option<LeaseToken>, Error> {
        self.try_acquire_at(record, holder, current_timestamp())
    }

    /// [`try_acquire`](Self::try_acquire) with an explicit clock reading.
    pub fn try_acquire_at(
        &self,
        record: &QueuedRecord,
        holder: &str,
        now: u64,
    ) -> Result<Option<LeaseToken>, Error> {
        let binding = self.registry.channel(&record.channel)?;
        let trees = self.store.channel_trees(&binding.name)?;
        let key = encode_seq(record.seq);

        let entry = LeaseEntry {
            token_id: self.store.next_id()?,
            holder: holder.to_string(),
            acquired_at: now,
            expires_at: now.saturating_add(self.config.lease_timeout_micros()),
        };
        let entry_bytes = entry.to_bytes()?;

        let result: Result<Claim, TransactionError<Error>> =
            (&trees.queue, &trees.leases).transaction(|(queue_tx, lease_tx)| {
                if queue_tx.get(key)?.is_none() {
                    return Ok(Claim::Gone);
                }

                let mut claim = Claim::Acquired;
                if let Some(current) = lease_tx.get(key)? {
                    let current =
                        LeaseEntry::from_bytes(&current).map_err(ConflictableTransactionError::Abort)?;
                    if current.is_live(now) {
                        return Ok(Claim::Held(current.holder));
                    }
                    claim = Claim::TookOver(current.holder);
                }

                lease_tx.insert(&key[..], entry_bytes.as_slice())?;
                Ok(claim)
            });

        let claim = match result {
            Ok(claim) => claim,
            Err(TransactionError::Abort(e)) => return Err(e),
            Err(TransactionError::Storage(e)) => return Err(Error::Storage(e)),
        };

        let previous = match claim {
            Claim::Gone => {
                tracing::trace!(channel = %binding.name, seq = record.seq, "record already acknowledged");
                return Ok(None);
            }
            Claim::Held(owner) => {
                tracing::trace!(channel = %binding.name, seq = record.seq, owner = %owner, "record leased elsewhere, skipping");
                return Ok(None);
            }
            Claim::Acquired => None,
            Claim::TookOver(previous) => Some(previous),
        };

        if let Some(previous) = previous {
            tracing::debug!(
                channel = %binding.name,
                seq = record.seq,
                previous = %previous,
                holder,
                "took over expired lease"
            );
        }
        tracing::trace!(channel = %binding.name, seq = record.seq, holder, "lease acquired");

        Ok(Some(LeaseToken {
            channel: binding.name.clone(),
            seq: record.seq,
            holder: entry.holder,
            token_id: entry.token_id,
            acquired_at: entry.acquired_at,
            expires_at: entry.expires_at,
        }))
    }

    /// Give up a lease so another consumer can claim the record.
    ///
    /// Fails with [`Error::LeaseExpired`] if the lease expired and was
    /// taken over or reclaimed in the meantime.
    pub fn release(&self, token: &LeaseToken) -> Result<(), Error> {
        let trees = self.store.channel_trees(&token.channel)?;
        let key = encode_seq(token.seq);

        let result: Result<bool, TransactionError<Error>> = trees.leases.transaction(|lease_tx| {
            let held = match lease_tx.get(key)? {
                Some(current) => token
                    .matches(&current)
                    .map_err(ConflictableTransactionError::Abort)?,
                None => false,
            };
            if held {
                lease_tx.remove(&key[..])?;
            }
            Ok(held)
        });

        match result {
            Ok(true) => {
                tracing::trace!(channel = %token.channel, seq = token.seq, holder = %token.holder, "lease released");
                Ok(())
            }
            Ok(false) => Err(Error::LeaseExpired {
                channel: token.channel.clone(),
                seq: token.seq,
            }),
            Err(TransactionError::Abort(e)) => Err(e),
            Err(TransactionError::Storage(e)) => Err(Error::Storage(e)),
        }
    }

    /// Push a held lease's expiry one lease timeout past now.
    ///
    /// Succeeds as long as nobody else has taken the lease over, even if it
    /// has already expired. Fails with [`Error::LeaseExpired`] otherwise.
    pub fn renew(&self, token: &LeaseToken) -> Result<LeaseToken, Error> {
        self.renew_at(token, current_timestamp())
    }

    /// [`renew`](Self::renew) with an explicit clock reading.
    pub fn renew_at(&self, token: &LeaseToken, now: u64) -> Result<LeaseToken, Error> {
        let trees = self.store.channel_trees(&token.channel)?;
        let key = encode_seq(token.seq);
        let expires_at = now.saturating_add(self.config.lease_timeout_micros());
        let entry_bytes = LeaseEntry {
            token_id: token.token_id,
            holder: token.holder.clone(),
            acquired_at: token.acquired_at,
            expires_at,
        }
        .to_bytes()?;

        let result: Result<bool, TransactionError<Error>> = trees.leases.transaction(|lease_tx| {
            let held = match lease_tx.get(key)? {
                Some(current) => token
                    .matches(&current)
                    .map_err(ConflictableTransactionError::Abort)?,
                None => false,
            };
            if held {
                lease_tx.insert(&key[..], entry_bytes.as_slice())?;
            }
            Ok(held)
        });

        match result {
            Ok(true) => {
                tracing::trace!(channel = %token.channel, seq = token.seq, holder = %token.holder, expires_at, "lease renewed");
                Ok(LeaseToken {
                    expires_at,
                    ..token.clone()
                })
            }
            Ok(false) => Err(Error::LeaseExpired {
                channel: token.channel.clone(),
                seq: token.seq,
            }),
            Err(TransactionError::Abort(e)) => Err(e),
            Err(TransactionError::Storage(e)) => Err(Error::Storage(e)),
        }
    }

    /// The lease currently stored for a record, live or expired.
    pub fn lease(&self, channel: &str, seq: u64) -> Result<Option<LeaseToken>, Error> {
        let binding = self.registry.channel(channel)?;
        let trees = self.store.channel_trees(&binding.name)?;

        let Some(value) = trees.leases.get(encode_seq(seq))? else {
            return Ok(None);
        };
        let entry = LeaseEntry::from_bytes(&value)?;
        Ok(Some(LeaseToken {
            channel: binding.name.clone(),
            seq,
            holder: entry.holder,
            token_id: entry.token_id,
            acquired_at: entry.acquired_at,
            expires_at: entry.expires_at,
        }))
    }

    /// Remove expired leases on every locked channel.
    pub fn reclaim_expired(&self) -> Result<ReclaimReport, Error> {
        self.reclaim_expired_at(current_timestamp())
    }

    /// [`reclaim_expired`](Self::reclaim_expired) with an explicit clock reading.
    pub fn reclaim_expired_at(&self, now: u64) -> Result<ReclaimReport, Error> {
        let mut report = ReclaimReport::default();

        for binding in self.registry.locked_channels() {
            let trees = self.store.channel_trees(&binding.name)?;
            report.channels_scanned += 1;

            let mut stale = Vec::new();
            for item in trees.leases.iter() {
                let (key, value) = item?;
                let entry = LeaseEntry::from_bytes(&value)?;
                let orphan = !trees.queue.contains_key(&key)?;
                if orphan || !entry.is_live(now) {
                    stale.push((key, value, entry, orphan));
                }
            }

            for (key, observed, entry, orphan) in stale {
                // Only remove the lease we looked at; a concurrent takeover wins.
                let result: Result<bool, TransactionError<Error>> =
                    trees.leases.transaction(|lease_tx| match lease_tx.get(&key)? {
                        Some(current) if current == observed => {
                            lease_tx.remove(key.clone())?;
                            Ok(true)
                        }
                        _ => Ok(false),
                    });

                let removed = match result {
                    Ok(removed) => removed,
                    Err(TransactionError::Abort(e)) => return Err(e),
                    Err(TransactionError::Storage(e)) => return Err(Error::Storage(e)),
                };
                if !removed {
                    continue;
                }

                let seq = decode_seq(&key)?;
                if orphan {
                    report.orphans_removed += 1;
                    tracing::debug!(channel = %binding.name, seq, holder = %entry.holder, "removed orphaned lease");
                } else {
                    report.leases_reclaimed += 1;
                    tracing::debug!(
                        channel = %binding.name,
                        seq,
                        holder = %entry.holder,
                        expires_at = entry.expires_at,
                        "lease expired, record available again"
                    );
                }
            }
        }

        if report.did_reclaim() {
            tracing::info!(
                reclaimed = report.leases_reclaimed,
                orphans = report.orphans_removed,
                channels = report.channels_scanned,
                "lease reclaim sweep"
            );
        }

        Ok(report)
    }
}
