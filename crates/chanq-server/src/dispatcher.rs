//! Per-channel dispatch loop.
//!
//! ```text
//!        ┌──────────────────────────────────────────────┐
//!        ▼                                              │
//!      Idle ──► Polling ──► Locking ──► Processing ──► Acknowledging
//!        │                  (locked       │
//!        │                   channels)    └─ failure: release lease, record stays
//!        └─ shutdown ──► Stopped
//! ```
//!
//! A dispatcher owns no records. Everything it pulls stays in the queue
//! until acknowledged, so a dispatcher that dies mid-callback loses nothing:
//! unlocked channels redeliver on the next poll and locked channels after
//! the lease expires. While a handler runs, its lease is renewed every third
//! of the lease timeout.
//!
//! Each dispatcher scans its channel from a cursor just past the last record
//! it handled and only returns to the head once it reaches the tail, so a
//! record that keeps failing is retried once per pass instead of blocking
//! the records behind it.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::{watch, Notify};
use tokio::time::MissedTickBehavior;

use chanq_core::{LeaseToken, LockCoordinator, NotificationQueue, QueuedRecord, VisibilityMode};
use chanq_proto::ChannelBinding;

use crate::backoff::Backoff;
use crate::config::DispatchConfig;
use crate::consumer::NotificationHandler;
use crate::error::HandlerError;

/// Where a dispatcher is in its loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatcherState {
    /// Waiting for a wakeup or the poll interval.
    Idle,
    /// Reading a batch from the queue.
    Polling,
    /// Claiming a record on a locked channel.
    Locking,
    /// Running the handler.
    Processing,
    /// Removing a processed record.
    Acknowledging,
    /// Shut down; terminal.
    Stopped,
}

impl DispatcherState {
    /// Lowercase name, as shown in logs and status output.
    pub fn as_str(&self) -> &'static str {
        match self {
            DispatcherState::Idle => "idle",
            DispatcherState::Polling => "polling",
            DispatcherState::Locking => "locking",
            DispatcherState::Processing => "processing",
            DispatcherState::Acknowledging => "acknowledging",
            DispatcherState::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for DispatcherState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Live counters for one dispatcher.
#[derive(Debug, Default)]
pub struct DispatchStats {
    processed: AtomicU64,
    failed: AtomicU64,
    skipped: AtomicU64,
    lease_conflicts: AtomicU64,
    retries: AtomicU64,
}

impl DispatchStats {
    /// Copy the current counter values.
    pub fn snapshot(&self) -> DispatchStatsSnapshot {
        DispatchStatsSnapshot {
            processed: self.processed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            lease_conflicts: self.lease_conflicts.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
        }
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Point-in-time copy of [`DispatchStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStatsSnapshot {
    /// Records handled and acknowledged.
    pub processed: u64,
    /// Handler errors and panics.
    pub failed: u64,
    /// Records passed over because another consumer held the lease.
    pub skipped: u64,
    /// Acknowledgements or releases refused because the lease had expired.
    pub lease_conflicts: u64,
    /// Transient store errors retried after a backoff.
    pub retries: u64,
}

impl std::ops::AddAssign for DispatchStatsSnapshot {
    fn add_assign(&mut self, other: Self) {
        self.processed += other.processed;
        self.failed += other.failed;
        self.skipped += other.skipped;
        self.lease_conflicts += other.lease_conflicts;
        self.retries += other.retries;
    }
}

/// Result of a single poll.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollOutcome {
    /// Records read from the queue.
    pub fetched: usize,
    /// Records handled and acknowledged.
    pub processed: usize,
    /// Records whose handler failed.
    pub failed: usize,
    /// Records skipped because their lease was held elsewhere.
    pub skipped: usize,
    /// Whether the scan found nothing past the cursor and restarted at the
    /// head of the queue.
    pub wrapped: bool,
}

impl PollOutcome {
    /// Whether the poll acknowledged anything.
    pub fn made_progress(&self) -> bool {
        self.processed > 0
    }

    /// Whether the next poll can start right away: something was
    /// acknowledged and nothing failed.
    pub fn should_continue(&self) -> bool {
        self.made_progress() && self.failed == 0
    }
}

/// Consumes one channel on behalf of one handler.
pub struct Dispatcher {
    id: String,
    binding: ChannelBinding,
    visibility: VisibilityMode,
    queue: Arc<NotificationQueue>,
    locks: Arc<LockCoordinator>,
    handler: Arc<dyn NotificationHandler>,
    config: DispatchConfig,
    wakeup: Arc<Notify>,
    state: watch::Sender<DispatcherState>,
    stats: Arc<DispatchStats>,
    /// Sequence number the next scan starts from.
    cursor: AtomicU64,
}

impl Dispatcher {
    /// Create a dispatcher for a channel.
    ///
    /// `id` doubles as the lease holder name and must be unique among the
    /// channel's dispatchers.
    pub fn new(
        id: impl Into<String>,
        binding: ChannelBinding,
        queue: Arc<NotificationQueue>,
        locks: Arc<LockCoordinator>,
        handler: Arc<dyn NotificationHandler>,
        config: DispatchConfig,
    ) -> Self {
        let (state, _) = watch::channel(DispatcherState::Idle);
        Self {
            id: id.into(),
            visibility: VisibilityMode::for_binding(&binding),
            binding,
            queue,
            locks,
            handler,
            config,
            wakeup: Arc::new(Notify::new()),
            state,
            stats: Arc::new(DispatchStats::default()),
            cursor: AtomicU64::new(0),
        }
    }

    /// Park on a shared wakeup signal instead of a private one.
    pub fn with_wakeup(mut self, wakeup: Arc<Notify>) -> Self {
        self.wakeup = wakeup;
        self
    }

    /// Dispatcher id and lease holder name.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Channel this dispatcher consumes.
    pub fn channel(&self) -> &str {
        &self.binding.name
    }

    /// Subscribe to state changes.
    pub fn state(&self) -> watch::Receiver<DispatcherState> {
        self.state.subscribe()
    }

    /// Shared counters.
    pub fn stats(&self) -> Arc<DispatchStats> {
        self.stats.clone()
    }

    fn set_state(&self, state: DispatcherState) {
        self.state.send_replace(state);
    }

    /// Pull one batch and deliver it.
    ///
    /// Handler failures are counted, not returned. Store errors abort the
    /// batch; records already acknowledged stay acknowledged and the rest
    /// remain queued.
    pub async fn poll_once(&self, shutdown: &watch::Receiver<bool>) -> Result<PollOutcome, chanq_core::Error> {
        self.set_state(DispatcherState::Polling);
        let start = self.cursor.load(Ordering::Relaxed);
        let mut batch = self.fetch(start)?;
        let mut wrapped = false;
        if batch.is_empty() && start > 0 {
            self.cursor.store(0, Ordering::Relaxed);
            batch = self.fetch(0)?;
            wrapped = true;
        }

        let mut outcome = PollOutcome {
            fetched: batch.len(),
            wrapped,
            ..Default::default()
        };

        for queued in batch {
            if *shutdown.borrow() {
                break;
            }
            self.cursor.store(queued.seq.saturating_add(1), Ordering::Relaxed);

            let lease = if self.binding.lock_required {
                self.set_state(DispatcherState::Locking);
                match self.locks.try_acquire(&queued, &self.id)? {
                    Some(token) => Some(token),
                    None => {
                        outcome.skipped += 1;
                        DispatchStats::bump(&self.stats.skipped);
                        continue;
                    }
                }
            } else {
                None
            };

            self.set_state(DispatcherState::Processing);
            let (result, lease) = match lease {
                Some(token) => match self.invoke_leased(&queued, token).await {
                    Some((result, token)) => (result, Some(token)),
                    None => continue,
                },
                None => (self.invoke(&queued).await, None),
            };

            match result {
                Ok(()) => {
                    self.set_state(DispatcherState::Acknowledging);
                    if self.acknowledge(&queued, lease.as_ref())? {
                        outcome.processed += 1;
                    }
                }
                Err(e) => {
                    outcome.failed += 1;
                    DispatchStats::bump(&self.stats.failed);
                    tracing::warn!(
                        dispatcher = %self.id,
                        channel = %self.binding.name,
                        seq = queued.seq,
                        entity_type = %queued.record.entity_type,
                        primary_key = %queued.record.primary_key,
                        error = %e,
                        "notification handler failed, record left queued"
                    );
                    if let Some(token) = lease {
                        self.release(&token)?;
                    }
                }
            }
        }

        Ok(outcome)
    }

    fn fetch(&self, from_seq: u64) -> Result<Vec<QueuedRecord>, chanq_core::Error> {
        self.queue
            .dequeue_batch_from(&self.binding.name, from_seq, self.config.batch_size, self.visibility)?
            .collect()
    }

    async fn invoke(&self, queued: &QueuedRecord) -> Result<(), HandlerError> {
        match AssertUnwindSafe(self.handler.handle(&queued.record))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(panic) => Err(HandlerError::Panicked(panic_message(panic.as_ref()))),
        }
    }

    /// Run the handler while keeping the lease alive.
    ///
    /// Returns `None` if the lease was taken over mid-run; the handler is
    /// dropped and the record left to the new holder.
    async fn invoke_leased(
        &self,
        queued: &QueuedRecord,
        mut token: LeaseToken,
    ) -> Option<(Result<(), HandlerError>, LeaseToken)> {
        let period = self.locks.config().renew_interval();
        let mut renewals = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        renewals.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let handling = self.invoke(queued);
        tokio::pin!(handling);

        loop {
            tokio::select! {
                biased;
                result = &mut handling => return Some((result, token)),
                _ = renewals.tick() => match self.locks.renew(&token) {
                    Ok(renewed) => token = renewed,
                    Err(chanq_core::Error::LeaseExpired { seq, .. }) => {
                        DispatchStats::bump(&self.stats.lease_conflicts);
                        tracing::warn!(
                            dispatcher = %self.id,
                            channel = %self.binding.name,
                            seq,
                            "lease taken over while handler was running, abandoning record"
                        );
                        return None;
                    }
                    Err(e) => {
                        tracing::warn!(
                            dispatcher = %self.id,
                            channel = %self.binding.name,
                            seq = queued.seq,
                            error = %e,
                            "lease renewal failed, retrying on next tick"
                        );
                    }
                },
            }
        }
    }

    /// Returns whether the record counts as processed by this dispatcher.
    fn acknowledge(&self, queued: &QueuedRecord, lease: Option<&LeaseToken>) -> Result<bool, chanq_core::Error> {
        match self.queue.acknowledge(&self.binding.name, queued.seq, lease) {
            Ok(_) => {
                DispatchStats::bump(&self.stats.processed);
                Ok(true)
            }
            Err(chanq_core::Error::LeaseExpired { seq, .. }) => {
                DispatchStats::bump(&self.stats.lease_conflicts);
                tracing::warn!(
                    dispatcher = %self.id,
                    channel = %self.binding.name,
                    seq,
                    "lease expired before acknowledgement, record will be redelivered"
                );
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    fn release(&self, token: &LeaseToken) -> Result<(), chanq_core::Error> {
        match self.locks.release(token) {
            Ok(()) => Ok(()),
            Err(chanq_core::Error::LeaseExpired { seq, .. }) => {
                DispatchStats::bump(&self.stats.lease_conflicts);
                tracing::debug!(dispatcher = %self.id, channel = %self.binding.name, seq, "lease already gone on release");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Run until `shutdown` turns true.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            dispatcher = %self.id,
            channel = %self.binding.name,
            locked = self.binding.lock_required,
            "dispatcher started"
        );

        let mut backoff = Backoff::new(self.config.initial_backoff, self.config.max_backoff);

        while !*shutdown.borrow() {
            // Register for wakeups before reading, so an enqueue racing the
            // poll still wakes the wait below.
            let notified = self.wakeup.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let delay = match self.poll_once(&shutdown).await {
                Ok(outcome) => {
                    backoff.reset();
                    // Records that just failed wait a poll interval before the
                    // cursor wraps back to them.
                    if outcome.should_continue() {
                        continue;
                    }
                    self.config.poll_interval
                }
                Err(e) if e.is_transient() => {
                    DispatchStats::bump(&self.stats.retries);
                    let delay = backoff.next_delay();
                    tracing::warn!(
                        dispatcher = %self.id,
                        channel = %self.binding.name,
                        error = %e,
                        attempt = backoff.attempt(),
                        delay_ms = delay.as_millis() as u64,
                        "store error, backing off"
                    );
                    self.set_state(DispatcherState::Idle);
                    if !wait_or_shutdown(delay, &mut shutdown).await {
                        break;
                    }
                    continue;
                }
                Err(e) => {
                    tracing::error!(
                        dispatcher = %self.id,
                        channel = %self.binding.name,
                        error = %e,
                        "dispatch error"
                    );
                    self.config.poll_interval
                }
            };

            self.set_state(DispatcherState::Idle);
            tokio::select! {
                _ = &mut notified => {}
                keep_going = wait_or_shutdown(delay, &mut shutdown) => {
                    if !keep_going {
                        break;
                    }
                }
            }
        }

        self.set_state(DispatcherState::Stopped);
        tracing::info!(dispatcher = %self.id, channel = %self.binding.name, "dispatcher stopped");
    }
}

/// Sleep for `delay` unless shutdown is requested first.
///
/// Returns false when the dispatcher should stop.
async fn wait_or_shutdown(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => !*shutdown.borrow(),
        changed = shutdown.changed() => changed.is_ok() && !*shutdown.borrow(),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
