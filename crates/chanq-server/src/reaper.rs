//! Periodic sweep returning expired leases to their queues.
//!
//! The sweep touches only the lease trees of locked channels, which hold one
//! entry per in-flight record, so it runs inline on the reaper task like the
//! dispatchers' own store calls.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use chanq_core::{LockCoordinator, ReclaimReport};

/// Runs [`LockCoordinator::reclaim_expired`] every reclaim interval.
pub struct LeaseReaper {
    locks: Arc<LockCoordinator>,
    reclaimed: Arc<AtomicU64>,
}

impl LeaseReaper {
    /// Create a reaper over a coordinator.
    pub fn new(locks: Arc<LockCoordinator>) -> Self {
        Self {
            locks,
            reclaimed: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Running total of leases reclaimed, shared with the reaper task.
    pub fn reclaimed(&self) -> Arc<AtomicU64> {
        self.reclaimed.clone()
    }

    /// Run one sweep.
    pub fn sweep(&self) -> Result<ReclaimReport, chanq_core::Error> {
        let report = self.locks.reclaim_expired()?;
        self.reclaimed
            .fetch_add(report.leases_reclaimed as u64, Ordering::Relaxed);
        Ok(report)
    }

    /// Sweep until `shutdown` turns true.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let period = self.locks.config().reclaim_interval;
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::debug!(interval_ms = period.as_millis() as u64, "lease reaper started");

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.sweep() {
                        tracing::warn!(error = %e, "lease reclaim sweep failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::debug!("lease reaper stopped");
    }
}
