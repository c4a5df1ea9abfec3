//! Service runtime: one store, its dispatchers and the lease reaper.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use chanq_core::{BindingRegistry, LockCoordinator, NotificationQueue, NotificationStore, QueueStats};

use crate::config::{DispatchConfig, ServerConfig};
use crate::consumer::ConsumerRegistry;
use crate::dispatcher::{DispatchStats, DispatchStatsSnapshot, Dispatcher, DispatcherState};
use crate::error::Error;
use crate::producer::ChangeProducer;
use crate::reaper::LeaseReaper;
use crate::wakeup::Wakeups;

/// Owns the shared store, queue and lease coordinator for a set of bindings.
pub struct NotificationService {
    registry: Arc<BindingRegistry>,
    store: Arc<NotificationStore>,
    queue: Arc<NotificationQueue>,
    locks: Arc<LockCoordinator>,
    wakeups: Arc<Wakeups>,
    dispatch: DispatchConfig,
    consumer_id: String,
}

impl NotificationService {
    /// Open the store and bindings named by a server configuration.
    pub fn open(config: &ServerConfig) -> Result<Self, Error> {
        let registry = BindingRegistry::from_json_file(&config.bindings_path)?;
        tracing::info!(
            path = %config.bindings_path.display(),
            channels = registry.len(),
            "bindings loaded"
        );
        let store = NotificationStore::open(&config.store)?;
        Ok(Self::new(config, Arc::new(registry), Arc::new(store)))
    }

    /// Assemble a service from an existing registry and store.
    pub fn new(config: &ServerConfig, registry: Arc<BindingRegistry>, store: Arc<NotificationStore>) -> Self {
        let queue = Arc::new(NotificationQueue::new(store.clone(), registry.clone()));
        let locks = Arc::new(LockCoordinator::new(store.clone(), registry.clone(), config.lease));
        Self {
            registry,
            store,
            queue,
            locks,
            wakeups: Arc::new(Wakeups::new()),
            dispatch: config.dispatch.clone(),
            consumer_id: config.consumer_id.clone(),
        }
    }

    /// Channel bindings.
    pub fn registry(&self) -> &Arc<BindingRegistry> {
        &self.registry
    }

    /// The shared queue.
    pub fn queue(&self) -> &Arc<NotificationQueue> {
        &self.queue
    }

    /// The shared lease coordinator.
    pub fn locks(&self) -> &Arc<LockCoordinator> {
        &self.locks
    }

    /// A producer writing to this service's queue.
    pub fn producer(&self) -> ChangeProducer {
        ChangeProducer::new(self.queue.clone(), self.wakeups.clone())
    }

    /// An empty consumer registry for this service's bindings.
    pub fn consumers(&self) -> ConsumerRegistry {
        ConsumerRegistry::new(self.registry.clone())
    }

    /// Spawn dispatchers for every channel with a handler, plus the reaper.
    ///
    /// Must be called from within a tokio runtime. Channels without a
    /// handler keep accumulating records until one is registered.
    pub fn start(&self, consumers: &ConsumerRegistry) -> ServiceHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut dispatchers = Vec::new();
        let mut tasks = Vec::new();

        for binding in self.registry.iter() {
            let Some(handler) = consumers.handler_for(&binding.name) else {
                tracing::info!(channel = %binding.name, entity_type = %binding.entity_type, "no handler registered, channel left queued");
                continue;
            };

            for index in 0..self.dispatch.workers_per_channel {
                let id = format!("{}/{}/{}", self.consumer_id, binding.name, index);
                let dispatcher = Dispatcher::new(
                    id.clone(),
                    binding.clone(),
                    self.queue.clone(),
                    self.locks.clone(),
                    handler.clone(),
                    self.dispatch.clone(),
                )
                .with_wakeup(self.wakeups.channel(&binding.name));

                dispatchers.push(DispatcherEntry {
                    id,
                    channel: binding.name.clone(),
                    state: dispatcher.state(),
                    stats: dispatcher.stats(),
                });
                tasks.push(tokio::spawn(dispatcher.run(shutdown_rx.clone())));
            }
        }

        let reaper = LeaseReaper::new(self.locks.clone());
        let reclaimed = reaper.reclaimed();
        tasks.push(tokio::spawn(reaper.run(shutdown_rx)));

        tracing::info!(
            dispatchers = dispatchers.len(),
            channels = consumers.len(),
            "notification service started"
        );

        ServiceHandle {
            shutdown: shutdown_tx,
            tasks: Mutex::new(tasks),
            dispatchers,
            reclaimed,
            queue: self.queue.clone(),
            store: self.store.clone(),
            producer: self.producer(),
            shutdown_timeout: self.dispatch.shutdown_timeout,
        }
    }
}

struct DispatcherEntry {
    id: String,
    channel: String,
    state: watch::Receiver<DispatcherState>,
    stats: Arc<DispatchStats>,
}

/// Status of one running dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatcherStatus {
    /// Dispatcher id and lease holder name.
    pub id: String,
    /// Channel consumed.
    pub channel: String,
    /// Current loop state.
    pub state: DispatcherState,
    /// Counters so far.
    pub stats: DispatchStatsSnapshot,
}

/// Aggregated service counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceStats {
    /// Per-dispatcher status in start order.
    pub dispatchers: Vec<DispatcherStatus>,
    /// Leases returned to their queues by the reaper.
    pub leases_reclaimed: u64,
}

impl ServiceStats {
    /// Counters summed over all dispatchers.
    pub fn totals(&self) -> DispatchStatsSnapshot {
        let mut totals = DispatchStatsSnapshot::default();
        for status in &self.dispatchers {
            totals += status.stats;
        }
        totals
    }

    /// Counters summed over one channel's dispatchers.
    pub fn channel_totals(&self, channel: &str) -> DispatchStatsSnapshot {
        let mut totals = DispatchStatsSnapshot::default();
        for status in self.dispatchers.iter().filter(|s| s.channel == channel) {
            totals += status.stats;
        }
        totals
    }
}

/// Handle to a started service.
pub struct ServiceHandle {
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    dispatchers: Vec<DispatcherEntry>,
    reclaimed: Arc<AtomicU64>,
    queue: Arc<NotificationQueue>,
    store: Arc<NotificationStore>,
    producer: ChangeProducer,
    shutdown_timeout: std::time::Duration,
}

impl ServiceHandle {
    /// A producer that wakes this service's dispatchers.
    pub fn producer(&self) -> ChangeProducer {
        self.producer.clone()
    }

    /// Snapshot of every dispatcher's state and counters.
    pub fn stats(&self) -> ServiceStats {
        ServiceStats {
            dispatchers: self
                .dispatchers
                .iter()
                .map(|entry| DispatcherStatus {
                    id: entry.id.clone(),
                    channel: entry.channel.clone(),
                    state: *entry.state.borrow(),
                    stats: entry.stats.snapshot(),
                })
                .collect(),
            leases_reclaimed: self.reclaimed.load(Ordering::Relaxed),
        }
    }

    /// Queue and lease counts for a channel.
    pub fn queue_stats(&self, channel: &str) -> Result<QueueStats, Error> {
        Ok(self.queue.stats(channel)?)
    }

    /// Stop all dispatchers and the reaper, then flush the store.
    ///
    /// Dispatchers get `shutdown_timeout` to finish their current record;
    /// stragglers are aborted and their leases expire normally. A task that
    /// panicked does not cut shutdown short: every task is still joined or
    /// aborted and the store flushed before the first such error is returned.
    pub async fn shutdown(&self) -> Result<(), Error> {
        self.shutdown.send_replace(true);
        let tasks = std::mem::take(&mut *self.tasks.lock());
        let deadline = tokio::time::Instant::now() + self.shutdown_timeout;

        let mut aborted = 0usize;
        let mut first_error = None;
        for mut task in tasks {
            match tokio::time::timeout_at(deadline, &mut task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) if e.is_cancelled() => {}
                Ok(Err(e)) => {
                    tracing::error!(error = %e, "task failed during shutdown");
                    first_error.get_or_insert(Error::from(e));
                }
                Err(_) => {
                    task.abort();
                    aborted += 1;
                }
            }
        }
        if aborted > 0 {
            tracing::warn!(aborted, "tasks did not stop in time and were aborted");
        }

        self.store.flush()?;
        tracing::info!("notification service stopped");
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Whether shutdown has been requested.
    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }
}
