//! Server configuration.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};

use chanq_core::{LeaseConfig, StoreConfig};

/// Default bindings file.
pub const DEFAULT_BINDINGS_PATH: &str = "./bindings.json";

/// Default number of records fetched per poll.
pub const DEFAULT_BATCH_SIZE: usize = 64;

/// Default wait between polls of an idle channel, in milliseconds.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 500;

/// Default lease timeout in seconds.
pub const DEFAULT_LEASE_TIMEOUT_SECS: u64 = 30;

/// Default reclaim sweep interval in seconds.
pub const DEFAULT_RECLAIM_INTERVAL_SECS: u64 = 5;

/// Default time allowed for dispatchers to stop, in seconds.
pub const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 5;

/// Tuning for the per-channel dispatchers.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Maximum records pulled per poll.
    pub batch_size: usize,

    /// Longest wait on an idle channel before polling again.
    pub poll_interval: Duration,

    /// Dispatchers started for each channel with a consumer.
    pub workers_per_channel: usize,

    /// First delay after a transient store error.
    pub initial_backoff: Duration,

    /// Upper bound for the backoff delay.
    pub max_backoff: Duration,

    /// How long shutdown waits for dispatchers before aborting them.
    pub shutdown_timeout: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            workers_per_channel: 1,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            shutdown_timeout: Duration::from_secs(DEFAULT_SHUTDOWN_TIMEOUT_SECS),
        }
    }
}

impl DispatchConfig {
    /// Set the batch size.
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }

    /// Set the idle poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the number of dispatchers per channel.
    pub fn with_workers_per_channel(mut self, workers: usize) -> Self {
        self.workers_per_channel = workers.max(1);
        self
    }

    /// Set the backoff bounds.
    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max.max(initial);
        self
    }

    /// Set the shutdown timeout.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

/// How the server binary hands records to the outside world.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum SinkKind {
    /// Log every record through tracing.
    Log,
    /// Write every record to stdout as one JSON document per line.
    Json,
}

/// chanq server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Path to the store directory.
    pub data_path: PathBuf,

    /// Path to the JSON bindings file.
    pub bindings_path: PathBuf,

    /// Prefix for lease holder identifiers.
    pub consumer_id: String,

    /// Store tuning.
    pub store: StoreConfig,

    /// Lease timing.
    pub lease: LeaseConfig,

    /// Dispatcher tuning.
    pub dispatch: DispatchConfig,

    /// Where the binary sends processed records.
    pub sink: SinkKind,
}

impl ServerConfig {
    /// Create a configuration with the given data path.
    pub fn new(data_path: impl Into<PathBuf>) -> Self {
        let data_path = data_path.into();
        Self {
            store: StoreConfig::new(&data_path),
            data_path,
            bindings_path: PathBuf::from(DEFAULT_BINDINGS_PATH),
            consumer_id: default_consumer_id(),
            lease: LeaseConfig::default()
                .with_lease_timeout(Duration::from_secs(DEFAULT_LEASE_TIMEOUT_SECS))
                .with_reclaim_interval(Duration::from_secs(DEFAULT_RECLAIM_INTERVAL_SECS)),
            dispatch: DispatchConfig::default(),
            sink: SinkKind::Log,
        }
    }

    /// Set the bindings file.
    pub fn with_bindings_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.bindings_path = path.into();
        self
    }

    /// Set the lease holder prefix.
    pub fn with_consumer_id(mut self, id: impl Into<String>) -> Self {
        self.consumer_id = id.into();
        self
    }

    /// Set the store configuration.
    pub fn with_store(mut self, store: StoreConfig) -> Self {
        self.store = store;
        self
    }

    /// Set the lease configuration.
    pub fn with_lease(mut self, lease: LeaseConfig) -> Self {
        self.lease = lease;
        self
    }

    /// Set the dispatcher configuration.
    pub fn with_dispatch(mut self, dispatch: DispatchConfig) -> Self {
        self.dispatch = dispatch;
        self
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new("./data")
    }
}

fn default_consumer_id() -> String {
    format!("chanq-{}", std::process::id())
}

/// Command-line arguments for the server.
#[derive(Parser, Debug)]
#[command(name = "chanq-server")]
#[command(version, about = "chanq notification dispatcher", long_about = None)]
pub struct Args {
    /// Path to the store directory.
    #[arg(short, long, default_value = "./data")]
    pub data_path: PathBuf,

    /// Path to the JSON bindings file.
    #[arg(short, long, default_value = DEFAULT_BINDINGS_PATH)]
    pub bindings: PathBuf,

    /// Lease holder prefix (defaults to chanq-<pid>).
    #[arg(long)]
    pub consumer_id: Option<String>,

    /// Records pulled per poll.
    #[arg(long, default_value_t = DEFAULT_BATCH_SIZE)]
    pub batch_size: usize,

    /// Idle poll interval in milliseconds.
    #[arg(long, default_value_t = DEFAULT_POLL_INTERVAL_MS)]
    pub poll_interval_ms: u64,

    /// Dispatchers per channel.
    #[arg(long, default_value_t = 1)]
    pub workers: usize,

    /// Lease timeout in seconds.
    #[arg(long, default_value_t = DEFAULT_LEASE_TIMEOUT_SECS)]
    pub lease_timeout: u64,

    /// Lease reclaim interval in seconds.
    #[arg(long, default_value_t = DEFAULT_RECLAIM_INTERVAL_SECS)]
    pub reclaim_interval: u64,

    /// Seconds to wait for dispatchers on shutdown.
    #[arg(long, default_value_t = DEFAULT_SHUTDOWN_TIMEOUT_SECS)]
    pub shutdown_timeout: u64,

    /// Where processed records go.
    #[arg(long, default_value = "log", value_enum)]
    pub sink: SinkKind,
}

impl Args {
    /// Convert command-line arguments to server configuration.
    pub fn into_config(self) -> ServerConfig {
        let lease = LeaseConfig::default()
            .with_lease_timeout(Duration::from_secs(self.lease_timeout.max(1)))
            .with_reclaim_interval(Duration::from_secs(self.reclaim_interval.max(1)));

        let dispatch = DispatchConfig::default()
            .with_batch_size(self.batch_size)
            .with_poll_interval(Duration::from_millis(self.poll_interval_ms))
            .with_workers_per_channel(self.workers)
            .with_shutdown_timeout(Duration::from_secs(self.shutdown_timeout));

        let mut config = ServerConfig::new(self.data_path)
            .with_bindings_path(self.bindings)
            .with_lease(lease)
            .with_dispatch(dispatch);
        if let Some(id) = self.consumer_id {
            config = config.with_consumer_id(id);
        }
        config.sink = self.sink;
        config
    }
}
