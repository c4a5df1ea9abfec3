//! Store and lease configuration.

use std::path::PathBuf;
use std::time::Duration;

/// Default lease timeout (30 seconds).
pub const DEFAULT_LEASE_TIMEOUT: Duration = Duration::from_secs(30);

/// Default interval between lease reclaim sweeps (5 seconds).
pub const DEFAULT_RECLAIM_INTERVAL: Duration = Duration::from_secs(5);

/// Configuration for the notification store.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Path to the store directory.
    pub path: PathBuf,

    /// Page cache capacity in bytes.
    pub cache_capacity: u64,

    /// Flush interval in milliseconds. None means flush on every write.
    pub flush_every_ms: Option<u64>,

    /// Enable zstd compression.
    pub compression: bool,

    /// Temporary store (deleted on drop).
    pub temporary: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./chanq_data"),
            cache_capacity: 256 * 1024 * 1024, // 256MB
            flush_every_ms: Some(500),
            compression: true,
            temporary: false,
        }
    }
}

impl StoreConfig {
    /// Create a new configuration with the given path.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    /// Create a temporary configuration for testing.
    pub fn temporary() -> Self {
        Self {
            path: PathBuf::from(""),
            temporary: true,
            ..Default::default()
        }
    }

    /// Set the page cache capacity.
    pub fn with_cache_capacity(mut self, bytes: u64) -> Self {
        self.cache_capacity = bytes;
        self
    }

    /// Set the flush interval. None flushes on every write.
    pub fn with_flush_every_ms(mut self, ms: Option<u64>) -> Self {
        self.flush_every_ms = ms;
        self
    }

    /// Convert to sled configuration.
    pub(crate) fn to_sled_config(&self) -> sled::Config {
        let mut config = sled::Config::new()
            .cache_capacity(self.cache_capacity)
            .use_compression(self.compression);

        if self.temporary {
            config = config.temporary(true);
        } else {
            config = config.path(&self.path);
        }

        config.flush_every_ms(self.flush_every_ms)
    }
}

/// Lease timing for locked channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseConfig {
    /// How long a lease stays live after acquisition. Records whose holder
    /// disappears become available again once this elapses.
    pub lease_timeout: Duration,

    /// How often the reclaim sweep runs.
    pub reclaim_interval: Duration,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            lease_timeout: DEFAULT_LEASE_TIMEOUT,
            reclaim_interval: DEFAULT_RECLAIM_INTERVAL,
        }
    }
}

impl LeaseConfig {
    /// Set the lease timeout.
    pub fn with_lease_timeout(mut self, timeout: Duration) -> Self {
        self.lease_timeout = timeout;
        self
    }

    /// Set the reclaim interval.
    pub fn with_reclaim_interval(mut self, interval: Duration) -> Self {
        self.reclaim_interval = interval;
        self
    }

    /// Lease timeout in microseconds, the unit of record timestamps.
    pub fn lease_timeout_micros(&self) -> u64 {
        self.lease_timeout.as_micros() as u64
    }

    /// How often a holder extends a lease while its handler runs.
    ///
    /// A third of the timeout, so two renewals can be missed before the
    /// lease lapses.
    pub fn renew_interval(&self) -> Duration {
        (self.lease_timeout / 3).max(Duration::from_millis(1))
    }
}
