//! Store and session configuration.

use std::path::PathBuf;
use std::time::Duration;

use crate::retry::RetryPolicy;

/// Record count at which a session folds its log into one snapshot.
pub const PREFERRED_TRIM_SIZE: u64 = 500;

/// Default debounce window before a triggered compaction runs.
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_millis(1000);

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// Enable fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 256)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
    /// Backoff for writes that hit a stale handle
    pub retry: RetryPolicy,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("logos_persist"),
            block_cache_size: 64 * 1024 * 1024, // 64MB
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 256,
            write_buffer_size: 16 * 1024 * 1024, // 16MB
            retry: RetryPolicy::default(),
        }
    }
}

impl StoreConfig {
    /// Create config for testing (small caches, given directory).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 4 * 1024 * 1024, // 4MB
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 1024 * 1024, // 1MB
            retry: RetryPolicy::default(),
        }
    }
}

/// Per-session compaction settings.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Record count that triggers compaction
    pub trim_size: u64,
    /// Debounce window between the triggering append and the compaction
    pub store_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            trim_size: PREFERRED_TRIM_SIZE,
            store_timeout: DEFAULT_STORE_TIMEOUT,
        }
    }
}

impl SessionConfig {
    /// Default trim size, compaction runs as soon as it is triggered.
    pub fn for_testing() -> Self {
        Self {
            trim_size: PREFERRED_TRIM_SIZE,
            store_timeout: Duration::ZERO,
        }
    }

    pub fn with_trim_size(mut self, trim_size: u64) -> Self {
        self.trim_size = trim_size;
        self
    }

    pub fn with_store_timeout(mut self, store_timeout: Duration) -> Self {
        self.store_timeout = store_timeout;
        self
    }
}
