//! Configuration for logtree
//!
//! Centralized configuration with sensible defaults.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{LogTreeError, Result};
use crate::log::{FRAME_OVERHEAD, MAX_PAYLOAD_SIZE};

/// Main configuration for a logtree environment
#[derive(Debug, Clone)]
pub struct Config {
    // -------------------------------------------------------------------------
    // Storage Configuration
    // -------------------------------------------------------------------------
    /// Root directory for all log files
    /// Internal structure:
    ///   {data_dir}/
    ///     ├── 0000000000000000.log
    ///     ├── 0000000000800000.log
    ///     └── ...                   (one file per `log_file_size` of address space)
    pub data_dir: PathBuf,

    /// Refuse write transactions (GC passes abort as transient)
    pub read_only: bool,

    // -------------------------------------------------------------------------
    // Log Configuration
    // -------------------------------------------------------------------------
    /// Size of every log file in bytes; also the address span of a file
    pub log_file_size: u64,

    /// Capacity of the LRU cache of open read handles
    pub log_cache_open_files: usize,

    /// Sync strategy: how often commits fsync the log
    pub log_sync_strategy: LogSyncStrategy,

    // -------------------------------------------------------------------------
    // Tree Configuration
    // -------------------------------------------------------------------------
    /// Page budget of a serialized tree node in bytes (split above it)
    pub tree_page_size: usize,

    /// A node below this percentage of the page budget is merged or rebalanced
    pub tree_merge_percent: usize,

    // -------------------------------------------------------------------------
    // Garbage Collector Configuration
    // -------------------------------------------------------------------------
    /// Run the background cleaner at all
    pub gc_enabled: bool,

    /// Earliest start of cleaning after the environment is opened (milliseconds)
    pub gc_start_in_ms: u64,

    /// Target utilization percent; cleaning starts once free space exceeds `100 - this`
    pub gc_min_utilization: u8,

    /// Number of newest files never considered for cleaning
    pub gc_min_file_age: usize,

    /// Minimum number of new files created since the last pass before a trigger
    pub gc_files_delta: u64,

    /// How long a cleaning pass waits for the write transaction (milliseconds)
    pub gc_transaction_acquire_timeout_ms: u64,

    /// Time budget of a single cleaning pass (milliseconds)
    pub gc_transaction_timeout_ms: u64,

    /// Delay between vacating a file and deleting it (milliseconds)
    pub gc_files_deletion_delay_ms: u64,

    /// Rename vacated files to `*.del` instead of deleting them
    pub gc_rename_files: bool,

    /// Run passes in an exclusive transaction (many files per pass)
    pub gc_use_exclusive_transaction: bool,

    /// Stop a pass early once it has dirtied this many bytes of tree nodes
    pub gc_memory_limit_bytes: u64,

    /// Upper bound of the fragmentation candidate index
    pub gc_max_candidates: usize,

    /// Delay before retrying a pass aborted by contention (milliseconds)
    pub gc_retry_delay_ms: u64,

    /// Ignore the persisted utilization profile and recompute it at open
    pub gc_utilization_from_scratch: bool,

    /// Import utilization from a `<file address> <free bytes>` report at open
    pub gc_utilization_from_report: Option<PathBuf>,
}

/// Log sync strategy
#[derive(Debug, Clone, Copy)]
pub enum LogSyncStrategy {
    /// fsync after every commit (safest, slowest)
    EveryCommit,

    /// fsync after N commits (balanced durability/performance)
    EveryNCommits { count: usize },
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./logtree_data"),
            read_only: false,
            log_file_size: 8 * 1024 * 1024, // 8 MB
            log_cache_open_files: 16,
            log_sync_strategy: LogSyncStrategy::EveryNCommits { count: 16 },
            tree_page_size: 4096,
            tree_merge_percent: 40,
            gc_enabled: true,
            gc_start_in_ms: 10_000,
            gc_min_utilization: 50,
            gc_min_file_age: 2,
            gc_files_delta: 3,
            gc_transaction_acquire_timeout_ms: 1000,
            gc_transaction_timeout_ms: 1000,
            gc_files_deletion_delay_ms: 5000,
            gc_rename_files: false,
            gc_use_exclusive_transaction: false,
            gc_memory_limit_bytes: 256 * 1024 * 1024, // 256 MB
            gc_max_candidates: 4096,
            gc_retry_delay_ms: 1000,
            gc_utilization_from_scratch: false,
            gc_utilization_from_report: None,
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Check that the sizes fit together
    ///
    /// The largest node a tree may persist (one page) plus the loggable
    /// frame must fit inside a single log file, and an entry must fit in
    /// half a page so that a split always yields two legal nodes.
    pub fn validate(&self) -> Result<()> {
        if self.tree_page_size < 128 {
            return Err(LogTreeError::Config(format!(
                "tree_page_size must be at least 128 bytes, got {}",
                self.tree_page_size
            )));
        }
        if self.tree_page_size > MAX_PAYLOAD_SIZE {
            return Err(LogTreeError::Config(format!(
                "tree_page_size {} exceeds the maximum payload {}",
                self.tree_page_size, MAX_PAYLOAD_SIZE
            )));
        }
        let min_file = (self.tree_page_size as u64 + FRAME_OVERHEAD as u64) * 4;
        if self.log_file_size < min_file {
            return Err(LogTreeError::Config(format!(
                "log_file_size {} must hold at least four pages ({} bytes)",
                self.log_file_size, min_file
            )));
        }
        if self.tree_merge_percent == 0 || self.tree_merge_percent >= 50 {
            return Err(LogTreeError::Config(format!(
                "tree_merge_percent must be in 1..50, got {}",
                self.tree_merge_percent
            )));
        }
        if self.gc_min_utilization > 90 {
            return Err(LogTreeError::Config(format!(
                "gc_min_utilization must not exceed 90, got {}",
                self.gc_min_utilization
            )));
        }
        if self.log_cache_open_files == 0 {
            return Err(LogTreeError::Config("log_cache_open_files must be positive".into()));
        }
        Ok(())
    }

    pub(crate) fn gc_start_in(&self) -> Duration {
        Duration::from_millis(self.gc_start_in_ms)
    }

    pub(crate) fn gc_acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.gc_transaction_acquire_timeout_ms)
    }

    pub(crate) fn gc_pass_budget(&self) -> Duration {
        Duration::from_millis(self.gc_transaction_timeout_ms)
    }

    pub(crate) fn gc_deletion_delay(&self) -> Duration {
        Duration::from_millis(self.gc_files_deletion_delay_ms)
    }

    pub(crate) fn gc_retry_delay(&self) -> Duration {
        Duration::from_millis(self.gc_retry_delay_ms)
    }
}

/// Builder for Config
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Set the data directory (root for all log files)
    pub fn data_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.data_dir = path.into();
        self
    }

    /// Open the environment read-only
    pub fn read_only(mut self, read_only: bool) -> Self {
        self.config.read_only = read_only;
        self
    }

    /// Set the size of each log file (in bytes)
    pub fn log_file_size(mut self, size: u64) -> Self {
        self.config.log_file_size = size;
        self
    }

    /// Set the capacity of the open file handle cache
    pub fn log_cache_open_files(mut self, count: usize) -> Self {
        self.config.log_cache_open_files = count;
        self
    }

    /// Set the log sync strategy
    pub fn log_sync_strategy(mut self, strategy: LogSyncStrategy) -> Self {
        self.config.log_sync_strategy = strategy;
        self
    }

    /// Set the tree page budget (in bytes)
    pub fn tree_page_size(mut self, size: usize) -> Self {
        self.config.tree_page_size = size;
        self
    }

    /// Set the merge threshold (percent of the page budget)
    pub fn tree_merge_percent(mut self, percent: usize) -> Self {
        self.config.tree_merge_percent = percent;
        self
    }

    /// Enable or disable the background cleaner
    pub fn gc_enabled(mut self, enabled: bool) -> Self {
        self.config.gc_enabled = enabled;
        self
    }

    /// Set the delay before the first cleaning (in milliseconds)
    pub fn gc_start_in_ms(mut self, ms: u64) -> Self {
        self.config.gc_start_in_ms = ms;
        self
    }

    /// Set the target utilization (percent)
    pub fn gc_min_utilization(mut self, percent: u8) -> Self {
        self.config.gc_min_utilization = percent;
        self
    }

    /// Set how many of the newest files are never cleaned
    pub fn gc_min_file_age(mut self, files: usize) -> Self {
        self.config.gc_min_file_age = files;
        self
    }

    /// Set the number of new files that arms the trigger
    pub fn gc_files_delta(mut self, files: u64) -> Self {
        self.config.gc_files_delta = files;
        self
    }

    /// Set the write-transaction acquire timeout of a pass (in milliseconds)
    pub fn gc_transaction_acquire_timeout_ms(mut self, ms: u64) -> Self {
        self.config.gc_transaction_acquire_timeout_ms = ms;
        self
    }

    /// Set the time budget of a pass (in milliseconds)
    pub fn gc_transaction_timeout_ms(mut self, ms: u64) -> Self {
        self.config.gc_transaction_timeout_ms = ms;
        self
    }

    /// Set the deletion delay of vacated files (in milliseconds)
    pub fn gc_files_deletion_delay_ms(mut self, ms: u64) -> Self {
        self.config.gc_files_deletion_delay_ms = ms;
        self
    }

    /// Rename vacated files instead of deleting them
    pub fn gc_rename_files(mut self, rename: bool) -> Self {
        self.config.gc_rename_files = rename;
        self
    }

    /// Run cleaning passes in exclusive transactions
    pub fn gc_use_exclusive_transaction(mut self, exclusive: bool) -> Self {
        self.config.gc_use_exclusive_transaction = exclusive;
        self
    }

    /// Set the memory-pressure guard of a pass (in bytes)
    pub fn gc_memory_limit_bytes(mut self, bytes: u64) -> Self {
        self.config.gc_memory_limit_bytes = bytes;
        self
    }

    /// Set the bound of the fragmentation candidate index
    pub fn gc_max_candidates(mut self, count: usize) -> Self {
        self.config.gc_max_candidates = count;
        self
    }

    /// Set the retry delay after a contended pass (in milliseconds)
    pub fn gc_retry_delay_ms(mut self, ms: u64) -> Self {
        self.config.gc_retry_delay_ms = ms;
        self
    }

    /// Recompute utilization from scratch at open
    pub fn gc_utilization_from_scratch(mut self, from_scratch: bool) -> Self {
        self.config.gc_utilization_from_scratch = from_scratch;
        self
    }

    /// Import utilization from a report file at open
    pub fn gc_utilization_from_report(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.gc_utilization_from_report = Some(path.into());
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}
