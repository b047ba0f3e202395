//! Error types for logtree
//!
//! Provides a unified error type for all operations.

use thiserror::Error;

/// Result type alias using LogTreeError
pub type Result<T> = std::result::Result<T, LogTreeError>;

/// Unified error type for logtree operations
#[derive(Debug, Error)]
pub enum LogTreeError {
    // -------------------------------------------------------------------------
    // I/O Errors
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // -------------------------------------------------------------------------
    // Log / Tree Integrity Errors
    // -------------------------------------------------------------------------
    #[error("Log corruption detected: {0}")]
    Corruption(String),

    #[error("Integrity violation: {0}")]
    Integrity(String),

    #[error("Entry too large: {size} bytes (limit {limit})")]
    EntryTooLarge { size: usize, limit: usize },

    // -------------------------------------------------------------------------
    // Serialization Errors
    // -------------------------------------------------------------------------
    #[error("Serialization error: {0}")]
    Serialization(String),

    // -------------------------------------------------------------------------
    // Store / Transaction Errors
    // -------------------------------------------------------------------------
    #[error("Store not found: {0}")]
    StoreNotFound(String),

    #[error("Environment is read-only")]
    ReadOnly,

    #[error("Timed out acquiring the write transaction")]
    TransactionTimeout,

    #[error("Flush refused: {0}")]
    FlushRefused(String),

    // -------------------------------------------------------------------------
    // Usage Errors
    // -------------------------------------------------------------------------
    #[error("Misuse: {0}")]
    Misuse(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Environment or collector is closed")]
    Closed,
}

impl LogTreeError {
    /// Contention-type failures: the current cleaning pass is abandoned and
    /// retried on the next wake, nothing is surfaced to callers.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            LogTreeError::TransactionTimeout | LogTreeError::FlushRefused(_) | LogTreeError::ReadOnly
        )
    }

    /// Integrity failures after which the environment must not be written.
    pub fn is_fatal(&self) -> bool {
        matches!(self, LogTreeError::Corruption(_) | LogTreeError::Integrity(_))
    }
}

impl From<bincode::Error> for LogTreeError {
    fn from(e: bincode::Error) -> Self {
        LogTreeError::Serialization(e.to_string())
    }
}
