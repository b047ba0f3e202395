//! # logtree
//!
//! An embedded storage core with:
//! - An append-only, multi-file log addressed by byte offset
//! - Copy-on-write B-trees persisted in that log, one per named store
//! - Snapshot reads next to a single writer
//! - A background cleaner that relocates live nodes out of fragmented
//!   files and deletes the vacated files
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       Environment                            │
//! │        (stores, transactions, recovery, shutdown)            │
//! └──────────┬───────────────────────────────────┬──────────────┘
//!            │                                   │
//!            ▼                                   ▼
//!   ┌─────────────────┐   expired bytes   ┌─────────────────┐
//!   │  B-trees (CoW)  ├──────────────────►│   Utilization   │
//!   │ meta + stores   │                   │     Profile     │
//!   └────────┬────────┘                   └────────┬────────┘
//!            │ nodes, root records                 │ candidates
//!            ▼                                     ▼
//!   ┌─────────────────┐    reclaim, delete ┌─────────────────┐
//!   │       Log       │◄───────────────────┤  Cleaner thread │
//!   │ (files by addr) │                    │      (GC)       │
//!   └─────────────────┘                    └─────────────────┘
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use logtree::{Config, Environment};
//!
//! # fn main() -> logtree::Result<()> {
//! let env = Environment::open(Config::builder().data_dir("./data").build())?;
//! env.execute_in_transaction(|txn| {
//!     let users = txn.open_store("users")?;
//!     txn.put(&users, b"alice", b"1")?;
//!     Ok(())
//! })?;
//! env.close()?;
//! # Ok(())
//! # }
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod config;

pub mod log;
pub mod tree;
pub mod env;
pub mod gc;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use error::{LogTreeError, Result};
pub use config::{Config, ConfigBuilder, LogSyncStrategy};
pub use env::{Environment, ReadTransaction, Store, Transaction, TransactionKind};
pub use gc::{GarbageCollector, GcStats, UtilizationProfile, UtilizationSource};
pub use log::Log;
pub use tree::{Cursor, ImmutableTree, MutableTree};

// =============================================================================
// Version Info
// =============================================================================

/// Current version of logtree
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
