//! Environment Module
//!
//! Named stores, transactions and recovery on top of the log and the trees.
//!
//! ## Responsibilities
//! - One tree per store, all sharing the log, told apart by structure id
//! - A meta tree (structure id 1) mapping store names to tree roots
//! - Commits that append a root record pointing at the meta tree
//! - Recovery from the newest valid root record
//!
//! ## Commit
//! ```text
//!   store trees ──save──► meta tree ──save──► root record ──flush──► publish
//!   (dirty nodes)        (changed stores)    {version, meta_root,
//!                                              next_structure_id}
//! ```
//! The previous root record and every node replaced by the commit are
//! reported to the utilization profile as expired.

mod environment;
mod meta;
mod transaction;

pub use environment::Environment;
pub use meta::{DatabaseRoot, Store, StoreMeta};
pub use transaction::{ReadTransaction, Transaction, TransactionKind};

pub(crate) use environment::EnvInner;
pub(crate) use meta::{META_STRUCTURE_ID, UTILIZATION_STORE};
