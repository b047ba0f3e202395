//! Tree Module
//!
//! Copy-on-write B-tree persisted in the log. Nodes are immutable once
//! written and referenced by their log address; a mutation copies the path
//! from the root to the changed leaf and `save` writes the copies, producing
//! a new root while every older root stays readable.
//!
//! ## Responsibilities
//! - Point reads, upserts, inserts and deletes with split/merge by page budget
//! - Snapshots (`ImmutableTree`) shared freely between readers
//! - Cursors with forward/backward steps, exact and ceiling search
//! - Relocation of live nodes for the log cleaner (`reclaim`)
//! - Enumeration of every reachable node address
//!
//! ## Shape
//! ```text
//!                 ┌──────────────────────┐
//!                 │ Internal  [a] [k]    │  keys[i] = min key of children[i]
//!                 └────┬────────────┬────┘
//!                      │            │
//!          ┌───────────▼──┐    ┌────▼─────────┐
//!          │ Leaf a b c   │    │ Leaf k m x   │
//!          └──────────────┘    └──────────────┘
//! ```
//! Keys compare as raw bytes. Several trees share one log, told apart by
//! the structure id stamped on every node loggable.

mod address;
mod cursor;
mod immutable;
mod mutable;
mod node;
mod reclaim;

pub use address::AddressIterator;
pub use cursor::Cursor;
pub use immutable::ImmutableTree;
pub use mutable::MutableTree;
pub use node::{Child, Node, PagePolicy};
