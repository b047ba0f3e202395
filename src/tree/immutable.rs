//! Immutable Tree
//!
//! Read-only snapshot handle: `{root address, structure id}`. Nothing a
//! snapshot reaches is ever mutated, so it can be shared indefinitely as
//! long as the files it reaches stay on disk. Handles given out by an
//! environment carry a pin that keeps the cleaner from deleting them.

use std::any::Any;
use std::sync::Arc;

use bytes::Bytes;

use crate::error::Result;
use crate::log::Log;

use super::address::AddressIterator;
use super::cursor::Cursor;
use super::node::{lookup, Child, PagePolicy};
use super::MutableTree;

/// Snapshot of a B-tree
#[derive(Clone)]
pub struct ImmutableTree {
    pub(super) log: Arc<Log>,
    pub(super) structure_id: u32,
    pub(super) policy: PagePolicy,
    /// `None` for a tree that was never saved
    root: Option<u64>,
    pin: Option<Arc<dyn Any + Send + Sync>>,
}

impl std::fmt::Debug for ImmutableTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImmutableTree")
            .field("structure_id", &self.structure_id)
            .field("root", &self.root)
            .finish()
    }
}

impl ImmutableTree {
    pub fn new(log: Arc<Log>, structure_id: u32, policy: PagePolicy, root: Option<u64>) -> Self {
        Self {
            log,
            structure_id,
            policy,
            root,
            pin: None,
        }
    }

    /// Hold `pin` for as long as this handle, its clones or its address
    /// iterators live
    pub(crate) fn pinned(mut self, pin: Arc<dyn Any + Send + Sync>) -> Self {
        self.pin = Some(pin);
        self
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Bytes>> {
        match self.root {
            Some(address) => lookup(&self.log, self.structure_id, &Child::Saved(address), key),
            None => Ok(None),
        }
    }

    /// Cheap overlay for mutation; shares all existing node addresses
    pub fn mutable_copy(&self) -> MutableTree {
        MutableTree::from_snapshot(self)
    }

    pub fn open_cursor(&self) -> Cursor<'_> {
        Cursor::new(
            Arc::clone(&self.log),
            self.structure_id,
            self.root.map(Child::Saved),
        )
    }

    /// Every reachable node address (integrity checks, utilization recompute)
    pub fn address_iterator(&self) -> AddressIterator {
        AddressIterator::new(
            Arc::clone(&self.log),
            self.structure_id,
            self.root,
            self.pin.clone(),
        )
    }

    pub fn root_address(&self) -> Option<u64> {
        self.root
    }

    pub fn structure_id(&self) -> u32 {
        self.structure_id
    }

    pub fn policy(&self) -> PagePolicy {
        self.policy
    }
}
