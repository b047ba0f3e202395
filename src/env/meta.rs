//! Environment metadata
//!
//! Root records, the store table and the registry of running readers.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{LogTreeError, Result};
use crate::log::{Loggable, LoggableType};

/// Structure id of the tree mapping store names to `StoreMeta`
pub(crate) const META_STRUCTURE_ID: u32 = 1;

/// First structure id handed out to stores
pub(crate) const FIRST_STORE_ID: u32 = 2;

/// Store names with this prefix belong to the engine itself
pub(crate) const RESERVED_PREFIX: &str = "__";

/// Reserved store holding the persisted utilization profile
pub(crate) const UTILIZATION_STORE: &str = "__utilization__";

/// Appended by every commit; the newest valid one is the database state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseRoot {
    /// Commit counter, starting at 1
    pub version: u64,

    /// Root address of the meta tree
    pub meta_root: u64,

    /// Next structure id to hand out
    pub next_structure_id: u32,
}

impl DatabaseRoot {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(loggable: &Loggable) -> Result<Self> {
        if loggable.loggable_type != LoggableType::DatabaseRoot {
            return Err(LogTreeError::Corruption(format!(
                "loggable at {} is {:?}, not a database root",
                loggable.address, loggable.loggable_type
            )));
        }
        Ok(bincode::deserialize(&loggable.data)?)
    }
}

/// Value of a store entry in the meta tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreMeta {
    pub structure_id: u32,

    /// Root of the store's tree; `None` until first committed
    pub root: Option<u64>,
}

impl StoreMeta {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// Handle of a named key/value store
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Store {
    name: String,
    structure_id: u32,
}

impl Store {
    pub(crate) fn new(name: impl Into<String>, structure_id: u32) -> Self {
        Self {
            name: name.into(),
            structure_id,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn structure_id(&self) -> u32 {
        self.structure_id
    }
}

/// Committed database state published to readers
#[derive(Debug, Clone, Default)]
pub(crate) struct Snapshot {
    /// 0 for a database that never committed
    pub version: u64,

    /// Address of the root record that produced this state
    pub root_address: Option<u64>,

    pub meta_root: Option<u64>,

    pub next_structure_id: u32,

    pub stores: BTreeMap<String, StoreMeta>,
}

impl Snapshot {
    pub fn empty() -> Self {
        Self {
            next_structure_id: FIRST_STORE_ID,
            ..Self::default()
        }
    }
}

/// Versions of running read transactions
///
/// Files vacated by a commit are deleted only once no reader older than
/// that commit remains.
#[derive(Debug, Default)]
pub(crate) struct ReaderRegistry {
    active: Mutex<BTreeMap<u64, usize>>,
}

impl ReaderRegistry {
    pub fn register(&self, version: u64) {
        *self.active.lock().entry(version).or_insert(0) += 1;
    }

    pub fn unregister(&self, version: u64) {
        let mut active = self.active.lock();
        if let Some(count) = active.get_mut(&version) {
            *count -= 1;
            if *count == 0 {
                active.remove(&version);
            }
        }
    }

    /// Version of the oldest running reader
    pub fn oldest(&self) -> Option<u64> {
        self.active.lock().keys().next().copied()
    }

    pub fn len(&self) -> usize {
        self.active.lock().values().sum()
    }

    /// Register `version` until the returned pin and all its clones drop
    pub fn pin(self: &Arc<Self>, version: u64) -> Arc<ReaderPin> {
        self.register(version);
        Arc::new(ReaderPin {
            registry: Arc::clone(self),
            version,
        })
    }
}

/// Keeps one reader version registered while anything holds it
#[derive(Debug)]
pub(crate) struct ReaderPin {
    registry: Arc<ReaderRegistry>,
    version: u64,
}

impl Drop for ReaderPin {
    fn drop(&mut self) {
        self.registry.unregister(self.version);
    }
}

pub(crate) fn is_reserved(name: &str) -> bool {
    name.starts_with(RESERVED_PREFIX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn root_record_requires_root_type() {
        let root = DatabaseRoot {
            version: 3,
            meta_root: 128,
            next_structure_id: 5,
        };
        let mut loggable = Loggable {
            address: 40,
            loggable_type: LoggableType::DatabaseRoot,
            structure_id: 0,
            data: Bytes::from(root.encode().unwrap()),
        };
        assert_eq!(DatabaseRoot::decode(&loggable).unwrap(), root);

        loggable.loggable_type = LoggableType::LeafNode;
        assert!(matches!(
            DatabaseRoot::decode(&loggable),
            Err(LogTreeError::Corruption(_))
        ));
    }

    #[test]
    fn registry_tracks_oldest_reader() {
        let registry = ReaderRegistry::default();
        assert_eq!(registry.oldest(), None);

        registry.register(7);
        registry.register(4);
        registry.register(4);
        assert_eq!(registry.oldest(), Some(4));
        assert_eq!(registry.len(), 3);

        registry.unregister(4);
        assert_eq!(registry.oldest(), Some(4));
        registry.unregister(4);
        assert_eq!(registry.oldest(), Some(7));
        registry.unregister(7);
        assert_eq!(registry.oldest(), None);
    }
}
