//! Transactions
//!
//! A write `Transaction` holds the environment's write lock from begin to
//! commit/abort and stages changes in `MutableTree` overlays. A
//! `ReadTransaction` pins one committed snapshot.

use std::any::Any;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::MutexGuard;
use tracing::{debug, warn};

use crate::error::{LogTreeError, Result};
use crate::log::{ExpiredLoggable, LoggableType, NO_STRUCTURE_ID};
use crate::tree::{Child, Cursor, ImmutableTree, MutableTree};

use super::environment::EnvInner;
use super::meta::{
    is_reserved, DatabaseRoot, ReaderPin, Snapshot, Store, StoreMeta, META_STRUCTURE_ID,
};

/// Isolation flavour of a write transaction
///
/// All kinds serialize on the same write lock. They differ in how the
/// cleaner may use them and in how a failed flush is reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionKind {
    /// Application writes; flush failures are returned as I/O errors
    Regular,

    /// Cleaner pass limited to one file; a failed flush is `FlushRefused`
    Gc,

    /// Cleaner pass over many files; a failed flush is an integrity violation
    Exclusive,
}

/// Read-write transaction
pub struct Transaction<'e> {
    env: &'e EnvInner,
    kind: TransactionKind,
    _guard: MutexGuard<'e, ()>,

    /// Snapshot the transaction started from
    base: Arc<Snapshot>,

    /// Working copy of the store table
    stores: BTreeMap<String, StoreMeta>,
    ids: HashMap<u32, String>,

    /// Trees touched so far, by structure id
    trees: HashMap<u32, MutableTree>,
    meta: Option<MutableTree>,

    /// Stores whose meta entry must be rewritten
    changed: BTreeSet<String>,
    removed: Vec<String>,

    /// Nodes of removed stores
    expired: Vec<ExpiredLoggable>,

    next_structure_id: u32,

    /// Log high address at begin; abort rolls back to it
    start_address: u64,

    finished: bool,
}

impl<'e> Transaction<'e> {
    pub(crate) fn begin(env: &'e EnvInner, kind: TransactionKind, guard: MutexGuard<'e, ()>) -> Self {
        let base = env.current();
        let stores = base.stores.clone();
        let ids = stores
            .iter()
            .map(|(name, meta)| (meta.structure_id, name.clone()))
            .collect();
        Self {
            env,
            kind,
            _guard: guard,
            next_structure_id: base.next_structure_id,
            start_address: env.log.high_address(),
            base,
            stores,
            ids,
            trees: HashMap::new(),
            meta: None,
            changed: BTreeSet::new(),
            removed: Vec::new(),
            expired: Vec::new(),
            finished: false,
        }
    }

    pub fn kind(&self) -> TransactionKind {
        self.kind
    }

    /// Version of the snapshot this transaction builds on
    pub fn version(&self) -> u64 {
        self.base.version
    }

    // =========================================================================
    // Stores
    // =========================================================================

    /// Open a store, creating it if it does not exist
    pub fn open_store(&mut self, name: &str) -> Result<Store> {
        if is_reserved(name) {
            return Err(LogTreeError::Misuse(format!(
                "store name '{}' is reserved",
                name
            )));
        }
        Ok(self.open_store_internal(name))
    }

    pub(crate) fn open_store_internal(&mut self, name: &str) -> Store {
        if let Some(meta) = self.stores.get(name) {
            return Store::new(name, meta.structure_id);
        }

        let structure_id = self.next_structure_id;
        self.next_structure_id += 1;
        self.stores.insert(
            name.to_string(),
            StoreMeta {
                structure_id,
                root: None,
            },
        );
        self.ids.insert(structure_id, name.to_string());
        self.trees.insert(
            structure_id,
            MutableTree::new(Arc::clone(&self.env.log), structure_id, self.env.policy),
        );
        self.changed.insert(name.to_string());
        debug!(store = name, structure_id, "created store");
        Store::new(name, structure_id)
    }

    /// Handle of an existing store
    pub fn store(&self, name: &str) -> Result<Store> {
        self.stores
            .get(name)
            .map(|meta| Store::new(name, meta.structure_id))
            .ok_or_else(|| LogTreeError::StoreNotFound(name.to_string()))
    }

    /// Remove a store and expire every node it owns
    pub fn remove_store(&mut self, name: &str) -> Result<()> {
        if is_reserved(name) {
            return Err(LogTreeError::Misuse(format!(
                "store name '{}' is reserved",
                name
            )));
        }
        let meta = self
            .stores
            .remove(name)
            .ok_or_else(|| LogTreeError::StoreNotFound(name.to_string()))?;
        self.ids.remove(&meta.structure_id);
        self.trees.remove(&meta.structure_id);
        self.changed.remove(name);
        self.removed.push(name.to_string());

        if let Some(root) = meta.root {
            let tree = ImmutableTree::new(
                Arc::clone(&self.env.log),
                meta.structure_id,
                self.env.policy,
                Some(root),
            );
            for address in tree.address_iterator() {
                let address = address?;
                let length = self.env.log.record_length(address)?;
                self.expired.push(ExpiredLoggable::new(address, length));
            }
        }
        debug!(store = name, "removed store");
        Ok(())
    }

    /// Names of user stores visible to this transaction
    pub fn store_names(&self) -> Vec<String> {
        self.stores
            .keys()
            .filter(|name| !is_reserved(name))
            .cloned()
            .collect()
    }

    // =========================================================================
    // Data Operations
    // =========================================================================

    pub fn get(&self, store: &Store, key: &[u8]) -> Result<Option<Bytes>> {
        let root = self.check_store(store)?;
        match self.trees.get(&store.structure_id()) {
            Some(tree) => tree.get(key),
            None => self.snapshot_tree(store.structure_id(), root).get(key),
        }
    }

    /// Insert or replace, returning the previous value
    pub fn put(&mut self, store: &Store, key: &[u8], value: &[u8]) -> Result<Option<Bytes>> {
        self.tree_mut(store)?.put(key, value)
    }

    /// Insert only if absent
    pub fn add(&mut self, store: &Store, key: &[u8], value: &[u8]) -> Result<bool> {
        self.tree_mut(store)?.add(key, value)
    }

    pub fn delete(&mut self, store: &Store, key: &[u8]) -> Result<bool> {
        self.tree_mut(store)?.delete(key)
    }

    /// Cursor over the store as this transaction currently sees it
    pub fn open_cursor(&self, store: &Store) -> Result<Cursor<'_>> {
        let root = self.check_store(store)?;
        Ok(match self.trees.get(&store.structure_id()) {
            Some(tree) => tree.open_cursor(),
            None => Cursor::new(
                Arc::clone(&self.env.log),
                store.structure_id(),
                root.map(Child::Saved),
            ),
        })
    }

    // =========================================================================
    // Cleaner Support
    // =========================================================================

    /// Tree owning `structure_id` for relocation; `None` if no live store owns it
    pub(crate) fn tree_for_reclaim(&mut self, structure_id: u32) -> Result<Option<&mut MutableTree>> {
        if structure_id == META_STRUCTURE_ID {
            return Ok(Some(self.meta_mut()));
        }
        let name = match self.ids.get(&structure_id) {
            Some(name) => name.clone(),
            None => return Ok(None),
        };
        let store = Store::new(name, structure_id);
        self.tree_mut(&store).map(Some)
    }

    /// Bytes of persisted nodes copied into memory by this transaction
    pub(crate) fn expired_bytes(&self) -> u64 {
        self.trees.values().map(MutableTree::expired_bytes).sum::<u64>()
            + self.meta.as_ref().map_or(0, MutableTree::expired_bytes)
    }

    // =========================================================================
    // Completion
    // =========================================================================

    /// Persist all changes and publish them; returns the committed version
    ///
    /// A transaction without changes writes nothing and returns the version
    /// it started from.
    pub fn commit(mut self) -> Result<u64> {
        let env = self.env;
        let mut expired = std::mem::take(&mut self.expired);

        for (structure_id, tree) in self.trees.iter_mut() {
            if !tree.is_dirty() {
                continue;
            }
            let root = tree.save()?;
            if let Some(name) = self.ids.get(structure_id) {
                if let Some(meta) = self.stores.get_mut(name) {
                    meta.root = Some(root);
                }
                self.changed.insert(name.clone());
            }
        }
        for tree in self.trees.values_mut() {
            expired.extend(tree.take_expired());
        }

        let meta_dirty = self.meta.as_ref().map_or(false, MutableTree::is_dirty);
        if self.changed.is_empty() && self.removed.is_empty() && !meta_dirty {
            self.finished = true;
            return Ok(self.base.version);
        }

        let removed = std::mem::take(&mut self.removed);
        let changed = std::mem::take(&mut self.changed);
        let mut entries = Vec::with_capacity(changed.len());
        for name in &changed {
            if let Some(meta) = self.stores.get(name) {
                entries.push((name.clone(), meta.encode()?));
            }
        }
        let meta_tree = self.meta_mut();
        for name in &removed {
            meta_tree.delete(name.as_bytes())?;
        }
        for (name, value) in &entries {
            meta_tree.put(name.as_bytes(), value)?;
        }
        let meta_root = meta_tree.save()?;
        expired.extend(meta_tree.take_expired());

        if let Some(previous) = self.base.root_address {
            expired.push(ExpiredLoggable::new(previous, env.log.record_length(previous)?));
        }

        let version = self.base.version + 1;
        let root = DatabaseRoot {
            version,
            meta_root,
            next_structure_id: self.next_structure_id,
        };
        let root_address = env
            .log
            .append(LoggableType::DatabaseRoot, NO_STRUCTURE_ID, &root.encode()?)?;
        self.flush()?;

        env.publish(Snapshot {
            version,
            root_address: Some(root_address),
            meta_root: Some(meta_root),
            next_structure_id: self.next_structure_id,
            stores: std::mem::take(&mut self.stores),
        });
        self.finished = true;
        env.utilization.fetch_expired_loggables(&expired);

        debug!(
            version,
            kind = ?self.kind,
            stores = changed.len(),
            expired = expired.len(),
            "committed"
        );
        Ok(version)
    }

    /// Discard all changes
    pub fn abort(mut self) {
        self.rollback();
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    fn check_store(&self, store: &Store) -> Result<Option<u64>> {
        match self.stores.get(store.name()) {
            Some(meta) if meta.structure_id == store.structure_id() => Ok(meta.root),
            _ => Err(LogTreeError::StoreNotFound(store.name().to_string())),
        }
    }

    fn snapshot_tree(&self, structure_id: u32, root: Option<u64>) -> ImmutableTree {
        ImmutableTree::new(Arc::clone(&self.env.log), structure_id, self.env.policy, root)
    }

    fn tree_mut(&mut self, store: &Store) -> Result<&mut MutableTree> {
        let root = self.check_store(store)?;
        let env = self.env;
        Ok(self
            .trees
            .entry(store.structure_id())
            .or_insert_with(|| {
                ImmutableTree::new(Arc::clone(&env.log), store.structure_id(), env.policy, root)
                    .mutable_copy()
            }))
    }

    fn meta_mut(&mut self) -> &mut MutableTree {
        let env = self.env;
        let root = self.base.meta_root;
        self.meta.get_or_insert_with(|| {
            ImmutableTree::new(Arc::clone(&env.log), META_STRUCTURE_ID, env.policy, root)
                .mutable_copy()
        })
    }

    fn flush(&self) -> Result<()> {
        let result = self
            .env
            .log
            .flush()
            .and_then(|_| self.env.sync_after_commit());
        result.map_err(|e| match self.kind {
            TransactionKind::Regular => e,
            TransactionKind::Gc => LogTreeError::FlushRefused(e.to_string()),
            TransactionKind::Exclusive => {
                LogTreeError::Integrity(format!("exclusive transaction failed to flush: {}", e))
            }
        })
    }

    fn rollback(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        if let Err(e) = self.env.log.rollback(self.start_address) {
            warn!(error = %e, "failed to roll back aborted transaction");
        }
    }
}

impl<'e> Drop for Transaction<'e> {
    fn drop(&mut self) {
        self.rollback();
    }
}

/// Read-only view of one committed version
pub struct ReadTransaction<'e> {
    env: &'e EnvInner,
    snapshot: Arc<Snapshot>,
    /// Shared with every tree handed out, so files stay on disk until the
    /// last of them is gone
    pin: Arc<ReaderPin>,
}

impl<'e> ReadTransaction<'e> {
    pub(crate) fn begin(env: &'e EnvInner) -> Self {
        // Registered under the snapshot lock so a concurrent commit cannot
        // slip between reading the version and registering it
        let (snapshot, pin) = {
            let current = env.snapshot.read();
            let pin = env.readers.pin(current.version);
            (Arc::clone(&*current), pin)
        };
        Self { env, snapshot, pin }
    }

    pub fn version(&self) -> u64 {
        self.snapshot.version
    }

    pub fn store(&self, name: &str) -> Result<Store> {
        self.snapshot
            .stores
            .get(name)
            .map(|meta| Store::new(name, meta.structure_id))
            .ok_or_else(|| LogTreeError::StoreNotFound(name.to_string()))
    }

    pub fn store_names(&self) -> Vec<String> {
        self.snapshot
            .stores
            .keys()
            .filter(|name| !is_reserved(name))
            .cloned()
            .collect()
    }

    /// Snapshot of a store's tree, readable after this transaction ends
    pub fn tree(&self, store: &Store) -> Result<ImmutableTree> {
        match self.snapshot.stores.get(store.name()) {
            Some(meta) if meta.structure_id == store.structure_id() => {
                Ok(self.pinned_tree(meta.structure_id, meta.root))
            }
            _ => Err(LogTreeError::StoreNotFound(store.name().to_string())),
        }
    }

    fn pinned_tree(&self, structure_id: u32, root: Option<u64>) -> ImmutableTree {
        ImmutableTree::new(Arc::clone(&self.env.log), structure_id, self.env.policy, root)
            .pinned(Arc::clone(&self.pin) as Arc<dyn Any + Send + Sync>)
    }

    pub fn get(&self, store: &Store, key: &[u8]) -> Result<Option<Bytes>> {
        self.tree(store)?.get(key)
    }

    pub fn open_cursor(&self, store: &Store) -> Result<Cursor<'_>> {
        let tree = self.tree(store)?;
        Ok(Cursor::new(
            Arc::clone(&self.env.log),
            tree.structure_id(),
            tree.root_address().map(Child::Saved),
        ))
    }

    /// Trees of every store, reserved ones included, plus the meta tree
    pub fn all_trees(&self) -> Vec<ImmutableTree> {
        let mut trees = vec![self.pinned_tree(META_STRUCTURE_ID, self.snapshot.meta_root)];
        trees.extend(
            self.snapshot
                .stores
                .values()
                .map(|meta| self.pinned_tree(meta.structure_id, meta.root)),
        );
        trees
    }

    /// Address of the root record of this version
    pub fn root_address(&self) -> Option<u64> {
        self.snapshot.root_address
    }
}
