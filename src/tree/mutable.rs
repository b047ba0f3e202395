//! Mutable Tree
//!
//! Single-writer copy-on-write overlay of an `ImmutableTree`.
//!
//! Every node on the path from the root to a modified leaf is copied into
//! memory (`Child::Dirty`) before it changes; the persisted original is
//! recorded as expired. `save` writes only dirty nodes, children first, and
//! returns the new root address. The snapshot the tree was copied from is
//! never touched.

use std::sync::Arc;

use bytes::Bytes;

use crate::error::{LogTreeError, Result};
use crate::log::{ExpiredLoggable, Log};

use super::cursor::Cursor;
use super::node::{lookup, read_node, Child, Node, PagePolicy, LEAF_ENTRY_OVERHEAD};
use super::ImmutableTree;

/// Copy-on-write B-tree under construction
pub struct MutableTree {
    pub(super) log: Arc<Log>,
    pub(super) structure_id: u32,
    pub(super) policy: PagePolicy,
    pub(super) root: Child,
    /// Persisted nodes replaced by in-memory copies
    pub(super) expired: Vec<ExpiredLoggable>,
}

/// Split of a node during insertion: separator key + new right sibling
type Split = Option<(Bytes, Node)>;

impl MutableTree {
    /// A new, empty tree
    pub fn new(log: Arc<Log>, structure_id: u32, policy: PagePolicy) -> Self {
        Self {
            log,
            structure_id,
            policy,
            root: Child::Dirty(Arc::new(Node::empty_leaf())),
            expired: Vec::new(),
        }
    }

    /// Overlay on top of an existing snapshot; shares every node
    pub fn from_snapshot(snapshot: &ImmutableTree) -> Self {
        match snapshot.root_address() {
            Some(address) => Self {
                log: Arc::clone(&snapshot.log),
                structure_id: snapshot.structure_id(),
                policy: snapshot.policy,
                root: Child::Saved(address),
                expired: Vec::new(),
            },
            None => Self::new(
                Arc::clone(&snapshot.log),
                snapshot.structure_id(),
                snapshot.policy,
            ),
        }
    }

    // =========================================================================
    // Reads
    // =========================================================================

    pub fn get(&self, key: &[u8]) -> Result<Option<Bytes>> {
        lookup(&self.log, self.structure_id, &self.root, key)
    }

    /// Cursor over the current state; later mutations do not affect it
    pub fn open_cursor(&self) -> Cursor<'_> {
        Cursor::new(Arc::clone(&self.log), self.structure_id, Some(self.root.clone()))
    }

    // =========================================================================
    // Mutations
    // =========================================================================

    /// Insert or replace, returning the previous value
    pub fn put(&mut self, key: &[u8], value: &[u8]) -> Result<Option<Bytes>> {
        self.check_entry(key, value)?;
        let key = Bytes::copy_from_slice(key);
        let value = Bytes::copy_from_slice(value);

        let MutableTree {
            log,
            structure_id,
            policy,
            root,
            expired,
        } = self;
        let mut writer = PathWriter {
            log: &**log,
            structure_id: *structure_id,
            policy: *policy,
            expired,
        };

        let (previous, split) = writer.insert(root, &key, &value)?;
        if let Some((separator, right)) = split {
            let left = std::mem::replace(root, Child::Saved(0));
            let left_min = left.dirty_min_key().ok_or_else(|| {
                LogTreeError::Integrity("split produced an empty left node".to_string())
            })?;
            *root = Child::Dirty(Arc::new(Node::Internal {
                keys: vec![left_min, separator],
                children: vec![left, Child::Dirty(Arc::new(right))],
            }));
        }
        Ok(previous)
    }

    /// Insert only if the key is absent; never overwrites
    pub fn add(&mut self, key: &[u8], value: &[u8]) -> Result<bool> {
        if self.get(key)?.is_some() {
            return Ok(false);
        }
        self.put(key, value)?;
        Ok(true)
    }

    /// Remove a key, returning whether it was present
    pub fn delete(&mut self, key: &[u8]) -> Result<bool> {
        // A miss must not copy the path
        if self.get(key)?.is_none() {
            return Ok(false);
        }

        let MutableTree {
            log,
            structure_id,
            policy,
            root,
            expired,
        } = self;
        let mut writer = PathWriter {
            log: &**log,
            structure_id: *structure_id,
            policy: *policy,
            expired,
        };

        let removed = writer.remove(root, key)?;
        writer.collapse_root(root)?;
        Ok(removed.is_some())
    }

    /// Write dirty nodes to the log and return the new root address
    pub fn save(&mut self) -> Result<u64> {
        let MutableTree {
            log,
            structure_id,
            root,
            ..
        } = self;
        save_child(&**log, *structure_id, root)
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn structure_id(&self) -> u32 {
        self.structure_id
    }

    /// Root address if nothing changed since the last save
    pub fn root_address(&self) -> Option<u64> {
        self.root.address()
    }

    pub fn is_dirty(&self) -> bool {
        self.root.is_dirty()
    }

    /// Expired loggables collected so far, leaving the list empty
    pub fn take_expired(&mut self) -> Vec<ExpiredLoggable> {
        std::mem::take(&mut self.expired)
    }

    pub fn expired(&self) -> &[ExpiredLoggable] {
        &self.expired
    }

    /// Bytes of persisted nodes copied into memory
    pub fn expired_bytes(&self) -> u64 {
        self.expired.iter().map(|e| e.length).sum()
    }

    /// Snapshot of the last saved state, if saved
    pub fn snapshot(&self) -> Option<ImmutableTree> {
        self.root_address().map(|address| {
            ImmutableTree::new(
                Arc::clone(&self.log),
                self.structure_id,
                self.policy,
                Some(address),
            )
        })
    }

    fn check_entry(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let size = LEAF_ENTRY_OVERHEAD + key.len() + value.len();
        let limit = self.policy.max_entry_len();
        if size > limit || key.len() > u16::MAX as usize {
            return Err(LogTreeError::EntryTooLarge { size, limit });
        }
        Ok(())
    }
}

/// Borrowed state for one path-copying operation
pub(super) struct PathWriter<'t> {
    pub(super) log: &'t Log,
    pub(super) structure_id: u32,
    pub(super) policy: PagePolicy,
    pub(super) expired: &'t mut Vec<ExpiredLoggable>,
}

impl<'t> PathWriter<'t> {
    /// Copy a saved node into memory (expiring the original) and return it
    pub(super) fn make_dirty<'c>(&mut self, child: &'c mut Child) -> Result<&'c mut Node> {
        if let Child::Saved(address) = *child {
            let (node, loggable) = read_node(self.log, address, self.structure_id)?;
            self.expired.push(loggable.expired());
            *child = Child::Dirty(Arc::new(node));
        }
        dirty_mut(child)
    }

    fn insert(&mut self, child: &mut Child, key: &Bytes, value: &Bytes) -> Result<(Option<Bytes>, Split)> {
        let policy = self.policy;
        let node = self.make_dirty(child)?;

        let previous = match node {
            Node::Leaf { entries } => {
                match entries.binary_search_by(|(k, _)| k.as_ref().cmp(key.as_ref())) {
                    Ok(i) => Some(std::mem::replace(&mut entries[i].1, value.clone())),
                    Err(i) => {
                        entries.insert(i, (key.clone(), value.clone()));
                        None
                    }
                }
            }
            Node::Internal { keys, children } => {
                let i = Node::child_index(keys, key);
                let (previous, split) = self.insert(&mut children[i], key, value)?;
                if let Some(min) = children[i].dirty_min_key() {
                    keys[i] = min;
                }
                if let Some((separator, right)) = split {
                    keys.insert(i + 1, separator);
                    children.insert(i + 1, Child::Dirty(Arc::new(right)));
                }
                previous
            }
        };

        if policy.overflows(node) {
            let right = node.split_off_half();
            let separator = right.min_key().cloned().ok_or_else(|| {
                LogTreeError::Integrity("split produced an empty right node".to_string())
            })?;
            return Ok((previous, Some((separator, right))));
        }
        Ok((previous, None))
    }

    fn remove(&mut self, child: &mut Child, key: &[u8]) -> Result<Option<Bytes>> {
        let node = self.make_dirty(child)?;
        match node {
            Node::Leaf { entries } => Ok(entries
                .binary_search_by(|(k, _)| k.as_ref().cmp(key))
                .ok()
                .map(|i| entries.remove(i).1)),
            Node::Internal { keys, children } => {
                let i = Node::child_index(keys, key);
                let removed = self.remove(&mut children[i], key)?;
                if removed.is_some() {
                    self.rebalance(keys, children, i)?;
                }
                Ok(removed)
            }
        }
    }

    /// Fix up `children[i]` after it shrank: drop it when empty, refresh its
    /// separator, merge or redistribute with a sibling when it underflows
    fn rebalance(&mut self, keys: &mut Vec<Bytes>, children: &mut Vec<Child>, i: usize) -> Result<()> {
        let (is_empty, underflow, min) = {
            let node = dirty_mut(&mut children[i])?;
            (node.is_empty(), self.policy.underflows(node), node.min_key().cloned())
        };
        if is_empty {
            keys.remove(i);
            children.remove(i);
            return Ok(());
        }
        if let Some(min) = min {
            keys[i] = min;
        }
        if !underflow || children.len() < 2 {
            return Ok(());
        }

        let (l, r) = if i + 1 < children.len() { (i, i + 1) } else { (i - 1, i) };
        self.make_dirty(&mut children[l])?;
        self.make_dirty(&mut children[r])?;

        let merged = {
            let (head, tail) = children.split_at_mut(r);
            let left = dirty_mut(&mut head[l])?;
            let right = dirty_mut(&mut tail[0])?;
            if self.policy.can_merge(left, right) {
                let moved = std::mem::replace(right, Node::empty_leaf());
                left.absorb(moved)?;
                true
            } else {
                let moved = std::mem::replace(right, Node::empty_leaf());
                left.absorb(moved)?;
                *right = left.split_off_half();
                if let Some(min) = right.min_key() {
                    keys[r] = min.clone();
                }
                false
            }
        };

        if merged {
            keys.remove(r);
            children.remove(r);
        }
        if let Some(min) = children[l].dirty_min_key() {
            keys[l] = min;
        }
        Ok(())
    }

    /// Replace an internal root with a single child by that child
    fn collapse_root(&mut self, root: &mut Child) -> Result<()> {
        loop {
            let replacement = match root {
                Child::Dirty(node) => match Arc::make_mut(node) {
                    Node::Internal { children, .. } if children.len() == 1 => children.pop(),
                    Node::Internal { children, .. } if children.is_empty() => {
                        Some(Child::Dirty(Arc::new(Node::empty_leaf())))
                    }
                    _ => None,
                },
                Child::Saved(_) => None,
            };
            match replacement {
                Some(child) => *root = child,
                None => return Ok(()),
            }
        }
    }
}

/// Mutable access to a node already copied into memory
pub(super) fn dirty_mut(child: &mut Child) -> Result<&mut Node> {
    match child {
        Child::Dirty(node) => Ok(Arc::make_mut(node)),
        Child::Saved(address) => Err(LogTreeError::Integrity(format!(
            "node {} was expected to be in memory",
            address
        ))),
    }
}

/// Post-order write of every dirty node under `child`
fn save_child(log: &Log, structure_id: u32, child: &mut Child) -> Result<u64> {
    let address = match child {
        Child::Saved(address) => return Ok(*address),
        Child::Dirty(node) => {
            let node = Arc::make_mut(node);
            if let Node::Internal { children, .. } = node {
                for c in children.iter_mut() {
                    save_child(log, structure_id, c)?;
                }
            }
            let (loggable_type, payload) = node.encode()?;
            log.append(loggable_type, structure_id, &payload)?
        }
    };
    *child = Child::Saved(address);
    Ok(address)
}
