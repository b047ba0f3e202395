//! Reclaim
//!
//! Relocation of still-live nodes out of a file the cleaner wants to vacate.
//!
//! A persisted node is live when the current tree reaches it. Because
//! `keys[i]` of every internal node is the smallest key below `children[i]`,
//! a live node lies on the search path of its own smallest key; descending
//! that path and comparing child addresses decides liveness without any
//! reverse index. A live node is relocated by copying every node on the path
//! into memory, so the next `save` writes it at a fresh address.

use crate::error::{LogTreeError, Result};
use crate::log::{Loggable, LoggableIterator};

use super::mutable::PathWriter;
use super::node::{resolve, Child, Node};
use super::MutableTree;

impl MutableTree {
    /// Relocate `loggable` and the same-tree loggables directly following it
    /// in `tail` (up to `file_end`) if the current tree still references them.
    ///
    /// Returns the number of nodes copied for relocation.
    pub fn reclaim(
        &mut self,
        loggable: &Loggable,
        tail: &mut LoggableIterator<'_>,
        file_end: u64,
    ) -> Result<usize> {
        let mut relocated = usize::from(self.reclaim_one(loggable)?);

        let structure_id = self.structure_id;
        while let Some(next) =
            tail.next_if(|l| l.structure_id == structure_id && l.address < file_end)?
        {
            if self.reclaim_one(&next)? {
                relocated += 1;
            }
        }
        Ok(relocated)
    }

    /// Whether the current tree references the node stored at `loggable`
    pub fn is_live(&self, loggable: &Loggable) -> Result<bool> {
        Ok(self.find_path(loggable)?.is_some())
    }

    fn reclaim_one(&mut self, loggable: &Loggable) -> Result<bool> {
        if loggable.structure_id != self.structure_id {
            return Err(LogTreeError::Misuse(format!(
                "loggable at {} belongs to structure {}, not {}",
                loggable.address, loggable.structure_id, self.structure_id
            )));
        }
        let path = match self.find_path(loggable)? {
            Some(path) => path,
            None => return Ok(false),
        };

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

        let mut node = writer.make_dirty(root)?;
        for index in path {
            node = match node {
                Node::Internal { children, .. } => writer.make_dirty(&mut children[index])?,
                Node::Leaf { .. } => {
                    return Err(LogTreeError::Integrity(format!(
                        "reclaim path for {} runs through a leaf",
                        loggable.address
                    )))
                }
            };
        }
        Ok(true)
    }

    /// Child indices from the root down to the node at `loggable.address`;
    /// `Some(vec![])` when it is the root, `None` when it is unreachable
    fn find_path(&self, loggable: &Loggable) -> Result<Option<Vec<usize>>> {
        if self.root.address() == Some(loggable.address) {
            return Ok(Some(Vec::new()));
        }

        let target = Node::decode(loggable)?;
        let key = match target.min_key() {
            Some(key) => key.clone(),
            // Only a root can be empty
            None => return Ok(None),
        };

        let mut path = Vec::new();
        let mut node = resolve(&self.log, self.structure_id, &self.root)?;
        loop {
            let next = match &*node {
                Node::Leaf { .. } => return Ok(None),
                Node::Internal { keys, children } => {
                    let index = Node::child_index(keys, &key);
                    path.push(index);
                    match &children[index] {
                        Child::Saved(address) if *address == loggable.address => {
                            return Ok(Some(path))
                        }
                        child => resolve(&self.log, self.structure_id, child)?,
                    }
                }
            };
            node = next;
        }
    }
}
