//! Tree Cursor
//!
//! Bidirectional iteration over one tree state. The cursor holds `Arc`
//! references to the nodes on its path; a `MutableTree` copies shared nodes
//! before changing them, so a cursor never observes later mutations.

use std::marker::PhantomData;
use std::sync::Arc;

use bytes::Bytes;

use crate::error::Result;
use crate::log::Log;

use super::node::{resolve, Child, Node};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Position {
    /// Never moved: `get_next` goes to the first entry, `get_prev` to the last
    Unset,
    /// On the entry at the top of `stack`
    Valid,
    /// Walked off the front
    BeforeFirst,
    /// Walked off the end (or a range search found nothing)
    AfterLast,
}

/// Cursor over a tree snapshot
///
/// The lifetime ties the cursor to the transaction it was opened in; the
/// nodes it may still load are guaranteed to exist for that long.
pub struct Cursor<'a> {
    log: Arc<Log>,
    structure_id: u32,
    root: Option<Child>,
    /// Path from the root: (node, index of child or entry)
    stack: Vec<(Arc<Node>, usize)>,
    position: Position,
    _txn: PhantomData<&'a ()>,
}

impl<'a> Cursor<'a> {
    pub(crate) fn new(log: Arc<Log>, structure_id: u32, root: Option<Child>) -> Self {
        Self {
            log,
            structure_id,
            root,
            stack: Vec::new(),
            position: Position::Unset,
            _txn: PhantomData,
        }
    }

    // =========================================================================
    // Navigation
    // =========================================================================

    /// Move to the next entry; from a fresh cursor, to the first one
    pub fn get_next(&mut self) -> Result<bool> {
        let moved = match self.position {
            Position::Unset | Position::BeforeFirst => self.seek_first()?,
            Position::Valid => self.move_forward()?,
            Position::AfterLast => false,
        };
        self.position = if moved { Position::Valid } else { Position::AfterLast };
        Ok(moved)
    }

    /// Move to the previous entry; from a fresh cursor, to the last one
    pub fn get_prev(&mut self) -> Result<bool> {
        let moved = match self.position {
            Position::Unset | Position::AfterLast => self.seek_last()?,
            Position::Valid => self.move_backward()?,
            Position::BeforeFirst => false,
        };
        self.position = if moved { Position::Valid } else { Position::BeforeFirst };
        Ok(moved)
    }

    /// Position on `key` exactly. On a miss the position is unchanged.
    pub fn get_search_key(&mut self, key: &[u8]) -> Result<Option<Bytes>> {
        let mut path = match self.descend(key)? {
            Some(path) => path,
            None => return Ok(None),
        };
        let found = match path.last() {
            Some((leaf, _)) => match &**leaf {
                Node::Leaf { entries } => entries.binary_search_by(|(k, _)| k.as_ref().cmp(key)).ok(),
                Node::Internal { .. } => None,
            },
            None => None,
        };
        match found {
            Some(index) => {
                if let Some(top) = path.last_mut() {
                    top.1 = index;
                }
                self.stack = path;
                self.position = Position::Valid;
                Ok(self.value().cloned())
            }
            None => Ok(None),
        }
    }

    /// Position on the smallest key `>= key` (ceiling search)
    pub fn get_search_key_range(&mut self, key: &[u8]) -> Result<Option<Bytes>> {
        let mut path = match self.descend(key)? {
            Some(path) => path,
            None => {
                self.stack.clear();
                self.position = Position::AfterLast;
                return Ok(None);
            }
        };
        let (index, len) = match path.last() {
            Some((leaf, _)) => match &**leaf {
                Node::Leaf { entries } => (
                    entries
                        .binary_search_by(|(k, _)| k.as_ref().cmp(key))
                        .unwrap_or_else(|i| i),
                    entries.len(),
                ),
                Node::Internal { .. } => (0, 0),
            },
            None => (0, 0),
        };

        let positioned = if index < len {
            if let Some(top) = path.last_mut() {
                top.1 = index;
            }
            self.stack = path;
            true
        } else {
            // Past the last entry of this leaf: the ceiling is the first
            // entry of the next leaf, if any
            if let Some(top) = path.last_mut() {
                top.1 = len.saturating_sub(1);
            }
            self.stack = path;
            len > 0 && self.move_forward()?
        };

        if positioned {
            self.position = Position::Valid;
            Ok(self.value().cloned())
        } else {
            self.stack.clear();
            self.position = Position::AfterLast;
            Ok(None)
        }
    }

    // =========================================================================
    // Current Entry
    // =========================================================================

    pub fn key(&self) -> Option<&Bytes> {
        self.current().map(|(k, _)| k)
    }

    pub fn value(&self) -> Option<&Bytes> {
        self.current().map(|(_, v)| v)
    }

    /// Number of values at the current key (no duplicates: 0 or 1)
    pub fn value_count(&self) -> usize {
        usize::from(self.current().is_some())
    }

    fn current(&self) -> Option<&(Bytes, Bytes)> {
        if self.position != Position::Valid {
            return None;
        }
        let (leaf, index) = self.stack.last()?;
        leaf.entry(*index)
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    /// Path to the leaf whose range contains `key`
    fn descend(&self, key: &[u8]) -> Result<Option<Vec<(Arc<Node>, usize)>>> {
        let root = match &self.root {
            Some(root) => root,
            None => return Ok(None),
        };
        let mut path = Vec::new();
        let mut node = resolve(&self.log, self.structure_id, root)?;
        loop {
            let next = match &*node {
                Node::Leaf { .. } => None,
                Node::Internal { keys, children } => {
                    let index = Node::child_index(keys, key);
                    Some((index, resolve(&self.log, self.structure_id, &children[index])?))
                }
            };
            match next {
                Some((index, child)) => {
                    path.push((node, index));
                    node = child;
                }
                None => {
                    path.push((node, 0));
                    return Ok(Some(path));
                }
            }
        }
    }

    fn seek_first(&mut self) -> Result<bool> {
        self.stack.clear();
        let root = match &self.root {
            Some(root) => resolve(&self.log, self.structure_id, root)?,
            None => return Ok(false),
        };
        self.descend_edge(root, Edge::Leftmost)
    }

    fn seek_last(&mut self) -> Result<bool> {
        self.stack.clear();
        let root = match &self.root {
            Some(root) => resolve(&self.log, self.structure_id, root)?,
            None => return Ok(false),
        };
        self.descend_edge(root, Edge::Rightmost)
    }

    /// Push the leftmost/rightmost path under `node`; false if it ends in an empty leaf
    fn descend_edge(&mut self, mut node: Arc<Node>, edge: Edge) -> Result<bool> {
        loop {
            let len = node.len();
            let index = match edge {
                Edge::Leftmost => 0,
                Edge::Rightmost => len.saturating_sub(1),
            };
            let child = match node.child(index) {
                Some(child) => Some(resolve(&self.log, self.structure_id, child)?),
                None => None,
            };
            self.stack.push((node, index));
            match child {
                Some(child) => node = child,
                None => return Ok(len > 0),
            }
        }
    }

    fn move_forward(&mut self) -> Result<bool> {
        if let Some((leaf, index)) = self.stack.last_mut() {
            if *index + 1 < leaf.len() {
                *index += 1;
                return Ok(true);
            }
        }
        self.stack.pop();
        while let Some((node, index)) = self.stack.pop() {
            if index + 1 < node.len() {
                let next = index + 1;
                let child = match node.child(next) {
                    Some(child) => resolve(&self.log, self.structure_id, child)?,
                    None => continue,
                };
                self.stack.push((node, next));
                if self.descend_edge(child, Edge::Leftmost)? {
                    return Ok(true);
                }
                // Empty leaf: keep walking right
                return self.move_forward();
            }
        }
        Ok(false)
    }

    fn move_backward(&mut self) -> Result<bool> {
        if let Some((_, index)) = self.stack.last_mut() {
            if *index > 0 {
                *index -= 1;
                return Ok(true);
            }
        }
        self.stack.pop();
        while let Some((node, index)) = self.stack.pop() {
            if index > 0 {
                let prev = index - 1;
                let child = match node.child(prev) {
                    Some(child) => resolve(&self.log, self.structure_id, child)?,
                    None => continue,
                };
                self.stack.push((node, prev));
                if self.descend_edge(child, Edge::Rightmost)? {
                    return Ok(true);
                }
                return self.move_backward();
            }
        }
        Ok(false)
    }
}

#[derive(Debug, Clone, Copy)]
enum Edge {
    Leftmost,
    Rightmost,
}

impl<'a> Iterator for Cursor<'a> {
    type Item = Result<(Bytes, Bytes)>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.get_next() {
            Ok(true) => self.current().cloned().map(Ok),
            Ok(false) => None,
            Err(e) => Some(Err(e)),
        }
    }
}
