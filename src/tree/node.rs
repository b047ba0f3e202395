//! B-Tree nodes
//!
//! In-memory node representation, its on-log encoding and the page policy.
//!
//! ## Leaf Payload
//! ```text
//! ┌───────────┬──────────────────────────────────────────────┐
//! │ Count (4) │ [KeyLen u16][ValLen u32][Key][Value] * Count │
//! └───────────┴──────────────────────────────────────────────┘
//! ```
//!
//! ## Internal Payload
//! ```text
//! ┌───────────┬──────────────────────────────────────────────┐
//! │ Count (4) │ [KeyLen u16][Child u64][Key] * Count         │
//! └───────────┴──────────────────────────────────────────────┘
//! ```
//! `keys[i]` of an internal node is the smallest key of `children[i]`.

use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes};

use crate::error::{LogTreeError, Result};
use crate::log::{Log, Loggable, LoggableType};

/// Count prefix of every payload
pub(crate) const NODE_HEADER_SIZE: usize = 4;

/// Per-entry overhead of a leaf: key len (2) + value len (4)
pub(crate) const LEAF_ENTRY_OVERHEAD: usize = 6;

/// Per-entry overhead of an internal node: key len (2) + child address (8)
pub(crate) const INTERNAL_ENTRY_OVERHEAD: usize = 10;

/// A tree node. Nodes reachable from a saved root are never mutated;
/// a `MutableTree` copies them into `Child::Dirty` before changing them.
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Leaf { entries: Vec<(Bytes, Bytes)> },
    Internal { keys: Vec<Bytes>, children: Vec<Child> },
}

/// Reference from a parent (or a tree handle) to a node
#[derive(Debug, Clone, PartialEq)]
pub enum Child {
    /// Persisted node at this log address
    Saved(u64),

    /// New or copied node not yet written to the log
    Dirty(Arc<Node>),
}

/// Split/merge thresholds derived from the page budget
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PagePolicy {
    /// Serialized size above which a node is split
    pub page_size: usize,

    /// Percent of `page_size` below which a node is merged or rebalanced
    pub merge_percent: usize,
}

impl Default for PagePolicy {
    fn default() -> Self {
        Self {
            page_size: 4096,
            merge_percent: 40,
        }
    }
}

impl PagePolicy {
    pub fn new(page_size: usize, merge_percent: usize) -> Self {
        Self {
            page_size,
            merge_percent,
        }
    }

    pub fn overflows(&self, node: &Node) -> bool {
        node.len() >= 2 && node.encoded_len() > self.page_size
    }

    pub fn underflows(&self, node: &Node) -> bool {
        node.encoded_len() < self.page_size * self.merge_percent / 100
    }

    /// Two nodes fit into one page
    pub fn can_merge(&self, left: &Node, right: &Node) -> bool {
        left.encoded_len() + right.encoded_len() - NODE_HEADER_SIZE <= self.page_size
    }

    /// Largest leaf entry (key + value + overhead) a tree accepts
    pub fn max_entry_len(&self) -> usize {
        (self.page_size - NODE_HEADER_SIZE) / 2
    }
}

impl Node {
    pub fn empty_leaf() -> Self {
        Node::Leaf {
            entries: Vec::new(),
        }
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self, Node::Leaf { .. })
    }

    /// Number of entries (leaf) or children (internal)
    pub fn len(&self) -> usize {
        match self {
            Node::Leaf { entries } => entries.len(),
            Node::Internal { children, .. } => children.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn min_key(&self) -> Option<&Bytes> {
        match self {
            Node::Leaf { entries } => entries.first().map(|(k, _)| k),
            Node::Internal { keys, .. } => keys.first(),
        }
    }

    pub fn child(&self, index: usize) -> Option<&Child> {
        match self {
            Node::Leaf { .. } => None,
            Node::Internal { children, .. } => children.get(index),
        }
    }

    pub fn entry(&self, index: usize) -> Option<&(Bytes, Bytes)> {
        match self {
            Node::Leaf { entries } => entries.get(index),
            Node::Internal { .. } => None,
        }
    }

    /// Serialized payload size
    pub fn encoded_len(&self) -> usize {
        match self {
            Node::Leaf { entries } => {
                NODE_HEADER_SIZE
                    + entries
                        .iter()
                        .map(|(k, v)| LEAF_ENTRY_OVERHEAD + k.len() + v.len())
                        .sum::<usize>()
            }
            Node::Internal { keys, .. } => {
                NODE_HEADER_SIZE
                    + keys
                        .iter()
                        .map(|k| INTERNAL_ENTRY_OVERHEAD + k.len())
                        .sum::<usize>()
            }
        }
    }

    /// Move the upper half (by serialized size for leaves, by count for
    /// internal nodes) into a new right sibling
    pub fn split_off_half(&mut self) -> Node {
        match self {
            Node::Leaf { entries } => {
                let total: usize = entries
                    .iter()
                    .map(|(k, v)| LEAF_ENTRY_OVERHEAD + k.len() + v.len())
                    .sum();
                let mut acc = 0;
                let mut at = entries.len() / 2;
                for (i, (k, v)) in entries.iter().enumerate() {
                    acc += LEAF_ENTRY_OVERHEAD + k.len() + v.len();
                    if acc * 2 >= total {
                        at = i + 1;
                        break;
                    }
                }
                let at = at.clamp(1, entries.len().saturating_sub(1).max(1));
                Node::Leaf {
                    entries: entries.split_off(at),
                }
            }
            Node::Internal { keys, children } => {
                let at = (children.len() / 2).max(1);
                Node::Internal {
                    keys: keys.split_off(at),
                    children: children.split_off(at),
                }
            }
        }
    }

    /// Append all entries of the right sibling `right`
    pub fn absorb(&mut self, right: Node) -> Result<()> {
        match (self, right) {
            (Node::Leaf { entries }, Node::Leaf { entries: more }) => {
                entries.extend(more);
                Ok(())
            }
            (
                Node::Internal { keys, children },
                Node::Internal {
                    keys: more_keys,
                    children: more_children,
                },
            ) => {
                keys.extend(more_keys);
                children.extend(more_children);
                Ok(())
            }
            _ => Err(LogTreeError::Integrity(
                "cannot merge a leaf with an internal node".to_string(),
            )),
        }
    }

    /// Index of the child whose range contains `key`
    pub fn child_index(keys: &[Bytes], key: &[u8]) -> usize {
        match keys.binary_search_by(|k| k.as_ref().cmp(key)) {
            Ok(i) => i,
            Err(0) => 0,
            Err(i) => i - 1,
        }
    }

    // =========================================================================
    // Encoding
    // =========================================================================

    /// Encode for the log. Every child must already be saved.
    pub fn encode(&self) -> Result<(LoggableType, Vec<u8>)> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        match self {
            Node::Leaf { entries } => {
                buf.put_u32_le(entries.len() as u32);
                for (key, value) in entries {
                    buf.put_u16_le(key.len() as u16);
                    buf.put_u32_le(value.len() as u32);
                    buf.put_slice(key);
                    buf.put_slice(value);
                }
                Ok((LoggableType::LeafNode, buf))
            }
            Node::Internal { keys, children } => {
                buf.put_u32_le(children.len() as u32);
                for (key, child) in keys.iter().zip(children) {
                    let address = match child {
                        Child::Saved(address) => *address,
                        Child::Dirty(_) => {
                            return Err(LogTreeError::Integrity(
                                "internal node encoded before its children were saved".to_string(),
                            ))
                        }
                    };
                    buf.put_u16_le(key.len() as u16);
                    buf.put_u64_le(address);
                    buf.put_slice(key);
                }
                Ok((LoggableType::InternalNode, buf))
            }
        }
    }

    /// Decode a node loggable
    pub fn decode(loggable: &Loggable) -> Result<Node> {
        let corrupt = |what: &str| {
            LogTreeError::Corruption(format!(
                "undeserializable node at {}: {}",
                loggable.address, what
            ))
        };

        let mut buf = loggable.data.clone();
        if buf.remaining() < NODE_HEADER_SIZE {
            return Err(corrupt("missing count"));
        }
        let count = buf.get_u32_le() as usize;

        match loggable.loggable_type {
            LoggableType::LeafNode => {
                let mut entries = Vec::with_capacity(count.min(4096));
                for _ in 0..count {
                    if buf.remaining() < LEAF_ENTRY_OVERHEAD {
                        return Err(corrupt("truncated leaf entry header"));
                    }
                    let key_len = buf.get_u16_le() as usize;
                    let value_len = buf.get_u32_le() as usize;
                    if buf.remaining() < key_len + value_len {
                        return Err(corrupt("truncated leaf entry"));
                    }
                    let key = buf.split_to(key_len);
                    let value = buf.split_to(value_len);
                    entries.push((key, value));
                }
                if buf.has_remaining() {
                    return Err(corrupt("trailing bytes"));
                }
                Ok(Node::Leaf { entries })
            }
            LoggableType::InternalNode => {
                let mut keys = Vec::with_capacity(count.min(4096));
                let mut children = Vec::with_capacity(count.min(4096));
                for _ in 0..count {
                    if buf.remaining() < INTERNAL_ENTRY_OVERHEAD {
                        return Err(corrupt("truncated internal entry header"));
                    }
                    let key_len = buf.get_u16_le() as usize;
                    let address = buf.get_u64_le();
                    if buf.remaining() < key_len {
                        return Err(corrupt("truncated internal key"));
                    }
                    keys.push(buf.split_to(key_len));
                    children.push(Child::Saved(address));
                }
                if buf.has_remaining() {
                    return Err(corrupt("trailing bytes"));
                }
                if children.is_empty() {
                    return Err(corrupt("internal node without children"));
                }
                Ok(Node::Internal { keys, children })
            }
            other => Err(corrupt(&format!("{:?} is not a tree node", other))),
        }
    }
}

impl Child {
    pub fn address(&self) -> Option<u64> {
        match self {
            Child::Saved(address) => Some(*address),
            Child::Dirty(_) => None,
        }
    }

    pub fn is_dirty(&self) -> bool {
        matches!(self, Child::Dirty(_))
    }

    /// Smallest key of an in-memory node
    pub(crate) fn dirty_min_key(&self) -> Option<Bytes> {
        match self {
            Child::Dirty(node) => node.min_key().cloned(),
            Child::Saved(_) => None,
        }
    }
}

/// Read a persisted node, checking it belongs to `structure_id`
pub(crate) fn read_node(log: &Log, address: u64, structure_id: u32) -> Result<(Node, Loggable)> {
    let loggable = log.read(address)?;
    if loggable.structure_id != structure_id {
        return Err(LogTreeError::Corruption(format!(
            "node at {} belongs to structure {}, expected {}",
            address, loggable.structure_id, structure_id
        )));
    }
    let node = Node::decode(&loggable)?;
    Ok((node, loggable))
}

/// Node behind a child reference, loading saved nodes from the log
pub(crate) fn resolve(log: &Log, structure_id: u32, child: &Child) -> Result<Arc<Node>> {
    match child {
        Child::Dirty(node) => Ok(Arc::clone(node)),
        Child::Saved(address) => read_node(log, *address, structure_id).map(|(n, _)| Arc::new(n)),
    }
}

/// Point lookup starting at `root`
pub(crate) fn lookup(log: &Log, structure_id: u32, root: &Child, key: &[u8]) -> Result<Option<Bytes>> {
    let mut current = resolve(log, structure_id, root)?;
    loop {
        let next = match &*current {
            Node::Leaf { entries } => {
                return Ok(entries
                    .binary_search_by(|(k, _)| k.as_ref().cmp(key))
                    .ok()
                    .map(|i| entries[i].1.clone()));
            }
            Node::Internal { keys, children } => {
                let index = Node::child_index(keys, key);
                resolve(log, structure_id, &children[index])?
            }
        };
        current = next;
    }
}
