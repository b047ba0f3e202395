//! Address Iterator
//!
//! Depth-first walk over every node reachable from a saved root.

use std::any::Any;
use std::sync::Arc;

use crate::error::Result;
use crate::log::Log;

use super::node::{read_node, Child, Node};

/// Yields the log address of every reachable node, parents before children
pub struct AddressIterator {
    log: Arc<Log>,
    structure_id: u32,
    stack: Vec<u64>,
    failed: bool,
    _pin: Option<Arc<dyn Any + Send + Sync>>,
}

impl AddressIterator {
    pub(super) fn new(
        log: Arc<Log>,
        structure_id: u32,
        root: Option<u64>,
        pin: Option<Arc<dyn Any + Send + Sync>>,
    ) -> Self {
        Self {
            log,
            structure_id,
            stack: root.into_iter().collect(),
            failed: false,
            _pin: pin,
        }
    }
}

impl Iterator for AddressIterator {
    type Item = Result<u64>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        let address = self.stack.pop()?;
        match read_node(&self.log, address, self.structure_id) {
            Ok((Node::Internal { children, .. }, _)) => {
                // Reversed so the leftmost child is visited first
                for child in children.iter().rev() {
                    if let Child::Saved(child_address) = child {
                        self.stack.push(*child_address);
                    }
                }
                Some(Ok(address))
            }
            Ok((Node::Leaf { .. }, _)) => Some(Ok(address)),
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}
