//! File handle cache
//!
//! LRU cache of read-only handles to log files. Owned by one `Log`
//! instance, so two environments in a process never share handles.

use std::collections::{HashMap, VecDeque};
use std::fs::File;
use std::io;
use std::sync::Arc;

use parking_lot::Mutex;

/// Bounded LRU cache: file address → open handle
pub struct FileCache {
    capacity: usize,
    inner: Mutex<CacheState>,
}

#[derive(Default)]
struct CacheState {
    files: HashMap<u64, Arc<File>>,
    /// Least recently used at the front
    order: VecDeque<u64>,
    hits: u64,
    misses: u64,
}

impl CacheState {
    fn touch(&mut self, file_address: u64) {
        if let Some(pos) = self.order.iter().position(|&a| a == file_address) {
            self.order.remove(pos);
        }
        self.order.push_back(file_address);
    }
}

impl FileCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(CacheState::default()),
        }
    }

    /// Get the cached handle or open one with `open`, evicting the
    /// least recently used handle when full
    pub fn get_or_open<F>(&self, file_address: u64, open: F) -> io::Result<Arc<File>>
    where
        F: FnOnce() -> io::Result<File>,
    {
        let mut state = self.inner.lock();
        if let Some(file) = state.files.get(&file_address).cloned() {
            state.hits += 1;
            state.touch(file_address);
            return Ok(file);
        }

        state.misses += 1;
        let file = Arc::new(open()?);
        while state.files.len() >= self.capacity {
            match state.order.pop_front() {
                Some(victim) => {
                    state.files.remove(&victim);
                }
                None => break,
            }
        }
        state.files.insert(file_address, Arc::clone(&file));
        state.touch(file_address);
        Ok(file)
    }

    /// Drop the handle of a removed or truncated file
    pub fn evict(&self, file_address: u64) {
        let mut state = self.inner.lock();
        if state.files.remove(&file_address).is_some() {
            state.order.retain(|&a| a != file_address);
        }
    }

    pub fn clear(&self) {
        let mut state = self.inner.lock();
        state.files.clear();
        state.order.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// (hits, misses)
    pub fn stats(&self) -> (u64, u64) {
        let state = self.inner.lock();
        (state.hits, state.misses)
    }
}
