//! Pending deletions
//!
//! Files vacated by a cleaning pass wait here until they are both due
//! (deletion delay elapsed) and invisible to every running reader.

use std::thread::{self, ThreadId};
use std::time::Instant;

use parking_lot::Mutex;

use crate::error::{LogTreeError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PendingFile {
    pub file: u64,

    /// Version of the commit that vacated the file
    pub version: u64,

    pub due: Instant,
}

/// Vacated files owned by the cleaner thread
#[derive(Debug)]
pub(crate) struct PendingDeletions {
    /// Only this thread may take files for deletion
    owner: ThreadId,
    files: Mutex<Vec<PendingFile>>,
}

impl PendingDeletions {
    /// Create a set owned by the calling thread
    pub fn new() -> Self {
        Self {
            owner: thread::current().id(),
            files: Mutex::new(Vec::new()),
        }
    }

    pub fn add(&self, files: &[u64], version: u64, due: Instant) {
        self.files
            .lock()
            .extend(files.iter().map(|&file| PendingFile { file, version, due }));
    }

    /// Put back files whose deletion failed
    pub fn restore(&self, files: Vec<PendingFile>) {
        self.files.lock().extend(files);
    }

    /// Remove and return every file that may be deleted now
    ///
    /// A file is deletable once it is due (or `ignore_delay`) and no reader
    /// older than the commit that vacated it is still running.
    pub fn take_deletable(
        &self,
        now: Instant,
        oldest_reader: Option<u64>,
        ignore_delay: bool,
    ) -> Result<Vec<PendingFile>> {
        let current = thread::current().id();
        if current != self.owner {
            return Err(LogTreeError::Misuse(format!(
                "pending files may only be deleted by the cleaner thread ({:?}), not {:?}",
                self.owner, current
            )));
        }

        let mut files = self.files.lock();
        let (ready, waiting): (Vec<_>, Vec<_>) = files.drain(..).partition(|pending| {
            (ignore_delay || pending.due <= now)
                && oldest_reader.map_or(true, |reader| reader >= pending.version)
        });
        *files = waiting;
        Ok(ready)
    }

    /// Earliest due time among waiting files
    pub fn next_due(&self) -> Option<Instant> {
        self.files.lock().iter().map(|pending| pending.due).min()
    }

    pub fn files(&self) -> Vec<u64> {
        self.files.lock().iter().map(|pending| pending.file).collect()
    }

    pub fn len(&self) -> usize {
        self.files.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn files_wait_for_their_due_time() {
        let pending = PendingDeletions::new();
        let now = Instant::now();
        pending.add(&[0, 1024], 3, now + Duration::from_secs(60));

        assert!(pending.take_deletable(now, None, false).unwrap().is_empty());
        assert_eq!(pending.len(), 2);

        let ready = pending.take_deletable(now, None, true).unwrap();
        assert_eq!(ready.len(), 2);
        assert!(pending.is_empty());
    }

    #[test]
    fn older_readers_block_deletion() {
        let pending = PendingDeletions::new();
        let now = Instant::now();
        pending.add(&[2048], 5, now);

        assert!(pending.take_deletable(now, Some(4), false).unwrap().is_empty());
        assert_eq!(pending.files(), vec![2048]);

        let ready = pending.take_deletable(now, Some(5), false).unwrap();
        assert_eq!(ready[0].file, 2048);
    }

    #[test]
    fn other_threads_cannot_take_files() {
        let pending = Arc::new(PendingDeletions::new());
        pending.add(&[0], 1, Instant::now());

        let shared = Arc::clone(&pending);
        let result = std::thread::spawn(move || shared.take_deletable(Instant::now(), None, true))
            .join()
            .unwrap();
        assert!(matches!(result, Err(LogTreeError::Misuse(_))));
        assert_eq!(pending.len(), 1);
    }
}
