//! Garbage Collector handle
//!
//! Public face of the cleaner thread. Every request is a `Job` on the
//! cleaner's queue; blocking requests carry a reply channel.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crossbeam::channel::{self, Sender};
use parking_lot::Mutex;
use tracing::debug;

use crate::env::EnvInner;
use crate::error::{LogTreeError, Result};

use super::cleaner::Cleaner;
use super::utilization::UtilizationSource;

/// Work items of the cleaner thread
pub(crate) enum Job {
    /// The log started a file
    NewFile(u64),
    Wake,
    WakeAt(Instant),
    ComputeUtilization(UtilizationSource),
    RunNow(Sender<Result<bool>>),
    CompactLog(Sender<Result<usize>>),
    DeletePending(Sender<Result<usize>>),
    Barrier(Sender<()>),
    Finish(Sender<Result<()>>),
}

/// Counters since the environment was opened
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcStats {
    /// Cleaning passes that committed
    pub passes: u64,

    /// Passes abandoned (contention or failure)
    pub aborted_passes: u64,

    pub files_cleaned: u64,
    pub files_deleted: u64,

    /// Live nodes copied out of cleaned files
    pub loggables_reclaimed: u64,

    /// Files vacated but not yet deleted
    pub pending_files: usize,
}

/// State shared between the handle and the cleaner thread
#[derive(Debug, Default)]
pub(crate) struct GcShared {
    suspended: AtomicBool,
    passes: AtomicU64,
    aborted_passes: AtomicU64,
    files_cleaned: AtomicU64,
    files_deleted: AtomicU64,
    loggables_reclaimed: AtomicU64,
    pending_files: AtomicUsize,
}

impl GcShared {
    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::SeqCst)
    }

    pub fn record_pass(&self, files: usize, reclaimed: usize) {
        self.passes.fetch_add(1, Ordering::Relaxed);
        self.files_cleaned.fetch_add(files as u64, Ordering::Relaxed);
        self.loggables_reclaimed
            .fetch_add(reclaimed as u64, Ordering::Relaxed);
    }

    pub fn record_abort(&self) {
        self.aborted_passes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_deletion(&self) {
        self.files_deleted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_pending(&self, count: usize) {
        self.pending_files.store(count, Ordering::Relaxed);
    }

    fn snapshot(&self) -> GcStats {
        GcStats {
            passes: self.passes.load(Ordering::Relaxed),
            aborted_passes: self.aborted_passes.load(Ordering::Relaxed),
            files_cleaned: self.files_cleaned.load(Ordering::Relaxed),
            files_deleted: self.files_deleted.load(Ordering::Relaxed),
            loggables_reclaimed: self.loggables_reclaimed.load(Ordering::Relaxed),
            pending_files: self.pending_files.load(Ordering::Relaxed),
        }
    }
}

/// Sender half handed to the log's new-file listener
#[derive(Clone)]
pub(crate) struct GcTrigger {
    jobs: Sender<Job>,
}

impl GcTrigger {
    pub fn new_file(&self, file_address: u64) {
        // A finished cleaner has dropped its receiver; nothing to notify
        let _ = self.jobs.send(Job::NewFile(file_address));
    }
}

/// Background log cleaner
pub struct GarbageCollector {
    jobs: Sender<Job>,
    shared: Arc<GcShared>,
    handle: Mutex<Option<JoinHandle<()>>>,
    finished: AtomicBool,
}

impl GarbageCollector {
    /// Spawn the cleaner thread
    pub(crate) fn start(env: Arc<EnvInner>) -> Result<Self> {
        let (jobs, receiver) = channel::unbounded();
        let shared = Arc::new(GcShared::default());
        let enabled = env.config.gc_enabled;

        let cleaner_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("logtree-cleaner".to_string())
            .spawn(move || Cleaner::new(env, cleaner_shared, receiver).run())?;

        let gc = Self {
            jobs,
            shared,
            handle: Mutex::new(Some(handle)),
            finished: AtomicBool::new(false),
        };
        if enabled {
            gc.wake()?;
        }
        Ok(gc)
    }

    pub(crate) fn trigger(&self) -> GcTrigger {
        GcTrigger {
            jobs: self.jobs.clone(),
        }
    }

    /// Queue recomputation of the utilization profile
    pub(crate) fn compute_utilization(&self, source: UtilizationSource) -> Result<()> {
        self.send(Job::ComputeUtilization(source))
    }

    // =========================================================================
    // Scheduling
    // =========================================================================

    /// Check for work as soon as the configured start delay allows
    pub fn wake(&self) -> Result<()> {
        self.send(Job::Wake)
    }

    /// Check for work at `at` (not before the start delay)
    pub fn wake_at(&self, at: Instant) -> Result<()> {
        self.send(Job::WakeAt(at))
    }

    /// Prevent further passes; a running pass finishes its current file
    pub fn suspend(&self) {
        self.shared.suspended.store(true, Ordering::SeqCst);
        debug!("cleaner suspended");
    }

    pub fn resume(&self) -> Result<()> {
        self.shared.suspended.store(false, Ordering::SeqCst);
        debug!("cleaner resumed");
        self.wake()
    }

    pub fn is_suspended(&self) -> bool {
        self.shared.is_suspended()
    }

    // =========================================================================
    // Blocking Requests
    // =========================================================================

    /// Run one steady-state cycle now; true if files were cleaned
    pub fn run_now(&self) -> Result<bool> {
        self.request(Job::RunNow)?
    }

    /// Clean every file below the newest while the file count shrinks;
    /// returns the number of files cleaned
    pub fn compact_log(&self) -> Result<usize> {
        self.request(Job::CompactLog)?
    }

    /// Delete every pending file no reader can still see, ignoring the delay
    pub fn delete_pending_files(&self) -> Result<usize> {
        self.request(Job::DeletePending)?
    }

    /// Return once every job queued before this call has run
    pub fn wait_idle(&self) -> Result<()> {
        self.request(Job::Barrier)
    }

    pub fn stats(&self) -> GcStats {
        self.shared.snapshot()
    }

    /// Run a final deletion pass and stop the cleaner thread
    pub fn finish(&self) -> Result<()> {
        if self.finished.swap(true, Ordering::SeqCst) {
            return Err(LogTreeError::Misuse(
                "garbage collector already finished".to_string(),
            ));
        }
        let (reply, result) = channel::bounded(1);
        let outcome = match self.jobs.send(Job::Finish(reply)) {
            Ok(()) => result.recv().unwrap_or(Err(LogTreeError::Closed)),
            Err(_) => Err(LogTreeError::Closed),
        };
        if let Some(handle) = self.handle.lock().take() {
            if handle.join().is_err() {
                return Err(LogTreeError::Integrity("cleaner thread panicked".to_string()));
            }
        }
        outcome
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    fn send(&self, job: Job) -> Result<()> {
        if self.is_finished() {
            return Err(LogTreeError::Closed);
        }
        self.jobs.send(job).map_err(|_| LogTreeError::Closed)
    }

    fn request<T>(&self, job: impl FnOnce(Sender<T>) -> Job) -> Result<T> {
        let (reply, result) = channel::bounded(1);
        self.send(job(reply))?;
        result.recv().map_err(|_| LogTreeError::Closed)
    }
}

impl Drop for GarbageCollector {
    fn drop(&mut self) {
        if !self.is_finished() {
            let _ = self.finish();
        }
    }
}
