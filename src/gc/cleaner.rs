//! Cleaner
//!
//! The background thread behind `GarbageCollector`. It owns the schedule,
//! the pending-deletion set and every cleaning pass; requests arrive as
//! jobs on one queue and run strictly one after another.
//!
//! ## File Lifecycle
//! ```text
//!   live ──pass──► cleaned (pending) ──flush + sync──► deleted / renamed
//!         commit                        no older reader,
//!         relocates live nodes          delay elapsed
//! ```

use std::sync::Arc;
use std::time::Instant;

use crossbeam::channel::{Receiver, RecvTimeoutError};
use tracing::{debug, error, info, warn};

use crate::env::{EnvInner, Transaction, TransactionKind};
use crate::error::{LogTreeError, Result};
use crate::log::{Log, RemoveMode, NO_STRUCTURE_ID};

use super::collector::{GcShared, Job};
use super::pending::PendingDeletions;
use super::utilization::UtilizationSource;

pub(crate) struct Cleaner {
    env: Arc<EnvInner>,
    shared: Arc<GcShared>,
    jobs: Receiver<Job>,
    pending: PendingDeletions,

    /// No automatic pass before this
    earliest_start: Instant,

    /// Next scheduled cycle
    wake_at: Option<Instant>,

    /// Deletion was blocked (readers, lock, error); do not retry before this
    retry_deletion_at: Option<Instant>,

    /// Files started since the last pass
    new_files: u64,
}

impl Cleaner {
    pub fn new(env: Arc<EnvInner>, shared: Arc<GcShared>, jobs: Receiver<Job>) -> Self {
        let earliest_start = Instant::now() + env.config.gc_start_in();
        Self {
            env,
            shared,
            jobs,
            // Created on the cleaner thread, which thereby owns deletion
            pending: PendingDeletions::new(),
            earliest_start,
            wake_at: None,
            retry_deletion_at: None,
            new_files: 0,
        }
    }

    /// Job loop; returns after `Finish` or when the handle is gone
    pub fn run(mut self) {
        debug!("cleaner started");
        loop {
            let job = match self.next_deadline() {
                Some(deadline) => match self.jobs.recv_deadline(deadline) {
                    Ok(job) => Some(job),
                    Err(RecvTimeoutError::Timeout) => None,
                    Err(RecvTimeoutError::Disconnected) => break,
                },
                None => match self.jobs.recv() {
                    Ok(job) => Some(job),
                    Err(_) => break,
                },
            };

            match job {
                Some(Job::Finish(reply)) => {
                    let _ = reply.send(self.finish());
                    break;
                }
                Some(job) => self.handle(job),
                None => self.on_timer(),
            }
        }
        debug!("cleaner stopped");
    }

    // =========================================================================
    // Scheduling
    // =========================================================================

    fn handle(&mut self, job: Job) {
        match job {
            Job::NewFile(file_address) => self.on_new_file(file_address),
            Job::Wake => {
                if self.env.config.gc_enabled {
                    self.schedule(Instant::now());
                }
            }
            Job::WakeAt(at) => {
                if self.env.config.gc_enabled {
                    self.schedule(at);
                }
            }
            Job::ComputeUtilization(source) => {
                if let Err(e) = self.compute_utilization(&source) {
                    error!(error = %e, "utilization recomputation failed");
                }
            }
            Job::RunNow(reply) => {
                let result = self.cycle();
                if result.is_err() {
                    self.shared.record_abort();
                }
                let _ = reply.send(result);
                self.delete_due_logged(false);
            }
            Job::CompactLog(reply) => {
                let _ = reply.send(self.compact());
            }
            Job::DeletePending(reply) => {
                let _ = reply.send(self.delete_due(true));
            }
            Job::Barrier(reply) => {
                let _ = reply.send(());
            }
            Job::Finish(_) => {}
        }
    }

    fn on_timer(&mut self) {
        let now = Instant::now();
        if self.wake_at.map_or(false, |at| at <= now) {
            self.wake_at = None;
            self.cycle_logged();
        }
        if self.deletion_deadline().map_or(false, |at| at <= now) {
            self.retry_deletion_at = None;
            self.delete_due_logged(false);
        }
    }

    fn on_new_file(&mut self, file_address: u64) {
        self.new_files += 1;
        if !self.env.config.gc_enabled || self.new_files < self.env.config.gc_files_delta {
            return;
        }
        let utilization = &self.env.utilization;
        utilization.estimate_total_bytes();
        if utilization.needs_cleaning() {
            debug!(
                file = file_address,
                free_percent = utilization.total_free_space_percent(),
                "fragmentation threshold crossed"
            );
            self.schedule(Instant::now());
        }
    }

    fn schedule(&mut self, at: Instant) {
        let at = at.max(self.earliest_start);
        self.wake_at = Some(self.wake_at.map_or(at, |current| current.min(at)));
    }

    fn deletion_deadline(&self) -> Option<Instant> {
        let due = self.pending.next_due()?;
        Some(self.retry_deletion_at.map_or(due, |retry| retry.max(due)))
    }

    fn next_deadline(&self) -> Option<Instant> {
        match (self.wake_at, self.deletion_deadline()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    // =========================================================================
    // Cleaning
    // =========================================================================

    /// Steady-state cycle: clean the most fragmented files if free space
    /// exceeds the target
    fn cycle(&mut self) -> Result<bool> {
        if self.shared.is_suspended() {
            debug!("cleaner suspended, skipping cycle");
            return Ok(false);
        }
        let utilization = Arc::clone(&self.env.utilization);
        utilization.estimate_total_bytes();
        if !utilization.needs_cleaning() {
            return Ok(false);
        }
        let cutoff = match utilization.min_file_age_cutoff() {
            Some(cutoff) => cutoff,
            None => return Ok(false),
        };

        let exclusive = self.env.config.gc_use_exclusive_transaction;
        let kind = if exclusive {
            TransactionKind::Exclusive
        } else {
            TransactionKind::Gc
        };
        let budget = Instant::now() + self.env.config.gc_pass_budget();
        let candidates = utilization.files_sorted_by_utilization(cutoff);

        let cleaned = self.pass(candidates, kind, Some(budget), !exclusive)?;
        self.new_files = 0;
        Ok(cleaned > 0)
    }

    fn cycle_logged(&mut self) {
        if let Err(e) = self.cycle() {
            self.shared.record_abort();
            if e.is_transient() {
                warn!(error = %e, "cleaning pass aborted, retrying later");
            } else if e.is_fatal() {
                error!(error = %e, "cleaning pass hit corrupted data, environment is unsafe to write");
            } else {
                error!(error = %e, "cleaning pass failed");
            }
            self.schedule(Instant::now() + self.env.config.gc_retry_delay());
        }
    }

    /// Whole-log compaction: clean every file below the newest one, delete
    /// the vacated files, repeat while the file count shrinks
    fn compact(&mut self) -> Result<usize> {
        let log = Arc::clone(&self.env.log);
        let utilization = Arc::clone(&self.env.utilization);
        let mut total = 0;

        loop {
            let before = log.number_of_files();
            let high_file = match log.high_file_address() {
                Some(high_file) => high_file,
                None => break,
            };
            // Not every file below the high one: a file without free bytes
            // would only be copied forward unchanged, and less than one file
            // of garbage in total cannot lower the file count. Either pass
            // would rewrite live data for nothing.
            let files: Vec<u64> = log
                .all_file_addresses()
                .into_iter()
                .filter(|&f| f < high_file && !utilization.is_cleaned(f))
                .filter(|&f| utilization.file_free_bytes(f) > 0)
                .collect();
            let garbage: u64 = files.iter().map(|&f| utilization.file_free_bytes(f)).sum();
            if files.is_empty() || garbage < log.file_length_bound() {
                break;
            }

            let cleaned = self.pass(files, TransactionKind::Exclusive, None, false)?;
            total += cleaned;
            self.delete_due(true)?;
            if cleaned == 0 || log.number_of_files() >= before {
                break;
            }
        }

        info!(files_cleaned = total, files = log.number_of_files(), "log compaction done");
        Ok(total)
    }

    /// One pass over `files` in a single transaction; returns files cleaned
    ///
    /// Stops before the next file when: one file is done and `single_file`,
    /// the collector was suspended, the budget elapsed or the copied nodes
    /// exceed the memory limit.
    fn pass<I>(
        &mut self,
        files: I,
        kind: TransactionKind,
        budget: Option<Instant>,
        single_file: bool,
    ) -> Result<usize>
    where
        I: IntoIterator<Item = u64>,
    {
        let env = Arc::clone(&self.env);
        let memory_limit = env.config.gc_memory_limit_bytes;
        let mut txn = env.begin_transaction(kind, Some(env.config.gc_acquire_timeout()))?;

        let mut cleaned = Vec::new();
        let mut reclaimed = 0;
        for file in files {
            if !cleaned.is_empty() {
                if single_file || self.shared.is_suspended() {
                    break;
                }
                if budget.map_or(false, |deadline| Instant::now() >= deadline) {
                    debug!("pass time budget elapsed");
                    break;
                }
                if txn.expired_bytes() > memory_limit {
                    debug!(limit = memory_limit, "pass memory limit reached");
                    break;
                }
            }
            if env.utilization.is_cleaned(file) {
                return Err(LogTreeError::Integrity(format!(
                    "file {:016x} was already cleaned",
                    file
                )));
            }

            match clean_file(&env.log, &mut txn, file) {
                Ok(count) => {
                    debug!(file, relocated = count, "cleaned file");
                    reclaimed += count;
                    cleaned.push(file);
                }
                Err(e) => {
                    error!(file, error = %e, "failed to clean file");
                    return Err(e);
                }
            }
        }

        if cleaned.is_empty() {
            return Ok(0);
        }
        let version = txn.commit()?;

        env.utilization.mark_cleaned(&cleaned)?;
        self.pending
            .add(&cleaned, version, Instant::now() + env.config.gc_deletion_delay());
        self.shared.set_pending(self.pending.len());
        self.shared.record_pass(cleaned.len(), reclaimed);
        debug!(
            files = ?cleaned,
            relocated = reclaimed,
            version,
            "cleaning pass committed"
        );
        Ok(cleaned.len())
    }

    // =========================================================================
    // Deletion
    // =========================================================================

    /// Delete pending files that are due and no reader can see
    fn delete_due(&mut self, ignore_delay: bool) -> Result<usize> {
        if self.pending.is_empty() {
            return Ok(0);
        }
        let env = Arc::clone(&self.env);
        let retry_at = Instant::now() + env.config.gc_retry_delay();

        // No transaction may hold unflushed appends while files go away
        let _guard = match env.write_lock.try_lock_for(env.config.gc_acquire_timeout()) {
            Some(guard) => guard,
            None => {
                self.retry_deletion_at = Some(retry_at);
                return Ok(0);
            }
        };
        let files = self
            .pending
            .take_deletable(Instant::now(), env.readers.oldest(), ignore_delay)?;
        if !self.pending.is_empty() {
            self.retry_deletion_at = Some(retry_at);
        }
        if files.is_empty() {
            return Ok(0);
        }

        if let Err(e) = env.log.flush_and_sync() {
            self.pending.restore(files);
            return Err(e);
        }

        let mode = if env.config.gc_rename_files {
            RemoveMode::Rename
        } else {
            RemoveMode::Delete
        };
        let mut deleted = 0;
        for (i, pending) in files.iter().enumerate() {
            if let Err(e) = env.log.remove_file(pending.file, mode) {
                self.pending.restore(files[i..].to_vec());
                self.shared.set_pending(self.pending.len());
                return Err(e);
            }
            env.utilization.remove_file(pending.file);
            self.shared.record_deletion();
            deleted += 1;
            debug!(file = pending.file, ?mode, "removed log file");
        }
        self.shared.set_pending(self.pending.len());
        Ok(deleted)
    }

    fn delete_due_logged(&mut self, ignore_delay: bool) {
        if let Err(e) = self.delete_due(ignore_delay) {
            error!(error = %e, "failed to delete pending files");
            self.retry_deletion_at = Some(Instant::now() + self.env.config.gc_retry_delay());
        }
    }

    fn finish(&mut self) -> Result<()> {
        self.delete_due(true)?;
        if !self.pending.is_empty() {
            warn!(
                files = ?self.pending.files(),
                "pending files still visible to readers, left on disk"
            );
        }
        Ok(())
    }

    // =========================================================================
    // Utilization
    // =========================================================================

    fn compute_utilization(&mut self, source: &UtilizationSource) -> Result<()> {
        let utilization = Arc::clone(&self.env.utilization);
        match source {
            UtilizationSource::Scratch => {
                let txn = self.env.begin_read();
                utilization.compute_from_scratch(&txn.all_trees(), txn.root_address())?;
                info!(
                    files = utilization.entries().len(),
                    free_percent = utilization.total_free_space_percent(),
                    "recomputed utilization from scratch"
                );
                Ok(())
            }
            UtilizationSource::Report(path) => match utilization.import_report(path) {
                Ok(count) => {
                    info!(path = %path.display(), entries = count, "imported utilization report");
                    Ok(())
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "bad utilization report, recomputing");
                    self.compute_utilization(&UtilizationSource::Scratch)
                }
            },
        }
    }
}

/// Relocate every live node of one file; returns the number relocated
fn clean_file(log: &Log, txn: &mut Transaction<'_>, file_address: u64) -> Result<usize> {
    let file_end = file_address + log.file_length_bound();
    let mut loggables = log.file_iterator(file_address);
    let mut relocated = 0;
    while let Some(loggable) = loggables.next() {
        let loggable = loggable?;
        if loggable.structure_id == NO_STRUCTURE_ID {
            continue;
        }
        if let Some(tree) = txn.tree_for_reclaim(loggable.structure_id)? {
            relocated += tree.reclaim(&loggable, &mut loggables, file_end)?;
        }
    }
    Ok(relocated)
}
