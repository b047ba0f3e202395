//! Utilization Profile
//!
//! Per-file free-byte accounting and fragmentation ranking.
//!
//! ## Responsibilities
//! - Add the length of every expired loggable to its file's counter
//! - Keep total bytes / total free bytes over files old enough to clean
//! - Rank cleanable files most-fragmented-first, bounded in size and work
//! - Load/export counters, recompute them from live trees or a report file
//!
//! ## Concurrency:
//! - One mutex over the whole counter map. Updates come from commits and
//!   the cleaner; neither is frequent enough to contend.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::Config;
use crate::error::{LogTreeError, Result};
use crate::log::{ExpiredLoggable, Log};
use crate::tree::ImmutableTree;

/// Where to rebuild the profile from when none was persisted
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UtilizationSource {
    /// Walk every live tree and count reachable bytes
    Scratch,

    /// Read `<file address> <free bytes>` lines
    Report(PathBuf),
}

/// Free-byte counters of the log files
pub struct UtilizationProfile {
    log: Arc<Log>,

    /// Newest files never counted or cleaned
    min_file_age: usize,

    /// Target utilization percent
    min_utilization: u8,

    /// Bound of the candidate index built per pass
    max_candidates: usize,

    state: Mutex<ProfileState>,
}

#[derive(Debug, Default)]
struct ProfileState {
    /// file address → free bytes
    free: BTreeMap<u64, u64>,

    /// Vacated files awaiting deletion
    cleaned: BTreeSet<u64>,

    total_bytes: u64,
    total_free: u64,
}

impl UtilizationProfile {
    pub fn new(log: Arc<Log>, config: &Config) -> Self {
        Self {
            log,
            min_file_age: config.gc_min_file_age,
            min_utilization: config.gc_min_utilization,
            max_candidates: config.gc_max_candidates.max(1),
            state: Mutex::new(ProfileState::default()),
        }
    }

    // =========================================================================
    // Counters
    // =========================================================================

    /// Account expired loggables to the files holding them
    pub fn fetch_expired_loggables(&self, expired: &[ExpiredLoggable]) {
        if expired.is_empty() {
            return;
        }
        let file_size = self.log.file_length_bound();
        let mut state = self.state.lock();
        for loggable in expired {
            let file = self.log.file_address_of(loggable.address);
            let counter = state.free.entry(file).or_insert(0);
            *counter = (*counter + loggable.length).min(file_size);
        }
        self.estimate_locked(&mut state);
    }

    /// Free bytes of a file; a file without a counter counts as entirely free
    pub fn file_free_bytes(&self, file_address: u64) -> u64 {
        self.state
            .lock()
            .free
            .get(&file_address)
            .copied()
            .unwrap_or_else(|| self.log.file_length_bound())
    }

    /// Start a fresh counter for a newly created file
    pub fn reset_file(&self, file_address: u64) {
        let mut state = self.state.lock();
        state.free.insert(file_address, 0);
        state.cleaned.remove(&file_address);
    }

    /// Forget a deleted file
    pub fn remove_file(&self, file_address: u64) {
        let mut state = self.state.lock();
        state.free.remove(&file_address);
        state.cleaned.remove(&file_address);
        self.estimate_locked(&mut state);
    }

    /// Move vacated files out of the accounting until they are deleted
    pub fn mark_cleaned(&self, files: &[u64]) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(file) = files.iter().find(|f| state.cleaned.contains(*f)) {
            return Err(LogTreeError::Integrity(format!(
                "file {:016x} was already cleaned",
                file
            )));
        }
        for file in files {
            state.free.remove(file);
            state.cleaned.insert(*file);
        }
        self.estimate_locked(&mut state);
        Ok(())
    }

    pub fn is_cleaned(&self, file_address: u64) -> bool {
        self.state.lock().cleaned.contains(&file_address)
    }

    // =========================================================================
    // Totals
    // =========================================================================

    /// Recompute totals over the files old enough to be cleaned
    pub fn estimate_total_bytes(&self) {
        let mut state = self.state.lock();
        self.estimate_locked(&mut state);
    }

    pub fn total_bytes(&self) -> u64 {
        self.state.lock().total_bytes
    }

    pub fn total_free_bytes(&self) -> u64 {
        self.state.lock().total_free
    }

    pub fn total_free_space_percent(&self) -> u64 {
        let state = self.state.lock();
        if state.total_bytes == 0 {
            0
        } else {
            state.total_free * 100 / state.total_bytes
        }
    }

    /// Free space exceeds what the target utilization allows
    pub fn needs_cleaning(&self) -> bool {
        self.total_free_space_percent() > 100 - u64::from(self.min_utilization)
    }

    /// Address of the oldest file too young to clean; `None` if every file is
    pub fn min_file_age_cutoff(&self) -> Option<u64> {
        let files = self.log.all_file_addresses();
        let keep = self.min_file_age.max(1);
        if files.len() <= keep {
            None
        } else {
            Some(files[files.len() - keep])
        }
    }

    fn estimate_locked(&self, state: &mut ProfileState) {
        let files = self.log.all_file_addresses();
        // The high file is never a candidate, so it never counts
        let counted = files.len().saturating_sub(self.min_file_age.max(1));
        let mut total = 0;
        let mut free = 0;
        for file in &files[..counted] {
            if state.cleaned.contains(file) {
                continue;
            }
            let size = self.log.file_size(*file);
            total += size;
            free += state.free.get(file).copied().unwrap_or(0).min(size);
        }
        state.total_bytes = total;
        state.total_free = free;
    }

    // =========================================================================
    // Candidate Selection
    // =========================================================================

    /// Cleanable files below `high_file_address`, most fragmented first
    ///
    /// At most `gc_max_candidates` files are ranked. The sequence ends once
    /// the files already yielded account for enough free bytes to bring free
    /// space down to the target.
    pub fn files_sorted_by_utilization(&self, high_file_address: u64) -> CandidateFiles {
        let files = self.log.all_file_addresses();
        let file_size = self.log.file_length_bound();
        let state = self.state.lock();

        // Min-heap of the best `max_candidates` seen so far
        let mut best: BinaryHeap<Reverse<(u64, Reverse<u64>)>> = BinaryHeap::new();
        for &file in files.iter().take_while(|&&f| f < high_file_address) {
            if state.cleaned.contains(&file) {
                continue;
            }
            let free = state.free.get(&file).copied().unwrap_or(file_size);
            if free == 0 {
                continue;
            }
            best.push(Reverse((free, Reverse(file))));
            if best.len() > self.max_candidates {
                best.pop();
            }
        }

        CandidateFiles {
            heap: best.into_iter().map(|Reverse(entry)| entry).collect(),
            total_bytes: state.total_bytes,
            remaining_free: state.total_free,
            target_free_percent: 100 - u64::from(self.min_utilization),
        }
    }

    // =========================================================================
    // Persistence
    // =========================================================================

    /// All counters, ascending by file address
    pub fn entries(&self) -> Vec<(u64, u64)> {
        self.state
            .lock()
            .free
            .iter()
            .map(|(file, free)| (*file, *free))
            .collect()
    }

    /// Replace the counters; entries of files no longer in the log are dropped
    pub fn load<I>(&self, entries: I)
    where
        I: IntoIterator<Item = (u64, u64)>,
    {
        let file_size = self.log.file_length_bound();
        let mut state = self.state.lock();
        state.free = entries
            .into_iter()
            .filter(|(file, _)| self.log.has_file(*file))
            .map(|(file, free)| (file, free.min(file_size)))
            .collect();
        self.estimate_locked(&mut state);
    }

    /// Rebuild every counter from the nodes reachable in `trees`
    ///
    /// `root_record` is the address of the current database root record,
    /// which is live without belonging to any tree.
    pub fn compute_from_scratch(&self, trees: &[ImmutableTree], root_record: Option<u64>) -> Result<()> {
        let mut live: BTreeMap<u64, u64> = BTreeMap::new();
        let mut count = |address: u64| -> Result<()> {
            let length = self.log.record_length(address)?;
            *live.entry(self.log.file_address_of(address)).or_insert(0) += length;
            Ok(())
        };
        for tree in trees {
            for address in tree.address_iterator() {
                count(address?)?;
            }
        }
        if let Some(address) = root_record {
            count(address)?;
        }

        let entries: Vec<(u64, u64)> = self
            .log
            .all_file_addresses()
            .into_iter()
            .map(|file| {
                let used = self.log.file_size(file);
                let live = live.get(&file).copied().unwrap_or(0);
                (file, used.saturating_sub(live))
            })
            .collect();
        self.load(entries);
        Ok(())
    }

    /// Load counters from a `<file address> <free bytes>` report
    ///
    /// Addresses may be decimal or `0x` hex; blank lines and `#` comments
    /// are ignored. Returns the number of entries read.
    pub fn import_report(&self, path: &Path) -> Result<usize> {
        let text = fs::read_to_string(path)?;
        let mut entries = Vec::new();
        for (number, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut fields = line.split_whitespace();
            let parsed = match (fields.next(), fields.next(), fields.next()) {
                (Some(file), Some(free), None) => parse_u64(file).zip(parse_u64(free)),
                _ => None,
            };
            match parsed {
                Some(entry) => entries.push(entry),
                None => {
                    return Err(LogTreeError::Config(format!(
                        "{}:{}: expected '<file address> <free bytes>', got '{}'",
                        path.display(),
                        number + 1,
                        line
                    )))
                }
            }
        }
        let count = entries.len();
        self.load(entries);
        Ok(count)
    }
}

/// Lazy most-fragmented-first file sequence
#[derive(Debug)]
pub struct CandidateFiles {
    heap: BinaryHeap<(u64, Reverse<u64>)>,
    total_bytes: u64,
    remaining_free: u64,
    target_free_percent: u64,
}

impl Iterator for CandidateFiles {
    type Item = u64;

    fn next(&mut self) -> Option<u64> {
        if self.total_bytes == 0
            || self.remaining_free * 100 <= self.total_bytes * self.target_free_percent
        {
            return None;
        }
        let (free, Reverse(file)) = self.heap.pop()?;
        self.remaining_free = self.remaining_free.saturating_sub(free);
        Some(file)
    }
}

fn parse_u64(text: &str) -> Option<u64> {
    match text.strip_prefix("0x") {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => text.parse().ok(),
    }
}
