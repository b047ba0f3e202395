//! Environment
//!
//! The engine instance: owns the log, the published database state, the
//! write lock, the utilization profile and the background cleaner.
//!
//! ## Responsibilities
//! - Recover the last committed state on open, cutting off a torn tail
//! - Hand out read and write transactions
//! - Publish committed snapshots
//! - Load and save the utilization profile
//! - Start and finish the garbage collector

use std::fs;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tracing::{info, warn};

use crate::config::{Config, LogSyncStrategy};
use crate::error::{LogTreeError, Result};
use crate::gc::{GarbageCollector, UtilizationProfile, UtilizationSource};
use crate::log::{Log, LoggableType};
use crate::tree::{ImmutableTree, PagePolicy};

use super::meta::{
    is_reserved, DatabaseRoot, ReaderRegistry, Snapshot, StoreMeta, META_STRUCTURE_ID,
    UTILIZATION_STORE,
};
use super::transaction::{ReadTransaction, Transaction, TransactionKind};

/// State shared by the environment handle and the cleaner thread
pub(crate) struct EnvInner {
    pub(crate) config: Config,
    pub(crate) log: Arc<Log>,
    pub(crate) policy: PagePolicy,

    /// Last committed state
    pub(crate) snapshot: RwLock<Arc<Snapshot>>,

    /// Serializes all write transactions
    pub(crate) write_lock: Mutex<()>,

    pub(crate) readers: Arc<ReaderRegistry>,
    pub(crate) utilization: Arc<UtilizationProfile>,

    commits_since_sync: AtomicUsize,
}

impl EnvInner {
    pub(crate) fn current(&self) -> Arc<Snapshot> {
        Arc::clone(&*self.snapshot.read())
    }

    /// Begin a write transaction, waiting at most `timeout` for the lock
    pub(crate) fn begin_transaction(
        &self,
        kind: TransactionKind,
        timeout: Option<Duration>,
    ) -> Result<Transaction<'_>> {
        if self.config.read_only {
            return Err(LogTreeError::ReadOnly);
        }
        let guard = match timeout {
            Some(timeout) => self
                .write_lock
                .try_lock_for(timeout)
                .ok_or(LogTreeError::TransactionTimeout)?,
            None => self.write_lock.lock(),
        };
        Ok(Transaction::begin(self, kind, guard))
    }

    pub(crate) fn begin_read(&self) -> ReadTransaction<'_> {
        ReadTransaction::begin(self)
    }

    pub(crate) fn publish(&self, snapshot: Snapshot) {
        *self.snapshot.write() = Arc::new(snapshot);
    }

    /// fsync according to the configured strategy
    pub(crate) fn sync_after_commit(&self) -> Result<()> {
        match self.config.log_sync_strategy {
            LogSyncStrategy::EveryCommit => self.log.sync(),
            LogSyncStrategy::EveryNCommits { count } => {
                let pending = self.commits_since_sync.fetch_add(1, Ordering::SeqCst) + 1;
                if pending >= count.max(1) {
                    self.commits_since_sync.store(0, Ordering::SeqCst);
                    self.log.sync()?;
                }
                Ok(())
            }
        }
    }

    /// Read the persisted profile; tells which recomputation to schedule
    /// when there is none
    fn load_utilization(&self) -> Result<Option<UtilizationSource>> {
        if let Some(path) = &self.config.gc_utilization_from_report {
            return Ok(Some(UtilizationSource::Report(path.clone())));
        }
        if self.config.gc_utilization_from_scratch {
            return Ok(Some(UtilizationSource::Scratch));
        }

        let txn = self.begin_read();
        let store = match txn.store(UTILIZATION_STORE) {
            Ok(store) => store,
            Err(LogTreeError::StoreNotFound(_)) if self.log.number_of_files() == 0 => {
                return Ok(None)
            }
            Err(LogTreeError::StoreNotFound(_)) => return Ok(Some(UtilizationSource::Scratch)),
            Err(e) => return Err(e),
        };

        let mut entries = Vec::new();
        for entry in txn.open_cursor(&store)? {
            let (key, value) = entry?;
            entries.push((decode_u64(&key)?, decode_u64(&value)?));
        }
        self.utilization.load(entries);
        Ok(None)
    }

    /// Write the profile into its reserved store
    fn save_utilization(&self) -> Result<()> {
        let entries = self.utilization.entries();

        let mut txn = self.begin_transaction(TransactionKind::Regular, None)?;
        let store = txn.open_store_internal(UTILIZATION_STORE);

        let mut stale = Vec::new();
        for entry in txn.open_cursor(&store)? {
            let (key, _) = entry?;
            let file = decode_u64(&key)?;
            if entries.binary_search_by_key(&file, |(f, _)| *f).is_err() {
                stale.push(key);
            }
        }
        for key in stale {
            txn.delete(&store, &key)?;
        }
        for (file, free) in &entries {
            let key = file.to_be_bytes();
            let value = free.to_be_bytes();
            if txn.get(&store, &key)?.as_deref() != Some(&value[..]) {
                txn.put(&store, &key, &value)?;
            }
        }
        txn.commit()?;
        Ok(())
    }
}

/// An open database
///
/// ## Concurrency Model: Single-Writer / Multiple-Reader
///
/// - **Writes**: `Transaction`s (application and cleaner alike) serialize on
///   one write lock held from begin to commit/abort
/// - **Reads**: `ReadTransaction`s take no lock; they pin a snapshot whose
///   nodes are never modified and whose files are not deleted while it runs
pub struct Environment {
    inner: Arc<EnvInner>,
    gc: GarbageCollector,
    closed: AtomicBool,
}

impl Environment {
    /// Open or create an environment
    ///
    /// On startup:
    /// 1. Open the log in `data_dir`
    /// 2. Find the newest valid root record and cut the log after it
    /// 3. Load the store table from the meta tree
    /// 4. Load the utilization profile or schedule its recomputation
    /// 5. Start the cleaner
    pub fn open(config: Config) -> Result<Self> {
        config.validate()?;
        fs::create_dir_all(&config.data_dir)?;

        let log = Arc::new(Log::open(
            &config.data_dir,
            config.log_file_size,
            config.log_cache_open_files,
        )?);
        let policy = PagePolicy::new(config.tree_page_size, config.tree_merge_percent);
        let snapshot = recover(&log, policy, config.read_only)?;
        let utilization = Arc::new(UtilizationProfile::new(Arc::clone(&log), &config));

        info!(
            dir = %config.data_dir.display(),
            version = snapshot.version,
            stores = snapshot.stores.len(),
            files = log.number_of_files(),
            high_address = log.high_address(),
            "opened environment"
        );

        let inner = Arc::new(EnvInner {
            config,
            log: Arc::clone(&log),
            policy,
            snapshot: RwLock::new(Arc::new(snapshot)),
            write_lock: Mutex::new(()),
            readers: Arc::new(ReaderRegistry::default()),
            utilization: Arc::clone(&utilization),
            commits_since_sync: AtomicUsize::new(0),
        });

        let recompute = inner.load_utilization()?;
        let gc = GarbageCollector::start(Arc::clone(&inner))?;

        // Weak: the log must not keep the profile (which holds the log) alive
        let profile = Arc::downgrade(&utilization);
        let trigger = gc.trigger();
        log.add_new_file_listener(Box::new(move |file_address| {
            if let Some(profile) = profile.upgrade() {
                profile.reset_file(file_address);
            }
            trigger.new_file(file_address);
        }));

        if let Some(source) = recompute {
            gc.compute_utilization(source)?;
        }

        Ok(Self {
            inner,
            gc,
            closed: AtomicBool::new(false),
        })
    }

    // =========================================================================
    // Transactions
    // =========================================================================

    pub fn begin_read(&self) -> ReadTransaction<'_> {
        self.inner.begin_read()
    }

    /// Begin a regular write transaction, blocking until the lock is free
    pub fn begin_write(&self) -> Result<Transaction<'_>> {
        self.inner.begin_transaction(TransactionKind::Regular, None)
    }

    /// Begin an exclusive write transaction
    pub fn begin_exclusive(&self) -> Result<Transaction<'_>> {
        self.inner.begin_transaction(TransactionKind::Exclusive, None)
    }

    /// Run `f` in a write transaction, committing on success
    pub fn execute_in_transaction<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Transaction<'_>) -> Result<T>,
    {
        let mut txn = self.begin_write()?;
        let value = f(&mut txn)?;
        txn.commit()?;
        Ok(value)
    }

    /// Run `f` in a read transaction
    pub fn compute_in_read_transaction<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&ReadTransaction<'_>) -> Result<T>,
    {
        let txn = self.begin_read();
        f(&txn)
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Names of user stores in the last committed state
    pub fn store_names(&self) -> Vec<String> {
        self.inner
            .current()
            .stores
            .keys()
            .filter(|name| !is_reserved(name))
            .cloned()
            .collect()
    }

    /// Version of the last commit (0 if none)
    pub fn version(&self) -> u64 {
        self.inner.current().version
    }

    pub fn gc(&self) -> &GarbageCollector {
        &self.gc
    }

    pub fn utilization(&self) -> &UtilizationProfile {
        &self.inner.utilization
    }

    pub fn log(&self) -> &Arc<Log> {
        &self.inner.log
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    // =========================================================================
    // Shutdown
    // =========================================================================

    /// Stop the cleaner, save the utilization profile and sync the log
    pub fn close(self) -> Result<()> {
        self.shutdown()
    }

    fn shutdown(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if !self.gc.is_finished() {
            self.gc.finish()?;
        }
        if !self.inner.config.read_only {
            self.inner.save_utilization()?;
            self.inner.log.flush_and_sync()?;
        }
        info!(
            version = self.version(),
            files = self.inner.log.number_of_files(),
            "closed environment"
        );
        Ok(())
    }
}

impl Drop for Environment {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!(error = %e, "failed to close environment cleanly");
        }
    }
}

// =============================================================================
// Recovery
// =============================================================================

/// Rebuild the last committed state from the log
///
/// Files are scanned newest first; the last valid root record of the newest
/// file holding one is the database state. Everything after it was never
/// committed and is cut off (unless read-only).
fn recover(log: &Arc<Log>, policy: PagePolicy, read_only: bool) -> Result<Snapshot> {
    let mut found = None;
    for file_address in log.all_file_addresses().into_iter().rev() {
        let mut last = None;
        for item in log.file_iterator(file_address) {
            let loggable = match item {
                Ok(loggable) => loggable,
                Err(e) => {
                    warn!(file = file_address, error = %e, "stopping scan at unreadable record");
                    break;
                }
            };
            if loggable.loggable_type != LoggableType::DatabaseRoot {
                continue;
            }
            match DatabaseRoot::decode(&loggable) {
                Ok(root) => last = Some((loggable.address, loggable.end_address(), root)),
                Err(e) => {
                    warn!(address = loggable.address, error = %e, "undecodable root record");
                    break;
                }
            }
        }
        if last.is_some() {
            found = last;
            break;
        }
    }

    let committed_end = found.map_or(0, |(_, end, _)| end);
    if !read_only && committed_end < log.high_address() {
        warn!(
            from = committed_end,
            to = log.high_address(),
            "discarding uncommitted log tail"
        );
        log.truncate_to(committed_end)?;
    }

    let (root_address, root) = match found {
        Some((address, _, root)) => (address, root),
        None => return Ok(Snapshot::empty()),
    };

    let meta = ImmutableTree::new(
        Arc::clone(log),
        META_STRUCTURE_ID,
        policy,
        Some(root.meta_root),
    );
    let mut stores = std::collections::BTreeMap::new();
    for entry in meta.open_cursor() {
        let (name, value) = entry?;
        let name = String::from_utf8(name.to_vec())
            .map_err(|e| LogTreeError::Corruption(format!("store name is not UTF-8: {}", e)))?;
        stores.insert(name, StoreMeta::decode(&value)?);
    }

    info!(
        version = root.version,
        root_address,
        stores = stores.len(),
        "recovered database state"
    );
    Ok(Snapshot {
        version: root.version,
        root_address: Some(root_address),
        meta_root: Some(root.meta_root),
        next_structure_id: root.next_structure_id,
        stores,
    })
}

fn decode_u64(bytes: &[u8]) -> Result<u64> {
    let array: [u8; 8] = bytes
        .try_into()
        .map_err(|_| LogTreeError::Corruption(format!("expected 8 bytes, got {}", bytes.len())))?;
    Ok(u64::from_be_bytes(array))
}
