//! Tests for the environment and transactions
//!
//! These tests verify:
//! - Commit, abort and reopen of named stores
//! - Snapshot isolation between readers and the writer
//! - Store removal and reserved names
//! - Recovery from torn or uncommitted log tails
//! - Read-only environments and configuration checks

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::thread;

use logtree::log::{Log, LoggableType};
use logtree::{Config, Environment, LogTreeError, TransactionKind};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

const FILE_SIZE: u64 = 16 * 1024;

fn config(dir: &TempDir) -> Config {
    Config::builder()
        .data_dir(dir.path())
        .log_file_size(FILE_SIZE)
        .tree_page_size(512)
        .gc_enabled(false)
        .build()
}

fn open(dir: &TempDir) -> Environment {
    Environment::open(config(dir)).unwrap()
}

fn put_range(env: &Environment, store: &str, range: std::ops::Range<usize>) {
    env.execute_in_transaction(|txn| {
        let store = txn.open_store(store)?;
        for i in range {
            txn.put(&store, format!("k{:05}", i).as_bytes(), format!("v{}", i).as_bytes())?;
        }
        Ok(())
    })
    .unwrap();
}

fn read(env: &Environment, store: &str, key: &str) -> Option<String> {
    let txn = env.begin_read();
    let store = txn.store(store).ok()?;
    txn.get(&store, key.as_bytes())
        .unwrap()
        .map(|v| String::from_utf8(v.to_vec()).unwrap())
}

fn newest_log_file(dir: &TempDir) -> PathBuf {
    let mut files: Vec<PathBuf> = fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().path())
        .filter(|p| p.extension().map_or(false, |ext| ext == "log"))
        .collect();
    files.sort();
    files.pop().unwrap()
}

// =============================================================================
// Basic Transaction Tests
// =============================================================================

#[test]
fn test_commit_and_read() {
    let temp = TempDir::new().unwrap();
    let env = open(&temp);
    assert_eq!(env.version(), 0);

    put_range(&env, "users", 0..100);
    assert_eq!(env.version(), 1);
    assert_eq!(read(&env, "users", "k00042").as_deref(), Some("v42"));
    assert_eq!(read(&env, "users", "missing"), None);
    assert_eq!(env.store_names(), vec!["users".to_string()]);
}

#[test]
fn test_transaction_sees_own_writes() {
    let temp = TempDir::new().unwrap();
    let env = open(&temp);

    let mut txn = env.begin_write().unwrap();
    assert_eq!(txn.kind(), TransactionKind::Regular);
    let store = txn.open_store("s").unwrap();
    txn.put(&store, b"b", b"2").unwrap();
    txn.put(&store, b"a", b"1").unwrap();
    assert!(txn.add(&store, b"c", b"3").unwrap());
    assert!(!txn.add(&store, b"c", b"4").unwrap());
    assert!(txn.delete(&store, b"b").unwrap());

    let keys: Vec<_> = txn
        .open_cursor(&store)
        .unwrap()
        .map(|e| e.unwrap().0.to_vec())
        .collect();
    assert_eq!(keys, vec![b"a".to_vec(), b"c".to_vec()]);
    assert_eq!(txn.commit().unwrap(), 1);
}

#[test]
fn test_abort_discards_changes() {
    let temp = TempDir::new().unwrap();
    let env = open(&temp);
    put_range(&env, "s", 0..10);
    let high = env.log().high_address();

    let mut txn = env.begin_write().unwrap();
    let store = txn.store("s").unwrap();
    txn.put(&store, b"k00003", b"changed").unwrap();
    txn.open_store("other").unwrap();
    txn.abort();

    // Dropping without commit behaves the same
    {
        let mut txn = env.begin_write().unwrap();
        let store = txn.store("s").unwrap();
        txn.delete(&store, b"k00004").unwrap();
    }

    assert_eq!(env.version(), 1);
    assert_eq!(env.log().high_address(), high);
    assert_eq!(read(&env, "s", "k00003").as_deref(), Some("v3"));
    assert_eq!(read(&env, "s", "k00004").as_deref(), Some("v4"));
    assert_eq!(env.store_names(), vec!["s".to_string()]);
}

#[test]
fn test_failed_closure_rolls_back() {
    let temp = TempDir::new().unwrap();
    let env = open(&temp);

    let result: logtree::Result<()> = env.execute_in_transaction(|txn| {
        let store = txn.open_store("s")?;
        txn.put(&store, b"k", b"v")?;
        Err(LogTreeError::Misuse("stop".to_string()))
    });
    assert!(matches!(result, Err(LogTreeError::Misuse(_))));
    assert_eq!(env.version(), 0);
    assert!(env.store_names().is_empty());
}

#[test]
fn test_empty_commit_keeps_version() {
    let temp = TempDir::new().unwrap();
    let env = open(&temp);
    put_range(&env, "s", 0..5);

    let txn = env.begin_write().unwrap();
    assert_eq!(txn.commit().unwrap(), 1);
    assert_eq!(env.version(), 1);
}

#[test]
fn test_reopen_restores_state() {
    let temp = TempDir::new().unwrap();
    {
        let env = open(&temp);
        put_range(&env, "a", 0..300);
        put_range(&env, "b", 0..10);
        env.close().unwrap();
    }

    let env = open(&temp);
    assert_eq!(env.store_names(), vec!["a".to_string(), "b".to_string()]);
    assert_eq!(read(&env, "a", "k00299").as_deref(), Some("v299"));
    assert_eq!(read(&env, "b", "k00009").as_deref(), Some("v9"));

    // Structure ids keep increasing across reopen
    put_range(&env, "c", 0..1);
    let txn = env.begin_read();
    let ids: Vec<u32> = ["a", "b", "c"]
        .iter()
        .map(|name| txn.store(name).unwrap().structure_id())
        .collect();
    assert!(ids[0] < ids[1] && ids[1] < ids[2]);
}

// =============================================================================
// Isolation Tests
// =============================================================================

#[test]
fn test_reader_keeps_its_snapshot() {
    let temp = TempDir::new().unwrap();
    let env = open(&temp);
    put_range(&env, "s", 0..50);

    let reader = env.begin_read();
    assert_eq!(reader.version(), 1);

    env.execute_in_transaction(|txn| {
        let store = txn.store("s")?;
        txn.put(&store, b"k00001", b"new")?;
        txn.delete(&store, b"k00002")?;
        Ok(())
    })
    .unwrap();

    let store = reader.store("s").unwrap();
    assert_eq!(reader.get(&store, b"k00001").unwrap().as_deref(), Some(&b"v1"[..]));
    assert_eq!(reader.get(&store, b"k00002").unwrap().as_deref(), Some(&b"v2"[..]));
    assert_eq!(read(&env, "s", "k00001").as_deref(), Some("new"));
    assert_eq!(read(&env, "s", "k00002"), None);
}

#[test]
fn test_concurrent_readers_see_consistent_versions() {
    let temp = TempDir::new().unwrap();
    let env = open(&temp);
    put_range(&env, "s", 0..1);

    thread::scope(|scope| {
        scope.spawn(|| {
            for i in 1..40 {
                put_range(&env, "s", i..i + 1);
            }
        });
        for _ in 0..3 {
            scope.spawn(|| {
                for _ in 0..100 {
                    let txn = env.begin_read();
                    let store = txn.store("s").unwrap();
                    // Commit n adds exactly one key
                    let count = txn.open_cursor(&store).unwrap().count();
                    assert_eq!(count as u64, txn.version());
                }
            });
        }
    });
    assert_eq!(env.version(), 40);
}

// =============================================================================
// Store Management Tests
// =============================================================================

#[test]
fn test_remove_store() {
    let temp = TempDir::new().unwrap();
    let env = open(&temp);
    put_range(&env, "keep", 0..10);
    put_range(&env, "drop", 0..500);

    let old_handle = env.begin_read().store("drop").unwrap();
    env.execute_in_transaction(|txn| txn.remove_store("drop")).unwrap();

    assert_eq!(env.store_names(), vec!["keep".to_string()]);
    let txn = env.begin_read();
    assert!(matches!(txn.store("drop"), Err(LogTreeError::StoreNotFound(_))));
    assert!(matches!(
        txn.get(&old_handle, b"k00001"),
        Err(LogTreeError::StoreNotFound(_))
    ));
    drop(txn);

    // A store of the same name starts empty
    put_range(&env, "drop", 0..1);
    let txn = env.begin_read();
    let store = txn.store("drop").unwrap();
    assert_ne!(store.structure_id(), old_handle.structure_id());
    assert_eq!(txn.open_cursor(&store).unwrap().count(), 1);
}

#[test]
fn test_remove_missing_store() {
    let temp = TempDir::new().unwrap();
    let env = open(&temp);
    let mut txn = env.begin_write().unwrap();
    assert!(matches!(
        txn.remove_store("nope"),
        Err(LogTreeError::StoreNotFound(_))
    ));
}

#[test]
fn test_reserved_names_refused() {
    let temp = TempDir::new().unwrap();
    let env = open(&temp);
    let mut txn = env.begin_write().unwrap();

    assert!(matches!(txn.open_store("__mine"), Err(LogTreeError::Misuse(_))));
    assert!(matches!(
        txn.remove_store("__utilization__"),
        Err(LogTreeError::Misuse(_))
    ));
    assert!(txn.open_store("_single").is_ok());
}

// =============================================================================
// Recovery Tests
// =============================================================================

#[test]
fn test_torn_tail_is_discarded() {
    let temp = TempDir::new().unwrap();
    {
        let env = open(&temp);
        put_range(&env, "s", 0..200);
        env.close().unwrap();
    }

    let newest = newest_log_file(&temp);
    let committed_len = fs::metadata(&newest).unwrap().len();
    {
        // Half of a leaf frame: type, structure id, length, a few bytes
        let mut file = OpenOptions::new().append(true).open(&newest).unwrap();
        file.write_all(&[2, 9, 0, 0, 0, 100, 0, 0, 0, 1, 2, 3]).unwrap();
    }

    let env = open(&temp);
    assert_eq!(fs::metadata(&newest).unwrap().len(), committed_len);
    assert_eq!(read(&env, "s", "k00199").as_deref(), Some("v199"));

    put_range(&env, "s", 200..210);
    assert_eq!(read(&env, "s", "k00205").as_deref(), Some("v205"));
}

#[test]
fn test_uncommitted_records_are_discarded() {
    let temp = TempDir::new().unwrap();
    {
        let env = open(&temp);
        put_range(&env, "s", 0..20);
        env.close().unwrap();
    }

    let committed_high = {
        let log = Log::open(temp.path(), FILE_SIZE, 4).unwrap();
        let high = log.high_address();
        // Nodes of a commit that never wrote its root record
        for _ in 0..40 {
            log.append(LoggableType::LeafNode, 2, &[7u8; 400]).unwrap();
        }
        log.flush_and_sync().unwrap();
        assert!(log.high_address() > high);
        high
    };

    let env = open(&temp);
    assert_eq!(env.log().high_address(), committed_high);
    assert_eq!(read(&env, "s", "k00019").as_deref(), Some("v19"));
}

#[test]
fn test_read_only_environment() {
    let temp = TempDir::new().unwrap();
    {
        let env = open(&temp);
        put_range(&env, "s", 0..10);
        env.close().unwrap();
    }
    let high = {
        let log = Log::open(temp.path(), FILE_SIZE, 4).unwrap();
        log.high_address()
    };

    let mut read_only = config(&temp);
    read_only.read_only = true;
    let env = Environment::open(read_only).unwrap();

    assert!(matches!(env.begin_write(), Err(LogTreeError::ReadOnly)));
    assert!(matches!(env.begin_exclusive(), Err(LogTreeError::ReadOnly)));
    assert_eq!(read(&env, "s", "k00003").as_deref(), Some("v3"));
    env.close().unwrap();

    // Nothing was written
    let log = Log::open(temp.path(), FILE_SIZE, 4).unwrap();
    assert_eq!(log.high_address(), high);
}

#[test]
fn test_invalid_config_rejected() {
    let temp = TempDir::new().unwrap();
    let config = Config::builder()
        .data_dir(temp.path())
        .tree_page_size(64)
        .build();
    assert!(matches!(Environment::open(config), Err(LogTreeError::Config(_))));

    let config = Config::builder()
        .data_dir(temp.path())
        .log_file_size(1024)
        .tree_page_size(4096)
        .build();
    assert!(matches!(Environment::open(config), Err(LogTreeError::Config(_))));
}
