//! Tests for the append-only log
//!
//! These tests verify:
//! - Append/read before and after flush
//! - Records never straddling file boundaries
//! - Rollback of unflushed appends
//! - Reopening, CRC corruption detection
//! - File removal and new-file notifications

use std::fs::{self, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use logtree::log::{Log, LoggableType, RemoveMode, FRAME_OVERHEAD};
use logtree::LogTreeError;
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

const FILE_SIZE: u64 = 256;

fn setup_log() -> (TempDir, Log) {
    let temp_dir = TempDir::new().unwrap();
    let log = Log::open(temp_dir.path(), FILE_SIZE, 4).unwrap();
    (temp_dir, log)
}

fn append_leaf(log: &Log, payload: &[u8]) -> u64 {
    log.append(LoggableType::LeafNode, 7, payload).unwrap()
}

fn log_file(dir: &TempDir, file_address: u64) -> std::path::PathBuf {
    dir.path().join(format!("{:016x}.log", file_address))
}

// =============================================================================
// Append / Read Tests
// =============================================================================

#[test]
fn test_read_from_unflushed_tail() {
    let (_temp, log) = setup_log();

    let address = append_leaf(&log, b"hello");
    assert_eq!(address, 0);
    assert!(!log.is_flushed());

    let loggable = log.read(address).unwrap();
    assert_eq!(loggable.loggable_type, LoggableType::LeafNode);
    assert_eq!(loggable.structure_id, 7);
    assert_eq!(&loggable.data[..], b"hello");
    assert_eq!(loggable.length(), (FRAME_OVERHEAD + 5) as u64);
}

#[test]
fn test_read_after_flush() {
    let (_temp, log) = setup_log();

    let first = append_leaf(&log, b"one");
    let second = append_leaf(&log, b"two");
    log.flush().unwrap();
    assert!(log.is_flushed());

    assert_eq!(&log.read(first).unwrap().data[..], b"one");
    assert_eq!(&log.read(second).unwrap().data[..], b"two");
    assert_eq!(log.record_length(second).unwrap(), (FRAME_OVERHEAD + 3) as u64);
}

#[test]
fn test_records_never_straddle_files() {
    let (_temp, log) = setup_log();
    let payload = [1u8; 100]; // 113-byte frames

    assert_eq!(append_leaf(&log, &payload), 0);
    assert_eq!(append_leaf(&log, &payload), 113);
    // 226 + 113 > 256: padded to the next file
    assert_eq!(append_leaf(&log, &payload), 256);

    assert_eq!(log.all_file_addresses(), vec![0, 256]);
    assert_eq!(log.high_address(), 256 + 113);
}

#[test]
fn test_too_large_record_rejected() {
    let (_temp, log) = setup_log();
    let payload = vec![0u8; FILE_SIZE as usize];

    let result = log.append(LoggableType::LeafNode, 1, &payload);
    assert!(matches!(result, Err(LogTreeError::EntryTooLarge { .. })));
    assert_eq!(log.high_address(), 0);
}

#[test]
fn test_iterator_skips_padding() {
    let (_temp, log) = setup_log();
    let payload = [2u8; 100];
    for _ in 0..5 {
        append_leaf(&log, &payload);
    }
    log.flush().unwrap();

    let addresses: Vec<u64> = log
        .loggable_iterator(0)
        .map(|l| l.unwrap().address)
        .collect();
    assert_eq!(addresses, vec![0, 113, 256, 369, 512]);

    let in_second: Vec<u64> = log.file_iterator(256).map(|l| l.unwrap().address).collect();
    assert_eq!(in_second, vec![256, 369]);
}

// =============================================================================
// Rollback Tests
// =============================================================================

#[test]
fn test_rollback_discards_unflushed() {
    let (_temp, log) = setup_log();

    let kept = append_leaf(&log, b"kept");
    log.flush().unwrap();
    let start = log.high_address();
    append_leaf(&log, b"dropped");
    append_leaf(&log, &[0u8; 230]); // opens a second file

    log.rollback(start).unwrap();
    assert_eq!(log.high_address(), start);
    assert_eq!(log.all_file_addresses(), vec![0]);
    assert!(log.read(start).is_err());
    assert_eq!(&log.read(kept).unwrap().data[..], b"kept");
}

#[test]
fn test_rollback_below_flushed_refused() {
    let (_temp, log) = setup_log();
    append_leaf(&log, b"a");
    log.flush().unwrap();

    assert!(matches!(log.rollback(0), Err(LogTreeError::Integrity(_))));
}

// =============================================================================
// Persistence Tests
// =============================================================================

#[test]
fn test_reopen_preserves_records() {
    let temp_dir = TempDir::new().unwrap();
    let address;
    let high;
    {
        let log = Log::open(temp_dir.path(), FILE_SIZE, 4).unwrap();
        append_leaf(&log, &[9u8; 150]);
        address = append_leaf(&log, b"persisted");
        log.flush_and_sync().unwrap();
        high = log.high_address();
    }

    let log = Log::open(temp_dir.path(), FILE_SIZE, 4).unwrap();
    assert_eq!(log.high_address(), high);
    assert_eq!(&log.read(address).unwrap().data[..], b"persisted");
}

#[test]
fn test_crc_mismatch_detected() {
    let temp_dir = TempDir::new().unwrap();
    {
        let log = Log::open(temp_dir.path(), FILE_SIZE, 4).unwrap();
        append_leaf(&log, b"payload");
        log.flush_and_sync().unwrap();
    }

    // Flip one payload byte
    let mut file = OpenOptions::new()
        .write(true)
        .open(log_file(&temp_dir, 0))
        .unwrap();
    file.seek(SeekFrom::Start(10)).unwrap();
    file.write_all(b"X").unwrap();
    drop(file);

    let log = Log::open(temp_dir.path(), FILE_SIZE, 4).unwrap();
    assert!(matches!(log.read(0), Err(LogTreeError::Corruption(_))));
}

#[test]
fn test_truncate_to_drops_files() {
    let (temp, log) = setup_log();
    for _ in 0..4 {
        append_leaf(&log, &[3u8; 100]);
    }
    log.flush_and_sync().unwrap();
    assert_eq!(log.number_of_files(), 2);

    log.truncate_to(113).unwrap();
    assert_eq!(log.high_address(), 113);
    assert_eq!(log.all_file_addresses(), vec![0]);
    assert!(!log_file(&temp, 256).exists());
    assert_eq!(fs::metadata(log_file(&temp, 0)).unwrap().len(), 113);
}

// =============================================================================
// File Management Tests
// =============================================================================

#[test]
fn test_remove_file_delete_and_rename() {
    let (temp, log) = setup_log();
    for _ in 0..7 {
        append_leaf(&log, &[4u8; 100]);
    }
    log.flush_and_sync().unwrap();
    assert_eq!(log.all_file_addresses(), vec![0, 256, 512, 768]);

    log.remove_file(0, RemoveMode::Delete).unwrap();
    assert!(!log_file(&temp, 0).exists());

    log.remove_file(256, RemoveMode::Rename).unwrap();
    assert!(!log_file(&temp, 256).exists());
    assert!(temp.path().join(format!("{:016x}.log.del", 256)).exists());

    assert_eq!(log.low_address(), 512);
    assert_eq!(log.all_file_addresses(), vec![512, 768]);

    // Iteration jumps over the gap
    let first = log.loggable_iterator(0).next().unwrap().unwrap();
    assert_eq!(first.address, 512);
}

#[test]
fn test_remove_high_file_refused() {
    let (_temp, log) = setup_log();
    append_leaf(&log, b"only");
    log.flush().unwrap();

    assert!(matches!(
        log.remove_file(0, RemoveMode::Delete),
        Err(LogTreeError::Misuse(_))
    ));
    assert!(matches!(
        log.remove_file(256, RemoveMode::Delete),
        Err(LogTreeError::Integrity(_))
    ));
}

#[test]
fn test_new_file_listener() {
    let (_temp, log) = setup_log();
    let started = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&started);
    log.add_new_file_listener(Box::new(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    }));

    for _ in 0..5 {
        append_leaf(&log, &[5u8; 100]);
    }
    assert_eq!(started.load(Ordering::SeqCst), 3);
}
