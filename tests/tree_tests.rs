//! Tests for the copy-on-write B-tree
//!
//! These tests verify:
//! - Point operations against a reference map (random workload)
//! - Snapshots staying intact while a copy is modified
//! - Structural sharing between consecutive versions
//! - Cursor navigation and search semantics
//! - Relocation of live nodes out of a file

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use logtree::log::Log;
use logtree::tree::{ImmutableTree, MutableTree, PagePolicy};
use logtree::LogTreeError;
use rand::{rngs::StdRng, Rng, SeedableRng};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

const STRUCTURE_ID: u32 = 5;
const FILE_SIZE: u64 = 4096;

fn setup_log() -> (TempDir, Arc<Log>) {
    let temp_dir = TempDir::new().unwrap();
    let log = Arc::new(Log::open(temp_dir.path(), FILE_SIZE, 8).unwrap());
    (temp_dir, log)
}

fn small_pages() -> PagePolicy {
    PagePolicy::new(256, 40)
}

fn key(i: usize) -> Vec<u8> {
    format!("key{:05}", i).into_bytes()
}

fn value(i: usize) -> Vec<u8> {
    format!("value-{:05}", i).into_bytes()
}

fn filled_tree(log: &Arc<Log>, count: usize) -> MutableTree {
    let mut tree = MutableTree::new(Arc::clone(log), STRUCTURE_ID, small_pages());
    for i in 0..count {
        tree.put(&key(i), &value(i)).unwrap();
    }
    tree.save().unwrap();
    tree
}

fn addresses(tree: &ImmutableTree) -> HashSet<u64> {
    tree.address_iterator().map(|a| a.unwrap()).collect()
}

fn contents(tree: &ImmutableTree) -> Vec<(Vec<u8>, Vec<u8>)> {
    tree.open_cursor()
        .map(|e| {
            let (k, v) = e.unwrap();
            (k.to_vec(), v.to_vec())
        })
        .collect()
}

// =============================================================================
// Point Operation Tests
// =============================================================================

#[test]
fn test_put_get_delete() {
    let (_temp, log) = setup_log();
    let mut tree = MutableTree::new(Arc::clone(&log), STRUCTURE_ID, small_pages());

    assert_eq!(tree.put(b"a", b"1").unwrap(), None);
    assert_eq!(tree.put(b"a", b"2").unwrap().as_deref(), Some(&b"1"[..]));
    assert_eq!(tree.get(b"a").unwrap().as_deref(), Some(&b"2"[..]));

    assert!(tree.add(b"b", b"3").unwrap());
    assert!(!tree.add(b"b", b"4").unwrap());
    assert_eq!(tree.get(b"b").unwrap().as_deref(), Some(&b"3"[..]));

    assert!(tree.delete(b"a").unwrap());
    assert!(!tree.delete(b"a").unwrap());
    assert_eq!(tree.get(b"a").unwrap(), None);
}

#[test]
fn test_oversized_entry_rejected() {
    let (_temp, log) = setup_log();
    let mut tree = MutableTree::new(Arc::clone(&log), STRUCTURE_ID, small_pages());

    let result = tree.put(b"k", &[0u8; 200]);
    assert!(matches!(result, Err(LogTreeError::EntryTooLarge { .. })));
    assert_eq!(tree.get(b"k").unwrap(), None);
}

#[test]
fn test_random_workload_matches_reference() {
    let (_temp, log) = setup_log();
    let mut rng = StdRng::seed_from_u64(42);
    let mut reference: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();
    let mut tree = MutableTree::new(Arc::clone(&log), STRUCTURE_ID, small_pages());

    for round in 0..20 {
        for _ in 0..200 {
            let k: Vec<u8> = (0..rng.gen_range(1..=16)).map(|_| rng.gen_range(b'a'..=b'h')).collect();
            if rng.gen_bool(0.3) {
                assert_eq!(tree.delete(&k).unwrap(), reference.remove(&k).is_some());
            } else {
                let v: Vec<u8> = (0..rng.gen_range(0..32)).map(|_| rng.gen()).collect();
                let previous = tree.put(&k, &v).unwrap().map(|b| b.to_vec());
                assert_eq!(previous, reference.insert(k, v));
            }
        }

        // Alternate between checking the dirty tree and a saved snapshot
        if round % 2 == 0 {
            tree.save().unwrap();
            let snapshot = tree.snapshot().unwrap();
            let expected: Vec<_> = reference.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
            assert_eq!(contents(&snapshot), expected);
        } else {
            for (k, v) in &reference {
                assert_eq!(tree.get(k).unwrap().as_deref(), Some(&v[..]));
            }
        }
    }
}

#[test]
fn test_delete_everything_then_reuse() {
    let (_temp, log) = setup_log();
    let mut tree = filled_tree(&log, 300);

    for i in 0..300 {
        assert!(tree.delete(&key(i)).unwrap());
    }
    tree.save().unwrap();
    let snapshot = tree.snapshot().unwrap();
    assert!(contents(&snapshot).is_empty());
    assert_eq!(addresses(&snapshot).len(), 1);

    tree.put(b"again", b"1").unwrap();
    assert_eq!(tree.get(b"again").unwrap().as_deref(), Some(&b"1"[..]));
}

// =============================================================================
// Snapshot Tests
// =============================================================================

#[test]
fn test_snapshot_unaffected_by_copy() {
    let (_temp, log) = setup_log();
    let tree = filled_tree(&log, 200);
    let before = tree.snapshot().unwrap();

    let mut copy = before.mutable_copy();
    copy.put(&key(10), b"changed").unwrap();
    copy.delete(&key(20)).unwrap();
    copy.save().unwrap();
    let after = copy.snapshot().unwrap();

    assert_eq!(before.get(&key(10)).unwrap().as_deref(), Some(&value(10)[..]));
    assert_eq!(before.get(&key(20)).unwrap().as_deref(), Some(&value(20)[..]));
    assert_eq!(after.get(&key(10)).unwrap().as_deref(), Some(&b"changed"[..]));
    assert_eq!(after.get(&key(20)).unwrap(), None);
}

#[test]
fn test_versions_share_untouched_nodes() {
    let (_temp, log) = setup_log();
    let tree = filled_tree(&log, 500);
    let before = tree.snapshot().unwrap();

    let mut copy = before.mutable_copy();
    copy.put(&key(250), b"v2").unwrap();
    copy.save().unwrap();
    let after = copy.snapshot().unwrap();

    let old = addresses(&before);
    let new = addresses(&after);
    let fresh: Vec<_> = new.difference(&old).collect();

    assert!(old.len() > 20);
    // Only the root-to-leaf path is rewritten
    assert!(!fresh.is_empty() && fresh.len() <= 4, "rewrote {} nodes", fresh.len());
    assert_eq!(copy.expired().len(), fresh.len());
}

#[test]
fn test_unchanged_copy_writes_nothing() {
    let (_temp, log) = setup_log();
    let tree = filled_tree(&log, 100);
    let snapshot = tree.snapshot().unwrap();

    let copy = snapshot.mutable_copy();
    assert!(!copy.is_dirty());
    assert_eq!(copy.root_address(), snapshot.root_address());
}

// =============================================================================
// Cursor Tests
// =============================================================================

#[test]
fn test_cursor_forward_and_backward() {
    let (_temp, log) = setup_log();
    let tree = filled_tree(&log, 150);
    let snapshot = tree.snapshot().unwrap();

    let mut cursor = snapshot.open_cursor();
    let mut forward = Vec::new();
    while cursor.get_next().unwrap() {
        forward.push(cursor.key().unwrap().to_vec());
    }
    assert_eq!(forward, (0..150).map(key).collect::<Vec<_>>());
    assert!(!cursor.get_next().unwrap());
    assert_eq!(cursor.key(), None);

    // Off the end, stepping back lands on the last entry
    let mut backward = Vec::new();
    while cursor.get_prev().unwrap() {
        backward.push(cursor.key().unwrap().to_vec());
    }
    assert_eq!(backward.len(), 150);
    assert_eq!(backward.first(), Some(&key(149)));
    assert_eq!(backward.last(), Some(&key(0)));
}

#[test]
fn test_cursor_search_key() {
    let (_temp, log) = setup_log();
    let tree = filled_tree(&log, 100);
    let snapshot = tree.snapshot().unwrap();
    let mut cursor = snapshot.open_cursor();

    assert_eq!(cursor.get_search_key(&key(42)).unwrap().as_deref(), Some(&value(42)[..]));
    assert_eq!(cursor.value_count(), 1);

    // A miss keeps the previous position
    assert_eq!(cursor.get_search_key(b"key00042x").unwrap(), None);
    assert_eq!(cursor.key().map(|k| k.to_vec()), Some(key(42)));

    assert!(cursor.get_next().unwrap());
    assert_eq!(cursor.key().map(|k| k.to_vec()), Some(key(43)));
}

#[test]
fn test_cursor_search_key_range() {
    let (_temp, log) = setup_log();
    let mut tree = MutableTree::new(Arc::clone(&log), STRUCTURE_ID, small_pages());
    for i in (0..200).step_by(2) {
        tree.put(&key(i), &value(i)).unwrap();
    }
    tree.save().unwrap();
    let snapshot = tree.snapshot().unwrap();
    let mut cursor = snapshot.open_cursor();

    // Ceiling of an odd key is the next even one, across leaf boundaries too
    for i in (1..198).step_by(2) {
        let found = cursor.get_search_key_range(&key(i)).unwrap();
        assert_eq!(found.as_deref(), Some(&value(i + 1)[..]), "ceiling of {}", i);
        assert_eq!(cursor.key().map(|k| k.to_vec()), Some(key(i + 1)));
    }

    assert_eq!(cursor.get_search_key_range(b"a").unwrap().as_deref(), Some(&value(0)[..]));
    assert_eq!(cursor.get_search_key_range(b"zzz").unwrap(), None);
    assert!(!cursor.get_next().unwrap());
}

#[test]
fn test_cursor_on_empty_tree() {
    let (_temp, log) = setup_log();
    let tree = MutableTree::new(Arc::clone(&log), STRUCTURE_ID, small_pages());

    let mut cursor = tree.open_cursor();
    assert_eq!(cursor.get_search_key_range(b"anything").unwrap(), None);
    assert!(!cursor.get_next().unwrap());
    assert!(!cursor.get_prev().unwrap());
    assert_eq!(cursor.value_count(), 0);

    let never_saved = ImmutableTree::new(Arc::clone(&log), STRUCTURE_ID, small_pages(), None);
    assert_eq!(never_saved.open_cursor().count(), 0);
    assert_eq!(never_saved.get(b"x").unwrap(), None);
}

#[test]
fn test_cursor_ignores_later_mutations() {
    let (_temp, log) = setup_log();
    let mut tree = filled_tree(&log, 50);
    tree.put(b"key00010", b"dirty").unwrap();

    let snapshot = tree.snapshot();
    assert!(snapshot.is_none(), "dirty tree has no saved snapshot");

    tree.save().unwrap();
    let saved = tree.snapshot().unwrap();
    tree.delete(&key(10)).unwrap();
    tree.put(b"zzz", b"new").unwrap();

    let seen: Vec<_> = contents(&saved);
    assert_eq!(seen.len(), 50);
    assert!(seen.contains(&(key(10), b"dirty".to_vec())));
}

// =============================================================================
// Reclaim Tests
// =============================================================================

#[test]
fn test_reclaim_moves_live_nodes_out_of_file() {
    let (_temp, log) = setup_log();
    let mut tree = filled_tree(&log, 400);
    log.flush().unwrap();
    assert!(log.number_of_files() > 2);

    // Supersede part of the tree so the first file also holds garbage
    for i in 0..50 {
        tree.put(&key(i), b"updated").unwrap();
    }
    tree.save().unwrap();
    log.flush().unwrap();
    let before = contents(&tree.snapshot().unwrap());

    let first_file = log.low_address();
    let mut relocated = 0;
    {
        let mut loggables = log.file_iterator(first_file);
        while let Some(loggable) = loggables.next() {
            let loggable = loggable.unwrap();
            relocated += tree.reclaim(&loggable, &mut loggables, first_file + FILE_SIZE).unwrap();
        }
    }
    assert!(relocated > 0);
    tree.save().unwrap();

    let after = tree.snapshot().unwrap();
    assert_eq!(contents(&after), before);
    assert!(addresses(&after).iter().all(|&a| a >= first_file + FILE_SIZE));

    for loggable in log.file_iterator(first_file) {
        assert!(!tree.is_live(&loggable.unwrap()).unwrap());
    }
}

#[test]
fn test_reclaim_rejects_foreign_structure() {
    let (_temp, log) = setup_log();
    let mut tree = filled_tree(&log, 10);
    let mut other = MutableTree::new(Arc::clone(&log), STRUCTURE_ID + 1, small_pages());
    other.put(b"x", b"y").unwrap();
    let address = other.save().unwrap();

    let loggable = log.read(address).unwrap();
    let mut rest = log.loggable_iterator(log.high_address());
    assert!(matches!(
        tree.reclaim(&loggable, &mut rest, u64::MAX),
        Err(LogTreeError::Misuse(_))
    ));
}
