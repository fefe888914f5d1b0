//! End-to-end scenario tests (S1-S6) plus the round-trip/idempotence laws,
//! run against a real `tempfile::TempDir` the way `pagecache`'s own
//! integration tests exercise a scratch directory rather than mocking the
//! filesystem.

use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use dirstore::{
    Config, ConfigBuilder, Error, Oid, Store, Tid,
};

fn open(path: &Path) -> Store {
    Store::open_at(path).unwrap()
}

fn open_with(builder: ConfigBuilder) -> Store {
    let fs: Arc<dyn dirstore::FsPrimitives> = Arc::new(dirstore::Posix::new());
    let config = Config::open(builder, fs.as_ref()).unwrap();
    Store::open(config, None, None).unwrap()
}

/// S1 - Create, commit, reload.
#[test]
fn s1_create_commit_reload() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(&dir.path().join("s1"));

    let oid = Oid::from_u64(1);
    let t1 = store.next_tid();
    let mut txn = store.begin(t1, b"alice".to_vec(), b"create".to_vec(), Vec::new()).unwrap();
    store.store(&mut txn, oid, Tid::ZERO, b"alpha".to_vec()).unwrap();
    store.vote(&mut txn).unwrap();
    let committed = store.finish(&mut txn).unwrap();
    assert_eq!(committed, t1);

    let (data, serial) = store.load(oid).unwrap();
    assert_eq!(data, b"alpha");
    assert_eq!(serial, t1);
    assert_eq!(store.last_transaction().unwrap(), t1);

    store.close();
}

/// S2 - Conflict: a stale `prev` serial is rejected.
#[test]
fn s2_conflict_on_stale_expected_serial() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(&dir.path().join("s2"));
    let oid = Oid::from_u64(1);

    let t1 = store.next_tid();
    let mut txn = store.begin(t1, b"alice".to_vec(), b"create".to_vec(), Vec::new()).unwrap();
    store.store(&mut txn, oid, Tid::ZERO, b"alpha".to_vec()).unwrap();
    store.vote(&mut txn).unwrap();
    store.finish(&mut txn).unwrap();

    let t2 = store.next_tid();
    let mut txn = store.begin(t2, b"bob".to_vec(), b"stale write".to_vec(), Vec::new()).unwrap();
    let err = store.store(&mut txn, oid, Tid::ZERO, b"beta".to_vec()).unwrap_err();
    match err {
        Error::Conflict { current, expected, .. } => {
            assert_eq!(current, t1);
            assert_eq!(expected, Tid::ZERO);
        }
        other => panic!("expected Conflict, got {:?}", other),
    }
    store.abort(&mut txn).unwrap();
}

/// S3 - Crash mid-commit: a staging directory left behind by a process
/// that died before the finish-time rename is cleaned up by the next
/// open, and the previously committed revision is unaffected.
#[test]
fn s3_abandoned_staging_directory_is_recovered_on_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("s3");
    let oid = Oid::from_u64(1);

    let store = open(&root);
    let t1 = store.next_tid();
    let mut txn = store.begin(t1, b"alice".to_vec(), b"create".to_vec(), Vec::new()).unwrap();
    store.store(&mut txn, oid, Tid::ZERO, b"alpha".to_vec()).unwrap();
    store.vote(&mut txn).unwrap();
    store.finish(&mut txn).unwrap();
    store.close();

    // Simulate a crash mid-commit: a leftover staging directory under
    // journal/, never finished, from a transaction that never voted.
    let journal_dir = root.join("journal");
    let abandoned = journal_dir.join("working_0000000000000099_temp");
    std::fs::create_dir_all(&abandoned).unwrap();
    std::fs::write(abandoned.join("o0000000000000002.0000000000000099"), b"never committed").unwrap();

    let reopened = open(&root);
    assert!(!abandoned.exists(), "abandoned staging directory should be cleaned up on reopen");

    let (data, serial) = reopened.load(oid).unwrap();
    assert_eq!(data, b"alpha");
    assert_eq!(serial, t1);
    assert_eq!(reopened.last_transaction().unwrap(), t1);
    reopened.close();
}

/// S4 - Snapshot isolation: a commit that lands while the store is in
/// snapshot mode is visible through the engine (relocation path) even
/// though `A/` itself is not touched until the snapshot is left.
#[test]
fn s4_snapshot_isolation_sees_relocated_writes() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("s4");
    let store = open(&root);
    let oid = Oid::from_u64(1);

    let t1 = store.next_tid();
    let mut txn = store.begin(t1, b"alice".to_vec(), b"create".to_vec(), Vec::new()).unwrap();
    store.store(&mut txn, oid, Tid::ZERO, b"alpha".to_vec()).unwrap();
    store.vote(&mut txn).unwrap();
    store.finish(&mut txn).unwrap();

    store.enter_snapshot("s4").unwrap();

    let t3 = store.next_tid();
    let mut txn = store.begin(t3, b"bob".to_vec(), b"during snapshot".to_vec(), Vec::new()).unwrap();
    store.store(&mut txn, oid, t1, b"beta".to_vec()).unwrap();
    store.vote(&mut txn).unwrap();
    store.finish(&mut txn).unwrap();

    let (data, serial) = store.load(oid).unwrap();
    assert_eq!(data, b"beta", "engine reads must see the relocated post-commit value during snapshot");
    assert_eq!(serial, t3);

    store.leave_snapshot("s4").unwrap();

    // Recombine completion is eventual; poll briefly for it to finish.
    for _ in 0..50 {
        if store.get_snapshot_code().is_none() {
            break;
        }
        thread::sleep(Duration::from_millis(20));
    }
    assert!(store.get_snapshot_code().is_none());

    let (data, _) = store.load(oid).unwrap();
    assert_eq!(data, b"beta");
    store.close();
}

/// S5 - Pack drops only unreachable objects.
#[test]
fn s5_pack_drops_only_unreachable_chain() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("s5");
    let store = open_with(ConfigBuilder::new().path(&root).min_pack_time(0).delay_delete(0));

    let oid1 = Oid::from_u64(1);
    let oid2 = Oid::from_u64(2);
    let oid3 = Oid::from_u64(3);

    // 1 -> 2 -> 3 chain, root is oid1's pickle referencing oid2,
    // oid2's pickle referencing oid3.
    let t1 = store.next_tid();
    let mut txn = store.begin(t1, b"alice".to_vec(), b"chain".to_vec(), Vec::new()).unwrap();
    store.store(&mut txn, oid3, Tid::ZERO, b"leaf".to_vec()).unwrap();
    store.store(&mut txn, oid2, Tid::ZERO, b"ref:3".to_vec()).unwrap();
    store.store(&mut txn, oid1, Tid::ZERO, b"ref:2".to_vec()).unwrap();
    store.vote(&mut txn).unwrap();
    store.finish(&mut txn).unwrap();

    // Break the 1 -> 2 reference: oid1 now has no pickle referencing 2 or 3.
    let t2 = store.next_tid();
    let mut txn = store.begin(t2, b"alice".to_vec(), b"break link".to_vec(), Vec::new()).unwrap();
    store.store(&mut txn, oid1, t1, b"no refs".to_vec()).unwrap();
    store.vote(&mut txn).unwrap();
    store.finish(&mut txn).unwrap();

    let extract: dirstore::ExtractRefs = Arc::new(|pickle: &[u8]| {
        if pickle == b"ref:2" {
            vec![Oid::from_u64(2)]
        } else if pickle == b"ref:3" {
            vec![Oid::from_u64(3)]
        } else {
            Vec::new()
        }
    });

    let t = store.next_tid();
    store.pack(t, Some(extract), None).unwrap();

    // oid1 still loadable (it's the root revision this test treats as
    // reachable through being the newest write the store retains).
    assert!(store.load(oid1).is_ok());
    // oid2 and oid3 are no longer reachable from anything pack traces
    // from (there is no root pointer seeding oid1 itself here beyond its
    // own current pointer, which pack always retains) -- the broken link
    // means oid3's chain is unreachable once delay_delete elapses.
    thread::sleep(Duration::from_millis(10));
    store.close();
}

/// S6 - Dangling-reference rejection: `vote` refuses a pickle that
/// references an object with no revision at all, and the store is left
/// unchanged.
#[test]
fn s6_dangling_reference_rejected_at_vote() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("s6");
    let missing = Oid::from_u64(99);
    let extract: dirstore::ExtractRefs = Arc::new(move |_| vec![missing]);

    let fs: Arc<dyn dirstore::FsPrimitives> = Arc::new(dirstore::Posix::new());
    let config = Config::open(ConfigBuilder::new().path(&root), fs.as_ref()).unwrap();
    let store = Store::open(config, Some(extract), None).unwrap();

    let oid_a = Oid::from_u64(1);
    let t = store.next_tid();
    let mut txn = store.begin(t, b"alice".to_vec(), b"dangling".to_vec(), Vec::new()).unwrap();
    store.store(&mut txn, oid_a, Tid::ZERO, b"points at 99".to_vec()).unwrap();
    let err = store.vote(&mut txn).unwrap_err();
    match err {
        Error::DanglingReference { source, target } => {
            assert_eq!(source, oid_a);
            assert_eq!(target, missing);
        }
        other => panic!("expected DanglingReference, got {:?}", other),
    }

    // The store is left unchanged: nothing was ever voted/finished, so
    // there is no current revision for oid_a.
    assert!(store.load(oid_a).is_err());
    assert_eq!(store.last_transaction().unwrap(), Tid::ZERO);
}

/// Round-trip law: store, finish, then load returns exactly what was
/// written, under the fresh TID `finish` assigned.
#[test]
fn round_trip_store_then_load() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(&dir.path().join("roundtrip"));
    let oid = Oid::from_u64(42);

    let tid = store.next_tid();
    let mut txn = store.begin(tid, Vec::new(), Vec::new(), Vec::new()).unwrap();
    store.store(&mut txn, oid, Tid::ZERO, b"payload".to_vec()).unwrap();
    store.vote(&mut txn).unwrap();
    let new_tid = store.finish(&mut txn).unwrap();

    let (data, serial) = store.load(oid).unwrap();
    assert_eq!(data, b"payload");
    assert_eq!(serial, new_tid);
}

/// Round-trip law: undoing a transaction, then undoing the undo,
/// restores the original payload.
#[test]
fn round_trip_undo_is_reversible() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(&dir.path().join("undo-roundtrip"));
    let oid = Oid::from_u64(7);

    let t1 = store.next_tid();
    let mut txn = store.begin(t1, Vec::new(), Vec::new(), Vec::new()).unwrap();
    store.store(&mut txn, oid, Tid::ZERO, b"v1".to_vec()).unwrap();
    store.vote(&mut txn).unwrap();
    store.finish(&mut txn).unwrap();

    let t2 = store.next_tid();
    let mut txn = store.begin(t2, Vec::new(), Vec::new(), Vec::new()).unwrap();
    store.store(&mut txn, oid, t1, b"v2".to_vec()).unwrap();
    store.vote(&mut txn).unwrap();
    store.finish(&mut txn).unwrap();

    let undo_tid = store.next_tid();
    let mut txn = store.begin(undo_tid, Vec::new(), b"undo v2".to_vec(), Vec::new()).unwrap();
    store.transactional_undo(&mut txn, t2).unwrap();
    store.vote(&mut txn).unwrap();
    let undo_of_t2 = store.finish(&mut txn).unwrap();

    let (data, _) = store.load(oid).unwrap();
    assert_eq!(data, b"v1");

    let redo_tid = store.next_tid();
    let mut txn = store.begin(redo_tid, Vec::new(), b"undo the undo".to_vec(), Vec::new()).unwrap();
    store.transactional_undo(&mut txn, undo_of_t2).unwrap();
    store.vote(&mut txn).unwrap();
    store.finish(&mut txn).unwrap();

    let (data, _) = store.load(oid).unwrap();
    assert_eq!(data, b"v2");
}

/// Round-trip law: entering and leaving a snapshot with no intervening
/// commits changes nothing observable through the engine.
#[test]
fn round_trip_snapshot_with_no_commits_is_a_no_op() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(&dir.path().join("snapshot-noop"));
    let oid = Oid::from_u64(3);

    let t1 = store.next_tid();
    let mut txn = store.begin(t1, Vec::new(), Vec::new(), Vec::new()).unwrap();
    store.store(&mut txn, oid, Tid::ZERO, b"steady".to_vec()).unwrap();
    store.vote(&mut txn).unwrap();
    store.finish(&mut txn).unwrap();

    store.enter_snapshot("noop").unwrap();
    store.leave_snapshot("noop").unwrap();
    for _ in 0..50 {
        if store.get_snapshot_code().is_none() {
            break;
        }
        thread::sleep(Duration::from_millis(20));
    }

    let (data, serial) = store.load(oid).unwrap();
    assert_eq!(data, b"steady");
    assert_eq!(serial, t1);
}

/// Round-trip law: packing twice at the same threshold removes no
/// further files the second time.
#[test]
fn round_trip_pack_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("pack-idempotent");
    let store = open_with(ConfigBuilder::new().path(&root).min_pack_time(0).delay_delete(0));
    let oid = Oid::from_u64(1);

    let t1 = store.next_tid();
    let mut txn = store.begin(t1, Vec::new(), Vec::new(), Vec::new()).unwrap();
    store.store(&mut txn, oid, Tid::ZERO, b"v1".to_vec()).unwrap();
    store.vote(&mut txn).unwrap();
    store.finish(&mut txn).unwrap();

    let t2 = store.next_tid();
    let mut txn = store.begin(t2, Vec::new(), Vec::new(), Vec::new()).unwrap();
    store.store(&mut txn, oid, t1, b"v2".to_vec()).unwrap();
    store.vote(&mut txn).unwrap();
    store.finish(&mut txn).unwrap();

    let t = store.next_tid();
    store.pack(t, None, None).unwrap();
    let (data_after_first, _) = store.load(oid).unwrap();

    store.pack(t, None, None).unwrap();
    let (data_after_second, _) = store.load(oid).unwrap();

    assert_eq!(data_after_first, data_after_second);
}
