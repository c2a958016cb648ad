//! # Crash Recovery Tests
//!
//! Reopen-and-replay scenarios over the durable file-backed log: a
//! database torn down (or abandoned mid-write) must rebuild the same
//! committed state from the log alone.

use std::path::Path;
use std::sync::Arc;

use stranddb::{Database, FileLog, SharedLog};

fn open_file_db(path: &Path) -> Database {
    let log = Arc::new(FileLog::open(path).unwrap());
    Database::open(log as Arc<dyn SharedLog>, 0).unwrap()
}

fn get(db: &Database, key: &[u8]) -> Option<Vec<u8>> {
    let mut txn = db.begin().unwrap();
    let value = txn.get(key).unwrap();
    assert!(txn.commit().unwrap());
    value
}

#[test]
fn reopen_replays_committed_state() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("shared.log");

    {
        let db = open_file_db(&path);
        let mut txn = db.begin().unwrap();
        txn.put(b"a", b"1").unwrap();
        txn.put(b"b", b"2").unwrap();
        assert!(txn.commit().unwrap());

        let mut txn = db.begin().unwrap();
        txn.put(b"a", b"updated").unwrap();
        txn.delete(b"b").unwrap();
        txn.put(b"c", b"3").unwrap();
        assert!(txn.commit().unwrap());
        db.close();
    }

    let db = open_file_db(&path);
    assert_eq!(get(&db, b"a").as_deref(), Some(b"updated".as_ref()));
    assert_eq!(get(&db, b"b"), None);
    assert_eq!(get(&db, b"c").as_deref(), Some(b"3".as_ref()));
    db.close();
}

#[test]
fn reopen_twice_is_stable() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("shared.log");

    {
        let db = open_file_db(&path);
        for i in 0..10u32 {
            let mut txn = db.begin().unwrap();
            txn.put(format!("key-{i}").as_bytes(), format!("v{i}").as_bytes())
                .unwrap();
            assert!(txn.commit().unwrap());
        }
        db.close();
    }

    for _ in 0..2 {
        let db = open_file_db(&path);
        for i in 0..10u32 {
            assert_eq!(
                get(&db, format!("key-{i}").as_bytes()).as_deref(),
                Some(format!("v{i}").as_bytes())
            );
        }
        db.close();
    }
}

#[test]
fn recovered_database_accepts_new_commits() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("shared.log");

    {
        let db = open_file_db(&path);
        let mut txn = db.begin().unwrap();
        txn.put(b"counter", b"1").unwrap();
        assert!(txn.commit().unwrap());
        db.close();
    }

    let db = open_file_db(&path);
    let mut txn = db.begin().unwrap();
    assert_eq!(txn.get(b"counter").unwrap().as_deref(), Some(b"1".as_ref()));
    txn.put(b"counter", b"2").unwrap();
    assert!(txn.commit().unwrap());
    assert_eq!(get(&db, b"counter").as_deref(), Some(b"2".as_ref()));
    db.close();
}

#[test]
fn torn_log_tail_recovers_to_last_intact_commit() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("shared.log");

    {
        let db = open_file_db(&path);
        let mut txn = db.begin().unwrap();
        txn.put(b"intact", b"yes").unwrap();
        assert!(txn.commit().unwrap());
        db.close();
    }

    // simulate a crash mid-append
    {
        use std::io::Write;
        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .unwrap();
        file.write_all(&[0x17, 0x2a, 0x00, 0x9f]).unwrap();
    }

    let db = open_file_db(&path);
    assert_eq!(get(&db, b"intact").as_deref(), Some(b"yes".as_ref()));
    db.close();
}

#[test]
fn conflict_decisions_replay_identically() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("shared.log");

    {
        let db = open_file_db(&path);
        let mut t1 = db.begin().unwrap();
        let mut t2 = db.begin().unwrap();
        t1.put(b"contested", b"winner").unwrap();
        t2.put(b"contested", b"loser").unwrap();
        assert!(t1.commit().unwrap());
        assert!(!t2.commit().unwrap());
        db.close();
    }

    // both intentions are in the log; replay must re-run conflict
    // detection and abort the loser again
    let db = open_file_db(&path);
    assert_eq!(get(&db, b"contested").as_deref(), Some(b"winner".as_ref()));
    db.close();
}
