//! Crash recovery scenarios driven through the public surface.

mod test_utils;

use minisql::{
    journal::{self, JournalEntry},
    Database, Value,
};

use crate::test_utils::{
    create_kv_table, insert_kv, int_at, select_all, setup, str_at, update_where, TestDb,
};

const PAGE_SIZE: usize = 4096;
const DB_HEADER_SIZE: usize = 100;

/// Rebuild the journal a crashed commit would have left behind, from a
/// full snapshot of the database file taken before that commit.
fn plant_journal(path: &std::path::Path, snapshot: &[u8]) {
    let pages = snapshot.len() / PAGE_SIZE;
    let mut entries = Vec::new();
    for index in 0..pages as u32 {
        let body = if index == 0 {
            snapshot[DB_HEADER_SIZE..PAGE_SIZE].to_vec()
        } else {
            let start = index as usize * PAGE_SIZE;
            snapshot[start..start + PAGE_SIZE].to_vec()
        };
        entries.push(JournalEntry {
            page_index: index,
            body,
        });
    }
    journal::write_journal(path, Some(&snapshot[..DB_HEADER_SIZE]), &entries).unwrap();
}

#[test]
fn test_crash_between_flush_and_journal_delete() {
    setup();
    let mut t = TestDb::new("crash_recovery");
    create_kv_table(&t.db, "t");
    insert_kv(&t.db, "t", 1, "a");
    t.db.close().unwrap();

    // snapshot the durable pre-state
    let snapshot = std::fs::read(&t.path).unwrap();

    // run the update to completion: pages flushed, journal deleted
    t.db = Database::open(&t.path).unwrap();
    let updated = update_where(
        &t.db,
        "t",
        vec![("v".to_string(), Some(Value::Str("b".to_string())))],
        crate::test_utils::one(crate::test_utils::eq("id", Value::Int64(1))),
    );
    assert_eq!(updated, 1);
    t.db.close().unwrap();

    // wind the clock back to the instant before the journal deletion:
    // database file updated, journal still on disk
    plant_journal(&t.path, &snapshot);

    // reopen: recovery must replay the pre-images
    t.db = Database::open(&t.path).unwrap();
    assert!(!journal::journal_path(&t.path).exists());
    let rows = select_all(&t.db, "t");
    assert_eq!(rows.len(), 1);
    assert_eq!(int_at(&rows[0], 0), 1);
    assert_eq!(str_at(&rows[0], 1), "a");
    t.db.check_integrity().unwrap();

    // and the same open again is a clean no-op
    t.reopen();
    let rows = select_all(&t.db, "t");
    assert_eq!(str_at(&rows[0], 1), "a");
}

#[test]
fn test_read_only_statement_writes_nothing() {
    setup();
    let mut t = TestDb::new("read_only");
    create_kv_table(&t.db, "t");
    insert_kv(&t.db, "t", 1, "a");
    t.db.close().unwrap();

    let before = std::fs::read(&t.path).unwrap();
    t.db = Database::open(&t.path).unwrap();
    let rows = select_all(&t.db, "t");
    assert_eq!(rows.len(), 1);
    t.db.close().unwrap();
    let after = std::fs::read(&t.path).unwrap();

    assert_eq!(before, after);
    assert!(!journal::journal_path(&t.path).exists());
}

#[test]
fn test_commits_survive_reopen() {
    setup();
    let mut t = TestDb::new("durability");
    create_kv_table(&t.db, "t");
    for i in 0..200 {
        insert_kv(&t.db, "t", i, &format!("row{}", i));
    }
    t.reopen();

    let rows = select_all(&t.db, "t");
    assert_eq!(rows.len(), 200);
    assert_eq!(str_at(&rows[17], 1), "row17");
    t.db.check_integrity().unwrap();
}

#[test]
fn test_journal_disabled_still_commits() {
    setup();
    let path = crate::test_utils::fresh_path("no_journal");
    let db = Database::open_with(
        &path,
        minisql::OpenOptions {
            journal_enabled: false,
            ..Default::default()
        },
    )
    .unwrap();
    create_kv_table(&db, "t");
    insert_kv(&db, "t", 1, "a");
    assert!(!journal::journal_path(&path).exists());
    db.close().unwrap();

    let db = Database::open(&path).unwrap();
    assert_eq!(select_all(&db, "t").len(), 1);
    db.close().unwrap();
    crate::test_utils::remove_db_files(&path);
}
