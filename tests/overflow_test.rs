//! Large-text overflow chains: inline boundary, page-capacity
//! boundaries, chain reuse on update, chain release on delete.

mod test_utils;

use std::sync::Arc;

use minisql::{
    btree::{
        consts::{MAX_OVERFLOW_PAGE_DATA, PAGE_SIZE},
        page::{Page, TableLeafPage},
        pager::Pager,
        table::TableTree,
    },
    storage::{
        schema::{Column, ColumnKind, Schema},
        tuple::{Row, MAX_INLINE},
        value::{OptionalValue, Value},
    },
    transaction::{Transaction, TransactionManager},
    types::PageIndex,
    Database, InsertStmt, SelectStmt, Statement, Value as V,
};

use minisql::query::predicate::OneOrMore;

use crate::test_utils::{fresh_path, remove_db_files, setup, str_at};

struct RawDb {
    path: std::path::PathBuf,
    pager: Arc<Pager>,
    tm: Arc<TransactionManager>,
}

impl RawDb {
    fn new(name: &str) -> Self {
        let path = fresh_path(name);
        let pager = Arc::new(Pager::open(&path, 200, true).unwrap());
        let tm = Arc::new(TransactionManager::new(Arc::clone(&pager), true));
        Self { path, pager, tm }
    }

    fn begin(&self) -> Transaction {
        self.tm.begin()
    }
}

impl Drop for RawDb {
    fn drop(&mut self) {
        remove_db_files(&self.path);
    }
}

fn text_schema() -> Schema {
    Schema::new(vec![
        Column::new("id", ColumnKind::Int64, false),
        Column::new("body", ColumnKind::Text, true),
    ])
    .unwrap()
}

fn text_row(id: u64, len: usize) -> Row {
    Row::with_id(
        id,
        vec![
            OptionalValue::some(Value::Int64(id as i64)),
            OptionalValue::some(Value::Str("t".repeat(len))),
        ],
    )
}

fn new_root(tx: &Transaction) -> PageIndex {
    let root = tx.get_free_page().unwrap();
    tx.set_page(root, Page::TableLeaf(TableLeafPage::new_root()))
        .unwrap();
    root
}

/// Pages a freshly committed insert added to the file, minus pages it
/// took from the free list.
fn committed_page_growth(raw: &RawDb, insert: impl FnOnce(&Transaction)) -> u32 {
    let before = raw.pager.total_pages();
    let tx = raw.begin();
    insert(&tx);
    tx.commit().unwrap();
    raw.pager.total_pages() - before
}

#[test]
fn test_inline_and_overflow_boundaries() {
    setup();
    let raw = RawDb::new("boundaries");
    let schema = text_schema();
    let tx = raw.begin();
    let root = new_root(&tx);
    tx.commit().unwrap();
    let tree = TableTree::new(root, &schema);

    // MAX_INLINE stays inline: no page growth
    let grown = committed_page_growth(&raw, |tx| {
        tree.insert_row(tx, &text_row(1, MAX_INLINE)).unwrap();
    });
    assert_eq!(grown, 0);

    // one byte over allocates exactly one overflow page
    let grown = committed_page_growth(&raw, |tx| {
        tree.insert_row(tx, &text_row(2, MAX_INLINE + 1)).unwrap();
    });
    assert_eq!(grown, 1);

    // a text filling one overflow page exactly still takes one page
    let grown = committed_page_growth(&raw, |tx| {
        tree.insert_row(tx, &text_row(3, MAX_OVERFLOW_PAGE_DATA)).unwrap();
    });
    assert_eq!(grown, 1);

    // one byte past the page capacity chains a second page
    let grown = committed_page_growth(&raw, |tx| {
        tree.insert_row(tx, &text_row(4, MAX_OVERFLOW_PAGE_DATA + 1)).unwrap();
    });
    assert_eq!(grown, 2);

    // values read back whole
    let tx = raw.begin();
    for (id, len) in [
        (1, MAX_INLINE),
        (2, MAX_INLINE + 1),
        (3, MAX_OVERFLOW_PAGE_DATA),
        (4, MAX_OVERFLOW_PAGE_DATA + 1),
    ] {
        let row = tree.get_row(&tx, id).unwrap().unwrap();
        match row.value(1) {
            Some(Value::Str(s)) => assert_eq!(s.len(), len),
            other => panic!("missing body for row {}: {:?}", id, other),
        }
    }
    tree.check_integrity(&tx).unwrap();
    tx.commit().unwrap();
}

#[test]
fn test_delete_frees_overflow_chain() {
    setup();
    let raw = RawDb::new("free_chain");
    let schema = text_schema();
    let tx = raw.begin();
    let root = new_root(&tx);
    let tree = TableTree::new(root, &schema);
    // three overflow pages worth of text
    tree.insert_row(&tx, &text_row(1, MAX_OVERFLOW_PAGE_DATA * 2 + 10))
        .unwrap();
    tx.commit().unwrap();

    let tx = raw.begin();
    let free_before = tx.db_header().free_page_count;
    tree.delete_row(&tx, 1).unwrap();
    let free_after = tx.db_header().free_page_count;
    assert_eq!(free_after - free_before, 3);
    tx.commit().unwrap();
}

#[test]
fn test_update_reuses_overflow_pages() {
    setup();
    let raw = RawDb::new("reuse_chain");
    let schema = text_schema();
    let tx = raw.begin();
    let root = new_root(&tx);
    let tree = TableTree::new(root, &schema);
    tree.insert_row(&tx, &text_row(1, MAX_OVERFLOW_PAGE_DATA * 2)).unwrap();
    tx.commit().unwrap();
    let pages_after_insert = raw.pager.total_pages();

    // same-length rewrite: no new pages, nothing freed
    let tx = raw.begin();
    let mut replacement = text_row(1, MAX_OVERFLOW_PAGE_DATA * 2);
    replacement.values[1] = OptionalValue::some(Value::Str("u".repeat(MAX_OVERFLOW_PAGE_DATA * 2)));
    tree.update_row(&tx, &replacement).unwrap();
    let free_count = tx.db_header().free_page_count;
    tx.commit().unwrap();
    assert_eq!(raw.pager.total_pages(), pages_after_insert);
    assert_eq!(free_count, 0);

    // shrinking to one page frees the tail
    let tx = raw.begin();
    tree.update_row(&tx, &text_row(1, MAX_OVERFLOW_PAGE_DATA)).unwrap();
    assert_eq!(tx.db_header().free_page_count, 1);
    tx.commit().unwrap();

    // growing again recycles the freed page before extending the file
    let tx = raw.begin();
    tree.update_row(&tx, &text_row(1, MAX_OVERFLOW_PAGE_DATA * 2)).unwrap();
    assert_eq!(tx.db_header().free_page_count, 0);
    tx.commit().unwrap();
    assert_eq!(raw.pager.total_pages(), pages_after_insert);

    let tx = raw.begin();
    let row = tree.get_row(&tx, 1).unwrap().unwrap();
    match row.value(1) {
        Some(Value::Str(s)) => assert_eq!(s.len(), MAX_OVERFLOW_PAGE_DATA * 2),
        other => panic!("missing body: {:?}", other),
    }
    tx.commit().unwrap();
}

#[test]
fn test_big_text_through_the_public_api() {
    setup();
    let path = fresh_path("big_text_api");
    let db = Database::open(&path).unwrap();
    db.execute(Statement::CreateTable(minisql::CreateTableStmt {
        name: "docs".to_string(),
        columns: vec![
            Column::new("id", ColumnKind::Int64, false),
            Column::new("body", ColumnKind::Text, true),
        ],
        primary_key: None,
    }))
    .unwrap();

    let body = "x".repeat(100_000);
    db.execute(Statement::Insert(InsertStmt {
        table: "docs".to_string(),
        columns: vec![],
        rows: vec![vec![Some(V::Int64(1)), Some(V::Str(body.clone()))]],
    }))
    .unwrap();
    db.check_integrity().unwrap();
    db.close().unwrap();

    // survives a reopen, read back byte for byte
    let db = Database::open(&path).unwrap();
    let rows = db
        .execute(Statement::Select(SelectStmt {
            table: "docs".to_string(),
            fields: vec![],
            conditions: OneOrMore::all(),
            order_by: None,
            limit: None,
            offset: None,
        }))
        .unwrap()
        .rows;
    assert_eq!(rows.len(), 1);
    assert_eq!(str_at(&rows[0], 1), body);
    assert_eq!(
        std::fs::metadata(&path).unwrap().len() % PAGE_SIZE as u64,
        0
    );
    db.close().unwrap();
    remove_db_files(&path);
}
