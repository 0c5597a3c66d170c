#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};

use minisql::{
    catalog::PrimaryKeySpec,
    query::predicate::{CmpOp, Condition, OneOrMore},
    storage::schema::{Column, ColumnKind},
    utils,
    CreateTableStmt, Database, DeleteStmt, InsertStmt, Row, SelectStmt, Statement, UpdateStmt,
    Value,
};

static NEXT_DB: AtomicU32 = AtomicU32::new(0);

/// Set up logging. Call first in every test.
pub fn setup() {
    utils::init_log();
}

/// A temp-file database that cleans up after itself.
pub struct TestDb {
    pub db: Database,
    pub path: PathBuf,
}

impl TestDb {
    pub fn new(name: &str) -> Self {
        let path = fresh_path(name);
        let db = Database::open(&path).unwrap();
        Self { db, path }
    }

    /// Close and reopen, as a process restart would.
    pub fn reopen(&mut self) {
        self.db.close().unwrap();
        self.db = Database::open(&self.path).unwrap();
    }
}

impl Drop for TestDb {
    fn drop(&mut self) {
        let _ = self.db.close();
        remove_db_files(&self.path);
    }
}

pub fn fresh_path(name: &str) -> PathBuf {
    let mut path = std::env::temp_dir();
    path.push(format!(
        "minisql_test_{}_{}_{}.db",
        name,
        std::process::id(),
        NEXT_DB.fetch_add(1, Ordering::Relaxed)
    ));
    remove_db_files(&path);
    path
}

pub fn remove_db_files(path: &Path) {
    let _ = std::fs::remove_file(path);
    let _ = std::fs::remove_file(minisql::journal::journal_path(path));
}

/// `t(id int64 NOT NULL, v varchar(50))` with a plain (non-auto) pk.
pub fn create_kv_table(db: &Database, name: &str) {
    db.execute(Statement::CreateTable(CreateTableStmt {
        name: name.to_string(),
        columns: vec![
            Column::new("id", ColumnKind::Int64, false),
            Column::new("v", ColumnKind::Varchar(50), true),
        ],
        primary_key: Some(PrimaryKeySpec {
            columns: vec!["id".to_string()],
            autoincrement: false,
        }),
    }))
    .unwrap();
}

pub fn insert_kv(db: &Database, table: &str, id: i64, v: &str) {
    db.execute(Statement::Insert(InsertStmt {
        table: table.to_string(),
        columns: vec![],
        rows: vec![vec![Some(Value::Int64(id)), Some(Value::Str(v.to_string()))]],
    }))
    .unwrap();
}

pub fn select_all(db: &Database, table: &str) -> Vec<Row> {
    db.execute(Statement::Select(SelectStmt {
        table: table.to_string(),
        fields: vec![],
        conditions: OneOrMore::all(),
        order_by: None,
        limit: None,
        offset: None,
    }))
    .unwrap()
    .rows
}

pub fn select_where(db: &Database, table: &str, conditions: OneOrMore) -> Vec<Row> {
    db.execute(Statement::Select(SelectStmt {
        table: table.to_string(),
        fields: vec![],
        conditions,
        order_by: None,
        limit: None,
        offset: None,
    }))
    .unwrap()
    .rows
}

pub fn delete_where(db: &Database, table: &str, conditions: OneOrMore) -> usize {
    db.execute(Statement::Delete(DeleteStmt {
        table: table.to_string(),
        conditions,
    }))
    .unwrap()
    .rows_affected
}

pub fn update_where(
    db: &Database,
    table: &str,
    set: Vec<(String, Option<Value>)>,
    conditions: OneOrMore,
) -> usize {
    db.execute(Statement::Update(UpdateStmt {
        table: table.to_string(),
        set,
        conditions,
    }))
    .unwrap()
    .rows_affected
}

pub fn eq(field: &str, value: Value) -> Condition {
    Condition::Cmp {
        field: field.to_string(),
        op: CmpOp::Eq,
        value,
    }
}

pub fn cmp(field: &str, op: CmpOp, value: Value) -> Condition {
    Condition::Cmp {
        field: field.to_string(),
        op,
        value,
    }
}

pub fn one(cond: Condition) -> OneOrMore {
    OneOrMore::single(vec![cond])
}

/// The i64 in column `col`, which must be valid.
pub fn int_at(row: &Row, col: usize) -> i64 {
    match row.value(col) {
        Some(Value::Int64(v)) => *v,
        other => panic!("expected int64 at column {}, got {:?}", col, other),
    }
}

pub fn str_at(row: &Row, col: usize) -> String {
    match row.value(col) {
        Some(Value::Str(v)) => v.clone(),
        other => panic!("expected string at column {}, got {:?}", col, other),
    }
}
