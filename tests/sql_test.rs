mod test_utils;

use minisql::{
    catalog::PrimaryKeySpec,
    query::predicate::{CmpOp, Condition, ConditionGroup, OneOrMore},
    storage::schema::{Column, ColumnKind},
    CreateIndexStmt, CreateTableStmt, DbError, DropIndexStmt, DropTableStmt, InsertStmt, OrderBy,
    SelectStmt, Statement, Value,
};

use crate::test_utils::{
    cmp, create_kv_table, delete_where, eq, insert_kv, int_at, one, select_all, select_where,
    setup, str_at, update_where, TestDb,
};

#[test]
fn test_create_insert_select() {
    setup();
    let t = TestDb::new("basic");
    create_kv_table(&t.db, "t");

    insert_kv(&t.db, "t", 1, "a");
    insert_kv(&t.db, "t", 2, "b");

    let rows = select_all(&t.db, "t");
    assert_eq!(rows.len(), 2);
    assert_eq!(int_at(&rows[0], 0), 1);
    assert_eq!(str_at(&rows[0], 1), "a");
    assert_eq!(int_at(&rows[1], 0), 2);
    t.db.check_integrity().unwrap();
}

#[test]
fn test_select_with_filter_and_projection() {
    setup();
    let t = TestDb::new("projection");
    create_kv_table(&t.db, "t");
    for i in 0..10 {
        insert_kv(&t.db, "t", i, &format!("v{}", i));
    }

    let result = t
        .db
        .execute(Statement::Select(SelectStmt {
            table: "t".to_string(),
            fields: vec!["v".to_string()],
            conditions: one(cmp("id", CmpOp::Ge, Value::Int64(7))),
            order_by: None,
            limit: None,
            offset: None,
        }))
        .unwrap();

    assert_eq!(result.columns, vec!["v"]);
    assert_eq!(result.count, 3);
    for row in &result.rows {
        // projected-away columns stay in place but are invalid
        assert!(row.value(0).is_none());
        assert!(row.value(1).is_some());
    }
}

#[test]
fn test_order_by_limit_offset() {
    setup();
    let t = TestDb::new("order");
    create_kv_table(&t.db, "t");
    for (id, v) in [(3, "c"), (1, "a"), (5, "e"), (2, "b"), (4, "d")] {
        insert_kv(&t.db, "t", id, v);
    }

    let result = t
        .db
        .execute(Statement::Select(SelectStmt {
            table: "t".to_string(),
            fields: vec![],
            conditions: OneOrMore::all(),
            order_by: Some(OrderBy {
                field: "v".to_string(),
                reverse: true,
            }),
            limit: Some(2),
            offset: Some(1),
        }))
        .unwrap();

    let values: Vec<String> = result.rows.iter().map(|r| str_at(r, 1)).collect();
    assert_eq!(values, vec!["d", "c"]);
}

#[test]
fn test_update_and_delete() {
    setup();
    let t = TestDb::new("dml");
    create_kv_table(&t.db, "t");
    for i in 1..=5 {
        insert_kv(&t.db, "t", i, "old");
    }

    let updated = update_where(
        &t.db,
        "t",
        vec![("v".to_string(), Some(Value::Str("new".to_string())))],
        one(cmp("id", CmpOp::Le, Value::Int64(2))),
    );
    assert_eq!(updated, 2);

    let rows = select_where(&t.db, "t", one(eq("v", Value::Str("new".to_string()))));
    assert_eq!(rows.len(), 2);

    let deleted = delete_where(&t.db, "t", one(eq("v", Value::Str("old".to_string()))));
    assert_eq!(deleted, 3);
    assert_eq!(select_all(&t.db, "t").len(), 2);
    t.db.check_integrity().unwrap();
}

#[test]
fn test_duplicate_primary_key_is_rejected() {
    setup();
    let t = TestDb::new("dup_pk");
    create_kv_table(&t.db, "t");
    insert_kv(&t.db, "t", 1, "a");

    let err = t
        .db
        .execute(Statement::Insert(InsertStmt {
            table: "t".to_string(),
            columns: vec![],
            rows: vec![vec![Some(Value::Int64(1)), Some(Value::Str("b".to_string()))]],
        }))
        .unwrap_err();
    assert!(matches!(err, DbError::DuplicateKey(_)));

    // the failed statement rolled back wholesale
    let rows = select_all(&t.db, "t");
    assert_eq!(rows.len(), 1);
    assert_eq!(str_at(&rows[0], 1), "a");
}

#[test]
fn test_not_null_violation() {
    setup();
    let t = TestDb::new("not_null");
    create_kv_table(&t.db, "t");
    let err = t
        .db
        .execute(Statement::Insert(InsertStmt {
            table: "t".to_string(),
            columns: vec![],
            rows: vec![vec![None, Some(Value::Str("x".to_string()))]],
        }))
        .unwrap_err();
    assert!(matches!(err, DbError::Validation(_)));
}

#[test]
fn test_autoincrement_assigns_consecutive_keys() {
    setup();
    let t = TestDb::new("autoinc");
    t.db.execute(Statement::CreateTable(CreateTableStmt {
        name: "notes".to_string(),
        columns: vec![
            Column::new("id", ColumnKind::Int64, false),
            Column::new("body", ColumnKind::Text, true),
        ],
        primary_key: Some(PrimaryKeySpec {
            columns: vec!["id".to_string()],
            autoincrement: true,
        }),
    }))
    .unwrap();

    for body in ["first", "second", "third"] {
        t.db.execute(Statement::Insert(InsertStmt {
            table: "notes".to_string(),
            columns: vec!["body".to_string()],
            rows: vec![vec![Some(Value::Str(body.to_string()))]],
        }))
        .unwrap();
    }

    let rows = select_all(&t.db, "notes");
    let ids: Vec<i64> = rows.iter().map(|r| int_at(r, 0)).collect();
    assert_eq!(ids, vec![1, 2, 3]);
}

#[test]
fn test_in_and_is_null_conditions() {
    setup();
    let t = TestDb::new("in_null");
    create_kv_table(&t.db, "t");
    insert_kv(&t.db, "t", 1, "a");
    insert_kv(&t.db, "t", 2, "b");
    t.db.execute(Statement::Insert(InsertStmt {
        table: "t".to_string(),
        columns: vec![],
        rows: vec![vec![Some(Value::Int64(3)), None]],
    }))
    .unwrap();

    let rows = select_where(
        &t.db,
        "t",
        one(Condition::In {
            field: "id".to_string(),
            values: vec![Value::Int64(1), Value::Int64(3)],
        }),
    );
    assert_eq!(rows.len(), 2);

    let rows = select_where(
        &t.db,
        "t",
        one(Condition::IsNull {
            field: "v".to_string(),
            negated: false,
        }),
    );
    assert_eq!(rows.len(), 1);
    assert_eq!(int_at(&rows[0], 0), 3);
}

#[test]
fn test_disjunction_deduplicates_rows() {
    setup();
    let t = TestDb::new("disjunction");
    create_kv_table(&t.db, "t");
    for i in 1..=4 {
        insert_kv(&t.db, "t", i, "x");
    }

    // both groups match id 2
    let rows = select_where(
        &t.db,
        "t",
        OneOrMore(vec![
            ConditionGroup(vec![cmp("id", CmpOp::Le, Value::Int64(2))]),
            ConditionGroup(vec![eq("id", Value::Int64(2))]),
        ]),
    );
    assert_eq!(rows.len(), 2);
}

#[test]
fn test_secondary_index_survives_reopen() {
    setup();
    let mut t = TestDb::new("reopen");
    create_kv_table(&t.db, "t");
    t.db.execute(Statement::CreateIndex(CreateIndexStmt {
        name: "t_by_v".to_string(),
        table: "t".to_string(),
        columns: vec!["v".to_string()],
        unique: false,
    }))
    .unwrap();
    for i in 0..50 {
        insert_kv(&t.db, "t", i, &format!("v{:02}", i % 10));
    }

    t.reopen();

    let rows = select_where(&t.db, "t", one(eq("v", Value::Str("v03".to_string()))));
    assert_eq!(rows.len(), 5);
    t.db.check_integrity().unwrap();

    // inserts keep assigning fresh row ids after reopen
    insert_kv(&t.db, "t", 100, "v03");
    let rows = select_where(&t.db, "t", one(eq("v", Value::Str("v03".to_string()))));
    assert_eq!(rows.len(), 6);
    t.db.check_integrity().unwrap();
}

#[test]
fn test_drop_index_and_table() {
    setup();
    let t = TestDb::new("drop");
    create_kv_table(&t.db, "t");
    t.db.execute(Statement::CreateIndex(CreateIndexStmt {
        name: "t_by_v".to_string(),
        table: "t".to_string(),
        columns: vec!["v".to_string()],
        unique: false,
    }))
    .unwrap();
    for i in 0..20 {
        insert_kv(&t.db, "t", i, "x");
    }

    t.db.execute(Statement::DropIndex(DropIndexStmt {
        name: "t_by_v".to_string(),
    }))
    .unwrap();
    t.db.check_integrity().unwrap();
    assert_eq!(select_all(&t.db, "t").len(), 20);

    t.db.execute(Statement::DropTable(DropTableStmt {
        name: "t".to_string(),
    }))
    .unwrap();
    t.db.check_integrity().unwrap();
    let err = select_all_err(&t.db);
    assert!(matches!(err, DbError::NotFound(_)));
}

fn select_all_err(db: &minisql::Database) -> DbError {
    db.execute(Statement::Select(SelectStmt {
        table: "t".to_string(),
        fields: vec![],
        conditions: OneOrMore::all(),
        order_by: None,
        limit: None,
        offset: None,
    }))
    .unwrap_err()
}

#[test]
fn test_explicit_transaction_scope() {
    setup();
    let t = TestDb::new("explicit_tx");
    create_kv_table(&t.db, "t");

    t.db.begin().unwrap();
    insert_kv(&t.db, "t", 1, "a");
    insert_kv(&t.db, "t", 2, "b");
    // reads inside the transaction observe its own writes
    assert_eq!(select_all(&t.db, "t").len(), 2);
    t.db.rollback().unwrap();

    assert_eq!(select_all(&t.db, "t").len(), 0);

    t.db.begin().unwrap();
    insert_kv(&t.db, "t", 3, "c");
    t.db.commit().unwrap();
    assert_eq!(select_all(&t.db, "t").len(), 1);
    t.db.check_integrity().unwrap();
}

#[test]
fn test_unknown_table_and_column() {
    setup();
    let t = TestDb::new("unknown");
    create_kv_table(&t.db, "t");

    let err = t
        .db
        .execute(Statement::Select(SelectStmt {
            table: "missing".to_string(),
            fields: vec![],
            conditions: OneOrMore::all(),
            order_by: None,
            limit: None,
            offset: None,
        }))
        .unwrap_err();
    assert!(matches!(err, DbError::NotFound(_)));

    let err = t
        .db
        .execute(Statement::Select(SelectStmt {
            table: "t".to_string(),
            fields: vec!["nope".to_string()],
            conditions: OneOrMore::all(),
            order_by: None,
            limit: None,
            offset: None,
        }))
        .unwrap_err();
    assert!(matches!(err, DbError::Validation(_)));
}
