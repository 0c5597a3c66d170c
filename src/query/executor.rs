//! Statement execution.
//!
//! Reads run as a three-stage pipeline over bounded channels: a source
//! walks the chosen scan (leaf chain, index lookup + row fetch, or
//! ordered index walk), a filter applies the residual predicates, and
//! the sink collects rows, deduplicating across the disjunction's
//! scans by row id. DELETE and UPDATE buffer their full target set
//! before touching the tree so a scan never observes its own
//! modifications.

use std::collections::{HashMap, HashSet};

use crossbeam::channel::bounded;
use log::debug;

use crate::{
    catalog::Table,
    error::DbError,
    query::{
        planner::{self, QueryPlan, Scan, ScanKind},
        statement::{DeleteStmt, InsertStmt, SelectStmt, UpdateStmt},
    },
    storage::{
        schema::ColumnKind,
        tuple::{validate_row, Row},
        value::{OptionalValue, Value},
    },
    transaction::Transaction,
    types::{CancelToken, DbResult, Pod, RowId},
    utils::HandyRwLock,
};

const CHANNEL_CAPACITY: usize = 64;

/// Outcome of one statement.
#[derive(Debug, Default)]
pub struct StatementResult {
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
    pub rows_affected: usize,
    pub count: usize,
}

impl StatementResult {
    pub fn affected(n: usize) -> Self {
        Self {
            rows_affected: n,
            count: n,
            ..Self::default()
        }
    }
}

pub fn execute_select(
    tx: &Transaction,
    table: &Table,
    stmt: &SelectStmt,
    token: &CancelToken,
) -> DbResult<StatementResult> {
    let plan = planner::plan(
        table,
        &stmt.conditions,
        stmt.order_by.as_ref(),
        &HashMap::new(),
    )?;
    let mut rows = run_plan(tx, table, &plan, token)?;

    if plan.sort_in_memory {
        if let Some(order_col) = plan
            .order_by
            .as_ref()
            .and_then(|f| table.schema.column_index(f))
        {
            sort_rows(&mut rows, order_col, plan.sort_reverse);
        }
    }

    let offset = stmt.offset.unwrap_or(0);
    let limit = stmt.limit.unwrap_or(usize::MAX);
    let rows: Vec<Row> = rows.into_iter().skip(offset).take(limit).collect();

    let columns = if stmt.fields.is_empty() {
        table
            .schema
            .columns()
            .iter()
            .map(|c| c.name.clone())
            .collect()
    } else {
        stmt.fields.clone()
    };
    let rows = project(table, &stmt.fields, rows)?;

    debug!("select on {} returned {} rows", table.name, rows.len());
    let count = rows.len();
    Ok(StatementResult {
        columns,
        rows,
        rows_affected: 0,
        count,
    })
}

pub fn execute_insert(
    tx: &Transaction,
    table_pod: &Pod<Table>,
    stmt: &InsertStmt,
    token: &CancelToken,
) -> DbResult<StatementResult> {
    let mut affected = 0;
    for values in &stmt.rows {
        token.check()?;
        let slots = {
            let table = table_pod.rl();
            build_row(tx, &table, &stmt.columns, values)?
        };
        let id = table_pod.wl().take_next_row_id();
        let row = Row::with_id(id, slots);

        let table = table_pod.rl();
        table.tree().insert_row(tx, &row)?;
        for def in table.all_indexes() {
            if let Some(key) = table.index_key_for(def, &row)? {
                def.tree().insert(tx, &key, id)?;
            }
        }
        affected += 1;
    }
    debug!("inserted {} rows", affected);
    Ok(StatementResult::affected(affected))
}

pub fn execute_update(
    tx: &Transaction,
    table: &Table,
    stmt: &UpdateStmt,
    token: &CancelToken,
) -> DbResult<StatementResult> {
    let mut sets = Vec::with_capacity(stmt.set.len());
    for (field, value) in &stmt.set {
        let pos = table
            .schema
            .column_index(field)
            .ok_or_else(|| DbError::validation(format!("unknown column {}", field)))?;
        sets.push((pos, value.clone()));
    }

    let plan = planner::plan(table, &stmt.conditions, None, &HashMap::new())?;
    let targets = run_plan(tx, table, &plan, token)?;

    let mut affected = 0;
    for old in targets {
        token.check()?;
        let mut values = old.values.clone();
        for (pos, value) in &sets {
            values[*pos] = match value {
                Some(v) => OptionalValue::some(v.clone()),
                None => OptionalValue::null(&table.schema.column(*pos).kind),
            };
        }
        let new_row = Row::with_id(old.id, values);
        validate_row(&table.schema, &new_row)?;

        for def in table.all_indexes() {
            let old_key = table.index_key_for(def, &old)?;
            let new_key = table.index_key_for(def, &new_row)?;
            if old_key != new_key {
                let tree = def.tree();
                if let Some(key) = old_key {
                    tree.delete(tx, &key, old.id)?;
                }
                if let Some(key) = new_key {
                    tree.insert(tx, &key, old.id)?;
                }
            }
        }
        table.tree().update_row(tx, &new_row)?;
        affected += 1;
    }
    debug!("updated {} rows in {}", affected, table.name);
    Ok(StatementResult::affected(affected))
}

pub fn execute_delete(
    tx: &Transaction,
    table: &Table,
    stmt: &DeleteStmt,
    token: &CancelToken,
) -> DbResult<StatementResult> {
    let plan = planner::plan(table, &stmt.conditions, None, &HashMap::new())?;
    // buffer the whole target set before deleting anything, so the
    // scan never chases pages the deletes are rewriting
    let targets = run_plan(tx, table, &plan, token)?;

    let mut affected = 0;
    for row in targets {
        token.check()?;
        for def in table.all_indexes() {
            if let Some(key) = table.index_key_for(def, &row)? {
                def.tree().delete(tx, &key, row.id)?;
            }
        }
        table.tree().delete_row(tx, row.id)?;
        affected += 1;
    }
    debug!("deleted {} rows from {}", affected, table.name);
    Ok(StatementResult::affected(affected))
}

/// Run every scan of a plan through the source → filter → sink
/// pipeline, deduplicating rows across scans by row id.
fn run_plan(
    tx: &Transaction,
    table: &Table,
    plan: &QueryPlan,
    token: &CancelToken,
) -> DbResult<Vec<Row>> {
    let reverse = !plan.sort_in_memory && plan.sort_reverse;
    let mut rows = Vec::new();
    let mut seen: HashSet<RowId> = HashSet::new();
    for scan in &plan.scans {
        run_scan(tx, table, scan, reverse, token, &mut seen, &mut rows)?;
    }
    Ok(rows)
}

fn run_scan(
    tx: &Transaction,
    table: &Table,
    scan: &Scan,
    reverse: bool,
    token: &CancelToken,
    seen: &mut HashSet<RowId>,
    out: &mut Vec<Row>,
) -> DbResult<()> {
    let (source_tx, source_rx) = bounded::<DbResult<Row>>(CHANNEL_CAPACITY);
    let (filtered_tx, filtered_rx) = bounded::<DbResult<Row>>(CHANNEL_CAPACITY);

    let mut failure: Option<DbError> = None;
    std::thread::scope(|s| {
        let producer_token = token.clone();
        s.spawn(move || {
            produce(tx, table, scan, reverse, &producer_token, &source_tx);
        });
        s.spawn(move || {
            for item in source_rx {
                let forwarded = match item {
                    Ok(row) => match scan.filters.matches(&table.schema, &row) {
                        Ok(true) => Ok(row),
                        Ok(false) => continue,
                        Err(e) => Err(e),
                    },
                    Err(e) => Err(e),
                };
                let stop = forwarded.is_err();
                if filtered_tx.send(forwarded).is_err() || stop {
                    break;
                }
            }
        });
        for item in filtered_rx {
            match item {
                Ok(row) => {
                    if seen.insert(row.id) {
                        out.push(row);
                    }
                }
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }
    });
    match failure {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// The source stage: emit candidate rows for one scan.
fn produce(
    tx: &Transaction,
    table: &Table,
    scan: &Scan,
    reverse: bool,
    token: &CancelToken,
    sender: &crossbeam::channel::Sender<DbResult<Row>>,
) {
    let send = |item: DbResult<Row>| sender.send(item).is_ok();
    match &scan.kind {
        ScanKind::Sequential => {
            let tree = table.tree();
            for item in tree.iter(tx, token.clone()) {
                let stop = item.is_err();
                if !send(item) || stop {
                    return;
                }
            }
        }
        ScanKind::IndexPoint {
            index,
            keys,
            prefix,
        } => {
            let def = match table.find_index(index) {
                Some(def) => def,
                None => {
                    send(Err(DbError::corrupt(format!("plan references index {}", index))));
                    return;
                }
            };
            let tree = def.tree();
            for key in keys {
                let ids = if *prefix {
                    tree.find_row_ids_by_prefix(tx, key)
                } else {
                    tree.find_row_ids(tx, key)
                };
                match ids {
                    Ok(ids) => {
                        if !send_rows_by_id(tx, table, ids, token, &send) {
                            return;
                        }
                    }
                    Err(e) => {
                        send(Err(e));
                        return;
                    }
                }
            }
        }
        ScanKind::IndexRange {
            index,
            lower,
            upper,
        } => {
            let def = match table.find_index(index) {
                Some(def) => def,
                None => {
                    send(Err(DbError::corrupt(format!("plan references index {}", index))));
                    return;
                }
            };
            let tree = def.tree();
            for item in tree.scan_range(tx, lower.clone(), upper.clone(), reverse, token.clone()) {
                match item {
                    Ok((_, ids)) => {
                        if !send_rows_by_id(tx, table, ids, token, &send) {
                            return;
                        }
                    }
                    Err(e) => {
                        send(Err(e));
                        return;
                    }
                }
            }
        }
        ScanKind::IndexAll { index, reverse } => {
            let def = match table.find_index(index) {
                Some(def) => def,
                None => {
                    send(Err(DbError::corrupt(format!("plan references index {}", index))));
                    return;
                }
            };
            let tree = def.tree();
            for item in tree.scan_all(tx, *reverse, token.clone()) {
                match item {
                    Ok((_, ids)) => {
                        if !send_rows_by_id(tx, table, ids, token, &send) {
                            return;
                        }
                    }
                    Err(e) => {
                        send(Err(e));
                        return;
                    }
                }
            }
        }
    }
}

fn send_rows_by_id(
    tx: &Transaction,
    table: &Table,
    ids: Vec<RowId>,
    token: &CancelToken,
    send: &impl Fn(DbResult<Row>) -> bool,
) -> bool {
    for id in ids {
        if let Err(e) = token.check() {
            send(Err(e));
            return false;
        }
        let item = match table.tree().get_row(tx, id) {
            Ok(Some(row)) => Ok(row),
            Ok(None) => Err(DbError::corrupt(format!(
                "index references missing row {}",
                id
            ))),
            Err(e) => Err(e),
        };
        let stop = item.is_err();
        if !send(item) || stop {
            return false;
        }
    }
    true
}

fn sort_rows(rows: &mut [Row], column: usize, reverse: bool) {
    rows.sort_by(|a, b| {
        let ord = match (a.values[column].as_value(), b.values[column].as_value()) {
            (None, None) => std::cmp::Ordering::Equal,
            (None, Some(_)) => std::cmp::Ordering::Less,
            (Some(_), None) => std::cmp::Ordering::Greater,
            (Some(x), Some(y)) => x.compare(y).unwrap_or(std::cmp::Ordering::Equal),
        };
        if reverse {
            ord.reverse()
        } else {
            ord
        }
    });
}

/// Drop unselected columns from each row, keeping their positions as
/// invalid placeholders so column indexes stay aligned.
fn project(table: &Table, fields: &[String], mut rows: Vec<Row>) -> DbResult<Vec<Row>> {
    if fields.is_empty() {
        return Ok(rows);
    }
    let mut keep = vec![false; table.schema.len()];
    for field in fields {
        let pos = table
            .schema
            .column_index(field)
            .ok_or_else(|| DbError::validation(format!("unknown column {}", field)))?;
        keep[pos] = true;
    }
    for row in &mut rows {
        for (i, slot) in row.values.iter_mut().enumerate() {
            if !keep[i] {
                *slot = OptionalValue::null(&table.schema.column(i).kind);
            }
        }
    }
    Ok(rows)
}

/// Align an insert's values with the schema, filling an autoincrement
/// primary key from the index's last key.
fn build_row(
    tx: &Transaction,
    table: &Table,
    columns: &[String],
    values: &[Option<Value>],
) -> DbResult<Vec<OptionalValue>> {
    let schema = &table.schema;
    let mut slots: Vec<OptionalValue> = schema
        .columns()
        .iter()
        .map(|c| OptionalValue::null(&c.kind))
        .collect();

    if columns.is_empty() {
        if values.len() != schema.len() {
            return Err(DbError::validation(format!(
                "insert provides {} values, table has {} columns",
                values.len(),
                schema.len()
            )));
        }
        for (i, value) in values.iter().enumerate() {
            if let Some(v) = value {
                slots[i] = OptionalValue::some(v.clone());
            }
        }
    } else {
        if columns.len() != values.len() {
            return Err(DbError::validation(format!(
                "insert names {} columns but provides {} values",
                columns.len(),
                values.len()
            )));
        }
        for (name, value) in columns.iter().zip(values.iter()) {
            let pos = schema
                .column_index(name)
                .ok_or_else(|| DbError::validation(format!("unknown column {}", name)))?;
            if let Some(v) = value {
                slots[pos] = OptionalValue::some(v.clone());
            }
        }
    }

    if let Some(pk) = &table.primary_key {
        if pk.autoincrement {
            let col = pk.columns[0];
            if !slots[col].valid {
                let next = match pk.tree().seek_last_key(tx)? {
                    Some(crate::btree::index::IndexKey::Int(n)) => n + 1,
                    None => 1,
                    Some(other) => {
                        return Err(DbError::corrupt(format!(
                            "autoincrement key is not an integer: {}",
                            other
                        )));
                    }
                };
                slots[col] = OptionalValue::some(match schema.column(col).kind {
                    ColumnKind::Int32 => Value::Int32(next as i32),
                    ColumnKind::Int64 => Value::Int64(next),
                    _ => {
                        return Err(DbError::corrupt(
                            "autoincrement on a non-integer primary key",
                        ));
                    }
                });
            }
        }
    }

    let probe = Row::new(slots);
    validate_row(schema, &probe)?;
    Ok(probe.values)
}
