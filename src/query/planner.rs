//! Scan selection.
//!
//! Each condition group (one conjunct of the WHERE disjunction) turns
//! into exactly one scan: an index point lookup for equalities and IN
//! lists, an index range for bounded comparisons under the selectivity
//! threshold, an ordered whole-index walk for ORDER BY without
//! predicates, or a sequential leaf-chain walk. Predicates the chosen
//! scan cannot satisfy ride along as filters.

use std::collections::{HashMap, HashSet};

use log::debug;

use crate::{
    btree::index::{IndexKey, RangeBound},
    catalog::{IndexDef, Table},
    error::DbError,
    io::ByteWriter,
    query::{
        predicate::{CmpOp, Condition, ConditionGroup, OneOrMore},
        statement::OrderBy,
    },
    transaction::Transaction,
    types::{CancelToken, DbResult},
};

/// Ranges estimated more selective than this fraction go through the
/// index; anything coarser scans sequentially.
const RANGE_SELECTIVITY_THRESHOLD: f64 = 0.30;
/// Estimated fraction of a table matched by a half-bounded range.
const HALF_BOUNDED_FRACTION: f64 = 1.0 / 3.0;
/// Estimated fraction matched by a fully bounded range.
const BOUNDED_FRACTION: f64 = 0.25;

#[derive(Debug, Clone, PartialEq)]
pub enum ScanKind {
    Sequential,
    IndexPoint {
        index: String,
        keys: Vec<IndexKey>,
        /// Keys cover only a leading prefix of a composite index.
        prefix: bool,
    },
    IndexRange {
        index: String,
        lower: Option<RangeBound>,
        upper: Option<RangeBound>,
    },
    IndexAll {
        index: String,
        reverse: bool,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Scan {
    pub kind: ScanKind,
    pub filters: ConditionGroup,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueryPlan {
    pub scans: Vec<Scan>,
    pub sort_in_memory: bool,
    pub sort_reverse: bool,
    pub order_by: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IndexStats {
    pub n_entry: u64,
    /// Distinct values per key column.
    pub n_distinct: Vec<u64>,
}

pub fn plan(
    table: &Table,
    conditions: &OneOrMore,
    order_by: Option<&OrderBy>,
    stats: &HashMap<String, IndexStats>,
) -> DbResult<QueryPlan> {
    let mut scans = Vec::new();
    if conditions.0.is_empty() {
        scans.push(Scan {
            kind: ScanKind::Sequential,
            filters: ConditionGroup::default(),
        });
    } else {
        for group in &conditions.0 {
            scans.push(plan_group(table, group, stats)?);
        }
    }

    let mut plan = QueryPlan {
        scans,
        sort_in_memory: false,
        sort_reverse: false,
        order_by: None,
    };

    if let Some(order_by) = order_by {
        let order_col = table
            .schema
            .column_index(&order_by.field)
            .ok_or_else(|| DbError::validation(format!("unknown column {}", order_by.field)))?;
        plan.order_by = Some(order_by.field.clone());
        plan.sort_reverse = order_by.reverse;
        plan.sort_in_memory = true;

        if plan.scans.len() == 1 {
            let scan = &mut plan.scans[0];
            match &scan.kind {
                ScanKind::IndexRange { index, .. } | ScanKind::IndexAll { index, .. } => {
                    if leading_column(table, index) == Some(order_col) {
                        plan.sort_in_memory = false;
                    }
                }
                ScanKind::Sequential => {
                    // no usable predicate, but the order column has an
                    // index: walk it instead of sorting
                    if let Some(def) = table.index_on_column(order_col) {
                        scan.kind = ScanKind::IndexAll {
                            index: def.name.clone(),
                            reverse: order_by.reverse,
                        };
                        plan.sort_in_memory = false;
                    }
                }
                ScanKind::IndexPoint { .. } => {}
            }
        }
    }

    debug!("plan for {}: {:?}", table.name, plan);
    Ok(plan)
}

fn leading_column(table: &Table, index: &str) -> Option<usize> {
    table.find_index(index).and_then(|d| d.columns.first().copied())
}

fn plan_group(
    table: &Table,
    group: &ConditionGroup,
    stats: &HashMap<String, IndexStats>,
) -> DbResult<Scan> {
    // rule 1: equality on an indexed column, extended to the longest
    // covered prefix of a composite index
    let mut equalities: HashMap<&str, &crate::storage::value::Value> = HashMap::new();
    for cond in &group.0 {
        if let Condition::Cmp {
            field,
            op: CmpOp::Eq,
            value,
        } = cond
        {
            equalities.entry(field.as_str()).or_insert(value);
        }
    }
    let mut best: Option<(&IndexDef, usize)> = None;
    for def in table.all_indexes() {
        let mut covered = 0;
        for &col in &def.columns {
            if equalities.contains_key(table.schema.column(col).name.as_str()) {
                covered += 1;
            } else {
                break;
            }
        }
        if covered > 0 && best.map_or(true, |(_, c)| covered > c) {
            best = Some((def, covered));
        }
    }
    if let Some((def, covered)) = best {
        let mut parts = Vec::with_capacity(covered);
        let mut consumed: HashSet<&str> = HashSet::new();
        for &col in def.columns.iter().take(covered) {
            let name = table.schema.column(col).name.as_str();
            parts.push(IndexKey::from_value(equalities[name])?);
            consumed.insert(name);
        }
        let key = if parts.len() == 1 {
            parts.pop().unwrap()
        } else {
            IndexKey::Composite(parts)
        };
        let filters = ConditionGroup(
            group
                .0
                .iter()
                .filter(|c| {
                    !matches!(c, Condition::Cmp { field, op: CmpOp::Eq, .. }
                        if consumed.contains(field.as_str()))
                })
                .cloned()
                .collect(),
        );
        return Ok(Scan {
            kind: ScanKind::IndexPoint {
                index: def.name.clone(),
                keys: vec![key],
                prefix: covered < def.columns.len(),
            },
            filters,
        });
    }

    // rule 2: IN list on an indexed column, one scan with several keys
    for (i, cond) in group.0.iter().enumerate() {
        if let Condition::In { field, values } = cond {
            if let Some(col) = table.schema.column_index(field) {
                if let Some(def) = table.index_on_column(col) {
                    let keys: DbResult<Vec<IndexKey>> =
                        values.iter().map(IndexKey::from_value).collect();
                    let mut residual = group.0.clone();
                    residual.remove(i);
                    return Ok(Scan {
                        kind: ScanKind::IndexPoint {
                            index: def.name.clone(),
                            keys: keys?,
                            prefix: def.columns.len() > 1,
                        },
                        filters: ConditionGroup(residual),
                    });
                }
            }
        }
    }

    // rule 4: a bounded range on a single-column index under the
    // selectivity threshold. `!=`, NOT IN and IS NULL cannot use a
    // B-Tree and fall through to a sequential scan (rule 3).
    for def in table.all_indexes() {
        if def.columns.len() != 1 {
            continue;
        }
        let column_name = table.schema.column(def.columns[0]).name.as_str();
        let mut lower: Option<RangeBound> = None;
        let mut upper: Option<RangeBound> = None;
        let mut used = Vec::new();
        for (i, cond) in group.0.iter().enumerate() {
            if let Condition::Cmp { field, op, value } = cond {
                if field != column_name {
                    continue;
                }
                let key = match op {
                    CmpOp::Gt | CmpOp::Ge | CmpOp::Lt | CmpOp::Le => IndexKey::from_value(value)?,
                    _ => continue,
                };
                match op {
                    CmpOp::Gt => tighten_lower(&mut lower, RangeBound::exclusive(key)),
                    CmpOp::Ge => tighten_lower(&mut lower, RangeBound::inclusive(key)),
                    CmpOp::Lt => tighten_upper(&mut upper, RangeBound::exclusive(key)),
                    CmpOp::Le => tighten_upper(&mut upper, RangeBound::inclusive(key)),
                    _ => unreachable!(),
                }
                used.push(i);
            }
        }
        if lower.is_none() && upper.is_none() {
            continue;
        }
        if !range_is_selective(stats.get(&def.name), lower.is_some() && upper.is_some()) {
            continue;
        }
        let filters = ConditionGroup(
            group
                .0
                .iter()
                .enumerate()
                .filter(|(i, _)| !used.contains(i))
                .map(|(_, c)| c.clone())
                .collect(),
        );
        return Ok(Scan {
            kind: ScanKind::IndexRange {
                index: def.name.clone(),
                lower,
                upper,
            },
            filters,
        });
    }

    Ok(Scan {
        kind: ScanKind::Sequential,
        filters: group.clone(),
    })
}

fn tighten_lower(current: &mut Option<RangeBound>, candidate: RangeBound) {
    let replace = match current {
        None => true,
        Some(existing) => match candidate.key.cmp(&existing.key) {
            std::cmp::Ordering::Greater => true,
            std::cmp::Ordering::Equal => !candidate.inclusive && existing.inclusive,
            std::cmp::Ordering::Less => false,
        },
    };
    if replace {
        *current = Some(candidate);
    }
}

fn tighten_upper(current: &mut Option<RangeBound>, candidate: RangeBound) {
    let replace = match current {
        None => true,
        Some(existing) => match candidate.key.cmp(&existing.key) {
            std::cmp::Ordering::Less => true,
            std::cmp::Ordering::Equal => !candidate.inclusive && existing.inclusive,
            std::cmp::Ordering::Greater => false,
        },
    };
    if replace {
        *current = Some(candidate);
    }
}

/// With no statistics, assume the index helps. With statistics, a half
/// bounded range is assumed to cover a third of the table and a fully
/// bounded one a quarter; only estimates at or under the threshold use
/// the index.
fn range_is_selective(stats: Option<&IndexStats>, bounded: bool) -> bool {
    match stats {
        None => true,
        Some(stats) => {
            if stats.n_entry == 0 {
                return true;
            }
            let fraction = if bounded {
                BOUNDED_FRACTION
            } else {
                HALF_BOUNDED_FRACTION
            };
            fraction <= RANGE_SELECTIVITY_THRESHOLD
        }
    }
}

/// Walk an index and measure it: total bindings plus distinct values
/// per key column. Computed on demand; nothing is persisted.
pub fn compute_index_stats(
    tx: &Transaction,
    def: &IndexDef,
) -> DbResult<IndexStats> {
    let tree = def.tree();
    let mut n_entry = 0u64;
    let mut distinct: Vec<HashSet<Vec<u8>>> = vec![HashSet::new(); def.columns.len()];
    for item in tree.scan_all(tx, false, CancelToken::new()) {
        let (key, ids) = item?;
        n_entry += ids.len() as u64;
        let parts: Vec<&IndexKey> = match &key {
            IndexKey::Composite(parts) => parts.iter().collect(),
            other => vec![other],
        };
        for (i, part) in parts.iter().enumerate().take(distinct.len()) {
            let mut w = ByteWriter::new();
            part.encode(&mut w);
            distinct[i].insert(w.into_bytes());
        }
    }
    Ok(IndexStats {
        n_entry,
        n_distinct: distinct.into_iter().map(|s| s.len() as u64).collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        catalog::{IndexDef, Table},
        storage::{
            schema::{Column, ColumnKind, Schema},
            value::Value,
        },
    };

    fn table_with_email_index() -> Table {
        Table {
            name: "users".into(),
            schema: Schema::new(vec![
                Column::new("id", ColumnKind::Int64, false),
                Column::new("email", ColumnKind::Varchar(120), true),
            ])
            .unwrap(),
            root_page: 1,
            primary_key: None,
            unique_indexes: Vec::new(),
            secondary_indexes: vec![IndexDef {
                name: "users_by_email".into(),
                columns: vec![1],
                root_page: 2,
                unique: false,
                autoincrement: false,
            }],
            next_row_id: 1,
        }
    }

    fn cmp(field: &str, op: CmpOp, value: Value) -> Condition {
        Condition::Cmp {
            field: field.into(),
            op,
            value,
        }
    }

    #[test]
    fn test_equality_becomes_index_point() {
        let table = table_with_email_index();
        let conds = OneOrMore::single(vec![
            cmp("email", CmpOp::Eq, Value::Str("a@b".into())),
            cmp("id", CmpOp::Gt, Value::Int64(10)),
        ]);
        let plan = plan(&table, &conds, None, &HashMap::new()).unwrap();
        assert_eq!(plan.scans.len(), 1);
        match &plan.scans[0].kind {
            ScanKind::IndexPoint { index, keys, prefix } => {
                assert_eq!(index, "users_by_email");
                assert_eq!(keys, &vec![IndexKey::Str("a@b".into())]);
                assert!(!prefix);
            }
            other => panic!("unexpected scan {:?}", other),
        }
        // the id predicate is residual
        assert_eq!(plan.scans[0].filters.0.len(), 1);
    }

    #[test]
    fn test_bounded_range_with_order_by() {
        let table = table_with_email_index();
        let conds = OneOrMore::single(vec![
            cmp("email", CmpOp::Gt, Value::Str("f".into())),
            cmp("email", CmpOp::Le, Value::Str("q".into())),
            cmp("id", CmpOp::Eq, Value::Int64(42)),
        ]);
        let order = OrderBy {
            field: "email".into(),
            reverse: true,
        };
        let plan = plan(&table, &conds, Some(&order), &HashMap::new()).unwrap();
        assert_eq!(plan.scans.len(), 1);
        match &plan.scans[0].kind {
            ScanKind::IndexRange { index, lower, upper } => {
                assert_eq!(index, "users_by_email");
                assert_eq!(
                    lower,
                    &Some(RangeBound::exclusive(IndexKey::Str("f".into())))
                );
                assert_eq!(upper, &Some(RangeBound::inclusive(IndexKey::Str("q".into()))));
            }
            other => panic!("unexpected scan {:?}", other),
        }
        assert_eq!(
            plan.scans[0].filters.0,
            vec![cmp("id", CmpOp::Eq, Value::Int64(42))]
        );
        assert!(plan.sort_reverse);
        assert!(!plan.sort_in_memory);
    }

    #[test]
    fn test_not_equal_scans_sequentially() {
        let table = table_with_email_index();
        let conds = OneOrMore::single(vec![cmp("email", CmpOp::Ne, Value::Str("x".into()))]);
        let plan = plan(&table, &conds, None, &HashMap::new()).unwrap();
        assert_eq!(plan.scans[0].kind, ScanKind::Sequential);
        assert_eq!(plan.scans[0].filters.0.len(), 1);
    }

    #[test]
    fn test_in_list_is_one_point_scan() {
        let table = table_with_email_index();
        let conds = OneOrMore::single(vec![Condition::In {
            field: "email".into(),
            values: vec![Value::Str("a".into()), Value::Str("b".into())],
        }]);
        let plan = plan(&table, &conds, None, &HashMap::new()).unwrap();
        match &plan.scans[0].kind {
            ScanKind::IndexPoint { keys, .. } => assert_eq!(keys.len(), 2),
            other => panic!("unexpected scan {:?}", other),
        }
    }

    #[test]
    fn test_order_by_without_predicate_walks_index() {
        let table = table_with_email_index();
        let order = OrderBy {
            field: "email".into(),
            reverse: false,
        };
        let plan = plan(&table, &OneOrMore::all(), Some(&order), &HashMap::new()).unwrap();
        assert_eq!(
            plan.scans[0].kind,
            ScanKind::IndexAll {
                index: "users_by_email".into(),
                reverse: false
            }
        );
        assert!(!plan.sort_in_memory);
    }

    #[test]
    fn test_half_bounded_range_with_stats_scans_sequentially() {
        let table = table_with_email_index();
        let conds = OneOrMore::single(vec![cmp("email", CmpOp::Gt, Value::Str("f".into()))]);
        let mut stats = HashMap::new();
        stats.insert(
            "users_by_email".to_string(),
            IndexStats {
                n_entry: 1000,
                n_distinct: vec![900],
            },
        );
        let plan = plan(&table, &conds, None, &stats).unwrap();
        assert_eq!(plan.scans[0].kind, ScanKind::Sequential);
    }

    #[test]
    fn test_disjunction_yields_one_scan_per_group() {
        let table = table_with_email_index();
        let conds = OneOrMore(vec![
            ConditionGroup(vec![cmp("email", CmpOp::Eq, Value::Str("a".into()))]),
            ConditionGroup(vec![cmp("id", CmpOp::Eq, Value::Int64(1))]),
        ]);
        let plan = plan(&table, &conds, None, &HashMap::new()).unwrap();
        assert_eq!(plan.scans.len(), 2);
        assert!(matches!(plan.scans[0].kind, ScanKind::IndexPoint { .. }));
        assert_eq!(plan.scans[1].kind, ScanKind::Sequential);
    }
}
