//! Row predicates: a statement's WHERE clause normalized into a
//! disjunction of conjunctions.

use std::cmp::Ordering;

use crate::{
    error::DbError,
    storage::{schema::Schema, tuple::Row, value::Value},
    types::DbResult,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Cmp {
        field: String,
        op: CmpOp,
        value: Value,
    },
    In {
        field: String,
        values: Vec<Value>,
    },
    NotIn {
        field: String,
        values: Vec<Value>,
    },
    IsNull {
        field: String,
        negated: bool,
    },
}

impl Condition {
    pub fn field(&self) -> &str {
        match self {
            Condition::Cmp { field, .. }
            | Condition::In { field, .. }
            | Condition::NotIn { field, .. }
            | Condition::IsNull { field, .. } => field,
        }
    }

    /// Evaluate against a full row. Comparisons with NULL are false,
    /// matching SQL three-valued logic collapsed to a filter.
    pub fn matches(&self, schema: &Schema, row: &Row) -> DbResult<bool> {
        let pos = schema.column_index(self.field()).ok_or_else(|| {
            DbError::validation(format!("unknown column {}", self.field()))
        })?;
        let slot = &row.values[pos];
        match self {
            Condition::IsNull { negated, .. } => Ok(slot.valid == *negated),
            Condition::Cmp { op, value, .. } => match slot.as_value() {
                None => Ok(false),
                Some(actual) => {
                    let ord = compare(actual, value)?;
                    Ok(match op {
                        CmpOp::Eq => ord == Ordering::Equal,
                        CmpOp::Ne => ord != Ordering::Equal,
                        CmpOp::Lt => ord == Ordering::Less,
                        CmpOp::Le => ord != Ordering::Greater,
                        CmpOp::Gt => ord == Ordering::Greater,
                        CmpOp::Ge => ord != Ordering::Less,
                    })
                }
            },
            Condition::In { values, .. } => match slot.as_value() {
                None => Ok(false),
                Some(actual) => {
                    for v in values {
                        if compare(actual, v)? == Ordering::Equal {
                            return Ok(true);
                        }
                    }
                    Ok(false)
                }
            },
            Condition::NotIn { values, .. } => match slot.as_value() {
                None => Ok(false),
                Some(actual) => {
                    for v in values {
                        if compare(actual, v)? == Ordering::Equal {
                            return Ok(false);
                        }
                    }
                    Ok(true)
                }
            },
        }
    }
}

fn compare(a: &Value, b: &Value) -> DbResult<Ordering> {
    a.compare(b).ok_or_else(|| {
        DbError::validation(format!(
            "cannot compare {} with {}",
            a.type_name(),
            b.type_name()
        ))
    })
}

/// A conjunction: every condition must hold.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ConditionGroup(pub Vec<Condition>);

impl ConditionGroup {
    pub fn matches(&self, schema: &Schema, row: &Row) -> DbResult<bool> {
        for cond in &self.0 {
            if !cond.matches(schema, row)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// A disjunction of conjunctions. No groups means "match everything".
#[derive(Debug, Clone, PartialEq, Default)]
pub struct OneOrMore(pub Vec<ConditionGroup>);

impl OneOrMore {
    pub fn all() -> Self {
        Self(Vec::new())
    }

    pub fn single(conditions: Vec<Condition>) -> Self {
        Self(vec![ConditionGroup(conditions)])
    }

    pub fn matches(&self, schema: &Schema, row: &Row) -> DbResult<bool> {
        if self.0.is_empty() {
            return Ok(true);
        }
        for group in &self.0 {
            if group.matches(schema, row)? {
                return Ok(true);
            }
        }
        Ok(false)
    }
}
