//! Typed statement records. The SQL parser that fills these lives
//! outside the crate; the engine consumes them as plain data.

use crate::{
    catalog::PrimaryKeySpec,
    query::predicate::OneOrMore,
    storage::{schema::Column, value::Value},
};

#[derive(Debug, Clone)]
pub enum Statement {
    CreateTable(CreateTableStmt),
    DropTable(DropTableStmt),
    CreateIndex(CreateIndexStmt),
    DropIndex(DropIndexStmt),
    Insert(InsertStmt),
    Select(SelectStmt),
    Update(UpdateStmt),
    Delete(DeleteStmt),
}

#[derive(Debug, Clone)]
pub struct CreateTableStmt {
    pub name: String,
    pub columns: Vec<Column>,
    pub primary_key: Option<PrimaryKeySpec>,
}

#[derive(Debug, Clone)]
pub struct DropTableStmt {
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct CreateIndexStmt {
    pub name: String,
    pub table: String,
    pub columns: Vec<String>,
    pub unique: bool,
}

#[derive(Debug, Clone)]
pub struct DropIndexStmt {
    pub name: String,
}

/// Row values align with `columns`; an empty column list means
/// positional assignment over the whole schema. `None` is NULL.
#[derive(Debug, Clone)]
pub struct InsertStmt {
    pub table: String,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Option<Value>>>,
}

#[derive(Debug, Clone)]
pub struct SelectStmt {
    pub table: String,
    /// Empty means every column.
    pub fields: Vec<String>,
    pub conditions: OneOrMore,
    pub order_by: Option<OrderBy>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct UpdateStmt {
    pub table: String,
    pub set: Vec<(String, Option<Value>)>,
    pub conditions: OneOrMore,
}

#[derive(Debug, Clone)]
pub struct DeleteStmt {
    pub table: String,
    pub conditions: OneOrMore,
}

#[derive(Debug, Clone)]
pub struct OrderBy {
    pub field: String,
    pub reverse: bool,
}
