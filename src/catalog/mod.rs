//! The catalog: table and index definitions, persisted as rows of the
//! system table `minisql_schema` rooted at page 0 and rebuilt at open
//! by re-parsing the stored canonical DDL.

pub mod ddl;

use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use log::info;
use once_cell::sync::Lazy;

use crate::{
    btree::{
        index::{IndexKey, IndexTree},
        page::{IndexPage, Page, TableLeafPage},
        table::TableTree,
    },
    error::DbError,
    storage::{
        schema::{Column, Schema},
        tuple::Row,
        value::{OptionalValue, Value},
    },
    transaction::Transaction,
    types::{DbResult, PageIndex, Pod, RowId},
    utils::HandyRwLock,
};

pub const SCHEMA_TABLE_NAME: &str = "minisql_schema";
pub const SCHEMA_ROOT_PAGE: PageIndex = 0;

/// `type` column values of schema rows.
pub const ENTRY_TABLE: i32 = 1;
pub const ENTRY_PRIMARY_KEY: i32 = 2;
pub const ENTRY_UNIQUE_INDEX: i32 = 3;
pub const ENTRY_SECONDARY_INDEX: i32 = 4;

pub static SCHEMA_TABLE_SCHEMA: Lazy<Schema> = Lazy::new(|| {
    Schema::new(vec![
        Column::new("type", crate::storage::schema::ColumnKind::Int32, false),
        Column::new("name", crate::storage::schema::ColumnKind::Varchar(255), false),
        Column::new("tbl_name", crate::storage::schema::ColumnKind::Varchar(255), true),
        Column::new("root_page", crate::storage::schema::ColumnKind::Int32, false),
        Column::new("sql", crate::storage::schema::ColumnKind::Text, true),
    ])
    .expect("schema table schema")
});

/// A user-declared primary key.
#[derive(Debug, Clone, PartialEq)]
pub struct PrimaryKeySpec {
    pub columns: Vec<String>,
    pub autoincrement: bool,
}

/// One index over a table: the positions of its key columns and the
/// root of its B-Tree.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexDef {
    pub name: String,
    pub columns: Vec<usize>,
    pub root_page: PageIndex,
    pub unique: bool,
    pub autoincrement: bool,
}

impl IndexDef {
    pub fn tree(&self) -> IndexTree {
        IndexTree::new(self.root_page, self.unique)
    }
}

#[derive(Debug)]
pub struct Table {
    pub name: String,
    pub schema: Schema,
    pub root_page: PageIndex,
    pub primary_key: Option<IndexDef>,
    pub unique_indexes: Vec<IndexDef>,
    pub secondary_indexes: Vec<IndexDef>,
    /// Next row id to assign; derived from the rightmost leaf at open.
    pub next_row_id: RowId,
}

impl Table {
    pub fn tree(&self) -> TableTree<'_> {
        TableTree::new(self.root_page, &self.schema)
    }

    pub fn all_indexes(&self) -> impl Iterator<Item = &IndexDef> {
        self.primary_key
            .iter()
            .chain(self.unique_indexes.iter())
            .chain(self.secondary_indexes.iter())
    }

    pub fn find_index(&self, name: &str) -> Option<&IndexDef> {
        self.all_indexes().find(|d| d.name == name)
    }

    /// The first index (primary key included) whose leading column is
    /// `column`.
    pub fn index_on_column(&self, column: usize) -> Option<&IndexDef> {
        self.all_indexes().find(|d| d.columns.first() == Some(&column))
    }

    pub fn take_next_row_id(&mut self) -> RowId {
        let id = self.next_row_id;
        self.next_row_id += 1;
        id
    }

    /// Build the index key of `row` for `def`. `None` when any key
    /// column is NULL; NULLs are not indexed.
    pub fn index_key_for(&self, def: &IndexDef, row: &Row) -> DbResult<Option<IndexKey>> {
        let mut parts = Vec::with_capacity(def.columns.len());
        for &col in &def.columns {
            match row.values.get(col).and_then(|v| v.as_value()) {
                Some(value) => parts.push(IndexKey::from_value(value)?),
                None => return Ok(None),
            }
        }
        Ok(Some(if parts.len() == 1 {
            parts.pop().unwrap()
        } else {
            IndexKey::Composite(parts)
        }))
    }
}

/// A catalog mutation produced inside a transaction and applied to the
/// in-memory map only after that transaction commits.
pub enum CatalogChange {
    AddTable(Table),
    RemoveTable(String),
    AddIndex { table: String, def: IndexDef },
    RemoveIndex { table: String, index: String },
}

pub struct Catalog {
    tables: HashMap<String, Pod<Table>>,
}

impl Catalog {
    pub fn empty() -> Self {
        Self {
            tables: HashMap::new(),
        }
    }

    /// Rebuild the catalog from the schema table.
    pub fn load(tx: &Transaction) -> DbResult<Catalog> {
        let schema_tree = TableTree::new(SCHEMA_ROOT_PAGE, &SCHEMA_TABLE_SCHEMA);
        let mut tables: HashMap<String, Table> = HashMap::new();
        let mut index_rows = Vec::new();

        for row in schema_tree.iter(tx, crate::types::CancelToken::new()) {
            let row = row?;
            let entry_type = match row.value(0) {
                Some(Value::Int32(t)) => *t,
                _ => return Err(DbError::corrupt("schema row without a type")),
            };
            let root_page = match row.value(3) {
                Some(Value::Int32(p)) => *p as PageIndex,
                _ => return Err(DbError::corrupt("schema row without a root page")),
            };
            let sql = match row.value(4) {
                Some(Value::Str(s)) => s.clone(),
                _ => return Err(DbError::corrupt("schema row without ddl")),
            };
            if entry_type == ENTRY_TABLE {
                let (name, columns) = ddl::parse_create_table(&sql)?;
                tables.insert(
                    name.clone(),
                    Table {
                        name,
                        schema: Schema::new(columns)?,
                        root_page,
                        primary_key: None,
                        unique_indexes: Vec::new(),
                        secondary_indexes: Vec::new(),
                        next_row_id: 1,
                    },
                );
            } else {
                index_rows.push((entry_type, root_page, sql));
            }
        }

        for (entry_type, root_page, sql) in index_rows {
            let parsed = ddl::parse_create_index(&sql)?;
            let table = tables.get_mut(&parsed.table).ok_or_else(|| {
                DbError::corrupt(format!("index {} references unknown table", parsed.name))
            })?;
            let def = IndexDef {
                name: parsed.name,
                columns: resolve_columns(&table.schema, &parsed.columns)?,
                root_page,
                unique: parsed.unique,
                autoincrement: parsed.autoincrement,
            };
            match entry_type {
                ENTRY_PRIMARY_KEY => table.primary_key = Some(def),
                ENTRY_UNIQUE_INDEX => table.unique_indexes.push(def),
                ENTRY_SECONDARY_INDEX => table.secondary_indexes.push(def),
                other => {
                    return Err(DbError::corrupt(format!(
                        "unknown schema entry type {}",
                        other
                    )));
                }
            }
        }

        // derive the next row id of every table from its tree
        for table in tables.values_mut() {
            let tree = TableTree::new(table.root_page, &table.schema);
            table.next_row_id = tree.last_row_id(tx)?.map(|id| id + 1).unwrap_or(1);
        }

        info!("catalog loaded, {} tables", tables.len());
        Ok(Catalog {
            tables: tables
                .into_iter()
                .map(|(k, v)| (k, Arc::new(RwLock::new(v))))
                .collect(),
        })
    }

    pub fn get_table(&self, name: &str) -> DbResult<Pod<Table>> {
        self.tables
            .get(name)
            .cloned()
            .ok_or_else(|| DbError::not_found(format!("table {}", name)))
    }

    pub fn table_names(&self) -> Vec<String> {
        use itertools::Itertools;
        self.tables.keys().cloned().sorted().collect()
    }

    pub fn apply(&mut self, change: CatalogChange) {
        match change {
            CatalogChange::AddTable(table) => {
                self.tables
                    .insert(table.name.clone(), Arc::new(RwLock::new(table)));
            }
            CatalogChange::RemoveTable(name) => {
                self.tables.remove(&name);
            }
            CatalogChange::AddIndex { table, def } => {
                if let Some(pod) = self.tables.get(&table) {
                    let mut t = pod.wl();
                    if def.unique {
                        t.unique_indexes.push(def);
                    } else {
                        t.secondary_indexes.push(def);
                    }
                }
            }
            CatalogChange::RemoveIndex { table, index } => {
                if let Some(pod) = self.tables.get(&table) {
                    let mut t = pod.wl();
                    t.unique_indexes.retain(|d| d.name != index);
                    t.secondary_indexes.retain(|d| d.name != index);
                }
            }
        }
    }

    /// Create a table (and its optional primary key index), writing the
    /// page trees and schema rows through `tx`.
    pub fn create_table(
        &self,
        tx: &Transaction,
        name: &str,
        columns: Vec<Column>,
        primary_key: Option<PrimaryKeySpec>,
    ) -> DbResult<CatalogChange> {
        if name == SCHEMA_TABLE_NAME {
            return Err(DbError::validation(format!("{} is reserved", name)));
        }
        if self.tables.contains_key(name) {
            return Err(DbError::validation(format!("table {} already exists", name)));
        }
        let schema = Schema::new(columns)?;

        let pk = match &primary_key {
            Some(spec) => {
                let positions = resolve_columns(&schema, &spec.columns)?;
                if spec.autoincrement {
                    if positions.len() != 1 {
                        return Err(DbError::validation(
                            "autoincrement needs a single-column primary key",
                        ));
                    }
                    let kind = schema.column(positions[0]).kind;
                    if !matches!(
                        kind,
                        crate::storage::schema::ColumnKind::Int32
                            | crate::storage::schema::ColumnKind::Int64
                    ) {
                        return Err(DbError::validation(
                            "autoincrement needs an integer primary key",
                        ));
                    }
                }
                for &p in &positions {
                    if schema.column(p).nullable {
                        return Err(DbError::validation(format!(
                            "primary key column {} must be NOT NULL",
                            schema.column(p).name
                        )));
                    }
                }
                Some((spec.clone(), positions))
            }
            None => None,
        };

        tx.mark_ddl();
        let root_page = tx.get_free_page()?;
        tx.set_page(root_page, Page::TableLeaf(TableLeafPage::new_root()))?;
        let table_sql = ddl::format_create_table(name, schema.columns());
        insert_schema_row(tx, ENTRY_TABLE, name, Some(name), root_page, &table_sql)?;

        let primary_key = match pk {
            Some((spec, positions)) => {
                let pk_root = tx.get_free_page()?;
                tx.set_page(pk_root, Page::Index(IndexPage::new_leaf_root()))?;
                let pk_name = format!("pk_{}", name);
                let sql = ddl::format_create_primary_key(
                    &pk_name,
                    name,
                    &spec.columns,
                    spec.autoincrement,
                );
                insert_schema_row(tx, ENTRY_PRIMARY_KEY, &pk_name, Some(name), pk_root, &sql)?;
                Some(IndexDef {
                    name: pk_name,
                    columns: positions,
                    root_page: pk_root,
                    unique: true,
                    autoincrement: spec.autoincrement,
                })
            }
            None => None,
        };

        info!("created table {} rooted at page {}", name, root_page);
        Ok(CatalogChange::AddTable(Table {
            name: name.to_string(),
            schema,
            root_page,
            primary_key,
            unique_indexes: Vec::new(),
            secondary_indexes: Vec::new(),
            next_row_id: 1,
        }))
    }

    /// Drop a table: free every page of its trees and delete its schema
    /// rows (indexes included).
    pub fn drop_table(&self, tx: &Transaction, name: &str) -> DbResult<CatalogChange> {
        let pod = self.get_table(name)?;
        let table = pod.rl();
        tx.mark_ddl();

        table.tree().free_all_pages(tx, false)?;
        for def in table.all_indexes() {
            def.tree().free_all_pages(tx, false)?;
        }
        delete_schema_rows(tx, |entry_type, entry_name, tbl_name| {
            (entry_type == ENTRY_TABLE && entry_name == name) || tbl_name == Some(name)
        })?;

        info!("dropped table {}", name);
        Ok(CatalogChange::RemoveTable(name.to_string()))
    }

    /// Create a secondary or unique index and backfill it from the
    /// table's existing rows.
    pub fn create_index(
        &self,
        tx: &Transaction,
        name: &str,
        table_name: &str,
        columns: &[String],
        unique: bool,
    ) -> DbResult<CatalogChange> {
        let pod = self.get_table(table_name)?;
        let table = pod.rl();
        if table.find_index(name).is_some() {
            return Err(DbError::validation(format!("index {} already exists", name)));
        }
        let positions = resolve_columns(&table.schema, columns)?;

        tx.mark_ddl();
        let root_page = tx.get_free_page()?;
        tx.set_page(root_page, Page::Index(IndexPage::new_leaf_root()))?;
        let entry_type = if unique {
            ENTRY_UNIQUE_INDEX
        } else {
            ENTRY_SECONDARY_INDEX
        };
        let sql = ddl::format_create_index(name, table_name, columns, unique);
        insert_schema_row(tx, entry_type, name, Some(table_name), root_page, &sql)?;

        let def = IndexDef {
            name: name.to_string(),
            columns: positions,
            root_page,
            unique,
            autoincrement: false,
        };

        // backfill from existing rows
        let tree = table.tree();
        let index_tree = def.tree();
        for row in tree.iter(tx, crate::types::CancelToken::new()) {
            let row = row?;
            if let Some(key) = table.index_key_for(&def, &row)? {
                index_tree.insert(tx, &key, row.id)?;
            }
        }

        info!("created index {} on {}", name, table_name);
        Ok(CatalogChange::AddIndex {
            table: table_name.to_string(),
            def,
        })
    }

    /// Drop a secondary or unique index. Primary keys cannot be
    /// dropped.
    pub fn drop_index(&self, tx: &Transaction, name: &str) -> DbResult<CatalogChange> {
        for pod in self.tables.values() {
            let table = pod.rl();
            if let Some(pk) = &table.primary_key {
                if pk.name == name {
                    return Err(DbError::validation("cannot drop a primary key index"));
                }
            }
            let found = table
                .unique_indexes
                .iter()
                .chain(table.secondary_indexes.iter())
                .find(|d| d.name == name);
            if let Some(def) = found {
                tx.mark_ddl();
                def.tree().free_all_pages(tx, false)?;
                delete_schema_rows(tx, |_, entry_name, _| entry_name == name)?;
                info!("dropped index {}", name);
                return Ok(CatalogChange::RemoveIndex {
                    table: table.name.clone(),
                    index: name.to_string(),
                });
            }
        }
        Err(DbError::not_found(format!("index {}", name)))
    }
}

fn resolve_columns(schema: &Schema, names: &[String]) -> DbResult<Vec<usize>> {
    if names.is_empty() {
        return Err(DbError::validation("an index needs at least one column"));
    }
    let mut positions = Vec::with_capacity(names.len());
    for name in names {
        let pos = schema
            .column_index(name)
            .ok_or_else(|| DbError::validation(format!("unknown column {}", name)))?;
        if positions.contains(&pos) {
            return Err(DbError::validation(format!("duplicate index column {}", name)));
        }
        positions.push(pos);
    }
    Ok(positions)
}

fn insert_schema_row(
    tx: &Transaction,
    entry_type: i32,
    name: &str,
    tbl_name: Option<&str>,
    root_page: PageIndex,
    sql: &str,
) -> DbResult<()> {
    let tree = TableTree::new(SCHEMA_ROOT_PAGE, &SCHEMA_TABLE_SCHEMA);
    let id = tree.last_row_id(tx)?.map(|i| i + 1).unwrap_or(1);
    let row = Row::with_id(
        id,
        vec![
            OptionalValue::some(Value::Int32(entry_type)),
            OptionalValue::some(Value::Str(name.to_string())),
            match tbl_name {
                Some(t) => OptionalValue::some(Value::Str(t.to_string())),
                None => OptionalValue::null(&crate::storage::schema::ColumnKind::Varchar(255)),
            },
            OptionalValue::some(Value::Int32(root_page as i32)),
            OptionalValue::some(Value::Str(sql.to_string())),
        ],
    );
    tree.insert_row(tx, &row)
}

fn delete_schema_rows(
    tx: &Transaction,
    predicate: impl Fn(i32, &str, Option<&str>) -> bool,
) -> DbResult<()> {
    let tree = TableTree::new(SCHEMA_ROOT_PAGE, &SCHEMA_TABLE_SCHEMA);
    let mut doomed = Vec::new();
    for row in tree.iter(tx, crate::types::CancelToken::new()) {
        let row = row?;
        let entry_type = match row.value(0) {
            Some(Value::Int32(t)) => *t,
            _ => continue,
        };
        let name = match row.value(1) {
            Some(Value::Str(s)) => s.as_str(),
            _ => continue,
        };
        let tbl_name = match row.value(2) {
            Some(Value::Str(s)) => Some(s.as_str()),
            _ => None,
        };
        if predicate(entry_type, name, tbl_name) {
            doomed.push(row.id);
        }
    }
    for id in doomed {
        tree.delete_row(tx, id)?;
    }
    Ok(())
}
