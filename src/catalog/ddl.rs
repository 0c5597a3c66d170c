//! Canonical DDL text stored in the `sql` column of the schema table.
//!
//! The engine emits and re-reads a fixed canonical form; the full SQL
//! dialect lives outside the crate. Reopening a database re-parses
//! these strings to rebuild the catalog.

use crate::{
    error::DbError,
    storage::schema::{Column, ColumnKind},
    types::DbResult,
};

pub fn format_create_table(name: &str, columns: &[Column]) -> String {
    let cols: Vec<String> = columns
        .iter()
        .map(|c| {
            if c.nullable {
                format!("{} {}", c.name, c.kind)
            } else {
                format!("{} {} NOT NULL", c.name, c.kind)
            }
        })
        .collect();
    format!("CREATE TABLE {} ({})", name, cols.join(", "))
}

pub fn format_create_primary_key(
    name: &str,
    table: &str,
    columns: &[String],
    autoincrement: bool,
) -> String {
    let suffix = if autoincrement { " AUTOINCREMENT" } else { "" };
    format!(
        "CREATE PRIMARY KEY {} ON {} ({}){}",
        name,
        table,
        columns.join(", "),
        suffix
    )
}

pub fn format_create_index(name: &str, table: &str, columns: &[String], unique: bool) -> String {
    let kind = if unique { "UNIQUE INDEX" } else { "INDEX" };
    format!("CREATE {} {} ON {} ({})", kind, name, table, columns.join(", "))
}

fn corrupt_ddl(sql: &str) -> DbError {
    DbError::corrupt(format!("unreadable catalog ddl: {}", sql))
}

fn parse_kind(text: &str) -> DbResult<ColumnKind> {
    match text {
        "bool" => Ok(ColumnKind::Bool),
        "int32" => Ok(ColumnKind::Int32),
        "int64" => Ok(ColumnKind::Int64),
        "float32" => Ok(ColumnKind::Float32),
        "float64" => Ok(ColumnKind::Float64),
        "timestamp" => Ok(ColumnKind::Timestamp),
        "text" => Ok(ColumnKind::Text),
        other => {
            if let Some(n) = other
                .strip_prefix("varchar(")
                .and_then(|r| r.strip_suffix(')'))
            {
                let n: u32 = n
                    .parse()
                    .map_err(|_| DbError::corrupt(format!("bad varchar size in ddl: {}", other)))?;
                return Ok(ColumnKind::Varchar(n));
            }
            Err(DbError::corrupt(format!("unknown column kind in ddl: {}", other)))
        }
    }
}

/// Parse the canonical `CREATE TABLE name (col kind [NOT NULL], ...)`.
pub fn parse_create_table(sql: &str) -> DbResult<(String, Vec<Column>)> {
    let rest = sql
        .strip_prefix("CREATE TABLE ")
        .ok_or_else(|| corrupt_ddl(sql))?;
    let open = rest.find('(').ok_or_else(|| corrupt_ddl(sql))?;
    let close = rest.rfind(')').ok_or_else(|| corrupt_ddl(sql))?;
    let name = rest[..open].trim().to_string();
    if name.is_empty() {
        return Err(corrupt_ddl(sql));
    }

    let mut columns = Vec::new();
    for part in split_top_level(&rest[open + 1..close]) {
        let part = part.trim();
        let (spec, nullable) = match part.strip_suffix(" NOT NULL") {
            Some(spec) => (spec, false),
            None => (part, true),
        };
        let (col_name, kind) = spec
            .split_once(' ')
            .ok_or_else(|| corrupt_ddl(sql))?;
        columns.push(Column {
            name: col_name.to_string(),
            kind: parse_kind(kind.trim())?,
            nullable,
        });
    }
    Ok((name, columns))
}

/// Split a column list on commas that are not inside `varchar(...)`.
fn split_top_level(text: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut current = String::new();
    for ch in text.chars() {
        match ch {
            '(' => {
                depth += 1;
                current.push(ch);
            }
            ')' => {
                depth = depth.saturating_sub(1);
                current.push(ch);
            }
            ',' if depth == 0 => {
                parts.push(current.clone());
                current.clear();
            }
            _ => current.push(ch),
        }
    }
    if !current.trim().is_empty() {
        parts.push(current);
    }
    parts
}

pub struct ParsedIndex {
    pub name: String,
    pub table: String,
    pub columns: Vec<String>,
    pub unique: bool,
    pub autoincrement: bool,
}

/// Parse the canonical index/primary-key forms.
pub fn parse_create_index(sql: &str) -> DbResult<ParsedIndex> {
    let (rest, unique) = if let Some(r) = sql.strip_prefix("CREATE PRIMARY KEY ") {
        (r, true)
    } else if let Some(r) = sql.strip_prefix("CREATE UNIQUE INDEX ") {
        (r, true)
    } else if let Some(r) = sql.strip_prefix("CREATE INDEX ") {
        (r, false)
    } else {
        return Err(corrupt_ddl(sql));
    };

    let (name, rest) = rest.split_once(" ON ").ok_or_else(|| corrupt_ddl(sql))?;
    let open = rest.find('(').ok_or_else(|| corrupt_ddl(sql))?;
    let close = rest.rfind(')').ok_or_else(|| corrupt_ddl(sql))?;
    let table = rest[..open].trim().to_string();
    let columns: Vec<String> = rest[open + 1..close]
        .split(',')
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty())
        .collect();
    if columns.is_empty() {
        return Err(corrupt_ddl(sql));
    }
    let autoincrement = rest[close + 1..].trim() == "AUTOINCREMENT";
    Ok(ParsedIndex {
        name: name.trim().to_string(),
        table,
        columns,
        unique,
        autoincrement,
    })
}
