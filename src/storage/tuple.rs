//! Row representation and the cell payload codec.
//!
//! A leaf cell stores a 64-bit null bitmask plus the concatenated column
//! encodings, with NULL columns skipped. Strings carry a 4-byte length
//! prefix; a text value longer than [`MAX_INLINE`] stores the index of
//! its first overflow page instead of the bytes. Overflow chains are
//! resolved by the table store, so this codec works on
//! [`ColumnBytes`] slots that mark big text explicitly.

use bytes::Bytes;

use crate::{
    error::DbError,
    io::{ByteReader, ByteWriter},
    storage::{
        schema::{ColumnKind, Schema},
        value::{OptionalValue, Value},
    },
    types::{DbResult, PageIndex, RowId},
};

/// Longest string stored inline in a cell. Anything longer overflows.
pub const MAX_INLINE: usize = 255;

/// A logical tuple. `id` is 0 until the row is inserted.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    pub id: RowId,
    pub values: Vec<OptionalValue>,
}

impl Row {
    pub fn new(values: Vec<OptionalValue>) -> Self {
        Self { id: 0, values }
    }

    pub fn with_id(id: RowId, values: Vec<OptionalValue>) -> Self {
        Self { id, values }
    }

    pub fn value(&self, i: usize) -> Option<&Value> {
        self.values.get(i).and_then(|v| v.as_value())
    }
}

/// One column slot of a marshaled cell.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnBytes {
    Null,
    Inline(Value),
    /// Text longer than [`MAX_INLINE`]: total byte length plus the first
    /// page of the overflow chain.
    BigText { len: u32, first_page: PageIndex },
}

/// Check a full row against the schema. Every column must be present,
/// kind-correct, non-NULL where required, and within size limits.
pub fn validate_row(schema: &Schema, row: &Row) -> DbResult<()> {
    if row.values.len() != schema.len() {
        return Err(DbError::validation(format!(
            "row has {} columns, table has {}",
            row.values.len(),
            schema.len()
        )));
    }
    for (i, slot) in row.values.iter().enumerate() {
        let column = schema.column(i);
        if !slot.valid {
            if !column.nullable {
                return Err(DbError::validation(format!(
                    "column {} is not nullable",
                    column.name
                )));
            }
            continue;
        }
        if !slot.value.matches_kind(&column.kind) {
            return Err(DbError::validation(format!(
                "column {} expects {}, got {}",
                column.name,
                column.kind,
                slot.value.type_name()
            )));
        }
        match (&slot.value, &column.kind) {
            (Value::Str(s), ColumnKind::Varchar(n)) => {
                if s.len() > *n as usize {
                    return Err(DbError::validation(format!(
                        "value too large for column {}: {} bytes, max {}",
                        column.name,
                        s.len(),
                        n
                    )));
                }
            }
            (Value::Float32(v), _) if v.is_nan() => {
                return Err(DbError::validation(format!(
                    "NaN is not storable in column {}",
                    column.name
                )));
            }
            (Value::Float64(v), _) if v.is_nan() => {
                return Err(DbError::validation(format!(
                    "NaN is not storable in column {}",
                    column.name
                )));
            }
            _ => {}
        }
    }
    Ok(())
}

/// Marshal resolved column slots into `(null_bitmask, payload)`.
pub fn marshal_columns(schema: &Schema, cols: &[ColumnBytes]) -> DbResult<(u64, Bytes)> {
    debug_assert_eq!(cols.len(), schema.len());
    let mut mask: u64 = 0;
    let mut w = ByteWriter::new();
    for (i, slot) in cols.iter().enumerate() {
        let kind = &schema.column(i).kind;
        match slot {
            ColumnBytes::Null => {
                mask |= 1 << i;
            }
            ColumnBytes::Inline(value) => marshal_value(&mut w, kind, value)?,
            ColumnBytes::BigText { len, first_page } => {
                if !matches!(kind, ColumnKind::Text) {
                    return Err(DbError::validation(format!(
                        "column {} cannot hold overflowed text",
                        schema.column(i).name
                    )));
                }
                w.write(len);
                w.write(first_page);
            }
        }
    }
    Ok((mask, Bytes::from(w.into_bytes())))
}

fn marshal_value(w: &mut ByteWriter, kind: &ColumnKind, value: &Value) -> DbResult<()> {
    match (kind, value) {
        (ColumnKind::Bool, Value::Bool(v)) => w.write(v),
        (ColumnKind::Int32, Value::Int32(v)) => w.write(v),
        (ColumnKind::Int64, Value::Int64(v)) => w.write(v),
        (ColumnKind::Float32, Value::Float32(v)) => w.write(v),
        (ColumnKind::Float64, Value::Float64(v)) => w.write(v),
        (ColumnKind::Timestamp, Value::Timestamp(v)) => w.write(v),
        (ColumnKind::Varchar(n), Value::Str(s)) => {
            if s.len() > *n as usize {
                return Err(DbError::validation(format!(
                    "string of {} bytes exceeds varchar({})",
                    s.len(),
                    n
                )));
            }
            w.write(&(s.len() as u32));
            w.write_bytes(s.as_bytes());
        }
        (ColumnKind::Text, Value::Str(s)) => {
            if s.len() > MAX_INLINE {
                return Err(DbError::validation(
                    "text too large to inline, overflow marker expected",
                ));
            }
            w.write(&(s.len() as u32));
            w.write_bytes(s.as_bytes());
        }
        (kind, value) => {
            return Err(DbError::validation(format!(
                "cannot store {} into {} column",
                value.type_name(),
                kind
            )));
        }
    }
    Ok(())
}

/// Unmarshal a cell payload back into column slots.
pub fn unmarshal_columns(schema: &Schema, mask: u64, payload: &[u8]) -> DbResult<Vec<ColumnBytes>> {
    let mut r = ByteReader::new(payload);
    let mut cols = Vec::with_capacity(schema.len());
    for (i, column) in schema.columns().iter().enumerate() {
        if mask & (1 << i) != 0 {
            cols.push(ColumnBytes::Null);
            continue;
        }
        let slot = match column.kind {
            ColumnKind::Bool => ColumnBytes::Inline(Value::Bool(r.read()?)),
            ColumnKind::Int32 => ColumnBytes::Inline(Value::Int32(r.read()?)),
            ColumnKind::Int64 => ColumnBytes::Inline(Value::Int64(r.read()?)),
            ColumnKind::Float32 => ColumnBytes::Inline(Value::Float32(r.read()?)),
            ColumnKind::Float64 => ColumnBytes::Inline(Value::Float64(r.read()?)),
            ColumnKind::Timestamp => ColumnBytes::Inline(Value::Timestamp(r.read()?)),
            ColumnKind::Varchar(_) | ColumnKind::Text => {
                let len: u32 = r.read()?;
                if len as usize > MAX_INLINE {
                    if !matches!(column.kind, ColumnKind::Text) {
                        return Err(DbError::corrupt(format!(
                            "varchar column {} claims {} bytes",
                            column.name, len
                        )));
                    }
                    let first_page: PageIndex = r.read()?;
                    ColumnBytes::BigText { len, first_page }
                } else {
                    let bytes = r.read_bytes(len as usize)?;
                    let s = String::from_utf8(bytes.to_vec())
                        .map_err(|_| DbError::corrupt("invalid utf-8 in string cell"))?;
                    ColumnBytes::Inline(Value::Str(s))
                }
            }
        };
        cols.push(slot);
    }
    if r.remaining() != 0 {
        return Err(DbError::corrupt(format!(
            "{} trailing bytes after cell payload",
            r.remaining()
        )));
    }
    Ok(cols)
}
