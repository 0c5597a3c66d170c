//! Large-text overflow chains.
//!
//! A text value longer than [`MAX_INLINE`] lives outside its cell, in a
//! linked list of table overflow pages. The cell keeps `(length,
//! first_page)`; reads walk the chain, updates rewrite it in place and
//! only allocate or free at the tail.

use bytes::Bytes;

use crate::{
    btree::{
        consts::MAX_OVERFLOW_PAGE_DATA,
        page::{Page, TableOverflowPage},
    },
    error::DbError,
    storage::{
        schema::Schema,
        tuple::{marshal_columns, unmarshal_columns, ColumnBytes, Row, MAX_INLINE},
        value::{OptionalValue, Value},
    },
    transaction::Transaction,
    types::{DbResult, PageIndex, NO_PAGE},
    utils::HandyRwLock,
};

/// Write `data` into a fresh overflow chain, returning its first page.
pub fn write_chain(tx: &Transaction, data: &[u8]) -> DbResult<PageIndex> {
    debug_assert!(!data.is_empty());
    let mut chunks = data.chunks(MAX_OVERFLOW_PAGE_DATA);
    let first_chunk = chunks.next().unwrap();
    let first = tx.get_free_page()?;
    let mut prev = tx.set_page(
        first,
        Page::TableOverflow(TableOverflowPage::new(Bytes::copy_from_slice(first_chunk))),
    )?;
    for chunk in chunks {
        let index = tx.get_free_page()?;
        prev.wl().as_table_overflow_mut()?.next_page = index;
        prev = tx.set_page(
            index,
            Page::TableOverflow(TableOverflowPage::new(Bytes::copy_from_slice(chunk))),
        )?;
    }
    Ok(first)
}

/// Read a whole chain back. The accumulated length must match the
/// length recorded in the cell.
pub fn read_chain(tx: &Transaction, first: PageIndex, expected_len: usize) -> DbResult<Vec<u8>> {
    let mut data = Vec::with_capacity(expected_len);
    let mut index = first;
    while index != NO_PAGE {
        let page = tx.read_page(index)?;
        let overflow = page.as_table_overflow()?;
        data.extend_from_slice(&overflow.data);
        if data.len() > expected_len {
            return Err(DbError::corrupt(format!(
                "overflow chain from page {} longer than recorded size {}",
                first, expected_len
            )));
        }
        index = overflow.next_page;
    }
    if data.len() != expected_len {
        return Err(DbError::corrupt(format!(
            "overflow chain from page {} holds {} bytes, cell records {}",
            first,
            data.len(),
            expected_len
        )));
    }
    Ok(data)
}

/// Return every page of a chain to the free list.
pub fn free_chain(tx: &Transaction, first: PageIndex) -> DbResult<()> {
    let mut index = first;
    while index != NO_PAGE {
        let next = tx.read_page(index)?.as_table_overflow()?.next_page;
        tx.add_free_page(index)?;
        index = next;
    }
    Ok(())
}

/// Rewrite an existing chain with new contents, reusing its pages and
/// growing or shrinking only at the tail. Returns the (unchanged) first
/// page.
pub fn update_chain(tx: &Transaction, first: PageIndex, data: &[u8]) -> DbResult<PageIndex> {
    debug_assert!(!data.is_empty());
    let mut chunks = data.chunks(MAX_OVERFLOW_PAGE_DATA).peekable();
    let mut index = first;
    let mut prev: Option<crate::types::Pod<Page>> = None;
    while let Some(chunk) = chunks.next() {
        let (pod, old_next) = if index != NO_PAGE {
            let pod = tx.modify_page(index)?;
            let old_next = pod.rl().as_table_overflow()?.next_page;
            (pod, old_next)
        } else {
            // chain exhausted, grow the tail
            let fresh = tx.get_free_page()?;
            if let Some(prev) = &prev {
                prev.wl().as_table_overflow_mut()?.next_page = fresh;
            }
            let pod = tx.set_page(
                fresh,
                Page::TableOverflow(TableOverflowPage::new(Bytes::new())),
            )?;
            (pod, NO_PAGE)
        };
        {
            let mut guard = pod.wl();
            let overflow = guard.as_table_overflow_mut()?;
            overflow.data = Bytes::copy_from_slice(chunk);
            if chunks.peek().is_none() {
                overflow.next_page = NO_PAGE;
            }
        }
        let last = chunks.peek().is_none();
        if last && old_next != NO_PAGE {
            free_chain(tx, old_next)?;
        }
        prev = Some(pod);
        index = old_next;
    }
    Ok(first)
}

/// Resolve a row for storage: long text spills into fresh overflow
/// chains, everything else marshals inline.
pub fn encode_row(tx: &Transaction, schema: &Schema, row: &Row) -> DbResult<(u64, Bytes)> {
    let mut cols = Vec::with_capacity(schema.len());
    for (i, slot) in row.values.iter().enumerate() {
        let col = match slot.as_value() {
            None => ColumnBytes::Null,
            Some(Value::Str(s))
                if matches!(schema.column(i).kind, crate::storage::schema::ColumnKind::Text)
                    && s.len() > MAX_INLINE =>
            {
                let first_page = write_chain(tx, s.as_bytes())?;
                ColumnBytes::BigText {
                    len: s.len() as u32,
                    first_page,
                }
            }
            Some(v) => ColumnBytes::Inline(v.clone()),
        };
        cols.push(col);
    }
    marshal_columns(schema, &cols)
}

/// Rebuild a row from a cell payload, following overflow chains.
pub fn decode_row(
    tx: &Transaction,
    schema: &Schema,
    id: crate::types::RowId,
    null_mask: u64,
    payload: &[u8],
) -> DbResult<Row> {
    let cols = unmarshal_columns(schema, null_mask, payload)?;
    let mut values = Vec::with_capacity(cols.len());
    for (i, col) in cols.into_iter().enumerate() {
        let kind = &schema.column(i).kind;
        let value = match col {
            ColumnBytes::Null => OptionalValue::null(kind),
            ColumnBytes::Inline(v) => OptionalValue::some(v),
            ColumnBytes::BigText { len, first_page } => {
                let bytes = read_chain(tx, first_page, len as usize)?;
                let s = String::from_utf8(bytes)
                    .map_err(|_| DbError::corrupt("invalid utf-8 in overflowed text"))?;
                OptionalValue::some(Value::Str(s))
            }
        };
        values.push(value);
    }
    Ok(Row::with_id(id, values))
}
