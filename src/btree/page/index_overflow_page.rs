use crate::{
    btree::consts::{MAX_OVERFLOW_ROWIDS, TAG_INDEX_OVERFLOW},
    error::DbError,
    io::{ByteReader, ByteWriter},
    types::{DbResult, PageIndex, RowId, NO_PAGE},
};

/// Continuation of a non-unique index cell's row-id list. Holds up to
/// [`MAX_OVERFLOW_ROWIDS`] ids and links to the next page of the chain.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexOverflowPage {
    pub next_page: PageIndex,
    pub row_ids: Vec<RowId>,
}

impl IndexOverflowPage {
    pub fn new() -> Self {
        Self {
            next_page: NO_PAGE,
            row_ids: Vec::new(),
        }
    }

    pub fn is_full(&self) -> bool {
        self.row_ids.len() >= MAX_OVERFLOW_ROWIDS
    }

    pub fn marshal(&self, w: &mut ByteWriter) -> DbResult<()> {
        if self.row_ids.len() > MAX_OVERFLOW_ROWIDS {
            return Err(DbError::corrupt(format!(
                "index overflow page holds {} row ids, max {}",
                self.row_ids.len(),
                MAX_OVERFLOW_ROWIDS
            )));
        }
        w.write(&TAG_INDEX_OVERFLOW);
        w.write(&self.next_page);
        w.write(&(self.row_ids.len() as u16));
        for id in &self.row_ids {
            w.write(id);
        }
        Ok(())
    }

    pub fn unmarshal(r: &mut ByteReader<'_>) -> DbResult<Self> {
        let next_page: PageIndex = r.read()?;
        let count: u16 = r.read()?;
        if count as usize > MAX_OVERFLOW_ROWIDS {
            return Err(DbError::corrupt(format!(
                "index overflow page claims {} row ids",
                count
            )));
        }
        let mut row_ids = Vec::with_capacity(count as usize);
        for _ in 0..count {
            row_ids.push(r.read()?);
        }
        Ok(Self { next_page, row_ids })
    }
}

impl Default for IndexOverflowPage {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::consts::PAGE_SIZE;

    #[test]
    fn test_index_overflow_round_trip() {
        let mut page = IndexOverflowPage::new();
        page.next_page = 3;
        page.row_ids = (0..MAX_OVERFLOW_ROWIDS as u64).collect();
        let mut w = ByteWriter::new();
        page.marshal(&mut w).unwrap();
        assert!(w.size() <= PAGE_SIZE);
        let buf = w.into_padded_bytes(PAGE_SIZE).unwrap();
        let mut r = ByteReader::new(&buf[1..]);
        assert_eq!(IndexOverflowPage::unmarshal(&mut r).unwrap(), page);
    }
}
