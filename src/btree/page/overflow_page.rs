use bytes::Bytes;

use crate::{
    btree::consts::{MAX_OVERFLOW_PAGE_DATA, TAG_TABLE_OVERFLOW},
    error::DbError,
    io::{ByteReader, ByteWriter},
    types::{DbResult, PageIndex, NO_PAGE},
};

/// One link of a large-text chain: up to [`MAX_OVERFLOW_PAGE_DATA`]
/// payload bytes plus the next page in the chain.
#[derive(Debug, Clone, PartialEq)]
pub struct TableOverflowPage {
    pub next_page: PageIndex,
    pub data: Bytes,
}

impl TableOverflowPage {
    pub fn new(data: Bytes) -> Self {
        debug_assert!(data.len() <= MAX_OVERFLOW_PAGE_DATA);
        Self {
            next_page: NO_PAGE,
            data,
        }
    }

    pub fn marshal(&self, w: &mut ByteWriter) -> DbResult<()> {
        if self.data.len() > MAX_OVERFLOW_PAGE_DATA {
            return Err(DbError::corrupt(format!(
                "overflow page holds {} bytes, max {}",
                self.data.len(),
                MAX_OVERFLOW_PAGE_DATA
            )));
        }
        w.write(&TAG_TABLE_OVERFLOW);
        w.write(&self.next_page);
        w.write(&(self.data.len() as u32));
        w.write_bytes(&self.data);
        Ok(())
    }

    pub fn unmarshal(r: &mut ByteReader<'_>) -> DbResult<Self> {
        let next_page: PageIndex = r.read()?;
        let data_size: u32 = r.read()?;
        if data_size as usize > MAX_OVERFLOW_PAGE_DATA {
            return Err(DbError::corrupt(format!(
                "overflow page claims {} bytes",
                data_size
            )));
        }
        let data = Bytes::copy_from_slice(r.read_bytes(data_size as usize)?);
        Ok(Self { next_page, data })
    }
}
