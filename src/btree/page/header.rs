use crate::{
    btree::consts::DB_HEADER_SIZE,
    io::{ByteReader, ByteWriter},
    types::{DbResult, PageIndex, NO_PAGE},
};

/// The database header, the first 100 bytes of page 0. Journaled
/// alongside pages so free-list changes commit atomically.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DbHeader {
    pub first_free_page: PageIndex,
    pub free_page_count: u32,
}

impl DbHeader {
    pub fn new() -> Self {
        Self {
            first_free_page: NO_PAGE,
            free_page_count: 0,
        }
    }

    pub fn marshal(&self) -> DbResult<Vec<u8>> {
        let mut w = ByteWriter::with_capacity(DB_HEADER_SIZE);
        w.write(&self.first_free_page);
        w.write(&self.free_page_count);
        w.into_padded_bytes(DB_HEADER_SIZE)
    }

    pub fn unmarshal(buf: &[u8]) -> DbResult<Self> {
        let mut r = ByteReader::new(buf);
        Ok(Self {
            first_free_page: r.read()?,
            free_page_count: r.read()?,
        })
    }
}

impl Default for DbHeader {
    fn default() -> Self {
        Self::new()
    }
}
