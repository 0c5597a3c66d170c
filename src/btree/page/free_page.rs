use crate::{
    btree::consts::TAG_FREE,
    io::{ByteReader, ByteWriter},
    types::{DbResult, PageIndex},
};

/// A recycled page, linked into the free list rooted at the database
/// header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreePage {
    pub next_free: PageIndex,
}

impl FreePage {
    pub fn new(next_free: PageIndex) -> Self {
        Self { next_free }
    }

    pub fn marshal(&self, w: &mut ByteWriter) -> DbResult<()> {
        w.write(&TAG_FREE);
        w.write(&self.next_free);
        Ok(())
    }

    pub fn unmarshal(r: &mut ByteReader<'_>) -> DbResult<Self> {
        Ok(Self {
            next_free: r.read()?,
        })
    }
}
