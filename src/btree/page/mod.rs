//! The on-disk page union. A page's first non-header byte selects the
//! variant; every variant marshals into a fixed-size body (pages other
//! than 0 get the full page, page 0's body starts after the database
//! header).

mod free_page;
mod header;
mod index_overflow_page;
mod index_page;
mod internal_page;
mod leaf_page;
mod overflow_page;

pub use free_page::FreePage;
pub use header::DbHeader;
pub use index_overflow_page::IndexOverflowPage;
pub use index_page::{
    IndexCell, IndexChildSlot, IndexEntry, IndexInternalNode, IndexLeafNode, IndexNode, IndexPage,
    INDEX_HEADER_SIZE,
};
pub use internal_page::{
    ChildSlot, InternalEntry, TableInternalPage, INTERNAL_ENTRY_SIZE, INTERNAL_HEADER_SIZE,
};
pub use leaf_page::{LeafCell, TableLeafPage, LEAF_CELL_OVERHEAD, LEAF_HEADER_SIZE};
pub use overflow_page::TableOverflowPage;

use crate::{
    btree::consts::{
        TAG_FREE, TAG_INDEX, TAG_INDEX_OVERFLOW, TAG_TABLE_INTERNAL, TAG_TABLE_LEAF,
        TAG_TABLE_OVERFLOW,
    },
    error::DbError,
    io::{ByteReader, ByteWriter},
    types::DbResult,
};

#[derive(Debug, Clone, PartialEq)]
pub enum Page {
    TableLeaf(TableLeafPage),
    TableInternal(TableInternalPage),
    TableOverflow(TableOverflowPage),
    Index(IndexPage),
    IndexOverflow(IndexOverflowPage),
    Free(FreePage),
}

impl Page {
    pub fn type_tag(&self) -> u8 {
        match self {
            Page::TableLeaf(_) => TAG_TABLE_LEAF,
            Page::TableInternal(_) => TAG_TABLE_INTERNAL,
            Page::TableOverflow(_) => TAG_TABLE_OVERFLOW,
            Page::Index(_) => TAG_INDEX,
            Page::IndexOverflow(_) => TAG_INDEX_OVERFLOW,
            Page::Free(_) => TAG_FREE,
        }
    }

    /// Serialize into exactly `body_size` bytes (zero padded).
    pub fn marshal(&self, body_size: usize) -> DbResult<Vec<u8>> {
        let mut w = ByteWriter::with_capacity(body_size);
        match self {
            Page::TableLeaf(p) => p.marshal(&mut w)?,
            Page::TableInternal(p) => p.marshal(&mut w)?,
            Page::TableOverflow(p) => p.marshal(&mut w)?,
            Page::Index(p) => p.marshal(&mut w)?,
            Page::IndexOverflow(p) => p.marshal(&mut w)?,
            Page::Free(p) => p.marshal(&mut w)?,
        }
        w.into_padded_bytes(body_size)
    }

    pub fn unmarshal(buf: &[u8]) -> DbResult<Page> {
        let mut r = ByteReader::new(buf);
        let tag: u8 = r.read()?;
        match tag {
            TAG_TABLE_LEAF => Ok(Page::TableLeaf(TableLeafPage::unmarshal(&mut r)?)),
            TAG_TABLE_INTERNAL => Ok(Page::TableInternal(TableInternalPage::unmarshal(&mut r)?)),
            TAG_TABLE_OVERFLOW => Ok(Page::TableOverflow(TableOverflowPage::unmarshal(&mut r)?)),
            TAG_INDEX => Ok(Page::Index(IndexPage::unmarshal(&mut r)?)),
            TAG_INDEX_OVERFLOW => Ok(Page::IndexOverflow(IndexOverflowPage::unmarshal(&mut r)?)),
            TAG_FREE => Ok(Page::Free(FreePage::unmarshal(&mut r)?)),
            other => Err(DbError::corrupt(format!("unknown page tag {}", other))),
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Page::TableLeaf(_) => "table leaf",
            Page::TableInternal(_) => "table internal",
            Page::TableOverflow(_) => "table overflow",
            Page::Index(_) => "index",
            Page::IndexOverflow(_) => "index overflow",
            Page::Free(_) => "free",
        }
    }

    pub fn as_table_leaf(&self) -> DbResult<&TableLeafPage> {
        match self {
            Page::TableLeaf(p) => Ok(p),
            other => Err(unexpected(other, "table leaf")),
        }
    }

    pub fn as_table_leaf_mut(&mut self) -> DbResult<&mut TableLeafPage> {
        match self {
            Page::TableLeaf(p) => Ok(p),
            other => Err(unexpected(other, "table leaf")),
        }
    }

    pub fn as_table_internal(&self) -> DbResult<&TableInternalPage> {
        match self {
            Page::TableInternal(p) => Ok(p),
            other => Err(unexpected(other, "table internal")),
        }
    }

    pub fn as_table_internal_mut(&mut self) -> DbResult<&mut TableInternalPage> {
        match self {
            Page::TableInternal(p) => Ok(p),
            other => Err(unexpected(other, "table internal")),
        }
    }

    pub fn as_table_overflow(&self) -> DbResult<&TableOverflowPage> {
        match self {
            Page::TableOverflow(p) => Ok(p),
            other => Err(unexpected(other, "table overflow")),
        }
    }

    pub fn as_table_overflow_mut(&mut self) -> DbResult<&mut TableOverflowPage> {
        match self {
            Page::TableOverflow(p) => Ok(p),
            other => Err(unexpected(other, "table overflow")),
        }
    }

    pub fn as_index(&self) -> DbResult<&IndexPage> {
        match self {
            Page::Index(p) => Ok(p),
            other => Err(unexpected(other, "index")),
        }
    }

    pub fn as_index_mut(&mut self) -> DbResult<&mut IndexPage> {
        match self {
            Page::Index(p) => Ok(p),
            other => Err(unexpected(other, "index")),
        }
    }

    pub fn as_index_overflow(&self) -> DbResult<&IndexOverflowPage> {
        match self {
            Page::IndexOverflow(p) => Ok(p),
            other => Err(unexpected(other, "index overflow")),
        }
    }

    pub fn as_index_overflow_mut(&mut self) -> DbResult<&mut IndexOverflowPage> {
        match self {
            Page::IndexOverflow(p) => Ok(p),
            other => Err(unexpected(other, "index overflow")),
        }
    }

    pub fn as_free(&self) -> DbResult<&FreePage> {
        match self {
            Page::Free(p) => Ok(p),
            other => Err(unexpected(other, "free")),
        }
    }

    /// `(is_root, parent)` of a tree node page.
    pub fn node_position(&self) -> DbResult<(bool, crate::types::PageIndex)> {
        match self {
            Page::TableLeaf(p) => Ok((p.is_root, p.parent)),
            Page::TableInternal(p) => Ok((p.is_root, p.parent)),
            Page::Index(p) => Ok((p.is_root, p.parent)),
            other => Err(unexpected(other, "tree node")),
        }
    }

    /// Parent pointer, for kinds that have one.
    pub fn parent(&self) -> Option<crate::types::PageIndex> {
        match self {
            Page::TableLeaf(p) => Some(p.parent),
            Page::TableInternal(p) => Some(p.parent),
            Page::Index(p) => Some(p.parent),
            _ => None,
        }
    }

    pub fn set_parent(&mut self, parent: crate::types::PageIndex) -> DbResult<()> {
        match self {
            Page::TableLeaf(p) => p.parent = parent,
            Page::TableInternal(p) => p.parent = parent,
            Page::Index(p) => p.parent = parent,
            other => {
                return Err(unexpected(other, "page with a parent pointer"));
            }
        }
        Ok(())
    }
}

fn unexpected(page: &Page, wanted: &str) -> DbError {
    DbError::corrupt(format!(
        "expected a {} page, found {}",
        wanted,
        page.kind_name()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::consts::PAGE_SIZE;

    #[test]
    fn test_page_dispatch_round_trip() {
        let pages = [
            Page::TableLeaf(TableLeafPage::new_root()),
            Page::TableInternal(TableInternalPage::new_root(5)),
            Page::TableOverflow(TableOverflowPage::new(bytes::Bytes::from_static(b"xyz"))),
            Page::Index(IndexPage::new_leaf_root()),
            Page::IndexOverflow(IndexOverflowPage::new()),
            Page::Free(FreePage::new(7)),
        ];
        for page in &pages {
            let buf = page.marshal(PAGE_SIZE).unwrap();
            assert_eq!(buf.len(), PAGE_SIZE);
            let back = Page::unmarshal(&buf).unwrap();
            assert_eq!(&back, page);
        }
    }

    #[test]
    fn test_unknown_tag_is_corrupt() {
        let mut buf = vec![0u8; PAGE_SIZE];
        buf[0] = 99;
        assert!(matches!(
            Page::unmarshal(&buf),
            Err(DbError::CorruptFile(_))
        ));
    }

    #[test]
    fn test_variant_accessor_mismatch() {
        let page = Page::Free(FreePage::new(0));
        assert!(page.as_table_leaf().is_err());
        assert!(page.as_index().is_err());
    }
}
