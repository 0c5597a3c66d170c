use bytes::Bytes;

use crate::{
    btree::consts::{DB_HEADER_SIZE, PAGE_SIZE, TAG_TABLE_LEAF},
    error::DbError,
    io::{ByteReader, ByteWriter},
    types::{DbResult, PageIndex, RowId, NO_PAGE},
};

/// Fixed bytes per leaf page: tag, is_root, parent, cells_count,
/// next_leaf.
pub const LEAF_HEADER_SIZE: usize = 12;

/// Fixed bytes per cell on top of its payload: null mask, key, length.
pub const LEAF_CELL_OVERHEAD: usize = 20;

/// One row as stored in a leaf. The payload is shared (`Bytes`) between
/// the cached page and any transactional clone until a writer replaces
/// it wholesale.
#[derive(Debug, Clone, PartialEq)]
pub struct LeafCell {
    pub null_mask: u64,
    pub key: RowId,
    pub value: Bytes,
}

impl LeafCell {
    pub fn size(&self) -> usize {
        LEAF_CELL_OVERHEAD + self.value.len()
    }
}

/// A table B+Tree leaf: cells sorted by row id plus the link to the next
/// leaf in key order.
#[derive(Debug, Clone, PartialEq)]
pub struct TableLeafPage {
    pub is_root: bool,
    pub parent: PageIndex,
    pub next_leaf: PageIndex,
    pub cells: Vec<LeafCell>,
}

impl TableLeafPage {
    pub fn new_root() -> Self {
        Self {
            is_root: true,
            parent: NO_PAGE,
            next_leaf: NO_PAGE,
            cells: Vec::new(),
        }
    }

    pub fn new_child(parent: PageIndex) -> Self {
        Self {
            is_root: false,
            parent,
            next_leaf: NO_PAGE,
            cells: Vec::new(),
        }
    }

    pub fn used_bytes(&self) -> usize {
        LEAF_HEADER_SIZE + self.cells.iter().map(|c| c.size()).sum::<usize>()
    }

    pub fn capacity(&self) -> usize {
        if self.is_root {
            PAGE_SIZE - DB_HEADER_SIZE
        } else {
            PAGE_SIZE
        }
    }

    pub fn fits(&self) -> bool {
        self.used_bytes() <= self.capacity()
    }

    /// A non-root leaf below half occupancy wants rebalancing.
    pub fn is_underfull(&self) -> bool {
        !self.is_root && self.used_bytes() < self.capacity() / 2
    }

    /// Bytes this page could give away while staying at least half full.
    pub fn surplus_bytes(&self) -> usize {
        self.used_bytes().saturating_sub(self.capacity() / 2)
    }

    /// Binary search for `key`: `Ok(pos)` when present, `Err(pos)` with
    /// the insertion point otherwise.
    pub fn find(&self, key: RowId) -> Result<usize, usize> {
        self.cells.binary_search_by(|c| c.key.cmp(&key))
    }

    pub fn max_key(&self) -> Option<RowId> {
        self.cells.last().map(|c| c.key)
    }

    pub fn marshal(&self, w: &mut ByteWriter) -> DbResult<()> {
        w.write(&TAG_TABLE_LEAF);
        w.write(&self.is_root);
        w.write(&self.parent);
        w.write(&(self.cells.len() as u16));
        w.write(&self.next_leaf);
        for cell in &self.cells {
            w.write(&cell.null_mask);
            w.write(&cell.key);
            w.write(&(cell.value.len() as u32));
            w.write_bytes(&cell.value);
        }
        Ok(())
    }

    pub fn unmarshal(r: &mut ByteReader<'_>) -> DbResult<Self> {
        let is_root: bool = r.read()?;
        let parent: PageIndex = r.read()?;
        let cells_count: u16 = r.read()?;
        let next_leaf: PageIndex = r.read()?;
        let mut cells = Vec::with_capacity(cells_count as usize);
        let mut last_key: Option<RowId> = None;
        for _ in 0..cells_count {
            let null_mask: u64 = r.read()?;
            let key: RowId = r.read()?;
            let len: u32 = r.read()?;
            let value = Bytes::copy_from_slice(r.read_bytes(len as usize)?);
            if let Some(last) = last_key {
                if key <= last {
                    return Err(DbError::corrupt(format!(
                        "leaf cells out of order: {} after {}",
                        key, last
                    )));
                }
            }
            last_key = Some(key);
            cells.push(LeafCell {
                null_mask,
                key,
                value,
            });
        }
        Ok(Self {
            is_root,
            parent,
            next_leaf,
            cells,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cell(key: RowId, len: usize) -> LeafCell {
        LeafCell {
            null_mask: 0,
            key,
            value: Bytes::from(vec![0xab; len]),
        }
    }

    #[test]
    fn test_leaf_marshal_round_trip() {
        let mut page = TableLeafPage::new_child(3);
        page.next_leaf = 9;
        page.cells = vec![cell(1, 10), cell(5, 0), cell(9, 33)];

        let mut w = ByteWriter::new();
        page.marshal(&mut w).unwrap();
        let buf = w.into_padded_bytes(PAGE_SIZE).unwrap();
        let mut r = ByteReader::new(&buf[1..]);
        let back = TableLeafPage::unmarshal(&mut r).unwrap();
        assert_eq!(back, page);
    }

    #[test]
    fn test_leaf_rejects_out_of_order_cells() {
        let mut page = TableLeafPage::new_root();
        page.cells = vec![cell(5, 1), cell(2, 1)];
        let mut w = ByteWriter::new();
        page.marshal(&mut w).unwrap();
        let buf = w.into_bytes();
        let mut r = ByteReader::new(&buf[1..]);
        assert!(TableLeafPage::unmarshal(&mut r).is_err());
    }

    #[test]
    fn test_leaf_occupancy_accounting() {
        let mut page = TableLeafPage::new_child(1);
        assert_eq!(page.used_bytes(), LEAF_HEADER_SIZE);
        page.cells.push(cell(1, 100));
        assert_eq!(page.used_bytes(), LEAF_HEADER_SIZE + LEAF_CELL_OVERHEAD + 100);
        assert!(page.fits());
    }

    #[test]
    fn test_root_leaf_reserves_header_space() {
        let root = TableLeafPage::new_root();
        let child = TableLeafPage::new_child(0);
        assert_eq!(root.capacity() + DB_HEADER_SIZE, child.capacity());
    }

    #[test]
    fn test_find_insertion_point() {
        let mut page = TableLeafPage::new_root();
        page.cells = vec![cell(2, 1), cell(4, 1), cell(8, 1)];
        assert_eq!(page.find(4), Ok(1));
        assert_eq!(page.find(5), Err(2));
        assert_eq!(page.find(9), Err(3));
    }
}
