use crate::{
    btree::consts::{DB_HEADER_SIZE, PAGE_SIZE, TAG_TABLE_INTERNAL},
    error::DbError,
    io::{ByteReader, ByteWriter},
    types::{DbResult, PageIndex, RowId, NO_PAGE},
};

/// Fixed bytes per internal page: tag, is_root, parent, keys_count,
/// right_child.
pub const INTERNAL_HEADER_SIZE: usize = 12;

/// Bytes per routing entry: separator key + child pointer.
pub const INTERNAL_ENTRY_SIZE: usize = 12;

/// A routing entry. The separator equals the maximum key in the child's
/// subtree; keys greater than it route to the next entry or to
/// `right_child`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InternalEntry {
    pub key: RowId,
    pub child: PageIndex,
}

/// Which slot of an internal node points at a given child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildSlot {
    Entry(usize),
    Rightmost,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TableInternalPage {
    pub is_root: bool,
    pub parent: PageIndex,
    pub right_child: PageIndex,
    pub entries: Vec<InternalEntry>,
}

impl TableInternalPage {
    pub fn new_root(right_child: PageIndex) -> Self {
        Self {
            is_root: true,
            parent: NO_PAGE,
            right_child,
            entries: Vec::new(),
        }
    }

    pub fn new_child(parent: PageIndex, right_child: PageIndex) -> Self {
        Self {
            is_root: false,
            parent,
            right_child,
            entries: Vec::new(),
        }
    }

    pub fn used_bytes(&self) -> usize {
        INTERNAL_HEADER_SIZE + self.entries.len() * INTERNAL_ENTRY_SIZE
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

    pub fn is_underfull(&self) -> bool {
        !self.is_root && self.used_bytes() < self.capacity() / 2
    }

    pub fn surplus_entries(&self) -> usize {
        let half = self.capacity() / 2 / INTERNAL_ENTRY_SIZE;
        self.entries.len().saturating_sub(half)
    }

    /// Route a key to the child whose subtree may contain it.
    pub fn child_for(&self, key: RowId) -> PageIndex {
        match self.entries.binary_search_by(|e| e.key.cmp(&key)) {
            Ok(pos) => self.entries[pos].child,
            Err(pos) => {
                if pos < self.entries.len() {
                    self.entries[pos].child
                } else {
                    self.right_child
                }
            }
        }
    }

    /// Locate the slot pointing at `child`.
    pub fn slot_of(&self, child: PageIndex) -> Option<ChildSlot> {
        if self.right_child == child {
            return Some(ChildSlot::Rightmost);
        }
        self.entries
            .iter()
            .position(|e| e.child == child)
            .map(ChildSlot::Entry)
    }

    /// All children left to right: every entry child, then the rightmost.
    pub fn children(&self) -> impl Iterator<Item = PageIndex> + '_ {
        self.entries
            .iter()
            .map(|e| e.child)
            .chain(std::iter::once(self.right_child))
    }

    pub fn marshal(&self, w: &mut ByteWriter) -> DbResult<()> {
        w.write(&TAG_TABLE_INTERNAL);
        w.write(&self.is_root);
        w.write(&self.parent);
        w.write(&(self.entries.len() as u16));
        w.write(&self.right_child);
        for e in &self.entries {
            w.write(&e.key);
            w.write(&e.child);
        }
        Ok(())
    }

    pub fn unmarshal(r: &mut ByteReader<'_>) -> DbResult<Self> {
        let is_root: bool = r.read()?;
        let parent: PageIndex = r.read()?;
        let keys_count: u16 = r.read()?;
        let right_child: PageIndex = r.read()?;
        let mut entries = Vec::with_capacity(keys_count as usize);
        let mut last_key: Option<RowId> = None;
        for _ in 0..keys_count {
            let key: RowId = r.read()?;
            let child: PageIndex = r.read()?;
            if let Some(last) = last_key {
                if key <= last {
                    return Err(DbError::corrupt(format!(
                        "internal entries out of order: {} after {}",
                        key, last
                    )));
                }
            }
            last_key = Some(key);
            entries.push(InternalEntry { key, child });
        }
        Ok(Self {
            is_root,
            parent,
            right_child,
            entries,
        })
    }
}
