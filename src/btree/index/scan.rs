//! Ordered index scans: whole-index walks, range scans with
//! per-bound inclusivity, and composite prefix scans. Reverse walks
//! climb parent pointers to reach the predecessor leaf, since the leaf
//! chain only links forward.

use std::{cmp::Ordering, sync::Arc};

use crate::{
    btree::{
        index::{key::IndexKey, IndexTree},
        page::{IndexChildSlot, Page},
    },
    error::DbError,
    transaction::Transaction,
    types::{CancelToken, DbResult, PageIndex, RowId, NO_PAGE},
};

/// One end of a key range.
#[derive(Debug, Clone, PartialEq)]
pub struct RangeBound {
    pub key: IndexKey,
    pub inclusive: bool,
}

impl RangeBound {
    pub fn inclusive(key: IndexKey) -> Self {
        Self {
            key,
            inclusive: true,
        }
    }

    pub fn exclusive(key: IndexKey) -> Self {
        Self {
            key,
            inclusive: false,
        }
    }
}

pub struct IndexScanIter<'t> {
    tree: &'t IndexTree,
    tx: &'t Transaction,
    token: CancelToken,
    reverse: bool,
    lower: Option<RangeBound>,
    upper: Option<RangeBound>,
    prefix: Option<IndexKey>,
    /// Current leaf and cursor. Forward: next cell to yield. Reverse:
    /// number of cells not yet yielded (yields `pos - 1`).
    current: Option<(PageIndex, Arc<Page>, usize)>,
    started: bool,
    done: bool,
}

impl IndexTree {
    /// Full in-order walk, ascending or descending.
    pub fn scan_all<'t>(
        &'t self,
        tx: &'t Transaction,
        reverse: bool,
        token: CancelToken,
    ) -> IndexScanIter<'t> {
        IndexScanIter::new(self, tx, None, None, None, reverse, token)
    }

    /// Walk the keys between `lower` and `upper`, each bound optional
    /// and independently inclusive.
    pub fn scan_range<'t>(
        &'t self,
        tx: &'t Transaction,
        lower: Option<RangeBound>,
        upper: Option<RangeBound>,
        reverse: bool,
        token: CancelToken,
    ) -> IndexScanIter<'t> {
        IndexScanIter::new(self, tx, lower, upper, None, reverse, token)
    }

    /// Walk every composite key starting with `prefix`.
    pub fn scan_prefix<'t>(
        &'t self,
        tx: &'t Transaction,
        prefix: IndexKey,
        token: CancelToken,
    ) -> IndexScanIter<'t> {
        IndexScanIter::new(self, tx, None, None, Some(prefix), false, token)
    }

    /// Row ids of every key matching a composite prefix.
    pub fn find_row_ids_by_prefix(
        &self,
        tx: &Transaction,
        prefix: &IndexKey,
    ) -> DbResult<Vec<RowId>> {
        let mut ids = Vec::new();
        for item in self.scan_prefix(tx, prefix.clone(), CancelToken::new()) {
            let (_, mut row_ids) = item?;
            ids.append(&mut row_ids);
        }
        Ok(ids)
    }

    /// Leaf preceding `index` in key order, found through the parents.
    pub(crate) fn prev_leaf(
        &self,
        tx: &Transaction,
        index: PageIndex,
    ) -> DbResult<Option<PageIndex>> {
        let mut child = index;
        loop {
            let page = tx.read_page(child)?;
            let (is_root, parent) = page.node_position()?;
            if is_root {
                return Ok(None);
            }
            let parent_page = tx.read_page(parent)?;
            let node = parent_page.as_index()?.internal()?;
            match node.slot_of(child) {
                Some(IndexChildSlot::Entry(0)) => child = parent,
                Some(IndexChildSlot::Entry(i)) => {
                    let left = node.entries[i - 1].child;
                    return Ok(Some(self.rightmost_leaf_under(tx, left)?));
                }
                Some(IndexChildSlot::Rightmost) => match node.entries.last() {
                    Some(e) => {
                        return Ok(Some(self.rightmost_leaf_under(tx, e.child)?));
                    }
                    None => child = parent,
                },
                None => {
                    return Err(DbError::corrupt(format!(
                        "index page {} not referenced by its parent {}",
                        child, parent
                    )));
                }
            }
        }
    }
}

impl<'t> IndexScanIter<'t> {
    fn new(
        tree: &'t IndexTree,
        tx: &'t Transaction,
        lower: Option<RangeBound>,
        upper: Option<RangeBound>,
        prefix: Option<IndexKey>,
        reverse: bool,
        token: CancelToken,
    ) -> Self {
        Self {
            tree,
            tx,
            token,
            reverse,
            lower,
            upper,
            prefix,
            current: None,
            started: false,
            done: false,
        }
    }

    fn seek(&mut self) -> DbResult<()> {
        if self.reverse {
            let (leaf_index, page) = match &self.upper {
                Some(bound) => {
                    let key = bound.key.clone();
                    let leaf = self.tree.find_leaf(self.tx, |k| key.cmp(k))?;
                    (leaf, self.tx.read_page(leaf)?)
                }
                None => {
                    let leaf = self.tree.rightmost_leaf_under(self.tx, self.tree.root)?;
                    (leaf, self.tx.read_page(leaf)?)
                }
            };
            let leaf = page.as_index()?.leaf()?;
            let end = match &self.upper {
                Some(bound) => leaf.cells.partition_point(|c| {
                    let ord = c.key.cmp(&bound.key);
                    ord == Ordering::Less || (bound.inclusive && ord == Ordering::Equal)
                }),
                None => leaf.cells.len(),
            };
            self.current = Some((leaf_index, Arc::clone(&page), end));
        } else {
            let target = match (&self.lower, &self.prefix) {
                (Some(bound), _) => Some((bound.key.clone(), false)),
                (None, Some(prefix)) => Some((prefix.clone(), true)),
                (None, None) => None,
            };
            let (leaf_index, page, pos) = match target {
                Some((key, by_prefix)) => {
                    let leaf = if by_prefix {
                        self.tree.find_leaf(self.tx, |k| key.compare_prefix(k))?
                    } else {
                        self.tree.find_leaf(self.tx, |k| key.cmp(k))?
                    };
                    let page = self.tx.read_page(leaf)?;
                    let node = page.as_index()?.leaf()?;
                    let mut pos = if by_prefix {
                        node.lower_bound(|k| key.compare_prefix(k))
                    } else {
                        node.lower_bound(|k| key.cmp(k))
                    };
                    if let Some(bound) = &self.lower {
                        if !bound.inclusive {
                            while pos < node.cells.len() && node.cells[pos].key == bound.key {
                                pos += 1;
                            }
                        }
                    }
                    (leaf, Arc::clone(&page), pos)
                }
                None => {
                    let leaf = self.tree.leftmost_leaf(self.tx)?;
                    (leaf, self.tx.read_page(leaf)?, 0)
                }
            };
            self.current = Some((leaf_index, page, pos));
        }
        Ok(())
    }

    fn step(&mut self) -> DbResult<Option<(IndexKey, Vec<RowId>)>> {
        self.token.check()?;
        if !self.started {
            self.started = true;
            self.seek()?;
        }
        loop {
            self.token.check()?;
            let (leaf_index, page, pos) = match &mut self.current {
                Some(state) => state,
                None => return Ok(None),
            };
            let leaf = page.as_index()?.leaf()?;

            if self.reverse {
                if *pos > 0 {
                    let cell = &leaf.cells[*pos - 1];
                    *pos -= 1;
                    if let Some(bound) = &self.lower {
                        match cell.key.cmp(&bound.key) {
                            Ordering::Less => return Ok(None),
                            Ordering::Equal if !bound.inclusive => return Ok(None),
                            _ => {}
                        }
                    }
                    let ids = self.tree.cell_row_ids(self.tx, cell)?;
                    return Ok(Some((cell.key.clone(), ids)));
                }
                let prev = self.tree.prev_leaf(self.tx, *leaf_index)?;
                match prev {
                    Some(prev_index) => {
                        let prev_page = self.tx.read_page(prev_index)?;
                        let len = prev_page.as_index()?.leaf()?.cells.len();
                        self.current = Some((prev_index, prev_page, len));
                    }
                    None => {
                        self.current = None;
                        return Ok(None);
                    }
                }
            } else {
                if *pos < leaf.cells.len() {
                    let cell = &leaf.cells[*pos];
                    *pos += 1;
                    if let Some(bound) = &self.upper {
                        match cell.key.cmp(&bound.key) {
                            Ordering::Greater => return Ok(None),
                            Ordering::Equal if !bound.inclusive => return Ok(None),
                            _ => {}
                        }
                    }
                    if let Some(prefix) = &self.prefix {
                        if prefix.compare_prefix(&cell.key) != Ordering::Equal {
                            return Ok(None);
                        }
                    }
                    let ids = self.tree.cell_row_ids(self.tx, cell)?;
                    return Ok(Some((cell.key.clone(), ids)));
                }
                if leaf.next_leaf == NO_PAGE {
                    self.current = None;
                    return Ok(None);
                }
                let next = leaf.next_leaf;
                let next_page = self.tx.read_page(next)?;
                self.current = Some((next, next_page, 0));
            }
        }
    }
}

impl<'t> Iterator for IndexScanIter<'t> {
    type Item = DbResult<(IndexKey, Vec<RowId>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.step() {
            Ok(Some(item)) => Some(Ok(item)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}
