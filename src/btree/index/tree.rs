//! The index store: a B-Tree over generically typed keys mapping each
//! key to one row id (unique index) or a list of row ids spilling into
//! overflow pages (non-unique index).

use std::cmp::Ordering;

use log::debug;

use crate::{
    btree::{
        consts::MAX_INLINE_ROWIDS,
        index::key::IndexKey,
        page::{
            IndexCell, IndexEntry, IndexInternalNode, IndexLeafNode, IndexNode,
            IndexOverflowPage, IndexPage, Page,
        },
    },
    error::DbError,
    transaction::Transaction,
    types::{DbResult, PageIndex, Pod, RowId, NO_PAGE},
    utils::HandyRwLock,
};

/// Handle onto one index's B-Tree.
pub struct IndexTree {
    pub root: PageIndex,
    pub unique: bool,
}

impl IndexTree {
    pub fn new(root: PageIndex, unique: bool) -> Self {
        Self { root, unique }
    }

    /// Descend to the leaf that may hold the target ordered by `cmp`,
    /// where `cmp` orders the target against a stored key.
    pub(crate) fn find_leaf(
        &self,
        tx: &Transaction,
        cmp: impl Fn(&IndexKey) -> Ordering + Copy,
    ) -> DbResult<PageIndex> {
        let mut index = self.root;
        loop {
            let page = tx.read_page(index)?;
            let node = page.as_index()?;
            match &node.node {
                IndexNode::Leaf(_) => return Ok(index),
                IndexNode::Internal(internal) => index = internal.route(cmp),
            }
        }
    }

    pub(crate) fn leftmost_leaf(&self, tx: &Transaction) -> DbResult<PageIndex> {
        let mut index = self.root;
        loop {
            let page = tx.read_page(index)?;
            match &page.as_index()?.node {
                IndexNode::Leaf(_) => return Ok(index),
                IndexNode::Internal(internal) => {
                    index = internal
                        .entries
                        .first()
                        .map(|e| e.child)
                        .unwrap_or(internal.right_child);
                }
            }
        }
    }

    pub(crate) fn rightmost_leaf_under(
        &self,
        tx: &Transaction,
        start: PageIndex,
    ) -> DbResult<PageIndex> {
        let mut index = start;
        loop {
            let page = tx.read_page(index)?;
            match &page.as_index()?.node {
                IndexNode::Leaf(_) => return Ok(index),
                IndexNode::Internal(internal) => index = internal.right_child,
            }
        }
    }

    /// Greatest key present in the index. Drives autoincrement.
    pub fn seek_last_key(&self, tx: &Transaction) -> DbResult<Option<IndexKey>> {
        let leaf_index = self.rightmost_leaf_under(tx, self.root)?;
        let page = tx.read_page(leaf_index)?;
        Ok(page.as_index()?.leaf()?.max_key().cloned())
    }

    /// Every row id bound to `key`: the inline list followed by the
    /// overflow chain.
    pub fn find_row_ids(&self, tx: &Transaction, key: &IndexKey) -> DbResult<Vec<RowId>> {
        let leaf_index = self.find_leaf(tx, |k| key.cmp(k))?;
        let page = tx.read_page(leaf_index)?;
        let leaf = page.as_index()?.leaf()?;
        match leaf.find(key) {
            Ok(pos) => self.cell_row_ids(tx, &leaf.cells[pos]),
            Err(_) => Ok(Vec::new()),
        }
    }

    pub(crate) fn cell_row_ids(&self, tx: &Transaction, cell: &IndexCell) -> DbResult<Vec<RowId>> {
        let mut ids = cell.row_ids.clone();
        let mut index = cell.overflow;
        while index != NO_PAGE {
            let page = tx.read_page(index)?;
            let overflow = page.as_index_overflow()?;
            ids.extend_from_slice(&overflow.row_ids);
            index = overflow.next_page;
        }
        Ok(ids)
    }

    /// Bind `row_id` to `key`. A unique index rejects a second binding
    /// of the same key with `DuplicateKey`.
    pub fn insert(&self, tx: &Transaction, key: &IndexKey, row_id: RowId) -> DbResult<()> {
        let leaf_index = self.find_leaf(tx, |k| key.cmp(k))?;
        let pod = tx.modify_page(leaf_index)?;
        {
            let mut guard = pod.wl();
            let page = guard.as_index_mut()?;
            let leaf = page.leaf_mut()?;
            match leaf.find(key) {
                Ok(pos) => {
                    if self.unique {
                        return Err(DbError::DuplicateKey(format!("key {}", key)));
                    }
                    let cell = &mut leaf.cells[pos];
                    if cell.row_ids.len() < MAX_INLINE_ROWIDS {
                        cell.row_ids.push(row_id);
                    } else {
                        let overflow = cell.overflow;
                        let cell_pos = pos;
                        drop(guard);
                        return self.append_overflow_row_id(
                            tx, &pod, cell_pos, overflow, row_id,
                        );
                    }
                }
                Err(pos) => {
                    leaf.cells.insert(pos, IndexCell::new(key.clone(), row_id));
                }
            }
            if page.fits() {
                return Ok(());
            }
        }
        debug!("splitting index leaf {} on insert of {}", leaf_index, key);
        self.split_leaf(tx, leaf_index, pod)
    }

    /// Append a row id to a full cell's overflow chain, allocating the
    /// first or a new tail page as needed.
    fn append_overflow_row_id(
        &self,
        tx: &Transaction,
        leaf_pod: &Pod<Page>,
        cell_pos: usize,
        first: PageIndex,
        row_id: RowId,
    ) -> DbResult<()> {
        if first == NO_PAGE {
            let fresh = tx.get_free_page()?;
            let mut page = IndexOverflowPage::new();
            page.row_ids.push(row_id);
            tx.set_page(fresh, Page::IndexOverflow(page))?;
            let mut guard = leaf_pod.wl();
            guard.as_index_mut()?.leaf_mut()?.cells[cell_pos].overflow = fresh;
            return Ok(());
        }

        // walk to the tail
        let mut tail = first;
        loop {
            let page = tx.read_page(tail)?;
            let next = page.as_index_overflow()?.next_page;
            if next == NO_PAGE {
                break;
            }
            tail = next;
        }

        let tail_pod = tx.modify_page(tail)?;
        let mut guard = tail_pod.wl();
        let overflow = guard.as_index_overflow_mut()?;
        if overflow.is_full() {
            drop(guard);
            let fresh = tx.get_free_page()?;
            let mut page = IndexOverflowPage::new();
            page.row_ids.push(row_id);
            tx.set_page(fresh, Page::IndexOverflow(page))?;
            tail_pod.wl().as_index_overflow_mut()?.next_page = fresh;
        } else {
            overflow.row_ids.push(row_id);
        }
        Ok(())
    }

    fn split_leaf(&self, tx: &Transaction, leaf_index: PageIndex, pod: Pod<Page>) -> DbResult<()> {
        let mut guard = pod.wl();
        let page = guard.as_index_mut()?;
        let is_root = page.is_root;
        let parent = page.parent;
        let leaf = page.leaf_mut()?;
        let keep = (leaf.cells.len() + 2) / 2;
        let moved = leaf.cells.split_off(keep);

        if is_root {
            let left_index = tx.get_free_page()?;
            let right_index = tx.get_free_page()?;

            let left_cells = std::mem::take(&mut leaf.cells);
            let separator = left_cells.last().unwrap().key.clone();
            let left = IndexPage {
                is_root: false,
                parent: leaf_index,
                node: IndexNode::Leaf(IndexLeafNode {
                    next_leaf: right_index,
                    cells: left_cells,
                }),
            };
            let right = IndexPage {
                is_root: false,
                parent: leaf_index,
                node: IndexNode::Leaf(IndexLeafNode {
                    next_leaf: NO_PAGE,
                    cells: moved,
                }),
            };
            *guard = Page::Index(IndexPage {
                is_root: true,
                parent: NO_PAGE,
                node: IndexNode::Internal(IndexInternalNode {
                    right_child: right_index,
                    entries: vec![IndexEntry {
                        key: separator,
                        child: left_index,
                    }],
                }),
            });
            drop(guard);

            tx.set_page(left_index, Page::Index(left))?;
            tx.set_page(right_index, Page::Index(right))?;
            return Ok(());
        }

        let right_index = tx.get_free_page()?;
        let right = IndexPage {
            is_root: false,
            parent,
            node: IndexNode::Leaf(IndexLeafNode {
                next_leaf: leaf.next_leaf,
                cells: moved,
            }),
        };
        leaf.next_leaf = right_index;
        let separator = leaf.cells.last().unwrap().key.clone();
        drop(guard);

        tx.set_page(right_index, Page::Index(right))?;
        self.insert_into_parent(tx, parent, separator, leaf_index, right_index)
    }

    fn insert_into_parent(
        &self,
        tx: &Transaction,
        parent_index: PageIndex,
        separator: IndexKey,
        left: PageIndex,
        right: PageIndex,
    ) -> DbResult<()> {
        use crate::btree::page::IndexChildSlot;

        let pod = tx.modify_page(parent_index)?;
        {
            let mut guard = pod.wl();
            let node = guard.as_index_mut()?;
            let internal = node.internal_mut()?;
            match internal.slot_of(left) {
                Some(IndexChildSlot::Entry(i)) => {
                    internal.entries[i].child = right;
                    internal.entries.insert(
                        i,
                        IndexEntry {
                            key: separator,
                            child: left,
                        },
                    );
                }
                Some(IndexChildSlot::Rightmost) => {
                    internal.right_child = right;
                    internal.entries.push(IndexEntry {
                        key: separator,
                        child: left,
                    });
                }
                None => {
                    return Err(DbError::corrupt(format!(
                        "page {} not referenced by its parent {}",
                        left, parent_index
                    )));
                }
            }
            if node.fits() {
                return Ok(());
            }
        }
        debug!("splitting index internal {}", parent_index);
        self.split_internal(tx, parent_index, pod)
    }

    fn split_internal(
        &self,
        tx: &Transaction,
        node_index: PageIndex,
        pod: Pod<Page>,
    ) -> DbResult<()> {
        let mut guard = pod.wl();
        let page = guard.as_index_mut()?;
        let is_root = page.is_root;
        let parent = page.parent;
        let internal = page.internal_mut()?;
        let keep = (internal.entries.len() + 2) / 2;
        let moved = internal.entries.split_off(keep);
        let pivot = internal.entries.pop().unwrap();

        if is_root {
            let left_index = tx.get_free_page()?;
            let right_index = tx.get_free_page()?;

            let left = IndexPage {
                is_root: false,
                parent: node_index,
                node: IndexNode::Internal(IndexInternalNode {
                    right_child: pivot.child,
                    entries: std::mem::take(&mut internal.entries),
                }),
            };
            let right = IndexPage {
                is_root: false,
                parent: node_index,
                node: IndexNode::Internal(IndexInternalNode {
                    right_child: internal.right_child,
                    entries: moved,
                }),
            };
            internal.entries = vec![IndexEntry {
                key: pivot.key,
                child: left_index,
            }];
            internal.right_child = right_index;
            drop(guard);

            let left_children: Vec<PageIndex> = left.internal()?.children().collect();
            let right_children: Vec<PageIndex> = right.internal()?.children().collect();
            tx.set_page(left_index, Page::Index(left))?;
            tx.set_page(right_index, Page::Index(right))?;
            for child in left_children {
                self.set_parent(tx, child, left_index)?;
            }
            for child in right_children {
                self.set_parent(tx, child, right_index)?;
            }
            return Ok(());
        }

        let right_index = tx.get_free_page()?;
        let right = IndexPage {
            is_root: false,
            parent,
            node: IndexNode::Internal(IndexInternalNode {
                right_child: internal.right_child,
                entries: moved,
            }),
        };
        internal.right_child = pivot.child;
        drop(guard);

        let right_children: Vec<PageIndex> = right.internal()?.children().collect();
        tx.set_page(right_index, Page::Index(right))?;
        for child in right_children {
            self.set_parent(tx, child, right_index)?;
        }
        self.insert_into_parent(tx, parent, pivot.key, node_index, right_index)
    }

    pub(crate) fn set_parent(
        &self,
        tx: &Transaction,
        child: PageIndex,
        parent: PageIndex,
    ) -> DbResult<()> {
        let pod = tx.modify_page(child)?;
        let result = pod.wl().set_parent(parent);
        result
    }

    /// Rewrite the separator for `child` after its subtree maximum
    /// changed.
    pub(crate) fn update_separators(
        &self,
        tx: &Transaction,
        child: PageIndex,
        new_max: &IndexKey,
    ) -> DbResult<()> {
        use crate::btree::page::IndexChildSlot;

        let mut child = child;
        loop {
            let page = tx.read_page(child)?;
            let (is_root, parent) = page.node_position()?;
            if is_root {
                return Ok(());
            }
            let pod = tx.modify_page(parent)?;
            let mut guard = pod.wl();
            let internal = guard.as_index_mut()?.internal_mut()?;
            match internal.slot_of(child) {
                Some(IndexChildSlot::Entry(i)) => {
                    internal.entries[i].key = new_max.clone();
                    return Ok(());
                }
                Some(IndexChildSlot::Rightmost) => {
                    drop(guard);
                    child = parent;
                }
                None => {
                    return Err(DbError::corrupt(format!(
                        "page {} not referenced by its parent {}",
                        child, parent
                    )));
                }
            }
        }
    }

    /// Free every page of the index: overflow chains, leaves, internal
    /// nodes and (unless kept as an empty root) the root itself.
    pub fn free_all_pages(&self, tx: &Transaction, keep_root: bool) -> DbResult<()> {
        self.free_subtree(tx, self.root, keep_root)
    }

    fn free_subtree(&self, tx: &Transaction, index: PageIndex, keep: bool) -> DbResult<()> {
        let page = tx.read_page(index)?;
        match &page.as_index()?.node {
            IndexNode::Leaf(leaf) => {
                for cell in &leaf.cells {
                    let mut overflow = cell.overflow;
                    while overflow != NO_PAGE {
                        let next = tx.read_page(overflow)?.as_index_overflow()?.next_page;
                        tx.add_free_page(overflow)?;
                        overflow = next;
                    }
                }
            }
            IndexNode::Internal(internal) => {
                let children: Vec<PageIndex> = internal.children().collect();
                for child in children {
                    self.free_subtree(tx, child, false)?;
                }
            }
        }
        if keep {
            tx.set_page(index, Page::Index(IndexPage::new_leaf_root()))?;
        } else {
            tx.add_free_page(index)?;
        }
        Ok(())
    }

    /// Structural invariants walker, mirroring the table tree's.
    /// Returns the number of distinct keys.
    pub fn check_integrity(&self, tx: &Transaction) -> DbResult<usize> {
        let root_page = tx.read_page(self.root)?;
        let (is_root, _) = root_page.node_position()?;
        if !is_root {
            return Err(DbError::corrupt("index root does not carry the root flag"));
        }
        let mut leaves = Vec::new();
        self.verify_subtree(tx, self.root, None, None, &mut leaves)?;

        let mut keys = 0usize;
        let mut chained = Vec::new();
        let mut index = self.leftmost_leaf(tx)?;
        let mut last: Option<IndexKey> = None;
        loop {
            let page = tx.read_page(index)?;
            let leaf = page.as_index()?.leaf()?;
            chained.push(index);
            for cell in &leaf.cells {
                if let Some(prev) = &last {
                    if prev >= &cell.key {
                        return Err(DbError::corrupt("index leaf chain out of order"));
                    }
                }
                last = Some(cell.key.clone());
                keys += 1;
            }
            if leaf.next_leaf == NO_PAGE {
                break;
            }
            index = leaf.next_leaf;
        }
        if chained != leaves {
            return Err(DbError::corrupt(
                "index leaf chain does not match tree leaves",
            ));
        }
        Ok(keys)
    }

    fn verify_subtree(
        &self,
        tx: &Transaction,
        index: PageIndex,
        expected_parent: Option<PageIndex>,
        upper: Option<&IndexKey>,
        leaves: &mut Vec<PageIndex>,
    ) -> DbResult<Option<IndexKey>> {
        let page = tx.read_page(index)?;
        let node = page.as_index()?;
        if let Some(expected) = expected_parent {
            if node.parent != expected {
                return Err(DbError::corrupt(format!(
                    "index page {} points at parent {}, expected {}",
                    index, node.parent, expected
                )));
            }
        }
        match &node.node {
            IndexNode::Leaf(leaf) => {
                for pair in leaf.cells.windows(2) {
                    if pair[0].key >= pair[1].key {
                        return Err(DbError::corrupt(format!(
                            "index leaf {} cells out of order",
                            index
                        )));
                    }
                }
                if let (Some(upper), Some(max)) = (upper, leaf.max_key()) {
                    if max > upper {
                        return Err(DbError::corrupt(format!(
                            "index leaf {} exceeds its separator",
                            index
                        )));
                    }
                }
                leaves.push(index);
                Ok(leaf.max_key().cloned())
            }
            IndexNode::Internal(internal) => {
                for pair in internal.entries.windows(2) {
                    if pair[0].key >= pair[1].key {
                        return Err(DbError::corrupt(format!(
                            "index internal {} separators out of order",
                            index
                        )));
                    }
                }
                let mut subtree_max = None;
                for entry in &internal.entries {
                    let child_max = self.verify_subtree(
                        tx,
                        entry.child,
                        Some(index),
                        Some(&entry.key),
                        leaves,
                    )?;
                    if child_max.as_ref() != Some(&entry.key) {
                        return Err(DbError::corrupt(format!(
                            "index separator {} of page {} does not equal child max",
                            entry.key, index
                        )));
                    }
                    subtree_max = child_max;
                }
                let right_max =
                    self.verify_subtree(tx, internal.right_child, Some(index), upper, leaves)?;
                if right_max.is_some() {
                    subtree_max = right_max;
                }
                Ok(subtree_max)
            }
        }
    }
}
