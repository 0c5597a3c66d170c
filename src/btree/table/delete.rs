//! Deletion and rebalancing.
//!
//! Removing a cell may leave a leaf under half occupancy. The leaf then
//! borrows from its left sibling, then its right, whenever the donor
//! can spare cells without dropping under half itself; otherwise the
//! two pages merge and the parent loses an entry, which can cascade the
//! same treatment up the tree. An internal root left with a single
//! child is collapsed: the child's content moves into the root page.

use log::debug;

use crate::{
    btree::{
        page::{
            ChildSlot, InternalEntry, Page, TableInternalPage, TableLeafPage,
            INTERNAL_ENTRY_SIZE, INTERNAL_HEADER_SIZE, LEAF_HEADER_SIZE,
        },
        consts::PAGE_SIZE,
        table::{overflow, TableTree},
    },
    error::DbError,
    storage::tuple::{unmarshal_columns, ColumnBytes},
    transaction::Transaction,
    types::{DbResult, PageIndex, RowId},
    utils::HandyRwLock,
};

struct Siblings {
    parent: PageIndex,
    left: Option<PageIndex>,
    right: Option<PageIndex>,
}

impl<'a> TableTree<'a> {
    /// Delete a row and free its overflow chains. Deleting an absent
    /// row id reports `NotFound` and leaves the tree untouched.
    pub fn delete_row(&self, tx: &Transaction, id: RowId) -> DbResult<()> {
        self.remove_cell(tx, id, true)
    }

    pub(crate) fn remove_cell(
        &self,
        tx: &Transaction,
        id: RowId,
        free_overflow: bool,
    ) -> DbResult<()> {
        let leaf_index = self.find_leaf(tx, id)?;

        // probe before touching anything so a miss has no side effects
        {
            let page = tx.read_page(leaf_index)?;
            let leaf = page.as_table_leaf()?;
            let pos = match leaf.find(id) {
                Ok(pos) => pos,
                Err(_) => return Err(DbError::not_found(format!("row {}", id))),
            };
            if free_overflow {
                let cell = &leaf.cells[pos];
                let cols = unmarshal_columns(self.schema, cell.null_mask, &cell.value)?;
                for col in cols {
                    if let ColumnBytes::BigText { first_page, .. } = col {
                        overflow::free_chain(tx, first_page)?;
                    }
                }
            }
        }

        let pod = tx.modify_page(leaf_index)?;
        let (was_max, new_max, underfull, is_root) = {
            let mut guard = pod.wl();
            let leaf = guard.as_table_leaf_mut()?;
            let pos = leaf
                .find(id)
                .map_err(|_| DbError::not_found(format!("row {}", id)))?;
            leaf.cells.remove(pos);
            (
                pos == leaf.cells.len(),
                leaf.max_key(),
                leaf.is_underfull(),
                leaf.is_root,
            )
        };

        if is_root {
            return Ok(());
        }
        if was_max {
            if let Some(max) = new_max {
                self.update_separators(tx, leaf_index, max)?;
            }
        }
        if underfull {
            self.rebalance_leaf(tx, leaf_index)?;
        }
        Ok(())
    }

    fn siblings(&self, tx: &Transaction, index: PageIndex) -> DbResult<Siblings> {
        let page = tx.read_page(index)?;
        let (_, parent) = page.node_position()?;
        let parent_page = tx.read_page(parent)?;
        let node = parent_page.as_table_internal()?;
        match node.slot_of(index) {
            Some(ChildSlot::Entry(i)) => Ok(Siblings {
                parent,
                left: (i > 0).then(|| node.entries[i - 1].child),
                right: Some(if i + 1 < node.entries.len() {
                    node.entries[i + 1].child
                } else {
                    node.right_child
                }),
            }),
            Some(ChildSlot::Rightmost) => Ok(Siblings {
                parent,
                left: node.entries.last().map(|e| e.child),
                right: None,
            }),
            None => Err(DbError::corrupt(format!(
                "page {} not referenced by its parent {}",
                index, parent
            ))),
        }
    }

    fn leaf_used(&self, tx: &Transaction, index: PageIndex) -> DbResult<usize> {
        Ok(tx.read_page(index)?.as_table_leaf()?.used_bytes())
    }

    fn rebalance_leaf(&self, tx: &Transaction, index: PageIndex) -> DbResult<()> {
        let siblings = self.siblings(tx, index)?;
        let used = self.leaf_used(tx, index)?;

        // borrow when a merged page would not fit, which guarantees the
        // donor keeps at least half a page
        if let Some(left) = siblings.left {
            if self.leaf_used(tx, left)? + used - LEAF_HEADER_SIZE > PAGE_SIZE {
                return self.borrow_from_left_leaf(tx, left, index);
            }
        }
        if let Some(right) = siblings.right {
            if self.leaf_used(tx, right)? + used - LEAF_HEADER_SIZE > PAGE_SIZE {
                return self.borrow_from_right_leaf(tx, index, right);
            }
        }
        if let Some(left) = siblings.left {
            debug!("merging leaf {} into {}", index, left);
            return self.merge_leaves(tx, siblings.parent, left, index);
        }
        if let Some(right) = siblings.right {
            debug!("merging leaf {} into {}", right, index);
            return self.merge_leaves(tx, siblings.parent, index, right);
        }
        Ok(())
    }

    fn borrow_from_left_leaf(
        &self,
        tx: &Transaction,
        donor_index: PageIndex,
        target_index: PageIndex,
    ) -> DbResult<()> {
        let donor_pod = tx.modify_page(donor_index)?;
        let target_pod = tx.modify_page(target_index)?;
        let donor_max = {
            let mut donor_guard = donor_pod.wl();
            let mut target_guard = target_pod.wl();
            let donor = donor_guard.as_table_leaf_mut()?;
            let target = target_guard.as_table_leaf_mut()?;
            while target.is_underfull() {
                let size = donor.cells.last().map(|c| c.size()).unwrap_or(0);
                if donor.used_bytes() - size < donor.capacity() / 2 {
                    break;
                }
                let cell = donor.cells.pop().unwrap();
                target.cells.insert(0, cell);
            }
            donor.max_key().ok_or_else(|| {
                DbError::corrupt(format!("leaf {} drained by redistribution", donor_index))
            })?
        };
        // the donor's subtree maximum shrank
        self.update_separators(tx, donor_index, donor_max)
    }

    fn borrow_from_right_leaf(
        &self,
        tx: &Transaction,
        target_index: PageIndex,
        donor_index: PageIndex,
    ) -> DbResult<()> {
        let target_pod = tx.modify_page(target_index)?;
        let donor_pod = tx.modify_page(donor_index)?;
        let target_max = {
            let mut target_guard = target_pod.wl();
            let mut donor_guard = donor_pod.wl();
            let target = target_guard.as_table_leaf_mut()?;
            let donor = donor_guard.as_table_leaf_mut()?;
            while target.is_underfull() {
                let size = donor.cells.first().map(|c| c.size()).unwrap_or(0);
                if donor.used_bytes() - size < donor.capacity() / 2 {
                    break;
                }
                let cell = donor.cells.remove(0);
                target.cells.push(cell);
            }
            target.max_key().ok_or_else(|| {
                DbError::corrupt(format!("leaf {} empty after redistribution", target_index))
            })?
        };
        // the target's subtree maximum grew
        self.update_separators(tx, target_index, target_max)
    }

    /// `left` absorbs `right`; `right` is freed and the parent loses
    /// one entry.
    fn merge_leaves(
        &self,
        tx: &Transaction,
        parent: PageIndex,
        left: PageIndex,
        right: PageIndex,
    ) -> DbResult<()> {
        let (right_cells, right_next) = {
            let page = tx.read_page(right)?;
            let leaf = page.as_table_leaf()?;
            (leaf.cells.clone(), leaf.next_leaf)
        };
        {
            let pod = tx.modify_page(left)?;
            let mut guard = pod.wl();
            let leaf = guard.as_table_leaf_mut()?;
            leaf.cells.extend(right_cells);
            leaf.next_leaf = right_next;
        }
        tx.add_free_page(right)?;
        self.drop_merged_child(tx, parent, left, right)
    }

    /// Parent bookkeeping shared by leaf and internal merges: the slot
    /// that pointed at `right` now points at `left` (its separator
    /// already equals the merged maximum) and `left`'s own entry
    /// disappears.
    fn drop_merged_child(
        &self,
        tx: &Transaction,
        parent: PageIndex,
        left: PageIndex,
        right: PageIndex,
    ) -> DbResult<()> {
        let pod = tx.modify_page(parent)?;
        let (is_root, empty, underfull) = {
            let mut guard = pod.wl();
            let node = guard.as_table_internal_mut()?;
            let left_pos = node
                .entries
                .iter()
                .position(|e| e.child == left)
                .ok_or_else(|| {
                    DbError::corrupt(format!(
                        "merged page {} has no entry in parent {}",
                        left, parent
                    ))
                })?;
            match node.slot_of(right) {
                Some(ChildSlot::Entry(j)) => {
                    node.entries[j].child = left;
                }
                Some(ChildSlot::Rightmost) => {
                    node.right_child = left;
                }
                None => {
                    return Err(DbError::corrupt(format!(
                        "merged page {} has no slot in parent {}",
                        right, parent
                    )));
                }
            }
            node.entries.remove(left_pos);
            (node.is_root, node.entries.is_empty(), node.is_underfull())
        };

        if is_root && empty {
            return self.collapse_root(tx, parent);
        }
        if underfull {
            return self.rebalance_internal(tx, parent);
        }
        Ok(())
    }

    /// An internal root with no separators routes everything to one
    /// child: promote that child into the root page and free it.
    fn collapse_root(&self, tx: &Transaction, root_index: PageIndex) -> DbResult<()> {
        let pod = tx.modify_page(root_index)?;
        let child_index = pod.rl().as_table_internal()?.right_child;
        let child_page = tx.read_page(child_index)?;
        debug!("promoting page {} into root {}", child_index, root_index);
        match &*child_page {
            Page::TableLeaf(leaf) => {
                let mut promoted = TableLeafPage::new_root();
                promoted.cells = leaf.cells.clone();
                promoted.next_leaf = leaf.next_leaf;
                *pod.wl() = Page::TableLeaf(promoted);
            }
            Page::TableInternal(node) => {
                let mut promoted = TableInternalPage::new_root(node.right_child);
                promoted.entries = node.entries.clone();
                let children: Vec<PageIndex> = promoted.children().collect();
                *pod.wl() = Page::TableInternal(promoted);
                for child in children {
                    self.set_parent(tx, child, root_index)?;
                }
            }
            other => {
                return Err(DbError::corrupt(format!(
                    "page {} is a {} inside a table tree",
                    child_index,
                    other.kind_name()
                )));
            }
        }
        tx.add_free_page(child_index)
    }

    fn internal_used(&self, tx: &Transaction, index: PageIndex) -> DbResult<usize> {
        Ok(tx.read_page(index)?.as_table_internal()?.used_bytes())
    }

    /// Separator key the parent holds for `child`, together with its
    /// entry position. `None` when the child is the rightmost.
    fn parent_separator(
        node: &TableInternalPage,
        child: PageIndex,
    ) -> DbResult<Option<(usize, RowId)>> {
        match node.slot_of(child) {
            Some(ChildSlot::Entry(i)) => Ok(Some((i, node.entries[i].key))),
            Some(ChildSlot::Rightmost) => Ok(None),
            None => Err(DbError::corrupt(format!(
                "page {} not referenced by its parent",
                child
            ))),
        }
    }

    fn rebalance_internal(&self, tx: &Transaction, index: PageIndex) -> DbResult<()> {
        let siblings = self.siblings(tx, index)?;
        let used = self.internal_used(tx, index)?;

        // a merge pulls the separator down as an extra entry
        if let Some(left) = siblings.left {
            if self.internal_used(tx, left)? + used - INTERNAL_HEADER_SIZE + INTERNAL_ENTRY_SIZE
                > PAGE_SIZE
            {
                return self.borrow_from_left_internal(tx, siblings.parent, left, index);
            }
        }
        if let Some(right) = siblings.right {
            if self.internal_used(tx, right)? + used - INTERNAL_HEADER_SIZE + INTERNAL_ENTRY_SIZE
                > PAGE_SIZE
            {
                return self.borrow_from_right_internal(tx, siblings.parent, index, right);
            }
        }
        if let Some(left) = siblings.left {
            debug!("merging internal {} into {}", index, left);
            return self.merge_internals(tx, siblings.parent, left, index);
        }
        if let Some(right) = siblings.right {
            debug!("merging internal {} into {}", right, index);
            return self.merge_internals(tx, siblings.parent, index, right);
        }
        Ok(())
    }

    /// Rotate children from the left sibling through the parent
    /// separator until the target is at least half full.
    fn borrow_from_left_internal(
        &self,
        tx: &Transaction,
        parent: PageIndex,
        donor_index: PageIndex,
        target_index: PageIndex,
    ) -> DbResult<()> {
        let parent_pod = tx.modify_page(parent)?;
        let donor_pod = tx.modify_page(donor_index)?;
        let target_pod = tx.modify_page(target_index)?;

        let mut moved_children = Vec::new();
        {
            let mut parent_guard = parent_pod.wl();
            let parent_node = parent_guard.as_table_internal_mut()?;
            let (slot, mut separator) = Self::parent_separator(parent_node, donor_index)?
                .ok_or_else(|| DbError::corrupt("left sibling cannot be the rightmost child"))?;

            let mut donor_guard = donor_pod.wl();
            let mut target_guard = target_pod.wl();
            let donor = donor_guard.as_table_internal_mut()?;
            let target = target_guard.as_table_internal_mut()?;

            while target.is_underfull() {
                if donor.used_bytes() - INTERNAL_ENTRY_SIZE < donor.capacity() / 2 {
                    break;
                }
                let rotated = donor.right_child;
                target.entries.insert(
                    0,
                    InternalEntry {
                        key: separator,
                        child: rotated,
                    },
                );
                moved_children.push(rotated);
                let e = donor.entries.pop().ok_or_else(|| {
                    DbError::corrupt(format!("internal {} drained by rotation", donor_index))
                })?;
                donor.right_child = e.child;
                separator = e.key;
            }
            parent_node.entries[slot].key = separator;
        }
        for child in moved_children {
            self.set_parent(tx, child, target_index)?;
        }
        Ok(())
    }

    fn borrow_from_right_internal(
        &self,
        tx: &Transaction,
        parent: PageIndex,
        target_index: PageIndex,
        donor_index: PageIndex,
    ) -> DbResult<()> {
        let parent_pod = tx.modify_page(parent)?;
        let target_pod = tx.modify_page(target_index)?;
        let donor_pod = tx.modify_page(donor_index)?;

        let mut moved_children = Vec::new();
        {
            let mut parent_guard = parent_pod.wl();
            let parent_node = parent_guard.as_table_internal_mut()?;
            let (slot, mut separator) = Self::parent_separator(parent_node, target_index)?
                .ok_or_else(|| {
                    DbError::corrupt("a page with a right sibling cannot be the rightmost child")
                })?;

            let mut target_guard = target_pod.wl();
            let mut donor_guard = donor_pod.wl();
            let target = target_guard.as_table_internal_mut()?;
            let donor = donor_guard.as_table_internal_mut()?;

            while target.is_underfull() {
                if donor.used_bytes() - INTERNAL_ENTRY_SIZE < donor.capacity() / 2 {
                    break;
                }
                if donor.entries.is_empty() {
                    break;
                }
                let e = donor.entries.remove(0);
                target.entries.push(InternalEntry {
                    key: separator,
                    child: target.right_child,
                });
                target.right_child = e.child;
                moved_children.push(e.child);
                separator = e.key;
            }
            parent_node.entries[slot].key = separator;
        }
        for child in moved_children {
            self.set_parent(tx, child, target_index)?;
        }
        Ok(())
    }

    /// `left` absorbs `right`, pulling the separator between them down
    /// as a real entry.
    fn merge_internals(
        &self,
        tx: &Transaction,
        parent: PageIndex,
        left: PageIndex,
        right: PageIndex,
    ) -> DbResult<()> {
        let (right_entries, right_rightmost) = {
            let page = tx.read_page(right)?;
            let node = page.as_table_internal()?;
            (node.entries.clone(), node.right_child)
        };
        let separator = {
            let page = tx.read_page(parent)?;
            let node = page.as_table_internal()?;
            Self::parent_separator(node, left)?
                .ok_or_else(|| DbError::corrupt("merge target cannot be the rightmost child"))?
                .1
        };

        let mut moved_children: Vec<PageIndex> =
            right_entries.iter().map(|e| e.child).collect();
        moved_children.push(right_rightmost);

        {
            let pod = tx.modify_page(left)?;
            let mut guard = pod.wl();
            let node = guard.as_table_internal_mut()?;
            let old_rightmost = node.right_child;
            node.entries.push(InternalEntry {
                key: separator,
                child: old_rightmost,
            });
            node.entries.extend(right_entries);
            node.right_child = right_rightmost;
        }
        for child in &moved_children {
            self.set_parent(tx, *child, left)?;
        }
        tx.add_free_page(right)?;
        self.drop_merged_child(tx, parent, left, right)
    }
}
