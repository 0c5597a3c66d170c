//! Removing row ids and keys from an index.
//!
//! Deleting one row id of a non-unique key keeps the cell compact: a
//! vacated inline slot is refilled with the tail row id of the overflow
//! chain, a hole inside the chain is swapped with the chain's tail, and
//! an emptied tail page is unlinked and freed. Removing the last row id
//! removes the whole cell, with the same borrow/merge rebalancing as
//! the table store.

use log::debug;

use crate::{
    btree::{
        consts::PAGE_SIZE,
        index::{key::IndexKey, IndexTree},
        page::{
            IndexChildSlot, IndexEntry, IndexInternalNode, IndexLeafNode, IndexNode, IndexPage,
            Page, INDEX_HEADER_SIZE,
        },
    },
    error::DbError,
    transaction::Transaction,
    types::{DbResult, PageIndex, Pod, RowId, NO_PAGE},
    utils::HandyRwLock,
};

struct Siblings {
    parent: PageIndex,
    left: Option<PageIndex>,
    right: Option<PageIndex>,
}

impl IndexTree {
    /// Unbind `row_id` from `key`. `NotFound` when the binding does not
    /// exist; the last binding removes the key itself.
    pub fn delete(&self, tx: &Transaction, key: &IndexKey, row_id: RowId) -> DbResult<()> {
        let leaf_index = self.find_leaf(tx, |k| key.cmp(k))?;

        let (pos, inline_pos, has_overflow, single) = {
            let page = tx.read_page(leaf_index)?;
            let leaf = page.as_index()?.leaf()?;
            let pos = leaf
                .find(key)
                .map_err(|_| DbError::not_found(format!("key {}", key)))?;
            let cell = &leaf.cells[pos];
            let inline_pos = cell.row_ids.iter().position(|&id| id == row_id);
            let has_overflow = cell.overflow != NO_PAGE;
            let single = cell.row_ids.len() == 1 && !has_overflow;
            (pos, inline_pos, has_overflow, single)
        };

        if single {
            if inline_pos.is_none() {
                return Err(DbError::not_found(format!("row {} under key {}", row_id, key)));
            }
            return self.remove_key(tx, leaf_index, key);
        }

        let pod = tx.modify_page(leaf_index)?;
        if let Some(i) = inline_pos {
            if has_overflow {
                let tail = self.pop_tail_overflow(tx, &pod, pos)?;
                pod.wl().as_index_mut()?.leaf_mut()?.cells[pos].row_ids[i] = tail;
            } else {
                pod.wl().as_index_mut()?.leaf_mut()?.cells[pos].row_ids.remove(i);
            }
            return Ok(());
        }

        if !has_overflow {
            return Err(DbError::not_found(format!("row {} under key {}", row_id, key)));
        }

        // the id lives somewhere in the overflow chain
        let first = pod.rl().as_index()?.leaf()?.cells[pos].overflow;
        let mut location = None;
        let mut index = first;
        while index != NO_PAGE {
            let page = tx.read_page(index)?;
            let overflow = page.as_index_overflow()?;
            if let Some(slot) = overflow.row_ids.iter().position(|&id| id == row_id) {
                location = Some((index, slot));
            }
            index = overflow.next_page;
        }
        let (ovf_index, slot) = location
            .ok_or_else(|| DbError::not_found(format!("row {} under key {}", row_id, key)))?;

        let tail = self.pop_tail_overflow(tx, &pod, pos)?;
        if tail != row_id {
            let ovf_pod = tx.modify_page(ovf_index)?;
            ovf_pod.wl().as_index_overflow_mut()?.row_ids[slot] = tail;
        }
        Ok(())
    }

    /// Remove and return the last row id of a cell's overflow chain,
    /// unlinking and freeing the tail page if that empties it.
    fn pop_tail_overflow(
        &self,
        tx: &Transaction,
        leaf_pod: &Pod<Page>,
        cell_pos: usize,
    ) -> DbResult<RowId> {
        let first = leaf_pod.rl().as_index()?.leaf()?.cells[cell_pos].overflow;
        if first == NO_PAGE {
            return Err(DbError::corrupt("cell has no overflow chain to pop"));
        }
        let mut prev = None;
        let mut tail = first;
        loop {
            let page = tx.read_page(tail)?;
            let next = page.as_index_overflow()?.next_page;
            if next == NO_PAGE {
                break;
            }
            prev = Some(tail);
            tail = next;
        }

        let tail_pod = tx.modify_page(tail)?;
        let (id, now_empty) = {
            let mut guard = tail_pod.wl();
            let overflow = guard.as_index_overflow_mut()?;
            let id = overflow
                .row_ids
                .pop()
                .ok_or_else(|| DbError::corrupt("empty overflow page in chain"))?;
            (id, overflow.row_ids.is_empty())
        };
        if now_empty {
            match prev {
                None => {
                    leaf_pod.wl().as_index_mut()?.leaf_mut()?.cells[cell_pos].overflow = NO_PAGE;
                }
                Some(prev) => {
                    let prev_pod = tx.modify_page(prev)?;
                    prev_pod.wl().as_index_overflow_mut()?.next_page = NO_PAGE;
                }
            }
            tx.add_free_page(tail)?;
        }
        Ok(id)
    }

    /// Remove a whole cell, rebalancing on underflow.
    fn remove_key(&self, tx: &Transaction, leaf_index: PageIndex, key: &IndexKey) -> DbResult<()> {
        let pod = tx.modify_page(leaf_index)?;
        let (was_max, new_max, underfull, is_root) = {
            let mut guard = pod.wl();
            let page = guard.as_index_mut()?;
            let is_root = page.is_root;
            let leaf = page.leaf_mut()?;
            let pos = leaf
                .find(key)
                .map_err(|_| DbError::not_found(format!("key {}", key)))?;
            leaf.cells.remove(pos);
            (
                pos == leaf.cells.len(),
                leaf.max_key().cloned(),
                page.is_underfull(),
                is_root,
            )
        };

        if is_root {
            return Ok(());
        }
        if was_max {
            if let Some(max) = new_max {
                self.update_separators(tx, leaf_index, &max)?;
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
        let node = parent_page.as_index()?.internal()?;
        match node.slot_of(index) {
            Some(IndexChildSlot::Entry(i)) => Ok(Siblings {
                parent,
                left: (i > 0).then(|| node.entries[i - 1].child),
                right: Some(if i + 1 < node.entries.len() {
                    node.entries[i + 1].child
                } else {
                    node.right_child
                }),
            }),
            Some(IndexChildSlot::Rightmost) => Ok(Siblings {
                parent,
                left: node.entries.last().map(|e| e.child),
                right: None,
            }),
            None => Err(DbError::corrupt(format!(
                "index page {} not referenced by its parent {}",
                index, parent
            ))),
        }
    }

    fn used(&self, tx: &Transaction, index: PageIndex) -> DbResult<usize> {
        Ok(tx.read_page(index)?.as_index()?.used_bytes())
    }

    fn rebalance_leaf(&self, tx: &Transaction, index: PageIndex) -> DbResult<()> {
        let siblings = self.siblings(tx, index)?;
        let used = self.used(tx, index)?;

        if let Some(left) = siblings.left {
            if self.used(tx, left)? + used - INDEX_HEADER_SIZE > PAGE_SIZE {
                return self.borrow_from_left_leaf(tx, left, index);
            }
        }
        if let Some(right) = siblings.right {
            if self.used(tx, right)? + used - INDEX_HEADER_SIZE > PAGE_SIZE {
                return self.borrow_from_right_leaf(tx, index, right);
            }
        }
        if let Some(left) = siblings.left {
            debug!("merging index leaf {} into {}", index, left);
            return self.merge_leaves(tx, siblings.parent, left, index);
        }
        if let Some(right) = siblings.right {
            debug!("merging index leaf {} into {}", right, index);
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
            let donor_page = donor_guard.as_index_mut()?;
            let target_page = target_guard.as_index_mut()?;
            while target_page.is_underfull() {
                let donor_used = donor_page.used_bytes();
                let half = donor_page.capacity() / 2;
                let donor = donor_page.leaf_mut()?;
                let size = donor.cells.last().map(|c| c.size()).unwrap_or(0);
                if donor_used - size < half {
                    break;
                }
                let cell = donor.cells.pop().unwrap();
                target_page.leaf_mut()?.cells.insert(0, cell);
            }
            donor_guard
                .as_index()?
                .leaf()?
                .max_key()
                .cloned()
                .ok_or_else(|| {
                    DbError::corrupt(format!("index leaf {} drained by redistribution", donor_index))
                })?
        };
        self.update_separators(tx, donor_index, &donor_max)
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
            let target_page = target_guard.as_index_mut()?;
            let donor_page = donor_guard.as_index_mut()?;
            while target_page.is_underfull() {
                let donor_used = donor_page.used_bytes();
                let half = donor_page.capacity() / 2;
                let donor = donor_page.leaf_mut()?;
                let size = donor.cells.first().map(|c| c.size()).unwrap_or(0);
                if donor_used - size < half {
                    break;
                }
                let cell = donor.cells.remove(0);
                target_page.leaf_mut()?.cells.push(cell);
            }
            target_guard
                .as_index()?
                .leaf()?
                .max_key()
                .cloned()
                .ok_or_else(|| {
                    DbError::corrupt(format!("index leaf {} empty after redistribution", target_index))
                })?
        };
        self.update_separators(tx, target_index, &target_max)
    }

    fn merge_leaves(
        &self,
        tx: &Transaction,
        parent: PageIndex,
        left: PageIndex,
        right: PageIndex,
    ) -> DbResult<()> {
        let (right_cells, right_next) = {
            let page = tx.read_page(right)?;
            let leaf = page.as_index()?.leaf()?;
            (leaf.cells.clone(), leaf.next_leaf)
        };
        {
            let pod = tx.modify_page(left)?;
            let mut guard = pod.wl();
            let leaf = guard.as_index_mut()?.leaf_mut()?;
            leaf.cells.extend(right_cells);
            leaf.next_leaf = right_next;
        }
        tx.add_free_page(right)?;
        self.drop_merged_child(tx, parent, left, right)
    }

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
            let page = guard.as_index_mut()?;
            let is_root = page.is_root;
            let node = page.internal_mut()?;
            let left_pos = node
                .entries
                .iter()
                .position(|e| e.child == left)
                .ok_or_else(|| {
                    DbError::corrupt(format!(
                        "merged index page {} has no entry in parent {}",
                        left, parent
                    ))
                })?;
            match node.slot_of(right) {
                Some(IndexChildSlot::Entry(j)) => {
                    node.entries[j].child = left;
                }
                Some(IndexChildSlot::Rightmost) => {
                    node.right_child = left;
                }
                None => {
                    return Err(DbError::corrupt(format!(
                        "merged index page {} has no slot in parent {}",
                        right, parent
                    )));
                }
            }
            node.entries.remove(left_pos);
            let empty = node.entries.is_empty();
            (is_root, empty, page.is_underfull())
        };

        if is_root && empty {
            return self.collapse_root(tx, parent);
        }
        if underfull {
            return self.rebalance_internal(tx, parent);
        }
        Ok(())
    }

    fn collapse_root(&self, tx: &Transaction, root_index: PageIndex) -> DbResult<()> {
        let pod = tx.modify_page(root_index)?;
        let child_index = pod.rl().as_index()?.internal()?.right_child;
        let child_page = tx.read_page(child_index)?;
        debug!("promoting index page {} into root {}", child_index, root_index);
        let child = child_page.as_index()?;
        match &child.node {
            IndexNode::Leaf(leaf) => {
                *pod.wl() = Page::Index(IndexPage {
                    is_root: true,
                    parent: NO_PAGE,
                    node: IndexNode::Leaf(IndexLeafNode {
                        next_leaf: leaf.next_leaf,
                        cells: leaf.cells.clone(),
                    }),
                });
            }
            IndexNode::Internal(internal) => {
                let promoted = IndexInternalNode {
                    right_child: internal.right_child,
                    entries: internal.entries.clone(),
                };
                let children: Vec<PageIndex> = promoted.children().collect();
                *pod.wl() = Page::Index(IndexPage {
                    is_root: true,
                    parent: NO_PAGE,
                    node: IndexNode::Internal(promoted),
                });
                for child in children {
                    self.set_parent(tx, child, root_index)?;
                }
            }
        }
        tx.add_free_page(child_index)
    }

    fn parent_separator(
        node: &IndexInternalNode,
        child: PageIndex,
    ) -> DbResult<Option<(usize, IndexKey)>> {
        match node.slot_of(child) {
            Some(IndexChildSlot::Entry(i)) => Ok(Some((i, node.entries[i].key.clone()))),
            Some(IndexChildSlot::Rightmost) => Ok(None),
            None => Err(DbError::corrupt(format!(
                "index page {} not referenced by its parent",
                child
            ))),
        }
    }

    fn rebalance_internal(&self, tx: &Transaction, index: PageIndex) -> DbResult<()> {
        let siblings = self.siblings(tx, index)?;
        let used = self.used(tx, index)?;

        // a merged internal pulls the separator down as an extra entry;
        // separators vary in size, so budget for the larger of the two
        let slack = {
            let parent_page = tx.read_page(siblings.parent)?;
            let parent = parent_page.as_index()?.internal()?;
            parent
                .entries
                .iter()
                .map(|e| e.size())
                .max()
                .unwrap_or(INDEX_HEADER_SIZE)
        };

        if let Some(left) = siblings.left {
            if self.used(tx, left)? + used - INDEX_HEADER_SIZE + slack > PAGE_SIZE {
                return self.borrow_from_left_internal(tx, siblings.parent, left, index);
            }
        }
        if let Some(right) = siblings.right {
            if self.used(tx, right)? + used - INDEX_HEADER_SIZE + slack > PAGE_SIZE {
                return self.borrow_from_right_internal(tx, siblings.parent, index, right);
            }
        }
        if let Some(left) = siblings.left {
            debug!("merging index internal {} into {}", index, left);
            return self.merge_internals(tx, siblings.parent, left, index);
        }
        if let Some(right) = siblings.right {
            debug!("merging index internal {} into {}", right, index);
            return self.merge_internals(tx, siblings.parent, index, right);
        }
        Ok(())
    }

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
            let parent_node = parent_guard.as_index_mut()?.internal_mut()?;
            let (slot, mut separator) = Self::parent_separator(parent_node, donor_index)?
                .ok_or_else(|| DbError::corrupt("left sibling cannot be the rightmost child"))?;

            let mut donor_guard = donor_pod.wl();
            let mut target_guard = target_pod.wl();
            let donor_page = donor_guard.as_index_mut()?;
            let target_page = target_guard.as_index_mut()?;

            while target_page.is_underfull() {
                let donor_used = donor_page.used_bytes();
                let half = donor_page.capacity() / 2;
                let donor = donor_page.internal_mut()?;
                let last_size = donor.entries.last().map(|e| e.size()).unwrap_or(0);
                if donor_used - last_size < half || donor.entries.is_empty() {
                    break;
                }
                let rotated = donor.right_child;
                target_page.internal_mut()?.entries.insert(
                    0,
                    IndexEntry {
                        key: separator,
                        child: rotated,
                    },
                );
                moved_children.push(rotated);
                let e = donor.entries.pop().unwrap();
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
            let parent_node = parent_guard.as_index_mut()?.internal_mut()?;
            let (slot, mut separator) = Self::parent_separator(parent_node, target_index)?
                .ok_or_else(|| {
                    DbError::corrupt("a page with a right sibling cannot be the rightmost child")
                })?;

            let mut target_guard = target_pod.wl();
            let mut donor_guard = donor_pod.wl();
            let target_page = target_guard.as_index_mut()?;
            let donor_page = donor_guard.as_index_mut()?;

            while target_page.is_underfull() {
                let donor_used = donor_page.used_bytes();
                let half = donor_page.capacity() / 2;
                let donor = donor_page.internal_mut()?;
                let first_size = donor.entries.first().map(|e| e.size()).unwrap_or(0);
                if donor.entries.is_empty() || donor_used - first_size < half {
                    break;
                }
                let e = donor.entries.remove(0);
                let target = target_page.internal_mut()?;
                target.entries.push(IndexEntry {
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

    fn merge_internals(
        &self,
        tx: &Transaction,
        parent: PageIndex,
        left: PageIndex,
        right: PageIndex,
    ) -> DbResult<()> {
        let (right_entries, right_rightmost) = {
            let page = tx.read_page(right)?;
            let node = page.as_index()?.internal()?;
            (node.entries.clone(), node.right_child)
        };
        let separator = {
            let page = tx.read_page(parent)?;
            let node = page.as_index()?.internal()?;
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
            let node = guard.as_index_mut()?.internal_mut()?;
            let old_rightmost = node.right_child;
            node.entries.push(IndexEntry {
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
