//! Insertion and node splitting.
//!
//! A split keeps `ceil((n+1)/2)` cells on the left page and hands the
//! rest to a fresh right sibling. Splitting the root keeps the root
//! page index stable: two children are allocated and the root page is
//! rewritten as an internal node in place, so the catalog's recorded
//! root never moves.

use log::debug;

use crate::{
    btree::{
        page::{
            ChildSlot, InternalEntry, LeafCell, Page, TableInternalPage, TableLeafPage,
        },
        table::{overflow, TableTree},
    },
    error::DbError,
    storage::tuple::Row,
    transaction::Transaction,
    types::{DbResult, PageIndex, Pod, RowId},
    utils::HandyRwLock,
};

impl<'a> TableTree<'a> {
    /// Insert a row under its (already assigned) row id.
    pub fn insert_row(&self, tx: &Transaction, row: &Row) -> DbResult<()> {
        let (null_mask, value) = overflow::encode_row(tx, self.schema, row)?;
        self.insert_encoded(
            tx,
            LeafCell {
                null_mask,
                key: row.id,
                value,
            },
        )
    }

    pub(crate) fn insert_encoded(&self, tx: &Transaction, cell: LeafCell) -> DbResult<()> {
        let key = cell.key;
        let leaf_index = self.find_leaf(tx, key)?;
        let pod = tx.modify_page(leaf_index)?;
        {
            let mut guard = pod.wl();
            let leaf = guard.as_table_leaf_mut()?;
            match leaf.find(key) {
                Ok(_) => {
                    return Err(DbError::DuplicateKey(format!("row id {}", key)));
                }
                Err(pos) => leaf.cells.insert(pos, cell),
            }
            if leaf.fits() {
                return Ok(());
            }
        }
        debug!("splitting leaf {} on insert of row {}", leaf_index, key);
        self.split_leaf(tx, leaf_index, pod)
    }

    fn split_leaf(&self, tx: &Transaction, leaf_index: PageIndex, pod: Pod<Page>) -> DbResult<()> {
        let mut guard = pod.wl();
        let leaf = guard.as_table_leaf_mut()?;
        // with n cells before the insert, the left page keeps
        // ceil((n+1)/2) of the n+1
        let keep = (leaf.cells.len() + 2) / 2;
        let moved = leaf.cells.split_off(keep);

        if leaf.is_root {
            // the root page stays; both halves move to new children
            let left_index = tx.get_free_page()?;
            let right_index = tx.get_free_page()?;

            let mut left = TableLeafPage::new_child(leaf_index);
            left.cells = std::mem::take(&mut leaf.cells);
            left.next_leaf = right_index;
            let mut right = TableLeafPage::new_child(leaf_index);
            right.cells = moved;

            let separator = left.cells.last().unwrap().key;
            let mut root = TableInternalPage::new_root(right_index);
            root.entries = vec![InternalEntry {
                key: separator,
                child: left_index,
            }];
            *guard = Page::TableInternal(root);
            drop(guard);

            tx.set_page(left_index, Page::TableLeaf(left))?;
            tx.set_page(right_index, Page::TableLeaf(right))?;
            return Ok(());
        }

        let right_index = tx.get_free_page()?;
        let mut right = TableLeafPage::new_child(leaf.parent);
        right.cells = moved;
        right.next_leaf = leaf.next_leaf;
        leaf.next_leaf = right_index;

        let separator = leaf.cells.last().unwrap().key;
        let parent_index = leaf.parent;
        drop(guard);

        tx.set_page(right_index, Page::TableLeaf(right))?;
        self.insert_into_parent(tx, parent_index, separator, leaf_index, right_index)
    }

    /// After a child split: the slot that pointed at `left` now covers
    /// only the upper half, so repoint it at `right` (its key still
    /// equals the right half's maximum) and insert a fresh entry for
    /// the left half before it.
    fn insert_into_parent(
        &self,
        tx: &Transaction,
        parent_index: PageIndex,
        separator: RowId,
        left: PageIndex,
        right: PageIndex,
    ) -> DbResult<()> {
        let pod = tx.modify_page(parent_index)?;
        {
            let mut guard = pod.wl();
            let node = guard.as_table_internal_mut()?;
            match node.slot_of(left) {
                Some(ChildSlot::Entry(i)) => {
                    node.entries[i].child = right;
                    node.entries.insert(
                        i,
                        InternalEntry {
                            key: separator,
                            child: left,
                        },
                    );
                }
                Some(ChildSlot::Rightmost) => {
                    node.right_child = right;
                    node.entries.push(InternalEntry {
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
        debug!("splitting internal {} after child split", parent_index);
        self.split_internal(tx, parent_index, pod)
    }

    fn split_internal(
        &self,
        tx: &Transaction,
        node_index: PageIndex,
        pod: Pod<Page>,
    ) -> DbResult<()> {
        let mut guard = pod.wl();
        let node = guard.as_table_internal_mut()?;
        let keep = (node.entries.len() + 2) / 2;
        let moved = node.entries.split_off(keep);
        // the last left entry becomes the pivot: its child turns into
        // the left node's rightmost child, its key routes to the parent
        let pivot = node.entries.pop().unwrap();

        if node.is_root {
            let left_index = tx.get_free_page()?;
            let right_index = tx.get_free_page()?;

            let mut left = TableInternalPage::new_child(node_index, pivot.child);
            left.entries = std::mem::take(&mut node.entries);
            let mut right = TableInternalPage::new_child(node_index, node.right_child);
            right.entries = moved;

            node.entries = vec![InternalEntry {
                key: pivot.key,
                child: left_index,
            }];
            node.right_child = right_index;
            drop(guard);

            let left_children: Vec<PageIndex> = left.children().collect();
            let right_children: Vec<PageIndex> = right.children().collect();
            tx.set_page(left_index, Page::TableInternal(left))?;
            tx.set_page(right_index, Page::TableInternal(right))?;
            for child in left_children {
                self.set_parent(tx, child, left_index)?;
            }
            for child in right_children {
                self.set_parent(tx, child, right_index)?;
            }
            return Ok(());
        }

        let right_index = tx.get_free_page()?;
        let mut right = TableInternalPage::new_child(node.parent, node.right_child);
        right.entries = moved;
        node.right_child = pivot.child;
        let parent_index = node.parent;
        drop(guard);

        let right_children: Vec<PageIndex> = right.children().collect();
        tx.set_page(right_index, Page::TableInternal(right))?;
        for child in right_children {
            self.set_parent(tx, child, right_index)?;
        }
        self.insert_into_parent(tx, parent_index, pivot.key, node_index, right_index)
    }
}
