//! The table store: a B+Tree keyed by row id with a leaf chain for
//! sequential scans.

use std::sync::Arc;

use crate::{
    btree::{
        page::{ChildSlot, Page},
        table::{overflow, TableIter},
    },
    error::DbError,
    storage::{
        schema::Schema,
        tuple::{unmarshal_columns, ColumnBytes, Row},
    },
    transaction::Transaction,
    types::{CancelToken, DbResult, PageIndex, RowId, NO_PAGE},
    utils::HandyRwLock,
};

/// A lightweight handle onto one table's B+Tree. Carries no state of
/// its own; every operation runs against a transaction.
pub struct TableTree<'a> {
    pub root: PageIndex,
    pub schema: &'a Schema,
}

impl<'a> TableTree<'a> {
    pub fn new(root: PageIndex, schema: &'a Schema) -> Self {
        Self { root, schema }
    }

    /// Descend to the leaf whose key range covers `key`.
    pub(crate) fn find_leaf(&self, tx: &Transaction, key: RowId) -> DbResult<PageIndex> {
        let mut index = self.root;
        loop {
            let page = tx.read_page(index)?;
            match &*page {
                Page::TableLeaf(_) => return Ok(index),
                Page::TableInternal(node) => index = node.child_for(key),
                other => {
                    return Err(DbError::corrupt(format!(
                        "page {} is a {} inside a table tree",
                        index,
                        other.kind_name()
                    )));
                }
            }
        }
    }

    pub(crate) fn leftmost_leaf(&self, tx: &Transaction) -> DbResult<PageIndex> {
        let mut index = self.root;
        loop {
            let page = tx.read_page(index)?;
            match &*page {
                Page::TableLeaf(_) => return Ok(index),
                Page::TableInternal(node) => {
                    index = node
                        .entries
                        .first()
                        .map(|e| e.child)
                        .unwrap_or(node.right_child);
                }
                other => {
                    return Err(DbError::corrupt(format!(
                        "page {} is a {} inside a table tree",
                        index,
                        other.kind_name()
                    )));
                }
            }
        }
    }

    fn rightmost_leaf(&self, tx: &Transaction) -> DbResult<PageIndex> {
        let mut index = self.root;
        loop {
            let page = tx.read_page(index)?;
            match &*page {
                Page::TableLeaf(_) => return Ok(index),
                Page::TableInternal(node) => index = node.right_child,
                other => {
                    return Err(DbError::corrupt(format!(
                        "page {} is a {} inside a table tree",
                        index,
                        other.kind_name()
                    )));
                }
            }
        }
    }

    /// Fetch one row by id, overflow text resolved.
    pub fn get_row(&self, tx: &Transaction, id: RowId) -> DbResult<Option<Row>> {
        let leaf_index = self.find_leaf(tx, id)?;
        let page = tx.read_page(leaf_index)?;
        let leaf = page.as_table_leaf()?;
        match leaf.find(id) {
            Ok(pos) => {
                let cell = &leaf.cells[pos];
                Ok(Some(overflow::decode_row(
                    tx,
                    self.schema,
                    cell.key,
                    cell.null_mask,
                    &cell.value,
                )?))
            }
            Err(_) => Ok(None),
        }
    }

    /// Highest row id currently stored, if any. Drives row id
    /// assignment at open.
    pub fn last_row_id(&self, tx: &Transaction) -> DbResult<Option<RowId>> {
        let leaf_index = self.rightmost_leaf(tx)?;
        let page = tx.read_page(leaf_index)?;
        Ok(page.as_table_leaf()?.max_key())
    }

    /// Sequential scan over the leaf chain, ascending by row id.
    pub fn iter<'t>(&'t self, tx: &'t Transaction, token: CancelToken) -> TableIter<'t, 'a> {
        TableIter::new(self, tx, token)
    }

    /// Rewrite a row in place when the new version fits, otherwise
    /// delete and reinsert under the same row id. Unchanged overflow
    /// chains are reused; replaced ones are rewritten tail-first.
    pub fn update_row(&self, tx: &Transaction, row: &Row) -> DbResult<()> {
        let leaf_index = self.find_leaf(tx, row.id)?;
        let (old_mask, old_value, pos) = {
            let page = tx.read_page(leaf_index)?;
            let leaf = page.as_table_leaf()?;
            let pos = leaf
                .find(row.id)
                .map_err(|_| DbError::not_found(format!("row {}", row.id)))?;
            let cell = &leaf.cells[pos];
            (cell.null_mask, cell.value.clone(), pos)
        };

        let old_cols = unmarshal_columns(self.schema, old_mask, &old_value)?;
        let (new_mask, new_value) = self.encode_update(tx, row, &old_cols)?;

        let pod = tx.modify_page(leaf_index)?;
        let mut guard = pod.wl();
        let leaf = guard.as_table_leaf_mut()?;
        let fits = leaf.used_bytes() - leaf.cells[pos].size()
            + crate::btree::page::LEAF_CELL_OVERHEAD
            + new_value.len()
            <= leaf.capacity();
        if fits {
            leaf.cells[pos].null_mask = new_mask;
            leaf.cells[pos].value = new_value;
            return Ok(());
        }
        drop(guard);

        // too big for the page now: take the remove/reinsert path,
        // keeping the same row id
        self.remove_cell(tx, row.id, false)?;
        self.insert_encoded(
            tx,
            crate::btree::page::LeafCell {
                null_mask: new_mask,
                key: row.id,
                value: new_value,
            },
        )
    }

    /// Marshal an updated row, reconciling its overflow chains with the
    /// previous version of the row.
    fn encode_update(
        &self,
        tx: &Transaction,
        row: &Row,
        old_cols: &[ColumnBytes],
    ) -> DbResult<(u64, bytes::Bytes)> {
        use crate::storage::{schema::ColumnKind, tuple::MAX_INLINE, value::Value};

        let mut cols = Vec::with_capacity(self.schema.len());
        for (i, slot) in row.values.iter().enumerate() {
            let old = &old_cols[i];
            let col = match slot.as_value() {
                None => {
                    if let ColumnBytes::BigText { first_page, .. } = old {
                        overflow::free_chain(tx, *first_page)?;
                    }
                    ColumnBytes::Null
                }
                Some(Value::Str(s))
                    if matches!(self.schema.column(i).kind, ColumnKind::Text)
                        && s.len() > MAX_INLINE =>
                {
                    match old {
                        ColumnBytes::BigText { first_page, .. } => ColumnBytes::BigText {
                            len: s.len() as u32,
                            first_page: overflow::update_chain(tx, *first_page, s.as_bytes())?,
                        },
                        _ => ColumnBytes::BigText {
                            len: s.len() as u32,
                            first_page: overflow::write_chain(tx, s.as_bytes())?,
                        },
                    }
                }
                Some(v) => {
                    if let ColumnBytes::BigText { first_page, .. } = old {
                        overflow::free_chain(tx, *first_page)?;
                    }
                    ColumnBytes::Inline(v.clone())
                }
            };
            cols.push(col);
        }
        crate::storage::tuple::marshal_columns(self.schema, &cols)
    }

    /// Rewrite the separator for `child` after its subtree maximum
    /// changed, walking up while the child is its parent's rightmost.
    pub(crate) fn update_separators(
        &self,
        tx: &Transaction,
        child: PageIndex,
        new_max: RowId,
    ) -> DbResult<()> {
        let mut child = child;
        loop {
            let page = tx.read_page(child)?;
            let (is_root, parent) = page.node_position()?;
            if is_root {
                return Ok(());
            }
            let pod = tx.modify_page(parent)?;
            let mut guard = pod.wl();
            let node = guard.as_table_internal_mut()?;
            match node.slot_of(child) {
                Some(ChildSlot::Entry(i)) => {
                    node.entries[i].key = new_max;
                    return Ok(());
                }
                Some(ChildSlot::Rightmost) => {
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

    /// Free every page of the tree: rows' overflow chains, leaves and
    /// internal nodes. The root page itself is reset to an empty leaf
    /// when `keep_root`, otherwise freed too.
    pub fn free_all_pages(&self, tx: &Transaction, keep_root: bool) -> DbResult<()> {
        self.free_subtree(tx, self.root, keep_root)?;
        Ok(())
    }

    fn free_subtree(&self, tx: &Transaction, index: PageIndex, keep: bool) -> DbResult<()> {
        let page = tx.read_page(index)?;
        match &*page {
            Page::TableLeaf(leaf) => {
                for cell in &leaf.cells {
                    let cols = unmarshal_columns(self.schema, cell.null_mask, &cell.value)?;
                    for col in cols {
                        if let ColumnBytes::BigText { first_page, .. } = col {
                            overflow::free_chain(tx, first_page)?;
                        }
                    }
                }
            }
            Page::TableInternal(node) => {
                let children: Vec<PageIndex> = node.children().collect();
                for child in children {
                    self.free_subtree(tx, child, false)?;
                }
            }
            other => {
                return Err(DbError::corrupt(format!(
                    "page {} is a {} inside a table tree",
                    index,
                    other.kind_name()
                )));
            }
        }
        if keep {
            tx.set_page(
                index,
                Page::TableLeaf(crate::btree::page::TableLeafPage::new_root()),
            )?;
        } else {
            tx.add_free_page(index)?;
        }
        Ok(())
    }

    /// Walk the whole tree asserting its structural invariants: parent
    /// links, in-node ordering, separators equal to subtree maxima, and
    /// a leaf chain that covers every row exactly once in ascending
    /// order. Returns the row count.
    pub fn check_integrity(&self, tx: &Transaction) -> DbResult<usize> {
        let mut leaves = Vec::new();
        let root_page = tx.read_page(self.root)?;
        let (is_root, _) = root_page.node_position()?;
        if !is_root {
            return Err(DbError::corrupt("root page does not carry the root flag"));
        }
        self.verify_subtree(tx, self.root, None, None, &mut leaves)?;

        // the chain traversal must visit exactly the leaves found by
        // the tree walk, in order
        let mut chained = Vec::new();
        let mut index = self.leftmost_leaf(tx)?;
        let mut rows = 0usize;
        let mut last_key: Option<RowId> = None;
        loop {
            let page = tx.read_page(index)?;
            let leaf = page.as_table_leaf()?;
            chained.push(index);
            for cell in &leaf.cells {
                if let Some(last) = last_key {
                    if cell.key <= last {
                        return Err(DbError::corrupt(format!(
                            "leaf chain yields {} after {}",
                            cell.key, last
                        )));
                    }
                }
                last_key = Some(cell.key);
                rows += 1;
            }
            if leaf.next_leaf == NO_PAGE {
                break;
            }
            index = leaf.next_leaf;
        }
        if chained != leaves {
            return Err(DbError::corrupt(format!(
                "leaf chain {:?} does not match tree leaves {:?}",
                chained, leaves
            )));
        }
        Ok(rows)
    }

    fn verify_subtree(
        &self,
        tx: &Transaction,
        index: PageIndex,
        expected_parent: Option<PageIndex>,
        upper: Option<RowId>,
        leaves: &mut Vec<PageIndex>,
    ) -> DbResult<Option<RowId>> {
        let page: Arc<Page> = tx.read_page(index)?;
        let (_, parent) = page.node_position()?;
        if let Some(expected) = expected_parent {
            if parent != expected {
                return Err(DbError::corrupt(format!(
                    "page {} points at parent {}, expected {}",
                    index, parent, expected
                )));
            }
        }
        match &*page {
            Page::TableLeaf(leaf) => {
                for pair in leaf.cells.windows(2) {
                    if pair[0].key >= pair[1].key {
                        return Err(DbError::corrupt(format!(
                            "leaf {} cells out of order",
                            index
                        )));
                    }
                }
                if let (Some(upper), Some(max)) = (upper, leaf.max_key()) {
                    if max > upper {
                        return Err(DbError::corrupt(format!(
                            "leaf {} max {} exceeds separator {}",
                            index, max, upper
                        )));
                    }
                }
                leaves.push(index);
                Ok(leaf.max_key())
            }
            Page::TableInternal(node) => {
                for pair in node.entries.windows(2) {
                    if pair[0].key >= pair[1].key {
                        return Err(DbError::corrupt(format!(
                            "internal {} separators out of order",
                            index
                        )));
                    }
                }
                let mut subtree_max = None;
                for entry in &node.entries {
                    let child_max =
                        self.verify_subtree(tx, entry.child, Some(index), Some(entry.key), leaves)?;
                    if child_max != Some(entry.key) {
                        return Err(DbError::corrupt(format!(
                            "separator {} of page {} does not equal child {} max {:?}",
                            entry.key, index, entry.child, child_max
                        )));
                    }
                    subtree_max = child_max;
                }
                let right_max =
                    self.verify_subtree(tx, node.right_child, Some(index), upper, leaves)?;
                if right_max.is_some() {
                    subtree_max = right_max;
                }
                Ok(subtree_max)
            }
            other => Err(DbError::corrupt(format!(
                "page {} is a {} inside a table tree",
                index,
                other.kind_name()
            ))),
        }
    }
}
