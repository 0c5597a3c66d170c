use std::sync::Arc;

use crate::{
    btree::{
        page::Page,
        table::{overflow, TableTree},
    },
    storage::tuple::Row,
    transaction::Transaction,
    types::{CancelToken, DbResult, NO_PAGE},
};

/// Sequential scan over a table's leaf chain, ascending by row id.
/// Each leaf is pinned as a snapshot while its cells are drained; the
/// cancellation token is checked per produced row.
pub struct TableIter<'t, 's> {
    tree: &'t TableTree<'s>,
    tx: &'t Transaction,
    token: CancelToken,
    current: Option<(Arc<Page>, usize)>,
    started: bool,
    done: bool,
}

impl<'t, 's> TableIter<'t, 's> {
    pub(crate) fn new(tree: &'t TableTree<'s>, tx: &'t Transaction, token: CancelToken) -> Self {
        Self {
            tree,
            tx,
            token,
            current: None,
            started: false,
            done: false,
        }
    }

    fn step(&mut self) -> DbResult<Option<Row>> {
        self.token.check()?;
        if !self.started {
            self.started = true;
            let leftmost = self.tree.leftmost_leaf(self.tx)?;
            let page = self.tx.read_page(leftmost)?;
            self.current = Some((page, 0));
        }
        loop {
            let (page, pos) = match &mut self.current {
                Some(state) => state,
                None => return Ok(None),
            };
            let leaf = page.as_table_leaf()?;
            if *pos < leaf.cells.len() {
                let cell = &leaf.cells[*pos];
                *pos += 1;
                let row = overflow::decode_row(
                    self.tx,
                    self.tree.schema,
                    cell.key,
                    cell.null_mask,
                    &cell.value,
                )?;
                return Ok(Some(row));
            }
            if leaf.next_leaf == NO_PAGE {
                self.current = None;
                return Ok(None);
            }
            let next = self.tx.read_page(leaf.next_leaf)?;
            self.current = Some((next, 0));
        }
    }
}

impl<'t, 's> Iterator for TableIter<'t, 's> {
    type Item = DbResult<Row>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.step() {
            Ok(Some(row)) => Some(Ok(row)),
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
