use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, RwLock},
};

use crate::{
    btree::{
        page::{DbHeader, FreePage, Page},
        pager::Pager,
    },
    error::DbError,
    transaction::TransactionManager,
    types::{DbResult, PageIndex, Pod, NO_PAGE},
    utils::HandyRwLock,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStatus {
    Active,
    Committed,
    Aborted,
}

pub(crate) struct TxState {
    pub(crate) status: TxStatus,
    /// Pages read, with the global version observed at first read.
    pub(crate) read_set: HashMap<PageIndex, u64>,
    /// Private clones of the pages this transaction writes.
    pub(crate) write_set: HashMap<PageIndex, Pod<Page>>,
    /// Private copy of the database header, once touched.
    pub(crate) header: Option<DbHeader>,
    pub(crate) header_read_version: Option<u64>,
    pub(crate) header_modified: bool,
    /// Next fresh page index past the shared end of file.
    pub(crate) next_fresh: Option<PageIndex>,
    pub(crate) ddl_change: bool,
}

/// One transaction: snapshot reads with version tracking, private write
/// copies, commit-time conflict detection. All methods take `&self`;
/// the executor shares one transaction across its pipeline threads.
pub struct Transaction {
    id: u64,
    pager: Arc<Pager>,
    tm: Arc<TransactionManager>,
    pub(crate) state: RwLock<TxState>,
}

impl Transaction {
    pub(crate) fn new(id: u64, pager: Arc<Pager>, tm: Arc<TransactionManager>) -> Self {
        Self {
            id,
            pager,
            tm,
            state: RwLock::new(TxState {
                status: TxStatus::Active,
                read_set: HashMap::new(),
                write_set: HashMap::new(),
                header: None,
                header_read_version: None,
                header_modified: false,
                next_fresh: None,
                ddl_change: false,
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn status(&self) -> TxStatus {
        self.state.rl().status
    }

    fn ensure_active(&self) -> DbResult<()> {
        if self.status() != TxStatus::Active {
            return Err(DbError::validation("transaction is not active"));
        }
        Ok(())
    }

    /// Read a page: own write when present, otherwise the shared cached
    /// page, recording the version observed. The version is captured
    /// before the page so an interleaved commit surfaces as a conflict
    /// rather than a missed one.
    pub fn read_page(&self, index: PageIndex) -> DbResult<Arc<Page>> {
        self.ensure_active()?;
        {
            let state = self.state.rl();
            if let Some(pod) = state.write_set.get(&index) {
                return Ok(Arc::new(pod.rl().clone()));
            }
        }
        let version = self.tm.page_version(index);
        let page = self.pager.get_page(index)?;
        let mut state = self.state.wl();
        state.read_set.entry(index).or_insert(version);
        Ok(page)
    }

    /// Read a page and clone it into the write set, returning the
    /// private copy. Mutations through the returned pod stay invisible
    /// to other transactions until commit.
    pub fn modify_page(&self, index: PageIndex) -> DbResult<Pod<Page>> {
        self.ensure_active()?;
        {
            let state = self.state.rl();
            if let Some(pod) = state.write_set.get(&index) {
                return Ok(Arc::clone(pod));
            }
        }
        let version = self.tm.page_version(index);
        let page = self.pager.get_page(index)?;
        let pod: Pod<Page> = Arc::new(RwLock::new((*page).clone()));
        let mut state = self.state.wl();
        state.read_set.entry(index).or_insert(version);
        state.write_set.insert(index, Arc::clone(&pod));
        Ok(pod)
    }

    /// Install a brand-new page body at `index` (a fresh or recycled
    /// page the caller obtained from [`Transaction::get_free_page`]).
    pub fn set_page(&self, index: PageIndex, page: Page) -> DbResult<Pod<Page>> {
        self.ensure_active()?;
        let pod: Pod<Page> = Arc::new(RwLock::new(page));
        let mut state = self.state.wl();
        state.write_set.insert(index, Arc::clone(&pod));
        Ok(pod)
    }

    fn load_header(&self, state: &mut TxState) {
        if state.header.is_none() {
            state.header_read_version = Some(self.tm.header_version());
            state.header = Some(self.pager.header());
        }
    }

    /// A read-only look at the transaction's view of the header.
    pub fn db_header(&self) -> DbHeader {
        let mut state = self.state.wl();
        self.load_header(&mut state);
        state.header.unwrap()
    }

    /// Pop the free list, or claim a fresh index past the end of file.
    /// Either way the header is considered modified: allocation must
    /// conflict with any other allocating transaction.
    pub fn get_free_page(&self) -> DbResult<PageIndex> {
        self.ensure_active()?;
        let first_free = {
            let mut state = self.state.wl();
            self.load_header(&mut state);
            state.header_modified = true;
            state.header.unwrap().first_free_page
        };

        if first_free != NO_PAGE {
            let page = self.read_page(first_free)?;
            let next = page.as_free()?.next_free;
            let mut state = self.state.wl();
            let header = state.header.as_mut().unwrap();
            header.first_free_page = next;
            header.free_page_count -= 1;
            return Ok(first_free);
        }

        let mut state = self.state.wl();
        let next = state.next_fresh.unwrap_or_else(|| self.pager.total_pages());
        state.next_fresh = Some(next + 1);
        Ok(next)
    }

    /// Push a page onto the free list and rewrite it as free.
    pub fn add_free_page(&self, index: PageIndex) -> DbResult<()> {
        self.ensure_active()?;
        let mut state = self.state.wl();
        self.load_header(&mut state);
        state.header_modified = true;
        let header = state.header.as_mut().unwrap();
        let old_first = header.first_free_page;
        header.first_free_page = index;
        header.free_page_count += 1;
        let pod: Pod<Page> = Arc::new(RwLock::new(Page::Free(FreePage::new(old_first))));
        state.write_set.insert(index, pod);
        Ok(())
    }

    /// Mark that this transaction changes the catalog; such transactions
    /// never take the read-only commit fast path.
    pub fn mark_ddl(&self) {
        self.state.wl().ddl_change = true;
    }

    pub fn commit(&self) -> DbResult<()> {
        self.tm.commit(self)
    }

    pub fn abort(&self) -> DbResult<()> {
        self.tm.abort(self);
        Ok(())
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        let active = self.state.rl().status == TxStatus::Active;
        if active {
            self.tm.abort(self);
        }
    }
}

impl fmt::Display for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tx_{}", self.id)
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}
