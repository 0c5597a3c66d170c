use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
};

use log::debug;

use crate::{
    btree::{page::Page, pager::Pager},
    error::DbError,
    journal::{self, JournalEntry},
    transaction::{
        tx::{Transaction, TxState},
        TxStatus,
    },
    types::{DbResult, PageIndex},
    utils::HandyRwLock,
};

struct VersionMap {
    pages: HashMap<PageIndex, u64>,
    header: u64,
}

/// Serializes commits and tracks per-page versions for optimistic
/// concurrency. A transaction may commit only if nothing it read has
/// been republished since; the commit itself runs the journal → apply →
/// flush → unlink pipeline while holding the manager lock.
pub struct TransactionManager {
    pager: Arc<Pager>,
    journal_enabled: bool,
    next_tx_id: AtomicU64,
    versions: Mutex<VersionMap>,
}

impl TransactionManager {
    pub fn new(pager: Arc<Pager>, journal_enabled: bool) -> Self {
        Self {
            pager,
            journal_enabled,
            next_tx_id: AtomicU64::new(1),
            versions: Mutex::new(VersionMap {
                pages: HashMap::new(),
                header: 0,
            }),
        }
    }

    pub fn begin(self: &Arc<Self>) -> Transaction {
        let id = self.next_tx_id.fetch_add(1, Ordering::Relaxed);
        debug!("begin tx_{}", id);
        Transaction::new(id, Arc::clone(&self.pager), Arc::clone(self))
    }

    pub fn page_version(&self, index: PageIndex) -> u64 {
        let versions = self.versions.lock().unwrap();
        versions.pages.get(&index).copied().unwrap_or(0)
    }

    pub fn header_version(&self) -> u64 {
        self.versions.lock().unwrap().header
    }

    pub(crate) fn abort(&self, tx: &Transaction) {
        let mut state = tx.state.wl();
        if state.status != TxStatus::Active {
            return;
        }
        state.status = TxStatus::Aborted;
        state.read_set.clear();
        state.write_set.clear();
        state.header = None;
        debug!("abort {}", tx);
    }

    pub(crate) fn commit(&self, tx: &Transaction) -> DbResult<()> {
        let mut state = tx.state.wl();
        if state.status != TxStatus::Active {
            return Err(DbError::validation("transaction is not active"));
        }

        let versions = self.versions.lock().unwrap();
        if let Err(e) = Self::validate(&versions, &state) {
            drop(versions);
            state.status = TxStatus::Aborted;
            state.read_set.clear();
            state.write_set.clear();
            state.header = None;
            return Err(e);
        }

        let read_only = state.write_set.is_empty() && !state.header_modified && !state.ddl_change;
        if read_only {
            state.status = TxStatus::Committed;
            debug!("commit {} (read-only fast path)", tx);
            return Ok(());
        }

        self.publish(versions, &mut state, tx)
    }

    fn validate(versions: &VersionMap, state: &TxState) -> DbResult<()> {
        for (&index, &observed) in &state.read_set {
            let current = versions.pages.get(&index).copied().unwrap_or(0);
            if current > observed {
                return Err(DbError::TxConflict { page: index });
            }
        }
        if let Some(observed) = state.header_read_version {
            if versions.header > observed {
                return Err(DbError::TxConflict { page: 0 });
            }
        }
        Ok(())
    }

    /// Phases 1-5 of the commit pipeline. Failures before the journal
    /// is finalized abort cleanly; failures after it panic so that the
    /// next open rolls the half-applied commit back.
    fn publish(
        &self,
        mut versions: std::sync::MutexGuard<'_, VersionMap>,
        state: &mut TxState,
        tx: &Transaction,
    ) -> DbResult<()> {
        let shared_total = self.pager.total_pages();

        // phase 1+2: build and finalize the journal. A failure here is
        // still clean: abort the transaction and drop the partial file.
        if self.journal_enabled {
            if let Err(e) = self.build_journal(state, shared_total) {
                let _ = std::fs::remove_file(journal::journal_path(self.pager.path()));
                state.status = TxStatus::Aborted;
                state.read_set.clear();
                state.write_set.clear();
                state.header = None;
                return Err(e);
            }
        }

        // phase 3: publish the write set and bump versions
        let mut pages: Vec<(PageIndex, Arc<Page>)> = Vec::with_capacity(state.write_set.len());
        let mut new_total = shared_total;
        for (index, pod) in state.write_set.drain() {
            let page = match Arc::try_unwrap(pod) {
                Ok(lock) => lock.into_inner().unwrap(),
                Err(pod) => pod.rl().clone(),
            };
            new_total = new_total.max(index + 1);
            pages.push((index, Arc::new(page)));
        }
        for (index, _) in &pages {
            *versions.pages.entry(*index).or_insert(0) += 1;
        }
        let new_header = if state.header_modified {
            versions.header += 1;
            state.header
        } else {
            None
        };

        // phase 4: flush. Past the journal's commitment this must not
        // fail in-process; dying here leaves the journal for recovery.
        if let Err(e) = self.pager.apply_commit(&pages, new_header, new_total) {
            panic!("fatal: flush failed mid-commit, restart to recover: {}", e);
        }

        // phase 5: the commit point
        if self.journal_enabled {
            if let Err(e) = journal::remove_journal(self.pager.path()) {
                panic!("fatal: could not delete journal, restart to recover: {}", e);
            }
        }

        state.status = TxStatus::Committed;
        state.header = None;
        state.read_set.clear();
        debug!("commit {} ({} pages)", tx, pages.len());
        Ok(())
    }

    fn build_journal(&self, state: &TxState, shared_total: u32) -> DbResult<()> {
        let mut indices: Vec<PageIndex> = state
            .write_set
            .keys()
            .copied()
            .filter(|&i| i < shared_total)
            .collect();
        indices.sort_unstable();
        let mut entries = Vec::with_capacity(indices.len());
        for index in indices {
            entries.push(JournalEntry {
                page_index: index,
                body: self.pager.page_body_bytes(index)?,
            });
        }
        let header_preimage = if state.header_modified {
            Some(self.pager.header().marshal()?)
        } else {
            None
        };
        journal::write_journal(self.pager.path(), header_preimage.as_deref(), &entries)
    }
}
