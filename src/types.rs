use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, RwLock,
};

use crate::error::DbError;

/// A shared, lockable value.
pub type Pod<T> = Arc<RwLock<T>>;

pub type DbResult<T> = Result<T, DbError>;

/// 0-based index of a page inside the database file.
pub type PageIndex = u32;

/// Engine-assigned, monotonically increasing row identifier. Keys the
/// table B+Tree independently of any user-declared primary key.
pub type RowId = u64;

/// Sentinel for "no page" in sibling/overflow/free links. Page 0 holds
/// the database header and the schema table root, so it can never be the
/// target of a link.
pub const NO_PAGE: PageIndex = 0;

/// Cooperative cancellation handle. Cloned freely; long scans check it
/// between pages and between produced rows.
#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> DbResult<()> {
        if self.is_cancelled() {
            return Err(DbError::Cancelled);
        }
        Ok(())
    }
}
