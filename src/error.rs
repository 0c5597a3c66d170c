use crate::types::PageIndex;

/// The crate-wide error type. Variants map one-to-one onto the failure
/// kinds the engine can surface to a caller; anything that goes wrong
/// after the rollback journal has been finalized is fatal and panics
/// instead, so that the next open replays the journal.
#[derive(thiserror::Error, Debug)]
pub enum DbError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("duplicate key: {0}")]
    DuplicateKey(String),

    #[error("validation: {0}")]
    Validation(String),

    #[error("io error")]
    Io(#[from] std::io::Error),

    #[error("corrupt database file: {0}")]
    CorruptFile(String),

    #[error("corrupt journal: {0}")]
    CorruptJournal(String),

    #[error("page index {index} out of range, database has {total} pages")]
    PageIndexOutOfRange { index: PageIndex, total: u32 },

    #[error("transaction conflict on page {page}")]
    TxConflict { page: PageIndex },

    #[error("operation cancelled")]
    Cancelled,

    #[error("unsupported: {0}")]
    Unsupported(String),
}

impl DbError {
    pub fn not_found(what: impl Into<String>) -> Self {
        DbError::NotFound(what.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        DbError::Validation(msg.into())
    }

    pub fn corrupt(msg: impl Into<String>) -> Self {
        DbError::CorruptFile(msg.into())
    }
}
