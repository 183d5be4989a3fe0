use strata::errors::{IndexError, StorageError};
use strata::lock_manager::LockError;
use strata::transaction::TxnError;
use thiserror::Error;

use crate::types::DataType;

/// The engine-level error taxonomy. Low layers return their own typed
/// errors; everything except `PageFull` (recovered inside the heap) bubbles
/// up through here to the statement boundary.
#[derive(Debug, Error)]
pub enum DbError {
    // Storage
    #[error(transparent)]
    Storage(#[from] StorageError),

    // Index
    #[error(transparent)]
    Index(#[from] IndexError),

    #[error("value of type {found} cannot be used with a {expected} index")]
    KeyTypeMismatch { expected: DataType, found: String },

    #[error("NULL values cannot be indexed")]
    NullKey,

    #[error("NaN values cannot be indexed")]
    NanKey,

    // Transactions
    #[error(transparent)]
    Txn(#[from] TxnError),

    #[error("deadlock detected; transaction aborted")]
    DeadlockAborted,

    #[error("lock wait timed out")]
    LockTimeout,

    // Schema / values
    #[error("type mismatch for column '{column}': expected {expected}, got {found}")]
    TypeMismatch {
        column: String,
        expected: DataType,
        found: String,
    },

    #[error("column '{0}' does not allow NULL")]
    NullViolation(String),

    #[error("expected {expected} values, got {found}")]
    ArityMismatch { expected: usize, found: usize },

    #[error("unknown column '{0}'")]
    UnknownColumn(String),

    #[error("duplicate column name '{0}'")]
    DuplicateColumn(String),

    #[error("a table may have at most {max} columns, got {found}")]
    TooManyColumns { max: usize, found: usize },

    #[error("string of {0} bytes exceeds the 65535-byte limit")]
    StringTooLong(usize),

    #[error("stored tuple is malformed: {0}")]
    CorruptTuple(String),

    // Catalog
    #[error("unknown table '{0}'")]
    UnknownTable(String),

    #[error("table '{0}' already exists")]
    DuplicateTable(String),

    #[error("unknown index '{0}'")]
    UnknownIndex(String),

    #[error("index '{0}' already exists")]
    DuplicateIndex(String),

    #[error("catalog file is corrupt: {0}")]
    CorruptCatalog(String),

    #[error("no row at rid {0}")]
    RowNotFound(strata::Rid),

    // Cancellation
    #[error("statement cancelled")]
    Cancelled,
}

impl From<LockError> for DbError {
    fn from(err: LockError) -> Self {
        match err {
            LockError::Deadlock => DbError::DeadlockAborted,
            LockError::Timeout => DbError::LockTimeout,
        }
    }
}

impl From<serde_json::Error> for DbError {
    fn from(err: serde_json::Error) -> Self {
        DbError::CorruptCatalog(err.to_string())
    }
}

pub type DbResult<T> = Result<T, DbError>;
