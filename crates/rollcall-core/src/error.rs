use thiserror::Error;

/// Errors surfaced by the rollcall core to its callers.
///
/// A [`RollcallError::Persistence`] is always distinct from an `Unknown`
/// decision: callers must never read a storage outage as "nobody present".
#[derive(Error, Debug)]
pub enum RollcallError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("identity not found: {0}")]
    NotFound(String),
    #[error("dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },
    #[error("persistence failure during {op}: {source}")]
    Persistence {
        op: &'static str,
        #[source]
        source: StorageError,
    },
}

/// Errors raised by a [`Storage`](crate::storage::Storage) backend.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt record: {0}")]
    Corrupt(String),
    #[error("transient storage failure: {0}")]
    Transient(String),
}

impl StorageError {
    /// Whether a retry has a reasonable chance of succeeding.
    ///
    /// SQLite reports writer contention as BUSY/LOCKED; everything else
    /// (constraint violations, corrupt rows, I/O errors) is treated as fatal.
    pub fn is_transient(&self) -> bool {
        match self {
            StorageError::Transient(_) => true,
            StorageError::Sqlite(rusqlite::Error::SqliteFailure(e, _)) => matches!(
                e.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, RollcallError>;
