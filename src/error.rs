// Archive Errors - typed failures at the storage seams
//
// Engines above the storage layer work in anyhow::Result; the object store,
// warehouse and source adapters return ArchiveError so the retry policy can
// tell a flaky dependency from a permanent one.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ArchiveError {
    /// Network blip, rate limit, busy database - worth retrying
    #[error("transient failure during {operation}: {message}")]
    Transient { operation: String, message: String },

    /// Object or table the caller expected is missing
    #[error("not found: {0}")]
    NotFound(String),

    /// Snapshot could not be created; deletion must not proceed
    #[error("snapshot of {table} FY{fiscal_year} failed: {message}")]
    Snapshot {
        table: String,
        fiscal_year: i32,
        message: String,
    },

    #[error("{table}: illegal deletion transition {from} -> {to}")]
    IllegalTransition {
        table: String,
        from: String,
        to: String,
    },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ArchiveError {
    pub fn transient(operation: impl Into<String>, message: impl Into<String>) -> Self {
        ArchiveError::Transient {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Whether retrying the same operation at the unit boundary can succeed
    pub fn is_transient(&self) -> bool {
        match self {
            ArchiveError::Transient { .. } => true,
            ArchiveError::Sqlite(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            ArchiveError::Io(err) => matches!(
                err.kind(),
                std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::WouldBlock
            ),
            _ => false,
        }
    }
}

pub type ArchiveResult<T> = Result<T, ArchiveError>;
