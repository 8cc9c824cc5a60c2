use thiserror::Error;

pub type StoreResult<T> = Result<T, StoreError>;

/// Failures surfaced by the store. Domain rejections are distinct variants so
/// callers can map them to specific responses; everything else is a backend
/// failure.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not a participant of this conversation")]
    NotAParticipant,

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("edit window has expired")]
    EditWindowExpired,

    #[error("message has been deleted")]
    MessageDeleted,

    #[error("invalid request: {0}")]
    Invalid(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("corrupt row: {0}")]
    Corrupt(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl StoreError {
    pub fn forbidden(reason: impl Into<String>) -> Self {
        Self::Forbidden(reason.into())
    }

    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::Invalid(reason.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    /// True when a write lost a race on a UNIQUE/PRIMARY KEY constraint.
    /// Foreign key, NOT NULL and CHECK failures are not races.
    pub fn is_unique_violation(&self) -> bool {
        matches!(
            self,
            Self::Database(rusqlite::Error::SqliteFailure(e, _))
                if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                    || e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
        )
    }

    /// True when another handle held the write lock past the busy timeout.
    pub fn is_busy(&self) -> bool {
        matches!(
            self,
            Self::Database(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::DatabaseBusy
        )
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        Self::Corrupt(format!("json column: {}", e))
    }
}
