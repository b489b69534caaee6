//! Error taxonomy surfaced by the session manager.

use sqlx::error::{DatabaseError, ErrorKind};
use sqlx::sqlite::SqliteError;
use thiserror::Error;

/// SQLSTATE for "string data, right truncation" (MySQL `Data too long`).
const SQLSTATE_STRING_TRUNCATION: &str = "22001";

/// Primary SQLite result codes for lock contention.
const SQLITE_BUSY: i32 = 5;
const SQLITE_LOCKED: i32 = 6;

#[derive(Debug, Error)]
pub enum StoreError {
    /// The backend could not be reached or no pooled connection became free in time.
    #[error("Database connection unavailable: {0}")]
    ConnectionUnavailable(String),
    /// A write was rejected because the data breaks a table constraint.
    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),
    /// Reserved for update/edit operations; delete is idempotent and never raises it.
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Database engine has been closed")]
    Closed,
    #[error("Database error: {0}")]
    Database(String),
}

impl StoreError {
    /// Stable machine-readable code for the error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            StoreError::ConnectionUnavailable(_) => "connection_unavailable",
            StoreError::ConstraintViolation(_) => "constraint_violation",
            StoreError::NotFound(_) => "not_found",
            StoreError::Closed => "closed",
            StoreError::Database(_) => "database",
        }
    }

    /// Whether retrying with a fresh connection might succeed.
    pub(crate) fn is_transient(err: &sqlx::Error) -> bool {
        matches!(
            err,
            sqlx::Error::Io(_)
                | sqlx::Error::Tls(_)
                | sqlx::Error::Protocol(_)
                | sqlx::Error::WorkerCrashed
        )
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::PoolTimedOut => StoreError::ConnectionUnavailable(
                "timed out waiting for a pooled connection".to_string(),
            ),
            sqlx::Error::PoolClosed => StoreError::Closed,
            e if StoreError::is_transient(e) => StoreError::ConnectionUnavailable(err.to_string()),
            sqlx::Error::Database(db_err) if is_lock_contention(&**db_err) => {
                StoreError::ConnectionUnavailable(db_err.message().to_string())
            }
            sqlx::Error::Database(db_err) => {
                let constraint = matches!(
                    db_err.kind(),
                    ErrorKind::UniqueViolation
                        | ErrorKind::ForeignKeyViolation
                        | ErrorKind::NotNullViolation
                        | ErrorKind::CheckViolation
                ) || db_err.code().as_deref() == Some(SQLSTATE_STRING_TRUNCATION);

                if constraint {
                    StoreError::ConstraintViolation(db_err.message().to_string())
                } else {
                    StoreError::Database(db_err.message().to_string())
                }
            }
            _ => StoreError::Database(err.to_string()),
        }
    }
}

/// SQLite reports a held lock as BUSY/LOCKED or one of their extended codes
/// (e.g. `SQLITE_BUSY_SNAPSHOT` = 517). The low byte is the primary code.
fn is_lock_contention(db_err: &dyn DatabaseError) -> bool {
    if db_err.try_downcast_ref::<SqliteError>().is_none() {
        return false;
    }
    db_err
        .code()
        .and_then(|code| code.parse::<i32>().ok())
        .map_or(false, |code| matches!(code & 0xff, SQLITE_BUSY | SQLITE_LOCKED))
}
