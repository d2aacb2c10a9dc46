//! Error taxonomy shared by the manifest store, the index and the sync engine.

use std::path::{Path, PathBuf};

use rusqlite::ErrorCode;
use thiserror::Error;

pub(crate) type Result<T> = std::result::Result<T, VaultError>;

#[derive(Debug, Error)]
pub(crate) enum VaultError {
    /// Filesystem failure, surfaced verbatim with the path involved.
    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Recovery was attempted and exhausted.
    #[error("corrupt: {0}")]
    Corrupt(String),

    #[error("not found: {what}")]
    NotFound { what: String },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid: {0}")]
    Validation(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Non-success status returned by the sync server.
    #[error("http {status}: {message}")]
    Http { status: u16, message: String },

    /// The request never produced a response (DNS, connect, timeout).
    #[error("transport: {0}")]
    Transport(String),
}

impl VaultError {
    pub(crate) fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    pub(crate) fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub(crate) fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. } | Self::Http { status: 404, .. })
    }

    /// SQLite reported a lock held by another connection.
    pub(crate) fn is_busy(&self) -> bool {
        matches!(
            sqlite_code(self),
            Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
        )
    }

    /// The index file is damaged beyond what SQLite can read.
    pub(crate) fn is_corruption(&self) -> bool {
        matches!(self, Self::Corrupt(_))
            || matches!(
                sqlite_code(self),
                Some(ErrorCode::DatabaseCorrupt | ErrorCode::NotADatabase)
            )
    }

    /// HTTP status used by the sync server when this error escapes a handler.
    pub(crate) fn http_status(&self) -> u16 {
        match self {
            Self::Validation(_) | Self::Json(_) => 400,
            Self::Unauthorized(_) => 401,
            Self::NotFound { .. } => 404,
            Self::Conflict(_) => 409,
            Self::Http { status, .. } => *status,
            _ => 500,
        }
    }
}

fn sqlite_code(err: &VaultError) -> Option<ErrorCode> {
    match err {
        VaultError::Sqlite(rusqlite::Error::SqliteFailure(inner, _)) => Some(inner.code),
        _ => None,
    }
}

/// Attach a path to a bare `std::io::Result`.
pub(crate) trait IoContext<T> {
    fn at(self, path: impl AsRef<Path>) -> Result<T>;
}

impl<T> IoContext<T> for std::io::Result<T> {
    fn at(self, path: impl AsRef<Path>) -> Result<T> {
        self.map_err(|source| VaultError::io(path, source))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_sqlite_codes() {
        let busy = VaultError::Sqlite(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        ));
        assert!(busy.is_busy());
        assert!(!busy.is_corruption());

        let notadb = VaultError::Sqlite(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_NOTADB),
            None,
        ));
        assert!(notadb.is_corruption());
    }

    #[test]
    fn maps_http_status() {
        assert_eq!(VaultError::invalid("x").http_status(), 400);
        assert_eq!(VaultError::not_found("project p").http_status(), 404);
        assert_eq!(VaultError::Conflict("v".into()).http_status(), 409);
        assert!(VaultError::Http { status: 404, message: String::new() }.is_not_found());
    }

    #[test]
    fn io_error_keeps_path() {
        let err = std::fs::read("/definitely/not/here").at("/definitely/not/here");
        let msg = err.unwrap_err().to_string();
        assert!(msg.starts_with("/definitely/not/here: "));
    }
}
