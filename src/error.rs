//! Typed errors for the memory core.
//!
//! [`BackendError`] is what the storage traits return; [`MemoryError`] is what
//! callers of the Tiered Store and Retrieval Coordinator see. Per-item migration
//! failures and degraded health stages are recorded as report values instead.

use serde::Serialize;
use thiserror::Error;

use crate::memory::types::Memory;

/// Which physical backend an operation touched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Relational,
    Vector,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Relational => "relational",
            Self::Vector => "vector",
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Retry classification of a backend failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendErrorKind {
    /// Connection refused, timeout, reset, busy/locked database.
    Transient,
    /// The backend asked us to slow down.
    RateLimited,
    /// Anything else: constraint violations, malformed SQL, poisoned locks.
    Permanent,
}

#[derive(Debug, Clone, Error)]
#[error("{backend} backend error ({kind:?}): {message}")]
pub struct BackendError {
    pub backend: BackendKind,
    pub kind: BackendErrorKind,
    pub message: String,
}

impl BackendError {
    pub fn new(backend: BackendKind, kind: BackendErrorKind, message: impl Into<String>) -> Self {
        Self {
            backend,
            kind,
            message: message.into(),
        }
    }

    pub fn transient(backend: BackendKind, message: impl Into<String>) -> Self {
        Self::new(backend, BackendErrorKind::Transient, message)
    }

    pub fn permanent(backend: BackendKind, message: impl Into<String>) -> Self {
        Self::new(backend, BackendErrorKind::Permanent, message)
    }

    /// Transient and rate-limited failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind,
            BackendErrorKind::Transient | BackendErrorKind::RateLimited
        )
    }

    /// Classify a rusqlite error for the given backend.
    pub fn from_sqlite(backend: BackendKind, err: rusqlite::Error) -> Self {
        use rusqlite::ErrorCode;

        let kind = match &err {
            rusqlite::Error::SqliteFailure(e, _) => match e.code {
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked | ErrorCode::CannotOpen => {
                    BackendErrorKind::Transient
                }
                _ => BackendErrorKind::Permanent,
            },
            _ => BackendErrorKind::Permanent,
        };
        Self::new(backend, kind, err.to_string())
    }
}

pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// Errors surfaced to callers of the memory core.
#[derive(Debug, Error)]
pub enum MemoryError {
    /// Malformed input, rejected before any backend call. Never retried.
    #[error("validation error: {0}")]
    Validation(String),

    /// A backend stayed unreachable after the retry policy gave up.
    #[error("{backend} backend unavailable after {attempts} attempt(s): {message}")]
    BackendUnavailable {
        backend: BackendKind,
        attempts: u32,
        message: String,
    },

    /// One backend accepted the write and the other did not.
    ///
    /// `written` lists the backends holding a durable copy; retry only `failed`.
    /// For a store, `memory` is the record as written, ready to pass to
    /// `TieredStore::retry_write`. Deletes carry `None`.
    #[error("partial write for memory {memory_id}: {failed} failed ({message})")]
    PartialWrite {
        memory_id: String,
        memory: Option<Box<Memory>>,
        written: Vec<BackendKind>,
        failed: BackendKind,
        message: String,
    },

    #[error("memory not found: {0}")]
    NotFound(String),

    #[error("embedding failed: {0}")]
    Embedding(String),

    /// A non-retryable backend failure.
    #[error(transparent)]
    Backend(#[from] BackendError),
}

impl MemoryError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// The backend this error is about, if any.
    pub fn backend(&self) -> Option<BackendKind> {
        match self {
            Self::BackendUnavailable { backend, .. } => Some(*backend),
            Self::PartialWrite { failed, .. } => Some(*failed),
            Self::Backend(e) => Some(e.backend),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, MemoryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn busy_database_is_transient() {
        let err = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            Some("database is locked".into()),
        );
        let classified = BackendError::from_sqlite(BackendKind::Relational, err);
        assert_eq!(classified.kind, BackendErrorKind::Transient);
        assert!(classified.is_retryable());
    }

    #[test]
    fn constraint_violation_is_permanent() {
        let err = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_CONSTRAINT),
            None,
        );
        let classified = BackendError::from_sqlite(BackendKind::Vector, err);
        assert_eq!(classified.kind, BackendErrorKind::Permanent);
        assert!(!classified.is_retryable());
        assert_eq!(classified.backend, BackendKind::Vector);
    }

    #[test]
    fn partial_write_names_failed_backend() {
        let err = MemoryError::PartialWrite {
            memory_id: "m1".into(),
            memory: None,
            written: vec![BackendKind::Relational],
            failed: BackendKind::Vector,
            message: "timeout".into(),
        };
        assert_eq!(err.backend(), Some(BackendKind::Vector));
        assert!(err.to_string().contains("vector failed"));
    }
}
