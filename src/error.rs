//! # Error Types
//!
//! Structured error handling for the messaging core using thiserror.
//! Every error carries a [`ErrorKind`] so callers branch on kind
//! (duplicate vs transient vs fatal) rather than matching concrete
//! variants or string contents.

use thiserror::Error;
use uuid::Uuid;

/// Coarse classification used by retry and idempotency decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The envelope id is already persisted; treat as "already seen".
    Duplicate,
    /// Connectivity, lock timeout, pool exhaustion; retry with backoff.
    Transient,
    /// Misconfiguration, schema drift, or a bug; do not retry.
    Fatal,
}

/// Errors produced by the messaging core.
#[derive(Error, Debug)]
pub enum CourierError {
    #[error("duplicate envelope: {id} already stored")]
    DuplicateEnvelope { id: Uuid },

    #[error("transient storage failure: {message}")]
    Transient { message: String },

    #[error("storage operation failed: {operation}: {message}")]
    Storage { operation: String, message: String },

    #[error("configuration error: {message}")]
    Configuration { message: String },

    #[error("schema drift detected: {detail}")]
    SchemaDrift { detail: String },

    #[error("invalid state: {message}")]
    InvalidState { message: String },
}

impl CourierError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CourierError::DuplicateEnvelope { .. } => ErrorKind::Duplicate,
            CourierError::Transient { .. } => ErrorKind::Transient,
            CourierError::Storage { .. }
            | CourierError::Configuration { .. }
            | CourierError::SchemaDrift { .. }
            | CourierError::InvalidState { .. } => ErrorKind::Fatal,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        self.kind() == ErrorKind::Duplicate
    }

    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }

    /// Create a storage error tagged with the failing operation.
    pub fn storage(operation: impl Into<String>, message: impl std::fmt::Display) -> Self {
        CourierError::Storage {
            operation: operation.into(),
            message: message.to_string(),
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        CourierError::Configuration {
            message: message.into(),
        }
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        CourierError::InvalidState {
            message: message.into(),
        }
    }
}

/// Map sqlx failures onto the taxonomy. Unique-violation (SQLSTATE 23505)
/// becomes the duplicate condition; connection-class failures are transient.
/// The envelope id is not recoverable from the driver error, so duplicate
/// mapping at call sites that know the id should prefer
/// [`map_insert_error`].
impl From<sqlx::Error> for CourierError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db) if db.code().as_deref() == Some("23505") => {
                CourierError::DuplicateEnvelope { id: Uuid::nil() }
            }
            sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed
            | sqlx::Error::Io(_) => CourierError::Transient {
                message: err.to_string(),
            },
            _ => CourierError::Storage {
                operation: "sqlx".to_string(),
                message: err.to_string(),
            },
        }
    }
}

/// Like the `From<sqlx::Error>` impl, but attributes unique violations to a
/// known envelope id.
pub fn map_insert_error(id: Uuid, err: sqlx::Error) -> CourierError {
    if let sqlx::Error::Database(db) = &err {
        if db.code().as_deref() == Some("23505") {
            return CourierError::DuplicateEnvelope { id };
        }
    }
    err.into()
}

pub type Result<T> = std::result::Result<T, CourierError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_kind_is_duplicate() {
        let err = CourierError::DuplicateEnvelope { id: Uuid::new_v4() };
        assert_eq!(err.kind(), ErrorKind::Duplicate);
        assert!(err.is_duplicate());
        assert!(!err.is_transient());
    }

    #[test]
    fn transient_and_fatal_classification() {
        assert_eq!(
            CourierError::Transient {
                message: "connection reset".into()
            }
            .kind(),
            ErrorKind::Transient
        );
        assert_eq!(
            CourierError::storage("store_incoming", "boom").kind(),
            ErrorKind::Fatal
        );
        assert_eq!(
            CourierError::configuration("bad url").kind(),
            ErrorKind::Fatal
        );
    }

    #[test]
    fn pool_timeout_maps_to_transient() {
        let err: CourierError = sqlx::Error::PoolTimedOut.into();
        assert!(err.is_transient());
    }
}
