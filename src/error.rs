//! Engine-wide error types.
//!
//! All fallible operations in this crate return [`Result`]. Integrity
//! conflicts are carried as dedicated structs ([`ReadIntegrityError`],
//! [`WriteClashError`]) so that callers can inspect the conflicting values
//! and resolve them through the transaction's resolution methods.

use std::fmt;

use serde_json::Value;
use thiserror::Error;

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

/// The three advisory lock scopes exposed by a persistence adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockKind {
    /// Serializes transaction directory enumeration.
    Global,
    /// Guards one transaction's persisted state.
    Transaction,
    /// Guards one fateful object during commit.
    Object,
}

impl fmt::Display for LockKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockKind::Global => write!(f, "global"),
            LockKind::Transaction => write!(f, "transaction"),
            LockKind::Object => write!(f, "object"),
        }
    }
}

/// An attribute this transaction read was changed externally.
///
/// Raised during integrity verification when the live value of an attribute
/// no longer matches the value the transaction last read and the transaction
/// did not write the attribute itself. Resolvable via
/// `Transaction::ignore_read_conflict` followed by a retry of the original
/// call.
#[derive(Debug, Clone, Error, PartialEq)]
#[error(
    "attribute '{attribute}' of {object_key} was changed externally: last read {last_read_value}, now {external_value}"
)]
pub struct ReadIntegrityError {
    pub object_key: String,
    pub attribute: String,
    pub last_read_value: Value,
    pub external_value: Value,
}

/// An attribute this transaction wrote was also changed externally.
///
/// Resolvable via `Transaction::keep_ours` (keep the transaction's value) or
/// `Transaction::use_theirs` (discard the transaction's change).
#[derive(Debug, Clone, Error, PartialEq)]
#[error(
    "attribute '{attribute}' of {object_key} was changed externally while this transaction also wrote it: ours {our_value}, theirs {external_value}"
)]
pub struct WriteClashError {
    pub object_key: String,
    pub attribute: String,
    pub our_value: Value,
    pub external_value: Value,
}

/// Top-level error type for the transaction engine.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed or missing class/engine configuration. Never recoverable
    /// inside a transaction.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Persistence adapter contract violation or unrecoverable store state.
    #[error("persistence error: {0}")]
    Persistence(String),

    /// A non-suspending lock acquisition failed. Recoverable by retrying.
    #[error("{kind} lock '{name}' could not be acquired")]
    Lock { kind: LockKind, name: String },

    /// Read-set revalidation detected external interference on a read
    /// attribute.
    #[error(transparent)]
    ReadIntegrity(#[from] ReadIntegrityError),

    /// Read-set revalidation detected external interference on a written
    /// attribute.
    #[error(transparent)]
    WriteClash(#[from] WriteClashError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Returns true for conflicts the user may resolve and retry
    /// (read-integrity and write-clash errors).
    pub fn is_integrity_conflict(&self) -> bool {
        matches!(self, Error::ReadIntegrity(_) | Error::WriteClash(_))
    }

    /// Returns true for non-suspending lock failures.
    pub fn is_lock_failure(&self) -> bool {
        matches!(self, Error::Lock { .. })
    }

    pub(crate) fn configuration(message: impl Into<String>) -> Self {
        Error::Configuration(message.into())
    }

    pub(crate) fn persistence(message: impl Into<String>) -> Self {
        Error::Persistence(message.into())
    }
}
