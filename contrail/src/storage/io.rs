//! Raw storage abstraction.
//!
//! This module provides the `RawStorage` trait: a byte store keyed by
//! hierarchical identifiers. Everything above it (objects, entities,
//! revisions, B-tree pages) is ultimately a set of values under
//! identifiers in one of these stores.
//!
//! # Design
//!
//! The trait is a minimal abstraction over:
//! - value get/put/delete
//! - listing the immediate children of an identifier
//! - atomic create-if-absent with a bounded wait, the one blocking primitive
//!   every lock in the system is built on
//! - flushing pending writes
//!
//! Backends: [`MemoryStorage`](crate::storage::MemoryStorage) for tests and
//! embedded use, [`FileStorage`](crate::storage::FileStorage) for a durable
//! directory tree.

use std::time::Duration;

use crate::types::{Identifier, InvalidIdentifier};

/// Errors that can occur in the storage layers.
#[derive(Debug)]
pub enum StorageError {
    /// I/O error.
    Io(std::io::Error),
    /// Persisted data violates an expected invariant.
    Corruption(String),
    /// Encoding or decoding a value failed.
    Serialization(String),
    /// A stored value has a different type than the one requested.
    TypeMismatch {
        id: Identifier,
        expected: String,
        found: String,
    },
    /// A std lock was poisoned by a panicking thread.
    LockPoisoned,
    /// A lock could not be acquired, even after breaking the previous lease.
    Locked { id: Identifier },
    /// A lock was released by a process that does not hold it.
    NotLockOwner {
        id: Identifier,
        process_id: String,
    },
    /// A mutation was attempted through a read-only session.
    ReadOnly { revision: u64 },
    /// Another revision committed after this session's snapshot and touched
    /// the same identifiers.
    ConflictingCommit { revision: u64 },
    /// The session has already committed or been closed.
    SessionClosed { session_id: String },
    /// The requested revision does not exist or is being cleaned up.
    RevisionNotFound(u64),
    /// A path could not be turned into an identifier.
    InvalidIdentifier(InvalidIdentifier),
}

impl StorageError {
    /// Whether retrying the whole session may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Locked { .. } | Self::ConflictingCommit { .. })
    }

    /// Whether the error indicates damaged persisted state.
    #[must_use]
    pub const fn is_corruption(&self) -> bool {
        matches!(self, Self::Corruption(_) | Self::TypeMismatch { .. })
    }

    /// Build a corruption error from anything printable.
    pub fn corruption(message: impl Into<String>) -> Self {
        Self::Corruption(message.into())
    }
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::Corruption(msg) => write!(f, "corruption: {msg}"),
            Self::Serialization(msg) => write!(f, "serialization error: {msg}"),
            Self::TypeMismatch {
                id,
                expected,
                found,
            } => write!(f, "object {id} has type '{found}', expected '{expected}'"),
            Self::LockPoisoned => write!(f, "lock poisoned"),
            Self::Locked { id } => write!(f, "database is locked ({id})"),
            Self::NotLockOwner { id, process_id } => {
                write!(f, "internal error: {process_id} does not hold lock {id}")
            }
            Self::ReadOnly { revision } => {
                write!(f, "session at revision {revision} is read-only")
            }
            Self::ConflictingCommit { revision } => write!(
                f,
                "revision {revision} conflicts with a revision committed after it started"
            ),
            Self::SessionClosed { session_id } => write!(f, "session {session_id} is closed"),
            Self::RevisionNotFound(revision) => write!(f, "revision {revision} not found"),
            Self::InvalidIdentifier(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for StorageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::InvalidIdentifier(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for StorageError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<InvalidIdentifier> for StorageError {
    fn from(e: InvalidIdentifier) -> Self {
        Self::InvalidIdentifier(e)
    }
}

impl From<bincode::Error> for StorageError {
    fn from(e: bincode::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for StorageError {
    fn from(_: std::sync::PoisonError<T>) -> Self {
        Self::LockPoisoned
    }
}

/// Byte storage keyed by hierarchical identifiers.
///
/// # Implementation Notes
///
/// Implementations must ensure:
/// - `get` returns the last value `put` (or created) under the identifier
/// - `list_children` returns only immediate children that hold a value
/// - `create_if_absent` is atomic: of several racing creators exactly one
///   observes `true`
/// - `delete` of a missing identifier is not an error
/// - `flush` makes all previous writes durable
pub trait RawStorage: Send + Sync {
    /// Read the value stored under `id`.
    fn get(&self, id: &Identifier) -> Result<Option<Vec<u8>>, StorageError>;

    /// Store `bytes` under `id`, replacing any previous value.
    fn put(&self, id: &Identifier, bytes: &[u8]) -> Result<(), StorageError>;

    /// Remove the value stored under `id`.
    fn delete(&self, id: &Identifier) -> Result<(), StorageError>;

    /// Immediate children of `id` that currently hold a value.
    fn list_children(&self, id: &Identifier) -> Result<Vec<Identifier>, StorageError>;

    /// Store `bytes` under `id` only if nothing is stored there.
    ///
    /// If a value exists, waits up to `wait` for it to be deleted before
    /// giving up. Returns whether this call created the value.
    fn create_if_absent(
        &self,
        id: &Identifier,
        bytes: &[u8],
        wait: Duration,
    ) -> Result<bool, StorageError>;

    /// Make all previous writes durable.
    fn flush(&self) -> Result<(), StorageError>;

    /// Release backend resources. Further calls may fail.
    fn close(&self) -> Result<(), StorageError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let id = Identifier::new("root/lockfolder/lock").expect("valid identifier");
        assert_eq!(
            StorageError::Locked { id }.to_string(),
            "database is locked (root/lockfolder/lock)"
        );
        assert_eq!(
            StorageError::RevisionNotFound(4).to_string(),
            "revision 4 not found"
        );
    }

    #[test]
    fn test_error_classification() {
        assert!(StorageError::ConflictingCommit { revision: 2 }.is_retryable());
        assert!(!StorageError::ReadOnly { revision: 2 }.is_retryable());
        assert!(StorageError::corruption("missing page").is_corruption());
        assert!(!StorageError::LockPoisoned.is_corruption());
    }
}
