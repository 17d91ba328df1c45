//! Storage layer error types
//!
//! All errors that can occur during storage operations are defined here.
//! Messages name the database, branch or digest involved but never an
//! on-disk path.

use std::fmt;
use std::io;

use thiserror::Error;

use crate::storage::types::{
    BlobId, BranchName, CommitId, DatabaseName, InvalidDigestError, InvalidNameError, TreeId,
};

/// Coarse classification every error maps onto.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// missing or malformed input, the caller's fault
    BadInput,
    /// a referenced database, branch or object is absent
    NotFound,
    /// a branch name collision
    Conflict,
    /// storage I/O, encoding or integrity failure
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::BadInput => "bad input",
            ErrorKind::NotFound => "not found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Internal => "internal",
        };
        f.write_str(s)
    }
}

/// the main error type for storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    /// no branch table has ever been published for this database
    #[error("database not found: {0}")]
    DatabaseNotFound(DatabaseName),

    /// the branch is absent from the database's branch table
    #[error("branch not found: {branch} (database {database})")]
    BranchNotFound {
        database: DatabaseName,
        branch: BranchName,
    },

    /// the branch already exists
    #[error("branch already exists: {branch} (database {database})")]
    BranchAlreadyExists {
        database: DatabaseName,
        branch: BranchName,
    },

    /// the commit was not found
    #[error("commit not found: {0}")]
    CommitNotFound(CommitId),

    /// the tree was not found
    #[error("tree not found: {0}")]
    TreeNotFound(TreeId),

    /// the blob was not found
    #[error("blob not found: {0}")]
    BlobNotFound(BlobId),

    /// invalid database, branch or signature text
    #[error("invalid name: {0}")]
    InvalidName(#[from] InvalidNameError),

    /// a string that should have been a digest
    #[error("{0}")]
    InvalidDigest(#[from] InvalidDigestError),

    /// JSON serialization or deserialization failed
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// stored data failed an integrity check
    #[error("corrupted object {id}: {reason}")]
    Corrupted { id: String, reason: String },

    /// filesystem failure
    #[error("io error while {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    /// the storage root has no format marker
    #[error("storage root is not initialized")]
    NotInitialized,

    /// the storage root was written with a different object encoding
    #[error("unsupported storage format version {found} (expected {expected})")]
    UnsupportedFormat { found: String, expected: u32 },

    /// internal error that shouldn't happen
    #[error("internal error: {0}")]
    Internal(String),
}

impl StorageError {
    /// wrap an io::Error with a short description of what was being done
    pub(crate) fn io(context: impl Into<String>, source: io::Error) -> Self {
        StorageError::Io {
            context: context.into(),
            source,
        }
    }

    /// build a `map_err` adapter for io results
    pub(crate) fn io_with(context: impl Into<String>) -> impl FnOnce(io::Error) -> Self {
        let context = context.into();
        move |source| StorageError::Io { context, source }
    }

    pub(crate) fn corrupted(id: impl fmt::Display, reason: impl Into<String>) -> Self {
        StorageError::Corrupted {
            id: id.to_string(),
            reason: reason.into(),
        }
    }

    /// the taxonomy kind of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            StorageError::DatabaseNotFound(_)
            | StorageError::BranchNotFound { .. }
            | StorageError::CommitNotFound(_)
            | StorageError::TreeNotFound(_)
            | StorageError::BlobNotFound(_) => ErrorKind::NotFound,
            StorageError::BranchAlreadyExists { .. } => ErrorKind::Conflict,
            StorageError::InvalidName(_) | StorageError::InvalidDigest(_) => ErrorKind::BadInput,
            StorageError::Serialization(_)
            | StorageError::Corrupted { .. }
            | StorageError::Io { .. }
            | StorageError::NotInitialized
            | StorageError::UnsupportedFormat { .. }
            | StorageError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// check if this error indicates the resource doesn't exist
    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    /// check if this error is a conflict
    pub fn is_conflict(&self) -> bool {
        self.kind() == ErrorKind::Conflict
    }
}

/// result type alias for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::types::Digest;

    #[test]
    fn test_error_classification() {
        let not_found = StorageError::DatabaseNotFound(DatabaseName::new("a.db").unwrap());
        assert!(not_found.is_not_found());
        assert!(!not_found.is_conflict());

        let conflict = StorageError::BranchAlreadyExists {
            database: DatabaseName::new("a.db").unwrap(),
            branch: BranchName::master(),
        };
        assert!(!conflict.is_not_found());
        assert!(conflict.is_conflict());

        let io = StorageError::io("reading blob", io::Error::from(io::ErrorKind::PermissionDenied));
        assert_eq!(io.kind(), ErrorKind::Internal);

        let bad = StorageError::from(InvalidNameError::Empty);
        assert_eq!(bad.kind(), ErrorKind::BadInput);
    }

    #[test]
    fn test_messages_name_the_object() {
        let id = CommitId::new(Digest::of(b"c"));
        let err = StorageError::CommitNotFound(id);
        assert!(err.to_string().contains(&id.to_string()));

        let err = StorageError::BranchNotFound {
            database: DatabaseName::new("a.db").unwrap(),
            branch: BranchName::new("dev").unwrap(),
        };
        assert_eq!(err.to_string(), "branch not found: dev (database a.db)");
    }
}
