//! Hub API - the operations exposed to the network layer.
//!
//! Inputs arrive as raw strings (header or form values) and are validated
//! here; anything missing or malformed is `BadInput` before storage is
//! touched.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::info;

use crate::config::HubConfig;
use crate::storage::{
    BlobId, BranchName, BranchTable, Commit, CommitId, DatabaseName, ErrorKind, InvalidDigestError,
    InvalidNameError, Repository, StorageError,
};

/// Result type for hub operations.
pub type HubResult<T> = Result<T, HubError>;

/// Hub errors.
#[derive(Debug, Error)]
pub enum HubError {
    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("invalid {field}: {source}")]
    InvalidName {
        field: &'static str,
        #[source]
        source: InvalidNameError,
    },

    #[error("invalid commit reference: {0}")]
    InvalidReference(#[from] InvalidDigestError),

    #[error("invalid {field} timestamp '{value}'")]
    InvalidTimestamp { field: &'static str, value: String },

    #[error("upload too large: {size} bytes (max {max})")]
    TooLarge { size: usize, max: usize },

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl HubError {
    /// the taxonomy kind of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            HubError::Storage(e) => e.kind(),
            HubError::MissingField(_)
            | HubError::InvalidName { .. }
            | HubError::InvalidReference(_)
            | HubError::InvalidTimestamp { .. }
            | HubError::TooLarge { .. } => ErrorKind::BadInput,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    pub fn is_conflict(&self) -> bool {
        self.kind() == ErrorKind::Conflict
    }
}

/// Which version of a database to download.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Revision {
    /// the configured default branch
    #[default]
    DefaultBranch,
    /// the head of a named branch
    Branch(String),
    /// a specific commit, which must be in the database's history
    Commit(String),
}

/// A downloaded database file.
#[derive(Debug, Clone)]
pub struct Download {
    pub name: String,
    pub commit: CommitId,
    pub blob: BlobId,
    pub last_modified: DateTime<Utc>,
    pub bytes: Vec<u8>,
}

/// The hub service handle.
///
/// Thread-safe: clone it into every request handler.
#[derive(Debug, Clone)]
pub struct Hub {
    pub(super) repo: Repository,
    pub(super) config: Arc<HubConfig>,
}

impl Hub {
    /// Open (or initialize) the store named by the configuration.
    pub fn open(config: HubConfig) -> HubResult<Self> {
        let repo = Repository::open_or_init(&config.storage_dir)?;
        info!(
            default_branch = %config.default_branch,
            max_upload_bytes = config.max_upload_bytes,
            "hub opened"
        );
        Ok(Self::with_repository(repo, config))
    }

    /// Wrap an already opened repository.
    pub fn with_repository(repo: Repository, config: HubConfig) -> Self {
        Self {
            repo,
            config: Arc::new(config),
        }
    }

    pub fn repository(&self) -> &Repository {
        &self.repo
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    /// Create `new_branch` at the current head of `from_branch`.
    pub fn create_branch(&self, database: &str, from_branch: &str, new_branch: &str) -> HubResult<CommitId> {
        let database = database_name(database)?;
        let from = branch_name("from-branch", from_branch)?;
        let new = branch_name("new-branch", new_branch)?;

        Ok(self.repo.create_branch(&database, &from, &new)?)
    }

    /// History of a branch, head first.
    pub fn branch_history(&self, database: &str, branch: &str) -> HubResult<Vec<Commit>> {
        let database = database_name(database)?;
        let branch = branch_name("branch", branch)?;

        Ok(self.repo.history(&database, &branch)?)
    }

    /// Branch heads of a database.
    pub fn list_branches(&self, database: &str) -> HubResult<BranchTable> {
        let database = database_name(database)?;
        Ok(self.repo.list_branches(&database)?)
    }

    /// Names of every published database.
    pub fn list_databases(&self) -> HubResult<BTreeSet<DatabaseName>> {
        Ok(self.repo.list_databases()?)
    }

    /// Fetch the database file recorded at a branch head or commit.
    pub fn download(&self, database: &str, revision: &Revision) -> HubResult<Download> {
        let database = database_name(database)?;

        let commit_id = match revision {
            Revision::DefaultBranch => self.repo.resolve_branch(&database, &self.config.default_branch)?,
            Revision::Branch(branch) => {
                let branch = branch_name("branch", branch)?;
                self.repo.resolve_branch(&database, &branch)?
            }
            Revision::Commit(id) => {
                let id = CommitId::from_hex(required("commit", id)?)?;
                if !self.repo.is_reachable(&database, id)? {
                    return Err(StorageError::CommitNotFound(id).into());
                }
                id
            }
        };

        let commit = self.repo.get_commit(commit_id)?;
        let tree = self.repo.trees().get(commit.tree_id)?;
        let entry = tree
            .database_entry()
            .ok_or_else(|| StorageError::corrupted(tree.id, "tree has no database entry"))?;
        let blob = entry
            .blob_id()
            .ok_or_else(|| StorageError::corrupted(tree.id, "database entry is not a blob"))?;
        let bytes = self.repo.blobs().get(blob)?;

        info!(database = %database, commit = %commit_id.short(), size = bytes.len(), "database downloaded");

        Ok(Download {
            name: entry.name.clone(),
            commit: commit_id,
            blob,
            last_modified: entry.last_modified,
            bytes,
        })
    }
}

/// reject empty or whitespace-only values
pub(super) fn required<'a>(field: &'static str, value: &'a str) -> HubResult<&'a str> {
    if value.trim().is_empty() {
        return Err(HubError::MissingField(field));
    }
    Ok(value)
}

pub(super) fn database_name(value: &str) -> HubResult<DatabaseName> {
    let value = required("database", value)?;
    DatabaseName::new(value).map_err(|source| HubError::InvalidName {
        field: "database",
        source,
    })
}

pub(super) fn branch_name(field: &'static str, value: &str) -> HubResult<BranchName> {
    let value = required(field, value)?;
    BranchName::new(value).map_err(|source| HubError::InvalidName { field, source })
}
