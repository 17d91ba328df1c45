//! Upload ingestion.
//!
//! One upload becomes: blob → single-entry tree → commit → branch head.
//! Blob and tree are content-addressed and written first, outside the
//! database lock; parent resolution, the commit write and the head update
//! happen under it (see [`Repository::advance_branch`]). An upload that fails
//! part way leaves only inert objects behind, never a head pointing at
//! something that was not stored.
//!
//! [`Repository::advance_branch`]: crate::storage::Repository::advance_branch

use chrono::{DateTime, Utc};
use tracing::{info, info_span};
use ulid::Ulid;

use super::api::{branch_name, database_name, Hub, HubError, HubResult};
use crate::storage::{
    BlobId, BranchName, CommitBuilder, CommitId, DatabaseName, Signature, TreeBuilder, TreeEntry,
    TreeId,
};

/// An upload as received from the network layer.
#[derive(Debug, Clone, Default)]
pub struct UploadRequest {
    /// name to store the database under
    pub database: String,
    /// target branch, the configured default when absent
    pub branch: Option<String>,
    pub bytes: Vec<u8>,
    pub author_name: Option<String>,
    pub author_email: Option<String>,
    pub committer_name: Option<String>,
    pub committer_email: Option<String>,
    /// commit message, required
    pub message: String,
    /// the client's modification time of the file
    pub last_modified: Option<DateTime<Utc>>,
    /// commit time, now when absent
    pub timestamp: Option<DateTime<Utc>>,
}

impl UploadRequest {
    pub fn new(database: impl Into<String>, bytes: Vec<u8>, message: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            bytes,
            message: message.into(),
            ..Default::default()
        }
    }

    pub fn branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = Some(branch.into());
        self
    }

    pub fn author(mut self, name: impl Into<String>, email: impl Into<String>) -> Self {
        self.author_name = Some(name.into());
        self.author_email = Some(email.into());
        self
    }

    pub fn committer(mut self, name: impl Into<String>, email: impl Into<String>) -> Self {
        self.committer_name = Some(name.into());
        self.committer_email = Some(email.into());
        self
    }

    pub fn last_modified(mut self, at: DateTime<Utc>) -> Self {
        self.last_modified = Some(at);
        self
    }

    pub fn timestamp(mut self, at: DateTime<Utc>) -> Self {
        self.timestamp = Some(at);
        self
    }
}

/// What an accepted upload produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadReceipt {
    pub database: DatabaseName,
    pub branch: BranchName,
    pub commit_id: CommitId,
    pub parent_id: Option<CommitId>,
    pub tree_id: TreeId,
    pub blob_id: BlobId,
    pub size: usize,
    /// resource path of the database, e.g. `/a.db`
    pub location: String,
}

/// Parse a client-supplied RFC 3339 time such as `2016-06-01T12:30:00+10:00`.
pub fn parse_client_time(field: &'static str, value: &str) -> HubResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value.trim())
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| HubError::InvalidTimestamp {
            field,
            value: value.to_string(),
        })
}

/// Turn an optional name/email pair into a signature.
///
/// Both absent means "not given"; one without the other is an error.
fn signature_pair(
    name: Option<&str>,
    email: Option<&str>,
    name_field: &'static str,
    email_field: &'static str,
) -> HubResult<Option<Signature>> {
    let name = name.filter(|s| !s.trim().is_empty());
    let email = email.filter(|s| !s.trim().is_empty());

    let signature = match (name, email) {
        (None, None) => return Ok(None),
        (Some(_), None) => return Err(HubError::MissingField(email_field)),
        (None, Some(_)) => return Err(HubError::MissingField(name_field)),
        (Some(name), Some(email)) => Signature::new(name, email),
    };

    signature
        .validate()
        .map_err(|source| HubError::InvalidName {
            field: name_field,
            source,
        })?;
    Ok(Some(signature))
}

impl Hub {
    /// Publish a new version of a database on a branch.
    pub fn upload(&self, request: UploadRequest) -> HubResult<UploadReceipt> {
        let database = database_name(&request.database)?;
        let branch = match request.branch.as_deref() {
            Some(b) if !b.trim().is_empty() => branch_name("branch", b)?,
            _ => self.config.default_branch.clone(),
        };
        if request.message.trim().is_empty() {
            return Err(HubError::MissingField("message"));
        }

        let size = request.bytes.len();
        if size > self.config.max_upload_bytes {
            return Err(HubError::TooLarge {
                size,
                max: self.config.max_upload_bytes,
            });
        }

        let author = signature_pair(
            request.author_name.as_deref(),
            request.author_email.as_deref(),
            "author",
            "email",
        )?
        .unwrap_or_else(|| self.config.default_identity.clone());
        let committer = signature_pair(
            request.committer_name.as_deref(),
            request.committer_email.as_deref(),
            "committer",
            "committer email",
        )?;

        let upload_id = Ulid::new();
        let span = info_span!("upload", id = %upload_id, database = %database, branch = %branch);
        let _enter = span.enter();

        let blob_id = self.repo.blobs().put(&request.bytes)?;

        let last_modified = request.last_modified.unwrap_or_else(Utc::now);
        let tree = TreeBuilder::new()
            .entry(TreeEntry::database(blob_id, &database, last_modified, size as u64))
            .build()?;
        let tree_id = self.repo.trees().put(&tree)?;

        let timestamp = request.timestamp.unwrap_or_else(Utc::now);
        let message = request.message;
        let commit = self.repo.advance_branch(&database, &branch, |parent| {
            CommitBuilder::new(tree_id, author)
                .parent(parent)
                .committer(committer)
                .timestamp(timestamp)
                .message(message)
                .build()
        })?;

        info!(
            size,
            commit = %commit.id.short(),
            parent = ?commit.parent_id.map(|p| p.short()),
            "database uploaded"
        );

        Ok(UploadReceipt {
            location: format!("/{}", database),
            database,
            branch,
            commit_id: commit.id,
            parent_id: commit.parent_id,
            tree_id,
            blob_id,
            size,
        })
    }
}
