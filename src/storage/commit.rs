//! Commit creation and history traversal
//!
//! A commit records one publish event: the tree that was uploaded, the
//! branch head it was appended to (if any), who did it and when. Its id is
//! the SHA-256 of this canonical text, byte for byte:
//!
//! ```text
//! tree <tree id>
//! parent <parent id>                       (only when there is a parent)
//! author <name> <<email>> <date>
//! committer <name> <<email>> <date>        (only when both fields are set)
//!
//! <message>NUL
//! ```
//!
//! `<date>` is the commit timestamp in Unix `date` layout, e.g.
//! `Wed Jun  1 12:30:00 UTC 2016`. Field order and presence rules are part
//! of the id contract; changing them changes every future id.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::objects::ObjectArea;
use crate::storage::tree::truncate_to_seconds;
use crate::storage::types::{CommitId, Digest, Signature, TreeId};

/// Layout of `<date>` in the commit serialization.
const UNIX_DATE: &str = "%a %b %e %H:%M:%S %Z %Y";

/// A revision record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    pub id: CommitId,
    pub tree_id: TreeId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<CommitId>,
    pub author_name: String,
    pub author_email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub committer_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub committer_email: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub message: String,
}

impl Commit {
    /// canonical bytes the id is computed from
    pub fn serialize_fields(&self) -> Vec<u8> {
        let date = self.timestamp.format(UNIX_DATE).to_string();

        let mut buf = String::new();
        buf.push_str(&format!("tree {}\n", self.tree_id));
        if let Some(parent) = self.parent_id {
            buf.push_str(&format!("parent {}\n", parent));
        }
        buf.push_str(&format!(
            "author {} <{}> {}\n",
            self.author_name, self.author_email, date
        ));
        if let Some(committer) = self.committer() {
            buf.push_str(&format!(
                "committer {} <{}> {}\n",
                committer.name, committer.email, date
            ));
        }
        buf.push('\n');
        buf.push_str(&self.message);

        let mut bytes = buf.into_bytes();
        bytes.push(0);
        bytes
    }

    /// recompute the id from the fields
    pub fn compute_id(&self) -> CommitId {
        CommitId::new(Digest::of(&self.serialize_fields()))
    }

    /// the author signature
    pub fn author(&self) -> Signature {
        Signature::new(&self.author_name, &self.author_email)
    }

    /// the committer signature, when both fields are non-empty
    pub fn committer(&self) -> Option<Signature> {
        match (&self.committer_name, &self.committer_email) {
            (Some(name), Some(email)) if !name.is_empty() && !email.is_empty() => {
                Some(Signature::new(name, email))
            }
            _ => None,
        }
    }

    /// a root commit has no parent
    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }

    /// get a short summary of the commit (first line of message)
    pub fn summary(&self) -> &str {
        self.message.lines().next().unwrap_or(&self.message)
    }
}

/// builder for creating commits with a fluent interface
#[derive(Debug, Clone)]
pub struct CommitBuilder {
    tree_id: TreeId,
    parent: Option<CommitId>,
    author: Signature,
    committer: Option<Signature>,
    timestamp: Option<DateTime<Utc>>,
    message: String,
}

impl CommitBuilder {
    /// create a new CommitBuilder for a tree and author
    pub fn new(tree_id: TreeId, author: Signature) -> Self {
        Self {
            tree_id,
            parent: None,
            author,
            committer: None,
            timestamp: None,
            message: String::new(),
        }
    }

    /// set the parent commit
    pub fn parent(mut self, parent: Option<CommitId>) -> Self {
        self.parent = parent;
        self
    }

    /// set the committer, if different from the author
    pub fn committer(mut self, committer: Option<Signature>) -> Self {
        self.committer = committer;
        self
    }

    /// set the timestamp (defaults to now)
    pub fn timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// set the commit message
    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    /// Validate the fields and compute the commit id.
    ///
    /// The timestamp is truncated to whole seconds and a committer with an
    /// empty field is dropped, so the stored record carries exactly what was
    /// hashed.
    pub fn build(self) -> StorageResult<Commit> {
        self.author.validate()?;
        let committer = match self.committer {
            Some(c) if !c.name.is_empty() && !c.email.is_empty() => {
                c.validate()?;
                Some(c)
            }
            _ => None,
        };

        let timestamp = truncate_to_seconds(self.timestamp.unwrap_or_else(Utc::now));
        let (committer_name, committer_email) = match committer {
            Some(c) => (Some(c.name), Some(c.email)),
            None => (None, None),
        };

        let mut commit = Commit {
            id: CommitId::new(Digest::of(&[])),
            tree_id: self.tree_id,
            parent_id: self.parent,
            author_name: self.author.name,
            author_email: self.author.email,
            committer_name,
            committer_email,
            timestamp,
            message: self.message,
        };
        commit.id = commit.compute_id();
        Ok(commit)
    }
}

/// Persistent store of commit records.
#[derive(Debug, Clone)]
pub struct CommitStore {
    area: ObjectArea,
}

impl CommitStore {
    pub(crate) fn new(area: ObjectArea) -> Self {
        Self { area }
    }

    /// store a commit; a commit already present is left as is
    pub fn put(&self, commit: &Commit) -> StorageResult<CommitId> {
        if commit.compute_id() != commit.id {
            return Err(StorageError::Internal(format!(
                "commit {} does not match its fields",
                commit.id
            )));
        }

        let bytes = serde_json::to_vec_pretty(commit)?;
        if self.area.write(&commit.id.digest(), &bytes)? {
            debug!(commit = %commit.id, tree = %commit.tree_id, "stored commit");
        }
        Ok(commit.id)
    }

    pub fn exists(&self, id: CommitId) -> StorageResult<bool> {
        self.area.contains(&id.digest())
    }

    /// load a commit and verify its id
    pub fn get(&self, id: CommitId) -> StorageResult<Commit> {
        let bytes = self
            .area
            .read(&id.digest())?
            .ok_or(StorageError::CommitNotFound(id))?;

        let commit: Commit = serde_json::from_slice(&bytes)?;
        if commit.id != id || commit.compute_id() != id {
            warn!(commit = %id, "commit record does not hash to its id");
            return Err(StorageError::corrupted(id, "commit record does not hash to its id"));
        }
        Ok(commit)
    }

    pub fn count(&self) -> StorageResult<usize> {
        self.area.count()
    }

    /// walk parent links starting at `start`
    pub fn history(&self, start: CommitId) -> HistoryIterator<'_> {
        HistoryIterator::new(self, start)
    }
}

/// Iterate over commit history, newest first.
///
/// Every item is loaded fresh from the store. A missing parent or a cycle
/// yields an error and ends the walk.
pub struct HistoryIterator<'a> {
    store: &'a CommitStore,
    next: Option<CommitId>,
    seen: HashSet<CommitId>,
}

impl<'a> HistoryIterator<'a> {
    /// create a new history iterator
    pub fn new(store: &'a CommitStore, start: CommitId) -> Self {
        Self {
            store,
            next: Some(start),
            seen: HashSet::new(),
        }
    }
}

impl Iterator for HistoryIterator<'_> {
    type Item = StorageResult<Commit>;

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.next.take()?;

        if !self.seen.insert(id) {
            return Some(Err(StorageError::corrupted(id, "commit history contains a cycle")));
        }

        match self.store.get(id) {
            Ok(commit) => {
                self.next = commit.parent_id;
                Some(Ok(commit))
            }
            Err(e) => Some(Err(e)),
        }
    }
}
