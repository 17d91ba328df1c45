//! storage layer for dbhub
//!
//! A git-like, content-addressed object store for uploaded database files.
//! Blobs, trees and commits are write-once and keyed by SHA-256; branch
//! tables are the only mutable state.
//!
//!  # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Repository                           │
//! │     (store handle, branch-head update protocol, history)    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!        ┌──────────────┬──────┴───────┬──────────────┐
//!        ▼              ▼              ▼              ▼
//!  ┌───────────┐  ┌───────────┐  ┌───────────┐  ┌───────────┐
//!  │   blob    │  │   tree    │  │  commit   │  │   refs    │
//!  │ (db bytes)│  │(manifests)│  │ (history) │  │(branches) │
//!  └───────────┘  └───────────┘  └───────────┘  └───────────┘
//!        │              │              │
//!        └──────────────┼──────────────┘
//!                       ▼
//!                ┌─────────────┐
//!                │   objects   │
//!                │(atomic CAS) │
//!                └─────────────┘
//! ```
//!
//! # Usage
//!
//! ```no_run
//! use chrono::Utc;
//! use dbhub::storage::{
//!     BranchName, CommitBuilder, DatabaseName, Repository, Signature, TreeBuilder, TreeEntry,
//! };
//!
//! # fn main() -> Result<(), dbhub::storage::StorageError> {
//! let repo = Repository::open_or_init("./dbhub-data")?;
//! let db = DatabaseName::new("a.db")?;
//! let bytes = std::fs::read("a.db").unwrap_or_default();
//!
//! let blob = repo.blobs().put(&bytes)?;
//! let tree = TreeBuilder::new()
//!     .entry(TreeEntry::database(blob, &db, Utc::now(), bytes.len() as u64))
//!     .build()?;
//! repo.trees().put(&tree)?;
//!
//! let commit = repo.advance_branch(&db, &BranchName::master(), |parent| {
//!     CommitBuilder::new(tree.id, Signature::new("Alice", "alice@example.org"))
//!         .parent(parent)
//!         .message("init")
//!         .build()
//! })?;
//! println!("{}", commit.id);
//! # Ok(())
//! # }
//! ```

mod blob;
mod commit;
mod error;
mod objects;
mod refs;
mod repository;
mod tree;
mod types;

// Re-export public API
pub use blob::BlobStore;
pub use commit::{Commit, CommitBuilder, CommitStore, HistoryIterator};
pub use error::{ErrorKind, StorageError, StorageResult};
pub use objects::ObjectKind;
pub use refs::{BranchStore, BranchTable};
pub use repository::{Repository, RepositoryStats, FORMAT_VERSION};
pub use tree::{serialize_entries, EntryType, Tree, TreeBuilder, TreeEntry, TreeStore};
pub use types::{
    BlobId, BranchName, CommitId, DatabaseName, Digest, InvalidDigestError, InvalidNameError,
    Signature, TreeId,
};
