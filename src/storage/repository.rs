//! The store handle.
//!
//! `Repository` ties the object areas and the branch tables together under
//! one storage root and implements the branch-head update protocol. It is
//! passed explicitly to everything that needs storage; there is no global
//! root path.
//!
//! ```text
//! <root>/FORMAT                  object encoding version
//! <root>/objects/{blobs,trees,commits}/<xx>/<rest of digest>
//! <root>/meta/<database>/branches.json
//! <root>/meta/.locks/<database>   per-database lock file
//! <root>/tmp/                    private staging for atomic writes
//! ```

use std::collections::{BTreeSet, HashSet};
use std::fs;
use std::io::{self, Write as _};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::storage::blob::BlobStore;
use crate::storage::commit::{Commit, CommitStore, HistoryIterator};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::objects::{ObjectArea, ObjectKind};
use crate::storage::refs::{BranchStore, BranchTable};
use crate::storage::tree::TreeStore;
use crate::storage::types::{BranchName, CommitId, DatabaseName};

/// Version of the tree/commit encoding. Ids are hashes of that encoding, so
/// any change to it must bump this.
pub const FORMAT_VERSION: u32 = 1;

const FORMAT_FILE: &str = "FORMAT";

/// The main storage handle.
///
/// Clone this to share across threads - it uses Arc internally.
#[derive(Clone)]
pub struct Repository {
    inner: Arc<RepositoryInner>,
}

struct RepositoryInner {
    path: PathBuf,
    blobs: BlobStore,
    trees: TreeStore,
    commits: CommitStore,
    branches: BranchStore,
}

impl Repository {
    /// Open an existing storage root.
    pub fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        let path = path.as_ref();
        match fs::read_to_string(path.join(FORMAT_FILE)) {
            Ok(found) => {
                if found.trim() != FORMAT_VERSION.to_string() {
                    return Err(StorageError::UnsupportedFormat {
                        found: found.trim().to_string(),
                        expected: FORMAT_VERSION,
                    });
                }
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(StorageError::NotInitialized),
            Err(e) => return Err(StorageError::io("reading the format marker", e)),
        }

        Self::assemble(path)
    }

    /// Initialize a new storage root.
    ///
    /// An already initialized root is opened as is; one written in another
    /// format is refused rather than relabelled.
    pub fn init(path: impl AsRef<Path>) -> StorageResult<Self> {
        let path = path.as_ref();
        match Self::open(path) {
            Err(StorageError::NotInitialized) => {}
            other => return other,
        }

        fs::create_dir_all(path).map_err(StorageError::io_with("creating the storage root"))?;

        // concurrent openers must never see a half-written marker
        let context = "writing the format marker";
        let mut marker = NamedTempFile::new_in(path).map_err(StorageError::io_with(context))?;
        writeln!(marker, "{}", FORMAT_VERSION).map_err(StorageError::io_with(context))?;
        marker
            .as_file()
            .sync_all()
            .map_err(StorageError::io_with(context))?;
        marker
            .persist(path.join(FORMAT_FILE))
            .map_err(|e| StorageError::io(context, e.error))?;

        info!(version = FORMAT_VERSION, "initialized storage root");
        Self::assemble(path)
    }

    /// Open or initialize a storage root.
    pub fn open_or_init(path: impl AsRef<Path>) -> StorageResult<Self> {
        Self::init(path)
    }

    fn assemble(path: &Path) -> StorageResult<Self> {
        let objects_dir = path.join("objects");
        let tmp_dir = path.join("tmp");
        fs::create_dir_all(&tmp_dir).map_err(StorageError::io_with("creating the staging area"))?;

        let blobs = BlobStore::new(ObjectArea::open(ObjectKind::Blob, &objects_dir, &tmp_dir)?);
        let trees = TreeStore::new(ObjectArea::open(ObjectKind::Tree, &objects_dir, &tmp_dir)?);
        let commits = CommitStore::new(ObjectArea::open(ObjectKind::Commit, &objects_dir, &tmp_dir)?);
        let branches = BranchStore::open(&path.join("meta"), &tmp_dir)?;

        Ok(Self {
            inner: Arc::new(RepositoryInner {
                path: path.to_path_buf(),
                blobs,
                trees,
                commits,
                branches,
            }),
        })
    }

    /// Get the storage root.
    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn blobs(&self) -> &BlobStore {
        &self.inner.blobs
    }

    pub fn trees(&self) -> &TreeStore {
        &self.inner.trees
    }

    pub fn commits(&self) -> &CommitStore {
        &self.inner.commits
    }

    pub fn branches(&self) -> &BranchStore {
        &self.inner.branches
    }

    // ==================== Branch Operations ====================

    /// Check if a database has been published.
    pub fn database_exists(&self, database: &DatabaseName) -> StorageResult<bool> {
        self.inner.branches.exists(database)
    }

    /// All published databases.
    pub fn list_databases(&self) -> StorageResult<BTreeSet<DatabaseName>> {
        self.inner.branches.list_databases()
    }

    /// The branch table of a database.
    pub fn list_branches(&self, database: &DatabaseName) -> StorageResult<BranchTable> {
        self.inner.branches.load(database)
    }

    /// Get the head commit of a branch.
    pub fn resolve_branch(&self, database: &DatabaseName, branch: &BranchName) -> StorageResult<CommitId> {
        let table = self.inner.branches.load(database)?;
        table.get(branch).ok_or_else(|| StorageError::BranchNotFound {
            database: database.clone(),
            branch: branch.clone(),
        })
    }

    /// Fork a new branch from an existing head.
    pub fn create_branch(
        &self,
        database: &DatabaseName,
        from_branch: &BranchName,
        new_branch: &BranchName,
    ) -> StorageResult<CommitId> {
        let head = self
            .inner
            .branches
            .create_branch(database, from_branch, new_branch)?;

        info!(
            database = %database,
            from = %from_branch,
            branch = %new_branch,
            head = %head.short(),
            "created branch"
        );
        Ok(head)
    }

    /// Append a commit to a branch.
    ///
    /// Under the database lock: resolve the parent (the branch's current
    /// head, or none for a new branch or database), let `build` produce the
    /// commit, make sure its tree is stored, store the commit, and only then
    /// move the head. The head update is the single point at which the new
    /// commit becomes visible.
    pub fn advance_branch<F>(
        &self,
        database: &DatabaseName,
        branch: &BranchName,
        build: F,
    ) -> StorageResult<Commit>
    where
        F: FnOnce(Option<CommitId>) -> StorageResult<Commit>,
    {
        let branches = &self.inner.branches;
        branches.with_lock(database, || {
            let mut table = branches.load_optional(database)?.unwrap_or_default();
            let parent = table.get(branch);

            let commit = build(parent)?;
            if commit.parent_id != parent {
                return Err(StorageError::Internal(format!(
                    "commit {} was not built on the head of {}",
                    commit.id, branch
                )));
            }
            if !self.inner.trees.exists(commit.tree_id)? {
                return Err(StorageError::TreeNotFound(commit.tree_id));
            }

            self.inner.commits.put(&commit)?;
            table.set(branch.clone(), commit.id);
            branches.store(database, &table)?;

            debug!(
                database = %database,
                branch = %branch,
                commit = %commit.id.short(),
                parent = ?parent.map(|p| p.short()),
                "advanced branch"
            );
            Ok(commit)
        })
    }

    // ==================== History ====================

    /// Get a commit.
    pub fn get_commit(&self, id: CommitId) -> StorageResult<Commit> {
        self.inner.commits.get(id)
    }

    /// Iterate history from a commit.
    pub fn history_from(&self, start: CommitId) -> HistoryIterator<'_> {
        self.inner.commits.history(start)
    }

    /// Full history of a branch, head first.
    pub fn history(&self, database: &DatabaseName, branch: &BranchName) -> StorageResult<Vec<Commit>> {
        let head = self.resolve_branch(database, branch)?;
        self.history_from(head).collect()
    }

    /// Check whether a commit is in the history of any branch of a database.
    ///
    /// A broken history under one head does not hide the target from the
    /// others; the first such error is returned only if no head reaches it.
    pub fn is_reachable(&self, database: &DatabaseName, target: CommitId) -> StorageResult<bool> {
        let table = self.inner.branches.load(database)?;
        let mut seen = HashSet::new();
        let mut first_error = None;

        for head in table.heads() {
            let mut next = Some(head);
            while let Some(id) = next {
                if id == target {
                    return Ok(true);
                }
                if !seen.insert(id) {
                    break;
                }
                next = match self.inner.commits.get(id) {
                    Ok(commit) => commit.parent_id,
                    Err(e) => {
                        warn!(database = %database, commit = %id.short(), error = %e, "broken history");
                        first_error.get_or_insert(e);
                        None
                    }
                };
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(false),
        }
    }

    // ==================== Statistics ====================

    /// Count what is stored.
    pub fn stats(&self) -> StorageResult<RepositoryStats> {
        Ok(RepositoryStats {
            databases: self.list_databases()?.len(),
            blobs: self.inner.blobs.count()?,
            trees: self.inner.trees.count()?,
            commits: self.inner.commits.count()?,
        })
    }
}

impl std::fmt::Debug for Repository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repository")
            .field("path", &self.inner.path)
            .finish()
    }
}

/// Object counts for a storage root.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepositoryStats {
    pub databases: usize,
    pub blobs: usize,
    pub trees: usize,
    pub commits: usize,
}

impl std::fmt::Display for RepositoryStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Repository Statistics:")?;
        writeln!(f, "  Databases: {}", self.databases)?;
        writeln!(f, "  Blobs: {}", self.blobs)?;
        writeln!(f, "  Trees: {}", self.trees)?;
        write!(f, "  Commits: {}", self.commits)
    }
}
