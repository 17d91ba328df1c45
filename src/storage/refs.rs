//! Branch tables and per-database locking.
//!
//! Each database has exactly one branch table: a mapping from branch name to
//! the commit it currently points at. It is the only mutable state in the
//! store, kept as a JSON record at `meta/<database>/branches.json` and
//! replaced atomically (temp file + rename) on every update.
//!
//! Read-modify-write sequences against one table are serialized by a lock
//! keyed on the database name: an in-process mutex in front of an exclusive
//! file lock at `meta/.locks/<database>`, so handles opened separately on
//! the same root (or in other processes) are serialized too. Different
//! databases never contend.

use std::collections::btree_map;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use fs4::fs_std::FileExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::objects::{create_dir_durable, sync_dir};
use crate::storage::types::{BranchName, CommitId, DatabaseName};

const TABLE_FILE: &str = "branches.json";

/// Lock files live here; the leading dot keeps it out of the database names.
const LOCK_DIR: &str = ".locks";

/// The branch heads of one database.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BranchTable {
    heads: BTreeMap<BranchName, CommitId>,
}

impl BranchTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// head of a branch
    pub fn get(&self, branch: &BranchName) -> Option<CommitId> {
        self.heads.get(branch).copied()
    }

    pub fn contains(&self, branch: &BranchName) -> bool {
        self.heads.contains_key(branch)
    }

    /// point a branch at a commit, returning the previous head
    pub fn set(&mut self, branch: BranchName, head: CommitId) -> Option<CommitId> {
        self.heads.insert(branch, head)
    }

    pub fn len(&self) -> usize {
        self.heads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heads.is_empty()
    }

    pub fn iter(&self) -> btree_map::Iter<'_, BranchName, CommitId> {
        self.heads.iter()
    }

    /// all distinct head commits
    pub fn heads(&self) -> BTreeSet<CommitId> {
        self.heads.values().copied().collect()
    }
}

impl<'a> IntoIterator for &'a BranchTable {
    type Item = (&'a BranchName, &'a CommitId);
    type IntoIter = btree_map::Iter<'a, BranchName, CommitId>;

    fn into_iter(self) -> Self::IntoIter {
        self.heads.iter()
    }
}

impl FromIterator<(BranchName, CommitId)> for BranchTable {
    fn from_iter<I: IntoIterator<Item = (BranchName, CommitId)>>(iter: I) -> Self {
        Self {
            heads: iter.into_iter().collect(),
        }
    }
}

/// One lock per database name, created on first use.
#[derive(Debug, Default)]
pub(crate) struct DatabaseLocks {
    locks: Mutex<HashMap<DatabaseName, Arc<Mutex<()>>>>,
}

impl DatabaseLocks {
    fn get(&self, database: &DatabaseName) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock();
        locks
            .entry(database.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

/// Persistence and locking for branch tables.
#[derive(Debug)]
pub struct BranchStore {
    meta_dir: PathBuf,
    tmp_dir: PathBuf,
    locks: DatabaseLocks,
}

impl BranchStore {
    pub(crate) fn open(meta_dir: &Path, tmp_dir: &Path) -> StorageResult<Self> {
        fs::create_dir_all(meta_dir.join(LOCK_DIR))
            .map_err(StorageError::io_with("creating the meta area"))?;
        Ok(Self {
            meta_dir: meta_dir.to_path_buf(),
            tmp_dir: tmp_dir.to_path_buf(),
            locks: DatabaseLocks::default(),
        })
    }

    fn table_path(&self, database: &DatabaseName) -> PathBuf {
        self.meta_dir.join(database.as_str()).join(TABLE_FILE)
    }

    /// Run `f` while holding the exclusive lock for `database`.
    ///
    /// Every read-modify-write of a branch table must happen inside this
    /// scope. The lock is not reentrant.
    pub fn with_lock<F, T>(&self, database: &DatabaseName, f: F) -> StorageResult<T>
    where
        F: FnOnce() -> StorageResult<T>,
    {
        let lock = self.locks.get(database);
        let _guard = lock.lock();

        let context = || format!("locking branch table of {}", database);
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(self.meta_dir.join(LOCK_DIR).join(database.as_str()))
            .map_err(StorageError::io_with(context()))?;
        file.lock_exclusive().map_err(StorageError::io_with(context()))?;

        // the file lock is released when `file` is closed
        f()
    }

    /// check if a database has a branch table
    pub fn exists(&self, database: &DatabaseName) -> StorageResult<bool> {
        match fs::metadata(self.table_path(database)) {
            Ok(meta) => Ok(meta.is_file()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StorageError::io(
                format!("checking branch table of {}", database),
                e,
            )),
        }
    }

    /// load a branch table, `None` if the database was never published
    pub fn load_optional(&self, database: &DatabaseName) -> StorageResult<Option<BranchTable>> {
        let bytes = match fs::read(self.table_path(database)) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(StorageError::io(
                    format!("reading branch table of {}", database),
                    e,
                ))
            }
        };

        let table = serde_json::from_slice(&bytes).map_err(|e| {
            warn!(database = %database, error = %e, "unreadable branch table");
            StorageError::corrupted(database, format!("branch table is not valid: {}", e))
        })?;
        Ok(Some(table))
    }

    /// load a branch table
    pub fn load(&self, database: &DatabaseName) -> StorageResult<BranchTable> {
        self.load_optional(database)?
            .ok_or_else(|| StorageError::DatabaseNotFound(database.clone()))
    }

    /// Replace a branch table atomically.
    ///
    /// Callers are expected to hold the database lock.
    pub fn store(&self, database: &DatabaseName, table: &BranchTable) -> StorageResult<()> {
        let path = self.table_path(database);
        let dir = self.meta_dir.join(database.as_str());
        create_dir_durable(&dir).map_err(StorageError::io_with(format!(
            "creating meta directory of {}",
            database
        )))?;

        let context = || format!("writing branch table of {}", database);
        let bytes = serde_json::to_vec_pretty(table)?;
        let mut tmp = NamedTempFile::new_in(&self.tmp_dir).map_err(StorageError::io_with(context()))?;
        tmp.write_all(&bytes).map_err(StorageError::io_with(context()))?;
        tmp.as_file()
            .sync_all()
            .map_err(StorageError::io_with(context()))?;
        tmp.persist(&path)
            .map_err(|e| StorageError::io(context(), e.error))?;
        sync_dir(&dir).map_err(StorageError::io_with(context()))?;

        debug!(database = %database, branches = table.len(), "stored branch table");
        Ok(())
    }

    /// Fork `new_branch` from the current head of `from_branch`.
    ///
    /// Branches can only start at an existing head, never at an arbitrary
    /// commit id.
    pub fn create_branch(
        &self,
        database: &DatabaseName,
        from_branch: &BranchName,
        new_branch: &BranchName,
    ) -> StorageResult<CommitId> {
        self.with_lock(database, || {
            let mut table = self.load(database)?;

            let head = table.get(from_branch).ok_or_else(|| StorageError::BranchNotFound {
                database: database.clone(),
                branch: from_branch.clone(),
            })?;

            if table.contains(new_branch) {
                return Err(StorageError::BranchAlreadyExists {
                    database: database.clone(),
                    branch: new_branch.clone(),
                });
            }

            table.set(new_branch.clone(), head);
            self.store(database, &table)?;
            Ok(head)
        })
    }

    /// all databases with a branch table
    pub fn list_databases(&self) -> StorageResult<BTreeSet<DatabaseName>> {
        let context = "listing databases";
        let mut names = BTreeSet::new();

        for entry in fs::read_dir(&self.meta_dir).map_err(StorageError::io_with(context))? {
            let entry = entry.map_err(StorageError::io_with(context))?;
            if !entry.file_type().map_err(StorageError::io_with(context))?.is_dir() {
                continue;
            }

            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            let Ok(database) = DatabaseName::new(name) else {
                continue;
            };
            if self.exists(&database)? {
                names.insert(database);
            }
        }

        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::types::Digest;
    use tempfile::TempDir;

    fn setup() -> (TempDir, BranchStore) {
        let dir = TempDir::new().unwrap();
        let tmp = dir.path().join("tmp");
        fs::create_dir_all(&tmp).unwrap();
        let store = BranchStore::open(&dir.path().join("meta"), &tmp).unwrap();
        (dir, store)
    }

    fn db() -> DatabaseName {
        DatabaseName::new("a.db").unwrap()
    }

    fn branch(name: &str) -> BranchName {
        BranchName::new(name).unwrap()
    }

    fn commit(tag: &str) -> CommitId {
        CommitId::new(Digest::of(tag.as_bytes()))
    }

    #[test]
    fn test_missing_database() {
        let (_dir, store) = setup();
        assert!(!store.exists(&db()).unwrap());
        assert!(store.load_optional(&db()).unwrap().is_none());
        assert!(matches!(store.load(&db()), Err(StorageError::DatabaseNotFound(_))));
    }

    #[test]
    fn test_store_and_load() {
        let (_dir, store) = setup();
        let table: BranchTable = [(branch("master"), commit("c1"))].into_iter().collect();

        store.store(&db(), &table).unwrap();
        assert!(store.exists(&db()).unwrap());
        assert_eq!(store.load(&db()).unwrap(), table);
    }

    #[test]
    fn test_table_json_shape() {
        let table: BranchTable = [(branch("master"), commit("c1"))].into_iter().collect();
        let json = serde_json::to_value(&table).unwrap();
        assert_eq!(json["master"], serde_json::json!(commit("c1").to_string()));
    }

    #[test]
    fn test_create_branch() {
        let (_dir, store) = setup();
        let table: BranchTable = [(branch("master"), commit("c1"))].into_iter().collect();
        store.store(&db(), &table).unwrap();

        let head = store.create_branch(&db(), &branch("master"), &branch("dev")).unwrap();
        assert_eq!(head, commit("c1"));

        let table = store.load(&db()).unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.get(&branch("dev")), Some(commit("c1")));
    }

    #[test]
    fn test_create_branch_errors() {
        let (_dir, store) = setup();

        let result = store.create_branch(&db(), &branch("master"), &branch("dev"));
        assert!(matches!(result, Err(StorageError::DatabaseNotFound(_))));

        let table: BranchTable = [
            (branch("master"), commit("c1")),
            (branch("dev"), commit("c2")),
        ]
        .into_iter()
        .collect();
        store.store(&db(), &table).unwrap();

        let result = store.create_branch(&db(), &branch("nope"), &branch("x"));
        assert!(matches!(result, Err(StorageError::BranchNotFound { .. })));

        let result = store.create_branch(&db(), &branch("master"), &branch("dev"));
        assert!(matches!(result, Err(StorageError::BranchAlreadyExists { .. })));

        // failed calls leave the table untouched
        assert_eq!(store.load(&db()).unwrap(), table);
    }

    #[test]
    fn test_list_databases() {
        let (dir, store) = setup();
        store
            .store(&db(), &[(branch("master"), commit("c1"))].into_iter().collect())
            .unwrap();
        store
            .store(
                &DatabaseName::new("b.sqlite").unwrap(),
                &[(branch("master"), commit("c2"))].into_iter().collect(),
            )
            .unwrap();
        // a directory without a table is not a database
        fs::create_dir_all(dir.path().join("meta").join("stray")).unwrap();

        let names: Vec<String> = store
            .list_databases()
            .unwrap()
            .into_iter()
            .map(DatabaseName::into_string)
            .collect();
        assert_eq!(names, vec!["a.db".to_string(), "b.sqlite".to_string()]);
    }

    #[test]
    fn test_corrupt_table_is_internal() {
        let (dir, store) = setup();
        let path = dir.path().join("meta").join("a.db");
        fs::create_dir_all(&path).unwrap();
        fs::write(path.join(TABLE_FILE), b"{not json").unwrap();

        assert!(matches!(store.load(&db()), Err(StorageError::Corrupted { .. })));
    }

    #[test]
    fn test_locks_are_per_database() {
        let (_dir, store) = setup();
        let other = DatabaseName::new("b.db").unwrap();

        // holding one database's lock does not block another's
        let reached = store
            .with_lock(&db(), || store.with_lock(&other, || Ok(true)))
            .unwrap();
        assert!(reached);
    }

    #[test]
    fn test_separate_handles_serialize_updates() {
        let (dir, _store) = setup();
        let meta = dir.path().join("meta");
        let tmp = dir.path().join("tmp");
        const THREADS: usize = 8;
        const ROUNDS: usize = 5;

        std::thread::scope(|s| {
            for t in 0..THREADS {
                let (meta, tmp) = (meta.clone(), tmp.clone());
                s.spawn(move || {
                    // every thread has its own store, so only the file lock is shared
                    let store = BranchStore::open(&meta, &tmp).unwrap();
                    for r in 0..ROUNDS {
                        store
                            .with_lock(&db(), || {
                                let mut table = store.load_optional(&db())?.unwrap_or_default();
                                let name = branch(&format!("b{}-{}", t, r));
                                table.set(name, commit(&format!("{}-{}", t, r)));
                                store.store(&db(), &table)
                            })
                            .unwrap();
                    }
                });
            }
        });

        let store = BranchStore::open(&meta, &tmp).unwrap();
        assert_eq!(store.load(&db()).unwrap().len(), THREADS * ROUNDS);
    }

    #[test]
    fn test_unreadable_table_is_internal() {
        let (dir, store) = setup();
        // a plain file where the database's meta directory belongs
        fs::write(dir.path().join("meta").join("a.db"), b"junk").unwrap();

        let err = store.exists(&db()).unwrap_err();
        assert_eq!(err.kind(), crate::storage::ErrorKind::Internal);

        let err = store.load_optional(&db()).unwrap_err();
        assert_eq!(err.kind(), crate::storage::ErrorKind::Internal);
        assert!(!err.is_not_found());

        let table: BranchTable = [(branch("master"), commit("c1"))].into_iter().collect();
        let err = store.store(&db(), &table).unwrap_err();
        assert_eq!(err.kind(), crate::storage::ErrorKind::Internal);
    }

    #[test]
    fn test_lock_dir_is_not_a_database() {
        let (_dir, store) = setup();
        store.with_lock(&db(), || Ok(())).unwrap();
        assert!(store.list_databases().unwrap().is_empty());
    }
}
