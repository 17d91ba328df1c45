//! Trees: ordered manifests of named entries.
//!
//! A tree describes what one upload contains. Today that is always a single
//! entry for the uploaded database file; nested trees are reserved in the
//! entry type so the encoding does not have to change later.
//!
//! The tree id is the SHA-256 of this serialization, entry after entry:
//!
//! ```text
//! <type> NUL <digest hex> NUL <name> NUL <last modified, RFC 3339> NUL <size> LF
//! ```
//!
//! Names may not contain NUL and every other field has a fixed alphabet, so
//! two different entry sequences never serialize to the same bytes.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::objects::ObjectArea;
use crate::storage::types::{BlobId, DatabaseName, Digest, InvalidNameError, TreeId};

/// What a tree entry points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntryType {
    /// a database file blob
    #[serde(rename = "db")]
    Database,
    /// a nested tree (not produced yet)
    #[serde(rename = "tree")]
    Tree,
}

impl EntryType {
    /// tag written into the tree serialization
    pub fn as_str(self) -> &'static str {
        match self {
            EntryType::Database => "db",
            EntryType::Tree => "tree",
        }
    }
}

/// One named entry of a tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeEntry {
    pub entry_type: EntryType,
    pub digest: Digest,
    pub name: String,
    pub last_modified: DateTime<Utc>,
    pub size: u64,
}

impl TreeEntry {
    /// entry for an uploaded database file
    ///
    /// `last_modified` is truncated to whole seconds, the precision of the
    /// serialized form.
    pub fn database(blob: BlobId, name: &DatabaseName, last_modified: DateTime<Utc>, size: u64) -> Self {
        Self {
            entry_type: EntryType::Database,
            digest: blob.digest(),
            name: name.as_str().to_string(),
            last_modified: truncate_to_seconds(last_modified),
            size,
        }
    }

    /// the blob this entry references, if it is a database entry
    pub fn blob_id(&self) -> Option<BlobId> {
        match self.entry_type {
            EntryType::Database => Some(BlobId::new(self.digest)),
            EntryType::Tree => None,
        }
    }

    fn write_to(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(self.entry_type.as_str().as_bytes());
        buf.push(0);
        buf.extend_from_slice(self.digest.to_hex().as_bytes());
        buf.push(0);
        buf.extend_from_slice(self.name.as_bytes());
        buf.push(0);
        buf.extend_from_slice(
            self.last_modified
                .to_rfc3339_opts(SecondsFormat::Secs, true)
                .as_bytes(),
        );
        buf.push(0);
        buf.extend_from_slice(format!("{}\n", self.size).as_bytes());
    }
}

/// drop sub-second precision
pub(crate) fn truncate_to_seconds(ts: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp(ts.timestamp(), 0).unwrap_or(ts)
}

/// serialize entries in the order given
pub fn serialize_entries(entries: &[TreeEntry]) -> Vec<u8> {
    let mut buf = Vec::new();
    for entry in entries {
        entry.write_to(&mut buf);
    }
    buf
}

/// An immutable tree value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tree {
    pub id: TreeId,
    pub entries: Vec<TreeEntry>,
}

impl Tree {
    /// recompute the id from the entries
    pub fn compute_id(entries: &[TreeEntry]) -> TreeId {
        TreeId::new(Digest::of(&serialize_entries(entries)))
    }

    /// first database entry, if any
    pub fn database_entry(&self) -> Option<&TreeEntry> {
        self.entries
            .iter()
            .find(|e| e.entry_type == EntryType::Database)
    }
}

/// builder for trees, keeps entries in insertion order
#[derive(Debug, Default)]
pub struct TreeBuilder {
    entries: Vec<TreeEntry>,
}

impl TreeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// append an entry
    pub fn entry(mut self, entry: TreeEntry) -> Self {
        self.entries.push(entry);
        self
    }

    /// validate the entries and compute the tree id
    pub fn build(self) -> StorageResult<Tree> {
        for entry in &self.entries {
            if entry.name.is_empty() {
                return Err(InvalidNameError::Empty.into());
            }
            if let Some(position) = entry.name.chars().position(|c| c == '\0') {
                return Err(InvalidNameError::InvalidCharacter { char: '\0', position }.into());
            }
        }

        let id = Tree::compute_id(&self.entries);
        Ok(Tree {
            id,
            entries: self.entries,
        })
    }
}

/// Persistent store of tree records.
#[derive(Debug, Clone)]
pub struct TreeStore {
    area: ObjectArea,
}

impl TreeStore {
    pub(crate) fn new(area: ObjectArea) -> Self {
        Self { area }
    }

    /// store a tree record; a tree already present is left as is
    pub fn put(&self, tree: &Tree) -> StorageResult<TreeId> {
        if Tree::compute_id(&tree.entries) != tree.id {
            return Err(StorageError::Internal(format!(
                "tree {} does not match its entries",
                tree.id
            )));
        }

        let bytes = serde_json::to_vec_pretty(tree)?;
        if self.area.write(&tree.id.digest(), &bytes)? {
            debug!(tree = %tree.id, entries = tree.entries.len(), "stored tree");
        }
        Ok(tree.id)
    }

    pub fn exists(&self, id: TreeId) -> StorageResult<bool> {
        self.area.contains(&id.digest())
    }

    /// load a tree and verify its id
    pub fn get(&self, id: TreeId) -> StorageResult<Tree> {
        let bytes = self
            .area
            .read(&id.digest())?
            .ok_or(StorageError::TreeNotFound(id))?;

        let tree: Tree = serde_json::from_slice(&bytes)?;
        if tree.id != id || Tree::compute_id(&tree.entries) != id {
            warn!(tree = %id, "tree record does not hash to its id");
            return Err(StorageError::corrupted(id, "tree record does not hash to its id"));
        }
        Ok(tree)
    }

    pub fn count(&self) -> StorageResult<usize> {
        self.area.count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::objects::ObjectKind;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2016, 6, 1, 12, 30, 0).unwrap()
    }

    fn entry(content: &[u8], name: &str) -> TreeEntry {
        TreeEntry::database(
            BlobId::new(Digest::of(content)),
            &DatabaseName::new(name).unwrap(),
            ts(),
            content.len() as u64,
        )
    }

    #[test]
    fn test_serialization_format() {
        let e = entry(b"abc", "a.db");
        let bytes = serialize_entries(&[e.clone()]);
        let expected = format!("db\0{}\0a.db\02016-06-01T12:30:00Z\03\n", e.digest);
        assert_eq!(bytes, expected.into_bytes());
    }

    #[test]
    fn test_same_entries_same_id() {
        let a = TreeBuilder::new().entry(entry(b"abc", "a.db")).build().unwrap();
        let b = TreeBuilder::new().entry(entry(b"abc", "a.db")).build().unwrap();
        assert_eq!(a.id, b.id);
    }

    #[test]
    fn test_order_matters() {
        let x = entry(b"x", "x.db");
        let y = entry(b"y", "y.db");
        let xy = TreeBuilder::new().entry(x.clone()).entry(y.clone()).build().unwrap();
        let yx = TreeBuilder::new().entry(y).entry(x).build().unwrap();
        assert_ne!(xy.id, yx.id);
    }

    #[test]
    fn test_each_field_changes_id() {
        let base = entry(b"abc", "a.db");
        let base_id = Tree::compute_id(&[base.clone()]);

        let mut renamed = base.clone();
        renamed.name = "b.db".to_string();
        let mut resized = base.clone();
        resized.size = 4;
        let mut touched = base.clone();
        touched.last_modified = ts() + chrono::Duration::seconds(1);

        for changed in [renamed, resized, touched] {
            assert_ne!(Tree::compute_id(&[changed]), base_id);
        }
    }

    #[test]
    fn test_subsecond_time_is_truncated() {
        let precise = ts() + chrono::Duration::milliseconds(250);
        let e = TreeEntry::database(
            BlobId::new(Digest::of(b"abc")),
            &DatabaseName::new("a.db").unwrap(),
            precise,
            3,
        );
        assert_eq!(e.last_modified, ts());
    }

    #[test]
    fn test_nul_in_name_rejected() {
        let mut e = entry(b"abc", "a.db");
        e.name = "a\0b".to_string();
        assert!(matches!(
            TreeBuilder::new().entry(e).build(),
            Err(StorageError::InvalidName(_))
        ));
    }

    #[test]
    fn test_store_roundtrip_and_verify() {
        let dir = TempDir::new().unwrap();
        let tmp = dir.path().join("tmp");
        std::fs::create_dir_all(&tmp).unwrap();
        let area = ObjectArea::open(ObjectKind::Tree, &dir.path().join("objects"), &tmp).unwrap();
        let store = TreeStore::new(area);

        let tree = TreeBuilder::new().entry(entry(b"abc", "a.db")).build().unwrap();
        store.put(&tree).unwrap();
        store.put(&tree).unwrap();

        assert_eq!(store.count().unwrap(), 1);
        assert_eq!(store.get(tree.id).unwrap(), tree);
        assert_eq!(
            tree.database_entry().unwrap().blob_id(),
            Some(BlobId::new(Digest::of(b"abc")))
        );
    }
}
