//! Content-addressed object areas.
//!
//! Each object kind (blobs, trees, commits) lives in its own area keyed by
//! digest, fanned out on the first two hex characters:
//!
//! ```text
//! objects/commits/3f/a1c0...
//! ```
//!
//! Objects are written to a private temp file under `tmp/` and renamed into
//! place, so a reader never observes a partially written object under its
//! final name. The containing directory is synced after the rename, so an
//! object is durable before anything that references it is published.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::types::Digest;

/// Flush a directory's entries to disk.
pub(crate) fn sync_dir(dir: &Path) -> io::Result<()> {
    File::open(dir)?.sync_all()
}

/// Create `dir` if missing, syncing its parent when it was created.
///
/// The parent must already exist.
pub(crate) fn create_dir_durable(dir: &Path) -> io::Result<()> {
    match fs::create_dir(dir) {
        Ok(()) => match dir.parent() {
            Some(parent) => sync_dir(parent),
            None => Ok(()),
        },
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(()),
        Err(e) => Err(e),
    }
}

/// The object kinds kept in separate areas.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    Blob,
    Tree,
    Commit,
}

impl ObjectKind {
    /// directory name of the area
    pub fn dir_name(self) -> &'static str {
        match self {
            ObjectKind::Blob => "blobs",
            ObjectKind::Tree => "trees",
            ObjectKind::Commit => "commits",
        }
    }
}

impl std::fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ObjectKind::Blob => "blob",
            ObjectKind::Tree => "tree",
            ObjectKind::Commit => "commit",
        };
        f.write_str(s)
    }
}

/// One write-once, content-addressed directory.
#[derive(Debug, Clone)]
pub(crate) struct ObjectArea {
    kind: ObjectKind,
    dir: PathBuf,
    tmp_dir: PathBuf,
}

impl ObjectArea {
    /// open the area under `objects_dir`, creating it if needed
    pub fn open(kind: ObjectKind, objects_dir: &Path, tmp_dir: &Path) -> StorageResult<Self> {
        let dir = objects_dir.join(kind.dir_name());
        fs::create_dir_all(&dir)
            .map_err(StorageError::io_with(format!("creating the {} area", kind)))?;

        Ok(Self {
            kind,
            dir,
            tmp_dir: tmp_dir.to_path_buf(),
        })
    }

    fn path_for(&self, digest: &Digest) -> PathBuf {
        let hex = digest.to_hex();
        self.dir.join(&hex[..2]).join(&hex[2..])
    }

    /// Check whether an object is present.
    ///
    /// Only a definite "no such file" counts as absent; any other failure is
    /// surfaced so a transient error is never mistaken for absence.
    pub fn contains(&self, digest: &Digest) -> StorageResult<bool> {
        match fs::metadata(self.path_for(digest)) {
            Ok(meta) if meta.is_file() => Ok(true),
            Ok(_) => Err(StorageError::corrupted(
                digest,
                format!("{} entry is not a regular file", self.kind),
            )),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StorageError::io(
                format!("checking {} {}", self.kind, digest.short()),
                e,
            )),
        }
    }

    /// Write an object under its digest.
    ///
    /// Returns `false` if the object was already present. Concurrent writers
    /// of the same digest both succeed; the rename is atomic and the
    /// contents are identical.
    pub fn write(&self, digest: &Digest, bytes: &[u8]) -> StorageResult<bool> {
        if self.contains(digest)? {
            return Ok(false);
        }

        let dest = self.path_for(digest);
        let fan_out = dest.parent().unwrap_or(&self.dir);
        create_dir_durable(fan_out)
            .map_err(StorageError::io_with(format!("creating the {} fan-out", self.kind)))?;

        let context = || format!("writing {} {}", self.kind, digest.short());
        let mut tmp = NamedTempFile::new_in(&self.tmp_dir).map_err(StorageError::io_with(context()))?;
        tmp.write_all(bytes).map_err(StorageError::io_with(context()))?;
        tmp.as_file()
            .sync_all()
            .map_err(StorageError::io_with(context()))?;
        tmp.persist(&dest)
            .map_err(|e| StorageError::io(context(), e.error))?;
        sync_dir(fan_out).map_err(StorageError::io_with(context()))?;

        Ok(true)
    }

    /// Read an object, `None` if absent.
    pub fn read(&self, digest: &Digest) -> StorageResult<Option<Vec<u8>>> {
        match fs::read(self.path_for(digest)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StorageError::io(
                format!("reading {} {}", self.kind, digest.short()),
                e,
            )),
        }
    }

    /// Count stored objects.
    pub fn count(&self) -> StorageResult<usize> {
        let context = || format!("listing the {} area", self.kind);
        let mut total = 0;
        for fan in fs::read_dir(&self.dir).map_err(StorageError::io_with(context()))? {
            let fan = fan.map_err(StorageError::io_with(context()))?;
            if !fan.file_type().map_err(StorageError::io_with(context()))?.is_dir() {
                continue;
            }
            for entry in fs::read_dir(fan.path()).map_err(StorageError::io_with(context()))? {
                let entry = entry.map_err(StorageError::io_with(context()))?;
                if entry.file_type().map_err(StorageError::io_with(context()))?.is_file() {
                    total += 1;
                }
            }
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup() -> (TempDir, ObjectArea) {
        let dir = TempDir::new().unwrap();
        let tmp = dir.path().join("tmp");
        fs::create_dir_all(&tmp).unwrap();
        let area = ObjectArea::open(ObjectKind::Blob, &dir.path().join("objects"), &tmp).unwrap();
        (dir, area)
    }

    #[test]
    fn test_write_then_read() {
        let (_dir, area) = setup();
        let digest = Digest::of(b"payload");

        assert!(!area.contains(&digest).unwrap());
        assert!(area.write(&digest, b"payload").unwrap());
        assert!(area.contains(&digest).unwrap());
        assert_eq!(area.read(&digest).unwrap().unwrap(), b"payload");
    }

    #[test]
    fn test_second_write_is_noop() {
        let (_dir, area) = setup();
        let digest = Digest::of(b"payload");

        assert!(area.write(&digest, b"payload").unwrap());
        assert!(!area.write(&digest, b"payload").unwrap());
        assert_eq!(area.count().unwrap(), 1);
    }

    #[test]
    fn test_missing_reads_none() {
        let (_dir, area) = setup();
        assert!(area.read(&Digest::of(b"nope")).unwrap().is_none());
    }

    #[test]
    fn test_no_temp_files_left_behind() {
        let (dir, area) = setup();
        area.write(&Digest::of(b"a"), b"a").unwrap();
        area.write(&Digest::of(b"b"), b"b").unwrap();

        let leftovers = fs::read_dir(dir.path().join("tmp")).unwrap().count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn test_io_failure_is_not_absence() {
        let (dir, area) = setup();
        let digest = Digest::of(b"payload");

        // a plain file where the fan-out directory belongs
        let hex = digest.to_hex();
        fs::write(dir.path().join("objects/blobs").join(&hex[..2]), b"junk").unwrap();

        let err = area.contains(&digest).unwrap_err();
        assert_eq!(err.kind(), crate::storage::ErrorKind::Internal);
        assert!(!err.is_not_found());

        let err = area.read(&digest).unwrap_err();
        assert_eq!(err.kind(), crate::storage::ErrorKind::Internal);

        let err = area.write(&digest, b"payload").unwrap_err();
        assert_eq!(err.kind(), crate::storage::ErrorKind::Internal);
    }
}
