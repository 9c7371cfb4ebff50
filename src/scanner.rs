//! Local filesystem scanner — builds the on-disk snapshot (local-by-path,
//! local-by-hash) used by the tree walker and repair planner, and
//! serves as the delta resolver's fallback object source.

use std::collections::BTreeMap;
use std::fs;
use std::os::unix::fs::{FileTypeExt, PermissionsExt};
use std::path::{Path, PathBuf};

use crate::error::{GitupError, Result};
use crate::hash::{hash_file_as_blob, hash_ignored_path, ObjectHash, ObjectKind};
use crate::store::ObjectStore;

const DEFAULT_DIR_MODE: u32 = 0o040000;

#[derive(Debug, Clone)]
pub struct FileNode {
    pub mode: u32,
    pub hash: ObjectHash,
    pub path: PathBuf,
    pub keep: bool,
    pub save: bool,
}

/// The on-disk snapshot of the target directory, indexed both ways.
#[derive(Debug)]
pub struct LocalTree {
    pub by_path: BTreeMap<PathBuf, FileNode>,
    by_hash: BTreeMap<ObjectHash, PathBuf>,
}

impl LocalTree {
    pub fn new(by_path: BTreeMap<PathBuf, FileNode>, by_hash: BTreeMap<ObjectHash, PathBuf>) -> Self {
        LocalTree { by_path, by_hash }
    }

    pub fn get(&self, path: &Path) -> Option<&FileNode> {
        self.by_path.get(path)
    }

    pub fn get_mut(&mut self, path: &Path) -> Option<&mut FileNode> {
        self.by_path.get_mut(path)
    }

    pub fn path_for_hash(&self, hash: ObjectHash) -> Option<&Path> {
        self.by_hash.get(&hash).map(PathBuf::as_path)
    }

    pub fn iter(&self) -> impl Iterator<Item = &FileNode> {
        self.by_path.values()
    }

    /// Looks up by hash then by path and, if a regular file or symlink
    /// matches, returns the bytes a blob object would hold for it. Doesn't
    /// touch the object store, so it's safe to call while the store is
    /// already borrowed elsewhere in the delta resolver's loop.
    pub fn find_blob_bytes(&self, hash: Option<ObjectHash>, path: Option<&Path>) -> Result<Option<Vec<u8>>> {
        let by_hash_hit = hash.and_then(|h| self.by_hash.get(&h));
        let by_path_hit = path.filter(|p| self.by_path.contains_key(*p));
        let candidate = match (by_hash_hit, by_path_hit) {
            (Some(p), _) => p.clone(),
            (None, Some(p)) => p.to_path_buf(),
            (None, None) => return Ok(None),
        };

        let meta = match fs::symlink_metadata(&candidate) {
            Ok(meta) => meta,
            Err(_) => return Ok(None),
        };

        let bytes = if meta.file_type().is_symlink() {
            fs::read_link(&candidate)
                .map_err(|e| GitupError::io(&candidate, e))?
                .to_string_lossy()
                .into_owned()
                .into_bytes()
        } else if meta.file_type().is_file() {
            fs::read(&candidate).map_err(|e| GitupError::io(&candidate, e))?
        } else {
            return Ok(None);
        };

        Ok(Some(bytes))
    }

    /// Fallback when a ref-delta base or a walked tree entry is
    /// absent from the store: resolve via [`find_blob_bytes`] and insert it
    /// into `store` as a resolved blob.
    pub fn load_from_local(
        &self,
        store: &mut ObjectStore,
        hash: Option<ObjectHash>,
        path: Option<&Path>,
    ) -> Result<Option<usize>> {
        match self.find_blob_bytes(hash, path)? {
            Some(bytes) => Ok(Some(store.insert_resolved(ObjectKind::Blob, bytes, false)?)),
            None => Ok(None),
        }
    }
}

pub struct Scanner<'a> {
    target_dir: PathBuf,
    ignore_prefixes: &'a [String],
    manifest_dir_modes: &'a BTreeMap<PathBuf, u32>,
}

impl<'a> Scanner<'a> {
    pub fn new(target_dir: impl Into<PathBuf>, ignore_prefixes: &'a [String], manifest_dir_modes: &'a BTreeMap<PathBuf, u32>) -> Self {
        Scanner { target_dir: target_dir.into(), ignore_prefixes, manifest_dir_modes }
    }

    pub fn scan(&self) -> Result<LocalTree> {
        let mut by_path = BTreeMap::new();
        let mut by_hash = BTreeMap::new();

        if self.target_dir.exists() {
            self.walk(&self.target_dir, &mut by_path, &mut by_hash)?;
        }

        Ok(LocalTree { by_path, by_hash })
    }

    fn is_ignored(&self, path: &Path) -> bool {
        let text = path.to_string_lossy();
        self.ignore_prefixes.iter().any(|prefix| text.starts_with(prefix.as_str()))
    }

    fn walk(
        &self,
        dir: &Path,
        by_path: &mut BTreeMap<PathBuf, FileNode>,
        by_hash: &mut BTreeMap<ObjectHash, PathBuf>,
    ) -> Result<()> {
        let entries = fs::read_dir(dir).map_err(|e| GitupError::io(dir, e))?;

        for entry in entries {
            let entry = entry.map_err(|e| GitupError::io(dir, e))?;
            let path = entry.path();
            let file_name = entry.file_name();

            if file_name == ".git" {
                return Err(GitupError::CoexistenceRefused(path));
            }

            let meta = fs::symlink_metadata(&path).map_err(|e| GitupError::io(&path, e))?;
            let file_type = meta.file_type();

            if file_type.is_symlink() || file_type.is_file() || file_type.is_char_device() {
                let hash = if self.is_ignored(&path) {
                    hash_ignored_path(&path)
                } else {
                    hash_file_as_blob(&path)?
                };
                let mode = if file_type.is_symlink() {
                    0o120000
                } else {
                    0o100000 | (meta.permissions().mode() & 0o7777)
                };
                let node = FileNode { mode, hash, path: path.clone(), keep: false, save: false };
                by_hash.entry(hash).or_insert_with(|| path.clone());
                by_path.insert(path, node);
            } else if file_type.is_dir() {
                let mode = self.manifest_dir_modes.get(&path).copied().unwrap_or(DEFAULT_DIR_MODE);
                let hash = hash_ignored_path(&path);
                by_path.insert(path.clone(), FileNode { mode, hash, path: path.clone(), keep: false, save: false });
                self.walk(&path, by_path, by_hash)?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scan_indexes_regular_files_by_path_and_hash() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"hello\n").unwrap();
        let modes = BTreeMap::new();
        let scanner = Scanner::new(dir.path(), &[], &modes);
        let tree = scanner.scan().unwrap();

        let node = tree.get(&dir.path().join("a.txt")).unwrap();
        assert_eq!(node.hash.to_hex(), "ce013625030ba8dba906f756967f9e9ca394464a");
        assert!(tree.path_for_hash(node.hash).is_some());
    }

    #[test]
    fn scan_refuses_git_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join(".git")).unwrap();
        let modes = BTreeMap::new();
        let scanner = Scanner::new(dir.path(), &[], &modes);
        let err = scanner.scan().unwrap_err();
        assert!(matches!(err, GitupError::CoexistenceRefused(_)));
    }

    #[test]
    fn ignored_paths_hash_by_path_not_content() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("obj"), b"binary junk").unwrap();
        let ignore_path = dir.path().join("obj").to_string_lossy().into_owned();
        let modes = BTreeMap::new();
        let scanner = Scanner::new(dir.path(), std::slice::from_ref(&ignore_path), &modes);
        let tree = scanner.scan().unwrap();
        let node = tree.get(&dir.path().join("obj")).unwrap();
        assert_eq!(node.hash, hash_ignored_path(&dir.path().join("obj")));
    }

    #[test]
    fn load_from_local_reads_matching_file_by_hash() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"hello\n").unwrap();
        let modes = BTreeMap::new();
        let scanner = Scanner::new(dir.path(), &[], &modes);
        let tree = scanner.scan().unwrap();

        let mut store = ObjectStore::new(false, None).unwrap();
        let target_hash = crate::hash::canonical_hash(ObjectKind::Blob, b"hello\n");
        let idx = tree.load_from_local(&mut store, Some(target_hash), None).unwrap().unwrap();
        assert_eq!(store.load_buffer(idx).unwrap(), b"hello\n");
    }
}
