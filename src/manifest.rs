//! Persisted remote-state manifest: the prior-run oracle and, on reload, a
//! source of synthetic tree-object buffers that let an incremental pull use
//! prior trees as delta bases.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{GitupError, Result};
use crate::hash::{canonical_hash, ObjectHash, ObjectKind};
use crate::store::ObjectStore;

const DIR_MODE_MASK: u32 = 0o170000;
const DIR_MODE_TAG: u32 = 0o040000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    pub mode: u32,
    pub hash: ObjectHash,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestBlock {
    /// Relative path of this tree, root is empty, always rendered with a
    /// trailing `/`.
    pub path: String,
    pub hash: ObjectHash,
    pub entries: Vec<ManifestEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    pub have: ObjectHash,
    pub blocks: Vec<ManifestBlock>,
}

impl Manifest {
    pub fn new(have: ObjectHash) -> Self {
        Manifest { have, blocks: Vec::new() }
    }

    pub fn load(path: &Path) -> Result<Option<Manifest>> {
        match fs::read_to_string(path) {
            Ok(text) => Ok(Some(Self::parse(&text)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(GitupError::io(path, e)),
        }
    }

    pub fn parse(text: &str) -> Result<Manifest> {
        let mut lines = text.lines();
        let have_line = lines.next().ok_or_else(|| malformed("empty manifest"))?;
        let have = ObjectHash::from_hex(have_line)?;

        let mut blocks = Vec::new();
        let mut current: Option<ManifestBlock> = None;

        for line in lines {
            if line.is_empty() {
                if let Some(block) = current.take() {
                    blocks.push(block);
                }
                continue;
            }

            let fields: Vec<&str> = line.split('\t').collect();
            if fields.len() != 3 {
                return Err(malformed("expected 3 tab-separated fields"));
            }

            let is_header = fields[2].ends_with('/');
            if is_header {
                if current.is_some() {
                    return Err(malformed("missing blank line between tree blocks"));
                }
                let hash = ObjectHash::from_hex(fields[1])?;
                current = Some(ManifestBlock { path: fields[2].trim_end_matches('/').to_string(), hash, entries: Vec::new() });
            } else {
                let mode = u32::from_str_radix(fields[0], 8).map_err(|_| malformed("bad octal mode"))?;
                let hash = ObjectHash::from_hex(fields[1])?;
                let block = current.as_mut().ok_or_else(|| malformed("entry line before any tree header"))?;
                block.entries.push(ManifestEntry { mode, hash, name: fields[2].to_string() });
            }
        }

        if let Some(block) = current.take() {
            blocks.push(block);
        }

        Ok(Manifest { have, blocks })
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str(&self.have.to_hex());
        out.push('\n');

        for block in &self.blocks {
            out.push_str(&format!("{:o}\t{}\t{}/\n", DIR_MODE_TAG, block.hash.to_hex(), block.path));
            for entry in &block.entries {
                out.push_str(&format!("{:o}\t{}\t{}\n", entry.mode, entry.hash.to_hex(), entry.name));
            }
            out.push('\n');
        }

        out
    }

    /// Atomically replaces `path`'s contents: written to `<path>.new`, then
    /// renamed over the original only on completion, so a crash mid-write
    /// never leaves a partial manifest in place.
    pub fn write_atomic(&self, path: &Path) -> Result<()> {
        let tmp = path.with_extension("new");
        fs::write(&tmp, self.render()).map_err(|e| GitupError::io(&tmp, e))?;
        fs::rename(&tmp, path).map_err(|e| GitupError::io(path, e))?;
        Ok(())
    }

    /// Re-derives the packed tree-object bytes for every block and inserts
    /// them as resolved, non-freeable objects so an incremental fetch can
    /// reference them as delta bases.
    pub fn synthesize_tree_objects(&self, store: &mut ObjectStore) -> Result<BTreeMap<ObjectHash, usize>> {
        let mut indices = BTreeMap::new();
        for block in &self.blocks {
            let mut buffer = Vec::new();
            for entry in &block.entries {
                buffer.extend_from_slice(format!("{:o} {}\0", entry.mode, entry.name).as_bytes());
                buffer.extend_from_slice(&entry.hash.0);
            }
            let computed = canonical_hash(ObjectKind::Tree, &buffer);
            if computed != block.hash {
                return Err(malformed("manifest tree block hash does not match its recorded entries"));
            }
            let idx = store.insert_resolved(ObjectKind::Tree, buffer, false)?;
            indices.insert(block.hash, idx);
        }
        Ok(indices)
    }

    /// Directory path -> mode, read off subtree entries, for the scanner to
    /// use when a freshly-walked directory has no mode of its own: a
    /// directory inherits the mode the manifest last recorded for it.
    pub fn dir_modes(&self, target_dir: &Path) -> BTreeMap<PathBuf, u32> {
        let mut modes = BTreeMap::new();
        for block in &self.blocks {
            for entry in &block.entries {
                if entry.mode & DIR_MODE_MASK == DIR_MODE_TAG {
                    let mut path = target_dir.to_path_buf();
                    if !block.path.is_empty() {
                        path.push(&block.path);
                    }
                    path.push(&entry.name);
                    modes.insert(path, entry.mode);
                }
            }
        }
        modes
    }
}

fn malformed(detail: &str) -> GitupError {
    GitupError::ConfigInvalid(format!("malformed manifest: {detail}"))
}
