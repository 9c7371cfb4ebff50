//! Tree walker and materializer — walks commit -> tree -> {tree, blob},
//! diffs against the on-disk snapshot, writes/removes files, and emits the
//! new manifest.

use std::collections::BTreeSet;
use std::fs;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};

use crate::error::{GitupError, Result};
use crate::hash::{canonical_hash, hash_file_as_blob, ObjectHash, ObjectKind};
use crate::manifest::{Manifest, ManifestBlock, ManifestEntry};
use crate::scanner::{FileNode, LocalTree};
use crate::store::ObjectStore;

const MODE_TYPE_MASK: u32 = 0o170000;
const MODE_DIR: u32 = 0o040000;
const MODE_LINK: u32 = 0o120000;

pub struct WalkOutcome {
    pub manifest: Manifest,
    /// Target-state file nodes that differ from what's on disk, keyed by
    /// absolute path.
    pub remote_by_path: std::collections::BTreeMap<PathBuf, FileNode>,
}

/// Walks the commit named by `commit_hash`, reconciling against `local`.
/// `local`'s nodes are mutated in place: matched paths get `keep=true`.
pub fn walk(store: &mut ObjectStore, local: &mut LocalTree, target_dir: &Path, commit_hash: ObjectHash) -> Result<WalkOutcome> {
    let commit_bytes = object_bytes(store, local, commit_hash, None)?;
    if commit_bytes.len() < 45 || &commit_bytes[0..5] != b"tree " {
        return Err(GitupError::MissingObject(format!("commit {commit_hash} has no leading tree header")));
    }
    let tree_hex = std::str::from_utf8(&commit_bytes[5..45])
        .map_err(|_| GitupError::MissingObject(format!("commit {commit_hash} has non-UTF8 tree header")))?;
    let tree_hash = ObjectHash::from_hex(tree_hex)?;

    let mut remote_by_path = std::collections::BTreeMap::new();
    let blocks = walk_tree(store, local, target_dir, &mut remote_by_path, tree_hash, "")?;

    Ok(WalkOutcome { manifest: Manifest { have: commit_hash, blocks }, remote_by_path })
}

/// Builds a walk outcome directly from a repair plan's defects, without
/// re-walking the commit: a targeted repair fetch only returns the
/// defective blobs, never the commit or tree objects that a real walk
/// would need to read first. The manifest passed in is the prior one,
/// unchanged — repair never discovers new structure, only refreshes bytes
/// for paths the manifest already knew about.
pub fn outcome_from_defects(manifest: Manifest, target_dir: &Path, defects: &[crate::repair::Defect]) -> WalkOutcome {
    let mut remote_by_path = std::collections::BTreeMap::new();
    for defect in defects {
        let abs_path = target_dir.join(&defect.path);
        remote_by_path.insert(
            abs_path.clone(),
            FileNode { mode: defect.mode, hash: defect.want, path: abs_path, keep: true, save: true },
        );
    }
    WalkOutcome { manifest, remote_by_path }
}

fn walk_tree(
    store: &mut ObjectStore,
    local: &mut LocalTree,
    target_dir: &Path,
    remote_by_path: &mut std::collections::BTreeMap<PathBuf, FileNode>,
    tree_hash: ObjectHash,
    rel_path: &str,
) -> Result<Vec<ManifestBlock>> {
    let tree_bytes = object_bytes(store, local, tree_hash, None)?;
    let parsed = parse_tree_entries(&tree_bytes)?;

    let mut own_entries = Vec::with_capacity(parsed.len());
    let mut descendants = Vec::new();

    for (mode, name, hash) in parsed {
        let abs_path = if rel_path.is_empty() { target_dir.join(&name) } else { target_dir.join(rel_path).join(&name) };
        own_entries.push(ManifestEntry { mode, hash, name: name.clone() });

        if mode & MODE_TYPE_MASK == MODE_DIR {
            if let Some(node) = local.get_mut(&abs_path) {
                node.keep = true;
            }
            let child_rel = if rel_path.is_empty() { name.clone() } else { format!("{rel_path}/{name}") };
            let child_blocks = walk_tree(store, local, target_dir, remote_by_path, hash, &child_rel)?;
            descendants.extend(child_blocks);
            continue;
        }

        if store.index_by_hash(hash).is_none() && local.load_from_local(store, Some(hash), Some(&abs_path))?.is_none() {
            return Err(GitupError::MissingObject(hash.to_hex()));
        }

        let matches_local = local.get(&abs_path).map(|n| n.hash == hash).unwrap_or(false);
        if matches_local {
            if let Some(node) = local.get_mut(&abs_path) {
                node.keep = true;
                node.save = false;
            }
        } else {
            if let Some(node) = local.get_mut(&abs_path) {
                node.keep = true; // retained and overwritten, not deleted
            }
            remote_by_path.insert(abs_path.clone(), FileNode { mode, hash, path: abs_path, keep: true, save: true });
        }
    }

    let own_hash = {
        let mut buffer = Vec::new();
        for entry in &own_entries {
            buffer.extend_from_slice(format!("{:o} {}\0", entry.mode, entry.name).as_bytes());
            buffer.extend_from_slice(&entry.hash.0);
        }
        canonical_hash(ObjectKind::Tree, &buffer)
    };
    debug_assert_eq!(own_hash, tree_hash, "recomputed tree hash must match the walked object");

    let mut blocks = vec![ManifestBlock { path: rel_path.to_string(), hash: tree_hash, entries: own_entries }];
    blocks.extend(descendants);
    Ok(blocks)
}

fn parse_tree_entries(bytes: &[u8]) -> Result<Vec<(u32, String, ObjectHash)>> {
    let mut entries = Vec::new();
    let mut cursor = 0usize;
    while cursor < bytes.len() {
        let space = bytes[cursor..]
            .iter()
            .position(|&b| b == b' ')
            .ok_or_else(|| GitupError::MissingObject("truncated tree entry mode".into()))?;
        let mode_str = std::str::from_utf8(&bytes[cursor..cursor + space])
            .map_err(|_| GitupError::MissingObject("non-UTF8 tree entry mode".into()))?;
        let mode = u32::from_str_radix(mode_str, 8).map_err(|_| GitupError::MissingObject("bad octal tree mode".into()))?;
        cursor += space + 1;

        let nul = bytes[cursor..]
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| GitupError::MissingObject("truncated tree entry name".into()))?;
        let name = String::from_utf8_lossy(&bytes[cursor..cursor + nul]).into_owned();
        cursor += nul + 1;

        if cursor + 20 > bytes.len() {
            return Err(GitupError::MissingObject("truncated tree entry hash".into()));
        }
        let mut raw = [0u8; 20];
        raw.copy_from_slice(&bytes[cursor..cursor + 20]);
        cursor += 20;

        entries.push((mode, name, ObjectHash(raw)));
    }
    Ok(entries)
}

fn object_bytes(store: &mut ObjectStore, local: &LocalTree, hash: ObjectHash, path: Option<&Path>) -> Result<Vec<u8>> {
    if let Some(idx) = store.index_by_hash(hash) {
        return store.load_buffer(idx);
    }
    if let Some(idx) = local.load_from_local(store, Some(hash), path)? {
        return store.load_buffer(idx);
    }
    Err(GitupError::MissingObject(hash.to_hex()))
}

pub struct Display<'a> {
    pub target_dir: &'a Path,
    pub verbosity: u8,
    pub display_depth: Option<usize>,
    pub trim_by_path: BTreeSet<String>,
}

impl<'a> Display<'a> {
    pub fn new(target_dir: &'a Path, verbosity: u8, display_depth: Option<usize>) -> Self {
        Display { target_dir, verbosity, display_depth, trim_by_path: BTreeSet::new() }
    }

    fn emit(&mut self, sign: char, path: &Path) {
        if self.verbosity < 1 {
            return;
        }
        let rel = path.strip_prefix(self.target_dir).unwrap_or(path);
        let shown = match self.display_depth {
            Some(depth) if depth > 0 => {
                let truncated: PathBuf = rel.components().take(depth).collect();
                truncated
            }
            _ => rel.to_path_buf(),
        };
        let shown_str = shown.to_string_lossy().into_owned();
        if self.trim_by_path.insert(shown_str.clone()) {
            println!("{sign} {shown_str}");
        }
    }
}

/// Writes every `save=true` node (clone/pull). Returns the absolute paths of
/// any file named `UPDATING` that was written, for the caller's notice.
pub fn materialize_writes(
    store: &mut ObjectStore,
    remote_by_path: &std::collections::BTreeMap<PathBuf, FileNode>,
    display: &mut Display,
) -> Result<Vec<PathBuf>> {
    let mut updating_notices = Vec::new();

    for node in remote_by_path.values().filter(|n| n.save) {
        let existed = node.path.symlink_metadata().is_ok();
        write_node(store, node)?;
        display.emit(if existed { '*' } else { '+' }, &node.path);
        if node.path.file_name().map(|n| n == "UPDATING").unwrap_or(false) {
            updating_notices.push(node.path.clone());
        }
    }

    Ok(updating_notices)
}

/// Repair mode: only rewrite nodes whose on-disk content hash doesn't match.
pub fn materialize_repair(
    store: &mut ObjectStore,
    remote_by_path: &std::collections::BTreeMap<PathBuf, FileNode>,
    local: &mut LocalTree,
    display: &mut Display,
) -> Result<()> {
    for node in remote_by_path.values() {
        if store.index_by_hash(node.hash).is_none() {
            continue;
        }
        let current = hash_file_as_blob(&node.path).ok();
        if current != Some(node.hash) {
            write_node(store, node)?;
            display.emit('*', &node.path);
        }
        if let Some(local_node) = local.get_mut(&node.path) {
            local_node.keep = true;
        }
    }
    Ok(())
}

fn write_node(store: &mut ObjectStore, node: &FileNode) -> Result<()> {
    if let Some(parent) = node.path.parent() {
        fs::create_dir_all(parent).map_err(|e| GitupError::io(parent, e))?;
        let _ = fs::set_permissions(parent, fs::Permissions::from_mode(0o755));
    }

    let bytes = object_bytes_from_hash(store, node.hash)?;

    if node.mode & MODE_TYPE_MASK == MODE_LINK {
        let target = String::from_utf8_lossy(&bytes).into_owned();
        let _ = fs::remove_file(&node.path);
        std::os::unix::fs::symlink(target, &node.path).map_err(|e| GitupError::io(&node.path, e))?;
        return Ok(());
    }

    use std::fs::OpenOptions;
    use std::io::Write;
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(&node.path)
        .map_err(|e| GitupError::io(&node.path, e))?;
    file.write_all(&bytes).map_err(|e| GitupError::io(&node.path, e))?;
    drop(file);
    fs::set_permissions(&node.path, fs::Permissions::from_mode(node.mode & 0o7777)).map_err(|e| GitupError::io(&node.path, e))?;
    Ok(())
}

fn object_bytes_from_hash(store: &mut ObjectStore, hash: ObjectHash) -> Result<Vec<u8>> {
    let idx = store.index_by_hash(hash).ok_or_else(|| GitupError::MissingObject(hash.to_hex()))?;
    store.load_buffer(idx)
}

/// Removes every local-by-path node with `keep=false` that isn't ignored.
/// Reverse path order visits children before their parent directory.
pub fn prune(local: &LocalTree, target_dir: &Path, ignore_prefixes: &[String], display: &mut Display) -> Result<()> {
    for node in local.by_path.values().rev() {
        if node.keep {
            continue;
        }
        let text = node.path.to_string_lossy();
        if ignore_prefixes.iter().any(|p| text.starts_with(p.as_str())) {
            continue;
        }
        ensure_within(target_dir, &node.path)?;

        let meta = match fs::symlink_metadata(&node.path) {
            Ok(m) => m,
            Err(_) => continue, // already gone
        };

        if meta.is_dir() {
            let _ = fs::remove_dir(&node.path); // non-empty (ignored contents) is fine to leave
        } else {
            fs::remove_file(&node.path).map_err(|e| GitupError::io(&node.path, e))?;
        }
        display.emit('-', &node.path);
    }
    Ok(())
}

fn ensure_within(target_dir: &Path, path: &Path) -> Result<()> {
    let has_parent_component = path.components().any(|c| matches!(c, std::path::Component::ParentDir));
    if has_parent_component || !path.starts_with(target_dir) {
        return Err(GitupError::PathEscape(path.to_path_buf()));
    }
    Ok(())
}
