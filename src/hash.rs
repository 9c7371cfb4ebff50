//! Canonical object hashing and hex<->binary conversion.

use std::fmt;
use std::fs;
use std::os::unix::fs::FileTypeExt;
use std::path::Path;

use sha1::{Digest, Sha1};

use crate::error::{GitupError, Result};

/// Git object type, restricted to the four hashable kinds plus the two
/// delta encodings the pack format uses on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    Commit,
    Tree,
    Blob,
    Tag,
    OfsDelta,
    RefDelta,
}

impl ObjectKind {
    /// Name used in the canonical hash preimage (`"<type> <size>\0"`).
    /// Only meaningful for non-delta kinds.
    pub fn name(self) -> &'static str {
        match self {
            ObjectKind::Commit => "commit",
            ObjectKind::Tree => "tree",
            ObjectKind::Blob => "blob",
            ObjectKind::Tag => "tag",
            ObjectKind::OfsDelta => "ofs-delta",
            ObjectKind::RefDelta => "ref-delta",
        }
    }

    pub fn from_pack_type_tag(tag: u8) -> Option<ObjectKind> {
        match tag {
            1 => Some(ObjectKind::Commit),
            2 => Some(ObjectKind::Tree),
            3 => Some(ObjectKind::Blob),
            4 => Some(ObjectKind::Tag),
            6 => Some(ObjectKind::OfsDelta),
            7 => Some(ObjectKind::RefDelta),
            _ => None,
        }
    }

    pub fn is_delta(self) -> bool {
        matches!(self, ObjectKind::OfsDelta | ObjectKind::RefDelta)
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A 20-byte binary SHA-1 hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectHash(pub [u8; 20]);

impl ObjectHash {
    pub fn from_hex(hex_str: &str) -> Result<Self> {
        if hex_str.len() != 40 {
            return Err(GitupError::ConfigInvalid(format!(
                "corrupt hash: expected 40 hex characters, got {}",
                hex_str.len()
            )));
        }
        let mut bytes = [0u8; 20];
        hex::decode_to_slice(hex_str, &mut bytes).map_err(|e| {
            GitupError::ConfigInvalid(format!("corrupt hash '{hex_str}': {e}"))
        })?;
        Ok(ObjectHash(bytes))
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    pub fn short(self, len: usize) -> String {
        let full = self.to_hex();
        full[..len.min(full.len())].to_string()
    }
}

impl fmt::Display for ObjectHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Canonical object hash: `SHA-1("<type> <decimal-size>\0" || payload)`.
///
/// Only defined for the four non-delta types; callers must not pass a
/// delta kind here (the resolver always hashes the *resolved* buffer under
/// the base's concrete type).
pub fn canonical_hash(kind: ObjectKind, payload: &[u8]) -> ObjectHash {
    debug_assert!(!kind.is_delta(), "cannot hash a delta object directly");
    let mut hasher = Sha1::new();
    hasher.update(kind.name().as_bytes());
    hasher.update(b" ");
    hasher.update(payload.len().to_string().as_bytes());
    hasher.update(b"\0");
    hasher.update(payload);
    let digest = hasher.finalize();
    let mut bytes = [0u8; 20];
    bytes.copy_from_slice(&digest);
    ObjectHash(bytes)
}

pub fn sha1_bytes(data: &[u8]) -> ObjectHash {
    let mut hasher = Sha1::new();
    hasher.update(data);
    let digest = hasher.finalize();
    let mut bytes = [0u8; 20];
    bytes.copy_from_slice(&digest);
    ObjectHash(bytes)
}

/// Hashes a path on disk the way a blob object would hash: a symlink hashes
/// its link-target string, a regular file hashes its contents.
pub fn hash_file_as_blob(path: &Path) -> Result<ObjectHash> {
    let meta = fs::symlink_metadata(path).map_err(|e| GitupError::io(path, e))?;
    if meta.file_type().is_symlink() {
        let target = fs::read_link(path).map_err(|e| GitupError::io(path, e))?;
        let target_bytes = target.to_string_lossy();
        Ok(canonical_hash(ObjectKind::Blob, target_bytes.as_bytes()))
    } else if meta.file_type().is_file() || meta.file_type().is_char_device() {
        let contents = fs::read(path).map_err(|e| GitupError::io(path, e))?;
        Ok(canonical_hash(ObjectKind::Blob, &contents))
    } else {
        Err(GitupError::io(
            path,
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "not a regular file or symlink"),
        ))
    }
}

/// Hash an ignored path itself (its absolute path string), used when the
/// scanner wants a stand-in hash that never accidentally matches real
/// content.
pub fn hash_ignored_path(absolute_path: &Path) -> ObjectHash {
    sha1_bytes(absolute_path.to_string_lossy().as_bytes())
}
