//! The in-memory object index, with optional file-backed buffer spill
//! for low-memory mode.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::error::{GitupError, Result};
use crate::hash::{canonical_hash, ObjectHash, ObjectKind};

/// Where a base is found, recorded at pack-parse time so the delta resolver
/// never needs to re-derive it.
#[derive(Debug, Clone, Copy)]
pub enum BaseRef {
    None,
    OfsIndex(usize),
    RefHash(ObjectHash),
}

enum Storage {
    /// Always resident: non-low-memory mode, or a pre-pack source (manifest
    /// tree, local-loaded blob) that must never be spilled.
    Resident(Vec<u8>),
    /// Low-memory mode, pack-derived: bytes live in the scratch file, with
    /// an optional in-memory cache populated by `load_buffer`.
    Spilled { offset: u64, size: usize, cache: Option<Vec<u8>> },
}

pub struct StoredObject {
    pub kind: ObjectKind,
    pub hash: Option<ObjectHash>,
    pub pack_offset: u64,
    pub base: BaseRef,
    pub can_free: bool,
    storage: Storage,
}

impl StoredObject {
    pub fn is_delta(&self) -> bool {
        self.kind.is_delta()
    }
}

struct ScratchFile {
    file: File,
    len: u64,
}

pub struct ObjectStore {
    objects: Vec<StoredObject>,
    by_hash: BTreeMap<ObjectHash, usize>,
    scratch: Option<ScratchFile>,
    low_memory: bool,
    /// Once set, a duplicate hash insertion supersedes the prior index for
    /// materialization purposes (repair's replace-in-place behavior).
    pub repair: bool,
}

impl ObjectStore {
    pub fn new(low_memory: bool, scratch_path: Option<&Path>) -> Result<ObjectStore> {
        let scratch = if low_memory {
            let path = scratch_path.expect("low-memory mode requires a scratch path");
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .open(path)
                .map_err(|e| GitupError::io(path, e))?;
            // Unlink immediately: the fd keeps the data alive for the rest
            // of the run, and cleanup is guaranteed even on early exit.
            let _ = fs::remove_file(path);
            Some(ScratchFile { file, len: 0 })
        } else {
            None
        };

        Ok(ObjectStore {
            objects: Vec::new(),
            by_hash: BTreeMap::new(),
            scratch,
            low_memory,
            repair: false,
        })
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Inserts a raw pack-parsed entry (possibly a delta). Returns its
    /// stable insertion index.
    pub fn insert_pack_entry(&mut self, kind: ObjectKind, payload: Vec<u8>, pack_offset: u64, base: BaseRef) -> Result<usize> {
        let hash = if kind.is_delta() { None } else { Some(canonical_hash(kind, &payload)) };
        self.insert(kind, hash, payload, pack_offset, base, true)
    }

    /// Inserts a resolved (non-delta) buffer: either a delta's resolution
    /// result, a manifest-synthesized tree, or a locally-loaded blob.
    pub fn insert_resolved(&mut self, kind: ObjectKind, payload: Vec<u8>, can_free: bool) -> Result<usize> {
        let hash = canonical_hash(kind, &payload);
        if let Some(&existing) = self.by_hash.get(&hash) {
            if !self.repair {
                return Ok(existing);
            }
        }
        self.insert(kind, Some(hash), payload, 0, BaseRef::None, can_free)
    }

    fn insert(
        &mut self,
        kind: ObjectKind,
        hash: Option<ObjectHash>,
        payload: Vec<u8>,
        pack_offset: u64,
        base: BaseRef,
        can_free: bool,
    ) -> Result<usize> {
        let storage = if self.low_memory && can_free {
            let scratch = self.scratch.as_mut().expect("scratch file must exist in low-memory mode");
            let offset = scratch.len;
            scratch
                .file
                .seek(SeekFrom::Start(offset))
                .map_err(|e| GitupError::io("<scratch>", e))?;
            scratch
                .file
                .write_all(&payload)
                .map_err(|e| GitupError::io("<scratch>", e))?;
            scratch.len += payload.len() as u64;
            Storage::Spilled { offset, size: payload.len(), cache: None }
        } else {
            Storage::Resident(payload)
        };

        let index = self.objects.len();
        self.objects.push(StoredObject { kind, hash, pack_offset, base, can_free, storage });

        if let Some(h) = hash {
            if matches!(kind, ObjectKind::Commit | ObjectKind::Tree | ObjectKind::Blob | ObjectKind::Tag) {
                self.by_hash.insert(h, index);
            }
        }

        Ok(index)
    }

    pub fn get(&self, index: usize) -> &StoredObject {
        &self.objects[index]
    }

    pub fn index_by_hash(&self, hash: ObjectHash) -> Option<usize> {
        self.by_hash.get(&hash).copied()
    }

    /// Scans previously stored pack entries for one whose header began at
    /// `offset`, used to resolve an ofs-delta base.
    pub fn index_by_pack_offset(&self, offset: u64) -> Option<usize> {
        self.objects.iter().position(|o| o.pack_offset == offset)
    }

    pub fn load_buffer(&mut self, index: usize) -> Result<Vec<u8>> {
        let scratch = &mut self.scratch;
        match &mut self.objects[index].storage {
            Storage::Resident(buf) => Ok(buf.clone()),
            Storage::Spilled { offset, size, cache } => {
                if let Some(buf) = cache {
                    return Ok(buf.clone());
                }
                let scratch = scratch.as_mut().expect("spilled entry requires scratch file");
                let mut buf = vec![0u8; *size];
                scratch
                    .file
                    .seek(SeekFrom::Start(*offset))
                    .map_err(|e| GitupError::io("<scratch>", e))?;
                scratch
                    .file
                    .read_exact(&mut buf)
                    .map_err(|e| GitupError::io("<scratch>", e))?;
                *cache = Some(buf.clone());
                Ok(buf)
            }
        }
    }

    pub fn release_buffer(&mut self, index: usize) {
        let obj = &mut self.objects[index];
        if !obj.can_free {
            return;
        }
        if let Storage::Spilled { cache, .. } = &mut obj.storage {
            *cache = None;
        }
    }
}
