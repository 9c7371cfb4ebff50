//! Delta chain resolution — walking ofs-delta/ref-delta chains back to
//! a concrete base and applying the copy/insert instruction stream.

use std::collections::HashMap;

use crate::error::{GitupError, Result};
use crate::hash::{ObjectHash, ObjectKind};
use crate::pack::PackSummary;
use crate::store::{BaseRef, ObjectStore};

/// Resolves every delta reachable from `summary`'s pack entries, in reverse
/// insertion order. `load_local` is the scanner's `load_from_local`
/// fallback for a ref-delta base not already present in the store (by hash
/// or as a pre-loaded manifest/local object): it returns the blob's bytes
/// if a local file matches.
pub fn resolve_all(
    store: &mut ObjectStore,
    summary: &PackSummary,
    mut load_local: impl FnMut(ObjectHash) -> Result<Option<Vec<u8>>>,
) -> Result<()> {
    let mut resolved_of: HashMap<usize, usize> = HashMap::new();

    for &idx in summary.indices.iter().rev() {
        if store.get(idx).is_delta() {
            resolve_chain(store, idx, &mut resolved_of, &mut load_local)?;
        }
    }

    Ok(())
}

/// Returns the insertion index of `idx`'s fully-resolved, concretely-typed
/// counterpart (itself, if `idx` is already non-delta).
fn resolve_chain(
    store: &mut ObjectStore,
    idx: usize,
    resolved_of: &mut HashMap<usize, usize>,
    load_local: &mut impl FnMut(ObjectHash) -> Result<Option<Vec<u8>>>,
) -> Result<usize> {
    if let Some(&r) = resolved_of.get(&idx) {
        return Ok(r);
    }
    if !store.get(idx).is_delta() {
        resolved_of.insert(idx, idx);
        return Ok(idx);
    }

    // Walk backward from `idx`, pushing every delta we cross, until we land
    // on a concrete (non-delta) base.
    let mut chain = vec![idx];
    let mut cursor = idx;
    let base_idx = loop {
        let base = match store.get(cursor).base {
            BaseRef::None => unreachable!("delta entries always carry a base reference"),
            BaseRef::OfsIndex(b) => b,
            BaseRef::RefHash(hash) => match store.index_by_hash(hash) {
                Some(existing) => existing,
                None => {
                    let bytes = load_local(hash)?
                        .ok_or_else(|| GitupError::MissingDeltaBase(hash.to_hex()))?;
                    let synthesized = store.insert_resolved(ObjectKind::Blob, bytes, false)?;
                    break synthesized;
                }
            },
        };

        if let Some(&r) = resolved_of.get(&base) {
            break r;
        }
        if !store.get(base).is_delta() {
            resolved_of.insert(base, base);
            break base;
        }
        chain.push(base);
        cursor = base;
    };

    // Apply from the base-adjacent delta (last pushed) out to the
    // outermost one (`idx`, pushed first).
    let mut working = store.load_buffer(base_idx)?;
    let target_kind = store.get(base_idx).kind;
    let mut current_base_idx = base_idx;

    while let Some(delta_idx) = chain.pop() {
        let delta_program = store.load_buffer(delta_idx)?;
        let resolved_bytes = apply_delta(&working, &delta_program)?;
        let resolved_idx = store.insert_resolved(target_kind, resolved_bytes.clone(), true)?;
        resolved_of.insert(delta_idx, resolved_idx);
        store.release_buffer(current_base_idx);
        working = resolved_bytes;
        current_base_idx = resolved_idx;
    }

    Ok(current_base_idx)
}

/// Applies a single delta instruction stream against `base`: a leading
/// pair of 7-bit-LE varints (source size, target size), then a sequence
/// of copy (MSB=1) / insert (MSB=0) instructions.
fn apply_delta(base: &[u8], delta: &[u8]) -> Result<Vec<u8>> {
    let mut cursor = 0usize;
    let source_size = read_varint(delta, &mut cursor)?;
    let target_size = read_varint(delta, &mut cursor)?;

    if source_size != base.len() {
        return Err(GitupError::DeltaOverflow);
    }

    let mut out = Vec::with_capacity(target_size);

    while cursor < delta.len() {
        let instruction = delta[cursor];
        cursor += 1;

        if instruction & 0x80 != 0 {
            let mut offset = 0usize;
            for bit in 0..4 {
                if instruction & (1 << bit) != 0 {
                    let byte = *delta.get(cursor).ok_or(GitupError::DeltaOverflow)?;
                    cursor += 1;
                    offset |= (byte as usize) << (8 * bit);
                }
            }
            let mut length = 0usize;
            for bit in 0..3 {
                if instruction & (1 << (4 + bit)) != 0 {
                    let byte = *delta.get(cursor).ok_or(GitupError::DeltaOverflow)?;
                    cursor += 1;
                    length |= (byte as usize) << (8 * bit);
                }
            }
            if length == 0 {
                length = 65536;
            }

            let end = offset.checked_add(length).ok_or(GitupError::DeltaOverflow)?;
            let slice = base.get(offset..end).ok_or(GitupError::DeltaOverflow)?;
            if out.len() + length > target_size {
                return Err(GitupError::DeltaOverflow);
            }
            out.extend_from_slice(slice);
        } else if instruction != 0 {
            let length = instruction as usize;
            let slice = delta.get(cursor..cursor + length).ok_or(GitupError::DeltaOverflow)?;
            cursor += length;
            if out.len() + length > target_size {
                return Err(GitupError::DeltaOverflow);
            }
            out.extend_from_slice(slice);
        } else {
            return Err(GitupError::DeltaOverflow);
        }
    }

    if out.len() != target_size {
        return Err(GitupError::DeltaOverflow);
    }

    Ok(out)
}

fn read_varint(delta: &[u8], cursor: &mut usize) -> Result<usize> {
    let mut value = 0usize;
    let mut shift = 0;
    loop {
        let byte = *delta.get(*cursor).ok_or(GitupError::DeltaOverflow)?;
        *cursor += 1;
        value |= ((byte & 0x7f) as usize) << shift;
        shift += 7;
        if byte & 0x80 == 0 {
            break;
        }
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::ObjectKind;
    use crate::store::BaseRef;

    fn varint(mut n: usize) -> Vec<u8> {
        let mut out = Vec::new();
        loop {
            let mut byte = (n & 0x7f) as u8;
            n >>= 7;
            if n != 0 {
                byte |= 0x80;
            }
            out.push(byte);
            if n == 0 {
                break;
            }
        }
        out
    }

    #[test]
    fn apply_delta_copy_and_insert() {
        let base = b"hello world";
        let mut program = varint(base.len());
        program.extend(varint(11));
        // copy "hello" (offset 0, length 5): instr with offset byte 0 present (bit0), length byte0 present (bit4)
        program.push(0b1001_0001);
        program.push(0); // offset low byte
        program.push(5); // length low byte
        // insert " XY!!" -> wait target length must be 11 total; "hello" (5) + insert needs 6 more bytes
        let insert = b" XYZZ!";
        assert_eq!(insert.len(), 6);
        program.push(insert.len() as u8);
        program.extend_from_slice(insert);

        let result = apply_delta(base, &program).unwrap();
        assert_eq!(result, b"hello XYZZ!");
    }

    #[test]
    fn apply_delta_zero_length_copy_means_65536() {
        let base = vec![7u8; 70000];
        let mut program = varint(base.len());
        program.extend(varint(65536));
        // copy instr: offset present (byte0), length absent entirely => 0 -> 65536
        program.push(0b1000_0001);
        program.push(0);

        let result = apply_delta(&base, &program).unwrap();
        assert_eq!(result.len(), 65536);
        assert!(result.iter().all(|&b| b == 7));
    }

    #[test]
    fn resolve_all_applies_ref_delta_chain() {
        let mut store = ObjectStore::new(false, None).unwrap();
        let base_hash = crate::hash::canonical_hash(ObjectKind::Blob, b"hello\n");
        let base_idx = store.insert_pack_entry(ObjectKind::Blob, b"hello\n".to_vec(), 0, BaseRef::None).unwrap();

        let mut program = varint(6);
        program.extend(varint(12));
        program.push(0b1001_0001); // copy offset=0 len=5: "hello"
        program.push(0);
        program.push(5);
        let insert = b" world!";
        program.push(insert.len() as u8);
        program.extend_from_slice(insert);

        let delta_idx = store
            .insert_pack_entry(ObjectKind::RefDelta, program, 100, BaseRef::RefHash(base_hash))
            .unwrap();

        let summary = PackSummary { object_count: 2, indices: vec![base_idx, delta_idx] };
        resolve_all(&mut store, &summary, |_| Ok(None)).unwrap();

        // the resolved object should be discoverable by the hash of "hello world!"
        let expected_hash = crate::hash::canonical_hash(ObjectKind::Blob, b"hello world!");
        let idx = store.index_by_hash(expected_hash).expect("resolved blob indexed by hash");
        assert_eq!(store.load_buffer(idx).unwrap(), b"hello world!");
    }
}
