//! Repair planner — computes the defective set from the prior manifest
//! versus the on-disk scan, driving a targeted multi-want fetch.

use crate::hash::ObjectHash;
use crate::manifest::Manifest;
use crate::scanner::LocalTree;

/// One manifest-tracked path whose on-disk state no longer matches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Defect {
    pub path: String,
    pub mode: u32,
    pub want: ObjectHash,
}

/// A node is defective if it has no local match, or its hash differs and
/// the path isn't ignored. Ignored paths are never defective:
/// the scanner already hashed them by path, so a hash comparison against
/// the manifest would always fail without ignoring them here too.
pub fn plan(manifest: &Manifest, local: &LocalTree, target_dir: &std::path::Path, ignore_prefixes: &[String]) -> Vec<Defect> {
    let mut defects = Vec::new();

    for block in &manifest.blocks {
        for entry in &block.entries {
            if entry.mode & 0o170000 == 0o040000 {
                continue; // directories aren't fetched individually
            }
            let rel = if block.path.is_empty() { entry.name.clone() } else { format!("{}/{}", block.path, entry.name) };
            let abs = target_dir.join(&rel);
            let text = abs.to_string_lossy();
            if ignore_prefixes.iter().any(|p| text.starts_with(p.as_str())) {
                continue;
            }

            let defective = match local.get(&abs) {
                None => true,
                Some(node) => node.hash != entry.hash,
            };
            if defective {
                defects.push(Defect { path: rel, mode: entry.mode, want: entry.hash });
            }
        }
    }

    defects
}
