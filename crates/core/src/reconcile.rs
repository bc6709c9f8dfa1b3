//! Block reconciliation: what a peer holding `remote` needs to match the local tree

use std::path::Path;

use bytes::Bytes;
use color_eyre::Result;
use tracing::{debug, warn};

use crate::chunker::{BlockManifest, read_range};
use crate::hash::ContentHash;
use crate::model::{Block, ChangeKind, ChangeSet, File, Modifications};
use crate::scan::resolve;

/// Compare the local chunk manifest with a peer's and build a block changeset.
///
/// Local-only paths are added with their full current bytes, remote-only paths are
/// deleted, and a path that is a directory on one side and a file on the other is both
/// deleted and added. Blocks are compared by index, and every local block whose index
/// is missing remotely or whose digest differs is shipped with the bytes currently on
/// disk. When the remote copy of a file is longer but every local block already
/// matches, the final local block is shipped anyway so the receiver truncates to the
/// local length.
///
/// Entries that cannot be read are skipped.
///
/// # Errors
/// Returns an error if a path in the local manifest cannot be resolved under `root`.
pub fn reconcile(root: &Path, local: &BlockManifest, remote: &BlockManifest) -> Result<ChangeSet> {
    let mut changes = ChangeSet::new(ChangeKind::Block);
    let mut modified = Vec::new();
    let mut replaced = Vec::new();

    for (path, blocks) in &local.files {
        let is_dir = blocks.first().is_some_and(Block::is_dir);
        let remote_blocks = remote.get(path);

        let type_changed = remote_blocks
            .is_some_and(|r| r.first().is_some_and(Block::is_dir) != is_dir);
        let Some(remote_blocks) = remote_blocks.filter(|_| !type_changed) else {
            if is_dir {
                changes.added.push(File::dir(path.as_str()));
            } else {
                match std::fs::read(resolve(root, path)?) {
                    Ok(data) => changes.added.push(File::with_content(path.as_str(), data)),
                    Err(e) => {
                        warn!("Skipping {path} during reconciliation: {e}");
                        continue;
                    }
                }
            }
            if type_changed {
                replaced.push(path.clone());
            }
            continue;
        };

        if is_dir {
            continue;
        }

        let before = modified.len();
        let on_disk = resolve(root, path)?;
        for block in blocks {
            let same = remote_blocks
                .get(block.block_index as usize)
                .is_some_and(|r| r.block_index == block.block_index && r.hash() == block.hash());
            if same {
                continue;
            }
            match with_payload(&on_disk, block) {
                Ok(filled) => modified.push(filled),
                Err(e) => {
                    warn!("Skipping {path} during reconciliation: {e}");
                    modified.truncate(before);
                    break;
                }
            }
        }

        if modified.len() == before && remote_is_longer(blocks, remote_blocks) {
            if let Some(last) = blocks.last() {
                match with_payload(&on_disk, last) {
                    Ok(filled) => modified.push(filled),
                    Err(e) => warn!("Skipping {path} during reconciliation: {e}"),
                }
            }
        }
    }

    changes.deleted = remote
        .files
        .keys()
        .filter(|path| !local.files.contains_key(*path))
        .cloned()
        .chain(replaced)
        .collect();
    changes.deleted.sort();
    changes.modified = Modifications::Block(modified);

    debug!(
        "Reconciled: {} added, {} deleted, {} blocks",
        changes.added.len(),
        changes.deleted.len(),
        changes.modified.len()
    );
    Ok(changes)
}

fn remote_is_longer(local: &[Block], remote: &[Block]) -> bool {
    let end = |blocks: &[Block]| blocks.last().map_or(0, Block::end_offset);
    end(remote) > end(local)
}

/// Copy `block` with the bytes now on disk at its range.
///
/// The file may have changed since chunking; the carried length and digest follow the
/// bytes actually read.
fn with_payload(path: &Path, block: &Block) -> Result<Block> {
    let data = read_range(path, block.start_offset, block.length)?;
    let mut filled = block.clone();
    filled.length = data.len() as u64;
    filled.file.hash = ContentHash::from_bytes(&data);
    filled.file.content = Some(Bytes::from(data));
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunker::{Chunker, chunk_bytes};
    use std::fs;
    use tempfile::TempDir;

    fn manifest(entries: &[(&str, &[u8])], block_size: u64) -> BlockManifest {
        let mut m = BlockManifest::default();
        for (path, data) in entries {
            m.files.insert((*path).to_string(), chunk_bytes(path, data, block_size));
        }
        m
    }

    #[test]
    fn test_missing_file_is_added_whole() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.txt"), "hello").unwrap();
        fs::write(dir.path().join("b.txt"), "world").unwrap();

        let local = Chunker::new(dir.path(), 3).unwrap().chunk().unwrap();
        let remote = manifest(&[("a.txt", &b"hello"[..])], 3);

        let changes = reconcile(dir.path(), &local, &remote).unwrap();

        assert_eq!(changes.added, vec![File::with_content("b.txt", &b"world"[..])]);
        assert!(changes.deleted.is_empty());
        assert!(changes.modified.is_empty());
    }

    #[test]
    fn test_differing_blocks_carry_disk_bytes() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.txt"), "hello world").unwrap();

        let local = Chunker::new(dir.path(), 4).unwrap().chunk().unwrap();
        let remote = manifest(&[("a.txt", &b"hellXXworlX"[..]), ("stale", &b"s"[..])], 4);

        let changes = reconcile(dir.path(), &local, &remote).unwrap();
        assert_eq!(changes.deleted, vec!["stale"]);

        let Modifications::Block(blocks) = &changes.modified else {
            panic!("expected blocks");
        };
        let ranges: Vec<_> = blocks.iter().map(|b| (b.block_index, b.start_offset)).collect();
        assert_eq!(ranges, vec![(1, 4), (2, 8)]);
        assert_eq!(blocks[0].file.content.as_deref(), Some(&b"o wo"[..]));
        assert_eq!(blocks[1].file.content.as_deref(), Some(&b"rld"[..]));
        changes.validate().unwrap();
    }

    #[test]
    fn test_longer_remote_gets_final_block_for_truncation() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.txt"), "abcdef").unwrap();

        let local = Chunker::new(dir.path(), 3).unwrap().chunk().unwrap();
        let remote = manifest(&[("a.txt", &b"abcdefghi"[..])], 3);

        let changes = reconcile(dir.path(), &local, &remote).unwrap();
        let Modifications::Block(blocks) = &changes.modified else {
            panic!("expected blocks");
        };
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].end_offset(), 6);
    }

    #[test]
    fn test_common_directories_skipped_and_new_ones_added() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("shared")).unwrap();
        fs::create_dir_all(dir.path().join("fresh")).unwrap();

        let local = Chunker::new(dir.path(), 3).unwrap().chunk().unwrap();
        let mut remote = BlockManifest::default();
        remote.files.insert("shared".into(), vec![Block::dir_sentinel("shared")]);

        let changes = reconcile(dir.path(), &local, &remote).unwrap();
        assert_eq!(changes.added, vec![File::dir("fresh")]);
        assert!(changes.modified.is_empty());
    }

    #[test]
    fn test_type_change_is_delete_plus_add() {
        let ours = TempDir::new().unwrap();
        fs::write(ours.path().join("x"), "now a file").unwrap();
        fs::create_dir(ours.path().join("y")).unwrap();
        fs::write(ours.path().join("y/inner.txt"), "in").unwrap();

        let theirs = TempDir::new().unwrap();
        fs::create_dir(theirs.path().join("x")).unwrap();
        fs::write(theirs.path().join("x/a.txt"), "child").unwrap();
        fs::write(theirs.path().join("y"), "was a file").unwrap();

        let local = Chunker::new(ours.path(), 4).unwrap().chunk().unwrap();
        let remote = Chunker::new(theirs.path(), 4).unwrap().chunk().unwrap();
        let changes = reconcile(ours.path(), &local, &remote).unwrap();

        assert_eq!(changes.deleted, vec!["x", "x/a.txt", "y"]);
        let added: Vec<_> = changes.added.iter().map(|f| (f.relative_path.as_str(), f.is_dir)).collect();
        assert_eq!(added, vec![("x", false), ("y", true), ("y/inner.txt", false)]);
        assert!(changes.modified.is_empty());

        crate::apply::Applier::new(theirs.path()).apply(&changes).unwrap();
        assert_eq!(
            crate::snapshot::Snapshot::capture(theirs.path()).unwrap(),
            crate::snapshot::Snapshot::capture(ours.path()).unwrap()
        );
    }

    #[test]
    fn test_blocks_compared_by_index() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.txt"), "aaaabbbb").unwrap();

        let local = Chunker::new(dir.path(), 4).unwrap().chunk().unwrap();
        // same digests, swapped positions
        let remote = manifest(&[("a.txt", &b"bbbbaaaa"[..])], 4);

        let changes = reconcile(dir.path(), &local, &remote).unwrap();
        assert_eq!(changes.modified.len(), 2);
    }

    #[test]
    fn test_identical_trees_reconcile_to_nothing() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.txt"), "same").unwrap();
        let local = Chunker::new(dir.path(), 2).unwrap().chunk().unwrap();

        assert!(reconcile(dir.path(), &local, &local.clone()).unwrap().is_empty());
    }
}
