//! Delta application: mutate a tree on disk to match a received changeset

use std::collections::BTreeMap;
use std::fs;
use std::io::{ErrorKind, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use color_eyre::Result;
use color_eyre::eyre::WrapErr;
use tracing::{debug, info, warn};

use crate::delta;
use crate::model::{Block, ChangeSet, File, Modifications, Patch};
use crate::scan::{Scanner, TEMP_SUFFIX, resolve};
use crate::snapshot::Snapshot;

/// What an apply actually touched
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyReport {
    pub deleted: usize,
    pub added: usize,
    /// Files rewritten by a patch or by blocks
    pub modified: usize,
    /// Modification targets that were missing or stale
    pub skipped: Vec<String>,
}

/// Applies changesets under a root directory
#[derive(Debug, Clone)]
pub struct Applier {
    root: PathBuf,
}

impl Applier {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Apply deletions, then additions, then modifications.
    ///
    /// The changeset is validated first and nothing is touched if it is malformed.
    /// Each step is idempotent: absent deletions are ignored, additions overwrite, and
    /// a modification whose target no longer exists is skipped.
    ///
    /// # Errors
    /// Returns an error on a protocol violation or a filesystem failure.
    pub fn apply(&self, changes: &ChangeSet) -> Result<ApplyReport> {
        changes.validate().wrap_err("rejected changeset")?;

        let mut report = ApplyReport::default();

        for path in &changes.deleted {
            if self.delete(path)? {
                report.deleted += 1;
            }
        }

        for file in &changes.added {
            let target = resolve(&self.root, &file.relative_path)?;
            write_entry(&target, file)?;
            report.added += 1;
        }

        match &changes.modified {
            Modifications::Patch(patches) => {
                for patch in patches {
                    if self.apply_patch(patch)? {
                        report.modified += 1;
                    } else {
                        report.skipped.push(patch.path().to_string());
                    }
                }
            }
            Modifications::Block(blocks) => {
                for (path, file_blocks) in group_by_path(blocks) {
                    if self.apply_blocks(path, &file_blocks)? {
                        report.modified += 1;
                    } else {
                        report.skipped.push(path.to_string());
                    }
                }
            }
        }

        info!(
            "Applied {} changeset: {} deleted, {} added, {} modified, {} skipped",
            changes.kind(),
            report.deleted,
            report.added,
            report.modified,
            report.skipped.len()
        );
        Ok(report)
    }

    /// Remove a file or directory tree; `false` if it was already gone
    fn delete(&self, relative: &str) -> Result<bool> {
        let target = resolve(&self.root, relative)?;
        let metadata = match fs::symlink_metadata(&target) {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };

        let result = if metadata.is_dir() {
            fs::remove_dir_all(&target)
        } else {
            fs::remove_file(&target)
        };
        match result {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e).wrap_err_with(|| format!("failed to delete {relative}")),
        }
    }

    fn apply_patch(&self, patch: &Patch) -> Result<bool> {
        let target = resolve(&self.root, patch.path())?;
        if !target.is_file() {
            debug!("Patch target {} is not a file, skipping", patch.path());
            return Ok(false);
        }
        let Some(delta) = &patch.delta else {
            return Ok(false);
        };

        let old = fs::read(&target)?;
        let new = match delta::patch(&old, delta) {
            Ok(new) => new,
            Err(e) => {
                warn!("Stale patch for {}: {e}", patch.path());
                return Ok(false);
            }
        };

        let temp = temp_path(&target);
        fs::write(&temp, &new)?;
        if let Err(e) = fs::rename(&temp, &target) {
            let _ = fs::remove_file(&temp);
            return Err(e).wrap_err_with(|| format!("failed to replace {}", patch.path()));
        }
        Ok(true)
    }

    /// Overwrite each block range in place, then cut the file to the furthest block end
    fn apply_blocks(&self, relative: &str, blocks: &[&Block]) -> Result<bool> {
        let target = resolve(&self.root, relative)?;
        if !target.is_file() {
            debug!("Block target {relative} is not a file, skipping");
            return Ok(false);
        }

        let mut file = fs::OpenOptions::new().write(true).open(&target)?;
        for block in blocks {
            file.seek(SeekFrom::Start(block.start_offset))?;
            file.write_all(block.file.bytes())?;
        }

        let end = blocks.iter().map(|b| b.end_offset()).max().unwrap_or(0);
        if file.metadata()?.len() > end {
            file.set_len(end)?;
        }
        file.sync_data()?;
        Ok(true)
    }

    /// Make the tree match `backup` exactly.
    ///
    /// Paths present now but absent from the backup are deleted, then every backed-up
    /// entry is rewritten verbatim.
    ///
    /// # Errors
    /// Returns an error if the tree cannot be scanned or written.
    pub fn restore(&self, backup: &Snapshot) -> Result<()> {
        for entry in Scanner::new(&self.root).scan()? {
            if !backup.contains(&entry.relative_path) {
                self.delete(&entry.relative_path)?;
            }
        }

        for (path, file) in &backup.files {
            write_entry(&resolve(&self.root, path)?, file)?;
        }

        info!("Restored {} entries from backup", backup.len());
        Ok(())
    }
}

fn group_by_path(blocks: &[Block]) -> BTreeMap<&str, Vec<&Block>> {
    let mut grouped: BTreeMap<&str, Vec<&Block>> = BTreeMap::new();
    for block in blocks {
        grouped.entry(block.path()).or_default().push(block);
    }
    grouped
}

/// Create a directory or write a file at `target`, replacing an entry of the other type
fn write_entry(target: &Path, file: &File) -> Result<()> {
    if file.is_dir {
        if target.is_file() {
            fs::remove_file(target)?;
        }
        fs::create_dir_all(target)?;
        return Ok(());
    }
    if target.is_dir() {
        fs::remove_dir_all(target)?;
    }
    write_with_parents(target, file.bytes())
}

fn write_with_parents(target: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(target, data).wrap_err_with(|| format!("failed to write {}", target.display()))
}

fn temp_path(target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    target.with_file_name(format!(".{name}{TEMP_SUFFIX}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunker::{Chunker, chunk_bytes};
    use crate::model::{ChangeKind, File};
    use crate::reconcile::reconcile;
    use tempfile::TempDir;

    fn filled(path: &str, index: u32, start: u64, data: &'static [u8]) -> Block {
        Block {
            file: File::with_content(path, data),
            block_index: index,
            start_offset: start,
            length: data.len() as u64,
        }
    }

    #[test]
    fn test_block_apply_truncates_longer_file() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.txt"), "abcdefghij").unwrap();

        let mut changes = ChangeSet::new(ChangeKind::Block);
        changes.modified = Modifications::Block(vec![filled("a.txt", 1, 3, b"XYZ")]);

        let report = Applier::new(dir.path()).apply(&changes).unwrap();

        assert_eq!(report.modified, 1);
        assert_eq!(fs::read(dir.path().join("a.txt")).unwrap(), b"abcXYZ");
    }

    #[test]
    fn test_block_apply_extends_shorter_file() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.txt"), "abc").unwrap();

        let mut changes = ChangeSet::new(ChangeKind::Block);
        changes.modified = Modifications::Block(vec![filled("a.txt", 1, 3, b"def")]);
        Applier::new(dir.path()).apply(&changes).unwrap();

        assert_eq!(fs::read(dir.path().join("a.txt")).unwrap(), b"abcdef");
    }

    #[test]
    fn test_missing_targets_are_skipped() {
        let dir = TempDir::new().unwrap();

        let mut changes = ChangeSet::new(ChangeKind::Block);
        changes.modified = Modifications::Block(vec![filled("ghost", 0, 0, b"x")]);
        let report = Applier::new(dir.path()).apply(&changes).unwrap();

        assert_eq!(report.skipped, vec!["ghost"]);
        assert!(!dir.path().join("ghost").exists());
    }

    #[test]
    fn test_add_and_delete_are_idempotent() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("old/inner")).unwrap();
        fs::write(dir.path().join("old/inner/f"), "f").unwrap();

        let mut changes = ChangeSet::new(ChangeKind::Patch);
        changes.deleted.push("old".into());
        changes.added.push(File::dir("new/dir"));
        changes.added.push(File::with_content("new/dir/f.txt", &b"content"[..]));

        let applier = Applier::new(dir.path());
        applier.apply(&changes).unwrap();
        let second = applier.apply(&changes).unwrap();

        assert_eq!(second.deleted, 0);
        assert!(!dir.path().join("old").exists());
        assert_eq!(fs::read(dir.path().join("new/dir/f.txt")).unwrap(), b"content");
    }

    #[test]
    fn test_detected_type_changes_apply_cleanly() {
        let sender = TempDir::new().unwrap();
        let receiver = TempDir::new().unwrap();
        for root in [sender.path(), receiver.path()] {
            fs::write(root.join("x"), "plain file").unwrap();
            fs::create_dir(root.join("y")).unwrap();
        }
        let previous = Snapshot::capture(sender.path()).unwrap();

        fs::remove_file(sender.path().join("x")).unwrap();
        fs::create_dir(sender.path().join("x")).unwrap();
        fs::write(sender.path().join("x/a.txt"), "inside").unwrap();
        fs::remove_dir(sender.path().join("y")).unwrap();
        fs::write(sender.path().join("y"), "").unwrap();
        let current = Snapshot::capture(sender.path()).unwrap();

        let changes = crate::detect::detect(&previous, &current).unwrap().unwrap();
        Applier::new(receiver.path()).apply(&changes).unwrap();

        assert_eq!(Snapshot::capture(receiver.path()).unwrap(), current);
    }

    #[test]
    fn test_add_replaces_entry_of_other_type() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a"), "file").unwrap();
        fs::create_dir(dir.path().join("b")).unwrap();

        let mut changes = ChangeSet::new(ChangeKind::Patch);
        changes.added.push(File::dir("a"));
        changes.added.push(File::with_content("b", &b"now a file"[..]));
        Applier::new(dir.path()).apply(&changes).unwrap();

        assert!(dir.path().join("a").is_dir());
        assert_eq!(fs::read(dir.path().join("b")).unwrap(), b"now a file");
    }

    #[test]
    fn test_patch_replaces_content() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("notes.txt"), "v1").unwrap();

        let mut changes = ChangeSet::new(ChangeKind::Patch);
        changes.modified = Modifications::Patch(vec![Patch {
            file: File::with_content("notes.txt", &b"v2"[..]),
            delta: Some(delta::diff(b"v1", b"v2").unwrap()),
        }]);

        let report = Applier::new(dir.path()).apply(&changes).unwrap();
        assert_eq!(report.modified, 1);
        assert_eq!(fs::read(dir.path().join("notes.txt")).unwrap(), b"v2");
        assert_eq!(Scanner::new(dir.path()).scan().unwrap().len(), 1);
    }

    #[test]
    fn test_stale_patch_is_skipped() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("notes.txt"), "other").unwrap();

        let mut changes = ChangeSet::new(ChangeKind::Patch);
        changes.modified = Modifications::Patch(vec![Patch {
            file: File::with_content("notes.txt", &b"v2"[..]),
            delta: Some(delta::diff(b"v1", b"v2").unwrap()),
        }]);

        let report = Applier::new(dir.path()).apply(&changes).unwrap();
        assert_eq!(report.skipped, vec!["notes.txt"]);
        assert_eq!(fs::read(dir.path().join("notes.txt")).unwrap(), b"other");
    }

    #[test]
    fn test_invalid_changeset_touches_nothing() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.txt"), "keep").unwrap();

        let mut bad = filled("a.txt", 0, 0, b"abc");
        bad.length = 10;
        let mut changes = ChangeSet::new(ChangeKind::Block);
        changes.deleted.push("a.txt".into());
        changes.modified = Modifications::Block(vec![bad]);

        assert!(Applier::new(dir.path()).apply(&changes).is_err());
        assert_eq!(fs::read(dir.path().join("a.txt")).unwrap(), b"keep");
    }

    #[test]
    fn test_reconcile_then_apply_converges() {
        let source = TempDir::new().unwrap();
        let receiver = TempDir::new().unwrap();
        fs::create_dir(source.path().join("docs")).unwrap();
        fs::write(source.path().join("docs/a.txt"), "hello world, again").unwrap();
        fs::write(source.path().join("b.txt"), "short").unwrap();
        fs::write(receiver.path().join("b.txt"), "much longer text").unwrap();
        fs::write(receiver.path().join("stale.txt"), "bye").unwrap();

        let local = Chunker::new(source.path(), 4).unwrap().chunk().unwrap();
        let remote = Chunker::new(receiver.path(), 4).unwrap().chunk().unwrap();
        let changes = reconcile(source.path(), &local, &remote).unwrap();
        Applier::new(receiver.path()).apply(&changes).unwrap();

        assert_eq!(
            Snapshot::capture(receiver.path()).unwrap(),
            Snapshot::capture(source.path()).unwrap()
        );
        assert_eq!(
            chunk_bytes("b.txt", b"short", 4),
            Chunker::new(receiver.path(), 4).unwrap().chunk().unwrap().files["b.txt"]
        );
    }

    #[test]
    fn test_restore_reverts_to_backup() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("mine.txt"), "mine").unwrap();
        let backup = Snapshot::capture(dir.path()).unwrap();

        fs::write(dir.path().join("mine.txt"), "theirs").unwrap();
        fs::create_dir(dir.path().join("pulled")).unwrap();
        fs::write(dir.path().join("pulled/x"), "x").unwrap();

        Applier::new(dir.path()).restore(&backup).unwrap();

        assert_eq!(Snapshot::capture(dir.path()).unwrap(), backup);
    }
}
