//! Change detection between two full-content snapshots

use color_eyre::Result;
use tracing::debug;

use crate::delta;
use crate::model::{ChangeKind, ChangeSet, File, Modifications, Patch};
use crate::snapshot::Snapshot;

/// Diff `previous` against `current` into a patch changeset.
///
/// Returns `None` when nothing changed. An entry counts as modified when it is a file
/// on both sides and its hash differs; its patch carries a compressed delta from the
/// previous bytes. An entry that switched between file and directory is deleted and
/// added again.
///
/// # Errors
/// Returns an error if a delta cannot be encoded.
pub fn detect(previous: &Snapshot, current: &Snapshot) -> Result<Option<ChangeSet>> {
    let mut changes = ChangeSet::new(ChangeKind::Patch);
    let mut patches = Vec::new();
    let mut replaced = Vec::new();

    for (path, file) in &current.files {
        match previous.get(path) {
            None => changes.added.push(file.clone()),
            Some(old) if old.is_dir != file.is_dir => {
                debug!("{path} changed type");
                replaced.push(path.clone());
                changes.added.push(file.clone());
            }
            Some(old) if !file.is_dir && old.hash != file.hash => {
                let delta = delta::diff(old.bytes(), file.bytes())?;
                debug!("Modified {path}: {} byte delta", delta.len());
                patches.push(Patch {
                    file: File {
                        is_dir: false,
                        relative_path: path.clone(),
                        content: None,
                        hash: file.hash,
                    },
                    delta: Some(delta),
                });
            }
            Some(_) => {}
        }
    }

    changes.deleted = previous
        .files
        .keys()
        .filter(|path| !current.contains(path))
        .cloned()
        .chain(replaced)
        .collect();
    changes.deleted.sort();
    changes.modified = Modifications::Patch(patches);

    if changes.is_empty() {
        return Ok(None);
    }

    debug!(
        "Detected {} added, {} deleted, {} modified",
        changes.added.len(),
        changes.deleted.len(),
        changes.modified.len()
    );
    Ok(Some(changes))
}
