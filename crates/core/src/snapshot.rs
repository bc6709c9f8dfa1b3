//! Snapshot: a point-in-time, full-content view of a directory tree

use std::collections::BTreeMap;
use std::path::Path;

use bytes::Bytes;
use color_eyre::Result;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::model::File;
use crate::scan::Scanner;

/// All entries of a tree keyed by relative path, file contents loaded
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub files: BTreeMap<String, File>,
}

impl Snapshot {
    /// Read every directory and file under `root` into memory.
    ///
    /// Files that cannot be read are left out rather than failing the capture.
    ///
    /// # Errors
    /// Returns an error if the root exists but is not a directory.
    pub fn capture(root: &Path) -> Result<Self> {
        let mut files = BTreeMap::new();

        for entry in Scanner::new(root).scan()? {
            let file = if entry.is_dir() {
                File::dir(&entry.relative_path)
            } else {
                match std::fs::read(&entry.path) {
                    Ok(data) => File::with_content(&entry.relative_path, Bytes::from(data)),
                    Err(e) => {
                        warn!("Skipping {} in snapshot: {e}", entry.relative_path);
                        continue;
                    }
                }
            };
            files.insert(entry.relative_path, file);
        }

        debug!("Captured snapshot of {} entries", files.len());
        Ok(Self { files })
    }

    /// Create a snapshot from prepared entries
    #[must_use]
    pub fn from_files(files: impl IntoIterator<Item = File>) -> Self {
        let files = files
            .into_iter()
            .map(|f| (f.relative_path.clone(), f))
            .collect();
        Self { files }
    }

    /// Create an empty snapshot
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Get the number of entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// Check if empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Get an entry by relative path
    #[must_use]
    pub fn get(&self, path: &str) -> Option<&File> {
        self.files.get(path)
    }

    #[must_use]
    pub fn contains(&self, path: &str) -> bool {
        self.files.contains_key(path)
    }

    /// Sum of file content sizes
    #[must_use]
    pub fn total_bytes(&self) -> u64 {
        self.files.values().map(|f| f.bytes().len() as u64).sum()
    }
}
