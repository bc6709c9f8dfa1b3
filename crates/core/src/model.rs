//! Records exchanged between devices: files, blocks, patches and changesets

use std::collections::HashSet;
use std::fmt;

use bytes::Bytes;
use color_eyre::Result;
use color_eyre::eyre::bail;
use serde::{Deserialize, Serialize};

use crate::hash::ContentHash;

/// A path's terminal content unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct File {
    pub is_dir: bool,
    /// Path relative to the synchronized root, `/`-separated
    pub relative_path: String,
    /// Full payload when loaded; always absent for directories
    #[serde(default)]
    pub content: Option<Bytes>,
    pub hash: ContentHash,
}

impl File {
    /// A directory entry
    #[must_use]
    pub fn dir(relative_path: impl Into<String>) -> Self {
        Self {
            is_dir: true,
            relative_path: relative_path.into(),
            content: None,
            hash: ContentHash::empty(),
        }
    }

    /// A regular file carrying its complete content
    #[must_use]
    pub fn with_content(relative_path: impl Into<String>, content: impl Into<Bytes>) -> Self {
        let content = content.into();
        Self {
            is_dir: false,
            relative_path: relative_path.into(),
            hash: ContentHash::from_bytes(&content),
            content: Some(content),
        }
    }

    /// Content bytes, empty when absent
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        self.content.as_deref().unwrap_or_default()
    }
}

/// A fixed-size byte range of a file (the final block may be shorter)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    #[serde(flatten)]
    pub file: File,
    pub block_index: u32,
    pub start_offset: u64,
    pub length: u64,
}

impl Block {
    /// The single sentinel block standing in for a directory
    #[must_use]
    pub fn dir_sentinel(relative_path: impl Into<String>) -> Self {
        Self {
            file: File::dir(relative_path),
            block_index: 0,
            start_offset: 0,
            length: 0,
        }
    }

    #[must_use]
    pub fn path(&self) -> &str {
        &self.file.relative_path
    }

    #[must_use]
    pub fn is_dir(&self) -> bool {
        self.file.is_dir
    }

    #[must_use]
    pub fn hash(&self) -> ContentHash {
        self.file.hash
    }

    /// One past the last byte this block covers
    #[must_use]
    pub fn end_offset(&self) -> u64 {
        self.start_offset + self.length
    }
}

/// A binary delta turning a file's previous content into its current content
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Patch {
    #[serde(flatten)]
    pub file: File,
    /// Compressed delta, see [`crate::delta::DeltaComputer::compress_delta`]
    #[serde(default)]
    pub delta: Option<Bytes>,
}

impl Patch {
    #[must_use]
    pub fn path(&self) -> &str {
        &self.file.relative_path
    }
}

/// Which specialization populates [`ChangeSet::modified`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Block,
    Patch,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Block => f.write_str("block"),
            Self::Patch => f.write_str("patch"),
        }
    }
}

/// Modified entries, tagged by kind so the two forms can never mix
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "items", rename_all = "lowercase")]
pub enum Modifications {
    Block(Vec<Block>),
    Patch(Vec<Patch>),
}

impl Modifications {
    #[must_use]
    pub fn kind(&self) -> ChangeKind {
        match self {
            Self::Block(_) => ChangeKind::Block,
            Self::Patch(_) => ChangeKind::Patch,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Block(blocks) => blocks.len(),
            Self::Patch(patches) => patches.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Distinct paths touched, in first-seen order
    #[must_use]
    pub fn paths(&self) -> Vec<&str> {
        let mut seen = HashSet::new();
        let iter: Box<dyn Iterator<Item = &str>> = match self {
            Self::Block(blocks) => Box::new(blocks.iter().map(Block::path)),
            Self::Patch(patches) => Box::new(patches.iter().map(Patch::path)),
        };
        iter.filter(|p| seen.insert(*p)).collect()
    }
}

/// The unit of propagated difference between two tree states
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSet {
    pub added: Vec<File>,
    pub deleted: Vec<String>,
    pub modified: Modifications,
}

impl ChangeSet {
    /// An empty changeset of the given kind
    #[must_use]
    pub fn new(kind: ChangeKind) -> Self {
        let modified = match kind {
            ChangeKind::Block => Modifications::Block(Vec::new()),
            ChangeKind::Patch => Modifications::Patch(Vec::new()),
        };
        Self {
            added: Vec::new(),
            deleted: Vec::new(),
            modified,
        }
    }

    #[must_use]
    pub fn kind(&self) -> ChangeKind {
        self.modified.kind()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.deleted.is_empty() && self.modified.is_empty()
    }

    /// Total number of entries across the three sets
    #[must_use]
    pub fn len(&self) -> usize {
        self.added.len() + self.deleted.len() + self.modified.len()
    }

    /// Check the structural invariants a received changeset must hold.
    ///
    /// Modified paths must be neither added nor deleted. A path may be both deleted and
    /// added, which replaces an entry whose type changed. Every block payload must
    /// match its declared length, and added files must carry content unless they are
    /// directories.
    ///
    /// # Errors
    /// Returns an error describing the first violation found.
    pub fn validate(&self) -> Result<()> {
        let deleted: HashSet<&str> = self.deleted.iter().map(String::as_str).collect();
        let mut added = HashSet::new();

        for file in &self.added {
            if !added.insert(file.relative_path.as_str()) {
                bail!("path {:?} is added twice", file.relative_path);
            }
            if !file.is_dir && file.content.is_none() {
                bail!("added file {:?} has no content", file.relative_path);
            }
        }
        for path in self.modified.paths() {
            if deleted.contains(path) {
                bail!("path {path:?} appears in both deleted and modified");
            }
            if added.contains(path) {
                bail!("path {path:?} appears in both added and modified");
            }
        }

        match &self.modified {
            Modifications::Block(blocks) => {
                for block in blocks {
                    if block.is_dir() {
                        bail!("directory {:?} listed as a modified block", block.path());
                    }
                    let carried = block.file.content.as_ref().map_or(0, Bytes::len) as u64;
                    if carried != block.length {
                        bail!(
                            "block {} of {:?} declares {} bytes but carries {carried}",
                            block.block_index,
                            block.path(),
                            block.length
                        );
                    }
                }
            }
            Modifications::Patch(patches) => {
                if let Some(patch) = patches.iter().find(|p| p.delta.is_none()) {
                    bail!("patch for {:?} has no delta", patch.path());
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(path: &str, index: u32, start: u64, data: &'static [u8]) -> Block {
        Block {
            file: File::with_content(path, data),
            block_index: index,
            start_offset: start,
            length: data.len() as u64,
        }
    }

    #[test]
    fn test_changeset_kind_follows_modifications() {
        assert_eq!(ChangeSet::new(ChangeKind::Block).kind(), ChangeKind::Block);
        assert_eq!(ChangeSet::new(ChangeKind::Patch).kind(), ChangeKind::Patch);
        assert!(ChangeSet::new(ChangeKind::Patch).is_empty());
    }

    #[test]
    fn test_validate_rejects_overlapping_sets() {
        let mut changes = ChangeSet::new(ChangeKind::Block);
        changes.deleted.push("a.txt".to_string());
        changes.modified = Modifications::Block(vec![block("a.txt", 0, 0, b"x")]);
        assert!(changes.validate().is_err());

        let mut changes = ChangeSet::new(ChangeKind::Block);
        changes.added.push(File::with_content("a.txt", &b"x"[..]));
        changes.modified = Modifications::Block(vec![block("a.txt", 0, 0, b"x")]);
        assert!(changes.validate().is_err());

        let mut changes = ChangeSet::new(ChangeKind::Patch);
        changes.added.push(File::dir("a"));
        changes.added.push(File::with_content("a", &b"x"[..]));
        assert!(changes.validate().is_err());
    }

    #[test]
    fn test_validate_allows_replacing_a_path() {
        let mut changes = ChangeSet::new(ChangeKind::Patch);
        changes.deleted.push("a".to_string());
        changes.added.push(File::dir("a"));
        changes.validate().unwrap();
    }

    #[test]
    fn test_validate_allows_many_blocks_for_one_path() {
        let mut changes = ChangeSet::new(ChangeKind::Block);
        changes.modified = Modifications::Block(vec![
            block("a.txt", 0, 0, b"hel"),
            block("a.txt", 1, 3, b"lo"),
        ]);
        changes.validate().unwrap();
        assert_eq!(changes.modified.paths(), vec!["a.txt"]);
    }

    #[test]
    fn test_validate_rejects_short_block_payload() {
        let mut bad = block("a.txt", 0, 0, b"hel");
        bad.length = 5;
        let mut changes = ChangeSet::new(ChangeKind::Block);
        changes.modified = Modifications::Block(vec![bad]);
        assert!(changes.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_contentless_added_file() {
        let mut changes = ChangeSet::new(ChangeKind::Patch);
        let mut file = File::with_content("a.txt", &b"x"[..]);
        file.content = None;
        changes.added.push(file);
        assert!(changes.validate().is_err());

        let mut changes = ChangeSet::new(ChangeKind::Patch);
        changes.added.push(File::dir("docs"));
        changes.validate().unwrap();
    }

    #[test]
    fn test_block_serializes_flat() {
        let json = serde_json::to_value(block("a.txt", 1, 3, b"lo")).unwrap();
        assert_eq!(json["relative_path"], "a.txt");
        assert_eq!(json["block_index"], 1);
        assert_eq!(json["start_offset"], 3);
        assert_eq!(json["length"], 2);
        assert_eq!(json["is_dir"], false);
    }
}
