//! Fixed-size chunking of a directory tree into per-path block lists

use std::collections::BTreeMap;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use color_eyre::Result;
use color_eyre::eyre::ensure;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::hash::ContentHash;
use crate::model::{Block, File};
use crate::scan::{ScanEntry, Scanner};

/// Default block size, matching the account default of the coordination service
pub const DEFAULT_BLOCK_SIZE: u64 = 1024;

/// Chunk manifest: relative path -> ordered block list (digests only, no payload)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockManifest {
    pub files: BTreeMap<String, Vec<Block>>,
}

impl BlockManifest {
    #[must_use]
    pub fn len(&self) -> usize {
        self.files.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    #[must_use]
    pub fn get(&self, path: &str) -> Option<&[Block]> {
        self.files.get(path).map(Vec::as_slice)
    }

    /// Total number of blocks across every path
    #[must_use]
    pub fn block_count(&self) -> usize {
        self.files.values().map(Vec::len).sum()
    }
}

/// Splits files into `block_size` chunks and digests each one
#[derive(Debug, Clone)]
pub struct Chunker {
    root: PathBuf,
    block_size: u64,
}

impl Chunker {
    /// # Errors
    /// Returns an error if `block_size` is zero.
    pub fn new(root: impl Into<PathBuf>, block_size: u64) -> Result<Self> {
        ensure!(block_size > 0, "block size must be positive");
        Ok(Self {
            root: root.into(),
            block_size,
        })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    /// Walk the root and chunk every entry.
    ///
    /// Files that vanish or become unreadable mid-walk are left out of the manifest.
    ///
    /// # Errors
    /// Returns an error if the root is not a directory.
    pub fn chunk(&self) -> Result<BlockManifest> {
        let mut manifest = BlockManifest::default();

        for entry in Scanner::new(&self.root).scan()? {
            match self.chunk_entry(&entry) {
                Ok(blocks) => {
                    manifest.files.insert(entry.relative_path, blocks);
                }
                Err(e) => warn!("Skipping {} while chunking: {e}", entry.relative_path),
            }
        }

        debug!(
            "Chunked {} paths into {} blocks",
            manifest.len(),
            manifest.block_count()
        );
        Ok(manifest)
    }

    fn chunk_entry(&self, entry: &ScanEntry) -> Result<Vec<Block>> {
        if entry.is_dir() {
            return Ok(vec![Block::dir_sentinel(&entry.relative_path)]);
        }

        let data = fs::read(&entry.path)?;
        Ok(chunk_bytes(&entry.relative_path, &data, self.block_size))
    }
}

/// Chunk an in-memory payload the same way [`Chunker`] chunks a file on disk
#[must_use]
pub fn chunk_bytes(relative_path: &str, data: &[u8], block_size: u64) -> Vec<Block> {
    if data.is_empty() {
        return vec![Block {
            file: File {
                is_dir: false,
                relative_path: relative_path.to_string(),
                content: None,
                hash: ContentHash::empty(),
            },
            block_index: 0,
            start_offset: 0,
            length: 0,
        }];
    }

    data.chunks(block_size as usize)
        .enumerate()
        .map(|(index, chunk)| Block {
            file: File {
                is_dir: false,
                relative_path: relative_path.to_string(),
                content: None,
                hash: ContentHash::from_bytes(chunk),
            },
            block_index: index as u32,
            start_offset: index as u64 * block_size,
            length: chunk.len() as u64,
        })
        .collect()
}

/// Read exactly the bytes a block covers from the file currently on disk.
///
/// A file that shrank since chunking yields whatever is left of the range.
///
/// # Errors
/// Returns an error if the file cannot be opened or read.
pub fn read_range(path: &Path, start: u64, length: u64) -> Result<Vec<u8>> {
    use std::io::{Seek, SeekFrom};

    let mut file = fs::File::open(path)?;
    file.seek(SeekFrom::Start(start))?;
    let mut buf = Vec::with_capacity(length as usize);
    file.take(length).read_to_end(&mut buf)?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_chunk_scenario_block_size_three() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.txt"), "hello").unwrap();
        fs::write(dir.path().join("b.txt"), "world").unwrap();

        let manifest = Chunker::new(dir.path(), 3).unwrap().chunk().unwrap();
        let a = manifest.get("a.txt").unwrap();

        assert_eq!(a.len(), 2);
        assert_eq!((a[0].block_index, a[0].start_offset, a[0].length), (0, 0, 3));
        assert_eq!(a[0].hash(), ContentHash::from_bytes(b"hel"));
        assert_eq!((a[1].block_index, a[1].start_offset, a[1].length), (1, 3, 2));
        assert_eq!(a[1].hash(), ContentHash::from_bytes(b"lo"));

        let b = manifest.get("b.txt").unwrap();
        assert_eq!(b[0].hash(), ContentHash::from_bytes(b"wor"));
        assert_eq!(b[1].hash(), ContentHash::from_bytes(b"ld"));
    }

    #[test]
    fn test_chunk_directory_sentinel_and_empty_file() {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join("docs")).unwrap();
        fs::write(dir.path().join("docs/empty"), "").unwrap();

        let manifest = Chunker::new(dir.path(), 4).unwrap().chunk().unwrap();

        let docs = manifest.get("docs").unwrap();
        assert_eq!(docs.len(), 1);
        assert!(docs[0].is_dir());
        assert_eq!(docs[0].block_index, 0);

        let empty = manifest.get("docs/empty").unwrap();
        assert_eq!(empty.len(), 1);
        assert!(!empty[0].is_dir());
        assert_eq!(empty[0].length, 0);
        assert_eq!(empty[0].hash(), ContentHash::empty());
    }

    #[test]
    fn test_chunk_blocks_carry_no_payload() {
        let blocks = chunk_bytes("x", b"abcdefgh", 3);
        assert!(blocks.iter().all(|b| b.file.content.is_none()));
        assert_eq!(blocks.last().unwrap().end_offset(), 8);
    }

    #[test]
    fn test_zero_block_size_rejected() {
        assert!(Chunker::new("/tmp", 0).is_err());
    }

    #[test]
    fn test_read_range_clamps_at_eof() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("f");
        fs::write(&path, "abcdef").unwrap();

        assert_eq!(read_range(&path, 2, 3).unwrap(), b"cde");
        assert_eq!(read_range(&path, 4, 10).unwrap(), b"ef");
    }
}
