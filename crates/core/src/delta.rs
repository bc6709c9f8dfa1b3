//! Binary deltas for patch changesets, using rsync-style block matching
//!
//! `diff(old, new)` produces a delta that turns `old` into `new`; `patch(old, delta)`
//! reverses that. Deltas travel zstd-compressed JSON inside a [`crate::model::Patch`].

use std::collections::HashMap;

use bytes::Bytes;
use color_eyre::Result;
use color_eyre::eyre::{ensure, eyre};
use serde::{Deserialize, Serialize};

use crate::hash::{ContentHash, RollingHash};

/// Matching granularity for deltas, independent of the chunker's block size
pub const DELTA_BLOCK_SIZE: usize = 512;

const ZSTD_LEVEL: i32 = 3;

/// Per-block digests of the old content
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signature {
    pub block_size: usize,
    pub blocks: Vec<BlockSignature>,
    pub file_size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockSignature {
    /// Adler-style weak checksum, see [`RollingHash`]
    pub weak: u32,
    pub strong: ContentHash,
    pub index: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeltaOp {
    /// Reuse block `index` of the old content
    Copy { index: usize },
    Literal { data: Bytes },
}

/// Instructions to rebuild the new content from the old
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delta {
    pub block_size: usize,
    pub ops: Vec<DeltaOp>,
    /// Digest of the old content this delta expects as its base
    pub base_hash: ContentHash,
    pub new_hash: ContentHash,
    pub new_size: u64,
}

impl Delta {
    /// Bytes carried inline rather than copied from the base
    #[must_use]
    pub fn literal_bytes(&self) -> u64 {
        self.ops
            .iter()
            .map(|op| match op {
                DeltaOp::Copy { .. } => 0,
                DeltaOp::Literal { data } => data.len() as u64,
            })
            .sum()
    }
}

pub struct DeltaComputer {
    block_size: usize,
}

impl Default for DeltaComputer {
    fn default() -> Self {
        Self::new()
    }
}

impl DeltaComputer {
    #[must_use]
    pub fn new() -> Self {
        Self {
            block_size: DELTA_BLOCK_SIZE,
        }
    }

    /// # Panics
    /// Never; a zero block size is clamped to one byte.
    #[must_use]
    pub fn with_block_size(block_size: usize) -> Self {
        Self {
            block_size: block_size.max(1),
        }
    }

    /// Compute the signature of the old content
    #[must_use]
    pub fn signature(&self, data: &[u8]) -> Signature {
        let blocks = data
            .chunks(self.block_size)
            .enumerate()
            .map(|(index, chunk)| BlockSignature {
                weak: RollingHash::new(chunk).value(),
                strong: ContentHash::from_bytes(chunk),
                index,
            })
            .collect();

        Signature {
            block_size: self.block_size,
            blocks,
            file_size: data.len() as u64,
        }
    }

    /// Encode `new_data` against the signature of the old content.
    ///
    /// The window slides one byte at a time on a miss, updating the weak checksum
    /// in O(1); a weak hit is confirmed with the strong hash before emitting a copy.
    #[must_use]
    pub fn delta(&self, new_data: &[u8], old_sig: &Signature, base_hash: ContentHash) -> Delta {
        let block_size = old_sig.block_size;

        let mut lookup: HashMap<u32, Vec<(ContentHash, usize)>> = HashMap::new();
        for block in &old_sig.blocks {
            // Only full blocks can match a full window
            if (block.index + 1) * block_size <= old_sig.file_size as usize {
                lookup
                    .entry(block.weak)
                    .or_default()
                    .push((block.strong, block.index));
            }
        }

        let mut ops = Vec::new();
        let mut pos = 0;
        let mut literal_start = 0;
        let mut rolling = None;

        while pos + block_size <= new_data.len() {
            let window = &new_data[pos..pos + block_size];
            let weak = rolling
                .get_or_insert_with(|| RollingHash::new(window))
                .value();

            let matched = lookup.get(&weak).and_then(|candidates| {
                let strong = ContentHash::from_bytes(window);
                candidates
                    .iter()
                    .find(|(candidate, _)| *candidate == strong)
                    .map(|(_, index)| *index)
            });

            if let Some(index) = matched {
                if literal_start < pos {
                    ops.push(DeltaOp::Literal {
                        data: Bytes::copy_from_slice(&new_data[literal_start..pos]),
                    });
                }
                ops.push(DeltaOp::Copy { index });
                pos += block_size;
                literal_start = pos;
                rolling = None;
                continue;
            }

            if pos + block_size < new_data.len() {
                if let Some(hash) = rolling.as_mut() {
                    hash.roll(new_data[pos], new_data[pos + block_size]);
                }
            }
            pos += 1;
        }

        if literal_start < new_data.len() {
            ops.push(DeltaOp::Literal {
                data: Bytes::copy_from_slice(&new_data[literal_start..]),
            });
        }

        Delta {
            block_size,
            ops,
            base_hash,
            new_hash: ContentHash::from_bytes(new_data),
            new_size: new_data.len() as u64,
        }
    }

    /// Delta turning `old` into `new`
    #[must_use]
    pub fn diff(&self, old: &[u8], new: &[u8]) -> Delta {
        self.delta(new, &self.signature(old), ContentHash::from_bytes(old))
    }

    /// Rebuild the new content from `old_data`.
    ///
    /// # Errors
    /// Returns an error if `old_data` is not the base the delta was computed against,
    /// a copy references a block past its end, or the result fails verification.
    pub fn apply(old_data: &[u8], delta: &Delta) -> Result<Vec<u8>> {
        ensure!(
            ContentHash::from_bytes(old_data) == delta.base_hash,
            "delta base mismatch: expected {}, found {}",
            delta.base_hash,
            ContentHash::from_bytes(old_data)
        );

        ensure!(delta.block_size > 0, "delta declares a zero block size");

        let copy_len = delta.block_size.min(old_data.len()) as u64;
        let most = delta
            .ops
            .iter()
            .map(|op| match op {
                DeltaOp::Copy { .. } => copy_len,
                DeltaOp::Literal { data } => data.len() as u64,
            })
            .fold(0u64, u64::saturating_add);
        ensure!(
            delta.new_size <= most,
            "delta declares {} bytes but its ops produce at most {most}",
            delta.new_size
        );

        let capacity = usize::try_from(delta.new_size)
            .map_err(|_| eyre!("delta size {} does not fit in memory", delta.new_size))?;
        let mut result = Vec::with_capacity(capacity);

        for op in &delta.ops {
            match op {
                DeltaOp::Copy { index } => {
                    let block = index
                        .checked_mul(delta.block_size)
                        .and_then(|start| {
                            let end = start.saturating_add(delta.block_size).min(old_data.len());
                            old_data.get(start..end)
                        })
                        .ok_or_else(|| eyre!("delta copies block {index} past the end of the base"))?;
                    result.extend_from_slice(block);
                }
                DeltaOp::Literal { data } => result.extend_from_slice(data),
            }
        }

        ensure!(
            result.len() as u64 == delta.new_size,
            "delta declares {} bytes but produced {}",
            delta.new_size,
            result.len()
        );

        let actual = ContentHash::from_bytes(&result);
        ensure!(
            actual == delta.new_hash,
            "hash mismatch after applying delta: expected {}, got {actual}",
            delta.new_hash
        );

        Ok(result)
    }

    /// # Errors
    /// Returns an error if serialization or compression fails
    pub fn compress_delta(delta: &Delta) -> Result<Vec<u8>> {
        let json = serde_json::to_vec(delta)?;
        Ok(zstd::encode_all(json.as_slice(), ZSTD_LEVEL)?)
    }

    /// # Errors
    /// Returns an error if decompression or deserialization fails
    pub fn decompress_delta(data: &[u8]) -> Result<Delta> {
        let decompressed = zstd::decode_all(data)?;
        Ok(serde_json::from_slice(&decompressed)?)
    }
}

/// Compressed delta from `old` to `new`, ready to embed in a patch
///
/// # Errors
/// Returns an error if compression fails
pub fn diff(old: &[u8], new: &[u8]) -> Result<Bytes> {
    let delta = DeltaComputer::new().diff(old, new);
    Ok(Bytes::from(DeltaComputer::compress_delta(&delta)?))
}

/// Apply a compressed delta to `old`
///
/// # Errors
/// Returns an error if the delta is malformed or does not fit `old`
pub fn patch(old: &[u8], compressed: &[u8]) -> Result<Vec<u8>> {
    let delta = DeltaComputer::decompress_delta(compressed)?;
    DeltaComputer::apply(old, &delta)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn copies(delta: &Delta) -> usize {
        delta
            .ops
            .iter()
            .filter(|op| matches!(op, DeltaOp::Copy { .. }))
            .count()
    }

    #[test]
    fn test_identical_content_is_all_copies() {
        let computer = DeltaComputer::with_block_size(16);
        let data = b"Hello, World! This is some test data that spans multiple blocks.".repeat(10);

        let delta = computer.diff(&data, &data);

        assert_eq!(copies(&delta), data.len() / 16);
        assert_eq!(DeltaComputer::apply(&data, &delta).unwrap(), data);
    }

    #[test]
    fn test_insertion_shifts_are_found_by_rolling() {
        let computer = DeltaComputer::with_block_size(8);
        let old: Vec<u8> = (0u8..=200).collect();
        let mut new = b"prefix".to_vec();
        new.extend_from_slice(&old);

        let delta = computer.diff(&old, &new);

        assert!(copies(&delta) >= old.len() / 8);
        assert_eq!(DeltaComputer::apply(&old, &delta).unwrap(), new);
    }

    #[test]
    fn test_single_byte_edit() {
        let computer = DeltaComputer::with_block_size(32);
        let old = b"AAAA".repeat(1000);
        let mut new = old.clone();
        new[500] = b'B';

        let delta = computer.diff(&old, &new);
        assert!(delta.literal_bytes() < 64);
        assert_eq!(DeltaComputer::apply(&old, &delta).unwrap(), new);
    }

    #[test]
    fn test_unrelated_and_empty_content() {
        let computer = DeltaComputer::new();
        for (old, new) in [
            (&b"AAAA"[..], &b"BBBB"[..]),
            (b"", b"fresh"),
            (b"gone", b""),
            (b"", b""),
        ] {
            let delta = computer.diff(old, new);
            assert_eq!(DeltaComputer::apply(old, &delta).unwrap(), new);
        }
    }

    #[test]
    fn test_apply_rejects_wrong_base() {
        let delta = DeltaComputer::new().diff(b"hello", b"world");
        assert!(DeltaComputer::apply(b"HELLO", &delta).is_err());
    }

    #[test]
    fn test_apply_rejects_inflated_or_overflowing_deltas() {
        let old = b"abcdefgh".to_vec();
        let mut delta = DeltaComputer::with_block_size(4).diff(&old, b"abcdXYZ");

        let mut inflated = delta.clone();
        inflated.new_size = u64::MAX;
        assert!(DeltaComputer::apply(&old, &inflated).is_err());

        let mut shrunk = delta.clone();
        shrunk.new_size = 3;
        assert!(DeltaComputer::apply(&old, &shrunk).is_err());

        delta.ops = vec![DeltaOp::Copy { index: usize::MAX }];
        delta.new_size = 4;
        assert!(DeltaComputer::apply(&old, &delta).is_err());

        let zero = Delta {
            block_size: 0,
            ..DeltaComputer::new().diff(&old, &old)
        };
        assert!(DeltaComputer::apply(&old, &zero).is_err());
    }

    #[test]
    fn test_compressed_helpers() {
        let compressed = diff(b"hello world", b"hello there world").unwrap();
        assert_eq!(patch(b"hello world", &compressed).unwrap(), b"hello there world");
        assert!(patch(b"hello world", b"not zstd").is_err());
    }
}
