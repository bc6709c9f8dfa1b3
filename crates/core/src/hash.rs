//! Content digests (BLAKE3) and the weak rolling checksum used by the delta encoder

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A content hash using BLAKE3 (256-bit)
///
/// Serialized as a lowercase hex string so manifests stay readable.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentHash([u8; 32]);

impl ContentHash {
    /// Hash arbitrary bytes
    #[must_use]
    pub fn from_bytes(data: &[u8]) -> Self {
        Self(*blake3::hash(data).as_bytes())
    }

    /// Digest of zero bytes, carried by empty files and directories
    #[must_use]
    pub fn empty() -> Self {
        Self::from_bytes(&[])
    }

    /// Convert to hex string
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl FromStr for ContentHash {
    type Err = color_eyre::Report;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut raw = [0u8; 32];
        hex::decode_to_slice(s, &mut raw)
            .map_err(|e| color_eyre::eyre::eyre!("invalid content hash {s:?}: {e}"))?;
        Ok(Self(raw))
    }
}

impl Serialize for ContentHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ContentHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = self.to_hex();
        write!(f, "ContentHash({})", hex.get(..16).unwrap_or(&hex))
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = self.to_hex();
        write!(f, "{}", hex.get(..16).unwrap_or(&hex))
    }
}

/// Adler-style rolling checksum for rsync-style block matching.
///
/// Sliding the window by one byte is O(1), which keeps delta encoding linear in the
/// size of the new data.
#[derive(Clone, Copy, Debug)]
pub struct RollingHash {
    a: u32,
    b: u32,
    window: u32,
}

impl RollingHash {
    const MOD: u32 = 65521;

    /// Create a new rolling hash over a block
    #[must_use]
    pub fn new(block: &[u8]) -> Self {
        let mut a: u32 = 0;
        let mut b: u32 = 0;
        let len = block.len() as u32;

        for (i, &byte) in block.iter().enumerate() {
            a = (a + u32::from(byte)) % Self::MOD;
            b = (b + (len - i as u32) % Self::MOD * u32::from(byte)) % Self::MOD;
        }

        Self { a, b, window: len }
    }

    /// Slide the window: drop `old` from the front, append `new` at the back
    pub fn roll(&mut self, old: u8, new: u8) {
        let old = u32::from(old);
        let new = u32::from(new);

        self.a = (self.a + Self::MOD - old + new) % Self::MOD;
        let removed = (self.window % Self::MOD) * old % Self::MOD;
        self.b = (self.b + Self::MOD - removed + self.a) % Self::MOD;
    }

    /// Get the current hash value
    #[must_use]
    pub fn value(&self) -> u32 {
        (self.b << 16) | self.a
    }
}
