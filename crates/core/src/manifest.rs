//! Transport documents: changeset manifests and chunk manifests, as zstd-compressed JSON

use std::time::{SystemTime, UNIX_EPOCH};

use color_eyre::Result;
use color_eyre::eyre::{WrapErr, ensure};
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;

use crate::chunker::BlockManifest;
use crate::model::{ChangeKind, ChangeSet};

const ZSTD_LEVEL: i32 = 3;

/// A changeset as published through the swarm
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub kind: ChangeKind,
    pub changes: ChangeSet,
    /// Seconds since the Unix epoch
    pub created_at: u64,
}

impl Manifest {
    #[must_use]
    pub fn new(changes: ChangeSet) -> Self {
        Self {
            kind: changes.kind(),
            changes,
            created_at: unix_now(),
        }
    }

    /// # Errors
    /// Returns an error if serialization or compression fails
    pub fn encode(&self) -> Result<Vec<u8>> {
        encode_document(self)
    }

    /// Decode and check a received manifest.
    ///
    /// # Errors
    /// Returns an error if the document is malformed, its declared kind disagrees with
    /// its modifications, or the changeset breaks a structural invariant.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let manifest: Self = decode_document(data).wrap_err("malformed manifest")?;
        ensure!(
            manifest.kind == manifest.changes.kind(),
            "manifest declares kind {} but carries {} modifications",
            manifest.kind,
            manifest.changes.kind()
        );
        manifest.changes.validate()?;
        Ok(manifest)
    }

    /// Decode, additionally requiring a specific kind
    ///
    /// # Errors
    /// See [`Manifest::decode`]; also fails when the kind is not `expected`.
    pub fn decode_expecting(data: &[u8], expected: ChangeKind) -> Result<Self> {
        let manifest = Self::decode(data)?;
        ensure!(
            manifest.kind == expected,
            "expected a {expected} manifest, got {}",
            manifest.kind
        );
        Ok(manifest)
    }
}

impl BlockManifest {
    /// # Errors
    /// Returns an error if serialization or compression fails
    pub fn encode(&self) -> Result<Vec<u8>> {
        encode_document(self)
    }

    /// # Errors
    /// Returns an error if the document is malformed
    pub fn decode(data: &[u8]) -> Result<Self> {
        decode_document(data).wrap_err("malformed chunk manifest")
    }
}

fn encode_document<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let json = serde_json::to_vec(value)?;
    Ok(zstd::encode_all(json.as_slice(), ZSTD_LEVEL)?)
}

fn decode_document<T: DeserializeOwned>(data: &[u8]) -> Result<T> {
    let json = zstd::decode_all(data)?;
    Ok(serde_json::from_slice(&json)?)
}

/// Current time as seconds since the Unix epoch
#[must_use]
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}
