//! Directory-backed swarm: documents are content-addressed files in a shared directory

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use color_eyre::Result;
use color_eyre::eyre::{WrapErr, eyre};
use parking_lot::Mutex;
use tracing::debug;

use crate::Swarm;

const LOCATOR_SCHEME: &str = "swarm:";

/// Swarm whose "seeds" are files under one directory shared by every device
pub struct DirectorySwarm {
    dir: PathBuf,
    seeding: Mutex<HashSet<String>>,
}

impl DirectorySwarm {
    /// # Errors
    /// Returns an error if the directory cannot be created
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            seeding: Mutex::new(HashSet::new()),
        })
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Locators this instance is still seeding
    #[must_use]
    pub fn seeding(&self) -> Vec<String> {
        let mut locators: Vec<_> = self.seeding.lock().iter().cloned().collect();
        locators.sort();
        locators
    }

    fn document_path(&self, locator: &str) -> Result<PathBuf> {
        let digest = locator
            .strip_prefix(LOCATOR_SCHEME)
            .filter(|d| d.len() == 64 && d.bytes().all(|b| b.is_ascii_hexdigit()))
            .ok_or_else(|| eyre!("malformed locator {locator:?}"))?;
        Ok(self.dir.join(format!("{digest}.manifest")))
    }
}

#[async_trait]
impl Swarm for DirectorySwarm {
    async fn publish(&self, document: Bytes) -> Result<String> {
        let locator = format!("{LOCATOR_SCHEME}{}", blake3::hash(&document).to_hex());
        let path = self.document_path(&locator)?;
        tokio::fs::write(&path, &document)
            .await
            .wrap_err_with(|| format!("failed to seed {}", path.display()))?;
        self.seeding.lock().insert(locator.clone());
        debug!("Seeding {locator} ({} bytes)", document.len());
        Ok(locator)
    }

    async fn retrieve(&self, locator: &str) -> Result<Bytes> {
        let path = self.document_path(locator)?;
        let data = tokio::fs::read(&path)
            .await
            .wrap_err_with(|| format!("{locator} is not available"))?;
        Ok(Bytes::from(data))
    }

    async fn stop_seeding(&self, locator: &str) -> Result<()> {
        let path = self.document_path(locator)?;
        self.seeding.lock().remove(locator);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        debug!("Stopped seeding {locator}");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_publish_retrieve_stop() {
        let dir = TempDir::new().unwrap();
        let swarm = DirectorySwarm::new(dir.path()).unwrap();

        let locator = swarm.publish(Bytes::from_static(b"doc")).await.unwrap();
        assert!(locator.starts_with("swarm:"));
        assert_eq!(swarm.retrieve(&locator).await.unwrap(), Bytes::from_static(b"doc"));
        assert_eq!(swarm.seeding(), vec![locator.clone()]);

        swarm.stop_seeding(&locator).await.unwrap();
        assert!(swarm.seeding().is_empty());
        assert!(swarm.retrieve(&locator).await.is_err());
        swarm.stop_seeding(&locator).await.unwrap();
    }

    #[tokio::test]
    async fn test_shared_directory_between_devices() {
        let dir = TempDir::new().unwrap();
        let publisher = DirectorySwarm::new(dir.path()).unwrap();
        let peer = DirectorySwarm::new(dir.path()).unwrap();

        let locator = publisher.publish(Bytes::from_static(b"shared")).await.unwrap();
        assert_eq!(peer.retrieve(&locator).await.unwrap(), Bytes::from_static(b"shared"));
    }

    #[tokio::test]
    async fn test_malformed_locators_rejected() {
        let dir = TempDir::new().unwrap();
        let swarm = DirectorySwarm::new(dir.path()).unwrap();
        assert!(swarm.retrieve("magnet:?xt=abc").await.is_err());
        assert!(swarm.retrieve("swarm:../../etc/passwd").await.is_err());
    }
}
