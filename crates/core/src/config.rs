//! swarmsync configuration file parsing (swarmsync.toml)

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use color_eyre::Result;
use color_eyre::eyre::{WrapErr, ensure};

use crate::chunker::DEFAULT_BLOCK_SIZE;

/// Config file name
pub const CONFIG_FILE: &str = "swarmsync.toml";

/// Per-device synchronization settings
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Directory kept in sync
    pub root: PathBuf,
    pub device_id: String,
    pub user_id: String,
    pub block_size_in_bytes: u64,
    /// Seconds between change-detection ticks
    pub interval_in_seconds_check: u64,
    /// Inbound listener address
    pub listen: SocketAddr,
    /// Away devices neither prompt on join nor push periodically
    pub away: bool,
    /// How long a Transfer waits for the pulled blocks before giving up
    pub reconcile_timeout_secs: u64,
    pub heartbeat_interval_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            device_id: "device".to_string(),
            user_id: "default".to_string(),
            block_size_in_bytes: DEFAULT_BLOCK_SIZE,
            interval_in_seconds_check: 5,
            listen: SocketAddr::from(([0, 0, 0, 0], 3125)),
            away: false,
            reconcile_timeout_secs: 120,
            heartbeat_interval_secs: 3,
        }
    }
}

impl SyncConfig {
    /// Load config from a file.
    ///
    /// Returns the default config if the file doesn't exist.
    ///
    /// # Errors
    /// Returns an error if the file exists but cannot be parsed or is invalid.
    pub fn load(path: &Path) -> Result<Self> {
        let config = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            toml::from_str(&content)
                .wrap_err_with(|| format!("failed to parse {}", path.display()))?
        } else {
            Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    /// Returns an error naming the first invalid setting
    pub fn validate(&self) -> Result<()> {
        ensure!(self.block_size_in_bytes > 0, "block_size_in_bytes must be positive");
        ensure!(
            self.interval_in_seconds_check > 0,
            "interval_in_seconds_check must be positive"
        );
        ensure!(
            self.heartbeat_interval_secs > 0,
            "heartbeat_interval_secs must be positive"
        );
        ensure!(!self.device_id.is_empty(), "device_id must not be empty");
        ensure!(!self.user_id.is_empty(), "user_id must not be empty");
        Ok(())
    }

    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_in_seconds_check)
    }

    #[must_use]
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    #[must_use]
    pub fn reconcile_timeout(&self) -> Duration {
        Duration::from_secs(self.reconcile_timeout_secs)
    }

    /// Write the config as TOML, creating parent directories.
    ///
    /// # Errors
    /// Returns an error if serialization or the write fails.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).wrap_err("failed to serialize config")?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)
            .wrap_err_with(|| format!("failed to write {}", path.display()))
    }
}
