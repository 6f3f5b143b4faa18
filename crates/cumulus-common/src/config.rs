//! Configuration types for Cumulus
//!
//! This module defines configuration structures used across components.

use crate::DEFAULT_VOLUME_BLOCK_SIZE;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration for Cumulus
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Volume defaults
    pub volume: VolumeConfig,
    /// Instance cache configuration
    pub transport: TransportConfig,
    /// Disk readiness probing
    pub readiness: ReadinessConfig,
    /// Metadata storage
    pub storage: StorageConfig,
    /// Block encryption
    pub crypto: CryptoConfig,
}

impl Config {
    /// Parse a configuration from TOML text
    ///
    /// # Errors
    /// Returns `Error::Configuration` if the text is not valid for this schema.
    pub fn from_toml_str(text: &str) -> crate::Result<Self> {
        toml::from_str(text).map_err(|e| crate::Error::Configuration(e.to_string()))
    }
}

/// Volume defaults applied at creation time
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct VolumeConfig {
    /// Size of a file block in bytes
    pub block_size: u64,
}

impl Default for VolumeConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_VOLUME_BLOCK_SIZE,
        }
    }
}

/// Instance cache configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Lease duration of every cached volume and in-flight file, in seconds
    pub lease_secs: u64,
    /// Maximum number of block transfers running at once for a single file
    pub max_parallel_blocks: usize,
}

impl TransportConfig {
    #[must_use]
    pub const fn lease(&self) -> Duration {
        Duration::from_secs(self.lease_secs)
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            lease_secs: 360,
            max_parallel_blocks: 8,
        }
    }
}

/// Disk readiness probing
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadinessConfig {
    /// Cool-down between two periodic probes of a ready disk, in seconds
    pub check_interval_secs: u64,
    /// Delay before the one-shot probe scheduled by a forced non-blocking check
    pub force_non_blocking_delay_ms: u64,
}

impl ReadinessConfig {
    #[must_use]
    pub const fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    #[must_use]
    pub const fn force_non_blocking_delay(&self) -> Duration {
        Duration::from_millis(self.force_non_blocking_delay_ms)
    }
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: 180,
            force_non_blocking_delay_ms: 1000,
        }
    }
}

/// Metadata storage configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Path of the redb metadata database
    pub metadata_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            metadata_path: PathBuf::from("cumulus.redb"),
        }
    }
}

/// Block encryption configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CryptoConfig {
    /// File holding the 32-byte AES-256 key, required by encrypted volumes
    pub key_path: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.volume.block_size, 8 * 1024 * 1024);
        assert_eq!(config.transport.lease(), Duration::from_secs(360));
        assert_eq!(config.readiness.check_interval(), Duration::from_secs(180));
        assert_eq!(
            config.readiness.force_non_blocking_delay(),
            Duration::from_secs(1)
        );
        assert!(config.crypto.key_path.is_none());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = Config::from_toml_str(
            r#"
            [transport]
            lease_secs = 5

            [storage]
            metadata_path = "/tmp/meta.redb"
            "#,
        )
        .unwrap();

        assert_eq!(config.transport.lease_secs, 5);
        assert_eq!(config.transport.max_parallel_blocks, 8);
        assert_eq!(config.volume.block_size, DEFAULT_VOLUME_BLOCK_SIZE);
        assert_eq!(
            config.storage.metadata_path,
            PathBuf::from("/tmp/meta.redb")
        );
    }

    #[test]
    fn test_invalid_toml() {
        let err = Config::from_toml_str("[transport]\nlease_secs = \"soon\"").unwrap_err();
        assert_eq!(err.code(), "CFG-000");
    }
}
