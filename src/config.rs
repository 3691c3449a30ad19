//! Engine configuration
//!
//! A single versioned JSON file addresses every tunable. Loaded at startup,
//! migrated forward-only when the schema version advances.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub const CONFIG_FILE_NAME: &str = "treesync.json";

/// Default data directory under the platform config dir.
pub fn default_data_dir() -> Result<PathBuf> {
    dirs::data_dir()
        .map(|d| d.join("treesync"))
        .ok_or_else(|| anyhow!("Could not determine platform data directory"))
}

/// Main engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Config schema version
    pub version: u32,

    /// Data directory; the registry database and per-tree caches live here
    pub data_dir: PathBuf,

    /// Directory holding per-tree cache databases, relative to data_dir
    pub cache_dir_name: String,

    /// Quiet period for coalescing filesystem events (ms)
    pub change_batch_interval_ms: u64,

    /// Interval between cloud change-token polls (ms)
    pub cloud_poll_interval_ms: u64,

    /// Chunk size for content hashing (bytes)
    pub read_chunk_size: usize,

    /// Entries a scan task processes before yielding back to the runner
    pub scan_batch_size: usize,

    /// Maximum symlink resolution depth before giving up
    pub max_link_depth: u32,

    /// Name of the staging directory created at each volume root
    pub staging_dir_name: String,

    /// Per-op execution timeout (ms)
    pub op_timeout_ms: u64,

    /// Whether to maintain an MD5 secondary index
    pub enable_md5_lookup: bool,

    /// Whether to compute and index SHA-256 alongside MD5
    pub enable_sha256: bool,

    /// Logging level
    pub log_level: String,
}

impl EngineConfig {
    /// Load configuration from a data directory, creating a default file if
    /// none exists.
    pub fn load_or_create(data_dir: &Path) -> Result<Self> {
        let config_path = data_dir.join(CONFIG_FILE_NAME);

        if config_path.exists() {
            info!("Loading config from {:?}", config_path);
            let json = fs::read_to_string(&config_path)?;
            let mut config: EngineConfig = serde_json::from_str(&json)?;

            if config.version < Self::target_version() {
                info!(
                    "Migrating config from v{} to v{}",
                    config.version,
                    Self::target_version()
                );
                config.migrate()?;
                config.save()?;
            }

            Ok(config)
        } else {
            warn!("No config found, creating default at {:?}", config_path);
            let config = Self::default_with_dir(data_dir.to_path_buf());
            config.save()?;
            Ok(config)
        }
    }

    pub fn default_with_dir(data_dir: PathBuf) -> Self {
        Self {
            version: Self::target_version(),
            data_dir,
            cache_dir_name: "caches".to_string(),
            change_batch_interval_ms: 500,
            cloud_poll_interval_ms: 30_000,
            read_chunk_size: 4096,
            scan_batch_size: 5000,
            max_link_depth: 5,
            staging_dir_name: ".treesync-staging".to_string(),
            op_timeout_ms: 600_000,
            enable_md5_lookup: true,
            enable_sha256: false,
            log_level: "info".to_string(),
        }
    }

    pub fn save(&self) -> Result<()> {
        fs::create_dir_all(&self.data_dir)?;
        let config_path = self.data_dir.join(CONFIG_FILE_NAME);
        let json = serde_json::to_string_pretty(self)?;
        fs::write(&config_path, json)?;
        info!("Saved config to {:?}", config_path);
        Ok(())
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.data_dir.join(&self.cache_dir_name)
    }

    pub fn registry_db_path(&self) -> PathBuf {
        self.data_dir.join("registry.db")
    }

    pub fn ensure_directories(&self) -> Result<()> {
        fs::create_dir_all(&self.data_dir)?;
        fs::create_dir_all(self.cache_dir())?;
        Ok(())
    }

    fn target_version() -> u32 {
        1
    }

    fn migrate(&mut self) -> Result<()> {
        match self.version {
            0 => {
                self.version = 1;
                Ok(())
            }
            1 => Ok(()),
            v => Err(anyhow!("Unknown config version: {}", v)),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        let data_dir = default_data_dir().unwrap_or_else(|_| PathBuf::from("."));
        Self::default_with_dir(data_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn creates_default_and_reloads() {
        let dir = tempdir().unwrap();
        let created = EngineConfig::load_or_create(dir.path()).unwrap();
        assert_eq!(created.version, 1);
        assert!(dir.path().join(CONFIG_FILE_NAME).exists());

        let reloaded = EngineConfig::load_or_create(dir.path()).unwrap();
        assert_eq!(reloaded.change_batch_interval_ms, created.change_batch_interval_ms);
    }

    #[test]
    fn migrates_old_version_forward() {
        let dir = tempdir().unwrap();
        let mut old = EngineConfig::default_with_dir(dir.path().to_path_buf());
        old.version = 0;
        old.save().unwrap();

        let loaded = EngineConfig::load_or_create(dir.path()).unwrap();
        assert_eq!(loaded.version, 1);
    }
}
