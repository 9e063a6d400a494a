//! Platform-specific directory management
//!
//! Provides platform-specific paths for cache, config, and data directories.
//!
//! Environment variables can override default directories:
//! - `NODEPROV_CACHE_DIR` - Override cache directory (image working copies)
//! - `NODEPROV_CONFIG_DIR` - Override config directory
//! - `NODEPROV_DATA_DIR` - Override data directory (node status store)

use std::env;
use std::path::{Path, PathBuf};

use crate::config::defaults;

/// Environment variable names for directory overrides
pub const ENV_CACHE_DIR: &str = "NODEPROV_CACHE_DIR";
pub const ENV_CONFIG_DIR: &str = "NODEPROV_CONFIG_DIR";
pub const ENV_DATA_DIR: &str = "NODEPROV_DATA_DIR";

/// Application name used in directory paths
const APP_NAME: &str = "nodeprov";

/// Subdirectory names
const WORK_SUBDIR: &str = "work";
const MOUNT_SUBDIR: &str = "mnt";

/// Directory provider for nodeprov
///
/// Every per-node path is namespaced by node id so that runs against
/// different nodes never collide.
#[derive(Debug, Clone)]
pub struct ProvisionDirs {
    cache_dir: PathBuf,
    config_dir: PathBuf,
    data_dir: PathBuf,
}

impl ProvisionDirs {
    /// Create a new instance from environment overrides or platform defaults
    #[must_use]
    pub fn new() -> Self {
        Self {
            cache_dir: resolve(ENV_CACHE_DIR, dirs::cache_dir(), ".cache"),
            config_dir: resolve(ENV_CONFIG_DIR, dirs::config_dir(), ".config"),
            data_dir: resolve(ENV_DATA_DIR, dirs::data_dir(), ".local/share"),
        }
    }

    /// Root all directories under one base (used by tests)
    #[must_use]
    pub fn with_base(base: &Path) -> Self {
        Self {
            cache_dir: base.join("cache"),
            config_dir: base.join("config"),
            data_dir: base.join("data"),
        }
    }

    /// Cache directory
    #[must_use]
    pub fn cache_dir(&self) -> PathBuf {
        self.cache_dir.clone()
    }

    /// Config directory
    #[must_use]
    pub fn config_dir(&self) -> PathBuf {
        self.config_dir.clone()
    }

    /// Data directory
    #[must_use]
    pub fn data_dir(&self) -> PathBuf {
        self.data_dir.clone()
    }

    /// Working directory for a node's image copies
    #[must_use]
    pub fn node_work_dir(&self, node: u32) -> PathBuf {
        self.cache_dir.join(WORK_SUBDIR).join(node.to_string())
    }

    /// Mount point for a node's root partition
    #[must_use]
    pub fn node_mount_dir(&self, node: u32) -> PathBuf {
        self.cache_dir.join(MOUNT_SUBDIR).join(node.to_string())
    }

    /// Global config file path
    #[must_use]
    pub fn global_config_path(&self) -> PathBuf {
        self.config_dir.join(defaults::CONFIG_FILE)
    }

    /// Node status store path
    #[must_use]
    pub fn state_path(&self) -> PathBuf {
        self.data_dir.join(defaults::STATE_FILE)
    }
}

impl Default for ProvisionDirs {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolve a directory from an environment variable, platform default, or
/// a home-relative fallback
fn resolve(var: &str, platform: Option<PathBuf>, home_relative: &str) -> PathBuf {
    if let Ok(path) = env::var(var) {
        return PathBuf::from(path);
    }

    platform.map(|p| p.join(APP_NAME)).unwrap_or_else(|| {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(home_relative)
            .join(APP_NAME)
    })
}
