//! Configuration and constants
//!
//! [`ProvisionConfig`] is read from `nodeprov.toml` in the working directory,
//! or from `config.toml` in the global config directory. Every field has a
//! default, so an absent file yields a usable configuration.
//!
//! Priority: CLI flags > config file > defaults.

pub mod defaults;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::core::network::NetworkIdentity;
use crate::error::ConfigError;
use crate::infra::dirs::ProvisionDirs;
use crate::infra::executor::BackendChoice;

/// Full nodeprov configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ProvisionConfig {
    /// Controller connection
    #[serde(default)]
    pub controller: ControllerConfig,

    /// Local command execution backend
    #[serde(default)]
    pub executor: ExecutorConfig,

    /// Image transfer tuning
    #[serde(default)]
    pub transfer: TransferConfig,

    /// Flash and power tuning
    #[serde(default)]
    pub flash: FlashConfig,

    /// Boot verification tuning
    #[serde(default)]
    pub boot: BootConfig,

    /// First-boot password change
    #[serde(default)]
    pub password: PasswordConfig,

    /// Per-node network identity, keyed by node id
    #[serde(default)]
    pub nodes: BTreeMap<String, NetworkIdentity>,
}

/// Controller connection settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ControllerConfig {
    /// Controller hostname or address
    pub host: Option<String>,
    /// SSH user
    pub user: String,
    /// SSH port
    pub port: u16,
    /// Password (uses sshpass when set)
    pub password: Option<String>,
    /// SSH identity file
    pub identity_file: Option<PathBuf>,
    /// Remote base directory for transferred images
    pub remote_base: String,
    /// Timeout for a single remote command, in seconds
    pub command_timeout_secs: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            host: None,
            user: defaults::DEFAULT_CONTROLLER_USER.to_string(),
            port: defaults::DEFAULT_SSH_PORT,
            password: None,
            identity_file: None,
            remote_base: defaults::REMOTE_CACHE_BASE.to_string(),
            command_timeout_secs: defaults::REMOTE_COMMAND_TIMEOUT.as_secs(),
        }
    }
}

impl ControllerConfig {
    /// Timeout for a single remote command
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

/// Executor backend settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Backend selection
    pub backend: BackendChoice,
    /// Container image for the sandboxed backend
    pub container_image: String,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            backend: BackendChoice::Auto,
            container_image: defaults::CONTAINER_IMAGE.to_string(),
        }
    }
}

/// Transfer settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TransferConfig {
    /// Attempts per tier
    pub attempts: u32,
    /// Delay between attempts, in seconds
    pub retry_delay_secs: u64,
    /// Chunk size for the chunked tier, in MiB
    pub chunk_size_mib: u64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            attempts: defaults::TRANSFER_ATTEMPTS,
            retry_delay_secs: defaults::TRANSFER_RETRY_DELAY.as_secs(),
            chunk_size_mib: defaults::TRANSFER_CHUNK_SIZE / (1024 * 1024),
        }
    }
}

/// Flash settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FlashConfig {
    /// Overall flash timeout, in seconds
    pub timeout_secs: u64,
    /// Heartbeat interval, in seconds
    pub heartbeat_secs: u64,
    /// Wait budget for power-off, in seconds
    pub power_off_wait_secs: u64,
}

impl Default for FlashConfig {
    fn default() -> Self {
        Self {
            timeout_secs: defaults::FLASH_TIMEOUT.as_secs(),
            heartbeat_secs: defaults::FLASH_HEARTBEAT_INTERVAL.as_secs(),
            power_off_wait_secs: defaults::POWER_OFF_WAIT.as_secs(),
        }
    }
}

/// Boot verification settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BootConfig {
    /// Overall timeout, in seconds
    pub timeout_secs: u64,
    /// Poll interval, in seconds
    pub poll_interval_secs: u64,
}

impl Default for BootConfig {
    fn default() -> Self {
        Self {
            timeout_secs: defaults::BOOT_TIMEOUT.as_secs(),
            poll_interval_secs: defaults::BOOT_POLL_INTERVAL.as_secs(),
        }
    }
}

/// Password change settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PasswordConfig {
    /// Login user on the node
    pub user: String,
    /// First-boot password shipped with the image
    pub initial: String,
    /// New password to set
    pub new: Option<String>,
    /// Session attempts
    pub attempts: u32,
    /// Delay between attempts, in seconds
    pub retry_delay_secs: u64,
}

impl Default for PasswordConfig {
    fn default() -> Self {
        Self {
            user: defaults::DEFAULT_NODE_USER.to_string(),
            initial: defaults::DEFAULT_INITIAL_PASSWORD.to_string(),
            new: None,
            attempts: defaults::INTERACT_ATTEMPTS,
            retry_delay_secs: defaults::INTERACT_RETRY_DELAY.as_secs(),
        }
    }
}

impl ProvisionConfig {
    /// Load configuration
    ///
    /// An explicit path must exist. Otherwise `nodeprov.toml` in `cwd` is
    /// preferred over the global config file; if neither exists the
    /// defaults are returned.
    pub fn load(
        explicit: Option<&Path>,
        cwd: &Path,
        dirs: &ProvisionDirs,
    ) -> Result<Self, ConfigError> {
        if let Some(path) = explicit {
            if !path.exists() {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    error: "file does not exist".to_string(),
                });
            }
            return Self::load_from_path(path);
        }

        let local = cwd.join(defaults::LOCAL_CONFIG_FILE);
        if local.exists() {
            return Self::load_from_path(&local);
        }

        Self::load_from_path(&dirs.global_config_path())
    }

    /// Load configuration from a specific path, defaulting when absent
    pub fn load_from_path(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        Self::from_toml(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            error: e.to_string(),
        })
    }

    /// Parse from TOML string
    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Serialize to TOML string
    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }

    /// Network identity configured for a node
    pub fn node_identity(&self, node: u32) -> Option<&NetworkIdentity> {
        self.nodes.get(&node.to_string())
    }

    /// Controller host, required for anything touching the controller
    pub fn controller_host(&self) -> Result<&str, ConfigError> {
        self.controller
            .host
            .as_deref()
            .ok_or_else(|| ConfigError::Missing {
                key: "controller.host".to_string(),
            })
    }
}
