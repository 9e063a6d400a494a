//! CLI command implementations
//!
//! Each command is implemented in its own submodule. [`Context`] holds what
//! they share: configuration, directories, and the run's cancellation token.

pub mod discover;
pub mod doctor;
pub mod flash;
pub mod password;
pub mod provision;
pub mod status;
pub mod transfer;
pub mod verify_boot;

use anyhow::{Context as _, Result};
use clap::{Args, Subcommand};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::config::ProvisionConfig;
use crate::core::controller::{BmcController, Controller};
use crate::core::interactive::{SessionOpener, SshSessionOpener};
use crate::core::network::NetworkIdentity;
use crate::core::state::StateStore;
use crate::core::transfer::{ImageTransfer, RemoteTransport, TransferOptions};
use crate::infra::dirs::ProvisionDirs;
use crate::infra::executor::{BackendChoice, CommandExecutor, LocalExecutor, RemoteShellExecutor, SshTarget};

/// Available CLI commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the whole pipeline for one node
    Provision {
        /// Source OS image (.img, .img.xz, .img.gz or .tar.gz)
        image: PathBuf,

        #[command(flatten)]
        target: NodeArgs,

        #[command(flatten)]
        identity: IdentityArgs,

        /// Password to set on first boot (overrides password.new)
        #[arg(long, env = "NODEPROV_NEW_PASSWORD", hide_env_values = true)]
        new_password: Option<String>,

        /// Local executor backend
        #[arg(long)]
        backend: Option<BackendChoice>,

        /// Ship the image as-is without customizing it
        #[arg(long)]
        skip_customize: bool,

        /// Stop after transferring the image
        #[arg(long)]
        skip_flash: bool,

        /// Leave the first-boot password unchanged
        #[arg(long)]
        skip_password: bool,
    },

    /// Decompress an image, inject network identity and recompress it
    Customize {
        /// Source OS image
        image: PathBuf,

        #[command(flatten)]
        target: NodeArgs,

        #[command(flatten)]
        identity: IdentityArgs,

        /// Local executor backend
        #[arg(long)]
        backend: Option<BackendChoice>,
    },

    /// Ship an artifact to the controller
    Transfer {
        /// Local artifact
        artifact: PathBuf,

        #[command(flatten)]
        target: NodeArgs,
    },

    /// Power-cycle and flash a node from an image on the controller
    Flash {
        #[command(flatten)]
        target: NodeArgs,

        /// Image path on the controller
        #[arg(short, long)]
        image: String,
    },

    /// Watch a node's serial console until it has booted
    VerifyBoot {
        #[command(flatten)]
        target: NodeArgs,

        /// Discard buffered console output first
        #[arg(long)]
        reset: bool,
    },

    /// Run the first-boot password change on a node
    SetPassword {
        #[command(flatten)]
        target: NodeArgs,

        /// Node address (defaults to the configured identity)
        #[arg(long)]
        ip: Option<Ipv4Addr>,

        /// Password to set (overrides password.new)
        #[arg(long, env = "NODEPROV_NEW_PASSWORD", hide_env_values = true)]
        new_password: Option<String>,
    },

    /// Show recorded node status
    Status {
        /// Only this node
        #[arg(short, long)]
        node: Option<u32>,
    },

    /// Probe nodes for power state and ssh reachability
    Discover {
        /// Highest node id to probe
        #[arg(long)]
        max_node: Option<u32>,

        /// Concurrent probes
        #[arg(long)]
        concurrency: Option<usize>,
    },

    /// Check host tools
    Doctor,
}

/// Target node selection
#[derive(Args, Debug, Clone)]
pub struct NodeArgs {
    /// Node id on the controller
    #[arg(short, long)]
    pub node: u32,
}

/// Network identity overrides; unset values come from `[nodes.<id>]`
#[derive(Args, Debug, Clone, Default)]
pub struct IdentityArgs {
    /// Hostname
    #[arg(long)]
    pub hostname: Option<String>,

    /// Static IPv4 address
    #[arg(long)]
    pub ip: Option<Ipv4Addr>,

    /// Prefix length
    #[arg(long)]
    pub prefix: Option<u8>,

    /// Default gateway
    #[arg(long)]
    pub gateway: Option<Ipv4Addr>,

    /// DNS servers (repeatable or comma separated)
    #[arg(long, value_delimiter = ',')]
    pub dns: Vec<Ipv4Addr>,
}

impl IdentityArgs {
    /// Layer these flags over the configured identity
    pub fn resolve(&self, configured: Option<&NetworkIdentity>) -> NetworkIdentity {
        let flags = NetworkIdentity {
            hostname: self.hostname.clone(),
            address: self.ip,
            prefix_len: self.prefix,
            gateway: self.gateway,
            dns: self.dns.clone(),
        };
        match configured {
            Some(file) => flags.or(file),
            None => flags,
        }
    }
}

/// Absolute form of a path given on the command line
///
/// Existing files are canonicalized; anything else is joined to `cwd`.
pub fn absolute_input(path: &Path, cwd: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| cwd.join(path))
}

/// Shared state for one command invocation
pub struct Context {
    pub config: ProvisionConfig,
    pub dirs: ProvisionDirs,
    pub cancel: CancellationToken,
}

impl Context {
    /// Load configuration for this invocation
    pub fn load(config_path: Option<&Path>, cancel: CancellationToken) -> Result<Self> {
        let dirs = ProvisionDirs::new();
        let cwd = std::env::current_dir().context("Failed to determine current directory")?;
        let config = ProvisionConfig::load(config_path, &cwd, &dirs).context("Failed to load configuration")?;
        Ok(Self { config, dirs, cancel })
    }

    /// Remote shell on the controller
    pub fn controller_shell(&self) -> Result<RemoteShellExecutor> {
        let target = SshTarget::from_config(&self.config.controller)
            .context("Controller connection is not configured")?;
        Ok(RemoteShellExecutor::new(target, self.cancel.clone())
            .with_default_timeout(self.config.controller.command_timeout()))
    }

    pub fn controller(&self) -> Result<Arc<dyn Controller>> {
        let controller = BmcController::new(self.controller_shell()?)
            .with_command_timeout(self.config.controller.command_timeout());
        Ok(Arc::new(controller))
    }

    pub fn transfer(&self) -> Result<ImageTransfer<Arc<dyn RemoteTransport>>> {
        let transport: Arc<dyn RemoteTransport> = Arc::new(self.controller_shell()?);
        Ok(ImageTransfer::new(
            transport,
            self.config.controller.remote_base.clone(),
            TransferOptions::from(&self.config.transfer),
        )
        .with_cancel(self.cancel.clone()))
    }

    /// Executor for local image work; the caller must release it
    ///
    /// `inputs` are host files the executor must be able to read.
    pub async fn local_executor(
        &self,
        backend: Option<BackendChoice>,
        inputs: &[PathBuf],
    ) -> Result<Arc<dyn CommandExecutor>> {
        let choice = backend.unwrap_or(self.config.executor.backend);
        let work_dir = self.dirs.cache_dir();
        crate::infra::filesystem::create_dir_all(&work_dir)?;
        let executor = LocalExecutor::create(choice, &self.config.executor, &work_dir, inputs, self.cancel.clone())
            .await
            .context("Failed to set up local executor")?;
        Ok(Arc::new(executor))
    }

    pub fn open_state(&self) -> Result<StateStore> {
        Ok(StateStore::open(&self.dirs.state_path())?)
    }

    /// ssh session opener for a node's first-boot login
    pub fn session_opener(&self, address: Ipv4Addr) -> Arc<dyn SessionOpener> {
        let password = &self.config.password;
        let target = SshTarget::new(address.to_string(), password.user.clone()).with_password(password.initial.clone());
        Arc::new(SshSessionOpener::new(target))
    }

    /// New password from the flag or the config file
    pub fn new_password(&self, flag: Option<String>) -> Option<String> {
        flag.or_else(|| self.config.password.new.clone())
    }
}

impl Commands {
    /// Execute the command
    pub async fn run(self, config_path: Option<&Path>, cancel: CancellationToken) -> Result<()> {
        if let Self::Doctor = self {
            return doctor::execute().await;
        }
        let ctx = Context::load(config_path, cancel)?;
        match self {
            Self::Provision {
                image,
                target,
                identity,
                new_password,
                backend,
                skip_customize,
                skip_flash,
                skip_password,
            } => {
                let options = provision::ProvisionArgs {
                    image,
                    node: target.node,
                    identity,
                    new_password,
                    backend,
                    skip_customize,
                    skip_flash,
                    skip_password,
                };
                provision::execute(&ctx, options).await
            }
            Self::Customize {
                image,
                target,
                identity,
                backend,
            } => provision::execute_customize(&ctx, &image, target.node, &identity, backend).await,
            Self::Transfer { artifact, target } => transfer::execute(&ctx, &artifact, target.node).await,
            Self::Flash { target, image } => flash::execute(&ctx, target.node, &image).await,
            Self::VerifyBoot { target, reset } => verify_boot::execute(&ctx, target.node, reset).await,
            Self::SetPassword {
                target,
                ip,
                new_password,
            } => password::execute(&ctx, target.node, ip, new_password).await,
            Self::Status { node } => status::execute(&ctx, node).await,
            Self::Discover { max_node, concurrency } => discover::execute(&ctx, max_node, concurrency).await,
            Self::Doctor => doctor::execute().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_absolute_input() {
        let temp = tempfile::TempDir::new().unwrap();
        let image = temp.path().join("node1.img.xz");
        std::fs::write(&image, b"x").unwrap();

        let resolved = absolute_input(&image, Path::new("/elsewhere"));
        assert_eq!(resolved, image.canonicalize().unwrap());
        assert_eq!(
            absolute_input(Path::new("missing.img"), Path::new("/work")),
            PathBuf::from("/work/missing.img")
        );
    }

    #[test]
    fn test_identity_flags_override_file() {
        let file = NetworkIdentity {
            hostname: Some("host1".to_string()),
            address: Some("192.168.1.101".parse().unwrap()),
            prefix_len: Some(24),
            gateway: Some("192.168.1.1".parse().unwrap()),
            dns: vec!["1.1.1.1".parse().unwrap()],
        };
        let flags = IdentityArgs {
            ip: Some("10.0.0.7".parse().unwrap()),
            ..IdentityArgs::default()
        };
        let resolved = flags.resolve(Some(&file));
        assert_eq!(resolved.address, Some("10.0.0.7".parse().unwrap()));
        assert_eq!(resolved.hostname.as_deref(), Some("host1"));
        assert_eq!(resolved.dns, file.dns);
    }
}
