//! Sandboxed execution in a Docker/Podman container
//!
//! One privileged container is started per pipeline run and every command
//! is sent to it with `exec`. The container must see the host's `/dev` so
//! loop and device-mapper nodes created for an image are usable.

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use super::process::run_process;
use super::{Backend, CommandExecutor, CommandOutput, CommandRequest};
use crate::error::ExecError;

/// Container runtime type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerRuntime {
    /// Docker container runtime
    Docker,
    /// Podman container runtime
    Podman,
}

impl ContainerRuntime {
    /// Get the command name for this runtime
    pub fn command(&self) -> &'static str {
        match self {
            ContainerRuntime::Docker => "docker",
            ContainerRuntime::Podman => "podman",
        }
    }

    /// Detect an available runtime, preferring Docker
    pub fn detect() -> Option<Self> {
        [ContainerRuntime::Docker, ContainerRuntime::Podman]
            .into_iter()
            .find(|runtime| runtime.is_available())
    }

    /// Check if this runtime is installed and answers `--version`
    pub fn is_available(&self) -> bool {
        std::process::Command::new(self.command())
            .arg("--version")
            .output()
            .map(|output| output.status.success())
            .unwrap_or(false)
    }
}

/// Mount configuration for container volumes
#[derive(Debug, Clone, PartialEq)]
pub struct MountConfig {
    /// Host path to mount
    pub host_path: PathBuf,
    /// Container path to mount to
    pub container_path: PathBuf,
    /// Whether the mount is read-only
    pub read_only: bool,
}

impl MountConfig {
    /// Create a new read-only mount
    pub fn read_only(host_path: PathBuf, container_path: PathBuf) -> Self {
        Self {
            host_path,
            container_path,
            read_only: true,
        }
    }

    /// Create a new read-write mount
    pub fn read_write(host_path: PathBuf, container_path: PathBuf) -> Self {
        Self {
            host_path,
            container_path,
            read_only: false,
        }
    }
}

/// Sandbox container configuration
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerConfig {
    /// Container image to use
    pub image: String,
    /// Container name
    pub name: String,
    /// Mount configurations
    pub mounts: Vec<MountConfig>,
    /// Whether the container runs privileged (needed for loop devices)
    pub privileged: bool,
    /// Packages installed after start
    pub packages: Vec<String>,
}

impl ContainerConfig {
    /// Create a config with a name unique to this process
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            name: format!("nodeprov-{}", std::process::id()),
            mounts: Vec::new(),
            privileged: true,
            packages: ["kpartx", "xz-utils", "e2fsprogs", "dosfstools", "util-linux", "udev"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }

    /// Set the container name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Add a mount configuration
    pub fn with_mount(mut self, mount: MountConfig) -> Self {
        self.mounts.push(mount);
        self
    }

    /// Replace the package list installed at start
    pub fn with_packages(mut self, packages: Vec<String>) -> Self {
        self.packages = packages;
        self
    }

    /// Build the `run` arguments that start the long-lived container
    pub fn build_run_args(&self) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "-d".to_string(),
            "--rm".to_string(),
            format!("--name={}", self.name),
        ];

        if self.privileged {
            args.push("--privileged".to_string());
        }

        for mount in &self.mounts {
            let suffix = if mount.read_only { ":ro" } else { "" };
            args.push(format!(
                "-v={}:{}{}",
                mount.host_path.display(),
                mount.container_path.display(),
                suffix
            ));
        }

        args.push(self.image.clone());
        args.extend(["sleep".to_string(), "infinity".to_string()]);
        args
    }

    /// Build the `exec` arguments for one request
    pub fn build_exec_args(&self, request: &CommandRequest) -> Vec<String> {
        let mut args = vec!["exec".to_string()];
        if request.stdin.is_some() {
            args.push("-i".to_string());
        }
        if let Some(dir) = &request.workdir {
            args.push(format!("-w={}", dir.display()));
        }
        args.push(self.name.clone());
        args.extend(request.argv.iter().cloned());
        args
    }
}

/// Runs commands inside a long-lived sandbox container
///
/// Call [`ContainerExecutor::teardown`] when the run ends; dropping an
/// executor that was not torn down force-removes the container.
#[derive(Debug)]
pub struct ContainerExecutor {
    runtime: ContainerRuntime,
    config: ContainerConfig,
    cancel: CancellationToken,
    torn_down: AtomicBool,
}

impl ContainerExecutor {
    /// Start the sandbox container and install the disk tools
    pub async fn start(
        runtime: ContainerRuntime,
        config: ContainerConfig,
        cancel: CancellationToken,
    ) -> Result<Self, ExecError> {
        let mut argv = vec![runtime.command().to_string()];
        argv.extend(config.build_run_args());
        let request = CommandRequest::new(argv);
        let mut command = Command::new(runtime.command());
        command.args(&request.argv[1..]);
        run_process(command, &request, &cancel)
            .await?
            .into_result(&request.display())
            .map_err(|e| ExecError::Container {
                message: format!("failed to start sandbox '{}': {}", config.name, e),
            })?;

        tracing::info!(runtime = runtime.command(), name = %config.name, "sandbox container started");

        let executor = Self {
            runtime,
            config,
            cancel,
            torn_down: AtomicBool::new(false),
        };

        if !executor.config.packages.is_empty() {
            let script = format!(
                "apt-get update -qq && DEBIAN_FRONTEND=noninteractive apt-get install -y -qq {}",
                executor.config.packages.join(" ")
            );
            if let Err(e) = executor.check(CommandRequest::shell(script)).await {
                return Err(executor.abandon(format!("failed to install sandbox tools: {e}")).await);
            }
        }

        Ok(executor)
    }

    /// Remove a container whose setup failed, keeping the setup error
    async fn abandon(&self, message: String) -> ExecError {
        if let Err(teardown) = self.teardown().await {
            tracing::warn!(name = %self.config.name, "failed to remove sandbox after setup failure: {}", teardown);
        }
        ExecError::Container { message }
    }

    /// Container name
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Stop and remove the container
    pub async fn teardown(&self) -> Result<(), ExecError> {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let request =
            CommandRequest::new([self.runtime.command(), "rm", "-f", self.config.name.as_str()])
                .uncancellable();
        let mut command = Command::new(self.runtime.command());
        command.args(["rm", "-f", self.config.name.as_str()]);
        run_process(command, &request, &self.cancel)
            .await?
            .into_result(&request.display())?;
        tracing::info!(name = %self.config.name, "sandbox container removed");
        Ok(())
    }
}

impl Drop for ContainerExecutor {
    fn drop(&mut self) {
        if !self.torn_down.load(Ordering::SeqCst) {
            let removed = std::process::Command::new(self.runtime.command())
                .args(["rm", "-f", self.config.name.as_str()])
                .output();
            if let Err(e) = removed {
                tracing::warn!(name = %self.config.name, "failed to remove sandbox container: {}", e);
            }
        }
    }
}

#[async_trait]
impl CommandExecutor for ContainerExecutor {
    async fn execute(&self, request: CommandRequest) -> Result<CommandOutput, ExecError> {
        if request.argv.is_empty() {
            return Err(ExecError::EmptyCommand);
        }

        let mut command = Command::new(self.runtime.command());
        command.args(self.config.build_exec_args(&request));

        tracing::debug!(backend = "container", command = %request.display(), "exec");
        run_process(command, &request, &self.cancel).await
    }

    fn backend(&self) -> Backend {
        Backend::Container
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_container_runtime_command() {
        assert_eq!(ContainerRuntime::Docker.command(), "docker");
        assert_eq!(ContainerRuntime::Podman.command(), "podman");
    }

    #[test]
    fn test_mount_config() {
        let ro = MountConfig::read_only(PathBuf::from("/a"), PathBuf::from("/b"));
        assert!(ro.read_only);
        let rw = MountConfig::read_write(PathBuf::from("/a"), PathBuf::from("/b"));
        assert!(!rw.read_only);
    }

    #[test]
    fn test_run_args_are_privileged_and_long_lived() {
        let config = ContainerConfig::new("ubuntu:24.04")
            .with_name("np-test")
            .with_mount(MountConfig::read_write(
                PathBuf::from("/dev"),
                PathBuf::from("/dev"),
            ))
            .with_mount(MountConfig::read_only(
                PathBuf::from("/srv/images"),
                PathBuf::from("/images"),
            ));
        let args = config.build_run_args();
        assert_eq!(&args[..4], &["run", "-d", "--rm", "--name=np-test"]);
        assert!(args.contains(&"--privileged".to_string()));
        assert!(args.contains(&"-v=/dev:/dev".to_string()));
        assert!(args.contains(&"-v=/srv/images:/images:ro".to_string()));
        assert_eq!(&args[args.len() - 3..], &["ubuntu:24.04", "sleep", "infinity"]);
    }

    #[test]
    fn test_exec_args_forward_stdin_and_workdir() {
        let config = ContainerConfig::new("ubuntu:24.04").with_name("np-test");
        let request = CommandRequest::new(["base64", "-d"])
            .with_stdin(b"aGk=".to_vec())
            .with_workdir("/work");
        assert_eq!(
            config.build_exec_args(&request),
            vec!["exec", "-i", "-w=/work", "np-test", "base64", "-d"]
        );

        let plain = CommandRequest::new(["true"]);
        assert_eq!(config.build_exec_args(&plain), vec!["exec", "np-test", "true"]);
    }

    #[tokio::test]
    async fn test_abandon_keeps_setup_error_when_removal_fails() {
        let executor = ContainerExecutor {
            runtime: ContainerRuntime::Docker,
            config: ContainerConfig::new("img").with_name("nodeprov-abandon-test"),
            cancel: CancellationToken::new(),
            torn_down: AtomicBool::new(false),
        };
        let err = executor
            .abandon("failed to install sandbox tools: apt-get exited 100".to_string())
            .await;
        assert!(
            matches!(&err, ExecError::Container { message } if message.ends_with("apt-get exited 100")),
            "{err:?}"
        );
        assert!(executor.torn_down.load(Ordering::SeqCst));
    }

    #[test]
    fn test_default_name_is_process_scoped() {
        let config = ContainerConfig::new("img");
        assert_eq!(config.name, format!("nodeprov-{}", std::process::id()));
    }
}
