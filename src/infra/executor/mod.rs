//! Command execution backends
//!
//! Every component that runs an external tool goes through
//! [`CommandExecutor`], so the same disk image logic runs unmodified on the
//! host, inside a sandbox container, or on the controller over SSH.
//!
//! - [`native`] - host subprocesses
//! - [`container`] - a long-lived Docker/Podman sandbox, one per run
//! - [`remote`] - commands over SSH to the controller

pub mod container;
pub mod native;
mod process;
pub mod remote;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::ExecutorConfig;
use crate::error::ExecError;

pub use container::{ContainerConfig, ContainerExecutor, ContainerRuntime, MountConfig};
pub use native::NativeExecutor;
pub use remote::{RemoteShellExecutor, SshTarget};

/// Host tools the disk image engine needs when running natively
pub const DISK_TOOLS: &[&str] = &["kpartx", "losetup", "mount", "umount", "base64"];

/// A single command invocation
#[derive(Debug, Clone, PartialEq)]
pub struct CommandRequest {
    /// Program and arguments
    pub argv: Vec<String>,
    /// Bytes written to the child's stdin
    pub stdin: Option<Vec<u8>>,
    /// Working directory override
    pub workdir: Option<PathBuf>,
    /// Kill the command after this long
    pub timeout: Option<Duration>,
    /// Whether the run's cancellation token aborts this command
    pub cancellable: bool,
}

impl CommandRequest {
    /// Create a request from an argument vector
    pub fn new<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            argv: argv.into_iter().map(Into::into).collect(),
            stdin: None,
            workdir: None,
            timeout: None,
            cancellable: true,
        }
    }

    /// Run a script through `sh -c`
    pub fn shell(script: impl Into<String>) -> Self {
        Self::new(["sh".to_string(), "-c".to_string(), script.into()])
    }

    /// Supply stdin
    pub fn with_stdin(mut self, input: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    /// Override the working directory
    pub fn with_workdir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.workdir = Some(dir.into());
        self
    }

    /// Set a timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Keep running when the run is cancelled (cleanup paths)
    pub fn uncancellable(mut self) -> Self {
        self.cancellable = false;
        self
    }

    /// Human-readable command line for logs and errors
    pub fn display(&self) -> String {
        self.argv.join(" ")
    }
}

/// Captured result of a finished command
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandOutput {
    /// Captured standard output
    pub stdout: String,
    /// Captured standard error
    pub stderr: String,
    /// Exit code, `None` when killed by a signal
    pub status: Option<i32>,
}

impl CommandOutput {
    /// Successful output with the given stdout
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: String::new(),
            status: Some(0),
        }
    }

    /// Failed output with the given status and stderr
    pub fn failed(status: i32, stderr: impl Into<String>) -> Self {
        Self {
            stdout: String::new(),
            stderr: stderr.into(),
            status: Some(status),
        }
    }

    /// Whether the command exited with status 0
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    /// Convert a non-zero exit into [`ExecError::Failed`]
    pub fn into_result(self, command: &str) -> Result<Self, ExecError> {
        if self.success() {
            Ok(self)
        } else {
            Err(ExecError::Failed {
                command: command.to_string(),
                status: self.status,
                stdout: self.stdout,
                stderr: self.stderr,
            })
        }
    }
}

/// Which backend actually runs commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    /// Host subprocess
    Native,
    /// Sandbox container
    Container,
    /// SSH session to the controller
    RemoteShell,
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backend::Native => write!(f, "native"),
            Backend::Container => write!(f, "container"),
            Backend::RemoteShell => write!(f, "remote-shell"),
        }
    }
}

/// Backend requested by the user for local image work
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendChoice {
    /// Native on a capable Linux host, container otherwise
    #[default]
    Auto,
    /// Always native
    Native,
    /// Always container
    Container,
}

impl FromStr for BackendChoice {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "auto" => Ok(BackendChoice::Auto),
            "native" => Ok(BackendChoice::Native),
            "container" => Ok(BackendChoice::Container),
            other => Err(format!(
                "unknown backend '{other}' (expected auto, native or container)"
            )),
        }
    }
}

/// Uniform command execution contract
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    /// Run a command and capture its output, whatever its exit status
    async fn execute(&self, request: CommandRequest) -> Result<CommandOutput, ExecError>;

    /// The backend behind this executor
    fn backend(&self) -> Backend;

    /// Run a request, turning a non-zero exit into an error
    async fn check(&self, request: CommandRequest) -> Result<CommandOutput, ExecError> {
        let command = request.display();
        self.execute(request).await?.into_result(&command)
    }

    /// Run an argument vector, turning a non-zero exit into an error
    async fn run(&self, argv: &[&str]) -> Result<CommandOutput, ExecError> {
        self.check(CommandRequest::new(argv.iter().copied())).await
    }

    /// Run with bytes supplied on stdin
    async fn run_with_stdin(&self, argv: &[&str], input: Vec<u8>) -> Result<CommandOutput, ExecError> {
        self.check(CommandRequest::new(argv.iter().copied()).with_stdin(input))
            .await
    }

    /// Run with a working directory override
    async fn run_in_dir(&self, argv: &[&str], dir: &Path) -> Result<CommandOutput, ExecError> {
        self.check(CommandRequest::new(argv.iter().copied()).with_workdir(dir))
            .await
    }

    /// Run a command for its exit status only
    async fn probe(&self, argv: &[&str]) -> Result<bool, ExecError> {
        Ok(self
            .execute(CommandRequest::new(argv.iter().copied()))
            .await?
            .success())
    }

    /// Release resources held for the run
    async fn release(&self) -> Result<(), ExecError> {
        Ok(())
    }
}

#[async_trait]
impl<T: CommandExecutor + ?Sized> CommandExecutor for Arc<T> {
    async fn execute(&self, request: CommandRequest) -> Result<CommandOutput, ExecError> {
        (**self).execute(request).await
    }

    fn backend(&self) -> Backend {
        (**self).backend()
    }

    async fn release(&self) -> Result<(), ExecError> {
        (**self).release().await
    }
}

/// Executor for local image work, chosen once per pipeline run
pub enum LocalExecutor {
    /// Host subprocesses
    Native(NativeExecutor),
    /// Sandbox container
    Container(ContainerExecutor),
}

impl LocalExecutor {
    /// Create the executor for a run
    ///
    /// The container backend bind-mounts `work_dir` and the directory of each
    /// path in `inputs` at the same path, so image paths mean the same thing
    /// inside and outside the sandbox.
    pub async fn create(
        choice: BackendChoice,
        config: &ExecutorConfig,
        work_dir: &Path,
        inputs: &[PathBuf],
        cancel: CancellationToken,
    ) -> Result<Self, ExecError> {
        match resolve_backend(choice) {
            Backend::Container => {
                let runtime =
                    ContainerRuntime::detect().ok_or_else(|| ExecError::Container {
                        message: "Neither Docker nor Podman found in PATH".to_string(),
                    })?;
                let container = sandbox_config(config, work_dir, inputs);
                let executor = ContainerExecutor::start(runtime, container, cancel).await?;
                Ok(LocalExecutor::Container(executor))
            }
            _ => Ok(LocalExecutor::Native(NativeExecutor::new(cancel))),
        }
    }

    /// Release backend resources; a no-op for the native backend
    pub async fn shutdown(&self) -> Result<(), ExecError> {
        match self {
            LocalExecutor::Native(_) => Ok(()),
            LocalExecutor::Container(c) => c.teardown().await,
        }
    }
}

#[async_trait]
impl CommandExecutor for LocalExecutor {
    async fn execute(&self, request: CommandRequest) -> Result<CommandOutput, ExecError> {
        match self {
            LocalExecutor::Native(e) => e.execute(request).await,
            LocalExecutor::Container(e) => e.execute(request).await,
        }
    }

    fn backend(&self) -> Backend {
        match self {
            LocalExecutor::Native(e) => e.backend(),
            LocalExecutor::Container(e) => e.backend(),
        }
    }

    async fn release(&self) -> Result<(), ExecError> {
        self.shutdown().await
    }
}

/// Sandbox configuration for local image work
///
/// `/dev` and `work_dir` are mounted read-write. Input files are reached
/// through a read-only mount of their parent directory unless `work_dir`
/// already covers them.
pub fn sandbox_config(config: &ExecutorConfig, work_dir: &Path, inputs: &[PathBuf]) -> ContainerConfig {
    let mut container = ContainerConfig::new(&config.container_image)
        .with_mount(MountConfig::read_write(PathBuf::from("/dev"), PathBuf::from("/dev")))
        .with_mount(MountConfig::read_write(work_dir.to_path_buf(), work_dir.to_path_buf()));

    let mut mounted: Vec<PathBuf> = vec![work_dir.to_path_buf()];
    for input in inputs {
        let Some(dir) = input.parent().filter(|d| !d.as_os_str().is_empty()) else {
            continue;
        };
        if mounted.iter().any(|m| dir.starts_with(m)) {
            continue;
        }
        container = container.with_mount(MountConfig::read_only(dir.to_path_buf(), dir.to_path_buf()));
        mounted.push(dir.to_path_buf());
    }
    container
}

/// Decide which backend to use
///
/// Priority: explicit choice > auto-detection (native on a Linux host with
/// the disk tools installed, container otherwise).
pub fn resolve_backend(choice: BackendChoice) -> Backend {
    match choice {
        BackendChoice::Native => Backend::Native,
        BackendChoice::Container => Backend::Container,
        BackendChoice::Auto => {
            if host_supports_native() {
                Backend::Native
            } else {
                Backend::Container
            }
        }
    }
}

/// Whether this host can run the disk image engine natively
pub fn host_supports_native() -> bool {
    cfg!(target_os = "linux") && DISK_TOOLS.iter().all(|tool| which::which(tool).is_ok())
}

/// Quote a word for a POSIX shell
pub fn shell_quote(word: &str) -> String {
    let safe = !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,+@%".contains(c));
    if safe {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', r"'\''"))
    }
}

/// Join an argument vector into a shell command line
pub fn shell_join<S: AsRef<str>>(argv: &[S]) -> String {
    argv.iter()
        .map(|a| shell_quote(a.as_ref()))
        .collect::<Vec<_>>()
        .join(" ")
}
