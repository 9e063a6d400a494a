//! Remote execution over SSH
//!
//! Commands are shell-quoted and sent to the controller with the system
//! `ssh` client. Password authentication goes through `sshpass -e` so the
//! password never appears on a command line.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use super::process::run_process;
use super::{shell_join, shell_quote, Backend, CommandExecutor, CommandOutput, CommandRequest};
use crate::config::ControllerConfig;
use crate::config::defaults;
use crate::error::{ConfigError, ExecError};

/// SSH connection descriptor
#[derive(Debug, Clone, PartialEq)]
pub struct SshTarget {
    /// Hostname or address
    pub host: String,
    /// Login user
    pub user: String,
    /// Port
    pub port: u16,
    /// Password, used through sshpass
    pub password: Option<String>,
    /// Identity file
    pub identity_file: Option<PathBuf>,
}

impl SshTarget {
    /// Create a target with the default port and no credentials
    pub fn new(host: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            user: user.into(),
            port: defaults::DEFAULT_SSH_PORT,
            password: None,
            identity_file: None,
        }
    }

    /// Build the controller target from configuration
    pub fn from_config(config: &ControllerConfig) -> Result<Self, ConfigError> {
        let host = config.host.clone().ok_or_else(|| ConfigError::Missing {
            key: "controller.host".to_string(),
        })?;
        Ok(Self {
            host,
            user: config.user.clone(),
            port: config.port,
            password: config.password.clone(),
            identity_file: config.identity_file.clone(),
        })
    }

    /// Set a password
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// `user@host`
    pub fn destination(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }

    /// Common `-o` options for ssh, scp and rsync's ssh
    pub fn ssh_options(&self) -> Vec<String> {
        let mut opts = vec![
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            "-o".to_string(),
            "UserKnownHostsFile=/dev/null".to_string(),
            "-o".to_string(),
            "LogLevel=ERROR".to_string(),
            "-o".to_string(),
            "ConnectTimeout=10".to_string(),
        ];
        if self.password.is_none() {
            opts.extend(["-o".to_string(), "BatchMode=yes".to_string()]);
        }
        if let Some(identity) = &self.identity_file {
            opts.extend(["-i".to_string(), identity.display().to_string()]);
        }
        opts
    }

    /// Full argv for running `remote_command` on the target
    pub fn ssh_argv(&self, remote_command: &str, tty: bool) -> Vec<String> {
        let mut argv = self.auth_prefix();
        argv.push("ssh".to_string());
        if tty {
            argv.push("-tt".to_string());
        }
        argv.extend(["-p".to_string(), self.port.to_string()]);
        argv.extend(self.ssh_options());
        argv.push(self.destination());
        argv.push(remote_command.to_string());
        argv
    }

    /// Full argv for an interactive login shell with a forced tty
    pub fn login_argv(&self) -> Vec<String> {
        let mut argv = self.auth_prefix();
        argv.extend(["ssh".to_string(), "-tt".to_string()]);
        argv.extend(["-p".to_string(), self.port.to_string()]);
        argv.extend(self.ssh_options());
        argv.push(self.destination());
        argv
    }

    /// Full argv for copying a local file to `remote_path` with scp
    pub fn scp_argv(&self, local: &Path, remote_path: &str) -> Vec<String> {
        let mut argv = self.auth_prefix();
        argv.push("scp".to_string());
        argv.extend(["-P".to_string(), self.port.to_string()]);
        argv.extend(self.ssh_options());
        argv.push(local.display().to_string());
        argv.push(format!("{}:{}", self.destination(), remote_path));
        argv
    }

    /// Full argv for pushing a local file to `remote_path` with rsync,
    /// keeping partial data on interruption
    pub fn rsync_argv(&self, local: &Path, remote_path: &str) -> Vec<String> {
        let mut ssh = vec!["ssh".to_string(), "-p".to_string(), self.port.to_string()];
        ssh.extend(self.ssh_options());
        let mut argv = self.auth_prefix();
        argv.extend([
            "rsync".to_string(),
            "--partial".to_string(),
            "--inplace".to_string(),
            "-e".to_string(),
            shell_join(&ssh),
            local.display().to_string(),
            format!("{}:{}", self.destination(), remote_path),
        ]);
        argv
    }

    /// Build a ready-to-spawn command from an argv produced above
    pub fn command(&self, argv: &[String]) -> Result<Command, ExecError> {
        let (program, args) = argv.split_first().ok_or(ExecError::EmptyCommand)?;
        let mut command = Command::new(program);
        command.args(args);
        if let Some(password) = &self.password {
            command.env("SSHPASS", password);
        }
        Ok(command)
    }

    fn auth_prefix(&self) -> Vec<String> {
        if self.password.is_some() {
            vec!["sshpass".to_string(), "-e".to_string()]
        } else {
            Vec::new()
        }
    }
}

/// Runs commands on a remote host over SSH, capturing combined output
#[derive(Debug, Clone)]
pub struct RemoteShellExecutor {
    target: SshTarget,
    cancel: CancellationToken,
    default_timeout: Option<Duration>,
}

impl RemoteShellExecutor {
    /// Create an executor for `target`
    pub fn new(target: SshTarget, cancel: CancellationToken) -> Self {
        Self {
            target,
            cancel,
            default_timeout: None,
        }
    }

    /// Apply a timeout to requests that do not set one
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = Some(timeout);
        self
    }

    /// The SSH target
    pub fn target(&self) -> &SshTarget {
        &self.target
    }

    /// Cancellation token shared with the run
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Run a host-side transfer tool (scp/rsync) built from this target
    pub async fn run_local_tool(
        &self,
        argv: Vec<String>,
        timeout: Option<Duration>,
    ) -> Result<CommandOutput, ExecError> {
        let command = self.target.command(&argv)?;
        let mut request = CommandRequest::new(argv);
        request.timeout = timeout;
        let command_line = request.display();
        run_process(command, &request, &self.cancel)
            .await?
            .into_result(&command_line)
    }
}

/// Remote command line for a request: quoted argv, optional `cd`, stderr
/// merged into stdout
pub fn remote_script(request: &CommandRequest) -> String {
    let mut script = shell_join(&request.argv);
    if let Some(dir) = &request.workdir {
        script = format!("cd {} && {}", shell_quote(&dir.display().to_string()), script);
    }
    format!("{{ {script}; }} 2>&1")
}

#[async_trait]
impl CommandExecutor for RemoteShellExecutor {
    async fn execute(&self, mut request: CommandRequest) -> Result<CommandOutput, ExecError> {
        if request.argv.is_empty() {
            return Err(ExecError::EmptyCommand);
        }
        if request.timeout.is_none() {
            request.timeout = self.default_timeout;
        }

        let argv = self.target.ssh_argv(&remote_script(&request), false);
        let command = self.target.command(&argv)?;

        tracing::debug!(backend = "remote", host = %self.target.host, command = %request.display(), "exec");
        run_process(command, &request, &self.cancel).await
    }

    fn backend(&self) -> Backend {
        Backend::RemoteShell
    }
}
