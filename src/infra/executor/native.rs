//! Native host execution

use async_trait::async_trait;
use std::time::Duration;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use super::process::run_process;
use super::{Backend, CommandExecutor, CommandOutput, CommandRequest};
use crate::error::ExecError;

/// Runs commands as host subprocesses
#[derive(Debug, Clone)]
pub struct NativeExecutor {
    cancel: CancellationToken,
    default_timeout: Option<Duration>,
}

impl NativeExecutor {
    /// Create an executor bound to a run's cancellation token
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            default_timeout: None,
        }
    }

    /// Apply a timeout to requests that do not set one
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = Some(timeout);
        self
    }
}

#[async_trait]
impl CommandExecutor for NativeExecutor {
    async fn execute(&self, mut request: CommandRequest) -> Result<CommandOutput, ExecError> {
        let (program, args) = request.argv.split_first().ok_or(ExecError::EmptyCommand)?;

        let mut command = Command::new(program);
        command.args(args);
        if let Some(dir) = &request.workdir {
            command.current_dir(dir);
        }
        if request.timeout.is_none() {
            request.timeout = self.default_timeout;
        }

        tracing::debug!(backend = "native", command = %request.display(), "exec");
        run_process(command, &request, &self.cancel).await
    }

    fn backend(&self) -> Backend {
        Backend::Native
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_captures_stdout_and_status() {
        let exec = NativeExecutor::new(CancellationToken::new());
        let out = exec
            .execute(CommandRequest::shell("echo out; echo err >&2; exit 3"))
            .await
            .unwrap();
        assert_eq!(out.stdout.trim(), "out");
        assert_eq!(out.stderr.trim(), "err");
        assert_eq!(out.status, Some(3));
    }

    #[tokio::test]
    async fn test_run_rejects_non_zero_exit() {
        let exec = NativeExecutor::new(CancellationToken::new());
        let err = exec.run(&["false"]).await.unwrap_err();
        assert!(matches!(err, ExecError::Failed { .. }));
    }

    #[tokio::test]
    async fn test_stdin_is_delivered() {
        let exec = NativeExecutor::new(CancellationToken::new());
        let out = exec
            .run_with_stdin(&["cat"], b"hello".to_vec())
            .await
            .unwrap();
        assert_eq!(out.stdout, "hello");
    }

    #[tokio::test]
    async fn test_workdir_override() {
        let temp = tempfile::TempDir::new().unwrap();
        let exec = NativeExecutor::new(CancellationToken::new());
        let out = exec.run_in_dir(&["pwd"], temp.path()).await.unwrap();
        let reported = std::path::PathBuf::from(out.stdout.trim());
        assert_eq!(
            reported.canonicalize().unwrap(),
            temp.path().canonicalize().unwrap()
        );
    }

    #[tokio::test]
    async fn test_timeout_kills_command() {
        let exec = NativeExecutor::new(CancellationToken::new());
        let err = exec
            .execute(CommandRequest::new(["sleep", "5"]).with_timeout(Duration::from_millis(100)))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_cancellation_aborts_command() {
        let cancel = CancellationToken::new();
        let exec = NativeExecutor::new(cancel.clone());
        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            cancel.cancel();
        });
        let started = std::time::Instant::now();
        let err = exec.run(&["sleep", "10"]).await.unwrap_err();
        canceller.await.unwrap();
        assert!(err.is_cancelled());
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_uncancellable_request_runs_after_cancel() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let exec = NativeExecutor::new(cancel);
        assert!(exec.run(&["true"]).await.unwrap_err().is_cancelled());
        let out = exec
            .execute(CommandRequest::new(["echo", "cleanup"]).uncancellable())
            .await
            .unwrap();
        assert!(out.success());
    }

    #[tokio::test]
    async fn test_empty_command() {
        let exec = NativeExecutor::new(CancellationToken::new());
        let empty: [&str; 0] = [];
        assert_eq!(
            exec.execute(CommandRequest::new(empty)).await.unwrap_err(),
            ExecError::EmptyCommand
        );
    }
}
