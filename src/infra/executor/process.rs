//! Child process plumbing shared by all backends

use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use super::{CommandOutput, CommandRequest};
use crate::error::ExecError;

/// Spawn `command`, feed stdin, and collect output
///
/// The child is killed when the timeout elapses or the token is cancelled
/// (unless the request is uncancellable).
pub(crate) async fn run_process(
    mut command: Command,
    request: &CommandRequest,
    cancel: &CancellationToken,
) -> Result<CommandOutput, ExecError> {
    let command_line = request.display();

    command
        .stdin(if request.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    if request.cancellable && cancel.is_cancelled() {
        return Err(ExecError::Cancelled { command: command_line });
    }

    let mut child = command.spawn().map_err(|e| ExecError::Spawn {
        command: command_line.clone(),
        error: e.to_string(),
    })?;

    // Write stdin concurrently with reading output so large inputs cannot
    // deadlock against a full stdout pipe.
    let writer = match (request.stdin.clone(), child.stdin.take()) {
        (Some(input), Some(mut stdin)) => Some(tokio::spawn(async move {
            let result = stdin.write_all(&input).await;
            drop(stdin);
            result
        })),
        _ => None,
    };

    let wait = child.wait_with_output();
    let finished = async {
        match request.timeout {
            Some(limit) => match tokio::time::timeout(limit, wait).await {
                Ok(result) => result.map_err(|e| io_error(&command_line, e)),
                Err(_) => Err(ExecError::Timeout {
                    command: command_line.clone(),
                    timeout: limit,
                }),
            },
            None => wait.await.map_err(|e| io_error(&command_line, e)),
        }
    };

    let output = if request.cancellable {
        tokio::select! {
            result = finished => result,
            _ = cancel.cancelled() => Err(ExecError::Cancelled { command: command_line.clone() }),
        }
    } else {
        finished.await
    };

    if let Some(writer) = writer {
        match output {
            Ok(_) => {
                if let Ok(Err(e)) = writer.await {
                    // A child that exits without reading all input closes
                    // the pipe early; its exit status is what matters.
                    tracing::debug!(command = %command_line, "stdin write ended early: {}", e);
                }
            }
            Err(_) => writer.abort(),
        }
    }

    let output = output?;
    Ok(CommandOutput {
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        status: output.status.code(),
    })
}

fn io_error(command: &str, error: std::io::Error) -> ExecError {
    ExecError::Io {
        command: command.to_string(),
        error: error.to_string(),
    }
}
