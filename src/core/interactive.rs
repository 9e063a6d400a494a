//! Scripted expect/send sessions
//!
//! A script is an ordered list of [`InteractionStep`]s run once, strictly in
//! order, over any async byte stream. After the last step the remaining
//! output is read and classified; anything not recognised as success is a
//! failure.

use async_trait::async_trait;
use std::pin::Pin;
use std::process::Stdio;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::process::{Child, ChildStdin, ChildStdout};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::{defaults, PasswordConfig};
use crate::error::InteractError;
use crate::infra::executor::SshTarget;

/// Output confirming a password change
const SUCCESS_PHRASES: &[&str] = &[
    "password updated successfully",
    "all authentication tokens updated successfully",
];

/// Output rejecting a password change, with the reason reported for it
const REJECTION_PHRASES: &[(&str, &str)] = &[
    ("is shorter than", "password too short"),
    ("too short", "password too short"),
    ("do not match", "passwords do not match"),
    ("authentication token manipulation error", "authentication token manipulation error"),
    ("bad password", "password rejected by policy"),
    ("permission denied", "authentication failed"),
];

/// One expect/send pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InteractionStep {
    /// Substring to wait for
    pub expect: String,
    /// Text sent once it appears
    pub send: String,
    /// Bound on the wait
    pub timeout: Duration,
}

impl InteractionStep {
    /// Step that sends `send` followed by a newline
    pub fn line(expect: impl Into<String>, send: impl AsRef<str>, timeout: Duration) -> Self {
        Self {
            expect: expect.into(),
            send: format!("{}\n", send.as_ref()),
            timeout,
        }
    }
}

/// Everything a session produced
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Transcript {
    /// All output read, in order
    pub output: String,
    /// Output read after the last step
    pub tail: String,
    /// Steps whose expectation matched
    pub steps_completed: usize,
}

/// Expect/send driver over a byte stream
pub struct Session<S> {
    stream: S,
    cancel: CancellationToken,
    pending: String,
    output: String,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Session<S> {
    pub fn new(stream: S, cancel: CancellationToken) -> Self {
        Self {
            stream,
            cancel,
            pending: String::new(),
            output: String::new(),
        }
    }

    /// Wait until `expected` appears in unread output
    ///
    /// Output up to the end of the match is consumed.
    pub async fn expect(&mut self, step: usize, expected: &str, timeout: Duration) -> Result<(), InteractError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(pos) = self.pending.find(expected) {
                self.pending.drain(..pos + expected.len());
                return Ok(());
            }
            match self.read_until(deadline).await? {
                Some(0) => {
                    return Err(InteractError::ClosedBeforeMatch {
                        step,
                        expected: expected.to_string(),
                    })
                }
                Some(_) => {}
                None => {
                    return Err(InteractError::Timeout {
                        step,
                        expected: expected.to_string(),
                        timeout,
                    })
                }
            }
        }
    }

    pub async fn send(&mut self, text: &str) -> Result<(), InteractError> {
        self.stream
            .write_all(text.as_bytes())
            .await
            .map_err(io_err)?;
        self.stream.flush().await.map_err(io_err)
    }

    /// Read until the stream closes or `timeout` elapses, returning what
    /// was read
    pub async fn drain(&mut self, timeout: Duration) -> Result<String, InteractError> {
        let deadline = Instant::now() + timeout;
        let start = self.output.len();
        while let Some(n) = self.read_until(deadline).await? {
            if n == 0 {
                break;
            }
        }
        self.pending.clear();
        Ok(self.output[start..].to_string())
    }

    /// Full output so far
    pub fn output(&self) -> &str {
        &self.output
    }

    /// One read; `None` when the deadline passes first
    async fn read_until(&mut self, deadline: Instant) -> Result<Option<usize>, InteractError> {
        let mut buf = [0u8; 4096];
        tokio::select! {
            result = tokio::time::timeout_at(deadline, self.stream.read(&mut buf)) => match result {
                Ok(Ok(n)) => {
                    let text = String::from_utf8_lossy(&buf[..n]);
                    self.pending.push_str(&text);
                    self.output.push_str(&text);
                    Ok(Some(n))
                }
                Ok(Err(e)) => Err(io_err(e)),
                Err(_) => Ok(None),
            },
            _ = self.cancel.cancelled() => Err(InteractError::Cancelled),
        }
    }
}

fn io_err(e: std::io::Error) -> InteractError {
    InteractError::Io { error: e.to_string() }
}

/// Run `steps` in order, then read trailing output for up to
/// `final_timeout`
///
/// A failed wait ends the run; no later step is sent.
pub async fn run_script<S: AsyncRead + AsyncWrite + Unpin>(
    stream: S,
    steps: &[InteractionStep],
    final_timeout: Duration,
    cancel: CancellationToken,
) -> Result<Transcript, InteractError> {
    let mut session = Session::new(stream, cancel);
    for (index, step) in steps.iter().enumerate() {
        let step_number = index + 1;
        session.expect(step_number, &step.expect, step.timeout).await?;
        tracing::debug!(step = step_number, expected = %step.expect, "matched, sending");
        session.send(&step.send).await?;
    }
    let tail = session.drain(final_timeout).await?;
    Ok(Transcript {
        output: session.output().to_string(),
        tail,
        steps_completed: steps.len(),
    })
}

/// Decide whether a password change transcript shows success
///
/// Rejections anywhere in the output win over a success phrase.
pub fn classify_password_change(output: &str) -> Result<(), InteractError> {
    let lower = output.to_lowercase();
    if let Some((_, reason)) = REJECTION_PHRASES.iter().find(|(phrase, _)| lower.contains(phrase)) {
        return Err(InteractError::Rejected {
            reason: reason.to_string(),
        });
    }
    if SUCCESS_PHRASES.iter().any(|phrase| lower.contains(phrase)) {
        return Ok(());
    }
    let tail: String = {
        let trimmed = output.trim();
        let skip = trimmed.chars().count().saturating_sub(200);
        trimmed.chars().skip(skip).collect()
    };
    Err(InteractError::Unrecognized { tail })
}

/// Script for the forced first-login password change
///
/// With `login_user` set the script first answers a console login prompt;
/// over ssh the login itself is handled by the client.
pub fn first_boot_script(
    login_user: Option<&str>,
    current: &str,
    new: &str,
    step_timeout: Duration,
) -> Vec<InteractionStep> {
    let mut steps = Vec::new();
    if let Some(user) = login_user {
        steps.push(InteractionStep::line("login:", user, step_timeout));
        steps.push(InteractionStep::line("Password:", current, step_timeout));
    }
    steps.push(InteractionStep::line("Current password:", current, step_timeout));
    steps.push(InteractionStep::line("New password:", new, step_timeout));
    steps.push(InteractionStep::line("Retype new password:", new, step_timeout));
    steps
}

/// Byte stream of an interactive session
pub trait SessionStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> SessionStream for T {}

/// Opens a fresh session to the node
#[async_trait]
pub trait SessionOpener: Send + Sync {
    async fn open(&self) -> Result<Box<dyn SessionStream>, InteractError>;

    /// Human-readable target for logs
    fn target(&self) -> String;
}

#[async_trait]
impl<T: SessionOpener + ?Sized> SessionOpener for std::sync::Arc<T> {
    async fn open(&self) -> Result<Box<dyn SessionStream>, InteractError> {
        (**self).open().await
    }

    fn target(&self) -> String {
        (**self).target()
    }
}

/// An ssh child process used as a session stream
pub struct ChildSession {
    // Held so the process is killed when the session is dropped
    _child: Child,
    stdin: ChildStdin,
    stdout: ChildStdout,
}

impl AsyncRead for ChildSession {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.stdout).poll_read(cx, buf)
    }
}

impl AsyncWrite for ChildSession {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.stdin).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.stdin).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.stdin).poll_shutdown(cx)
    }
}

/// Opens `ssh -tt` login sessions
pub struct SshSessionOpener {
    target: SshTarget,
}

impl SshSessionOpener {
    pub fn new(target: SshTarget) -> Self {
        Self { target }
    }
}

#[async_trait]
impl SessionOpener for SshSessionOpener {
    async fn open(&self) -> Result<Box<dyn SessionStream>, InteractError> {
        let connect_err = |error: String| InteractError::Connect {
            target: self.target.destination(),
            error,
        };
        let mut command = self
            .target
            .command(&self.target.login_argv())
            .map_err(|e| connect_err(e.to_string()))?;
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        let mut child = command.spawn().map_err(|e| connect_err(e.to_string()))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| connect_err("stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| connect_err("stdout unavailable".to_string()))?;
        Ok(Box::new(ChildSession {
            _child: child,
            stdin,
            stdout,
        }))
    }

    fn target(&self) -> String {
        self.target.destination()
    }
}

/// Retry and timing settings for a password change
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PasswordChangeOptions {
    /// Password the image ships with
    pub current: String,
    pub attempts: u32,
    pub retry_delay: Duration,
    pub step_timeout: Duration,
    pub final_timeout: Duration,
}

impl Default for PasswordChangeOptions {
    fn default() -> Self {
        Self {
            current: defaults::DEFAULT_INITIAL_PASSWORD.to_string(),
            attempts: defaults::INTERACT_ATTEMPTS,
            retry_delay: defaults::INTERACT_RETRY_DELAY,
            step_timeout: defaults::INTERACT_STEP_TIMEOUT,
            final_timeout: defaults::INTERACT_FINAL_TIMEOUT,
        }
    }
}

impl From<&PasswordConfig> for PasswordChangeOptions {
    fn from(config: &PasswordConfig) -> Self {
        Self {
            current: config.initial.clone(),
            attempts: config.attempts.max(1),
            retry_delay: Duration::from_secs(config.retry_delay_secs),
            ..Self::default()
        }
    }
}

/// Performs the first-boot password change, reconnecting on transient
/// failures
pub struct PasswordChanger<O> {
    opener: O,
    script: Vec<InteractionStep>,
    options: PasswordChangeOptions,
    cancel: CancellationToken,
}

impl<O: SessionOpener> PasswordChanger<O> {
    pub fn new(opener: O, new: &str, options: PasswordChangeOptions) -> Self {
        let script = first_boot_script(None, &options.current, new, options.step_timeout);
        Self {
            opener,
            script,
            options,
            cancel: CancellationToken::new(),
        }
    }

    /// Replace the default ssh script
    pub fn with_script(mut self, script: Vec<InteractionStep>) -> Self {
        self.script = script;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Run the script, replaying the whole session on transient errors
    ///
    /// Returns the number of attempts used.
    pub async fn change(&self) -> Result<u32, InteractError> {
        let attempts = self.options.attempts.max(1);
        let target = self.opener.target();
        let mut last = String::new();

        for attempt in 1..=attempts {
            tracing::info!(target = %target, attempt, attempts, "changing password");
            let result = match self.opener.open().await {
                Ok(stream) => {
                    run_script(stream, &self.script, self.options.final_timeout, self.cancel.clone())
                        .await
                        .and_then(|transcript| classify_password_change(&transcript.output))
                }
                Err(e) => Err(e),
            };

            match result {
                Ok(()) => {
                    tracing::info!(target = %target, attempt, "password changed");
                    return Ok(attempt);
                }
                Err(e) if e.is_transient() => {
                    tracing::warn!(target = %target, attempt, "password change attempt failed: {}", e);
                    last = e.to_string();
                }
                Err(e) => return Err(e),
            }

            if attempt < attempts {
                tokio::select! {
                    _ = tokio::time::sleep(self.options.retry_delay) => {}
                    _ = self.cancel.cancelled() => return Err(InteractError::Cancelled),
                }
            }
        }

        Err(InteractError::AttemptsExhausted { attempts, last })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_success() {
        assert!(classify_password_change("passwd: password updated successfully\r\n").is_ok());
        assert!(classify_password_change("passwd: all authentication tokens updated successfully.").is_ok());
    }

    #[test]
    fn test_classify_rejections() {
        let err = classify_password_change("BAD PASSWORD: The password is shorter than 8 characters").unwrap_err();
        assert_eq!(
            err,
            InteractError::Rejected {
                reason: "password too short".to_string()
            }
        );
        let err = classify_password_change("Sorry, passwords do not match.").unwrap_err();
        assert!(matches!(err, InteractError::Rejected { reason } if reason == "passwords do not match"));
    }

    #[test]
    fn test_unknown_output_is_failure() {
        assert!(matches!(
            classify_password_change("Connection to 10.0.0.5 closed."),
            Err(InteractError::Unrecognized { .. })
        ));
        assert!(matches!(
            classify_password_change(""),
            Err(InteractError::Unrecognized { .. })
        ));
    }

    #[test]
    fn test_first_boot_script_order() {
        let steps = first_boot_script(None, "ubuntu", "s3cret-pass", Duration::from_secs(5));
        let expects: Vec<&str> = steps.iter().map(|s| s.expect.as_str()).collect();
        assert_eq!(expects, vec!["Current password:", "New password:", "Retype new password:"]);
        assert_eq!(steps[1].send, "s3cret-pass\n");

        let console = first_boot_script(Some("ubuntu"), "ubuntu", "x", Duration::from_secs(5));
        assert_eq!(console[0].expect, "login:");
        assert_eq!(console.len(), 5);
    }

    #[tokio::test]
    async fn test_expect_consumes_through_match() {
        let (client, mut server) = tokio::io::duplex(1024);
        server.write_all(b"Current password: New password:").await.unwrap();
        let mut session = Session::new(client, CancellationToken::new());
        session.expect(1, "Current password:", Duration::from_secs(1)).await.unwrap();
        session.expect(2, "New password:", Duration::from_secs(1)).await.unwrap();
        // The first prompt was consumed and cannot match again
        drop(server);
        let err = session
            .expect(3, "Current password:", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, InteractError::ClosedBeforeMatch { step: 3, .. }));
    }
}
