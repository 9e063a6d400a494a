//! Common test utilities and helpers
//!
//! Scripted stand-ins for the executor, controller, transport and session
//! seams, plus a temporary workspace.

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;

use nodeprov::core::controller::{Controller, PowerState};
use nodeprov::core::interactive::{SessionOpener, SessionStream};
use nodeprov::core::transfer::RemoteTransport;
use nodeprov::error::{ControllerError, ExecError, InteractError};
use nodeprov::infra::executor::{Backend, CommandExecutor, CommandOutput, CommandRequest, NativeExecutor};

/// Temporary directory for a test run
pub struct TestWorkspace {
    pub dir: TempDir,
}

impl TestWorkspace {
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().expect("Failed to create temp directory"),
        }
    }

    pub fn path(&self) -> PathBuf {
        self.dir.path().to_path_buf()
    }

    /// Create a file, including parent directories
    pub fn create_file(&self, name: &str, content: impl AsRef<[u8]>) -> PathBuf {
        let path = self.dir.path().join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("Failed to create parent directories");
        }
        std::fs::write(&path, content).expect("Failed to write file");
        path
    }

    pub fn create_dir(&self, name: &str) -> PathBuf {
        let path = self.dir.path().join(name);
        std::fs::create_dir_all(&path).expect("Failed to create directory");
        path
    }

    pub fn file_exists(&self, name: &str) -> bool {
        self.dir.path().join(name).exists()
    }

    pub fn read_file(&self, name: &str) -> String {
        std::fs::read_to_string(self.dir.path().join(name)).expect("Failed to read file")
    }
}

impl Default for TestWorkspace {
    fn default() -> Self {
        Self::new()
    }
}

/// Deterministic image content of `len` bytes
pub fn pattern_bytes(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

struct Rule {
    prefix: String,
    outputs: VecDeque<CommandOutput>,
}

/// Executor answering commands from prefix rules
///
/// The first rule whose prefix matches the command line answers it. A rule
/// with several outputs hands them out in order and repeats the last one.
/// Unmatched commands succeed with empty output, or run natively when a
/// fallback is configured.
pub struct ScriptedExecutor {
    rules: Mutex<Vec<Rule>>,
    log: Mutex<Vec<String>>,
    fallback: Option<NativeExecutor>,
    releases: AtomicUsize,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self {
            rules: Mutex::new(Vec::new()),
            log: Mutex::new(Vec::new()),
            fallback: None,
            releases: AtomicUsize::new(0),
        }
    }

    /// Run unmatched commands on the host
    pub fn with_native_fallback(mut self) -> Self {
        self.fallback = Some(NativeExecutor::new(CancellationToken::new()));
        self
    }

    pub fn on(self, prefix: &str, output: CommandOutput) -> Self {
        self.on_seq(prefix, vec![output])
    }

    pub fn on_seq(self, prefix: &str, outputs: Vec<CommandOutput>) -> Self {
        self.rules.lock().unwrap().push(Rule {
            prefix: prefix.to_string(),
            outputs: outputs.into(),
        });
        self
    }

    /// Every command line run so far, in order
    pub fn commands(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    /// Number of commands starting with `prefix`
    pub fn count(&self, prefix: &str) -> usize {
        self.commands().iter().filter(|c| c.starts_with(prefix)).count()
    }

    pub fn ran(&self, prefix: &str) -> bool {
        self.count(prefix) > 0
    }

    /// Index of the first command starting with `prefix`
    pub fn position(&self, prefix: &str) -> Option<usize> {
        self.commands().iter().position(|c| c.starts_with(prefix))
    }

    pub fn releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }

    fn scripted(&self, line: &str) -> Option<CommandOutput> {
        let mut rules = self.rules.lock().unwrap();
        let rule = rules.iter_mut().find(|r| line.starts_with(&r.prefix))?;
        if rule.outputs.len() > 1 {
            rule.outputs.pop_front()
        } else {
            rule.outputs.front().cloned()
        }
    }
}

impl Default for ScriptedExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CommandExecutor for ScriptedExecutor {
    async fn execute(&self, request: CommandRequest) -> Result<CommandOutput, ExecError> {
        let line = request.display();
        self.log.lock().unwrap().push(line.clone());
        if let Some(output) = self.scripted(&line) {
            return Ok(output);
        }
        match &self.fallback {
            Some(native) => native.execute(request).await,
            None => Ok(CommandOutput::ok("")),
        }
    }

    fn backend(&self) -> Backend {
        Backend::Native
    }

    async fn release(&self) -> Result<(), ExecError> {
        self.releases.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// A mapping as `losetup -j` reports it
pub fn losetup_line(loop_device: &str, image: &Path) -> CommandOutput {
    CommandOutput::ok(format!("{loop_device}: [2049]:131 ({})\n", image.display()))
}

/// `kpartx -av` output for a two-partition image on loop0
pub fn kpartx_two_partitions() -> CommandOutput {
    CommandOutput::ok(
        "add map loop0p1 (253:0): 0 524288 linear 7:0 8192\n\
add map loop0p2 (253:1): 0 3670016 linear 7:0 532480\n",
    )
}

/// Controller whose power state follows the commands sent to it
pub struct FakeController {
    power: Mutex<PowerState>,
    console: Mutex<VecDeque<Result<String, ControllerError>>>,
    calls: Mutex<Vec<String>>,
    ignore_power_off: AtomicBool,
    ignore_power_on: AtomicBool,
    flash_delay: Mutex<Duration>,
    flash_failure: Mutex<Option<String>>,
}

impl FakeController {
    pub fn new(initial: PowerState) -> Self {
        Self {
            power: Mutex::new(initial),
            console: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
            ignore_power_off: AtomicBool::new(false),
            ignore_power_on: AtomicBool::new(false),
            flash_delay: Mutex::new(Duration::ZERO),
            flash_failure: Mutex::new(None),
        }
    }

    /// Console reads return these chunks in order, then empty output
    pub fn with_console<I, S>(self, chunks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.console
            .lock()
            .unwrap()
            .extend(chunks.into_iter().map(|c| Ok(c.into())));
        self
    }

    /// Queue a failed console read
    pub fn with_console_error(self, error: ControllerError) -> Self {
        self.console.lock().unwrap().push_back(Err(error));
        self
    }

    /// Power-off commands succeed but the node stays on
    pub fn stuck_on(self) -> Self {
        self.ignore_power_off.store(true, Ordering::SeqCst);
        self
    }

    /// Power-on commands succeed but the node stays off
    pub fn stuck_off(self) -> Self {
        self.ignore_power_on.store(true, Ordering::SeqCst);
        self
    }

    pub fn with_flash_delay(self, delay: Duration) -> Self {
        *self.flash_delay.lock().unwrap() = delay;
        self
    }

    pub fn with_flash_failure(self, stderr: &str) -> Self {
        *self.flash_failure.lock().unwrap() = Some(stderr.to_string());
        self
    }

    /// Calls other than power status checks, in order
    pub fn actions(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.as_str() != "power_status")
            .cloned()
            .collect()
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn power(&self) -> PowerState {
        *self.power.lock().unwrap()
    }

    fn record(&self, call: impl Into<String>) {
        self.calls.lock().unwrap().push(call.into());
    }
}

/// A transient controller failure
pub fn connection_reset(node: u32) -> ControllerError {
    ControllerError::Command {
        operation: "uart get".to_string(),
        node,
        source: ExecError::Failed {
            command: "tpi uart get".to_string(),
            status: Some(255),
            stdout: String::new(),
            stderr: "Connection reset by peer".to_string(),
        },
    }
}

#[async_trait]
impl Controller for FakeController {
    async fn power_status(&self, _node: u32) -> Result<PowerState, ControllerError> {
        self.record("power_status");
        Ok(self.power())
    }

    async fn power_on(&self, _node: u32) -> Result<(), ControllerError> {
        self.record("power_on");
        if !self.ignore_power_on.load(Ordering::SeqCst) {
            *self.power.lock().unwrap() = PowerState::On;
        }
        Ok(())
    }

    async fn power_off(&self, _node: u32) -> Result<(), ControllerError> {
        self.record("power_off");
        if !self.ignore_power_off.load(Ordering::SeqCst) {
            *self.power.lock().unwrap() = PowerState::Off;
        }
        Ok(())
    }

    async fn flash(&self, node: u32, remote_path: &str) -> Result<(), ControllerError> {
        self.record(format!("flash:{remote_path}"));
        let delay = *self.flash_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let failure = self.flash_failure.lock().unwrap().clone();
        match failure {
            Some(stderr) => Err(ControllerError::Command {
                operation: "flash".to_string(),
                node,
                source: ExecError::Failed {
                    command: format!("tpi flash --node {node} --image-path {remote_path}"),
                    status: Some(1),
                    stdout: String::new(),
                    stderr,
                },
            }),
            None => Ok(()),
        }
    }

    async fn set_normal_mode(&self, _node: u32) -> Result<(), ControllerError> {
        self.record("set_normal_mode");
        Ok(())
    }

    async fn set_mass_storage_mode(&self, _node: u32) -> Result<(), ControllerError> {
        self.record("set_mass_storage_mode");
        Ok(())
    }

    async fn read_console(&self, _node: u32) -> Result<String, ControllerError> {
        self.record("read_console");
        self.console
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(String::new()))
    }

    async fn exec(&self, _node: u32, argv: Vec<String>) -> Result<CommandOutput, ControllerError> {
        self.record(format!("exec:{}", argv.join(" ")));
        Ok(CommandOutput::ok(""))
    }
}

/// Controller storage emulated by a local directory
///
/// Remote paths are plain local paths; commands run on the host.
pub struct LocalTransport {
    native: NativeExecutor,
    upload_failures: AtomicU32,
    truncate_uploads: AtomicBool,
    interrupt_uploads: AtomicBool,
    uploads: AtomicU32,
    pushes: AtomicU32,
    upload_targets: Mutex<Vec<String>>,
}

impl LocalTransport {
    pub fn new() -> Self {
        Self {
            native: NativeExecutor::new(CancellationToken::new()),
            upload_failures: AtomicU32::new(0),
            truncate_uploads: AtomicBool::new(false),
            interrupt_uploads: AtomicBool::new(false),
            uploads: AtomicU32::new(0),
            pushes: AtomicU32::new(0),
            upload_targets: Mutex::new(Vec::new()),
        }
    }

    /// The next `count` direct uploads fail with a connection reset
    pub fn failing_uploads(self, count: u32) -> Self {
        self.upload_failures.store(count, Ordering::SeqCst);
        self
    }

    /// Direct uploads write only half the file
    pub fn truncating_uploads(self) -> Self {
        self.truncate_uploads.store(true, Ordering::SeqCst);
        self
    }

    /// Direct uploads write half the file, then drop the connection
    pub fn interrupting_uploads(self) -> Self {
        self.interrupt_uploads.store(true, Ordering::SeqCst);
        self
    }

    /// Remote paths direct uploads wrote to, in order
    pub fn upload_targets(&self) -> Vec<String> {
        self.upload_targets.lock().unwrap().clone()
    }

    pub fn uploads(&self) -> u32 {
        self.uploads.load(Ordering::SeqCst)
    }

    pub fn pushes(&self) -> u32 {
        self.pushes.load(Ordering::SeqCst)
    }

    async fn copy(local: &Path, remote: &str) -> Result<(), ExecError> {
        let io_err = |e: std::io::Error| ExecError::Io {
            command: format!("copy {} {remote}", local.display()),
            error: e.to_string(),
        };
        if let Some(parent) = Path::new(remote).parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
        }
        tokio::fs::copy(local, remote).await.map_err(io_err)?;
        Ok(())
    }
}

impl Default for LocalTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteTransport for LocalTransport {
    async fn upload(&self, local: &Path, remote: &str) -> Result<(), ExecError> {
        self.uploads.fetch_add(1, Ordering::SeqCst);
        self.upload_targets.lock().unwrap().push(remote.to_string());
        let remaining = self.upload_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.upload_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(ExecError::Failed {
                command: format!("scp {} {remote}", local.display()),
                status: Some(1),
                stdout: String::new(),
                stderr: "Connection reset by peer".to_string(),
            });
        }
        let interrupt = self.interrupt_uploads.load(Ordering::SeqCst);
        if interrupt || self.truncate_uploads.load(Ordering::SeqCst) {
            let bytes = tokio::fs::read(local).await.map_err(|e| ExecError::Io {
                command: "read".to_string(),
                error: e.to_string(),
            })?;
            tokio::fs::write(remote, &bytes[..bytes.len() / 2])
                .await
                .map_err(|e| ExecError::Io {
                    command: "write".to_string(),
                    error: e.to_string(),
                })?;
            if interrupt {
                return Err(ExecError::Failed {
                    command: format!("scp {} {remote}", local.display()),
                    status: Some(1),
                    stdout: String::new(),
                    stderr: "lost connection".to_string(),
                });
            }
            return Ok(());
        }
        Self::copy(local, remote).await
    }

    async fn push_resumable(&self, local: &Path, remote: &str) -> Result<(), ExecError> {
        self.pushes.fetch_add(1, Ordering::SeqCst);
        Self::copy(local, remote).await
    }

    async fn exec(&self, request: CommandRequest) -> Result<CommandOutput, ExecError> {
        self.native.execute(request).await
    }
}

/// Prompts `passwd` shows during a forced first-login change
pub const PASSWD_PROMPTS: [&str; 3] = [
    "WARNING: Your password has expired.\nYou must change your password now and login again!\nChanging password for ubuntu.\nCurrent password: ",
    "New password: ",
    "Retype new password: ",
];

/// Session opener backed by in-memory pipes
///
/// Each session plays the prompts in order, waiting for one line of input
/// after each, then writes the closing text and hangs up.
pub struct FakeOpener {
    prompts: Vec<String>,
    closing: String,
    connect_failures: AtomicU32,
    opened: AtomicU32,
    received: Arc<Mutex<Vec<String>>>,
}

impl FakeOpener {
    pub fn new<I, S>(prompts: I, closing: &str) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            prompts: prompts.into_iter().map(Into::into).collect(),
            closing: closing.to_string(),
            connect_failures: AtomicU32::new(0),
            opened: AtomicU32::new(0),
            received: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// A node whose `passwd` ends with `closing`
    pub fn passwd(closing: &str) -> Self {
        Self::new(PASSWD_PROMPTS, closing)
    }

    /// The first `count` connections are refused
    pub fn refusing(self, count: u32) -> Self {
        self.connect_failures.store(count, Ordering::SeqCst);
        self
    }

    /// Sessions successfully opened
    pub fn opened(&self) -> u32 {
        self.opened.load(Ordering::SeqCst)
    }

    /// Lines the client sent, across all sessions
    pub fn received(&self) -> Vec<String> {
        self.received.lock().unwrap().clone()
    }
}

#[async_trait]
impl SessionOpener for FakeOpener {
    async fn open(&self) -> Result<Box<dyn SessionStream>, InteractError> {
        let remaining = self.connect_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.connect_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(InteractError::Connect {
                target: self.target(),
                error: "Connection refused".to_string(),
            });
        }
        self.opened.fetch_add(1, Ordering::SeqCst);

        let (client, server) = tokio::io::duplex(4096);
        let prompts = self.prompts.clone();
        let closing = self.closing.clone();
        let received = self.received.clone();
        tokio::spawn(async move {
            let (read_half, mut write_half) = tokio::io::split(server);
            let mut reader = BufReader::new(read_half);
            for prompt in prompts {
                if write_half.write_all(prompt.as_bytes()).await.is_err() {
                    return;
                }
                let mut line = String::new();
                match reader.read_line(&mut line).await {
                    Ok(0) | Err(_) => return,
                    Ok(_) => received.lock().unwrap().push(line.trim_end().to_string()),
                }
            }
            let _ = write_half.write_all(closing.as_bytes()).await;
            let _ = write_half.shutdown().await;
        });
        Ok(Box::new(client))
    }

    fn target(&self) -> String {
        "ubuntu@192.168.1.101".to_string()
    }
}
