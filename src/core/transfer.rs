//! Tiered image transfer to the controller
//!
//! An artifact lands at `<base>/<node>/<filename>` on the controller. If a
//! file already exists there the transfer is skipped. Otherwise three
//! strategies are tried in order, each with its own retry budget:
//!
//! 1. direct: `scp` into a temporary file, size-checked and renamed into
//!    place
//! 2. cache relay: `rsync --partial` into `<base>/.cache/<sha256>`, then a
//!    remote copy into place
//! 3. chunked: fixed-size chunks written with `dd seek=` into a temporary
//!    file, size-checked and renamed into place
//!
//! Partial files are removed between attempts and between tiers.

use async_trait::async_trait;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;

use crate::config::{defaults, TransferConfig};
use crate::core::compress::Compression;
use crate::error::{ExecError, TransferError};
use crate::infra::executor::{
    shell_quote, CommandExecutor, CommandOutput, CommandRequest, RemoteShellExecutor,
};

/// Read buffer for hashing local artifacts
const HASH_BUFFER_SIZE: usize = 1024 * 1024;

/// Transfer strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    Direct,
    CacheRelay,
    Chunked,
}

impl Strategy {
    /// Every strategy, in escalation order
    pub const ALL: [Strategy; 3] = [Strategy::Direct, Strategy::CacheRelay, Strategy::Chunked];
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Strategy::Direct => write!(f, "direct"),
            Strategy::CacheRelay => write!(f, "cache-relay"),
            Strategy::Chunked => write!(f, "chunked"),
        }
    }
}

/// Record of one transfer
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransferDescriptor {
    pub local: PathBuf,
    pub remote: String,
    pub node: u32,
    /// Strategy that succeeded; `None` when the remote file already existed
    pub strategy: Option<Strategy>,
    pub size: u64,
    /// Attempts made by the successful tier
    pub attempts: u32,
}

impl TransferDescriptor {
    /// Whether the upload was skipped
    pub fn skipped(&self) -> bool {
        self.strategy.is_none()
    }
}

/// Deterministic remote path of an artifact
pub fn remote_image_path(base: &str, node: u32, filename: &str) -> String {
    format!("{}/{}/{}", base.trim_end_matches('/'), node, filename)
}

/// Remote path of a keyed cache entry
pub fn cache_entry_path(base: &str, key: &str) -> String {
    format!(
        "{}/{}/{}",
        base.trim_end_matches('/'),
        defaults::REMOTE_CACHE_DIR,
        key
    )
}

/// Byte ranges `(offset, len)` covering `size` in `chunk_size` pieces
pub fn chunk_ranges(size: u64, chunk_size: u64) -> Vec<(u64, u64)> {
    let chunk_size = chunk_size.max(1);
    let mut ranges = Vec::new();
    let mut offset = 0;
    while offset < size {
        let len = chunk_size.min(size - offset);
        ranges.push((offset, len));
        offset += len;
    }
    ranges
}

/// `dd` block size for a chunk size: the default block when it divides the
/// chunk, otherwise the largest common divisor so `seek=` stays exact
pub fn dd_block_size(chunk_size: u64) -> u64 {
    let (mut a, mut b) = (chunk_size.max(1), defaults::CHUNK_BLOCK_SIZE);
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a
}

fn parent_of(remote: &str) -> &str {
    match remote.rfind('/') {
        Some(0) => "/",
        Some(i) => &remote[..i],
        None => ".",
    }
}

/// SHA-256 of a local file, hex encoded
pub async fn sha256_file(path: &Path) -> Result<String, TransferError> {
    let local_err = |e: std::io::Error| TransferError::Local {
        path: path.to_path_buf(),
        error: e.to_string(),
    };
    let mut file = tokio::fs::File::open(path).await.map_err(local_err)?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; HASH_BUFFER_SIZE];
    loop {
        let n = file.read(&mut buffer).await.map_err(local_err)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Moves bytes to the controller
#[async_trait]
pub trait RemoteTransport: Send + Sync {
    /// Copy a local file to `remote` in one shot
    async fn upload(&self, local: &Path, remote: &str) -> Result<(), ExecError>;

    /// Push a local file to `remote`, keeping partial data on interruption
    async fn push_resumable(&self, local: &Path, remote: &str) -> Result<(), ExecError>;

    /// Run a command on the controller
    async fn exec(&self, request: CommandRequest) -> Result<CommandOutput, ExecError>;
}

#[async_trait]
impl<T: RemoteTransport + ?Sized> RemoteTransport for std::sync::Arc<T> {
    async fn upload(&self, local: &Path, remote: &str) -> Result<(), ExecError> {
        (**self).upload(local, remote).await
    }

    async fn push_resumable(&self, local: &Path, remote: &str) -> Result<(), ExecError> {
        (**self).push_resumable(local, remote).await
    }

    async fn exec(&self, request: CommandRequest) -> Result<CommandOutput, ExecError> {
        (**self).exec(request).await
    }
}

#[async_trait]
impl RemoteTransport for RemoteShellExecutor {
    async fn upload(&self, local: &Path, remote: &str) -> Result<(), ExecError> {
        self.run_local_tool(self.target().scp_argv(local, remote), None)
            .await
            .map(|_| ())
    }

    async fn push_resumable(&self, local: &Path, remote: &str) -> Result<(), ExecError> {
        self.run_local_tool(self.target().rsync_argv(local, remote), None)
            .await
            .map(|_| ())
    }

    async fn exec(&self, request: CommandRequest) -> Result<CommandOutput, ExecError> {
        self.execute(request).await
    }
}

/// Retry and chunking settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferOptions {
    /// Attempts per tier
    pub attempts: u32,
    /// Delay between attempts
    pub retry_delay: Duration,
    /// Chunk size for the chunked tier
    pub chunk_size: u64,
    /// Tiers to try, in order
    pub strategies: Vec<Strategy>,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            attempts: defaults::TRANSFER_ATTEMPTS,
            retry_delay: defaults::TRANSFER_RETRY_DELAY,
            chunk_size: defaults::TRANSFER_CHUNK_SIZE,
            strategies: Strategy::ALL.to_vec(),
        }
    }
}

impl From<&TransferConfig> for TransferOptions {
    fn from(config: &TransferConfig) -> Self {
        Self {
            attempts: config.attempts.max(1),
            retry_delay: Duration::from_secs(config.retry_delay_secs),
            chunk_size: config.chunk_size_mib.max(1) * 1024 * 1024,
            strategies: Strategy::ALL.to_vec(),
        }
    }
}

/// Outcome of a single tier attempt
enum AttemptError {
    Cancelled,
    Failed(String),
}

impl From<ExecError> for AttemptError {
    fn from(e: ExecError) -> Self {
        if e.is_cancelled() {
            AttemptError::Cancelled
        } else {
            AttemptError::Failed(e.to_string())
        }
    }
}

impl From<TransferError> for AttemptError {
    fn from(e: TransferError) -> Self {
        match e {
            TransferError::Cancelled { .. } => AttemptError::Cancelled,
            other => AttemptError::Failed(other.to_string()),
        }
    }
}

/// Tiered transfer engine
pub struct ImageTransfer<T> {
    transport: T,
    base: String,
    options: TransferOptions,
    cancel: CancellationToken,
}

impl<T: RemoteTransport> ImageTransfer<T> {
    /// Create a transfer engine rooted at `base` on the controller
    pub fn new(transport: T, base: impl Into<String>, options: TransferOptions) -> Self {
        Self {
            transport,
            base: base.into(),
            options,
            cancel: CancellationToken::new(),
        }
    }

    /// Observe a run's cancellation token between attempts
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Remote base directory
    pub fn base(&self) -> &str {
        &self.base
    }

    /// Ship `local` to the controller for `node`
    pub async fn transfer(&self, local: &Path, node: u32) -> Result<TransferDescriptor, TransferError> {
        let size = tokio::fs::metadata(local)
            .await
            .map_err(|e| TransferError::Local {
                path: local.to_path_buf(),
                error: e.to_string(),
            })?
            .len();
        let filename = local
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| TransferError::Local {
                path: local.to_path_buf(),
                error: "path has no file name".to_string(),
            })?;
        let remote = remote_image_path(&self.base, node, &filename);

        if self.remote_exists(&remote).await? {
            tracing::info!(node, remote = %remote, "remote image already present, skipping transfer");
            return Ok(TransferDescriptor {
                local: local.to_path_buf(),
                remote,
                node,
                strategy: None,
                size,
                attempts: 0,
            });
        }

        self.remote_check(
            "create remote directory",
            &remote,
            CommandRequest::new(["mkdir", "-p", parent_of(&remote)]),
        )
        .await?;

        let mut errors = Vec::new();
        for &strategy in &self.options.strategies {
            if self.cancel.is_cancelled() {
                return Err(TransferError::Cancelled { remote });
            }
            tracing::info!(node, remote = %remote, strategy = %strategy, bytes = size, "starting transfer tier");
            match self.run_tier(strategy, local, &remote, size, node).await {
                Ok(attempts) => {
                    tracing::info!(node, remote = %remote, strategy = %strategy, attempts, "transfer complete");
                    return Ok(TransferDescriptor {
                        local: local.to_path_buf(),
                        remote,
                        node,
                        strategy: Some(strategy),
                        size,
                        attempts,
                    });
                }
                Err(TransferError::Cancelled { .. }) => {
                    self.cleanup(&[remote.clone(), direct_temp(&remote), chunked_temp(&remote)])
                        .await;
                    return Err(TransferError::Cancelled { remote });
                }
                Err(e) => {
                    tracing::warn!(node, remote = %remote, strategy = %strategy, "transfer tier failed: {}", e);
                    errors.push(e.to_string());
                    self.cleanup(&[
                        remote.clone(),
                        direct_temp(&remote),
                        relay_temp(&remote),
                        chunked_temp(&remote),
                    ])
                    .await;
                }
            }
        }

        Err(TransferError::Exhausted { node, remote, errors })
    }

    /// Make the uncompressed sibling of a transferred `.xz` artifact
    /// available on the controller and return the path to flash
    pub async fn prepare_flash_image(&self, remote: &str) -> Result<String, TransferError> {
        let compression = Compression::detect(Path::new(remote));
        if compression != Compression::Xz {
            return Ok(remote.to_string());
        }
        let target = compression.strip_suffix(remote);
        if self.remote_exists(&target).await? {
            tracing::debug!(remote = %target, "uncompressed image already present");
            return Ok(target);
        }

        tracing::info!(remote = %remote, target = %target, "decompressing image on controller");
        let script = format!(
            "xz -dc {src} > {tmp} && mv -f {tmp} {dst} || {{ rm -f {tmp}; exit 1; }}",
            src = shell_quote(remote),
            tmp = shell_quote(&format!("{target}.partial")),
            dst = shell_quote(&target),
        );
        self.remote_check(
            "remote decompress",
            remote,
            CommandRequest::shell(script).with_timeout(defaults::REMOTE_DECOMPRESS_TIMEOUT),
        )
        .await?;
        Ok(target)
    }

    async fn run_tier(
        &self,
        strategy: Strategy,
        local: &Path,
        remote: &str,
        size: u64,
        node: u32,
    ) -> Result<u32, TransferError> {
        let key = match strategy {
            Strategy::CacheRelay => Some(sha256_file(local).await?),
            _ => None,
        };

        let attempts = self.options.attempts.max(1);
        let mut last_error = String::new();
        for attempt in 1..=attempts {
            let result = match strategy {
                Strategy::Direct => self.attempt_direct(local, remote, size, node).await,
                Strategy::CacheRelay => {
                    let key = key.as_deref().unwrap_or_default();
                    self.attempt_cache_relay(local, remote, key, size, node).await
                }
                Strategy::Chunked => self.attempt_chunked(local, remote, size, node).await,
            };
            match result {
                Ok(()) => return Ok(attempt),
                Err(AttemptError::Cancelled) => {
                    return Err(TransferError::Cancelled {
                        remote: remote.to_string(),
                    })
                }
                Err(AttemptError::Failed(error)) => {
                    tracing::warn!(node, remote = %remote, strategy = %strategy, attempt, attempts, "transfer attempt failed: {}", error);
                    last_error = error;
                }
            }
            if attempt < attempts {
                self.pause(remote).await?;
            }
        }

        Err(TransferError::TierFailed {
            strategy: strategy.to_string(),
            remote: remote.to_string(),
            attempts,
            error: last_error,
        })
    }

    async fn attempt_direct(
        &self,
        local: &Path,
        remote: &str,
        size: u64,
        node: u32,
    ) -> Result<(), AttemptError> {
        let tmp = direct_temp(remote);
        self.remove(&tmp).await?;
        self.transport.upload(local, &tmp).await?;
        self.verify_size(&tmp, size, node).await?;
        self.exec_checked(CommandRequest::new(["mv", "-f", tmp.as_str(), remote]))
            .await?;
        self.verify_size(remote, size, node).await?;
        Ok(())
    }

    async fn attempt_cache_relay(
        &self,
        local: &Path,
        remote: &str,
        key: &str,
        size: u64,
        node: u32,
    ) -> Result<(), AttemptError> {
        let entry = cache_entry_path(&self.base, key);
        self.exec_checked(CommandRequest::new(["mkdir", "-p", parent_of(&entry)]))
            .await?;

        match self.remote_size(&entry).await? {
            Some(existing) if existing == size => {
                tracing::debug!(entry = %entry, "cache entry complete, reusing");
            }
            existing => {
                if let Some(partial) = existing {
                    tracing::warn!(entry = %entry, bytes = partial, expected = size, "removing incomplete cache entry");
                    self.remove(&entry).await?;
                }
                self.transport.push_resumable(local, &entry).await?;
                self.verify_size(&entry, size, node).await?;
            }
        }

        let tmp = relay_temp(remote);
        let script = format!(
            "cp {entry} {tmp} && mv -f {tmp} {dst} || {{ rm -f {tmp}; exit 1; }}",
            entry = shell_quote(&entry),
            tmp = shell_quote(&tmp),
            dst = shell_quote(remote),
        );
        self.exec_checked(CommandRequest::shell(script).with_timeout(defaults::REMOTE_COPY_TIMEOUT))
            .await?;
        self.verify_size(remote, size, node).await?;
        Ok(())
    }

    async fn attempt_chunked(
        &self,
        local: &Path,
        remote: &str,
        size: u64,
        node: u32,
    ) -> Result<(), AttemptError> {
        let tmp = chunked_temp(remote);
        self.exec_checked(CommandRequest::shell(format!(": > {}", shell_quote(&tmp))))
            .await?;

        let block = dd_block_size(self.options.chunk_size);
        let ranges = chunk_ranges(size, self.options.chunk_size);
        let total = ranges.len();
        let mut file = tokio::fs::File::open(local).await.map_err(|e| {
            AttemptError::Failed(format!("open {}: {}", local.display(), e))
        })?;

        for (index, (offset, len)) in ranges.into_iter().enumerate() {
            if self.cancel.is_cancelled() {
                return Err(AttemptError::Cancelled);
            }
            let mut chunk = vec![0u8; len as usize];
            file.read_exact(&mut chunk).await.map_err(|e| {
                AttemptError::Failed(format!("read {} at {}: {}", local.display(), offset, e))
            })?;

            let script = format!(
                "dd of={tmp} bs={block} seek={seek} conv=notrunc",
                tmp = shell_quote(&tmp),
                seek = offset / block,
            );
            tracing::debug!(node, remote = %tmp, chunk = index + 1, chunks = total, offset, bytes = len, "writing chunk");
            self.exec_checked(
                CommandRequest::shell(script)
                    .with_stdin(chunk)
                    .with_timeout(defaults::CHUNK_WRITE_TIMEOUT),
            )
            .await?;
        }

        self.verify_size(&tmp, size, node).await?;
        self.exec_checked(CommandRequest::new(["mv", "-f", tmp.as_str(), remote]))
            .await?;
        self.verify_size(remote, size, node).await?;
        Ok(())
    }

    /// Whether a file exists on the controller
    pub async fn remote_exists(&self, remote: &str) -> Result<bool, TransferError> {
        self.transport
            .exec(CommandRequest::new(["test", "-f", remote]))
            .await
            .map(|out| out.success())
            .map_err(|e| self.remote_err("check remote file", remote, e))
    }

    /// Size of a remote file, `None` if it does not exist
    async fn remote_size(&self, remote: &str) -> Result<Option<u64>, AttemptError> {
        let output = self
            .transport
            .exec(CommandRequest::new(["stat", "-c", "%s", remote]))
            .await?;
        if !output.success() {
            return Ok(None);
        }
        output
            .stdout
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| AttemptError::Failed(format!("unexpected stat output for {remote}: {}", output.stdout.trim())))
    }

    async fn verify_size(&self, remote: &str, expected: u64, node: u32) -> Result<(), AttemptError> {
        let actual = self.remote_size(remote).await?.unwrap_or(0);
        if actual != expected {
            return Err(TransferError::SizeMismatch {
                node,
                remote: remote.to_string(),
                local_size: expected,
                remote_size: actual,
            }
            .into());
        }
        Ok(())
    }

    async fn remove(&self, remote: &str) -> Result<(), AttemptError> {
        self.exec_checked(CommandRequest::new(["rm", "-f", remote])).await
    }

    async fn exec_checked(&self, request: CommandRequest) -> Result<(), AttemptError> {
        let command_line = request.display();
        self.transport.exec(request).await?.into_result(&command_line)?;
        Ok(())
    }

    async fn remote_check(
        &self,
        operation: &str,
        remote: &str,
        request: CommandRequest,
    ) -> Result<(), TransferError> {
        let command_line = request.display();
        self.transport
            .exec(request)
            .await
            .and_then(|out| out.into_result(&command_line))
            .map(|_| ())
            .map_err(|e| self.remote_err(operation, remote, e))
    }

    fn remote_err(&self, operation: &str, remote: &str, source: ExecError) -> TransferError {
        if source.is_cancelled() {
            TransferError::Cancelled {
                remote: remote.to_string(),
            }
        } else {
            TransferError::Remote {
                operation: operation.to_string(),
                remote: remote.to_string(),
                source,
            }
        }
    }

    async fn cleanup(&self, paths: &[String]) {
        let mut argv = vec!["rm".to_string(), "-f".to_string()];
        argv.extend(paths.iter().cloned());
        let request = CommandRequest::new(argv).uncancellable();
        if let Err(e) = self.transport.exec(request).await {
            tracing::warn!(paths = ?paths, "failed to remove partial transfer files: {}", e);
        }
    }

    async fn pause(&self, remote: &str) -> Result<(), TransferError> {
        tokio::select! {
            _ = tokio::time::sleep(self.options.retry_delay) => Ok(()),
            _ = self.cancel.cancelled() => Err(TransferError::Cancelled { remote: remote.to_string() }),
        }
    }
}

fn direct_temp(remote: &str) -> String {
    format!("{remote}.direct.partial")
}

fn relay_temp(remote: &str) -> String {
    format!("{remote}.relay.partial")
}

fn chunked_temp(remote: &str) -> String {
    format!("{remote}.chunked.partial")
}
