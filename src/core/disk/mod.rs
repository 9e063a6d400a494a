//! Disk image engine
//!
//! Maps an image's partitions to block devices, mounts them, formats and
//! resizes filesystems, and moves file content in and out of the mounted
//! guest. Every operation runs through a [`CommandExecutor`], never through
//! host filesystem calls, so the same engine works natively and inside the
//! sandbox container.
//!
//! - [`mapping`] - partition mapping with verified, escalating unmap
//! - [`mount`] - idempotent mount and fallback unmount
//! - [`filesystem`] - format and resize
//! - [`files`] - atomic file I/O and directory listings
//! - [`session`] - scoped map + mount with guaranteed release

pub mod files;
pub mod filesystem;
pub mod mapping;
pub mod mount;
pub mod session;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::defaults;
use crate::error::{DiskError, ExecError};
use crate::infra::executor::{CommandExecutor, CommandOutput, CommandRequest};

pub use files::FileEntry;
pub use filesystem::Filesystem;
pub use mapping::{select_root_partition, PartitionMapping, UnmapEscalation, UnmapReport};
pub use mount::MountOutcome;
pub use session::{with_mounted_image, MountedImage};

/// Polling budget for a mapped device to appear
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceWait {
    /// Number of checks
    pub attempts: u32,
    /// Delay between checks
    pub interval: Duration,
}

impl Default for DeviceWait {
    fn default() -> Self {
        Self {
            attempts: defaults::DEVICE_WAIT_ATTEMPTS,
            interval: defaults::DEVICE_WAIT_INTERVAL,
        }
    }
}

/// Disk image engine over a command executor
pub struct DiskEngine<E> {
    exec: E,
    cancel: CancellationToken,
    device_wait: DeviceWait,
    mappings: Mutex<HashMap<PathBuf, PartitionMapping>>,
    mounts: Mutex<HashMap<PathBuf, PathBuf>>,
    tmp_counter: AtomicU64,
}

impl<E: CommandExecutor> DiskEngine<E> {
    /// Create an engine
    pub fn new(exec: E) -> Self {
        Self {
            exec,
            cancel: CancellationToken::new(),
            device_wait: DeviceWait::default(),
            mappings: Mutex::new(HashMap::new()),
            mounts: Mutex::new(HashMap::new()),
            tmp_counter: AtomicU64::new(0),
        }
    }

    /// Observe a run's cancellation token while sleeping between polls
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Override the device polling budget
    pub fn with_device_wait(mut self, device_wait: DeviceWait) -> Self {
        self.device_wait = device_wait;
        self
    }

    /// The underlying executor
    pub fn executor(&self) -> &E {
        &self.exec
    }

    /// Active mapping for an image, if this engine created one
    pub fn mapping(&self, image: &Path) -> Option<PartitionMapping> {
        lock(&self.mappings).get(image).cloned()
    }

    /// Mount point this engine mounted `device` at, if any
    pub fn mount_point_of(&self, device: &Path) -> Option<PathBuf> {
        lock(&self.mounts).get(device).cloned()
    }

    /// Run a checked command, wrapping failures with the operation name
    async fn run_op(&self, operation: &str, request: CommandRequest) -> Result<CommandOutput, DiskError> {
        self.exec
            .check(request)
            .await
            .map_err(|e| DiskError::command(operation, e))
    }

    /// Run a command for its exit status only
    async fn probe_op(&self, operation: &str, request: CommandRequest) -> Result<bool, DiskError> {
        self.exec
            .execute(request)
            .await
            .map(|out| out.success())
            .map_err(|e| DiskError::command(operation, e))
    }

    /// Sleep, returning early with an error if the run is cancelled
    async fn pause(&self, operation: &str, duration: Duration) -> Result<(), DiskError> {
        tokio::select! {
            _ = tokio::time::sleep(duration) => Ok(()),
            _ = self.cancel.cancelled() => Err(DiskError::command(
                operation,
                ExecError::Cancelled { command: format!("sleep {duration:?}") },
            )),
        }
    }

    /// Unique temporary sibling path for atomic writes
    fn temp_sibling(&self, path: &Path) -> PathBuf {
        let n = self.tmp_counter.fetch_add(1, Ordering::SeqCst);
        let mut tmp = path.as_os_str().to_owned();
        tmp.push(format!(".nodeprov-tmp-{}-{}", std::process::id(), n));
        PathBuf::from(tmp)
    }
}

/// Lock a bookkeeping map; the maps hold plain data, so a poisoned lock is
/// still usable
fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Path as an owned string argument
fn arg(path: &Path) -> String {
    path.display().to_string()
}
