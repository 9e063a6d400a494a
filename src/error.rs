//! Error types for nodeprov
//!
//! Domain-specific error types using thiserror. Each stage has its own enum;
//! [`ProvisionError`] wraps them for the pipeline.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Command execution errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExecError {
    /// Command line was empty
    #[error("Empty command line")]
    EmptyCommand,

    /// Process could not be spawned
    #[error("Failed to spawn '{command}': {error}")]
    Spawn { command: String, error: String },

    /// Process exited with a non-zero status
    #[error("Command '{command}' failed with status {status:?}: {stderr}")]
    Failed {
        command: String,
        status: Option<i32>,
        stdout: String,
        stderr: String,
    },

    /// Process exceeded its timeout and was killed
    #[error("Command '{command}' timed out after {timeout:?}")]
    Timeout { command: String, timeout: Duration },

    /// Run was cancelled while the command was in flight
    #[error("Command '{command}' cancelled")]
    Cancelled { command: String },

    /// I/O error talking to the child process
    #[error("I/O error running '{command}': {error}")]
    Io { command: String, error: String },

    /// Container sandbox could not be created or used
    #[error("Container backend error: {message}")]
    Container { message: String },
}

/// Substrings in command output that indicate a retryable condition
const TRANSIENT_MARKERS: &[&str] = &[
    "Connection refused",
    "Connection reset",
    "Connection timed out",
    "connection closed",
    "Broken pipe",
    "No route to host",
    "Network is unreachable",
    "Resource busy",
    "Device or resource busy",
    "Temporary failure",
    "lost connection",
];

impl ExecError {
    /// Whether a retry of the same operation may succeed
    pub fn is_transient(&self) -> bool {
        match self {
            ExecError::Timeout { .. } => true,
            ExecError::Failed { stdout, stderr, .. } => TRANSIENT_MARKERS
                .iter()
                .any(|m| stderr.contains(m) || stdout.contains(m)),
            ExecError::Io { error, .. } => {
                TRANSIENT_MARKERS.iter().any(|m| error.contains(m))
            }
            _ => false,
        }
    }

    /// Whether the error came from a cancelled run
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ExecError::Cancelled { .. })
    }
}

/// Disk image engine errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DiskError {
    /// Image file does not exist
    #[error("Image not found: {path}")]
    ImageNotFound { path: PathBuf },

    /// Image is already attached to a loop device this engine did not create
    #[error("Image '{image}' is already mapped through {loop_device}; unmap it first")]
    AlreadyMapped { image: PathBuf, loop_device: PathBuf },

    /// Partition mapping produced no partitions
    #[error("No partitions found in image '{image}'")]
    NoPartitions { image: PathBuf },

    /// Mapped device never appeared as a block device
    #[error("Timed out waiting for block device '{device}' after {attempts} attempts. Listing:\n{diagnostics}")]
    DeviceTimeout {
        device: PathBuf,
        attempts: u32,
        diagnostics: String,
    },

    /// Mount failed
    #[error("Failed to mount '{device}' at '{mount_point}': {error}\n{diagnostics}")]
    MountFailed {
        device: PathBuf,
        mount_point: PathBuf,
        error: String,
        diagnostics: String,
    },

    /// Device already mounted at a different directory
    #[error("Device '{device}' is already mounted at '{existing}', refusing to mount at '{requested}'")]
    MountedElsewhere {
        device: PathBuf,
        existing: PathBuf,
        requested: PathBuf,
    },

    /// Unmount failed even with lazy and forced fallbacks
    #[error("Failed to unmount '{mount_point}': {error}")]
    UnmountFailed { mount_point: PathBuf, error: String },

    /// Filesystem type is not supported for the requested operation
    #[error("Unsupported filesystem '{fs_type}' for {operation}")]
    UnsupportedFilesystem { fs_type: String, operation: String },

    /// Content read back could not be decoded
    #[error("Failed to decode content of '{path}': {error}")]
    Decode { path: PathBuf, error: String },

    /// Directory listing could not be parsed
    #[error("Failed to parse listing line '{line}'")]
    ListingParse { line: String },

    /// Underlying command failed
    #[error("{operation} failed: {source}")]
    Command {
        operation: String,
        #[source]
        source: ExecError,
    },
}

impl DiskError {
    /// Wrap an executor error with the failing operation's name
    pub fn command(operation: impl Into<String>, source: ExecError) -> Self {
        DiskError::Command {
            operation: operation.into(),
            source,
        }
    }
}

/// Network identity injection errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum NetworkError {
    /// Identity failed validation
    #[error("Invalid network identity: {message}")]
    Invalid { message: String },

    /// Guest root has no recognised network configuration layout
    #[error("No supported network configuration layout under '{root}'")]
    UnsupportedLayout { root: PathBuf },

    /// Writing guest files failed
    #[error("Failed to write network configuration under '{root}': {source}")]
    Write {
        root: PathBuf,
        #[source]
        source: DiskError,
    },
}

/// Image compression errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CompressError {
    /// Archive did not contain a disk image
    #[error("No disk image found in archive '{archive}'")]
    NoImageInArchive { archive: PathBuf },

    /// Source artifact missing
    #[error("Artifact not found: {path}")]
    NotFound { path: PathBuf },

    /// Unexpected size output
    #[error("Could not determine size of '{path}': {output}")]
    Size { path: PathBuf, output: String },

    /// Tool invocation failed
    #[error("{operation} of '{path}' failed: {source}")]
    Command {
        operation: String,
        path: PathBuf,
        #[source]
        source: ExecError,
    },
}

/// Image transfer errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransferError {
    /// Local artifact could not be read
    #[error("IO error for '{path}': {error}")]
    Local { path: PathBuf, error: String },

    /// Remote size did not match local size after a tier finished
    #[error("Size mismatch for '{remote}' on node {node}: local {local_size} bytes, remote {remote_size} bytes")]
    SizeMismatch {
        node: u32,
        remote: String,
        local_size: u64,
        remote_size: u64,
    },

    /// A single tier gave up after its retry budget
    #[error("{strategy} transfer to '{remote}' failed after {attempts} attempts: {error}")]
    TierFailed {
        strategy: String,
        remote: String,
        attempts: u32,
        error: String,
    },

    /// Every tier failed
    #[error("All transfer strategies exhausted for node {node} ('{remote}'): {}", .errors.join("; "))]
    Exhausted {
        node: u32,
        remote: String,
        errors: Vec<String>,
    },

    /// Remote command failed
    #[error("{operation} failed for '{remote}': {source}")]
    Remote {
        operation: String,
        remote: String,
        #[source]
        source: ExecError,
    },

    /// Run cancelled mid-transfer
    #[error("Transfer to '{remote}' cancelled")]
    Cancelled { remote: String },
}

/// Controller command surface errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ControllerError {
    /// Controller command failed
    #[error("Controller command '{operation}' for node {node} failed: {source}")]
    Command {
        operation: String,
        node: u32,
        #[source]
        source: ExecError,
    },

    /// Controller output could not be interpreted
    #[error("Unexpected controller output for '{operation}' on node {node}: {output}")]
    UnexpectedOutput {
        operation: String,
        node: u32,
        output: String,
    },
}

impl ControllerError {
    /// Whether the underlying failure is retryable
    pub fn is_transient(&self) -> bool {
        match self {
            ControllerError::Command { source, .. } => source.is_transient(),
            ControllerError::UnexpectedOutput { .. } => false,
        }
    }
}

/// Flash/power orchestration errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FlashError {
    /// Node still reported powered on after a power-off command
    #[error("Node {node} still powered on {waited:?} after power-off")]
    StillPoweredOn { node: u32, waited: Duration },

    /// Node did not report powered on after a power-on command
    #[error("Node {node} did not power on")]
    NotPoweredOn { node: u32 },

    /// Flash did not complete within the overall timeout
    #[error("Flashing node {node} with '{image}' timed out after {timeout:?}")]
    Timeout {
        node: u32,
        image: String,
        timeout: Duration,
    },

    /// Run cancelled during a phase
    #[error("Flashing node {node} cancelled during {phase}")]
    Cancelled { node: u32, phase: String },

    /// A controller command failed during a phase
    #[error("Phase {phase} failed for node {node}: {source}")]
    Phase {
        phase: String,
        node: u32,
        #[source]
        source: ControllerError,
    },
}

/// Boot verification errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BootError {
    /// Not every milestone appeared before the deadline
    #[error("Node {node} boot not verified within {timeout:?}; missing milestones: {}", .missing.join(", "))]
    TimedOut {
        node: u32,
        timeout: Duration,
        missing: Vec<String>,
    },

    /// Console showed a fatal boot failure
    #[error("Node {node} boot failed: console reported '{pattern}'")]
    Failed { node: u32, pattern: String },

    /// Console read failed
    #[error("Console read for node {node} failed: {source}")]
    Console {
        node: u32,
        #[source]
        source: ControllerError,
    },

    /// Run cancelled between polls
    #[error("Boot verification for node {node} cancelled")]
    Cancelled { node: u32 },
}

/// Interactive session errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum InteractError {
    /// Stream ended before the expected text appeared
    #[error("Session closed before match for '{expected}' (step {step})")]
    ClosedBeforeMatch { step: usize, expected: String },

    /// Expected text did not appear in time
    #[error("Timeout waiting for match '{expected}' (step {step}) after {timeout:?}")]
    Timeout {
        step: usize,
        expected: String,
        timeout: Duration,
    },

    /// Final output reported a rejection
    #[error("Password change rejected: {reason}")]
    Rejected { reason: String },

    /// Final output did not match any known outcome
    #[error("Unrecognized session outcome: {tail}")]
    Unrecognized { tail: String },

    /// Session could not be opened
    #[error("Failed to open session to {target}: {error}")]
    Connect { target: String, error: String },

    /// Read or write on the session failed
    #[error("Session I/O error: {error}")]
    Io { error: String },

    /// Retry budget exhausted
    #[error("Session failed after {attempts} attempts: {last}")]
    AttemptsExhausted { attempts: u32, last: String },

    /// Run cancelled
    #[error("Session cancelled")]
    Cancelled,
}

impl InteractError {
    /// Whether reconnecting and replaying the whole session may succeed
    ///
    /// A timeout is transient only on the first step, before anything was
    /// sent; later the node is reachable and answering something else.
    pub fn is_transient(&self) -> bool {
        match self {
            InteractError::Connect { .. } | InteractError::ClosedBeforeMatch { .. } | InteractError::Io { .. } => true,
            InteractError::Timeout { step, .. } => *step <= 1,
            _ => false,
        }
    }
}

/// Node status store errors
#[derive(Error, Debug)]
pub enum StateError {
    /// Reading the state file failed
    #[error("Failed to read state file '{path}': {error}")]
    Read { path: PathBuf, error: String },

    /// Writing the state file failed
    #[error("Failed to write state file '{path}': {error}")]
    Write { path: PathBuf, error: String },

    /// State file contents were invalid
    #[error("Failed to parse state file '{path}': {error}")]
    Parse { path: PathBuf, error: String },

    /// Store used after close
    #[error("State store '{path}' is closed")]
    Closed { path: PathBuf },
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file '{path}': {error}")]
    Read { path: PathBuf, error: String },

    /// Failed to parse config file
    #[error("Failed to parse config file '{path}': {error}")]
    Parse { path: PathBuf, error: String },

    /// Required setting missing
    #[error("Missing required setting '{key}'")]
    Missing { key: String },
}

/// Filesystem errors
#[derive(Error, Debug)]
pub enum FilesystemError {
    /// Failed to create directory
    #[error("Failed to create directory '{path}': {error}")]
    CreateDir { path: PathBuf, error: String },

    /// Failed to write file
    #[error("Failed to write file '{path}': {error}")]
    WriteFile { path: PathBuf, error: String },

    /// Failed to read file
    #[error("Failed to read file '{path}': {error}")]
    ReadFile { path: PathBuf, error: String },
}

/// Top-level provisioning error
#[derive(Error, Debug)]
pub enum ProvisionError {
    /// Execution error
    #[error("Execution error: {0}")]
    Exec(#[from] ExecError),

    /// Disk error
    #[error("Disk error: {0}")]
    Disk(#[from] DiskError),

    /// Network identity error
    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    /// Compression error
    #[error("Compression error: {0}")]
    Compress(#[from] CompressError),

    /// Transfer error
    #[error("Transfer error: {0}")]
    Transfer(#[from] TransferError),

    /// Controller error
    #[error("Controller error: {0}")]
    Controller(#[from] ControllerError),

    /// Flash error
    #[error("Flash error: {0}")]
    Flash(#[from] FlashError),

    /// Boot error
    #[error("Boot error: {0}")]
    Boot(#[from] BootError),

    /// Interactive session error
    #[error("Session error: {0}")]
    Interact(#[from] InteractError),

    /// State store error
    #[error("State error: {0}")]
    State(#[from] StateError),

    /// Configuration error
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// Filesystem error
    #[error("Filesystem error: {0}")]
    Filesystem(#[from] FilesystemError),

    /// Run cancelled
    #[error("Provisioning cancelled during {stage}")]
    Cancelled { stage: String },
}

impl ProvisionError {
    /// Whether a caller driving the whole pipeline again may succeed
    pub fn is_transient(&self) -> bool {
        match self {
            ProvisionError::Exec(e) => e.is_transient(),
            ProvisionError::Controller(e) => e.is_transient(),
            ProvisionError::Interact(e) => e.is_transient(),
            _ => false,
        }
    }
}
