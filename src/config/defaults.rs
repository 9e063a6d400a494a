//! Default configuration values

use std::time::Duration;

/// Attempts per transfer tier
pub const TRANSFER_ATTEMPTS: u32 = 3;

/// Delay between attempts within a transfer tier
pub const TRANSFER_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Chunk size for the low-level chunked transfer tier (100 MiB)
pub const TRANSFER_CHUNK_SIZE: u64 = 100 * 1024 * 1024;

/// Block size used by `dd` when writing chunks remotely (1 MiB)
pub const CHUNK_BLOCK_SIZE: u64 = 1024 * 1024;

/// Timeout for writing one chunk on the controller
pub const CHUNK_WRITE_TIMEOUT: Duration = Duration::from_secs(600);

/// Timeout for copying a cache entry into place on the controller
pub const REMOTE_COPY_TIMEOUT: Duration = Duration::from_secs(600);

/// Timeout for decompressing a transferred image on the controller
pub const REMOTE_DECOMPRESS_TIMEOUT: Duration = Duration::from_secs(1800);

/// Remote base directory on the controller for transferred images
pub const REMOTE_CACHE_BASE: &str = "/mnt/sdcard/nodeprov";

/// Name of the keyed cache directory under the remote base
pub const REMOTE_CACHE_DIR: &str = ".cache";

/// Attempts to see a mapped partition appear as a block device
pub const DEVICE_WAIT_ATTEMPTS: u32 = 10;

/// Delay between block device checks
pub const DEVICE_WAIT_INTERVAL: Duration = Duration::from_secs(1);

/// Overall timeout for a flash command
pub const FLASH_TIMEOUT: Duration = Duration::from_secs(180);

/// Interval between flash progress heartbeats
pub const FLASH_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

/// Wait budget for a node to report powered off
pub const POWER_OFF_WAIT: Duration = Duration::from_secs(10);

/// Interval between power status checks while waiting
pub const POWER_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Interval between serial console polls
pub const BOOT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Overall boot verification timeout
pub const BOOT_TIMEOUT: Duration = Duration::from_secs(300);

/// Per-step timeout for interactive sessions
pub const INTERACT_STEP_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout for reading trailing output after the last step
pub const INTERACT_FINAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Attempts for opening and running the password change session
pub const INTERACT_ATTEMPTS: u32 = 5;

/// Delay between password change attempts
pub const INTERACT_RETRY_DELAY: Duration = Duration::from_secs(15);

/// Default login user on freshly flashed images
pub const DEFAULT_NODE_USER: &str = "ubuntu";

/// Default first-boot password on freshly flashed images
pub const DEFAULT_INITIAL_PASSWORD: &str = "ubuntu";

/// Default controller user
pub const DEFAULT_CONTROLLER_USER: &str = "root";

/// Default controller SSH port
pub const DEFAULT_SSH_PORT: u16 = 22;

/// Default timeout for a single remote command
pub const REMOTE_COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

/// Container image used by the sandboxed executor
pub const CONTAINER_IMAGE: &str = "ubuntu:24.04";

/// Concurrent probes in node discovery
pub const DISCOVERY_CONCURRENCY: usize = 4;

/// Highest node id probed by discovery
pub const DISCOVERY_MAX_NODE: u32 = 4;

/// State file name under the data directory
pub const STATE_FILE: &str = "nodes.json";

/// Config file name
pub const CONFIG_FILE: &str = "config.toml";

/// Project-local config file name
pub const LOCAL_CONFIG_FILE: &str = "nodeprov.toml";
