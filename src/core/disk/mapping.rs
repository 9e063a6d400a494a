//! Partition mapping
//!
//! `kpartx` exposes an image's partitions as `/dev/mapper/loopNpK` devices
//! backed by `/dev/loopN`. Unmapping is verified against `losetup -j` and
//! escalates until nothing references the image.

use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use super::{arg, lock, DiskEngine};
use crate::error::DiskError;
use crate::infra::executor::{CommandExecutor, CommandRequest};

/// An image's active partition mapping
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionMapping {
    /// Image file
    pub image: PathBuf,
    /// Backing loop device
    pub loop_device: PathBuf,
    /// Per-partition devices, in table order
    pub partitions: Vec<PathBuf>,
    /// Device chosen as the root partition
    pub root: PathBuf,
}

/// How far unmap had to escalate
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum UnmapEscalation {
    /// `kpartx -d` was enough
    Normal,
    /// Device-mapper entries had to be force-removed
    ForcedMapperRemoval,
    /// Loop devices had to be detached directly
    LoopDetach,
    /// A block device rescan was needed
    Rescan,
}

/// Outcome of an unmap
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnmapReport {
    /// Deepest escalation step taken
    pub escalation: UnmapEscalation,
    /// Loop devices still referencing the image after every step
    pub residual: Vec<PathBuf>,
}

impl UnmapReport {
    /// Whether the image is fully released
    pub fn is_clean(&self) -> bool {
        self.residual.is_empty()
    }
}

/// Pick the root partition: the second when there are at least two, else
/// the first
///
/// This mirrors the common boot + root layout of SBC images. It does not
/// inspect filesystems, so images with a different layout need their root
/// partition named explicitly.
pub fn select_root_partition(partitions: &[PathBuf]) -> Option<&PathBuf> {
    match partitions.len() {
        0 => None,
        1 => partitions.first(),
        _ => partitions.get(1),
    }
}

/// Parse `kpartx -av` output into device-mapper names, in table order
pub fn parse_kpartx_output(output: &str) -> Vec<String> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"(?m)^add map (\S+)").expect("valid regex"));
    re.captures_iter(output)
        .map(|caps| caps[1].to_string())
        .collect()
}

/// Parse `losetup -j` output into loop device paths
pub fn parse_losetup_output(output: &str) -> Vec<PathBuf> {
    output
        .lines()
        .filter_map(|line| line.split_once(':').map(|(dev, _)| dev.trim()))
        .filter(|dev| dev.starts_with("/dev/loop"))
        .map(PathBuf::from)
        .collect()
}

/// Loop device backing a mapper name such as `loop3p2`
pub fn loop_device_for_mapper(name: &str) -> Option<PathBuf> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"^(loop\d+)p\d+$").expect("valid regex"));
    re.captures(name)
        .map(|caps| PathBuf::from("/dev").join(&caps[1]))
}

impl<E: CommandExecutor> DiskEngine<E> {
    /// Map an image's partitions and return the root partition device
    ///
    /// Calling this again for an image this engine already mapped returns
    /// the same root device without creating a second mapping. An image
    /// mapped by someone else is rejected.
    pub async fn map_partitions(&self, image: &Path) -> Result<PathBuf, DiskError> {
        if let Some(existing) = self.mapping(image) {
            tracing::debug!(image = %image.display(), root = %existing.root.display(), "image already mapped");
            return Ok(existing.root);
        }

        let exists = self
            .probe_op("map partitions", CommandRequest::new(["test", "-f", &arg(image)]))
            .await?;
        if !exists {
            return Err(DiskError::ImageNotFound {
                path: image.to_path_buf(),
            });
        }

        let existing_loops = self.loop_devices_for(image).await?;
        if let Some(loop_device) = existing_loops.into_iter().next() {
            return Err(DiskError::AlreadyMapped {
                image: image.to_path_buf(),
                loop_device,
            });
        }

        tracing::info!(image = %image.display(), "mapping partitions");
        let output = self
            .run_op("map partitions", CommandRequest::new(["kpartx", "-av", &arg(image)]))
            .await?;

        let names = parse_kpartx_output(&output.stdout);
        let partitions: Vec<PathBuf> = names
            .iter()
            .map(|name| PathBuf::from("/dev/mapper").join(name))
            .collect();

        let Some(root) = select_root_partition(&partitions).cloned() else {
            self.release_quietly(image).await;
            return Err(DiskError::NoPartitions {
                image: image.to_path_buf(),
            });
        };
        let loop_device = names
            .first()
            .and_then(|name| loop_device_for_mapper(name))
            .unwrap_or_else(|| PathBuf::from("/dev/loop"));

        if let Err(e) = self.wait_for_block_device(&root).await {
            self.release_quietly(image).await;
            return Err(e);
        }

        tracing::info!(
            image = %image.display(),
            root = %root.display(),
            partitions = partitions.len(),
            "partitions mapped"
        );
        lock(&self.mappings).insert(
            image.to_path_buf(),
            PartitionMapping {
                image: image.to_path_buf(),
                loop_device,
                partitions,
                root: root.clone(),
            },
        );
        Ok(root)
    }

    /// Remove an image's mapping, escalating until no loop device
    /// references it
    ///
    /// Residual mappings after the last step are logged, not returned as
    /// an error.
    pub async fn unmap_partitions(&self, image: &Path) -> Result<UnmapReport, DiskError> {
        let recorded = lock(&self.mappings).remove(image);
        tracing::info!(image = %image.display(), "unmapping partitions");

        let removed = self
            .exec
            .execute(CommandRequest::new(["kpartx", "-dv", &arg(image)]).uncancellable())
            .await;
        match removed {
            Ok(out) if !out.success() => {
                tracing::warn!(image = %image.display(), "kpartx -d failed: {}", out.stderr.trim());
            }
            Err(e) => tracing::warn!(image = %image.display(), "kpartx -d failed: {}", e),
            Ok(_) => {}
        }

        let mut loops = self.loop_devices_for_cleanup(image).await;
        if loops.is_empty() {
            return Ok(UnmapReport {
                escalation: UnmapEscalation::Normal,
                residual: Vec::new(),
            });
        }
        if let Some(mapping) = &recorded {
            if !loops.contains(&mapping.loop_device) {
                loops.push(mapping.loop_device.clone());
            }
        }

        tracing::warn!(image = %image.display(), loops = ?loops, "mapping persists, forcing removal");
        for loop_device in &loops {
            self.remove_mapper_entries(loop_device).await;
        }
        let remaining = self.loop_devices_for_cleanup(image).await;
        if remaining.is_empty() {
            return Ok(UnmapReport {
                escalation: UnmapEscalation::ForcedMapperRemoval,
                residual: Vec::new(),
            });
        }

        for loop_device in &remaining {
            self.cleanup_command(["losetup", "-d", &arg(loop_device)]).await;
        }
        let remaining = self.loop_devices_for_cleanup(image).await;
        if remaining.is_empty() {
            return Ok(UnmapReport {
                escalation: UnmapEscalation::LoopDetach,
                residual: Vec::new(),
            });
        }

        self.cleanup_command(["udevadm", "trigger", "--subsystem-match=block"])
            .await;
        self.cleanup_command(["udevadm", "settle"]).await;
        for loop_device in &remaining {
            self.cleanup_command(["losetup", "-d", &arg(loop_device)]).await;
        }

        let residual = self.loop_devices_for_cleanup(image).await;
        if !residual.is_empty() {
            tracing::warn!(
                image = %image.display(),
                residual = ?residual,
                "loop devices still reference image after cleanup"
            );
        }
        Ok(UnmapReport {
            escalation: UnmapEscalation::Rescan,
            residual,
        })
    }

    /// Loop devices currently backed by `image`
    pub async fn loop_devices_for(&self, image: &Path) -> Result<Vec<PathBuf>, DiskError> {
        let output = self
            .exec
            .execute(CommandRequest::new(["losetup", "-j", &arg(image)]))
            .await
            .map_err(|e| DiskError::command("query loop devices", e))?;
        Ok(parse_losetup_output(&output.stdout))
    }

    async fn loop_devices_for_cleanup(&self, image: &Path) -> Vec<PathBuf> {
        match self
            .exec
            .execute(CommandRequest::new(["losetup", "-j", &arg(image)]).uncancellable())
            .await
        {
            Ok(output) => parse_losetup_output(&output.stdout),
            Err(e) => {
                tracing::warn!(image = %image.display(), "losetup -j failed: {}", e);
                Vec::new()
            }
        }
    }

    async fn remove_mapper_entries(&self, loop_device: &Path) {
        let Some(loop_name) = loop_device.file_name().map(|n| n.to_string_lossy().into_owned())
        else {
            return;
        };
        let listing = self
            .exec
            .execute(CommandRequest::new(["dmsetup", "ls"]).uncancellable())
            .await;
        let Ok(listing) = listing else {
            return;
        };
        let prefix = format!("{loop_name}p");
        for name in listing
            .stdout
            .lines()
            .filter_map(|line| line.split_whitespace().next())
            .filter(|name| name.starts_with(&prefix))
        {
            self.cleanup_command(["dmsetup", "remove", "-f", name]).await;
        }
    }

    async fn cleanup_command<const N: usize>(&self, argv: [&str; N]) {
        let request = CommandRequest::new(argv).uncancellable();
        let command_line = request.display();
        match self.exec.execute(request).await {
            Ok(out) if !out.success() => {
                tracing::warn!(command = %command_line, "cleanup step failed: {}", out.stderr.trim());
            }
            Err(e) => tracing::warn!(command = %command_line, "cleanup step failed: {}", e),
            Ok(_) => {}
        }
    }

    async fn release_quietly(&self, image: &Path) {
        if let Err(e) = self.unmap_partitions(image).await {
            tracing::warn!(image = %image.display(), "release after failed map: {}", e);
        }
    }

    /// Poll until `device` exists as a block device
    pub async fn wait_for_block_device(&self, device: &Path) -> Result<(), DiskError> {
        let attempts = self.device_wait.attempts.max(1);
        for attempt in 1..=attempts {
            let present = self
                .probe_op("wait for device", CommandRequest::new(["test", "-b", &arg(device)]))
                .await?;
            if present {
                return Ok(());
            }
            tracing::debug!(device = %device.display(), attempt, "waiting for block device");
            if attempt < attempts {
                self.pause("wait for device", self.device_wait.interval).await?;
            }
        }

        let dir = device.parent().unwrap_or(Path::new("/dev"));
        let diagnostics = match self
            .exec
            .execute(CommandRequest::new(["ls", "-la", &arg(dir)]))
            .await
        {
            Ok(out) => format!("{}{}", out.stdout, out.stderr),
            Err(e) => format!("listing {} failed: {}", dir.display(), e),
        };
        Err(DiskError::DeviceTimeout {
            device: device.to_path_buf(),
            attempts,
            diagnostics,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_partition_heuristic() {
        let one = vec![PathBuf::from("/dev/mapper/loop0p1")];
        assert_eq!(select_root_partition(&one), Some(&one[0]));

        let three = vec![
            PathBuf::from("/dev/mapper/loop0p1"),
            PathBuf::from("/dev/mapper/loop0p2"),
            PathBuf::from("/dev/mapper/loop0p3"),
        ];
        assert_eq!(select_root_partition(&three), Some(&three[1]));
        assert_eq!(select_root_partition(&[]), None);
    }

    #[test]
    fn test_parse_kpartx_output() {
        let out = "add map loop7p1 (253:0): 0 1048576 linear 7:7 2048\n\
                   add map loop7p2 (253:1): 0 7340032 linear 7:7 1050624\n";
        assert_eq!(parse_kpartx_output(out), vec!["loop7p1", "loop7p2"]);
        assert!(parse_kpartx_output("").is_empty());
    }

    #[test]
    fn test_parse_losetup_output() {
        let out = "/dev/loop7: [2049]:1311 (/var/cache/nodeprov/work/1/node1.img)\n";
        assert_eq!(parse_losetup_output(out), vec![PathBuf::from("/dev/loop7")]);
        assert!(parse_losetup_output("").is_empty());
        assert!(parse_losetup_output("losetup: not found\n").is_empty());
    }

    #[test]
    fn test_loop_device_for_mapper() {
        assert_eq!(
            loop_device_for_mapper("loop12p2"),
            Some(PathBuf::from("/dev/loop12"))
        );
        assert_eq!(loop_device_for_mapper("nvme0n1p1"), None);
    }
}
