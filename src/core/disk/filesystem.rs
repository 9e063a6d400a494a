//! Filesystem format and resize

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use super::{arg, DiskEngine};
use crate::error::{DiskError, ExecError};
use crate::infra::executor::{CommandExecutor, CommandRequest};

/// Filesystems the engine can create
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Filesystem {
    Ext4,
    Ext3,
    Ext2,
    Vfat,
    Xfs,
    Btrfs,
    F2fs,
}

impl Filesystem {
    /// Name as reported by `blkid`
    pub fn as_str(&self) -> &'static str {
        match self {
            Filesystem::Ext4 => "ext4",
            Filesystem::Ext3 => "ext3",
            Filesystem::Ext2 => "ext2",
            Filesystem::Vfat => "vfat",
            Filesystem::Xfs => "xfs",
            Filesystem::Btrfs => "btrfs",
            Filesystem::F2fs => "f2fs",
        }
    }

    /// Argument vector that creates this filesystem on `device`
    pub fn format_argv(&self, device: &Path, label: Option<&str>) -> Vec<String> {
        let mut argv: Vec<String> = match self {
            Filesystem::Ext4 | Filesystem::Ext3 | Filesystem::Ext2 => {
                vec![format!("mkfs.{}", self.as_str()), "-F".to_string()]
            }
            Filesystem::Vfat => vec!["mkfs.vfat".to_string()],
            Filesystem::Xfs => vec!["mkfs.xfs".to_string(), "-f".to_string()],
            Filesystem::Btrfs => vec!["mkfs.btrfs".to_string(), "-f".to_string()],
            Filesystem::F2fs => vec!["mkfs.f2fs".to_string(), "-f".to_string()],
        };
        if let Some(label) = label {
            let flag = match self {
                Filesystem::Vfat => "-n",
                _ => "-L",
            };
            argv.extend([flag.to_string(), label.to_string()]);
        }
        argv.push(arg(device));
        argv
    }
}

impl fmt::Display for Filesystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Filesystem {
    type Err = DiskError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "ext4" => Ok(Filesystem::Ext4),
            "ext3" => Ok(Filesystem::Ext3),
            "ext2" => Ok(Filesystem::Ext2),
            "vfat" | "fat" | "fat32" => Ok(Filesystem::Vfat),
            "xfs" => Ok(Filesystem::Xfs),
            "btrfs" => Ok(Filesystem::Btrfs),
            "f2fs" => Ok(Filesystem::F2fs),
            other => Err(DiskError::UnsupportedFilesystem {
                fs_type: other.to_string(),
                operation: "format".to_string(),
            }),
        }
    }
}

impl<E: CommandExecutor> DiskEngine<E> {
    /// Create a filesystem on `device`
    pub async fn format(
        &self,
        device: &Path,
        fs: Filesystem,
        label: Option<&str>,
    ) -> Result<(), DiskError> {
        tracing::info!(device = %device.display(), fs = %fs, "formatting");
        self.run_op("format", CommandRequest::new(fs.format_argv(device, label)))
            .await?;
        Ok(())
    }

    /// Grow the filesystem on `device` to fill its partition
    ///
    /// ext2/3/4 are checked with `e2fsck -f -y` first; an exit status of 1
    /// means errors were corrected and is accepted.
    pub async fn resize_filesystem(&self, device: &Path) -> Result<(), DiskError> {
        let fs_type = self.filesystem_type(device).await?;
        tracing::info!(device = %device.display(), fs = %fs_type, "resizing filesystem");
        match fs_type.as_str() {
            "ext2" | "ext3" | "ext4" => {
                let check = self
                    .exec
                    .execute(CommandRequest::new(["e2fsck", "-f", "-y", &arg(device)]))
                    .await
                    .map_err(|e| DiskError::command("filesystem check", e))?;
                if !matches!(check.status, Some(0) | Some(1)) {
                    return Err(DiskError::command(
                        "filesystem check",
                        ExecError::Failed {
                            command: format!("e2fsck -f -y {}", device.display()),
                            status: check.status,
                            stdout: check.stdout,
                            stderr: check.stderr,
                        },
                    ));
                }
                self.run_op("resize", CommandRequest::new(["resize2fs", &arg(device)]))
                    .await?;
            }
            "f2fs" => {
                self.run_op("resize", CommandRequest::new(["resize.f2fs", &arg(device)]))
                    .await?;
            }
            other => {
                return Err(DiskError::UnsupportedFilesystem {
                    fs_type: other.to_string(),
                    operation: "resize".to_string(),
                });
            }
        }
        Ok(())
    }

    /// Filesystem type of `device` as reported by `blkid`
    pub async fn filesystem_type(&self, device: &Path) -> Result<String, DiskError> {
        let output = self
            .run_op(
                "detect filesystem",
                CommandRequest::new(["blkid", "-o", "value", "-s", "TYPE", &arg(device)]),
            )
            .await?;
        let fs_type = output.stdout.trim().to_string();
        if fs_type.is_empty() {
            return Err(DiskError::UnsupportedFilesystem {
                fs_type: "unknown".to_string(),
                operation: "resize".to_string(),
            });
        }
        Ok(fs_type)
    }
}
