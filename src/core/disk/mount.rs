//! Mount lifecycle

use std::path::{Path, PathBuf};

use super::{arg, lock, DiskEngine};
use crate::error::DiskError;
use crate::infra::executor::{CommandExecutor, CommandRequest};

/// Kernel log lines included in mount failure diagnostics
const DMESG_TAIL_LINES: usize = 15;

/// What a mount call did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountOutcome {
    /// The device was mounted by this call
    Mounted,
    /// The device was already mounted at the requested target
    AlreadyMounted,
}

/// Normalise a mount target for comparison
fn same_target(a: &Path, b: &Path) -> bool {
    let trim = |p: &Path| p.display().to_string().trim_end_matches('/').to_string();
    trim(a) == trim(b)
}

/// Build the mount argv
pub fn mount_argv(
    device: &Path,
    mount_point: &Path,
    fs_type: Option<&str>,
    options: Option<&str>,
) -> Vec<String> {
    let mut argv = vec!["mount".to_string()];
    if let Some(fs) = fs_type {
        argv.extend(["-t".to_string(), fs.to_string()]);
    }
    if let Some(opts) = options {
        argv.extend(["-o".to_string(), opts.to_string()]);
    }
    argv.push(arg(device));
    argv.push(arg(mount_point));
    argv
}

impl<E: CommandExecutor> DiskEngine<E> {
    /// Mount `device` at `mount_point`
    ///
    /// Returns [`MountOutcome::AlreadyMounted`] without running `mount` when
    /// the device is already mounted there, and fails with
    /// [`DiskError::MountedElsewhere`] when it is mounted somewhere else.
    pub async fn mount(
        &self,
        device: &Path,
        mount_point: &Path,
        fs_type: Option<&str>,
        options: Option<&str>,
    ) -> Result<MountOutcome, DiskError> {
        let current = self.current_mount_targets(device).await?;
        if current.iter().any(|t| same_target(t, mount_point)) {
            tracing::debug!(device = %device.display(), mount_point = %mount_point.display(), "already mounted");
            lock(&self.mounts).insert(device.to_path_buf(), mount_point.to_path_buf());
            return Ok(MountOutcome::AlreadyMounted);
        }
        if let Some(existing) = current.into_iter().next() {
            return Err(DiskError::MountedElsewhere {
                device: device.to_path_buf(),
                existing,
                requested: mount_point.to_path_buf(),
            });
        }

        self.run_op("create mount point", CommandRequest::new(["mkdir", "-p", &arg(mount_point)]))
            .await?;

        tracing::info!(device = %device.display(), mount_point = %mount_point.display(), "mounting");
        let output = self
            .exec
            .execute(CommandRequest::new(mount_argv(device, mount_point, fs_type, options)))
            .await
            .map_err(|e| DiskError::command("mount", e))?;
        if !output.success() {
            let diagnostics = self.mount_diagnostics(device).await;
            return Err(DiskError::MountFailed {
                device: device.to_path_buf(),
                mount_point: mount_point.to_path_buf(),
                error: format!("{}{}", output.stdout, output.stderr).trim().to_string(),
                diagnostics,
            });
        }

        if !self.is_mounted(mount_point).await? {
            let diagnostics = self.mount_diagnostics(device).await;
            return Err(DiskError::MountFailed {
                device: device.to_path_buf(),
                mount_point: mount_point.to_path_buf(),
                error: "mount reported success but the mount point check failed".to_string(),
                diagnostics,
            });
        }

        lock(&self.mounts).insert(device.to_path_buf(), mount_point.to_path_buf());
        Ok(MountOutcome::Mounted)
    }

    /// Unmount `mount_point`, falling back to lazy and then forced unmount
    ///
    /// Returns `false` when nothing was mounted there.
    pub async fn unmount(&self, mount_point: &Path) -> Result<bool, DiskError> {
        let mounted = self
            .exec
            .execute(CommandRequest::new(["mountpoint", "-q", &arg(mount_point)]).uncancellable())
            .await
            .map_err(|e| DiskError::command("unmount", e))?
            .success();
        if !mounted {
            self.forget_mount(mount_point);
            return Ok(false);
        }

        tracing::info!(mount_point = %mount_point.display(), "unmounting");
        let mut last_error = String::new();
        for argv in [
            vec!["umount", "--"],
            vec!["umount", "-l", "--"],
            vec!["umount", "-f", "--"],
        ] {
            let mut argv: Vec<String> = argv.into_iter().map(String::from).collect();
            argv.push(arg(mount_point));
            let request = CommandRequest::new(argv).uncancellable();
            let command_line = request.display();
            match self.exec.execute(request).await {
                Ok(out) if out.success() => {
                    self.forget_mount(mount_point);
                    return Ok(true);
                }
                Ok(out) => {
                    last_error = format!("{}{}", out.stdout, out.stderr).trim().to_string();
                    tracing::warn!(command = %command_line, "unmount attempt failed: {}", last_error);
                }
                Err(e) => {
                    last_error = e.to_string();
                    tracing::warn!(command = %command_line, "unmount attempt failed: {}", last_error);
                }
            }
        }

        Err(DiskError::UnmountFailed {
            mount_point: mount_point.to_path_buf(),
            error: last_error,
        })
    }

    /// Whether something is mounted at `mount_point`
    pub async fn is_mounted(&self, mount_point: &Path) -> Result<bool, DiskError> {
        self.probe_op("mount point check", CommandRequest::new(["mountpoint", "-q", &arg(mount_point)]))
            .await
    }

    /// Targets the system reports `device` mounted at
    async fn current_mount_targets(&self, device: &Path) -> Result<Vec<PathBuf>, DiskError> {
        let output = self
            .exec
            .execute(CommandRequest::new([
                "findmnt",
                "-rn",
                "-S",
                &arg(device),
                "-o",
                "TARGET",
            ]))
            .await
            .map_err(|e| DiskError::command("query mounts", e))?;
        if !output.success() {
            return Ok(Vec::new());
        }
        Ok(output
            .stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(|l| PathBuf::from(l.replace("\\x20", " ")))
            .collect())
    }

    /// Filesystem type and recent kernel messages for a failed mount
    async fn mount_diagnostics(&self, device: &Path) -> String {
        let fs_type = match self
            .exec
            .execute(CommandRequest::new(["blkid", "-o", "value", "-s", "TYPE", &arg(device)]))
            .await
        {
            Ok(out) if out.success() => out.stdout.trim().to_string(),
            Ok(_) => "unknown".to_string(),
            Err(e) => format!("unknown ({e})"),
        };
        let kernel_log = match self.exec.execute(CommandRequest::new(["dmesg"])).await {
            Ok(out) => {
                let lines: Vec<&str> = out.stdout.lines().collect();
                let start = lines.len().saturating_sub(DMESG_TAIL_LINES);
                lines[start..].join("\n")
            }
            Err(e) => format!("dmesg unavailable: {e}"),
        };
        format!("filesystem type: {fs_type}\nkernel log:\n{kernel_log}")
    }

    fn forget_mount(&self, mount_point: &Path) {
        lock(&self.mounts).retain(|_, target| !same_target(target, mount_point));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mount_argv_with_type_and_options() {
        let argv = mount_argv(
            Path::new("/dev/mapper/loop0p2"),
            Path::new("/mnt/root"),
            Some("ext4"),
            Some("rw,noatime"),
        );
        assert_eq!(
            argv,
            vec!["mount", "-t", "ext4", "-o", "rw,noatime", "/dev/mapper/loop0p2", "/mnt/root"]
        );
    }

    #[test]
    fn test_mount_argv_plain() {
        let argv = mount_argv(Path::new("/dev/sda1"), Path::new("/mnt"), None, None);
        assert_eq!(argv, vec!["mount", "/dev/sda1", "/mnt"]);
    }

    #[test]
    fn test_same_target_ignores_trailing_slash() {
        assert!(same_target(Path::new("/mnt/root/"), Path::new("/mnt/root")));
        assert!(!same_target(Path::new("/mnt/a"), Path::new("/mnt/b")));
    }
}
