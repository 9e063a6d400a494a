//! Integration tests for the disk image engine
//!
//! The engine only sees command output, so every host state it has to cope
//! with (stale mappings, busy mounts, slow device nodes) is scripted here.

mod common;

use common::{kpartx_two_partitions, losetup_line, ScriptedExecutor};
use nodeprov::core::disk::{with_mounted_image, DeviceWait, DiskEngine, MountOutcome, UnmapEscalation};
use nodeprov::error::DiskError;
use nodeprov::infra::executor::CommandOutput;
use std::path::{Path, PathBuf};
use std::time::Duration;

const IMAGE: &str = "/work/1/node1.img";
const MOUNT_POINT: &str = "/mnt/node1";
const ROOT_DEVICE: &str = "/dev/mapper/loop0p2";

fn fast_wait(attempts: u32) -> DeviceWait {
    DeviceWait {
        attempts,
        interval: Duration::from_millis(1),
    }
}

fn engine(exec: ScriptedExecutor) -> DiskEngine<ScriptedExecutor> {
    DiskEngine::new(exec).with_device_wait(fast_wait(3))
}

fn image() -> &'static Path {
    Path::new(IMAGE)
}

#[tokio::test]
async fn test_map_selects_second_partition_and_is_idempotent() {
    let engine = engine(ScriptedExecutor::new().on("kpartx -av", kpartx_two_partitions()));

    let root = engine.map_partitions(image()).await.unwrap();
    assert_eq!(root, PathBuf::from(ROOT_DEVICE));

    let again = engine.map_partitions(image()).await.unwrap();
    assert_eq!(again, root);
    assert_eq!(engine.executor().count("kpartx -av"), 1);

    let mapping = engine.mapping(image()).unwrap();
    assert_eq!(mapping.loop_device, PathBuf::from("/dev/loop0"));
    assert_eq!(
        mapping.partitions,
        vec![PathBuf::from("/dev/mapper/loop0p1"), PathBuf::from(ROOT_DEVICE)]
    );
}

#[tokio::test]
async fn test_map_single_partition_uses_it_as_root() {
    let engine = engine(ScriptedExecutor::new().on(
        "kpartx -av",
        CommandOutput::ok("add map loop4p1 (253:0): 0 204800 linear 7:4 2048\n"),
    ));
    let root = engine.map_partitions(image()).await.unwrap();
    assert_eq!(root, PathBuf::from("/dev/mapper/loop4p1"));
    assert_eq!(engine.mapping(image()).unwrap().loop_device, PathBuf::from("/dev/loop4"));
}

#[tokio::test]
async fn test_map_missing_image() {
    let engine = engine(ScriptedExecutor::new().on("test -f", CommandOutput::failed(1, "")));
    let err = engine.map_partitions(image()).await.unwrap_err();
    assert!(matches!(err, DiskError::ImageNotFound { .. }));
    assert!(!engine.executor().ran("kpartx"));
}

#[tokio::test]
async fn test_map_rejects_foreign_mapping() {
    let engine = engine(ScriptedExecutor::new().on("losetup -j", losetup_line("/dev/loop7", image())));
    let err = engine.map_partitions(image()).await.unwrap_err();
    match err {
        DiskError::AlreadyMapped { loop_device, .. } => assert_eq!(loop_device, PathBuf::from("/dev/loop7")),
        other => panic!("expected AlreadyMapped, got {other:?}"),
    }
    assert!(!engine.executor().ran("kpartx -av"));
}

#[tokio::test]
async fn test_map_without_partitions_releases() {
    let engine = engine(ScriptedExecutor::new().on("kpartx -av", CommandOutput::ok("")));
    let err = engine.map_partitions(image()).await.unwrap_err();
    assert!(matches!(err, DiskError::NoPartitions { .. }));
    assert!(engine.executor().ran("kpartx -dv"));
    assert!(engine.mapping(image()).is_none());
}

#[tokio::test]
async fn test_device_that_never_appears_times_out_and_releases() {
    let engine = engine(
        ScriptedExecutor::new()
            .on("kpartx -av", kpartx_two_partitions())
            .on("test -b", CommandOutput::failed(1, "")),
    );
    let err = engine.map_partitions(image()).await.unwrap_err();
    match err {
        DiskError::DeviceTimeout { device, attempts, .. } => {
            assert_eq!(device, PathBuf::from(ROOT_DEVICE));
            assert_eq!(attempts, 3);
        }
        other => panic!("expected DeviceTimeout, got {other:?}"),
    }
    assert_eq!(engine.executor().count("test -b"), 3);
    assert!(engine.executor().ran("kpartx -dv"));
}

#[tokio::test]
async fn test_device_appearing_late_is_accepted() {
    let engine = engine(
        ScriptedExecutor::new()
            .on("kpartx -av", kpartx_two_partitions())
            .on_seq(
                "test -b",
                vec![CommandOutput::failed(1, ""), CommandOutput::failed(1, ""), CommandOutput::ok("")],
            ),
    );
    assert_eq!(engine.map_partitions(image()).await.unwrap(), PathBuf::from(ROOT_DEVICE));
    assert_eq!(engine.executor().count("test -b"), 3);
}

#[tokio::test]
async fn test_clean_unmap_needs_no_escalation() {
    let engine = engine(ScriptedExecutor::new().on("kpartx -av", kpartx_two_partitions()));
    engine.map_partitions(image()).await.unwrap();

    let report = engine.unmap_partitions(image()).await.unwrap();
    assert_eq!(report.escalation, UnmapEscalation::Normal);
    assert!(report.is_clean());
    assert!(engine.mapping(image()).is_none());
    assert!(!engine.executor().ran("dmsetup"));
}

#[tokio::test]
async fn test_unmap_escalates_until_loop_detached() {
    let attached = losetup_line("/dev/loop0", image());
    let engine = engine(
        ScriptedExecutor::new()
            .on("kpartx -av", kpartx_two_partitions())
            .on_seq(
                "losetup -j",
                vec![CommandOutput::ok(""), attached.clone(), attached, CommandOutput::ok("")],
            )
            .on(
                "dmsetup ls",
                CommandOutput::ok("loop0p1\t(253:0)\nloop0p2\t(253:1)\nvg0-data\t(253:5)\n"),
            ),
    );
    engine.map_partitions(image()).await.unwrap();

    let report = engine.unmap_partitions(image()).await.unwrap();
    assert_eq!(report.escalation, UnmapEscalation::LoopDetach);
    assert!(report.is_clean());

    let exec = engine.executor();
    assert!(exec.ran("dmsetup remove -f loop0p1"));
    assert!(exec.ran("dmsetup remove -f loop0p2"));
    assert!(!exec.ran("dmsetup remove -f vg0-data"));
    assert!(exec.ran("losetup -d /dev/loop0"));
    assert!(!exec.ran("udevadm"));
    assert!(exec.position("kpartx -dv") < exec.position("dmsetup ls"));
}

#[tokio::test]
async fn test_unmap_reports_residual_without_failing() {
    let engine = engine(
        ScriptedExecutor::new()
            .on("kpartx -av", kpartx_two_partitions())
            .on_seq("losetup -j", vec![CommandOutput::ok(""), losetup_line("/dev/loop0", image())]),
    );
    engine.map_partitions(image()).await.unwrap();

    let report = engine.unmap_partitions(image()).await.unwrap();
    assert_eq!(report.escalation, UnmapEscalation::Rescan);
    assert_eq!(report.residual, vec![PathBuf::from("/dev/loop0")]);
    assert!(engine.executor().ran("udevadm settle"));
}

#[tokio::test]
async fn test_mount_and_remount_same_target() {
    let engine = engine(ScriptedExecutor::new());
    let device = Path::new(ROOT_DEVICE);
    let outcome = engine.mount(device, Path::new(MOUNT_POINT), None, None).await.unwrap();
    assert_eq!(outcome, MountOutcome::Mounted);
    assert!(engine.executor().ran("mkdir -p /mnt/node1"));
    assert!(engine.executor().ran("mount /dev/mapper/loop0p2 /mnt/node1"));
    assert_eq!(engine.mount_point_of(device), Some(PathBuf::from(MOUNT_POINT)));

    let engine = engine_with_mount("/mnt/node1/\n");
    let outcome = engine.mount(device, Path::new(MOUNT_POINT), None, None).await.unwrap();
    assert_eq!(outcome, MountOutcome::AlreadyMounted);
    assert_eq!(engine.executor().count("mount "), 0);
}

fn engine_with_mount(findmnt: &str) -> DiskEngine<ScriptedExecutor> {
    engine(ScriptedExecutor::new().on("findmnt", CommandOutput::ok(findmnt)))
}

#[tokio::test]
async fn test_mount_refuses_device_mounted_elsewhere() {
    let engine = engine_with_mount("/media/usb\n");
    let err = engine
        .mount(Path::new(ROOT_DEVICE), Path::new(MOUNT_POINT), None, None)
        .await
        .unwrap_err();
    match err {
        DiskError::MountedElsewhere { existing, requested, .. } => {
            assert_eq!(existing, PathBuf::from("/media/usb"));
            assert_eq!(requested, PathBuf::from(MOUNT_POINT));
        }
        other => panic!("expected MountedElsewhere, got {other:?}"),
    }
}

#[tokio::test]
async fn test_failed_mount_carries_diagnostics() {
    let engine = engine(
        ScriptedExecutor::new()
            .on("mount ", CommandOutput::failed(32, "wrong fs type, bad option"))
            .on("blkid", CommandOutput::ok("btrfs\n"))
            .on("dmesg", CommandOutput::ok("[ 12.0] BTRFS error: bad superblock\n")),
    );
    let err = engine
        .mount(Path::new(ROOT_DEVICE), Path::new(MOUNT_POINT), None, None)
        .await
        .unwrap_err();
    match err {
        DiskError::MountFailed { error, diagnostics, .. } => {
            assert!(error.contains("wrong fs type"));
            assert!(diagnostics.contains("filesystem type: btrfs"));
            assert!(diagnostics.contains("bad superblock"));
        }
        other => panic!("expected MountFailed, got {other:?}"),
    }
}

#[tokio::test]
async fn test_busy_unmount_falls_back_to_lazy() {
    let engine = engine(ScriptedExecutor::new().on("umount -- ", CommandOutput::failed(32, "target is busy")));
    assert!(engine.unmount(Path::new(MOUNT_POINT)).await.unwrap());
    assert!(engine.executor().ran("umount -l -- /mnt/node1"));
    assert!(!engine.executor().ran("umount -f"));
}

#[tokio::test]
async fn test_unmount_of_nothing_is_a_no_op() {
    let engine = engine(ScriptedExecutor::new().on("mountpoint -q", CommandOutput::failed(1, "")));
    assert!(!engine.unmount(Path::new(MOUNT_POINT)).await.unwrap());
    assert!(!engine.executor().ran("umount"));
}

#[tokio::test]
async fn test_unmount_gives_up_after_forced_attempt() {
    let engine = engine(ScriptedExecutor::new().on("umount", CommandOutput::failed(32, "target is busy")));
    let err = engine.unmount(Path::new(MOUNT_POINT)).await.unwrap_err();
    assert!(matches!(err, DiskError::UnmountFailed { .. }));
    assert_eq!(engine.executor().count("umount"), 3);
}

#[tokio::test]
async fn test_session_releases_after_body_error() {
    let engine = engine(ScriptedExecutor::new().on("kpartx -av", kpartx_two_partitions()));
    let result: Result<(), DiskError> = with_mounted_image(&engine, image(), Path::new(MOUNT_POINT), |root| async move {
        assert_eq!(root, PathBuf::from(MOUNT_POINT));
        Err(DiskError::ListingParse {
            line: "garbage".to_string(),
        })
    })
    .await;

    assert!(matches!(result, Err(DiskError::ListingParse { .. })));
    let exec = engine.executor();
    let umount = exec.position("umount -- /mnt/node1").expect("unmounted");
    let unmap = exec.position("kpartx -dv").expect("unmapped");
    assert!(umount < unmap);
    assert!(engine.mapping(image()).is_none());
}

#[tokio::test]
async fn test_session_unmaps_when_mount_fails() {
    let engine = engine(
        ScriptedExecutor::new()
            .on("kpartx -av", kpartx_two_partitions())
            .on("mount ", CommandOutput::failed(32, "unknown filesystem type")),
    );
    let result: Result<(), DiskError> =
        with_mounted_image(&engine, image(), Path::new(MOUNT_POINT), |_| async { Ok(()) }).await;
    assert!(matches!(result, Err(DiskError::MountFailed { .. })));
    assert!(engine.executor().ran("kpartx -dv"));
    assert!(!engine.executor().ran("umount"));
}
