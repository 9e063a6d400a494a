//! Scoped map + mount session
//!
//! [`MountedImage`] owns one mapping and one mount. [`with_mounted_image`]
//! runs a body against the mounted root and releases both on every exit
//! path; a body error wins over a cleanup error.

use std::future::Future;
use std::path::{Path, PathBuf};

use super::{DiskEngine, UnmapReport};
use crate::error::DiskError;
use crate::infra::executor::{CommandExecutor, CommandRequest};

/// An image whose root partition is mapped and mounted
pub struct MountedImage<'a, E: CommandExecutor> {
    engine: &'a DiskEngine<E>,
    image: PathBuf,
    device: PathBuf,
    mount_point: PathBuf,
    released: bool,
}

impl<'a, E: CommandExecutor> MountedImage<'a, E> {
    /// Map `image` and mount its root partition at `mount_point`
    ///
    /// If the mount fails the mapping is released before returning.
    pub async fn open(
        engine: &'a DiskEngine<E>,
        image: &Path,
        mount_point: &Path,
    ) -> Result<MountedImage<'a, E>, DiskError> {
        let device = engine.map_partitions(image).await?;
        if let Err(e) = engine.mount(&device, mount_point, None, None).await {
            if let Err(cleanup) = engine.unmap_partitions(image).await {
                tracing::warn!(image = %image.display(), "unmap after failed mount: {}", cleanup);
            }
            return Err(e);
        }
        Ok(MountedImage {
            engine,
            image: image.to_path_buf(),
            device,
            mount_point: mount_point.to_path_buf(),
            released: false,
        })
    }

    /// Guest root directory
    pub fn root(&self) -> &Path {
        &self.mount_point
    }

    /// Mapped root partition device
    pub fn device(&self) -> &Path {
        &self.device
    }

    /// The engine this session runs on
    pub fn engine(&self) -> &'a DiskEngine<E> {
        self.engine
    }

    /// Flush, unmount and unmap
    ///
    /// Unmap is attempted even when unmount fails; the unmount error is
    /// returned in that case.
    pub async fn close(mut self) -> Result<UnmapReport, DiskError> {
        self.released = true;

        let sync = self
            .engine
            .executor()
            .execute(CommandRequest::new(["sync"]).uncancellable())
            .await;
        if let Err(e) = sync {
            tracing::warn!("sync before unmount failed: {}", e);
        }

        let unmounted = self.engine.unmount(&self.mount_point).await;
        let unmapped = self.engine.unmap_partitions(&self.image).await;
        unmounted?;
        unmapped
    }
}

impl<E: CommandExecutor> Drop for MountedImage<'_, E> {
    fn drop(&mut self) {
        if !self.released {
            tracing::warn!(
                image = %self.image.display(),
                mount_point = %self.mount_point.display(),
                "mounted image dropped without close; mapping left in place"
            );
        }
    }
}

/// Mount `image`, run `body` with the guest root, then release everything
pub async fn with_mounted_image<E, F, Fut, T, Er>(
    engine: &DiskEngine<E>,
    image: &Path,
    mount_point: &Path,
    body: F,
) -> Result<T, Er>
where
    E: CommandExecutor,
    F: FnOnce(PathBuf) -> Fut,
    Fut: Future<Output = Result<T, Er>>,
    Er: From<DiskError> + std::fmt::Display,
{
    let session = MountedImage::open(engine, image, mount_point).await?;
    let result = body(session.root().to_path_buf()).await;
    let closed = session.close().await;

    match (result, closed) {
        (Ok(value), Ok(report)) => {
            if !report.is_clean() {
                tracing::warn!(image = %image.display(), residual = ?report.residual, "image released with residual loop devices");
            }
            Ok(value)
        }
        (Ok(_), Err(cleanup)) => Err(cleanup.into()),
        (Err(e), Ok(_)) => Err(e),
        (Err(e), Err(cleanup)) => {
            tracing::warn!(image = %image.display(), "cleanup after failure: {}", cleanup);
            Err(e)
        }
    }
}
