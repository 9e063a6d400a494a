//! Provisioning pipeline
//!
//! Runs the stages for one node strictly in order, each starting only after
//! the previous one succeeded:
//!
//! ```text
//! decompress -> customize -> compress -> transfer -> flash -> verify-boot -> set-password
//! ```
//!
//! Every stage records its outcome in the [`StateStore`]. Local executor
//! resources are released on every exit path.

use serde::Serialize;
use std::fmt;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

use crate::core::boot::{BootOptions, BootReport, BootStatus, BootVerifier};
use crate::core::compress::{self, Compression, CompressionStats, ImageArtifact};
use crate::core::controller::Controller;
use crate::core::disk::{with_mounted_image, DiskEngine};
use crate::core::flash::{FlashOptions, FlashOrchestrator, FlashProgress, FlashReport};
use crate::core::interactive::{PasswordChangeOptions, PasswordChanger, SessionOpener};
use crate::core::network::{self, InjectOutcome, NetworkIdentity};
use crate::core::state::StateStore;
use crate::core::transfer::{ImageTransfer, RemoteTransport, TransferDescriptor};
use crate::error::{ConfigError, ProvisionError};
use crate::infra::dirs::ProvisionDirs;
use crate::infra::executor::CommandExecutor;

/// Pipeline stage names, as recorded in the state store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Stage {
    Decompress,
    Customize,
    Compress,
    Transfer,
    Flash,
    VerifyBoot,
    SetPassword,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Decompress => "decompress",
            Stage::Customize => "customize",
            Stage::Compress => "compress",
            Stage::Transfer => "transfer",
            Stage::Flash => "flash",
            Stage::VerifyBoot => "verify-boot",
            Stage::SetPassword => "set-password",
        };
        f.write_str(name)
    }
}

/// Everything one provisioning run needs
#[derive(Debug, Clone, PartialEq)]
pub struct ProvisionRequest {
    /// Source image
    pub image: PathBuf,
    pub node: u32,
    /// Identity written into the guest
    pub identity: NetworkIdentity,
    /// Password set on first boot
    pub new_password: Option<String>,
    /// Ship `image` as-is instead of customizing a working copy
    pub skip_customize: bool,
    /// Stop after the transfer
    pub skip_flash: bool,
    /// Leave the first-boot password unchanged
    pub skip_password: bool,
}

impl ProvisionRequest {
    pub fn new(image: impl Into<PathBuf>, node: u32, identity: NetworkIdentity) -> Self {
        Self {
            image: image.into(),
            node,
            identity,
            new_password: None,
            skip_customize: false,
            skip_flash: false,
            skip_password: false,
        }
    }

    pub fn with_new_password(mut self, password: impl Into<String>) -> Self {
        self.new_password = Some(password.into());
        self
    }
}

/// Result of a provisioning run
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProvisionReport {
    pub node: u32,
    /// Final boot status, when boot was verified
    pub boot_status: Option<BootStatus>,
    pub flashed: bool,
    pub password_changed: bool,
    /// Path flashed from on the controller
    pub remote_image: Option<String>,
    pub transfer: Option<TransferDescriptor>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flash: Option<FlashReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub boot: Option<BootReport>,
}

/// Output of the local stages
#[derive(Debug, Clone, PartialEq)]
pub struct CustomizedImage {
    pub artifact: ImageArtifact,
    pub injected: InjectOutcome,
    pub stats: CompressionStats,
}

impl CustomizedImage {
    /// File to ship to the controller
    pub fn upload_path(&self) -> &Path {
        self.artifact
            .compressed
            .as_deref()
            .unwrap_or(&self.artifact.decompressed)
    }
}

/// Local stages: decompress, inject identity, recompress
pub struct Customizer {
    local: Arc<dyn CommandExecutor>,
    dirs: ProvisionDirs,
    cancel: CancellationToken,
}

impl Customizer {
    pub fn new(local: Arc<dyn CommandExecutor>, dirs: ProvisionDirs) -> Self {
        Self {
            local,
            dirs,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Run the local stages, recording each one
    pub async fn customize(
        &self,
        image: &Path,
        node: u32,
        identity: &NetworkIdentity,
        state: &mut StateStore,
    ) -> Result<CustomizedImage, ProvisionError> {
        let ip = identity.address;
        identity.validate()?;

        self.checkpoint(Stage::Decompress)?;
        let work_dir = self.dirs.node_work_dir(node);
        let result = compress::decompress(self.local.as_ref(), image, &work_dir)
            .await
            .map_err(ProvisionError::from);
        let mut artifact = record(state, node, Stage::Decompress, None, result)?;

        self.checkpoint(Stage::Customize)?;
        let engine = DiskEngine::new(self.local.clone()).with_cancel(self.cancel.clone());
        let mount_point = self.dirs.node_mount_dir(node);
        let result = with_mounted_image(&engine, &artifact.decompressed, &mount_point, |root| {
            let engine = &engine;
            async move {
                network::inject(engine, &root, identity)
                    .await
                    .map_err(ProvisionError::from)
            }
        })
        .await;
        let injected = record(state, node, Stage::Customize, ip, result)?;

        self.checkpoint(Stage::Compress)?;
        let result = compress::compress(self.local.as_ref(), &mut artifact, Compression::Xz)
            .await
            .map_err(ProvisionError::from);
        let stats = record(state, node, Stage::Compress, None, result)?;

        Ok(CustomizedImage {
            artifact,
            injected,
            stats,
        })
    }

    /// Release the local executor's resources
    pub async fn release(&self) {
        if let Err(e) = self.local.release().await {
            tracing::warn!(backend = %self.local.backend(), "failed to release executor: {}", e);
        }
    }

    fn checkpoint(&self, stage: Stage) -> Result<(), ProvisionError> {
        checkpoint(&self.cancel, stage)
    }
}

/// Full provisioning pipeline for one node
pub struct Pipeline {
    customizer: Customizer,
    transfer: ImageTransfer<Arc<dyn RemoteTransport>>,
    controller: Arc<dyn Controller>,
    opener: Option<Arc<dyn SessionOpener>>,
    flash: FlashOptions,
    boot: BootOptions,
    password: PasswordChangeOptions,
    progress: Option<UnboundedSender<FlashProgress>>,
    cancel: CancellationToken,
}

impl Pipeline {
    pub fn new(
        customizer: Customizer,
        transfer: ImageTransfer<Arc<dyn RemoteTransport>>,
        controller: Arc<dyn Controller>,
    ) -> Self {
        Self {
            customizer,
            transfer,
            controller,
            opener: None,
            flash: FlashOptions::default(),
            boot: BootOptions::default(),
            password: PasswordChangeOptions::default(),
            progress: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Session opener used for the first-boot password change
    pub fn with_session_opener(mut self, opener: Arc<dyn SessionOpener>) -> Self {
        self.opener = Some(opener);
        self
    }

    pub fn with_flash_options(mut self, options: FlashOptions) -> Self {
        self.flash = options;
        self
    }

    pub fn with_boot_options(mut self, options: BootOptions) -> Self {
        self.boot = options;
        self
    }

    pub fn with_password_options(mut self, options: PasswordChangeOptions) -> Self {
        self.password = options;
        self
    }

    pub fn with_flash_progress(mut self, sender: UnboundedSender<FlashProgress>) -> Self {
        self.progress = Some(sender);
        self
    }

    /// The token is shared with every stage; the customizer and transfer
    /// engine should be built with the same one
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Run every requested stage; local resources are released however the
    /// run ends
    pub async fn run(
        &self,
        request: &ProvisionRequest,
        state: &mut StateStore,
    ) -> Result<ProvisionReport, ProvisionError> {
        tracing::info!(node = request.node, image = %request.image.display(), "provisioning node");
        let result = self.run_stages(request, state).await;
        self.customizer.release().await;
        match &result {
            Ok(report) => tracing::info!(node = request.node, flashed = report.flashed, password_changed = report.password_changed, "provisioning finished"),
            Err(e) => tracing::warn!(node = request.node, "provisioning failed: {}", e),
        }
        result
    }

    async fn run_stages(
        &self,
        request: &ProvisionRequest,
        state: &mut StateStore,
    ) -> Result<ProvisionReport, ProvisionError> {
        let node = request.node;
        let changes_password = !request.skip_password && !request.skip_flash;
        let new_password = match (changes_password, &request.new_password) {
            (false, _) => None,
            (true, Some(password)) => Some(password.as_str()),
            (true, None) => {
                return Err(ConfigError::Missing {
                    key: "password.new".to_string(),
                }
                .into())
            }
        };
        let mut report = ProvisionReport {
            node,
            ..ProvisionReport::default()
        };

        let upload = if request.skip_customize {
            request.image.clone()
        } else {
            let customized = self
                .customizer
                .customize(&request.image, node, &request.identity, state)
                .await?;
            customized.upload_path().to_path_buf()
        };

        checkpoint(&self.cancel, Stage::Transfer)?;
        let result = self.ship(&upload, node).await;
        let (descriptor, remote_image) = record(state, node, Stage::Transfer, None, result)?;
        report.transfer = Some(descriptor);
        report.remote_image = Some(remote_image.clone());

        if request.skip_flash {
            return Ok(report);
        }

        checkpoint(&self.cancel, Stage::Flash)?;
        let verifier = BootVerifier::new(self.controller.as_ref(), self.boot).with_cancel(self.cancel.clone());
        let result = self.flash_node(&verifier, node, &remote_image).await;
        report.flash = Some(record(state, node, Stage::Flash, None, result)?);
        report.flashed = true;

        checkpoint(&self.cancel, Stage::VerifyBoot)?;
        let result = verifier.verify(node).await.map_err(ProvisionError::from);
        let boot = record(state, node, Stage::VerifyBoot, None, result)?;
        report.boot_status = Some(boot.status);
        report.boot = Some(boot);

        if let Some(new_password) = new_password {
            checkpoint(&self.cancel, Stage::SetPassword)?;
            let result = self.change_password(new_password).await;
            record(state, node, Stage::SetPassword, None, result)?;
            report.password_changed = true;
        }

        Ok(report)
    }

    /// Transfer the artifact and make the flashable image available
    async fn ship(&self, upload: &Path, node: u32) -> Result<(TransferDescriptor, String), ProvisionError> {
        let descriptor = self.transfer.transfer(upload, node).await?;
        let remote_image = self.transfer.prepare_flash_image(&descriptor.remote).await?;
        Ok((descriptor, remote_image))
    }

    async fn flash_node(
        &self,
        verifier: &BootVerifier<'_, dyn Controller>,
        node: u32,
        remote_image: &str,
    ) -> Result<FlashReport, ProvisionError> {
        // Output buffered before the flash belongs to the previous boot
        verifier.reset_console(node).await?;
        let mut orchestrator =
            FlashOrchestrator::new(self.controller.as_ref(), self.flash).with_cancel(self.cancel.clone());
        if let Some(sender) = &self.progress {
            orchestrator = orchestrator.with_progress(sender.clone());
        }
        Ok(orchestrator.run(node, remote_image).await?)
    }

    async fn change_password(&self, new_password: &str) -> Result<u32, ProvisionError> {
        let opener = self.opener.clone().ok_or_else(|| ConfigError::Missing {
            key: "node address for password change".to_string(),
        })?;
        let changer = PasswordChanger::new(opener, new_password, self.password.clone())
            .with_cancel(self.cancel.clone());
        Ok(changer.change().await?)
    }
}

fn checkpoint(cancel: &CancellationToken, stage: Stage) -> Result<(), ProvisionError> {
    if cancel.is_cancelled() {
        return Err(ProvisionError::Cancelled {
            stage: stage.to_string(),
        });
    }
    tracing::debug!(stage = %stage, "stage starting");
    Ok(())
}

/// Record a stage outcome, passing the result through
///
/// A failure to write the state file is logged and never replaces the
/// stage's own result.
fn record<T>(
    state: &mut StateStore,
    node: u32,
    stage: Stage,
    ip: Option<Ipv4Addr>,
    result: Result<T, ProvisionError>,
) -> Result<T, ProvisionError> {
    let error = result.as_ref().err().map(|e| e.to_string());
    let ip = if error.is_none() { ip } else { None };
    if let Err(e) = state.record(node, &stage.to_string(), ip, error) {
        tracing::warn!(node, stage = %stage, "failed to record state: {}", e);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_names() {
        assert_eq!(Stage::VerifyBoot.to_string(), "verify-boot");
        assert_eq!(Stage::SetPassword.to_string(), "set-password");
    }

    #[test]
    fn test_checkpoint_observes_cancel() {
        let cancel = CancellationToken::new();
        assert!(checkpoint(&cancel, Stage::Flash).is_ok());
        cancel.cancel();
        assert!(matches!(
            checkpoint(&cancel, Stage::Flash),
            Err(ProvisionError::Cancelled { stage }) if stage == "flash"
        ));
    }

    #[test]
    fn test_upload_path_prefers_compressed() {
        let mut artifact = ImageArtifact {
            source: PathBuf::from("/src/node1.img.xz"),
            decompressed: PathBuf::from("/work/1/node1.img"),
            compressed: None,
            size: 10,
        };
        let customized = CustomizedImage {
            artifact: artifact.clone(),
            injected: InjectOutcome::Skipped(vec!["hostname"]),
            stats: CompressionStats::default(),
        };
        assert_eq!(customized.upload_path(), Path::new("/work/1/node1.img"));
        artifact.compressed = Some(PathBuf::from("/work/1/node1.img.xz"));
        let customized = CustomizedImage { artifact, ..customized };
        assert_eq!(customized.upload_path(), Path::new("/work/1/node1.img.xz"));
    }
}
