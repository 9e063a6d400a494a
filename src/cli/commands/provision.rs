//! CLI commands for `nodeprov provision` and `nodeprov customize`

use anyhow::{Context as _, Result};
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;

use super::{absolute_input, Context, IdentityArgs};
use crate::cli::output::{create_spinner, is_json, print_detail, print_json, print_success, print_warning};
use crate::core::boot::BootOptions;
use crate::core::flash::{FlashOptions, FlashProgress};
use crate::core::interactive::PasswordChangeOptions;
use crate::core::network::InjectOutcome;
use crate::core::pipeline::{Customizer, Pipeline, ProvisionRequest};
use crate::infra::executor::BackendChoice;

/// Arguments for `provision`
#[derive(Debug, Clone)]
pub struct ProvisionArgs {
    pub image: PathBuf,
    pub node: u32,
    pub identity: IdentityArgs,
    pub new_password: Option<String>,
    pub backend: Option<BackendChoice>,
    pub skip_customize: bool,
    pub skip_flash: bool,
    pub skip_password: bool,
}

/// Execute the provision command
pub async fn execute(ctx: &Context, args: ProvisionArgs) -> Result<()> {
    let identity = args.identity.resolve(ctx.config.node_identity(args.node));
    let cwd = std::env::current_dir().context("Failed to determine current directory")?;
    let image = absolute_input(&args.image, &cwd);
    let mut request = ProvisionRequest::new(&image, args.node, identity.clone());
    request.new_password = ctx.new_password(args.new_password);
    request.skip_customize = args.skip_customize;
    request.skip_flash = args.skip_flash;
    request.skip_password = args.skip_password;

    let transfer = ctx.transfer()?;
    let controller = ctx.controller()?;
    let mut state = ctx.open_state()?;
    // Created last: the pipeline releases it on every exit path from here on
    let local = ctx.local_executor(args.backend, &[image.clone()]).await?;
    let customizer = Customizer::new(local, ctx.dirs.clone()).with_cancel(ctx.cancel.clone());
    let (progress_tx, progress_rx) = mpsc::unbounded_channel();
    let mut pipeline = Pipeline::new(customizer, transfer, controller)
        .with_flash_options(FlashOptions::from(&ctx.config.flash))
        .with_boot_options(BootOptions::from(&ctx.config.boot))
        .with_password_options(PasswordChangeOptions::from(&ctx.config.password))
        .with_flash_progress(progress_tx)
        .with_cancel(ctx.cancel.clone());
    if let Some(address) = identity.address {
        pipeline = pipeline.with_session_opener(ctx.session_opener(address));
    }

    let watcher = tokio::spawn(watch_flash(args.node, progress_rx));
    let result = pipeline.run(&request, &mut state).await;
    // Dropping the pipeline closes the progress channel and ends the watcher
    drop(pipeline);
    let _ = watcher.await;
    if let Err(e) = state.close() {
        tracing::warn!("failed to close state store: {}", e);
    }

    let report = result.with_context(|| format!("Provisioning node {} failed", args.node))?;
    if is_json() {
        return print_json(&report);
    }
    print_success(&format!("Node {} provisioned", args.node));
    if let Some(remote) = &report.remote_image {
        print_detail(&format!("Image: {remote}"));
    }
    if let Some(status) = report.boot_status {
        print_detail(&format!("Boot: {status}"));
    }
    if report.password_changed {
        print_detail("Password changed");
    }
    Ok(())
}

/// Execute the customize command
pub async fn execute_customize(
    ctx: &Context,
    image: &Path,
    node: u32,
    identity: &IdentityArgs,
    backend: Option<BackendChoice>,
) -> Result<()> {
    let identity = identity.resolve(ctx.config.node_identity(node));
    let cwd = std::env::current_dir().context("Failed to determine current directory")?;
    let image = absolute_input(image, &cwd);
    let mut state = ctx.open_state()?;
    let local = ctx.local_executor(backend, &[image.clone()]).await?;
    let customizer = Customizer::new(local, ctx.dirs.clone()).with_cancel(ctx.cancel.clone());

    let spinner = create_spinner(&format!("Customizing {}", image.display()));
    let result = customizer.customize(&image, node, &identity, &mut state).await;
    customizer.release().await;
    spinner.finish_and_clear();
    if let Err(e) = state.close() {
        tracing::warn!("failed to close state store: {}", e);
    }

    let customized = result.with_context(|| format!("Customizing image for node {node} failed"))?;
    if is_json() {
        return print_json(&serde_json::json!({
            "node": node,
            "artifact": customized.artifact,
            "original_size": customized.stats.original_size,
            "compressed_size": customized.stats.compressed_size,
        }));
    }
    if let InjectOutcome::Skipped(missing) = &customized.injected {
        print_warning(&format!("Network identity not injected, missing: {}", missing.join(", ")));
    }
    print_success(&format!("Customized image ready: {}", customized.upload_path().display()));
    print_detail(&format!(
        "{} -> {} bytes ({:.1}% saved)",
        customized.stats.original_size,
        customized.stats.compressed_size,
        customized.stats.ratio()
    ));
    Ok(())
}

/// Drive a spinner from flash progress events until the channel closes
pub async fn watch_flash(node: u32, mut events: mpsc::UnboundedReceiver<FlashProgress>) {
    let mut spinner = None;
    while let Some(event) = events.recv().await {
        match event {
            FlashProgress::Phase { phase, .. } => {
                let bar = spinner.get_or_insert_with(|| create_spinner(&format!("Node {node}: {phase}")));
                bar.set_message(format!("Node {node}: {phase}"));
            }
            FlashProgress::Heartbeat { elapsed, .. } => {
                if let Some(bar) = &spinner {
                    bar.set_message(format!("Node {node}: flashing ({}s)", elapsed.as_secs()));
                }
            }
        }
    }
    if let Some(bar) = spinner {
        bar.finish_and_clear();
    }
}
