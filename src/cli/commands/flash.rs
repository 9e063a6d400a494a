//! CLI command for `nodeprov flash`

use anyhow::{Context as _, Result};
use tokio::sync::mpsc;

use super::provision::watch_flash;
use super::Context;
use crate::cli::output::{is_json, print_detail, print_json, print_success};
use crate::core::boot::{BootOptions, BootVerifier};
use crate::core::flash::{FlashOptions, FlashOrchestrator};
use crate::core::pipeline::Stage;

/// Execute the flash command
pub async fn execute(ctx: &Context, node: u32, image: &str) -> Result<()> {
    let controller = ctx.controller()?;
    let mut state = ctx.open_state()?;

    // Console output from before the flash must not count towards a later
    // boot verification
    let verifier = BootVerifier::new(controller.as_ref(), BootOptions::from(&ctx.config.boot));
    if let Err(e) = verifier.reset_console(node).await {
        tracing::warn!(node, "could not reset console: {}", e);
    }

    let (tx, rx) = mpsc::unbounded_channel();
    let watcher = tokio::spawn(watch_flash(node, rx));
    let orchestrator = FlashOrchestrator::new(controller.as_ref(), FlashOptions::from(&ctx.config.flash))
        .with_cancel(ctx.cancel.clone())
        .with_progress(tx);
    let result = orchestrator.run(node, image).await;
    drop(orchestrator);
    let _ = watcher.await;

    let error = result.as_ref().err().map(ToString::to_string);
    state.record(node, &Stage::Flash.to_string(), None, error)?;
    state.close()?;

    let report = result.with_context(|| format!("Flashing node {node} failed"))?;
    if is_json() {
        return print_json(&report);
    }
    print_success(&format!("Node {node} flashed and powered on"));
    print_detail(&format!("Flash took {}s", report.flash_duration.as_secs()));
    Ok(())
}
