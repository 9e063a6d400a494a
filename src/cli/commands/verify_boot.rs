//! CLI command for `nodeprov verify-boot`

use anyhow::{Context as _, Result};

use super::Context;
use crate::cli::output::{create_spinner, is_json, print_detail, print_json, print_success};
use crate::core::boot::{BootOptions, BootVerifier};
use crate::core::pipeline::Stage;

/// Execute the verify-boot command
pub async fn execute(ctx: &Context, node: u32, reset: bool) -> Result<()> {
    let controller = ctx.controller()?;
    let verifier =
        BootVerifier::new(controller.as_ref(), BootOptions::from(&ctx.config.boot)).with_cancel(ctx.cancel.clone());
    if reset {
        verifier
            .reset_console(node)
            .await
            .with_context(|| format!("Failed to reset console for node {node}"))?;
    }

    let spinner = create_spinner(&format!("Waiting for node {node} to boot"));
    let result = verifier.verify(node).await;
    spinner.finish_and_clear();

    let mut state = ctx.open_state()?;
    let error = result.as_ref().err().map(ToString::to_string);
    state.record(node, &Stage::VerifyBoot.to_string(), None, error)?;
    state.close()?;

    let report = result.with_context(|| format!("Boot verification for node {node} failed"))?;
    if is_json() {
        return print_json(&report);
    }
    print_success(&format!("Node {node} booted in {}s", report.elapsed.as_secs()));
    let milestones: Vec<String> = report.milestones.iter().map(ToString::to_string).collect();
    print_detail(&format!("Milestones: {}", milestones.join(", ")));
    Ok(())
}
