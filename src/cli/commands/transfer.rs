//! CLI command for `nodeprov transfer`

use anyhow::{bail, Context as _, Result};
use std::path::Path;

use super::Context;
use crate::cli::output::{create_spinner, is_json, print_detail, print_json, print_success};
use crate::core::pipeline::Stage;

/// Execute the transfer command
pub async fn execute(ctx: &Context, artifact: &Path, node: u32) -> Result<()> {
    if !artifact.is_file() {
        bail!("Artifact not found: {}", artifact.display());
    }
    let transfer = ctx.transfer()?;
    let mut state = ctx.open_state()?;

    let spinner = create_spinner(&format!("Transferring {} to node {node}", artifact.display()));
    let result = async {
        let descriptor = transfer.transfer(artifact, node).await?;
        let flash_image = transfer.prepare_flash_image(&descriptor.remote).await?;
        Ok::<_, crate::error::TransferError>((descriptor, flash_image))
    }
    .await;
    spinner.finish_and_clear();

    let error = result.as_ref().err().map(ToString::to_string);
    state.record(node, &Stage::Transfer.to_string(), None, error)?;
    state.close()?;

    let (descriptor, flash_image) = result.with_context(|| format!("Transfer to node {node} failed"))?;
    if is_json() {
        return print_json(&serde_json::json!({
            "transfer": descriptor,
            "flash_image": flash_image,
        }));
    }
    match descriptor.strategy {
        Some(strategy) => print_success(&format!(
            "Transferred {} bytes via {strategy} in {} attempt(s)",
            descriptor.size, descriptor.attempts
        )),
        None => print_success("Image already present on the controller"),
    }
    print_detail(&format!("Remote: {}", descriptor.remote));
    print_detail(&format!("Flash image: {flash_image}"));
    Ok(())
}
