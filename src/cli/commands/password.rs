//! CLI command for `nodeprov set-password`

use anyhow::{anyhow, Context as _, Result};
use std::net::Ipv4Addr;

use super::Context;
use crate::cli::output::{create_spinner, is_json, print_json, print_success};
use crate::core::interactive::{PasswordChangeOptions, PasswordChanger};
use crate::core::pipeline::Stage;

/// Execute the set-password command
pub async fn execute(ctx: &Context, node: u32, ip: Option<Ipv4Addr>, new_password: Option<String>) -> Result<()> {
    let address = ip
        .or_else(|| ctx.config.node_identity(node).and_then(|id| id.address))
        .ok_or_else(|| anyhow!("No address for node {node}; pass --ip or set nodes.{node}.address"))?;
    let new_password = ctx
        .new_password(new_password)
        .ok_or_else(|| anyhow!("No new password; pass --new-password or set password.new"))?;

    let changer = PasswordChanger::new(
        ctx.session_opener(address),
        &new_password,
        PasswordChangeOptions::from(&ctx.config.password),
    )
    .with_cancel(ctx.cancel.clone());

    let spinner = create_spinner(&format!("Changing password on {address}"));
    let result = changer.change().await;
    spinner.finish_and_clear();

    let mut state = ctx.open_state()?;
    let error = result.as_ref().err().map(ToString::to_string);
    state.record(node, &Stage::SetPassword.to_string(), Some(address), error)?;
    state.close()?;

    let attempts = result.with_context(|| format!("Password change on node {node} failed"))?;
    if is_json() {
        return print_json(&serde_json::json!({
            "node": node,
            "address": address,
            "password_changed": true,
            "attempts": attempts,
        }));
    }
    print_success(&format!("Password changed on node {node} ({attempts} attempt(s))"));
    Ok(())
}
