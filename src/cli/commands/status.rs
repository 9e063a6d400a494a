//! CLI command for `nodeprov status`

use anyhow::Result;

use super::Context;
use crate::cli::output::{is_json, print_detail, print_info, print_json, status as prefix};

/// Execute the status command
pub async fn execute(ctx: &Context, node: Option<u32>) -> Result<()> {
    let store = ctx.open_state()?;
    let statuses = match node {
        Some(id) => store.get(id)?.into_iter().collect(),
        None => store.all()?,
    };

    if is_json() {
        return print_json(&statuses);
    }
    if statuses.is_empty() {
        print_info("No node status recorded yet");
        return Ok(());
    }
    for status in statuses {
        let mark = if status.succeeded() { prefix::SUCCESS } else { prefix::ERROR };
        println!(
            "{mark} node{}: {} at {}",
            status.node,
            status.last_operation,
            status.last_operation_time.format("%Y-%m-%d %H:%M:%S UTC")
        );
        if let Some(ip) = status.last_ip {
            print_detail(&format!("Address: {ip}"));
        }
        if let Some(error) = &status.last_error {
            print_detail(&format!("Error: {error}"));
        }
    }
    Ok(())
}
