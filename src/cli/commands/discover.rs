//! CLI command for `nodeprov discover`

use anyhow::Result;
use std::time::Duration;

use super::Context;
use crate::cli::output::{create_spinner, is_json, print_json, status};
use crate::config::defaults;
use crate::core::discovery::{discover, probe_node};

/// Connect timeout for the ssh port probe
const PORT_PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// Execute the discover command
pub async fn execute(ctx: &Context, max_node: Option<u32>, concurrency: Option<usize>) -> Result<()> {
    let controller = ctx.controller()?;
    let max_node = max_node.unwrap_or(defaults::DISCOVERY_MAX_NODE);
    let concurrency = concurrency.unwrap_or(defaults::DISCOVERY_CONCURRENCY);
    let nodes: Vec<u32> = (1..=max_node).collect();

    let spinner = create_spinner(&format!("Probing {} node(s)", nodes.len()));
    let results = discover(
        nodes,
        |node| {
            let controller = controller.clone();
            let identity = ctx.config.node_identity(node).cloned();
            async move {
                probe_node(
                    controller.as_ref(),
                    node,
                    identity.as_ref(),
                    defaults::DEFAULT_SSH_PORT,
                    PORT_PROBE_TIMEOUT,
                )
                .await
            }
        },
        concurrency,
        &ctx.cancel,
    )
    .await?;
    spinner.finish_and_clear();

    if is_json() {
        let found: Vec<_> = results.iter().filter_map(|p| p.outcome.as_ref().ok()).collect();
        return print_json(&found);
    }
    for probed in &results {
        match &probed.outcome {
            Ok(node) => {
                let power = node.power.map(|p| p.to_string()).unwrap_or_else(|| "unknown".to_string());
                let address = node.address.map(|a| a.to_string()).unwrap_or_else(|| "-".to_string());
                let ssh = if node.ssh_reachable { "ssh up" } else { "ssh down" };
                println!("{} node{}: power {power}, {address}, {ssh}", status::SUCCESS, node.node);
            }
            Err(error) => println!("{} node{}: {error}", status::ERROR, probed.target),
        }
    }
    Ok(())
}
