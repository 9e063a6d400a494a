//! Node discovery
//!
//! Probes run concurrently with a fixed bound. [`discover`] returns only
//! once every probe has finished, or fails when the run is cancelled.

use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::future::Future;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::core::controller::{Controller, PowerState};
use crate::core::network::NetworkIdentity;
use crate::error::ProvisionError;

/// Outcome of probing one target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Probed<T, R> {
    pub target: T,
    pub outcome: Result<R, String>,
}

/// Run `probe` for every target, at most `concurrency` at a time
///
/// Results come back in target order.
pub async fn discover<T, R, F, Fut>(
    targets: Vec<T>,
    probe: F,
    concurrency: usize,
    cancel: &CancellationToken,
) -> Result<Vec<Probed<T, R>>, ProvisionError>
where
    T: Clone,
    F: Fn(T) -> Fut,
    Fut: Future<Output = Result<R, String>>,
{
    let probes = stream::iter(targets.into_iter().enumerate())
        .map(|(index, target)| {
            let fut = probe(target.clone());
            async move { (index, Probed { target, outcome: fut.await }) }
        })
        .buffer_unordered(concurrency.max(1))
        .collect::<Vec<_>>();

    let mut results = tokio::select! {
        results = probes => results,
        _ = cancel.cancelled() => {
            return Err(ProvisionError::Cancelled { stage: "discovery".to_string() });
        }
    };
    results.sort_by_key(|(index, _)| *index);
    Ok(results.into_iter().map(|(_, probed)| probed).collect())
}

/// What discovery learned about a node
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiscoveredNode {
    pub node: u32,
    pub power: Option<PowerState>,
    pub address: Option<Ipv4Addr>,
    /// Whether the node's ssh port accepted a connection
    pub ssh_reachable: bool,
}

/// Whether a TCP connection to `addr` succeeds within `timeout`
pub async fn port_open(addr: SocketAddr, timeout: Duration) -> bool {
    matches!(
        tokio::time::timeout(timeout, tokio::net::TcpStream::connect(addr)).await,
        Ok(Ok(_))
    )
}

/// Probe one node's power state and, when an address is known, its ssh
/// port
pub async fn probe_node<C: Controller + ?Sized>(
    controller: &C,
    node: u32,
    identity: Option<&NetworkIdentity>,
    ssh_port: u16,
    timeout: Duration,
) -> Result<DiscoveredNode, String> {
    let power = match controller.power_status(node).await {
        Ok(state) => Some(state),
        Err(e) => {
            tracing::debug!(node, "power status unavailable: {}", e);
            None
        }
    };
    let address = identity.and_then(|id| id.address);
    let ssh_reachable = match address {
        Some(ip) => port_open(SocketAddr::from((ip, ssh_port)), timeout).await,
        None => false,
    };
    if power.is_none() && !ssh_reachable {
        return Err(format!("node {node} did not respond"));
    }
    Ok(DiscoveredNode {
        node,
        power,
        address,
        ssh_reachable,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_results_in_target_order() {
        let cancel = CancellationToken::new();
        let results = discover(
            vec![3u64, 1, 2],
            |n| async move {
                tokio::time::sleep(Duration::from_millis(n * 5)).await;
                if n == 2 {
                    Err("down".to_string())
                } else {
                    Ok(n * 10)
                }
            },
            3,
            &cancel,
        )
        .await
        .unwrap();
        let targets: Vec<u64> = results.iter().map(|p| p.target).collect();
        assert_eq!(targets, vec![3, 1, 2]);
        assert_eq!(results[0].outcome, Ok(30));
        assert!(results[2].outcome.is_err());
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();
        discover(
            (0..8).collect(),
            |_| {
                let active = active.clone();
                let peak = peak.clone();
                async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok::<_, String>(())
                }
            },
            2,
            &cancel,
        )
        .await
        .unwrap();
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_cancel_stops_discovery() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = discover(
            vec![1u32],
            |_| async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok::<_, String>(())
            },
            1,
            &cancel,
        )
        .await;
        assert!(matches!(result, Err(ProvisionError::Cancelled { .. })));
    }
}
