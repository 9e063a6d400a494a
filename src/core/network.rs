//! Network identity injection
//!
//! Writes a static address, hostname and `/etc/hosts` entry into a mounted
//! guest root. The guest layout is detected in order: netplan,
//! systemd-networkd, ifupdown. Rendered files depend only on the identity,
//! so applying the same identity twice leaves identical content.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use crate::core::disk::DiskEngine;
use crate::error::{DiskError, NetworkError};
use crate::infra::executor::CommandExecutor;

/// Netplan file written into the guest
const NETPLAN_FILE: &str = "etc/netplan/50-nodeprov.yaml";
/// systemd-networkd unit written into the guest
const NETWORKD_FILE: &str = "etc/systemd/network/10-nodeprov.network";
/// ifupdown interfaces file
const IFUPDOWN_FILE: &str = "etc/network/interfaces";
/// Stops cloud-init from regenerating netplan config on first boot
const CLOUD_INIT_DISABLE_FILE: &str = "etc/cloud/cloud.cfg.d/99-nodeprov-network.cfg";
/// Interface name used by the ifupdown layout
const IFUPDOWN_INTERFACE: &str = "eth0";

/// Static network identity for one node
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkIdentity {
    pub hostname: Option<String>,
    pub address: Option<Ipv4Addr>,
    pub prefix_len: Option<u8>,
    pub gateway: Option<Ipv4Addr>,
    /// DNS servers in resolution order
    pub dns: Vec<Ipv4Addr>,
}

/// An identity with every field present
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticNetwork {
    pub hostname: String,
    pub address: Ipv4Addr,
    pub prefix_len: u8,
    pub gateway: Ipv4Addr,
    pub dns: Vec<Ipv4Addr>,
}

impl StaticNetwork {
    /// `address/prefix`
    pub fn cidr(&self) -> String {
        format!("{}/{}", self.address, self.prefix_len)
    }

    fn dns_list(&self, sep: &str) -> String {
        self.dns
            .iter()
            .map(Ipv4Addr::to_string)
            .collect::<Vec<_>>()
            .join(sep)
    }
}

impl NetworkIdentity {
    /// Names of the fields that are absent
    pub fn missing_fields(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.hostname.as_deref().map_or(true, str::is_empty) {
            missing.push("hostname");
        }
        if self.address.is_none() {
            missing.push("address");
        }
        if self.prefix_len.is_none() {
            missing.push("prefix_len");
        }
        if self.gateway.is_none() {
            missing.push("gateway");
        }
        if self.dns.is_empty() {
            missing.push("dns");
        }
        missing
    }

    /// Reject values that are present but malformed
    pub fn validate(&self) -> Result<(), NetworkError> {
        if let Some(prefix) = self.prefix_len {
            if prefix > 32 {
                return Err(NetworkError::Invalid {
                    message: format!("prefix length {prefix} exceeds 32"),
                });
            }
        }
        if let Some(hostname) = &self.hostname {
            if !is_valid_hostname(hostname) {
                return Err(NetworkError::Invalid {
                    message: format!("'{hostname}' is not a valid hostname"),
                });
            }
        }
        Ok(())
    }

    /// The complete form, or the missing field names
    pub fn complete(&self) -> Result<StaticNetwork, Vec<&'static str>> {
        let missing = self.missing_fields();
        match (&self.hostname, self.address, self.prefix_len, self.gateway) {
            (Some(hostname), Some(address), Some(prefix_len), Some(gateway)) if missing.is_empty() => {
                Ok(StaticNetwork {
                    hostname: hostname.clone(),
                    address,
                    prefix_len,
                    gateway,
                    dns: self.dns.clone(),
                })
            }
            _ => Err(missing),
        }
    }

    /// Fill fields absent here from `fallback`
    ///
    /// Command-line values layered over the configuration file use this.
    pub fn or(self, fallback: &NetworkIdentity) -> NetworkIdentity {
        NetworkIdentity {
            hostname: self.hostname.or_else(|| fallback.hostname.clone()),
            address: self.address.or(fallback.address),
            prefix_len: self.prefix_len.or(fallback.prefix_len),
            gateway: self.gateway.or(fallback.gateway),
            dns: if self.dns.is_empty() {
                fallback.dns.clone()
            } else {
                self.dns
            },
        }
    }
}

/// RFC 1123 hostname check
pub fn is_valid_hostname(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 253
        && name.split('.').all(|label| {
            !label.is_empty()
                && label.len() <= 63
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        })
}

/// Guest network configuration style
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum NetworkLayout {
    Netplan,
    SystemdNetworkd,
    Ifupdown,
}

impl fmt::Display for NetworkLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetworkLayout::Netplan => write!(f, "netplan"),
            NetworkLayout::SystemdNetworkd => write!(f, "systemd-networkd"),
            NetworkLayout::Ifupdown => write!(f, "ifupdown"),
        }
    }
}

/// Result of an injection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InjectOutcome {
    /// Files were written for this layout
    Applied(NetworkLayout),
    /// Identity was incomplete; nothing was written
    Skipped(Vec<&'static str>),
}

/// Netplan document for the node
pub fn render_netplan(net: &StaticNetwork) -> String {
    format!(
        "# Written by nodeprov\n\
network:\n  version: 2\n  renderer: networkd\n  ethernets:\n    primary:\n      match:\n        name: \"e*\"\n      dhcp4: false\n      addresses:\n        - {cidr}\n      routes:\n        - to: default\n          via: {gateway}\n      nameservers:\n        addresses: [{dns}]\n",
        cidr = net.cidr(),
        gateway = net.gateway,
        dns = net.dns_list(", "),
    )
}

/// systemd-networkd unit for the node
pub fn render_networkd(net: &StaticNetwork) -> String {
    let mut unit = format!(
        "# Written by nodeprov\n[Match]\nName=e*\n\n[Network]\nAddress={}\nGateway={}\n",
        net.cidr(),
        net.gateway
    );
    for server in &net.dns {
        unit.push_str(&format!("DNS={server}\n"));
    }
    unit
}

/// `/etc/network/interfaces` for the node
pub fn render_ifupdown(net: &StaticNetwork) -> String {
    format!(
        "# Written by nodeprov\nauto lo\niface lo inet loopback\n\n\
auto {iface}\niface {iface} inet static\n    address {cidr}\n    gateway {gateway}\n    dns-nameservers {dns}\n",
        iface = IFUPDOWN_INTERFACE,
        cidr = net.cidr(),
        gateway = net.gateway,
        dns = net.dns_list(" "),
    )
}

/// Rewrite `/etc/hosts` so `127.0.1.1` names `hostname`
///
/// Any existing `127.0.1.1` line is replaced; the entry goes right after the
/// `127.0.0.1` line, or first if there is none.
pub fn render_hosts(existing: &str, hostname: &str) -> String {
    let entry = format!("127.0.1.1\t{hostname}");
    let mut lines: Vec<String> = existing
        .lines()
        .filter(|l| l.split_whitespace().next() != Some("127.0.1.1"))
        .map(str::to_string)
        .collect();
    if lines.is_empty() {
        lines.push("127.0.0.1\tlocalhost".to_string());
    }
    let position = lines
        .iter()
        .position(|l| l.split_whitespace().next() == Some("127.0.0.1"))
        .map_or(0, |i| i + 1);
    lines.insert(position, entry);
    let mut out = lines.join("\n");
    out.push('\n');
    out
}

fn guest_path(root: &Path, relative: &str) -> PathBuf {
    root.join(relative)
}

/// Detect which network configuration style the guest uses
pub async fn detect_layout<E: CommandExecutor>(
    engine: &DiskEngine<E>,
    root: &Path,
) -> Result<Option<NetworkLayout>, DiskError> {
    if engine.exists(&guest_path(root, "etc/netplan")).await? {
        return Ok(Some(NetworkLayout::Netplan));
    }
    if engine.exists(&guest_path(root, "etc/systemd/network")).await? {
        return Ok(Some(NetworkLayout::SystemdNetworkd));
    }
    if engine.exists(&guest_path(root, IFUPDOWN_FILE)).await? {
        return Ok(Some(NetworkLayout::Ifupdown));
    }
    Ok(None)
}

/// Write `identity` into the guest mounted at `root`
///
/// An incomplete identity is skipped with a warning naming the missing
/// fields; a malformed one is an error.
pub async fn inject<E: CommandExecutor>(
    engine: &DiskEngine<E>,
    root: &Path,
    identity: &NetworkIdentity,
) -> Result<InjectOutcome, NetworkError> {
    identity.validate()?;
    let net = match identity.complete() {
        Ok(net) => net,
        Err(missing) => {
            tracing::warn!(
                root = %root.display(),
                missing = %missing.join(", "),
                "network identity incomplete, skipping injection"
            );
            return Ok(InjectOutcome::Skipped(missing));
        }
    };

    let write_err = |source: DiskError| NetworkError::Write {
        root: root.to_path_buf(),
        source,
    };

    let layout = detect_layout(engine, root)
        .await
        .map_err(write_err)?
        .ok_or_else(|| NetworkError::UnsupportedLayout {
            root: root.to_path_buf(),
        })?;

    tracing::info!(root = %root.display(), layout = %layout, address = %net.cidr(), hostname = %net.hostname, "injecting network identity");

    match layout {
        NetworkLayout::Netplan => {
            engine
                .write_file(&guest_path(root, NETPLAN_FILE), render_netplan(&net).as_bytes(), Some(0o600))
                .await
                .map_err(write_err)?;
            if engine.exists(&guest_path(root, "etc/cloud")).await.map_err(write_err)? {
                engine
                    .write_file(
                        &guest_path(root, CLOUD_INIT_DISABLE_FILE),
                        b"network: {config: disabled}\n",
                        Some(0o644),
                    )
                    .await
                    .map_err(write_err)?;
            }
        }
        NetworkLayout::SystemdNetworkd => {
            engine
                .write_file(&guest_path(root, NETWORKD_FILE), render_networkd(&net).as_bytes(), Some(0o644))
                .await
                .map_err(write_err)?;
        }
        NetworkLayout::Ifupdown => {
            engine
                .write_file(&guest_path(root, IFUPDOWN_FILE), render_ifupdown(&net).as_bytes(), Some(0o644))
                .await
                .map_err(write_err)?;
        }
    }

    engine
        .write_file(
            &guest_path(root, "etc/hostname"),
            format!("{}\n", net.hostname).as_bytes(),
            Some(0o644),
        )
        .await
        .map_err(write_err)?;

    let hosts_path = guest_path(root, "etc/hosts");
    let existing = if engine.exists(&hosts_path).await.map_err(write_err)? {
        engine.read_to_string(&hosts_path).await.map_err(write_err)?
    } else {
        String::new()
    };
    engine
        .write_file(&hosts_path, render_hosts(&existing, &net.hostname).as_bytes(), Some(0o644))
        .await
        .map_err(write_err)?;

    Ok(InjectOutcome::Applied(layout))
}
