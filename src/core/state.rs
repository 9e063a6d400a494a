//! Node status store
//!
//! A JSON document mapping node ids to the outcome of the last operation
//! against them. The file is rewritten atomically after every record, so
//! a crash leaves either the old or the new content.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use crate::error::StateError;
use crate::infra::filesystem;

/// Last known status of one node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStatus {
    pub node: u32,
    /// Address assigned by the last customization
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_ip: Option<Ipv4Addr>,
    /// Name of the last operation, such as `flash` or `verify-boot`
    pub last_operation: String,
    pub last_operation_time: DateTime<Utc>,
    /// Error of the last operation, if it failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl NodeStatus {
    pub fn succeeded(&self) -> bool {
        self.last_error.is_none()
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StateFile {
    #[serde(default)]
    nodes: BTreeMap<u32, NodeStatus>,
}

/// Handle to the status file
///
/// Opened explicitly and passed to whoever records into it.
#[derive(Debug)]
pub struct StateStore {
    path: PathBuf,
    state: StateFile,
    closed: bool,
}

impl StateStore {
    /// Open the store at `path`; a missing file is an empty store
    pub fn open(path: &Path) -> Result<Self, StateError> {
        let state = if path.exists() {
            let content = std::fs::read_to_string(path).map_err(|e| StateError::Read {
                path: path.to_path_buf(),
                error: e.to_string(),
            })?;
            if content.trim().is_empty() {
                StateFile::default()
            } else {
                serde_json::from_str(&content).map_err(|e| StateError::Parse {
                    path: path.to_path_buf(),
                    error: e.to_string(),
                })?
            }
        } else {
            StateFile::default()
        };

        tracing::debug!(path = %path.display(), nodes = state.nodes.len(), "opened state store");
        Ok(Self {
            path: path.to_path_buf(),
            state,
            closed: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record the outcome of `operation` on `node` and persist it
    ///
    /// `last_ip` is kept from the previous record when `ip` is `None`.
    pub fn record(
        &mut self,
        node: u32,
        operation: &str,
        ip: Option<Ipv4Addr>,
        error: Option<String>,
    ) -> Result<&NodeStatus, StateError> {
        self.ensure_open()?;
        let last_ip = ip.or_else(|| self.state.nodes.get(&node).and_then(|s| s.last_ip));
        let status = NodeStatus {
            node,
            last_ip,
            last_operation: operation.to_string(),
            last_operation_time: Utc::now(),
            last_error: error,
        };
        self.state.nodes.insert(node, status);
        self.persist()?;
        self.state.nodes.get(&node).ok_or_else(|| StateError::Write {
            path: self.path.clone(),
            error: format!("node {node} missing after insert"),
        })
    }

    /// Status of one node
    pub fn get(&self, node: u32) -> Result<Option<&NodeStatus>, StateError> {
        self.ensure_open()?;
        Ok(self.state.nodes.get(&node))
    }

    /// All recorded nodes in id order
    pub fn all(&self) -> Result<Vec<&NodeStatus>, StateError> {
        self.ensure_open()?;
        Ok(self.state.nodes.values().collect())
    }

    /// Flush and release the store; further use fails with
    /// [`StateError::Closed`]
    pub fn close(&mut self) -> Result<(), StateError> {
        if self.closed {
            return Ok(());
        }
        self.persist()?;
        self.closed = true;
        Ok(())
    }

    fn ensure_open(&self) -> Result<(), StateError> {
        if self.closed {
            return Err(StateError::Closed {
                path: self.path.clone(),
            });
        }
        Ok(())
    }

    fn persist(&self) -> Result<(), StateError> {
        let content = serde_json::to_string_pretty(&self.state).map_err(|e| StateError::Write {
            path: self.path.clone(),
            error: e.to_string(),
        })?;
        filesystem::write_file_atomic(&self.path, content.as_bytes()).map_err(|e| StateError::Write {
            path: self.path.clone(),
            error: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_is_empty() {
        let temp = TempDir::new().unwrap();
        let store = StateStore::open(&temp.path().join("nodes.json")).unwrap();
        assert!(store.all().unwrap().is_empty());
        assert!(store.get(1).unwrap().is_none());
    }

    #[test]
    fn test_record_keeps_previous_ip() {
        let temp = TempDir::new().unwrap();
        let mut store = StateStore::open(&temp.path().join("nodes.json")).unwrap();
        let ip: Ipv4Addr = "192.168.1.101".parse().unwrap();
        store.record(1, "customize", Some(ip), None).unwrap();
        let status = store
            .record(1, "flash", None, Some("timed out".to_string()))
            .unwrap();
        assert_eq!(status.last_ip, Some(ip));
        assert_eq!(status.last_operation, "flash");
        assert!(!status.succeeded());
    }

    #[test]
    fn test_closed_store_rejects_use() {
        let temp = TempDir::new().unwrap();
        let mut store = StateStore::open(&temp.path().join("nodes.json")).unwrap();
        store.close().unwrap();
        store.close().unwrap();
        assert!(matches!(store.get(1), Err(StateError::Closed { .. })));
        assert!(matches!(
            store.record(1, "flash", None, None),
            Err(StateError::Closed { .. })
        ));
    }

    #[test]
    fn test_invalid_file_is_parse_error() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nodes.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(StateStore::open(&path), Err(StateError::Parse { .. })));
    }
}
