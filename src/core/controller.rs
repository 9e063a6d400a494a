//! Controller command surface
//!
//! The controller exposes power, flash, USB mode and serial console access
//! through its `tpi` tool. [`BmcController`] issues those commands through a
//! [`CommandExecutor`], normally a remote shell on the controller.

use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::time::Duration;

use crate::config::defaults;
use crate::error::ControllerError;
use crate::infra::executor::{CommandExecutor, CommandOutput, CommandRequest};

/// Node power state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PowerState {
    On,
    Off,
}

impl fmt::Display for PowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PowerState::On => write!(f, "on"),
            PowerState::Off => write!(f, "off"),
        }
    }
}

/// Node USB/boot mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum UsbMode {
    /// Boot from internal storage
    Normal,
    /// Expose storage to the controller for flashing
    MassStorage,
}

/// Operations the controller offers per node
#[async_trait]
pub trait Controller: Send + Sync {
    async fn power_status(&self, node: u32) -> Result<PowerState, ControllerError>;

    async fn power_on(&self, node: u32) -> Result<(), ControllerError>;

    async fn power_off(&self, node: u32) -> Result<(), ControllerError>;

    /// Flash the image at `remote_path` (a path on the controller)
    async fn flash(&self, node: u32, remote_path: &str) -> Result<(), ControllerError>;

    async fn set_normal_mode(&self, node: u32) -> Result<(), ControllerError>;

    async fn set_mass_storage_mode(&self, node: u32) -> Result<(), ControllerError>;

    /// Read and clear the buffered serial console output
    async fn read_console(&self, node: u32) -> Result<String, ControllerError>;

    /// Run an arbitrary command on the controller
    async fn exec(&self, node: u32, argv: Vec<String>) -> Result<CommandOutput, ControllerError>;

    /// Discard whatever is buffered on the console
    async fn drain_console(&self, node: u32) -> Result<(), ControllerError> {
        self.read_console(node).await.map(|_| ())
    }

    /// Switch the node's USB mode
    async fn set_usb_mode(&self, node: u32, mode: UsbMode) -> Result<(), ControllerError> {
        match mode {
            UsbMode::Normal => self.set_normal_mode(node).await,
            UsbMode::MassStorage => self.set_mass_storage_mode(node).await,
        }
    }
}

/// Parse `tpi power status` output for one node
///
/// Lines look like `node1: on` (older firmware prints `node1: 1`).
pub fn parse_power_status(output: &str, node: u32) -> Option<PowerState> {
    let wanted = format!("node{node}");
    output.lines().find_map(|line| {
        let (name, value) = line.split_once(':')?;
        if !name.trim().eq_ignore_ascii_case(&wanted) {
            return None;
        }
        match value.trim().to_lowercase().as_str() {
            "on" | "1" | "true" => Some(PowerState::On),
            "off" | "0" | "false" => Some(PowerState::Off),
            _ => None,
        }
    })
}

/// `tpi` argument vectors
pub mod commands {
    pub fn power_status() -> Vec<String> {
        argv(&["tpi", "power", "status"])
    }

    pub fn power(node: u32, on: bool) -> Vec<String> {
        let state = if on { "on" } else { "off" };
        argv(&["tpi", "power", state, "--node", &node.to_string()])
    }

    pub fn flash(node: u32, remote_path: &str) -> Vec<String> {
        argv(&[
            "tpi",
            "flash",
            "--local",
            "--image-path",
            remote_path,
            "--node",
            &node.to_string(),
        ])
    }

    pub fn usb(node: u32, mode: super::UsbMode) -> Vec<String> {
        let mode = match mode {
            super::UsbMode::Normal => "device",
            super::UsbMode::MassStorage => "flash",
        };
        argv(&["tpi", "usb", mode, "--node", &node.to_string()])
    }

    pub fn uart_get(node: u32) -> Vec<String> {
        argv(&["tpi", "uart", "--node", &node.to_string(), "get"])
    }

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|p| p.to_string()).collect()
    }
}

/// Controller reached through a command executor
pub struct BmcController<E> {
    exec: E,
    command_timeout: Duration,
}

impl<E: CommandExecutor> BmcController<E> {
    pub fn new(exec: E) -> Self {
        Self {
            exec,
            command_timeout: defaults::REMOTE_COMMAND_TIMEOUT,
        }
    }

    /// Timeout for short commands; flashing is bounded by the caller
    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    pub fn executor(&self) -> &E {
        &self.exec
    }

    async fn run(
        &self,
        operation: &str,
        node: u32,
        argv: Vec<String>,
        timeout: Option<Duration>,
    ) -> Result<CommandOutput, ControllerError> {
        let mut request = CommandRequest::new(argv);
        request.timeout = timeout;
        tracing::debug!(node, operation, command = %request.display(), "controller command");
        self.exec
            .check(request)
            .await
            .map_err(|source| ControllerError::Command {
                operation: operation.to_string(),
                node,
                source,
            })
    }
}

#[async_trait]
impl<E: CommandExecutor> Controller for BmcController<E> {
    async fn power_status(&self, node: u32) -> Result<PowerState, ControllerError> {
        let output = self
            .run("power status", node, commands::power_status(), Some(self.command_timeout))
            .await?;
        parse_power_status(&output.stdout, node).ok_or_else(|| ControllerError::UnexpectedOutput {
            operation: "power status".to_string(),
            node,
            output: output.stdout.trim().to_string(),
        })
    }

    async fn power_on(&self, node: u32) -> Result<(), ControllerError> {
        self.run("power on", node, commands::power(node, true), Some(self.command_timeout))
            .await
            .map(|_| ())
    }

    async fn power_off(&self, node: u32) -> Result<(), ControllerError> {
        self.run("power off", node, commands::power(node, false), Some(self.command_timeout))
            .await
            .map(|_| ())
    }

    async fn flash(&self, node: u32, remote_path: &str) -> Result<(), ControllerError> {
        self.run("flash", node, commands::flash(node, remote_path), None)
            .await
            .map(|_| ())
    }

    async fn set_normal_mode(&self, node: u32) -> Result<(), ControllerError> {
        self.run(
            "set normal mode",
            node,
            commands::usb(node, UsbMode::Normal),
            Some(self.command_timeout),
        )
        .await
        .map(|_| ())
    }

    async fn set_mass_storage_mode(&self, node: u32) -> Result<(), ControllerError> {
        self.run(
            "set mass storage mode",
            node,
            commands::usb(node, UsbMode::MassStorage),
            Some(self.command_timeout),
        )
        .await
        .map(|_| ())
    }

    async fn read_console(&self, node: u32) -> Result<String, ControllerError> {
        self.run("read console", node, commands::uart_get(node), Some(self.command_timeout))
            .await
            .map(|out| out.stdout)
    }

    async fn exec(&self, node: u32, argv: Vec<String>) -> Result<CommandOutput, ControllerError> {
        self.run("exec", node, argv, Some(self.command_timeout)).await
    }
}
