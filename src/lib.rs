//! nodeprov - provision compute nodes behind a board management controller
//!
//! This library provides the stages of a single forward provisioning run:
//! customize an OS image, ship it to the controller, flash and power-cycle
//! the node, verify that it boots and change its first-boot password.
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - [`cli`] - Command-line interface parsing and output formatting
//! - [`core`] - Provisioning logic behind executor and controller traits
//! - [`infra`] - Infrastructure layer (processes, directories, filesystem)
//! - [`config`] - Configuration and constants
//! - [`error`] - Error types and handling

pub mod cli;
pub mod config;
pub mod core;
pub mod error;
pub mod infra;

#[cfg(test)]
pub mod test_utils;
