//! Core provisioning logic
//!
//! Everything here reaches the outside world only through the traits in
//! [`crate::infra::executor`] and the seams defined alongside each stage
//! ([`controller::Controller`], [`transfer::RemoteTransport`],
//! [`interactive::SessionOpener`]).
//!
//! # Submodules
//!
//! - [`disk`] - Partition mapping, mounting and guest file I/O
//! - [`network`] - Static network identity injection
//! - [`compress`] - Image decompression and recompression
//! - [`transfer`] - Tiered transfer to the controller
//! - [`controller`] - Controller power, flash and console commands
//! - [`flash`] - Flash and power orchestration
//! - [`boot`] - Serial console boot verification
//! - [`interactive`] - Expect/send sessions and the first-boot password change
//! - [`state`] - Per-node status store
//! - [`pipeline`] - Stage sequencing for one node
//! - [`discovery`] - Concurrent node probing
//! - [`doctor`] - Host tool checks

pub mod boot;
pub mod compress;
pub mod controller;
pub mod discovery;
pub mod disk;
pub mod doctor;
pub mod flash;
pub mod interactive;
pub mod network;
pub mod pipeline;
pub mod state;
pub mod transfer;
