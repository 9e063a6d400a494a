//! Infrastructure layer
//!
//! Handles all I/O with the outside world: external processes (locally, in
//! a sandbox container, or over SSH), directories, and the local filesystem.

pub mod dirs;
pub mod executor;
pub mod filesystem;
