//! Boot verification from serial console milestones
//!
//! The controller's console read drains its buffer, so each poll returns only
//! new output. Milestones seen across polls accumulate; they may arrive in
//! any order and may repeat. The run completes once every milestone has been
//! seen and times out at the configured bound otherwise.

use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::{defaults, BootConfig};
use crate::core::controller::Controller;
use crate::error::BootError;

/// Console text kept from the previous poll so a milestone split across
/// two reads still matches
const CARRY_OVER_CHARS: usize = 128;

/// Console output meaning the boot has failed for good
pub const FAILURE_PATTERNS: &[&str] = &[
    "Kernel panic",
    "VFS: Unable to mount root fs",
    "VFS: Cannot open root device",
    "emergency mode",
];

/// Progress of one verification run; never moves backwards
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum BootStatus {
    Starting,
    InitStarted,
    NetworkInitialized,
    LoginPromptVisible,
    Completed,
    Failed,
    TimedOut,
}

impl BootStatus {
    /// Whether the run has ended
    pub fn is_terminal(&self) -> bool {
        matches!(self, BootStatus::Completed | BootStatus::Failed | BootStatus::TimedOut)
    }
}

impl fmt::Display for BootStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BootStatus::Starting => "starting",
            BootStatus::InitStarted => "init-started",
            BootStatus::NetworkInitialized => "network-initialized",
            BootStatus::LoginPromptVisible => "login-prompt-visible",
            BootStatus::Completed => "completed",
            BootStatus::Failed => "failed",
            BootStatus::TimedOut => "timed-out",
        };
        f.write_str(name)
    }
}

/// A console substring marking a boot phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Milestone {
    InitSystem,
    NetworkManager,
    LoginPrompt,
}

impl Milestone {
    pub const ALL: [Milestone; 3] = [
        Milestone::InitSystem,
        Milestone::NetworkManager,
        Milestone::LoginPrompt,
    ];

    /// Console substrings that mark this milestone
    pub fn patterns(&self) -> &'static [&'static str] {
        match self {
            Milestone::InitSystem => &["systemd[1]:", "Welcome to ", "Run /sbin/init", "INIT: version"],
            Milestone::NetworkManager => &[
                "Started Network Manager",
                "Started NetworkManager",
                "Started Network Configuration",
                "Reached target Network",
            ],
            Milestone::LoginPrompt => &[" login:"],
        }
    }

    /// Status reached when this is the furthest milestone seen
    fn status(&self) -> BootStatus {
        match self {
            Milestone::InitSystem => BootStatus::InitStarted,
            Milestone::NetworkManager => BootStatus::NetworkInitialized,
            Milestone::LoginPrompt => BootStatus::LoginPromptVisible,
        }
    }

    fn matches(&self, text: &str) -> bool {
        self.patterns().iter().any(|p| text.contains(p))
    }
}

impl fmt::Display for Milestone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Milestone::InitSystem => "init-system",
            Milestone::NetworkManager => "network-manager",
            Milestone::LoginPrompt => "login-prompt",
        };
        f.write_str(name)
    }
}

/// Accumulates milestones across console reads
#[derive(Debug, Clone)]
pub struct MilestoneTracker {
    seen: BTreeSet<Milestone>,
    status: BootStatus,
    carry: String,
    failure: Option<&'static str>,
}

impl Default for MilestoneTracker {
    fn default() -> Self {
        Self {
            seen: BTreeSet::new(),
            status: BootStatus::Starting,
            carry: String::new(),
            failure: None,
        }
    }
}

impl MilestoneTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed newly read console output and return the updated status
    pub fn observe(&mut self, chunk: &str) -> BootStatus {
        if self.status.is_terminal() {
            return self.status;
        }
        let text = format!("{}{}", self.carry, chunk);

        if let Some(pattern) = FAILURE_PATTERNS.iter().copied().find(|p| text.contains(p)) {
            tracing::warn!(pattern, "console reported boot failure");
            self.failure = Some(pattern);
            self.status = BootStatus::Failed;
            return self.status;
        }

        for milestone in Milestone::ALL {
            if milestone.matches(&text) && self.seen.insert(milestone) {
                tracing::info!(milestone = %milestone, "boot milestone reached");
            }
        }

        let derived = if self.seen.len() == Milestone::ALL.len() {
            BootStatus::Completed
        } else {
            self.seen
                .iter()
                .map(Milestone::status)
                .max()
                .unwrap_or(BootStatus::Starting)
        };
        self.status = self.status.max(derived);

        let keep = text.chars().count().saturating_sub(CARRY_OVER_CHARS);
        self.carry = text.chars().skip(keep).collect();
        self.status
    }

    pub fn status(&self) -> BootStatus {
        self.status
    }

    /// Milestones seen so far
    pub fn seen(&self) -> Vec<Milestone> {
        self.seen.iter().copied().collect()
    }

    /// Milestones not yet seen
    pub fn missing(&self) -> Vec<Milestone> {
        Milestone::ALL
            .into_iter()
            .filter(|m| !self.seen.contains(m))
            .collect()
    }

    /// Failure pattern that ended the run, if any
    pub fn failure_pattern(&self) -> Option<&'static str> {
        self.failure
    }
}

/// Polling bounds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootOptions {
    pub timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for BootOptions {
    fn default() -> Self {
        Self {
            timeout: defaults::BOOT_TIMEOUT,
            poll_interval: defaults::BOOT_POLL_INTERVAL,
        }
    }
}

impl From<&BootConfig> for BootOptions {
    fn from(config: &BootConfig) -> Self {
        Self {
            timeout: Duration::from_secs(config.timeout_secs),
            poll_interval: Duration::from_secs(config.poll_interval_secs.max(1)),
        }
    }
}

/// Result of a successful verification
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BootReport {
    pub node: u32,
    pub status: BootStatus,
    pub elapsed: Duration,
    pub polls: u32,
    pub milestones: Vec<Milestone>,
}

/// Watches a node's console until it has booted
pub struct BootVerifier<'a, C: ?Sized> {
    controller: &'a C,
    options: BootOptions,
    cancel: CancellationToken,
}

impl<'a, C: Controller + ?Sized> BootVerifier<'a, C> {
    pub fn new(controller: &'a C, options: BootOptions) -> Self {
        Self {
            controller,
            options,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Discard buffered console output so stale output from an earlier boot
    /// cannot satisfy a milestone
    pub async fn reset_console(&self, node: u32) -> Result<(), BootError> {
        self.controller
            .drain_console(node)
            .await
            .map_err(|source| BootError::Console { node, source })
    }

    /// Poll the console until every milestone has been seen
    pub async fn verify(&self, node: u32) -> Result<BootReport, BootError> {
        let started = Instant::now();
        let deadline = started + self.options.timeout;
        let mut tracker = MilestoneTracker::new();
        let mut polls = 0;
        tracing::info!(node, timeout = ?self.options.timeout, "verifying boot");

        loop {
            if self.cancel.is_cancelled() {
                return Err(BootError::Cancelled { node });
            }
            polls += 1;
            match self.controller.read_console(node).await {
                Ok(output) => {
                    let before = tracker.status();
                    let status = tracker.observe(&output);
                    if status != before {
                        tracing::info!(node, status = %status, "boot status advanced");
                    }
                    match status {
                        BootStatus::Completed => {
                            return Ok(BootReport {
                                node,
                                status,
                                elapsed: started.elapsed(),
                                polls,
                                milestones: tracker.seen(),
                            });
                        }
                        BootStatus::Failed => {
                            let pattern = tracker.failure_pattern().unwrap_or("boot failure");
                            return Err(BootError::Failed {
                                node,
                                pattern: pattern.to_string(),
                            });
                        }
                        _ => {}
                    }
                }
                Err(e) if e.is_transient() => {
                    tracing::warn!(node, "console read failed, retrying: {}", e);
                }
                Err(source) => return Err(BootError::Console { node, source }),
            }

            let now = Instant::now();
            if now >= deadline {
                let missing = tracker.missing();
                tracing::warn!(node, polls, missing = ?missing, "boot verification timed out");
                return Err(BootError::TimedOut {
                    node,
                    timeout: self.options.timeout,
                    missing: missing.iter().map(ToString::to_string).collect(),
                });
            }

            let wait = self.options.poll_interval.min(deadline - now);
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = self.cancel.cancelled() => return Err(BootError::Cancelled { node }),
            }
        }
    }
}
