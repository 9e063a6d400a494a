//! Flash and power orchestration
//!
//! One linear run per node:
//!
//! ```text
//! CheckPower -> [PowerOff -> reverify off] -> Flash -> SetNormalMode -> PowerOn -> Done
//! ```
//!
//! Any failed command or power post-condition ends the run. There are no
//! retries here; the caller drives the pipeline again if it wants them.

use serde::Serialize;
use std::fmt;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::{defaults, FlashConfig};
use crate::core::controller::{Controller, PowerState};
use crate::error::{ControllerError, FlashError};

/// Step of a flash run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum FlashPhase {
    CheckPower,
    PowerOff,
    Flash,
    SetNormalMode,
    PowerOn,
    Done,
}

impl fmt::Display for FlashPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FlashPhase::CheckPower => "check-power",
            FlashPhase::PowerOff => "power-off",
            FlashPhase::Flash => "flash",
            FlashPhase::SetNormalMode => "set-normal-mode",
            FlashPhase::PowerOn => "power-on",
            FlashPhase::Done => "done",
        };
        f.write_str(name)
    }
}

/// Event sent to an observer while a run progresses
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlashProgress {
    /// A phase started
    Phase { node: u32, phase: FlashPhase },
    /// The flash command is still running
    Heartbeat { node: u32, elapsed: Duration },
}

/// Timing for a flash run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlashOptions {
    /// Bound on the flash command
    pub timeout: Duration,
    /// Interval between heartbeats
    pub heartbeat: Duration,
    /// Budget for the node to reach a requested power state
    pub power_wait: Duration,
    /// Interval between power status checks
    pub poll_interval: Duration,
}

impl Default for FlashOptions {
    fn default() -> Self {
        Self {
            timeout: defaults::FLASH_TIMEOUT,
            heartbeat: defaults::FLASH_HEARTBEAT_INTERVAL,
            power_wait: defaults::POWER_OFF_WAIT,
            poll_interval: defaults::POWER_POLL_INTERVAL,
        }
    }
}

impl From<&FlashConfig> for FlashOptions {
    fn from(config: &FlashConfig) -> Self {
        Self {
            timeout: Duration::from_secs(config.timeout_secs),
            heartbeat: Duration::from_secs(config.heartbeat_secs.max(1)),
            power_wait: Duration::from_secs(config.power_off_wait_secs),
            poll_interval: defaults::POWER_POLL_INTERVAL,
        }
    }
}

/// Result of a completed run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FlashReport {
    pub node: u32,
    /// Image path on the controller
    pub image: String,
    /// Whether the node had to be powered off first
    pub was_powered_on: bool,
    /// Wall time of the flash command
    pub flash_duration: Duration,
    /// Heartbeats emitted while flashing
    pub heartbeats: u32,
}

/// Drives one node through power-off, flash and power-on
pub struct FlashOrchestrator<'a, C: ?Sized> {
    controller: &'a C,
    options: FlashOptions,
    cancel: CancellationToken,
    progress: Option<UnboundedSender<FlashProgress>>,
}

impl<'a, C: Controller + ?Sized> FlashOrchestrator<'a, C> {
    pub fn new(controller: &'a C, options: FlashOptions) -> Self {
        Self {
            controller,
            options,
            cancel: CancellationToken::new(),
            progress: None,
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Send phase changes and heartbeats to `sender`
    pub fn with_progress(mut self, sender: UnboundedSender<FlashProgress>) -> Self {
        self.progress = Some(sender);
        self
    }

    /// Flash `image` (a path on the controller) onto `node`
    pub async fn run(&self, node: u32, image: &str) -> Result<FlashReport, FlashError> {
        self.enter(node, FlashPhase::CheckPower);
        let initial = self
            .controller
            .power_status(node)
            .await
            .map_err(phase_err(FlashPhase::CheckPower, node))?;
        tracing::info!(node, power = %initial, "checked power state");

        let was_powered_on = initial == PowerState::On;
        if was_powered_on {
            self.enter(node, FlashPhase::PowerOff);
            self.controller
                .power_off(node)
                .await
                .map_err(phase_err(FlashPhase::PowerOff, node))?;
            let reached = self.wait_for_power(node, PowerState::Off, FlashPhase::PowerOff).await?;
            if !reached {
                return Err(FlashError::StillPoweredOn {
                    node,
                    waited: self.options.power_wait,
                });
            }
        }

        self.enter(node, FlashPhase::Flash);
        let (flash_duration, heartbeats) = self.flash_with_heartbeat(node, image).await?;

        self.enter(node, FlashPhase::SetNormalMode);
        self.controller
            .set_normal_mode(node)
            .await
            .map_err(phase_err(FlashPhase::SetNormalMode, node))?;

        self.enter(node, FlashPhase::PowerOn);
        self.controller
            .power_on(node)
            .await
            .map_err(phase_err(FlashPhase::PowerOn, node))?;
        if !self.wait_for_power(node, PowerState::On, FlashPhase::PowerOn).await? {
            return Err(FlashError::NotPoweredOn { node });
        }

        self.enter(node, FlashPhase::Done);
        Ok(FlashReport {
            node,
            image: image.to_string(),
            was_powered_on,
            flash_duration,
            heartbeats,
        })
    }

    /// Run the flash command, bounded by the timeout, emitting heartbeats
    /// until it returns
    async fn flash_with_heartbeat(&self, node: u32, image: &str) -> Result<(Duration, u32), FlashError> {
        tracing::info!(node, image = %image, timeout = ?self.options.timeout, "flashing");
        let started = Instant::now();
        let flash = self.controller.flash(node, image);
        tokio::pin!(flash);
        let deadline = tokio::time::sleep(self.options.timeout);
        tokio::pin!(deadline);
        let period = self.options.heartbeat.max(Duration::from_millis(1));
        let mut ticker = tokio::time::interval_at(started + period, period);
        let mut heartbeats = 0;

        loop {
            tokio::select! {
                result = &mut flash => {
                    result.map_err(phase_err(FlashPhase::Flash, node))?;
                    let elapsed = started.elapsed();
                    tracing::info!(node, elapsed = ?elapsed, "flash complete");
                    return Ok((elapsed, heartbeats));
                }
                _ = &mut deadline => {
                    return Err(FlashError::Timeout {
                        node,
                        image: image.to_string(),
                        timeout: self.options.timeout,
                    });
                }
                _ = self.cancel.cancelled() => {
                    return Err(FlashError::Cancelled { node, phase: FlashPhase::Flash.to_string() });
                }
                _ = ticker.tick() => {
                    heartbeats += 1;
                    let elapsed = started.elapsed();
                    tracing::info!(node, elapsed = ?elapsed, "flash still running");
                    self.notify(FlashProgress::Heartbeat { node, elapsed });
                }
            }
        }
    }

    /// Poll every `poll_interval` until the node reports `wanted` or
    /// `power_wait` runs out
    ///
    /// The state is re-read after each interval instead of once after a
    /// single full wait, so a fast transition returns early. A node still in
    /// the wrong state at the deadline yields `Ok(false)`.
    async fn wait_for_power(&self, node: u32, wanted: PowerState, phase: FlashPhase) -> Result<bool, FlashError> {
        let deadline = Instant::now() + self.options.power_wait;
        loop {
            self.sleep(node, phase, self.options.poll_interval.min(self.options.power_wait)).await?;
            let state = self
                .controller
                .power_status(node)
                .await
                .map_err(phase_err(phase, node))?;
            tracing::debug!(node, power = %state, wanted = %wanted, "power state check");
            if state == wanted {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                tracing::warn!(node, power = %state, wanted = %wanted, "power state not reached within budget");
                return Ok(false);
            }
        }
    }

    async fn sleep(&self, node: u32, phase: FlashPhase, duration: Duration) -> Result<(), FlashError> {
        tokio::select! {
            _ = tokio::time::sleep(duration) => Ok(()),
            _ = self.cancel.cancelled() => Err(FlashError::Cancelled { node, phase: phase.to_string() }),
        }
    }

    fn enter(&self, node: u32, phase: FlashPhase) {
        tracing::debug!(node, phase = %phase, "flash phase");
        self.notify(FlashProgress::Phase { node, phase });
    }

    fn notify(&self, event: FlashProgress) {
        if let Some(sender) = &self.progress {
            // A dropped receiver only means nobody is watching
            let _ = sender.send(event);
        }
    }
}

fn phase_err(phase: FlashPhase, node: u32) -> impl FnOnce(ControllerError) -> FlashError {
    move |source| FlashError::Phase {
        phase: phase.to_string(),
        node,
        source,
    }
}
