//! Device readiness and the run state machine.

use crate::remote::RemoteTree;

use serde::Serialize;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tokio::time::{sleep, Instant};
use tracing::{debug, info};

#[derive(Debug, Error, PartialEq)]
pub enum ConnectError {
    #[error("Device did not answer within {waited:?} ({attempts} probes)")]
    Unreachable { waited: Duration, attempts: u32 },

    #[error("Invalid run state transition: {from} -> {to}")]
    InvalidTransition { from: RunState, to: RunState },
}

pub type Result<T> = std::result::Result<T, ConnectError>;

/// Where a `TabletSync` run currently is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum RunState {
    Idle,
    Connecting,
    Connected,
    Syncing,
    Synced,
    Downloading,
    Completed,
    PartialFailure { failed: usize },
    Failed { reason: String },
}

impl RunState {
    /// States a new device operation may start from.
    pub fn is_resting(&self) -> bool {
        matches!(
            self,
            RunState::Idle
                | RunState::Connected
                | RunState::Synced
                | RunState::Completed
                | RunState::PartialFailure { .. }
                | RunState::Failed { .. }
        )
    }

    pub fn can_transition_to(&self, next: &RunState) -> bool {
        use RunState::*;

        match (self, next) {
            (from, Connecting) => from.is_resting(),
            (Connecting, Connected) => true,
            // Connected -> Synced: working from stored state without syncing
            (Connected, Syncing) | (Connected, Synced) => true,
            (Syncing, Synced) => true,
            (Synced, Downloading) => true,
            (Downloading, Completed) | (Downloading, PartialFailure { .. }) => true,
            (Connecting | Syncing | Downloading, Failed { .. }) => true,
            _ => false,
        }
    }

    /// Move to `next`, rejecting transitions the machine does not have.
    pub fn advance(&mut self, next: RunState) -> Result<()> {
        if !self.can_transition_to(&next) {
            return Err(ConnectError::InvalidTransition {
                from: self.clone(),
                to: next,
            });
        }
        debug!("Run state {} -> {}", self, next);
        *self = next;
        Ok(())
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunState::Idle => write!(f, "idle"),
            RunState::Connecting => write!(f, "connecting"),
            RunState::Connected => write!(f, "connected"),
            RunState::Syncing => write!(f, "syncing"),
            RunState::Synced => write!(f, "synced"),
            RunState::Downloading => write!(f, "downloading"),
            RunState::Completed => write!(f, "completed"),
            RunState::PartialFailure { failed } => write!(f, "partial failure ({failed} failed)"),
            RunState::Failed { reason } => write!(f, "failed: {reason}"),
        }
    }
}

/// Polling schedule for `wait_device_connection`.
#[derive(Debug, Clone)]
pub struct WaitConfig {
    /// Delay after the first failed probe
    pub initial_delay: Duration,
    /// Maximum delay between probes
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_factor: f64,
    /// Give up after this long
    pub timeout: Duration,
}

impl Default for WaitConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
            backoff_factor: 2.0,
            timeout: Duration::from_secs(60),
        }
    }
}

/// Delay after the `attempt`-th failed probe (1-based).
pub fn calculate_backoff(attempt: u32, config: &WaitConfig) -> Duration {
    let delay_secs = config.initial_delay.as_secs_f64()
        * config.backoff_factor.powi(attempt.saturating_sub(1) as i32);

    Duration::from_secs_f64(delay_secs.min(config.max_delay.as_secs_f64()))
}

/// Probe until the device answers or `config.timeout` elapses.
///
/// Returns the number of probes it took.
pub async fn wait_device_connection<R>(remote: &R, config: &WaitConfig) -> Result<u32>
where
    R: RemoteTree + ?Sized,
{
    let started = Instant::now();
    let deadline = started + config.timeout;
    let mut attempts = 0;

    loop {
        attempts += 1;
        if remote.probe().await {
            info!("Device answered after {} probe(s)", attempts);
            return Ok(attempts);
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(ConnectError::Unreachable {
                waited: now - started,
                attempts,
            });
        }

        let delay = calculate_backoff(attempts, config).min(deadline - now);
        debug!("Device not answering, probing again in {:?}", delay);
        sleep(delay).await;
    }
}
