//! Bounded polling shared by every state machine.
//!
//! A [`Poller`] owns the interval, the wall-clock budget and the cancellation
//! token of one wait. [`wait_for_all`] drives a [`Probe`] over a set of
//! targets until each one is reachable, one reports a hard failure, the
//! budget runs out, or the token is cancelled.

use std::collections::BTreeMap;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::probe::{Probe, ProbeOutcome};
use crate::providers::Server;

/// Why a poll loop stopped early.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitError {
    /// The budget elapsed.
    #[error("timed out after {}s", .elapsed.as_secs())]
    Timeout { elapsed: Duration },

    /// The caller cancelled the wait.
    #[error("cancelled")]
    Cancelled,
}

/// Outcome of waiting on a set of targets.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AvailabilityError {
    /// Some targets never became reachable.
    #[error("timed out after {}s waiting for {}", .elapsed.as_secs(), .offline.join(", "))]
    Timeout {
        online: Vec<String>,
        offline: Vec<String>,
        elapsed: Duration,
    },

    /// A probe reported a hard failure.
    #[error("hard failure: {}", describe_failures(.failed))]
    Failed {
        failed: BTreeMap<String, String>,
        online: Vec<String>,
    },

    /// The caller cancelled the wait.
    #[error("cancelled while waiting for {}", .offline.join(", "))]
    Cancelled { online: Vec<String>, offline: Vec<String> },
}

/// Interval, budget and cancellation for one wait.
#[derive(Debug, Clone)]
pub struct Poller {
    interval: Duration,
    timeout: Duration,
    cancel: CancellationToken,
    started: Instant,
}

impl Poller {
    /// Start a new budget now.
    #[must_use]
    pub fn new(interval: Duration, timeout: Duration, cancel: CancellationToken) -> Self {
        Self {
            interval,
            timeout,
            cancel,
            started: Instant::now(),
        }
    }

    /// Time since the poller started.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Budget left.
    #[must_use]
    pub fn remaining(&self) -> Duration {
        self.timeout.saturating_sub(self.elapsed())
    }

    /// Total budget.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Whether the wait has been cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Sleep until the next attempt.
    ///
    /// Sleeps for the interval, or for what is left of the budget when that
    /// is shorter, so the last attempt lands on the deadline.
    ///
    /// # Errors
    ///
    /// [`WaitError::Cancelled`] if the token fires, [`WaitError::Timeout`]
    /// once the budget is spent.
    pub async fn tick(&self) -> Result<(), WaitError> {
        if self.cancel.is_cancelled() {
            return Err(WaitError::Cancelled);
        }

        let remaining = self.remaining();
        if remaining.is_zero() {
            return Err(WaitError::Timeout {
                elapsed: self.elapsed(),
            });
        }

        tokio::select! {
            () = self.cancel.cancelled() => Err(WaitError::Cancelled),
            () = tokio::time::sleep(self.interval.min(remaining)) => Ok(()),
        }
    }
}

/// Sleep for a fixed delay unless cancelled first.
///
/// # Errors
///
/// [`WaitError::Cancelled`] if the token fires during the delay.
pub async fn settle(delay: Duration, cancel: &CancellationToken) -> Result<(), WaitError> {
    tokio::select! {
        () = cancel.cancelled() => Err(WaitError::Cancelled),
        () = tokio::time::sleep(delay) => Ok(()),
    }
}

/// Something a probe can be pointed at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    /// Stable identifier (server number).
    pub id: String,
    /// Display label.
    pub label: String,
    /// Host or IP address to probe.
    pub address: String,
}

impl Target {
    /// Build a target.
    pub fn new(id: impl Into<String>, label: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            address: address.into(),
        }
    }
}

impl From<&Server> for Target {
    fn from(server: &Server) -> Self {
        Self::new(&server.id, server.label(), &server.ip)
    }
}

/// One row of a progress snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressEntry {
    /// Target id.
    pub id: String,
    /// Target label.
    pub label: String,
    /// Human-readable state.
    pub state: String,
    /// Whether the target is done.
    pub done: bool,
}

/// A snapshot rendered on every poll tick.
#[derive(Debug, Clone)]
pub struct ProgressUpdate<'a> {
    /// What is being waited on ("vswitch attachment", "rescue reboot").
    pub stage: &'a str,
    /// Time spent so far.
    pub elapsed: Duration,
    /// Total budget.
    pub timeout: Duration,
    /// Per-target rows.
    pub entries: &'a [ProgressEntry],
}

impl ProgressUpdate<'_> {
    /// Number of finished targets.
    #[must_use]
    pub fn done_count(&self) -> usize {
        self.entries.iter().filter(|e| e.done).count()
    }
}

/// Receives a snapshot on every poll tick.
pub trait ProgressSink: Send + Sync {
    /// Render one snapshot.
    fn update(&self, update: &ProgressUpdate<'_>);
}

/// Progress sink that writes to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogProgress;

impl ProgressSink for LogProgress {
    fn update(&self, update: &ProgressUpdate<'_>) {
        info!(
            stage = update.stage,
            done = update.done_count(),
            total = update.entries.len(),
            elapsed_secs = update.elapsed.as_secs(),
            timeout_secs = update.timeout.as_secs(),
            "Waiting"
        );
        for entry in update.entries.iter().filter(|e| !e.done) {
            debug!(stage = update.stage, target = %entry.label, state = %entry.state, "Pending");
        }
    }
}

/// Poll `probe` over `targets` until all are reachable.
///
/// Targets already reachable are not probed again. A [`ProbeOutcome::Failed`]
/// from any target aborts the wait at once. Cancellation interrupts a probe
/// in flight.
///
/// # Errors
///
/// See [`AvailabilityError`]; every variant names the targets on each side.
pub async fn wait_for_all(
    stage: &str,
    targets: &[Target],
    probe: &dyn Probe,
    poller: &Poller,
    progress: &dyn ProgressSink,
) -> Result<Duration, AvailabilityError> {
    let mut entries: Vec<ProgressEntry> = targets
        .iter()
        .map(|t| ProgressEntry {
            id: t.id.clone(),
            label: t.label.clone(),
            state: "waiting".to_string(),
            done: false,
        })
        .collect();

    info!(stage, targets = targets.len(), probe = %probe.describe(), "Waiting for targets");

    loop {
        let mut failed = BTreeMap::new();
        let mut cancelled = false;
        for (target, entry) in targets.iter().zip(entries.iter_mut()) {
            if entry.done {
                continue;
            }
            let outcome = tokio::select! {
                biased;
                () = poller.cancel.cancelled() => None,
                outcome = probe.check(target) => Some(outcome),
            };
            let Some(outcome) = outcome else {
                cancelled = true;
                break;
            };
            match outcome {
                ProbeOutcome::Reachable => {
                    debug!(stage, target = %target.label, "Reachable");
                    entry.state = "online".to_string();
                    entry.done = true;
                }
                ProbeOutcome::Unreachable(reason) => entry.state = reason,
                ProbeOutcome::Failed(reason) => {
                    entry.state = format!("failed: {reason}");
                    failed.insert(target.label.clone(), reason);
                }
            }
        }

        progress.update(&ProgressUpdate {
            stage,
            elapsed: poller.elapsed(),
            timeout: poller.timeout(),
            entries: &entries,
        });

        let (online, offline) = partition(&entries);
        if cancelled {
            return Err(AvailabilityError::Cancelled { online, offline });
        }
        if !failed.is_empty() {
            return Err(AvailabilityError::Failed { failed, online });
        }
        if offline.is_empty() {
            info!(stage, elapsed_secs = poller.elapsed().as_secs(), "All targets online");
            return Ok(poller.elapsed());
        }

        poller.tick().await.map_err(|e| match e {
            WaitError::Timeout { elapsed } => AvailabilityError::Timeout {
                online: online.clone(),
                offline: offline.clone(),
                elapsed,
            },
            WaitError::Cancelled => AvailabilityError::Cancelled {
                online: online.clone(),
                offline: offline.clone(),
            },
        })?;
    }
}

/// Render a failure map as `label (reason), ...`.
#[must_use]
pub fn describe_failures(failed: &BTreeMap<String, String>) -> String {
    failed
        .iter()
        .map(|(label, reason)| format!("{label} ({reason})"))
        .collect::<Vec<_>>()
        .join(", ")
}

fn partition(entries: &[ProgressEntry]) -> (Vec<String>, Vec<String>) {
    let (done, pending): (Vec<_>, Vec<_>) = entries.iter().partition(|e| e.done);
    (
        done.into_iter().map(|e| e.label.clone()).collect(),
        pending.into_iter().map(|e| e.label.clone()).collect(),
    )
}
