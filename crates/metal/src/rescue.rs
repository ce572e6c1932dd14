//! Rescue-mode reboot cycle.
//!
//! Every selected server is driven through the same sequence together so the
//! final "all reachable" gate means the whole set rebooted into a fresh
//! rescue system:
//!
//! 1. check rescue is supported everywhere (no mutation before this passes)
//! 2. snapshot the current rescue flag
//! 3. deactivate where active, poll until none report active
//! 4. reset only the deactivated servers and wait for ICMP
//! 5. activate on all servers, capturing the one-time passwords
//! 6. hardware reset all servers
//! 7. wait for ICMP on all servers
//!
//! Passwords are keyed by server id. A password from an earlier activation
//! is dropped before re-activating and never reused.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::poll::{
    wait_for_all, AvailabilityError, Poller, ProgressEntry, ProgressSink, ProgressUpdate, Target,
    WaitError,
};
use crate::probe::Probe;
use crate::providers::{Inventory, ProviderError};

/// Rescue status poll interval and final readiness poll interval.
pub const RESCUE_POLL_INTERVAL: Duration = Duration::from_secs(15);
/// Budget for deactivation and for final readiness.
pub const RESCUE_TIMEOUT: Duration = Duration::from_secs(6 * 60);
/// Poll interval while waiting for deactivated servers to come back.
pub const CONNECTIVITY_POLL_INTERVAL: Duration = Duration::from_secs(10);
/// Budget for deactivated servers to come back.
pub const CONNECTIVITY_TIMEOUT: Duration = Duration::from_secs(6 * 60);

/// Where a server is in the cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RescuePhase {
    Checking,
    Deactivating,
    Rebooting,
    Connecting,
    Activating,
    Enabling,
    Resetting,
    Pinging,
    Ready,
    Failed,
}

impl fmt::Display for RescuePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Checking => "checking",
            Self::Deactivating => "deactivating",
            Self::Rebooting => "rebooting",
            Self::Connecting => "connecting",
            Self::Activating => "activating",
            Self::Enabling => "enabling",
            Self::Resetting => "resetting",
            Self::Pinging => "pinging",
            Self::Ready => "ready",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Per-server state through the cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RescueSession {
    /// Target (id, label, public IP).
    pub target: Target,
    /// Current phase.
    pub phase: RescuePhase,
    /// Whether rescue is armed.
    pub active: bool,
    /// Whether this run deactivated (and rebooted) the server.
    pub deactivated: bool,
    /// Password from the latest activation only.
    pub password: Option<String>,
}

impl RescueSession {
    fn new(target: Target) -> Self {
        Self {
            target,
            phase: RescuePhase::Checking,
            active: false,
            deactivated: false,
            password: None,
        }
    }
}

/// Result of a completed cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RescueOutcome {
    /// Server id to one-time rescue password.
    pub passwords: BTreeMap<String, String>,
    /// Final per-server sessions.
    pub sessions: Vec<RescueSession>,
}

/// Rescue cycle errors. Timeouts and failures carry the passwords captured
/// so far.
#[derive(Error, Debug)]
pub enum RescueError {
    /// Some servers cannot boot the rescue system.
    #[error("rescue system not available on: {}", .servers.join(", "))]
    Unsupported { servers: Vec<String> },

    /// A provider call failed.
    #[error("{action} failed for server {server_id}: {source}")]
    Provider {
        action: &'static str,
        server_id: String,
        #[source]
        source: ProviderError,
    },

    /// A stage ran out of time.
    #[error("timed out while {stage}; pending: {}", .pending.join(", "))]
    Timeout {
        stage: RescuePhase,
        pending: Vec<String>,
        passwords: BTreeMap<String, String>,
    },

    /// A server reported a hard failure.
    #[error("rescue failed on: {}", .failed.join(", "))]
    Failed {
        failed: Vec<String>,
        passwords: BTreeMap<String, String>,
    },

    /// Cancelled by the caller.
    #[error("rescue cycle cancelled")]
    Cancelled { passwords: BTreeMap<String, String> },
}

impl RescueError {
    /// Passwords captured before the error.
    #[must_use]
    pub fn passwords(&self) -> Option<&BTreeMap<String, String>> {
        match self {
            Self::Timeout { passwords, .. }
            | Self::Failed { passwords, .. }
            | Self::Cancelled { passwords } => Some(passwords),
            Self::Unsupported { .. } | Self::Provider { .. } => None,
        }
    }
}

/// Poll intervals and budgets for the cycle.
#[derive(Debug, Clone, Copy)]
pub struct RescueTimings {
    pub status_interval: Duration,
    pub status_timeout: Duration,
    pub connectivity_interval: Duration,
    pub connectivity_timeout: Duration,
    pub ready_interval: Duration,
    pub ready_timeout: Duration,
}

impl Default for RescueTimings {
    fn default() -> Self {
        Self {
            status_interval: RESCUE_POLL_INTERVAL,
            status_timeout: RESCUE_TIMEOUT,
            connectivity_interval: CONNECTIVITY_POLL_INTERVAL,
            connectivity_timeout: CONNECTIVITY_TIMEOUT,
            ready_interval: RESCUE_POLL_INTERVAL,
            ready_timeout: RESCUE_TIMEOUT,
        }
    }
}

/// Drives the rescue cycle over a set of servers.
pub struct RescueManager<'a> {
    inventory: &'a dyn Inventory,
    probe: &'a dyn Probe,
    progress: &'a dyn ProgressSink,
    cancel: CancellationToken,
    timings: RescueTimings,
}

impl<'a> RescueManager<'a> {
    /// Create a manager; `probe` is the reachability check (ICMP in production).
    #[must_use]
    pub fn new(
        inventory: &'a dyn Inventory,
        probe: &'a dyn Probe,
        progress: &'a dyn ProgressSink,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            inventory,
            probe,
            progress,
            cancel,
            timings: RescueTimings::default(),
        }
    }

    /// Override intervals and budgets.
    #[must_use]
    pub fn with_timings(mut self, timings: RescueTimings) -> Self {
        self.timings = timings;
        self
    }

    /// Run the full cycle.
    ///
    /// # Errors
    ///
    /// See [`RescueError`]. Nothing is mutated when rescue is unsupported on
    /// any server.
    pub async fn run(&self, targets: &[Target]) -> Result<RescueOutcome, RescueError> {
        self.preflight(targets).await?;

        let mut sessions: Vec<RescueSession> =
            targets.iter().cloned().map(RescueSession::new).collect();
        self.snapshot(&mut sessions).await?;
        self.report("initial rescue status", &sessions, Duration::ZERO, Duration::ZERO);

        self.deactivate(&mut sessions).await?;
        self.reboot_deactivated(&mut sessions).await?;
        self.activate_all(&mut sessions).await?;
        self.reset_all(&mut sessions).await?;
        self.wait_ready(&mut sessions).await?;

        let passwords = collect_passwords(&sessions);
        info!(servers = sessions.len(), passwords = passwords.len(), "Rescue cycle complete");
        Ok(RescueOutcome {
            passwords,
            sessions,
        })
    }

    /// Check that every target can boot the rescue system. Read-only, so
    /// callers can run it before their own mutations.
    ///
    /// # Errors
    ///
    /// [`RescueError::Unsupported`] names every server without rescue
    /// support; [`RescueError::Provider`] if a lookup fails.
    pub async fn preflight(&self, targets: &[Target]) -> Result<(), RescueError> {
        let mut unsupported = Vec::new();
        for target in targets {
            let details = self
                .inventory
                .get_server(&target.id)
                .await
                .map_err(provider_err("get server", &target.id))?;
            if !details.rescue_available {
                unsupported.push(target.label.clone());
            }
        }
        if unsupported.is_empty() {
            Ok(())
        } else {
            Err(RescueError::Unsupported {
                servers: unsupported,
            })
        }
    }

    async fn snapshot(&self, sessions: &mut [RescueSession]) -> Result<(), RescueError> {
        for session in sessions {
            let state = self
                .inventory
                .rescue_status(&session.target.id)
                .await
                .map_err(provider_err("rescue status", &session.target.id))?;
            session.active = state.active;
            session.password = state.password;
        }
        Ok(())
    }

    async fn deactivate(&self, sessions: &mut [RescueSession]) -> Result<(), RescueError> {
        let mut any = false;
        for session in sessions.iter_mut().filter(|s| s.active) {
            info!(server_id = %session.target.id, "Deactivating existing rescue system");
            self.inventory
                .disable_rescue(&session.target.id)
                .await
                .map_err(provider_err("disable rescue", &session.target.id))?;
            session.phase = RescuePhase::Deactivating;
            session.deactivated = true;
            any = true;
        }
        if !any {
            return Ok(());
        }

        let poller = Poller::new(
            self.timings.status_interval,
            self.timings.status_timeout,
            self.cancel.clone(),
        );
        loop {
            for session in sessions.iter_mut().filter(|s| s.deactivated) {
                let state = self
                    .inventory
                    .rescue_status(&session.target.id)
                    .await
                    .map_err(provider_err("rescue status", &session.target.id))?;
                session.active = state.active;
            }
            self.report(
                "rescue deactivation",
                sessions,
                poller.elapsed(),
                poller.timeout(),
            );

            let pending: Vec<String> = sessions
                .iter()
                .filter(|s| s.deactivated && s.active)
                .map(|s| s.target.label.clone())
                .collect();
            if pending.is_empty() {
                return Ok(());
            }

            poller
                .tick()
                .await
                .map_err(|e| wait_err(e, RescuePhase::Deactivating, pending, sessions))?;
        }
    }

    async fn reboot_deactivated(&self, sessions: &mut [RescueSession]) -> Result<(), RescueError> {
        let mut rebooted = Vec::new();
        for session in sessions.iter_mut().filter(|s| s.deactivated) {
            info!(server_id = %session.target.id, "Rebooting out of stale rescue system");
            self.inventory
                .reset_server(&session.target.id)
                .await
                .map_err(provider_err("reset", &session.target.id))?;
            session.phase = RescuePhase::Rebooting;
            rebooted.push(session.target.clone());
        }
        if rebooted.is_empty() {
            return Ok(());
        }

        for session in sessions.iter_mut().filter(|s| s.deactivated) {
            session.phase = RescuePhase::Connecting;
        }
        let poller = Poller::new(
            self.timings.connectivity_interval,
            self.timings.connectivity_timeout,
            self.cancel.clone(),
        );
        wait_for_all(
            "reboot connectivity",
            &rebooted,
            self.probe,
            &poller,
            self.progress,
        )
        .await
        .map(|_| ())
        .map_err(|e| availability_err(e, RescuePhase::Connecting, sessions))
    }

    async fn activate_all(&self, sessions: &mut [RescueSession]) -> Result<(), RescueError> {
        for session in sessions.iter_mut() {
            session.password = None;
            session.phase = RescuePhase::Activating;
        }

        for session in sessions.iter_mut() {
            info!(server_id = %session.target.id, "Activating rescue system");
            let state = self
                .inventory
                .enable_rescue(&session.target.id)
                .await
                .map_err(provider_err("enable rescue", &session.target.id))?;
            session.active = state.active;
            session.password = state.password.filter(|p| !p.is_empty());
            session.phase = RescuePhase::Enabling;
            if session.password.is_none() {
                warn!(server_id = %session.target.id, "Activation returned no rescue password");
            }
        }
        Ok(())
    }

    async fn reset_all(&self, sessions: &mut [RescueSession]) -> Result<(), RescueError> {
        for session in sessions.iter_mut() {
            session.phase = RescuePhase::Resetting;
            info!(server_id = %session.target.id, "Resetting into rescue system");
            self.inventory
                .reset_server(&session.target.id)
                .await
                .map_err(provider_err("reset", &session.target.id))?;
        }
        Ok(())
    }

    async fn wait_ready(&self, sessions: &mut [RescueSession]) -> Result<(), RescueError> {
        for session in sessions.iter_mut() {
            session.phase = RescuePhase::Pinging;
        }
        let targets: Vec<Target> = sessions.iter().map(|s| s.target.clone()).collect();
        let poller = Poller::new(
            self.timings.ready_interval,
            self.timings.ready_timeout,
            self.cancel.clone(),
        );

        match wait_for_all("rescue readiness", &targets, self.probe, &poller, self.progress).await
        {
            Ok(_) => {
                for session in sessions.iter_mut() {
                    session.phase = RescuePhase::Ready;
                }
                Ok(())
            }
            Err(e) => Err(availability_err(e, RescuePhase::Pinging, sessions)),
        }
    }

    fn report(
        &self,
        stage: &str,
        sessions: &[RescueSession],
        elapsed: Duration,
        timeout: Duration,
    ) {
        let entries: Vec<ProgressEntry> = sessions
            .iter()
            .map(|s| ProgressEntry {
                id: s.target.id.clone(),
                label: s.target.label.clone(),
                state: format!(
                    "{} (rescue {})",
                    s.phase,
                    if s.active { "active" } else { "inactive" }
                ),
                done: !s.active || s.phase == RescuePhase::Ready,
            })
            .collect();
        self.progress.update(&ProgressUpdate {
            stage,
            elapsed,
            timeout,
            entries: &entries,
        });
    }
}

/// Non-empty passwords by server id.
fn collect_passwords(sessions: &[RescueSession]) -> BTreeMap<String, String> {
    sessions
        .iter()
        .filter_map(|s| {
            s.password
                .as_ref()
                .map(|p| (s.target.id.clone(), p.clone()))
        })
        .collect()
}

fn provider_err<'s>(
    action: &'static str,
    server_id: &'s str,
) -> impl FnOnce(ProviderError) -> RescueError + 's {
    move |source| RescueError::Provider {
        action,
        server_id: server_id.to_string(),
        source,
    }
}

fn wait_err(
    err: WaitError,
    stage: RescuePhase,
    pending: Vec<String>,
    sessions: &[RescueSession],
) -> RescueError {
    let passwords = collect_passwords(sessions);
    match err {
        WaitError::Timeout { .. } => RescueError::Timeout {
            stage,
            pending,
            passwords,
        },
        WaitError::Cancelled => RescueError::Cancelled { passwords },
    }
}

fn availability_err(
    err: AvailabilityError,
    stage: RescuePhase,
    sessions: &mut [RescueSession],
) -> RescueError {
    let passwords = collect_passwords(sessions);
    match err {
        AvailabilityError::Timeout { offline, .. } => RescueError::Timeout {
            stage,
            pending: offline,
            passwords,
        },
        AvailabilityError::Failed { failed, .. } => {
            for session in sessions.iter_mut() {
                if failed.contains_key(&session.target.label) {
                    session.phase = RescuePhase::Failed;
                }
            }
            RescueError::Failed {
                failed: failed.into_keys().collect(),
                passwords,
            }
        }
        AvailabilityError::Cancelled { .. } => RescueError::Cancelled { passwords },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::poll::LogProgress;
    use crate::probe::ProbeOutcome;
    use crate::testing::{FakeInventory, ScriptedProbe};

    fn manager<'a>(inventory: &'a FakeInventory, probe: &'a ScriptedProbe) -> RescueManager<'a> {
        RescueManager::new(inventory, probe, &LogProgress, CancellationToken::new())
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsupported_server_aborts_before_mutation() {
        let inventory = FakeInventory::with_servers(2);
        inventory.state().no_rescue.insert("2".into());
        let probe = ScriptedProbe::reachable();

        let err = manager(&inventory, &probe)
            .run(&inventory.targets())
            .await
            .unwrap_err();
        match err {
            RescueError::Unsupported { servers } => {
                assert_eq!(servers, vec!["node-2 (10.0.0.2)"]);
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert!(inventory.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_only_active_servers_are_deactivated_and_rebooted() {
        let inventory = FakeInventory::with_servers(2);
        {
            let mut state = inventory.state();
            state.rescue_active.insert("1".into(), true);
            state
                .rescue_passwords
                .insert("1".into(), Some("stale-password".into()));
            state.activation_passwords.insert("1".into(), Some(String::new()));
        }
        let probe = ScriptedProbe::reachable();

        let outcome = manager(&inventory, &probe)
            .run(&inventory.targets())
            .await
            .unwrap();

        assert_eq!(
            inventory.calls(),
            vec![
                "disable_rescue:1",
                "reset:1",
                "enable_rescue:1",
                "enable_rescue:2",
                "reset:1",
                "reset:2",
            ]
        );
        // The empty activation password for server 1 never falls back to the stale one.
        assert!(!outcome.passwords.contains_key("1"));
        assert_eq!(outcome.passwords.get("2").map(String::as_str), Some("pw-2"));
        assert!(outcome
            .sessions
            .iter()
            .all(|s| s.phase == RescuePhase::Ready));
        assert!(outcome.sessions[0].deactivated);
        assert!(!outcome.sessions[1].deactivated);
    }

    #[tokio::test(start_paused = true)]
    async fn test_three_servers_get_distinct_passwords() {
        let inventory = FakeInventory::with_servers(3);
        let probe = ScriptedProbe::reachable();
        probe.script("3", vec![ProbeOutcome::Unreachable("booting".into()); 4]);

        let outcome = manager(&inventory, &probe)
            .run(&inventory.targets())
            .await
            .unwrap();
        assert_eq!(outcome.passwords.len(), 3);
        let unique: std::collections::BTreeSet<&String> = outcome.passwords.values().collect();
        assert_eq!(unique.len(), 3);
        assert!(inventory.calls_matching("disable").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_deactivation_timeout() {
        let inventory = FakeInventory::with_servers(1);
        {
            let mut state = inventory.state();
            state.rescue_active.insert("1".into(), true);
            state.stuck_active.insert("1".into());
        }
        let probe = ScriptedProbe::reachable();

        let err = manager(&inventory, &probe)
            .run(&inventory.targets())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RescueError::Timeout {
                stage: RescuePhase::Deactivating,
                ..
            }
        ));
        assert!(inventory.calls_matching("enable").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_readiness_timeout_returns_partial_passwords() {
        let inventory = FakeInventory::with_servers(2);
        let probe = ScriptedProbe::reachable();
        probe.script(
            "2",
            vec![ProbeOutcome::Unreachable("no reply".into()); 100],
        );

        let err = manager(&inventory, &probe)
            .run(&inventory.targets())
            .await
            .unwrap_err();
        match &err {
            RescueError::Timeout {
                stage,
                pending,
                passwords,
            } => {
                assert_eq!(*stage, RescuePhase::Pinging);
                assert_eq!(pending, &vec!["node-2 (10.0.0.2)".to_string()]);
                assert_eq!(passwords.len(), 2);
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(err.passwords().map(BTreeMap::len), Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hard_failure_aborts_readiness() {
        let inventory = FakeInventory::with_servers(2);
        let probe = ScriptedProbe::unreachable();
        probe.script("1", vec![ProbeOutcome::Failed("boot failed".into())]);

        let err = manager(&inventory, &probe)
            .run(&inventory.targets())
            .await
            .unwrap_err();
        match err {
            RescueError::Failed { failed, passwords } => {
                assert_eq!(failed, vec!["node-1 (10.0.0.1)"]);
                assert_eq!(passwords.len(), 2);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_is_distinct() {
        let inventory = FakeInventory::with_servers(1);
        let probe = ScriptedProbe::unreachable();
        let cancel = CancellationToken::new();
        let manager = RescueManager::new(&inventory, &probe, &LogProgress, cancel.clone());
        cancel.cancel();

        let err = manager.run(&inventory.targets()).await.unwrap_err();
        assert!(matches!(err, RescueError::Cancelled { .. }));
    }
}
