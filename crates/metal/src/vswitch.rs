//! Private network segment (vSwitch) lifecycle.
//!
//! Planning is split from mutation so the operator can review the plan
//! before anything changes:
//!
//! 1. [`VSwitchManager::plan_segment`] looks the segment up by name and
//!    decides to reuse it, recreate it (cloud network bound, with consent) or
//!    create it on the lowest free VLAN.
//! 2. [`VSwitchManager::ensure_segment`] carries the plan out.
//! 3. [`VSwitchManager::attach_and_monitor`] attaches every selected server
//!    that is not already attached in one request, then polls until all of
//!    them report ready. Any `failed` status aborts at once.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::poll::{settle, Poller, ProgressEntry, ProgressSink, ProgressUpdate, WaitError};
use crate::providers::{AttachmentStatus, Inventory, ProviderError, VSwitch};

/// Lowest VLAN tag the provider accepts for vSwitches.
pub const VLAN_MIN: u16 = 4000;
/// Highest VLAN tag the provider accepts for vSwitches.
pub const VLAN_MAX: u16 = 4091;

/// Poll interval while waiting for attachment.
pub const ATTACH_POLL_INTERVAL: Duration = Duration::from_secs(15);
/// Budget for all servers to report ready.
pub const ATTACH_TIMEOUT: Duration = Duration::from_secs(6 * 60);
/// Delay after deleting a segment before recreating it.
pub const DELETE_SETTLE: Duration = Duration::from_secs(30);

/// vSwitch errors.
#[derive(Error, Debug)]
pub enum VSwitchError {
    /// Provider call failed.
    #[error(transparent)]
    Provider(#[from] ProviderError),

    /// Every VLAN in the range is taken.
    #[error("no free VLAN between {} and {}", VLAN_MIN, VLAN_MAX)]
    NoFreeVlan,

    /// Segment is bound to a cloud network and the operator declined to recreate it.
    #[error(
        "vSwitch '{name}' (id {id}) is connected to a cloud network; \
         remove the cloud network connection in the Robot console or allow it to be recreated"
    )]
    CloudNetworkBound { name: String, id: String },

    /// The provider reported a failed attachment.
    #[error("attachment failed for server(s) {}", .failed.join(", "))]
    AttachmentFailed {
        failed: Vec<String>,
        ready: Vec<String>,
    },

    /// Not every server became ready in time.
    #[error(
        "timed out after {}s; still not ready: {}",
        .elapsed.as_secs(),
        .pending.join(", ")
    )]
    Timeout {
        ready: Vec<String>,
        pending: Vec<String>,
        elapsed: Duration,
    },

    /// Cancelled by the caller.
    #[error("vSwitch operation cancelled")]
    Cancelled,
}

/// Asks the operator before destroying a segment.
pub trait Consent: Send + Sync {
    /// Whether `vswitch` may be deleted and recreated.
    fn confirm_recreate(&self, vswitch: &VSwitch) -> bool;
}

/// Consent that always answers the same.
#[derive(Debug, Clone, Copy)]
pub struct FixedConsent(pub bool);

impl Consent for FixedConsent {
    fn confirm_recreate(&self, _vswitch: &VSwitch) -> bool {
        self.0
    }
}

/// What [`VSwitchManager::ensure_segment`] will do.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "kebab-case")]
pub enum SegmentPlan {
    /// Use the existing segment as is.
    Reuse { vswitch: VSwitch },
    /// Delete the existing segment, wait, and create a new one.
    Recreate { existing: VSwitch },
    /// Create a new segment.
    Create { name: String, vlan: u16 },
}

impl SegmentPlan {
    /// One-line description for the summary screen.
    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            Self::Reuse { vswitch } => format!(
                "reuse vSwitch '{}' (id {}, VLAN {})",
                vswitch.name, vswitch.id, vswitch.vlan
            ),
            Self::Recreate { existing } => format!(
                "delete and recreate vSwitch '{}' (id {}, VLAN {})",
                existing.name, existing.id, existing.vlan
            ),
            Self::Create { name, vlan } => format!("create vSwitch '{name}' on VLAN {vlan}"),
        }
    }
}

/// Result of a successful attachment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentOutcome {
    /// Servers included in the attach request.
    pub requested: Vec<String>,
    /// Every selected server, all ready.
    pub ready: Vec<String>,
    /// Time spent monitoring.
    pub elapsed: Duration,
}

/// Lowest VLAN in range not used by a live segment.
#[must_use]
pub fn next_free_vlan(vswitches: &[VSwitch]) -> Option<u16> {
    (VLAN_MIN..=VLAN_MAX).find(|vlan| {
        !vswitches
            .iter()
            .any(|v| !v.cancelled && v.vlan == *vlan)
    })
}

/// Drives vSwitch creation and attachment.
pub struct VSwitchManager<'a> {
    inventory: &'a dyn Inventory,
    cancel: CancellationToken,
    poll_interval: Duration,
    timeout: Duration,
    settle: Duration,
}

impl<'a> VSwitchManager<'a> {
    /// Manager with the standard intervals.
    #[must_use]
    pub fn new(inventory: &'a dyn Inventory, cancel: CancellationToken) -> Self {
        Self {
            inventory,
            cancel,
            poll_interval: ATTACH_POLL_INTERVAL,
            timeout: ATTACH_TIMEOUT,
            settle: DELETE_SETTLE,
        }
    }

    /// Override the attachment budget.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Decide what to do with the segment named `name`. Read-only.
    ///
    /// # Errors
    ///
    /// Fails on provider errors, a declined recreate of a cloud-bound
    /// segment, or an exhausted VLAN range.
    pub async fn plan_segment(
        &self,
        name: &str,
        consent: &dyn Consent,
    ) -> Result<SegmentPlan, VSwitchError> {
        let vswitches = self.inventory.list_vswitches().await?;

        if let Some(existing) = vswitches.iter().find(|v| v.name == name && !v.cancelled) {
            let details = self.inventory.get_vswitch(&existing.id).await?;
            if !details.has_cloud_network {
                info!(vswitch_id = %existing.id, vlan = existing.vlan, "Reusing existing vSwitch");
                return Ok(SegmentPlan::Reuse {
                    vswitch: existing.clone(),
                });
            }

            warn!(vswitch_id = %existing.id, "vSwitch is connected to a cloud network");
            if consent.confirm_recreate(existing) {
                return Ok(SegmentPlan::Recreate {
                    existing: existing.clone(),
                });
            }
            return Err(VSwitchError::CloudNetworkBound {
                name: existing.name.clone(),
                id: existing.id.clone(),
            });
        }

        let vlan = next_free_vlan(&vswitches).ok_or(VSwitchError::NoFreeVlan)?;
        Ok(SegmentPlan::Create {
            name: name.to_string(),
            vlan,
        })
    }

    /// Carry out a plan and return the live segment.
    ///
    /// # Errors
    ///
    /// Fails on provider errors, cancellation during the settle delay, or
    /// an exhausted VLAN range after deletion.
    pub async fn ensure_segment(&self, plan: &SegmentPlan) -> Result<VSwitch, VSwitchError> {
        match plan {
            SegmentPlan::Reuse { vswitch } => Ok(vswitch.clone()),
            SegmentPlan::Create { name, vlan } => {
                Ok(self.inventory.create_vswitch(name, *vlan).await?)
            }
            SegmentPlan::Recreate { existing } => {
                info!(vswitch_id = %existing.id, "Deleting vSwitch");
                self.inventory.delete_vswitch(&existing.id).await?;

                info!(settle_secs = self.settle.as_secs(), "Waiting for deletion to settle");
                settle(self.settle, &self.cancel)
                    .await
                    .map_err(|_| VSwitchError::Cancelled)?;

                let vswitches = self.inventory.list_vswitches().await?;
                let vlan = next_free_vlan(&vswitches).ok_or(VSwitchError::NoFreeVlan)?;
                Ok(self.inventory.create_vswitch(&existing.name, vlan).await?)
            }
        }
    }

    /// Attach `server_ids` and wait until every one reports ready.
    ///
    /// # Errors
    ///
    /// [`VSwitchError::AttachmentFailed`] as soon as any server reports
    /// failed, [`VSwitchError::Timeout`] when the budget runs out.
    pub async fn attach_and_monitor(
        &self,
        vswitch_id: &str,
        server_ids: &[String],
        progress: &dyn ProgressSink,
    ) -> Result<AttachmentOutcome, VSwitchError> {
        let details = self.inventory.get_vswitch(vswitch_id).await?;
        let requested: Vec<String> = server_ids
            .iter()
            .filter(|id| !details.status_of(id).is_settling_or_ready())
            .cloned()
            .collect();

        if requested.is_empty() {
            info!(vswitch_id = %vswitch_id, "All servers already attached or attaching");
        } else {
            self.inventory.attach_servers(vswitch_id, &requested).await?;
        }

        let poller = Poller::new(self.poll_interval, self.timeout, self.cancel.clone());
        loop {
            let details = self.inventory.get_vswitch(vswitch_id).await?;
            let statuses: Vec<(String, AttachmentStatus)> = server_ids
                .iter()
                .map(|id| (id.clone(), details.status_of(id)))
                .collect();

            let entries: Vec<ProgressEntry> = statuses
                .iter()
                .map(|(id, status)| ProgressEntry {
                    id: id.clone(),
                    label: id.clone(),
                    state: status.to_string(),
                    done: *status == AttachmentStatus::Ready,
                })
                .collect();
            progress.update(&ProgressUpdate {
                stage: "vswitch attachment",
                elapsed: poller.elapsed(),
                timeout: poller.timeout(),
                entries: &entries,
            });

            let ready = ids_where(&statuses, |s| s == AttachmentStatus::Ready);
            let failed = ids_where(&statuses, |s| s == AttachmentStatus::Failed);
            if !failed.is_empty() {
                return Err(VSwitchError::AttachmentFailed { failed, ready });
            }
            if ready.len() == server_ids.len() {
                info!(
                    vswitch_id = %vswitch_id,
                    elapsed_secs = poller.elapsed().as_secs(),
                    "All servers attached"
                );
                return Ok(AttachmentOutcome {
                    requested,
                    ready,
                    elapsed: poller.elapsed(),
                });
            }

            match poller.tick().await {
                Ok(()) => {}
                Err(WaitError::Cancelled) => return Err(VSwitchError::Cancelled),
                Err(WaitError::Timeout { elapsed }) => {
                    let pending = ids_where(&statuses, |s| s != AttachmentStatus::Ready);
                    return Err(VSwitchError::Timeout {
                        ready,
                        pending,
                        elapsed,
                    });
                }
            }
        }
    }
}

fn ids_where(
    statuses: &[(String, AttachmentStatus)],
    pred: impl Fn(AttachmentStatus) -> bool,
) -> Vec<String> {
    statuses
        .iter()
        .filter(|(_, s)| pred(*s))
        .map(|(id, _)| id.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::poll::LogProgress;
    use crate::testing::FakeInventory;
    use std::collections::VecDeque;

    fn ids(list: &[&str]) -> Vec<String> {
        list.iter().map(ToString::to_string).collect()
    }

    fn vswitch(vlan: u16, cancelled: bool) -> VSwitch {
        VSwitch {
            id: vlan.to_string(),
            name: format!("vs-{vlan}"),
            vlan,
            cancelled,
        }
    }

    #[test]
    fn test_next_free_vlan_skips_live_segments() {
        assert_eq!(next_free_vlan(&[]), Some(4000));
        assert_eq!(
            next_free_vlan(&[vswitch(4000, false), vswitch(4001, false), vswitch(4002, true)]),
            Some(4002)
        );
        let full: Vec<VSwitch> = (VLAN_MIN..=VLAN_MAX).map(|v| vswitch(v, false)).collect();
        assert_eq!(next_free_vlan(&full), None);
    }

    #[tokio::test]
    async fn test_plan_creates_when_missing() {
        let inventory = FakeInventory::with_servers(0);
        inventory.add_vswitch("1", "other", 4000, false);
        let manager = VSwitchManager::new(&inventory, CancellationToken::new());

        let plan = manager.plan_segment("prod", &FixedConsent(false)).await.unwrap();
        assert_eq!(
            plan,
            SegmentPlan::Create {
                name: "prod".into(),
                vlan: 4001
            }
        );
        assert!(inventory.calls().is_empty());
    }

    #[tokio::test]
    async fn test_plan_reuses_plain_segment() {
        let inventory = FakeInventory::with_servers(0);
        inventory.add_vswitch("7", "prod", 4005, false);
        let manager = VSwitchManager::new(&inventory, CancellationToken::new());

        let plan = manager.plan_segment("prod", &FixedConsent(false)).await.unwrap();
        assert!(matches!(plan, SegmentPlan::Reuse { ref vswitch } if vswitch.id == "7"));
    }

    #[tokio::test]
    async fn test_cloud_bound_segment_needs_consent() {
        let inventory = FakeInventory::with_servers(0);
        inventory.add_vswitch("7", "prod", 4000, true);
        let manager = VSwitchManager::new(&inventory, CancellationToken::new());

        let err = manager
            .plan_segment("prod", &FixedConsent(false))
            .await
            .unwrap_err();
        assert!(matches!(err, VSwitchError::CloudNetworkBound { ref id, .. } if id == "7"));
        assert!(err.to_string().contains("cloud network"));

        let plan = manager.plan_segment("prod", &FixedConsent(true)).await.unwrap();
        assert!(matches!(plan, SegmentPlan::Recreate { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_recreate_deletes_settles_and_creates() {
        let inventory = FakeInventory::with_servers(0);
        inventory.add_vswitch("7", "prod", 4000, true);
        let manager = VSwitchManager::new(&inventory, CancellationToken::new());
        let plan = manager.plan_segment("prod", &FixedConsent(true)).await.unwrap();

        let start = tokio::time::Instant::now();
        let created = manager.ensure_segment(&plan).await.unwrap();
        assert!(start.elapsed() >= DELETE_SETTLE);
        assert_eq!(created.name, "prod");
        // The deleted segment's VLAN is free again.
        assert_eq!(created.vlan, 4000);
        assert_eq!(
            inventory.calls(),
            vec!["delete_vswitch:7".to_string(), "create_vswitch:prod:4000".to_string()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_attach_batches_and_waits_for_ready() {
        let inventory = FakeInventory::with_servers(3);
        inventory.add_vswitch("50", "prod", 4000, false);
        for id in ["1", "2", "3"] {
            inventory.state().attach_progress.insert(
                id.to_string(),
                VecDeque::from(vec![AttachmentStatus::InProcess, AttachmentStatus::Ready]),
            );
        }
        let manager = VSwitchManager::new(&inventory, CancellationToken::new());

        let outcome = manager
            .attach_and_monitor("50", &ids(&["1", "2", "3"]), &LogProgress)
            .await
            .unwrap();
        assert_eq!(outcome.requested, ids(&["1", "2", "3"]));
        assert_eq!(outcome.ready.len(), 3);
        assert_eq!(inventory.calls_matching("attach"), vec!["attach:50:1,2,3"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attach_skips_already_attached() {
        let inventory = FakeInventory::with_servers(2);
        inventory.add_vswitch("50", "prod", 4000, false);
        inventory
            .attach_servers("50", &ids(&["1"]))
            .await
            .unwrap();
        inventory.state().calls.clear();
        inventory
            .state()
            .attach_progress
            .insert("1".into(), VecDeque::from(vec![AttachmentStatus::Ready]));
        inventory
            .state()
            .attach_progress
            .insert("2".into(), VecDeque::from(vec![AttachmentStatus::Ready]));

        let manager = VSwitchManager::new(&inventory, CancellationToken::new());
        manager
            .attach_and_monitor("50", &ids(&["1", "2"]), &LogProgress)
            .await
            .unwrap();
        assert_eq!(inventory.calls_matching("attach"), vec!["attach:50:2"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_attachment_aborts_immediately() {
        let inventory = FakeInventory::with_servers(3);
        inventory.add_vswitch("50", "prod", 4000, false);
        let script = [
            ("1", AttachmentStatus::Ready),
            ("2", AttachmentStatus::Ready),
            ("3", AttachmentStatus::Failed),
        ];
        {
            let mut state = inventory.state();
            for (id, status) in script {
                // First get_vswitch (before attach) sees nothing; the poll sees the status.
                state
                    .attach_progress
                    .insert(id.into(), VecDeque::from(vec![status]));
            }
        }
        let manager = VSwitchManager::new(&inventory, CancellationToken::new());

        let start = tokio::time::Instant::now();
        let err = manager
            .attach_and_monitor("50", &ids(&["1", "2", "3"]), &LogProgress)
            .await
            .unwrap_err();
        match err {
            VSwitchError::AttachmentFailed { failed, ready } => {
                assert_eq!(failed, ids(&["3"]));
                assert_eq!(ready, ids(&["1", "2"]));
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert!(start.elapsed() < ATTACH_POLL_INTERVAL);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attach_timeout_names_pending() {
        let inventory = FakeInventory::with_servers(2);
        inventory.add_vswitch("50", "prod", 4000, false);
        inventory
            .state()
            .attach_progress
            .insert("1".into(), VecDeque::from(vec![AttachmentStatus::Ready]));
        let manager = VSwitchManager::new(&inventory, CancellationToken::new());

        let err = manager
            .attach_and_monitor("50", &ids(&["1", "2"]), &LogProgress)
            .await
            .unwrap_err();
        match err {
            VSwitchError::Timeout {
                ready,
                pending,
                elapsed,
            } => {
                assert_eq!(ready, ids(&["1"]));
                assert_eq!(pending, ids(&["2"]));
                assert!(elapsed >= ATTACH_TIMEOUT);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }
}
