//! A fresh three-node HA cluster from planning through the rescue cycle.

use std::collections::{BTreeSet, VecDeque};

use tokio_util::sync::CancellationToken;

use crate::poll::LogProgress;
use crate::providers::AttachmentStatus;
use crate::rescue::RescueManager;
use crate::testing::{FakeInventory, ScriptedProbe};
use crate::topology::{assign_roles, validate_selection, ClusterTopology, ServerRole};
use crate::vswitch::{FixedConsent, SegmentPlan, VSwitchManager, VLAN_MAX, VLAN_MIN};
use crate::NetworkRanges;

#[tokio::test(start_paused = true)]
async fn test_fresh_ha_cluster_selection() {
    let inventory = FakeInventory::with_servers(3);
    inventory.add_vswitch("900", "staging", 4000, false);
    for id in ["1", "2", "3"] {
        inventory.state().attach_progress.insert(
            id.to_string(),
            VecDeque::from(vec![AttachmentStatus::InProcess, AttachmentStatus::Ready]),
        );
    }
    let ids: Vec<String> = ["1", "2", "3"].iter().map(ToString::to_string).collect();
    let cancel = CancellationToken::new();

    validate_selection(ClusterTopology::HaCluster, &ids).unwrap();
    let roles = assign_roles(ClusterTopology::HaCluster, ids.len());
    assert_eq!(roles, vec![ServerRole::ControlPlane; 3]);

    let ranges = NetworkRanges::from_octets(24, 48).unwrap();
    let private: BTreeSet<_> = (0..ids.len())
        .map(|i| ranges.private_ip(i).unwrap())
        .collect();
    assert_eq!(private.len(), 3);
    assert!(private.iter().all(|ip| ranges.vswitch_subnet.contains(ip)));

    let manager = VSwitchManager::new(&inventory, cancel.clone());
    let plan = manager
        .plan_segment("prod", &FixedConsent(false))
        .await
        .unwrap();
    let SegmentPlan::Create { vlan, .. } = plan else {
        panic!("expected a new segment, got {plan:?}");
    };
    assert!((VLAN_MIN..=VLAN_MAX).contains(&vlan));
    assert_ne!(vlan, 4000);

    let vswitch = manager.ensure_segment(&plan).await.unwrap();
    let attached = manager
        .attach_and_monitor(&vswitch.id, &ids, &LogProgress)
        .await
        .unwrap();
    assert_eq!(attached.ready.len(), 3);
    assert_eq!(
        inventory.calls_matching("attach"),
        vec![format!("attach:{}:1,2,3", vswitch.id)]
    );

    let probe = ScriptedProbe::reachable();
    let outcome = RescueManager::new(&inventory, &probe, &LogProgress, cancel)
        .run(&inventory.targets())
        .await
        .unwrap();
    assert_eq!(outcome.passwords.len(), 3);
    let distinct: BTreeSet<_> = outcome.passwords.values().collect();
    assert_eq!(distinct.len(), 3);
    assert_eq!(inventory.calls_matching("reset").len(), 3);
}
