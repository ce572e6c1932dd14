//! Bare metal provisioning primitives for Hetzner Robot clusters.
//!
//! This crate talks to machines: the Robot inventory API, the per-node Talos
//! maintenance API, and ICMP/TCP reachability. It provides the building
//! blocks the installer sequences into a provisioning run:
//!
//! - [`network`]: private address planning
//! - [`topology`]: cluster shapes and role assignment
//! - [`poll`] and [`probe`]: bounded polling over a set of targets
//! - [`vswitch`]: private network segment creation and attachment
//! - [`rescue`]: rescue-mode reboot cycle
//! - [`talos`]: maintenance API and network discovery
//!
//! # Example
//!
//! ```rust,ignore
//! use robot_metal::providers::{hetzner::HetznerRobot, Inventory};
//! use robot_metal::vswitch::{FixedConsent, VSwitchManager};
//! use tokio_util::sync::CancellationToken;
//!
//! let robot = HetznerRobot::new("user", "password")?;
//! let manager = VSwitchManager::new(&robot, CancellationToken::new());
//! let plan = manager.plan_segment("prod", &FixedConsent(false)).await?;
//! let vswitch = manager.ensure_segment(&plan).await?;
//! ```

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod network;
pub mod poll;
pub mod probe;
pub mod providers;
pub mod rescue;
pub mod talos;
pub mod topology;
pub mod vswitch;

#[cfg(test)]
mod scenario;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use network::{NetworkPlanError, NetworkRanges};
pub use poll::{AvailabilityError, LogProgress, Poller, ProgressSink, Target, WaitError};
pub use probe::{IcmpProbe, MaintenanceProbe, Probe, ProbeOutcome, TcpProbe};
pub use providers::{hetzner::HetznerRobot, Inventory, ProviderError, Server};
pub use rescue::{RescueError, RescueManager, RescueOutcome};
pub use topology::{assign_role, ClusterTopology, SelectionError, ServerRole};
pub use vswitch::{Consent, SegmentPlan, VSwitchError, VSwitchManager};
