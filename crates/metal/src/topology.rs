//! Cluster topologies and role assignment.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Number of control-plane nodes in an HA cluster.
pub const HA_CONTROL_PLANE_COUNT: usize = 3;

/// Errors from validating a server selection.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum SelectionError {
    /// Unrecognized topology name.
    #[error("unknown topology '{0}' (expected single-node, multi-node or ha-cluster)")]
    UnknownTopology(String),

    /// Fewer servers than the topology needs.
    #[error("{topology} requires at least {required} server(s), {selected} selected")]
    TooFewServers {
        topology: ClusterTopology,
        required: usize,
        selected: usize,
    },

    /// More servers than the topology allows.
    #[error("{topology} allows at most {allowed} server(s), {selected} selected")]
    TooManyServers {
        topology: ClusterTopology,
        allowed: usize,
        selected: usize,
    },

    /// The same server was selected twice.
    #[error("server {0} selected more than once")]
    DuplicateServer(String),

    /// A configured server id is not in the inventory (or is cancelled).
    #[error("server {0} not found in inventory")]
    UnknownServer(String),
}

/// Target control-plane/worker shape of a cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ClusterTopology {
    /// One server running both roles.
    SingleNode,
    /// One control plane, the rest workers.
    MultiNode,
    /// Three control planes, the rest workers.
    HaCluster,
}

impl ClusterTopology {
    /// Minimum number of servers for this topology.
    #[must_use]
    pub const fn min_servers(self) -> usize {
        match self {
            Self::SingleNode => 1,
            Self::MultiNode => 2,
            Self::HaCluster => 3,
        }
    }

    /// Maximum number of servers, if bounded.
    #[must_use]
    pub const fn max_servers(self) -> Option<usize> {
        match self {
            Self::SingleNode => Some(1),
            Self::MultiNode | Self::HaCluster => None,
        }
    }

    /// All topologies, in prompt order.
    #[must_use]
    pub const fn all() -> [Self; 3] {
        [Self::SingleNode, Self::MultiNode, Self::HaCluster]
    }

    /// Short description for prompts.
    #[must_use]
    pub const fn description(self) -> &'static str {
        match self {
            Self::SingleNode => "Single node (control plane + worker)",
            Self::MultiNode => "Multi node (1 control plane, N workers)",
            Self::HaCluster => "HA cluster (3 control planes, N workers)",
        }
    }
}

impl fmt::Display for ClusterTopology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SingleNode => write!(f, "single-node"),
            Self::MultiNode => write!(f, "multi-node"),
            Self::HaCluster => write!(f, "ha-cluster"),
        }
    }
}

impl FromStr for ClusterTopology {
    type Err = SelectionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "single-node" => Ok(Self::SingleNode),
            "multi-node" => Ok(Self::MultiNode),
            "ha-cluster" => Ok(Self::HaCluster),
            other => Err(SelectionError::UnknownTopology(other.to_string())),
        }
    }
}

/// Role of a server in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ServerRole {
    /// Control plane only.
    #[serde(rename = "control-plane")]
    ControlPlane,
    /// Worker only.
    #[serde(rename = "worker")]
    Worker,
    /// Both roles on one machine.
    #[serde(rename = "control-plane-worker")]
    ControlPlaneAndWorker,
}

impl ServerRole {
    /// Whether the node runs the control plane.
    #[must_use]
    pub const fn is_control_plane(self) -> bool {
        matches!(self, Self::ControlPlane | Self::ControlPlaneAndWorker)
    }
}

impl fmt::Display for ServerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ControlPlane => write!(f, "control-plane"),
            Self::Worker => write!(f, "worker"),
            Self::ControlPlaneAndWorker => write!(f, "control-plane+worker"),
        }
    }
}

/// Role of the server at `index` in selection order.
///
/// Selection order is the order the operator picked servers in, not the
/// order the inventory returned them.
#[must_use]
pub fn assign_role(index: usize, topology: ClusterTopology, total: usize) -> ServerRole {
    debug_assert!(index < total.max(1));
    match topology {
        ClusterTopology::SingleNode => ServerRole::ControlPlaneAndWorker,
        ClusterTopology::MultiNode if index == 0 => ServerRole::ControlPlane,
        ClusterTopology::HaCluster if index < HA_CONTROL_PLANE_COUNT => ServerRole::ControlPlane,
        ClusterTopology::MultiNode | ClusterTopology::HaCluster => ServerRole::Worker,
    }
}

/// Roles for every server in selection order.
#[must_use]
pub fn assign_roles(topology: ClusterTopology, total: usize) -> Vec<ServerRole> {
    (0..total).map(|i| assign_role(i, topology, total)).collect()
}

/// Check an ordered selection of server ids against a topology.
///
/// # Errors
///
/// Returns an error for duplicates or a count outside the topology's bounds.
pub fn validate_selection(
    topology: ClusterTopology,
    server_ids: &[String],
) -> Result<(), SelectionError> {
    for (i, id) in server_ids.iter().enumerate() {
        if server_ids[..i].contains(id) {
            return Err(SelectionError::DuplicateServer(id.clone()));
        }
    }

    let selected = server_ids.len();
    if selected < topology.min_servers() {
        return Err(SelectionError::TooFewServers {
            topology,
            required: topology.min_servers(),
            selected,
        });
    }
    if let Some(allowed) = topology.max_servers() {
        if selected > allowed {
            return Err(SelectionError::TooManyServers {
                topology,
                allowed,
                selected,
            });
        }
    }
    Ok(())
}
