//! Cluster state persistence.
//!
//! Everything the provisioning run learns (selected servers, roles, network
//! ranges, vSwitch, rescue passwords, discovered interfaces, credential
//! paths) is written to `cluster-state.json` in the output directory after
//! each change, so a later run can resume at any phase.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use robot_metal::talos::DiscoveredNetworkInfo;
use robot_metal::{ClusterTopology, NetworkRanges, ServerRole, Target};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::infra::write_secret;

/// File name of the state record.
pub const STATE_FILE: &str = "cluster-state.json";

/// Phases after server selection, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Phase {
    /// Install Talos via the provision module and wait for the nodes.
    Provision,
    /// Read interfaces and routes from the maintenance API.
    NetworkDiscovery,
    /// Publish and verify the API endpoint records.
    EndpointDns,
    /// Generate machine configs and bootstrap Kubernetes.
    Bootstrap,
    /// Wait for nodes and the Kubernetes API.
    HealthCheck,
    /// Apply the in-cluster bootstrap module.
    PostBootstrapInstall,
}

impl Phase {
    /// Every phase in order.
    pub const ALL: [Self; 6] = [
        Self::Provision,
        Self::NetworkDiscovery,
        Self::EndpointDns,
        Self::Bootstrap,
        Self::HealthCheck,
        Self::PostBootstrapInstall,
    ];

    /// Total number of phases.
    pub const TOTAL: u8 = 6;

    /// Resume name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Provision => "provision",
            Self::NetworkDiscovery => "network-discovery",
            Self::EndpointDns => "endpoint-dns",
            Self::Bootstrap => "bootstrap",
            Self::HealthCheck => "health-check",
            Self::PostBootstrapInstall => "post-bootstrap-install",
        }
    }

    /// Following phase, `None` after the last.
    #[must_use]
    pub const fn next(self) -> Option<Self> {
        match self {
            Self::Provision => Some(Self::NetworkDiscovery),
            Self::NetworkDiscovery => Some(Self::EndpointDns),
            Self::EndpointDns => Some(Self::Bootstrap),
            Self::Bootstrap => Some(Self::HealthCheck),
            Self::HealthCheck => Some(Self::PostBootstrapInstall),
            Self::PostBootstrapInstall => None,
        }
    }

    /// Human-readable description.
    #[must_use]
    pub const fn description(self) -> &'static str {
        match self {
            Self::Provision => "Installing Talos on the selected servers",
            Self::NetworkDiscovery => "Discovering node network configuration",
            Self::EndpointDns => "Configuring the control plane endpoint",
            Self::Bootstrap => "Bootstrapping the Kubernetes cluster",
            Self::HealthCheck => "Checking cluster health",
            Self::PostBootstrapInstall => "Installing cluster bootstrap components",
        }
    }

    /// One-based position for progress display.
    #[must_use]
    pub const fn step_number(self) -> u8 {
        match self {
            Self::Provision => 1,
            Self::NetworkDiscovery => 2,
            Self::EndpointDns => 3,
            Self::Bootstrap => 4,
            Self::HealthCheck => 5,
            Self::PostBootstrapInstall => 6,
        }
    }

    /// This phase and every later one.
    pub fn from_here(self) -> impl Iterator<Item = Self> {
        Self::ALL.into_iter().filter(move |p| *p >= self)
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for Phase {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|p| p.name() == s)
            .ok_or_else(|| {
                let names: Vec<&str> = Self::ALL.iter().map(|p| p.name()).collect();
                anyhow::anyhow!("Unknown phase: {s}. Supported: {}", names.join(", "))
            })
    }
}

/// Extra disk handed to the storage layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageDisk {
    /// Stable name, `storage-disk-<n>`.
    pub name: String,
    /// `/dev/disk/by-id/...` path.
    pub path: String,
}

/// A server chosen for the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectedServer {
    pub id: String,
    pub name: String,
    /// Public IPv4 address.
    pub ip: String,
    /// Address on the vSwitch subnet.
    pub private_ip: Ipv4Addr,
    pub role: ServerRole,
    pub product: String,
    pub dc: String,
    /// Talos install disk, known after provisioning.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub install_disk: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub storage_disks: Vec<StorageDisk>,
}

impl SelectedServer {
    /// `name (ip)` for display.
    #[must_use]
    pub fn label(&self) -> String {
        format!("{} ({})", self.name, self.ip)
    }

    /// Poll target on the public address.
    #[must_use]
    pub fn target(&self) -> Target {
        Target::new(self.id.clone(), self.label(), self.ip.clone())
    }
}

/// The private network segment in use.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VSwitchRecord {
    pub id: String,
    pub vlan: u16,
}

/// Files written after bootstrap.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialPaths {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubeconfig: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub talosconfig: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub machine_configs: Vec<PathBuf>,
    /// Rescue system SSH key from the provision module.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_private_key: Option<PathBuf>,
}

/// Persisted state of one cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterState {
    pub cluster_name: String,
    pub topology: ClusterTopology,
    /// Selected servers in selection order.
    #[serde(default)]
    pub servers: Vec<SelectedServer>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ranges: Option<NetworkRanges>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vswitch: Option<VSwitchRecord>,
    /// Rescue passwords by server id.
    #[serde(default)]
    pub rescue_passwords: BTreeMap<String, String>,
    /// Discovered network info per server, selection order.
    #[serde(default)]
    pub discovery: Vec<DiscoveredNetworkInfo>,
    /// Kubernetes API endpoint URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub credentials: CredentialPaths,
    /// Whether selection, attachment and the rescue cycle finished.
    #[serde(default)]
    pub selection_complete: bool,
    /// Last phase that finished.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_phase: Option<Phase>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Timestamp of last state update.
    pub updated_at: String,

    #[serde(skip)]
    output_dir: PathBuf,
}

impl ClusterState {
    /// Fresh state for a cluster.
    #[must_use]
    pub fn new(cluster_name: &str, topology: ClusterTopology, output_dir: &Path) -> Self {
        Self {
            cluster_name: cluster_name.to_string(),
            topology,
            servers: Vec::new(),
            ranges: None,
            vswitch: None,
            rescue_passwords: BTreeMap::new(),
            discovery: Vec::new(),
            endpoint: None,
            credentials: CredentialPaths::default(),
            selection_complete: false,
            completed_phase: None,
            last_error: None,
            updated_at: chrono::Utc::now().to_rfc3339(),
            output_dir: output_dir.to_path_buf(),
        }
    }

    /// State file path for an output directory.
    #[must_use]
    pub fn state_file(output_dir: &Path) -> PathBuf {
        output_dir.join(STATE_FILE)
    }

    /// Load state if present.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load(output_dir: &Path) -> Result<Option<Self>> {
        let path = Self::state_file(output_dir);
        if !path.exists() {
            return Ok(None);
        }

        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read state file {}", path.display()))?;
        let mut state: Self = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse state file {}", path.display()))?;
        state.output_dir = output_dir.to_path_buf();

        info!(
            cluster = %state.cluster_name,
            servers = state.servers.len(),
            completed = ?state.completed_phase,
            "Loaded cluster state"
        );
        Ok(Some(state))
    }

    /// Write state to disk.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save(&mut self) -> Result<()> {
        self.updated_at = chrono::Utc::now().to_rfc3339();

        std::fs::create_dir_all(&self.output_dir).with_context(|| {
            format!(
                "Failed to create output directory {}",
                self.output_dir.display()
            )
        })?;
        let content = serde_json::to_string_pretty(self).context("Failed to serialize state")?;
        // Holds rescue root passwords.
        write_secret(&Self::state_file(&self.output_dir), &content)
            .context("Failed to write state file")?;
        Ok(())
    }

    /// Output directory the state lives in.
    #[must_use]
    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Record the outcome of the selection stage.
    ///
    /// # Errors
    ///
    /// Returns an error if saving fails.
    pub fn record_selection(
        &mut self,
        servers: Vec<SelectedServer>,
        ranges: NetworkRanges,
        vswitch: VSwitchRecord,
        rescue_passwords: BTreeMap<String, String>,
    ) -> Result<()> {
        self.servers = servers;
        self.ranges = Some(ranges);
        self.vswitch = Some(vswitch);
        self.rescue_passwords = rescue_passwords;
        self.selection_complete = true;
        self.completed_phase = None;
        self.last_error = None;
        self.save()
    }

    /// Mark a phase finished.
    ///
    /// # Errors
    ///
    /// Returns an error if saving fails.
    pub fn complete_phase(&mut self, phase: Phase) -> Result<()> {
        info!(phase = %phase, "Phase complete");
        self.completed_phase = Some(phase);
        self.last_error = None;
        self.save()
    }

    /// Whether `phase` has finished in this or an earlier run.
    #[must_use]
    pub fn is_phase_complete(&self, phase: Phase) -> bool {
        self.completed_phase.is_some_and(|done| done >= phase)
    }

    /// First phase that has not finished.
    #[must_use]
    pub fn next_phase(&self) -> Option<Phase> {
        match self.completed_phase {
            None => Some(Phase::Provision),
            Some(done) => done.next(),
        }
    }

    /// Record an error for the current run.
    ///
    /// # Errors
    ///
    /// Returns an error if saving fails.
    pub fn record_error(&mut self, error: &str) -> Result<()> {
        self.last_error = Some(error.to_string());
        self.save()
    }

    /// Store discovery results.
    ///
    /// # Errors
    ///
    /// Returns an error if saving fails.
    pub fn set_discovery(&mut self, discovery: Vec<DiscoveredNetworkInfo>) -> Result<()> {
        self.discovery = discovery;
        self.save()
    }

    /// Store the endpoint URL.
    ///
    /// # Errors
    ///
    /// Returns an error if saving fails.
    pub fn set_endpoint(&mut self, endpoint: String) -> Result<()> {
        self.endpoint = Some(endpoint);
        self.save()
    }

    /// Store credential file paths.
    ///
    /// # Errors
    ///
    /// Returns an error if saving fails.
    pub fn set_credentials(&mut self, credentials: CredentialPaths) -> Result<()> {
        self.credentials = credentials;
        self.save()
    }

    /// Mutable access to a selected server.
    pub fn server_mut(&mut self, id: &str) -> Option<&mut SelectedServer> {
        self.servers.iter_mut().find(|s| s.id == id)
    }

    /// Public IPs of control plane nodes, selection order.
    #[must_use]
    pub fn control_plane_ips(&self) -> Vec<String> {
        self.servers
            .iter()
            .filter(|s| s.role.is_control_plane())
            .map(|s| s.ip.clone())
            .collect()
    }

    /// Poll targets for every selected server.
    #[must_use]
    pub fn targets(&self) -> Vec<Target> {
        self.servers.iter().map(SelectedServer::target).collect()
    }

    /// Discovery result for a server.
    #[must_use]
    pub fn discovered(&self, server_id: &str) -> Option<&DiscoveredNetworkInfo> {
        self.discovery.iter().find(|d| d.server_id == server_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn server(id: &str, role: ServerRole) -> SelectedServer {
        SelectedServer {
            id: id.to_string(),
            name: format!("node-{id}"),
            ip: format!("203.0.113.{id}"),
            private_ip: Ipv4Addr::new(172, 20, 16, 10),
            role,
            product: "AX52".to_string(),
            dc: "FSN1-DC14".to_string(),
            install_disk: None,
            storage_disks: Vec::new(),
        }
    }

    #[test]
    fn test_phase_order_and_names() {
        let mut phase = Phase::Provision;
        let mut seen = vec![phase];
        while let Some(next) = phase.next() {
            assert!(next > phase);
            seen.push(next);
            phase = next;
        }
        assert_eq!(seen, Phase::ALL.to_vec());
        assert_eq!(Phase::PostBootstrapInstall.step_number(), Phase::TOTAL);

        for phase in Phase::ALL {
            assert_eq!(Phase::from_str(phase.name()).unwrap(), phase);
        }
        assert!(Phase::from_str("ubuntu").is_err());
        assert!(Phase::from_str("").is_err());

        let rest: Vec<Phase> = Phase::Bootstrap.from_here().collect();
        assert_eq!(
            rest,
            vec![
                Phase::Bootstrap,
                Phase::HealthCheck,
                Phase::PostBootstrapInstall
            ]
        );
    }

    #[test]
    fn test_phase_serde_uses_resume_names() {
        let json = serde_json::to_string(&Phase::EndpointDns).unwrap();
        assert_eq!(json, "\"endpoint-dns\"");
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        assert!(ClusterState::load(dir.path()).unwrap().is_none());

        let mut state = ClusterState::new("prod", ClusterTopology::MultiNode, dir.path());
        let ranges = NetworkRanges::from_octets(20, 32).unwrap();
        state
            .record_selection(
                vec![
                    server("1", ServerRole::ControlPlane),
                    server("2", ServerRole::Worker),
                ],
                ranges,
                VSwitchRecord { id: "7".to_string(), vlan: 4001 },
                BTreeMap::from([("1".to_string(), "secret".to_string())]),
            )
            .unwrap();
        state.complete_phase(Phase::Provision).unwrap();

        let loaded = ClusterState::load(dir.path()).unwrap().unwrap();
        assert_eq!(loaded.cluster_name, "prod");
        assert_eq!(loaded.servers.len(), 2);
        assert_eq!(loaded.ranges, Some(ranges));
        assert_eq!(loaded.vswitch, Some(VSwitchRecord { id: "7".to_string(), vlan: 4001 }));
        assert_eq!(loaded.rescue_passwords["1"], "secret");
        assert!(loaded.selection_complete);
        assert_eq!(loaded.output_dir(), dir.path());
        assert!(loaded.is_phase_complete(Phase::Provision));
        assert!(!loaded.is_phase_complete(Phase::NetworkDiscovery));
        assert_eq!(loaded.next_phase(), Some(Phase::NetworkDiscovery));
    }

    #[cfg(unix)]
    #[test]
    fn test_state_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let mut state = ClusterState::new("prod", ClusterTopology::SingleNode, dir.path());
        state
            .rescue_passwords
            .insert("1".to_string(), "root-secret".to_string());
        state.save().unwrap();

        let mode = std::fs::metadata(ClusterState::state_file(dir.path()))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_next_phase_after_last() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = ClusterState::new("prod", ClusterTopology::SingleNode, dir.path());
        assert_eq!(state.next_phase(), Some(Phase::Provision));
        state.complete_phase(Phase::PostBootstrapInstall).unwrap();
        assert_eq!(state.next_phase(), None);
    }

    #[test]
    fn test_control_plane_ips_follow_roles() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = ClusterState::new("prod", ClusterTopology::HaCluster, dir.path());
        state.servers = vec![
            server("1", ServerRole::ControlPlane),
            server("2", ServerRole::Worker),
            server("3", ServerRole::ControlPlaneAndWorker),
        ];
        assert_eq!(
            state.control_plane_ips(),
            vec!["203.0.113.1".to_string(), "203.0.113.3".to_string()]
        );
        assert_eq!(state.targets()[1].label, "node-2 (203.0.113.2)");
    }

    #[test]
    fn test_record_error_persists() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = ClusterState::new("prod", ClusterTopology::SingleNode, dir.path());
        state.record_error("apply failed").unwrap();
        let loaded = ClusterState::load(dir.path()).unwrap().unwrap();
        assert_eq!(loaded.last_error.as_deref(), Some("apply failed"));
    }
}
