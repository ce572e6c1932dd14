//! Provisioning orchestration.
//!
//! Sequences the phases after server selection:
//! - Talos installation through the provision module
//! - Network discovery over the maintenance API
//! - Control plane endpoint DNS
//! - Talos bootstrap and credential export
//! - Health checks
//! - In-cluster bootstrap components
//!
//! State is saved after every phase; a failed run can be resumed at any phase.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use dialoguer::Input;
use robot_metal::network::with_prefix;
use robot_metal::poll::{wait_for_all, Poller, ProgressSink};
use robot_metal::probe::TALOS_API_PORT;
use robot_metal::talos::{DiscoveryTarget, MaintenanceApi, NetworkDiscovery};
use robot_metal::{MaintenanceProbe, TcpProbe};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{ClusterConfig, WaitBudget};
use crate::dns::{wait_for_records, Resolver};
use crate::health::check_cluster;
use crate::infra::{
    apply_module, disk_discovery, write_ssh_keypair, write_talos_credentials, BootstrapVars,
    Module, OutputMap, ProvisionServer, ProvisionVars, SshKeypair, TalosNode, TalosOutputs,
    TalosVars, TerraformRunner,
};
use crate::state::{ClusterState, CredentialPaths, Phase};
use crate::ui;

/// External systems the phases talk to.
pub struct Services<'a> {
    pub terraform: &'a dyn TerraformRunner,
    pub maintenance: Arc<dyn MaintenanceApi>,
    pub resolver: &'a dyn Resolver,
    pub progress: &'a dyn ProgressSink,
    pub cancel: CancellationToken,
}

/// Runs the phases after selection to completion.
pub struct Provisioner<'a> {
    config: ClusterConfig,
    state: ClusterState,
    services: Services<'a>,
    assume_yes: bool,
}

impl<'a> Provisioner<'a> {
    /// Provisioner over a state whose selection stage has completed.
    ///
    /// # Errors
    ///
    /// Returns an error if the state has no completed selection.
    pub fn new(config: ClusterConfig, state: ClusterState, services: Services<'a>) -> Result<Self> {
        if !state.selection_complete {
            bail!(
                "Server selection has not completed for cluster '{}'; run provision without --resume",
                state.cluster_name
            );
        }
        Ok(Self {
            config,
            state,
            services,
            assume_yes: false,
        })
    }

    /// Skip operator prompts.
    #[must_use]
    pub fn assume_yes(mut self, yes: bool) -> Self {
        self.assume_yes = yes;
        self
    }

    /// Persisted state.
    #[must_use]
    pub fn state(&self) -> &ClusterState {
        &self.state
    }

    /// Run every phase from `start` onwards.
    ///
    /// # Errors
    ///
    /// Returns the first phase error. The error is recorded in the state so a
    /// later run can resume at the failed phase.
    pub async fn run_to_completion(&mut self, start: Phase) -> Result<()> {
        ui::print_section("Provisioning");
        if start != Phase::Provision {
            ui::print_info(&format!("Resuming at phase: {start}"));
            if let Some(ref err) = self.state.last_error {
                ui::print_warning(&format!("Previous error: {err}"));
            }
        }

        for phase in start.from_here() {
            ui::print_progress_step(phase.step_number(), Phase::TOTAL, phase.description());

            if let Err(e) = self.execute(phase).await {
                self.state.record_error(&format!("{e:#}"))?;
                error!(phase = %phase, error = %e, "Provisioning failed");
                ui::print_error(&format!("Provisioning failed at phase '{phase}': {e}"));
                ui::print_info(&format!(
                    "State has been saved. Re-run with --resume {phase} to continue."
                ));
                return Err(e);
            }

            self.state.complete_phase(phase)?;
        }

        self.print_success_summary();
        Ok(())
    }

    async fn execute(&mut self, phase: Phase) -> Result<()> {
        info!(phase = %phase, "Executing phase");
        if self.services.cancel.is_cancelled() {
            bail!("Cancelled before phase {phase}");
        }

        match phase {
            Phase::Provision => self.provision().await,
            Phase::NetworkDiscovery => self.discover_network().await,
            Phase::EndpointDns => self.configure_endpoint().await,
            Phase::Bootstrap => self.bootstrap().await,
            Phase::HealthCheck => self.health_check().await,
            Phase::PostBootstrapInstall => self.install_bootstrap_components().await,
        }
    }

    fn poller(&self, budget: WaitBudget) -> Poller {
        Poller::new(budget.interval, budget.timeout, self.services.cancel.clone())
    }

    fn module_paths(&self, module: Module) -> (PathBuf, PathBuf) {
        (
            self.config.modules_dir.join(module.dir_name()),
            self.state.output_dir().join(module.dir_name()),
        )
    }

    // Phases

    async fn provision(&mut self) -> Result<()> {
        let vars = ProvisionVars {
            cluster_name: self.config.name.clone(),
            talos_version: self.config.talos_version.clone(),
            servers: self
                .state
                .servers
                .iter()
                .map(|s| ProvisionServer {
                    id: s.id.clone(),
                    name: s.name.clone(),
                    ip: s.ip.clone(),
                    role: s.role.to_string(),
                    rescue_password: self.state.rescue_passwords.get(&s.id).cloned(),
                })
                .collect(),
        };

        let (source, workspace) = self.module_paths(Module::Provision);
        let outputs = apply_module(self.services.terraform, &source, &workspace, &vars)
            .await
            .context("Provision module failed")?;
        self.record_disks(&outputs)?;
        self.store_ssh_keypair(&outputs)?;

        ui::print_step("Waiting for Talos on every server");
        let poller = self.poller(self.config.timeouts().availability);
        let elapsed = wait_for_all(
            "Talos availability",
            &self.state.targets(),
            &TcpProbe::new(TALOS_API_PORT),
            &poller,
            self.services.progress,
        )
        .await
        .context("Servers did not come up with Talos")?;
        ui::print_success(&format!(
            "All servers are running Talos ({}s)",
            elapsed.as_secs()
        ));
        Ok(())
    }

    fn record_disks(&mut self, outputs: &OutputMap) -> Result<()> {
        let ids: Vec<String> = self.state.servers.iter().map(|s| s.id.clone()).collect();
        let disks = disk_discovery(outputs, &ids)?;

        for (id, discovery) in disks {
            let Some(server) = self.state.server_mut(&id) else {
                continue;
            };
            server.install_disk = discovery.install_disk();
            server.storage_disks = discovery.storage_disks();
            info!(
                server_id = %id,
                install_disk = ?server.install_disk,
                storage_disks = server.storage_disks.len(),
                "Recorded disk layout"
            );
        }
        for server in &self.state.servers {
            if server.install_disk.is_none() {
                ui::print_warning(&format!(
                    "No install disk discovered for {}; Talos will pick its default",
                    server.label()
                ));
            }
        }
        self.state.save()
    }

    /// Keep the rescue SSH key next to the other credentials. A module
    /// without the key outputs only produces a warning.
    fn store_ssh_keypair(&mut self, outputs: &OutputMap) -> Result<()> {
        let keypair = match SshKeypair::from_outputs(outputs) {
            Ok(keypair) => keypair,
            Err(e) => {
                warn!(error = %e, "No SSH keypair in provision outputs");
                ui::print_warning(&format!("SSH keypair not stored: {e}"));
                return Ok(());
            }
        };
        let path = write_ssh_keypair(&keypair, &self.config.credentials_dir())?;
        ui::print_success(&format!("Wrote SSH private key to {}", path.display()));
        self.state.credentials.ssh_private_key = Some(path);
        self.state.save()
    }

    /// Reload disk layout from the provision workspace when resuming past it.
    async fn ensure_disks(&mut self) -> Result<()> {
        if self.state.servers.iter().all(|s| s.install_disk.is_some()) {
            return Ok(());
        }
        let (_, workspace) = self.module_paths(Module::Provision);
        if !workspace.is_dir() {
            return Ok(());
        }
        info!(workspace = %workspace.display(), "Reading disk layout from provision outputs");
        let outputs = self
            .services
            .terraform
            .output(&workspace)
            .await
            .context("Failed to read provision outputs")?;
        self.record_disks(&outputs)
    }

    async fn discover_network(&mut self) -> Result<()> {
        let ranges = self
            .state
            .ranges
            .ok_or_else(|| anyhow!("No network ranges in state"))?;

        ui::print_step("Waiting for the maintenance API");
        let poller = self.poller(self.config.timeouts().maintenance);
        let probe = MaintenanceProbe::new(Arc::clone(&self.services.maintenance));
        wait_for_all(
            "Maintenance API",
            &self.state.targets(),
            &probe,
            &poller,
            self.services.progress,
        )
        .await
        .context("Maintenance API did not become available")?;

        let targets: Vec<DiscoveryTarget> = self
            .state
            .servers
            .iter()
            .map(|s| DiscoveryTarget {
                server_id: s.id.clone(),
                name: s.name.clone(),
                public_ip: s.ip.clone(),
                private_ip: Some(s.private_ip),
            })
            .collect();
        let report = NetworkDiscovery::new(self.services.maintenance.as_ref(), &ranges)
            .discover_all(&targets)
            .await;

        for server in &report.servers {
            if let Some(ref e) = server.error {
                ui::print_warning(&format!("{}: discovery failed: {e}", server.name));
            }
            for warning in &server.warnings {
                ui::print_warning(&format!("{}: {warning}", server.name));
            }
        }

        let succeeded = report.success_count();
        if succeeded == 0 {
            bail!("Network discovery failed on every server");
        }
        if report.success {
            ui::print_success(&format!("Discovered networks on {succeeded} servers"));
        } else {
            warn!(
                succeeded,
                total = report.servers.len(),
                "Network discovery partially failed"
            );
            ui::print_warning(&format!(
                "Discovered networks on {succeeded} of {} servers",
                report.servers.len()
            ));
        }
        self.state.set_discovery(report.servers)
    }

    async fn configure_endpoint(&mut self) -> Result<()> {
        let host = self.config.endpoint_host();
        let ips = self.state.control_plane_ips();
        if ips.is_empty() {
            bail!("No control plane servers in state");
        }

        ui::print_info("Create these DNS records before continuing:");
        println!();
        ui::print_dns_records(&host, &ips);
        println!();

        if self.assume_yes {
            info!(host = %host, "Not waiting for operator; polling DNS directly");
        } else {
            Input::<String>::new()
                .with_prompt("Press ENTER once the records exist")
                .allow_empty(true)
                .interact_text()
                .context("Failed to read confirmation")?;
        }

        ui::print_step(&format!("Waiting for {host} to resolve"));
        let poller = self.poller(self.config.timeouts().dns);
        let elapsed = wait_for_records(
            self.services.resolver,
            &host,
            &ips,
            &poller,
            self.services.progress,
        )
        .await
        .with_context(|| format!("DNS records for {host} did not propagate"))?;
        ui::print_success(&format!(
            "{host} resolves to every control plane ({}s)",
            elapsed.as_secs()
        ));

        self.state.set_endpoint(self.config.endpoint_url())
    }

    fn endpoint(&self) -> String {
        self.state
            .endpoint
            .clone()
            .unwrap_or_else(|| self.config.endpoint_url())
    }

    fn talos_vars(&self) -> Result<TalosVars> {
        let ranges = self
            .state
            .ranges
            .ok_or_else(|| anyhow!("No network ranges in state"))?;
        let vswitch = self
            .state
            .vswitch
            .clone()
            .ok_or_else(|| anyhow!("No vSwitch in state"))?;

        let nodes = self
            .state
            .servers
            .iter()
            .map(|s| {
                let discovered = self.state.discovered(&s.id).cloned().unwrap_or_default();
                TalosNode {
                    id: s.id.clone(),
                    name: s.name.clone(),
                    role: s.role.to_string(),
                    public_ip: s.ip.clone(),
                    private_ip: s.private_ip.to_string(),
                    public_interface: discovered.public_interface,
                    public_address: discovered.public_address,
                    public_gateway: discovered.public_gateway,
                    private_interface: discovered.private_interface,
                    private_address: discovered
                        .private_address
                        .or_else(|| Some(with_prefix(s.private_ip, &ranges.vswitch_subnet))),
                    install_disk: s.install_disk.clone(),
                    storage_disks: s.storage_disks.clone(),
                }
            })
            .collect();

        Ok(TalosVars {
            cluster_name: self.config.name.clone(),
            cluster_endpoint: self.endpoint(),
            talos_version: self.config.talos_version.clone(),
            vlan_id: vswitch.vlan,
            vswitch_id: vswitch.id,
            cluster_network: ranges.cluster.to_string(),
            vswitch_subnet: ranges.vswitch_subnet.to_string(),
            vswitch_gateway: ranges.vswitch_gateway().to_string(),
            load_balancer_subnet: ranges.load_balancer_subnet.to_string(),
            nodes,
        })
    }

    async fn bootstrap(&mut self) -> Result<()> {
        self.ensure_disks().await?;
        let vars = self.talos_vars()?;

        let (source, workspace) = self.module_paths(Module::Talos);
        let outputs = apply_module(self.services.terraform, &source, &workspace, &vars)
            .await
            .context("Talos module failed")?;
        let talos = TalosOutputs::from_outputs(&outputs)?;

        let written =
            write_talos_credentials(&talos, &self.config.talos_dir(), &self.config.credentials_dir())?;
        ui::print_success("Cluster bootstrapped");
        ui::print_kv("kubeconfig", &written.kubeconfig.display().to_string());
        ui::print_kv("talosconfig", &written.talosconfig.display().to_string());
        ui::print_kv(
            "Machine configs",
            &format!(
                "{} files in {}",
                written.machine_configs.len(),
                self.config.credentials_dir().display()
            ),
        );

        self.state.set_credentials(CredentialPaths {
            kubeconfig: Some(written.kubeconfig),
            talosconfig: Some(written.talosconfig),
            machine_configs: written.machine_configs,
            ssh_private_key: self.state.credentials.ssh_private_key.clone(),
        })
    }

    fn kubeconfig_path(&self) -> PathBuf {
        self.state
            .credentials
            .kubeconfig
            .clone()
            .unwrap_or_else(|| self.config.kubeconfig_path())
    }

    async fn health_check(&mut self) -> Result<()> {
        let kubeconfig = self.kubeconfig_path();
        if !kubeconfig.exists() {
            bail!(
                "kubeconfig not found at {}; resume at bootstrap to regenerate it",
                kubeconfig.display()
            );
        }

        let budget = self.config.timeouts().health;
        check_cluster(
            &self.state.targets(),
            &self.endpoint(),
            &kubeconfig,
            &self.poller(budget),
            &self.poller(budget),
            self.services.progress,
        )
        .await?;
        ui::print_success("Cluster is healthy");
        Ok(())
    }

    async fn install_bootstrap_components(&mut self) -> Result<()> {
        let ranges = self
            .state
            .ranges
            .ok_or_else(|| anyhow!("No network ranges in state"))?;
        let vars = BootstrapVars {
            cluster_name: self.config.name.clone(),
            kubeconfig_path: self.kubeconfig_path().display().to_string(),
            cluster_endpoint: self.endpoint(),
            load_balancer_subnet: ranges.load_balancer_subnet.to_string(),
        };

        let (source, workspace) = self.module_paths(Module::Bootstrap);
        apply_module(self.services.terraform, &source, &workspace, &vars)
            .await
            .context("Bootstrap module failed")?;
        ui::print_success("Bootstrap components installed");
        Ok(())
    }

    fn print_success_summary(&self) {
        ui::print_section("Provisioning Complete");
        ui::print_kv("Cluster", &self.config.name);
        ui::print_kv("Endpoint", &self.endpoint());
        ui::print_kv("kubeconfig", &self.kubeconfig_path().display().to_string());
        if let Some(ref talosconfig) = self.state.credentials.talosconfig {
            ui::print_kv("talosconfig", &talosconfig.display().to_string());
        }
        if let Some(ref key) = self.state.credentials.ssh_private_key {
            ui::print_kv("SSH key", &key.display().to_string());
        }
        println!();
        ui::print_info(&format!(
            "export KUBECONFIG={}",
            self.kubeconfig_path().display()
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use robot_metal::talos::{AddressSpec, LinkSpec, MaintenanceError, RouteSpec};
    use robot_metal::{ClusterTopology, LogProgress, NetworkRanges, ServerRole};
    use std::collections::BTreeSet;
    use std::net::Ipv4Addr;
    use std::path::Path;
    use std::sync::Mutex;

    use crate::infra::OutputValue;
    use crate::state::{SelectedServer, VSwitchRecord};

    #[derive(Default)]
    struct RecordingTerraform {
        calls: Mutex<Vec<(String, PathBuf)>>,
        outputs: Mutex<OutputMap>,
    }

    impl RecordingTerraform {
        fn with_outputs(outputs: OutputMap) -> Self {
            Self {
                outputs: Mutex::new(outputs),
                ..Self::default()
            }
        }

        fn record(&self, step: &str, dir: &Path) {
            self.calls
                .lock()
                .unwrap()
                .push((step.to_string(), dir.to_path_buf()));
        }
    }

    #[async_trait]
    impl TerraformRunner for RecordingTerraform {
        async fn init(&self, dir: &Path) -> Result<()> {
            self.record("init", dir);
            Ok(())
        }
        async fn validate(&self, dir: &Path) -> Result<()> {
            self.record("validate", dir);
            Ok(())
        }
        async fn apply(&self, dir: &Path) -> Result<()> {
            self.record("apply", dir);
            Ok(())
        }
        async fn output(&self, dir: &Path) -> Result<OutputMap> {
            self.record("output", dir);
            Ok(self.outputs.lock().unwrap().clone())
        }
    }

    struct NoMaintenance;

    #[async_trait]
    impl MaintenanceApi for NoMaintenance {
        async fn version(&self, _: &str) -> Result<String, MaintenanceError> {
            Err(MaintenanceError::Command {
                command: "version".into(),
                stderr: "connection refused".into(),
            })
        }
        async fn addresses(&self, _: &str) -> Result<Vec<AddressSpec>, MaintenanceError> {
            Ok(Vec::new())
        }
        async fn links(&self, _: &str) -> Result<Vec<LinkSpec>, MaintenanceError> {
            Ok(Vec::new())
        }
        async fn routes(&self, _: &str) -> Result<Vec<RouteSpec>, MaintenanceError> {
            Ok(Vec::new())
        }
    }

    struct StaticResolver;

    #[async_trait]
    impl Resolver for StaticResolver {
        async fn lookup_ipv4(&self, _: &str) -> std::io::Result<BTreeSet<Ipv4Addr>> {
            Ok(BTreeSet::new())
        }
    }

    fn output(value: serde_json::Value) -> OutputValue {
        OutputValue {
            sensitive: true,
            value,
        }
    }

    fn selected_state(dir: &Path) -> ClusterState {
        let mut state = ClusterState::new("prod", ClusterTopology::SingleNode, dir);
        let ranges = NetworkRanges::from_octets(20, 32).unwrap();
        state
            .record_selection(
                vec![SelectedServer {
                    id: "101".into(),
                    name: "node-1".into(),
                    ip: "203.0.113.1".into(),
                    private_ip: Ipv4Addr::new(172, 20, 32, 10),
                    role: ServerRole::ControlPlaneAndWorker,
                    product: "AX52".into(),
                    dc: "FSN1-DC14".into(),
                    install_disk: None,
                    storage_disks: Vec::new(),
                }],
                ranges,
                VSwitchRecord {
                    id: "55".into(),
                    vlan: 4001,
                },
                [("101".to_string(), "secret".to_string())].into(),
            )
            .unwrap();
        state
    }

    fn config(dir: &Path) -> ClusterConfig {
        let mut config = ClusterConfig::with_defaults(
            "prod".into(),
            "example.com".into(),
            ClusterTopology::SingleNode,
        );
        config.output_dir = Some(dir.join("out"));
        config.modules_dir = dir.join("modules");
        for module in [Module::Provision, Module::Talos, Module::Bootstrap] {
            std::fs::create_dir_all(config.modules_dir.join(module.dir_name())).unwrap();
        }
        config
    }

    fn services<'a>(
        terraform: &'a RecordingTerraform,
        resolver: &'a StaticResolver,
    ) -> Services<'a> {
        Services {
            terraform,
            maintenance: Arc::new(NoMaintenance),
            resolver,
            progress: &LogProgress,
            cancel: CancellationToken::new(),
        }
    }

    #[test]
    fn test_requires_completed_selection() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let state = ClusterState::new("prod", ClusterTopology::SingleNode, &config.output_dir());
        let terraform = RecordingTerraform::default();
        let result = Provisioner::new(config, state, services(&terraform, &StaticResolver));
        assert!(result.is_err());
    }

    #[test]
    fn test_talos_vars_fall_back_to_planned_private_address() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let state = selected_state(&config.output_dir());
        let terraform = RecordingTerraform::default();
        let provisioner =
            Provisioner::new(config, state, services(&terraform, &StaticResolver)).unwrap();

        let vars = provisioner.talos_vars().unwrap();
        assert_eq!(vars.cluster_endpoint, "https://kube.example.com:6443");
        assert_eq!(vars.vlan_id, 4001);
        assert_eq!(vars.vswitch_id, "55");
        assert_eq!(vars.nodes.len(), 1);
        assert_eq!(
            vars.nodes[0].private_address.as_deref(),
            Some("172.20.32.10/20")
        );
        assert_eq!(vars.nodes[0].public_interface, None);
    }

    #[tokio::test]
    async fn test_post_bootstrap_install_applies_bootstrap_module() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let state = selected_state(&config.output_dir());
        let terraform = RecordingTerraform::default();
        let workspace = config.output_dir().join(Module::Bootstrap.dir_name());
        let mut provisioner =
            Provisioner::new(config, state, services(&terraform, &StaticResolver)).unwrap();

        provisioner
            .run_to_completion(Phase::PostBootstrapInstall)
            .await
            .unwrap();

        let calls = terraform.calls.lock().unwrap();
        let steps: Vec<&str> = calls.iter().map(|(s, _)| s.as_str()).collect();
        assert_eq!(steps, vec!["init", "validate", "apply", "output"]);
        assert!(calls.iter().all(|(_, d)| d == &workspace));
        assert_eq!(
            provisioner.state().completed_phase,
            Some(Phase::PostBootstrapInstall)
        );
    }

    #[tokio::test]
    async fn test_bootstrap_writes_credentials_and_reloads_disks() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let state = selected_state(&config.output_dir());
        std::fs::create_dir_all(config.output_dir().join(Module::Provision.dir_name())).unwrap();

        let outputs: OutputMap = [
            ("kubeconfig".to_string(), output("apiVersion: v1".into())),
            ("talos_config".to_string(), output("context: prod".into())),
            (
                "control_plane_machine_configurations".to_string(),
                output(serde_json::json!({ "101": "machine: {}" })),
            ),
            (
                "server_101_disk_discovery".to_string(),
                output(serde_json::json!({
                    "os_installation": {
                        "device": "nvme0n1",
                        "disk_by_id": "nvme-A",
                        "disk_by_id_path": "/dev/disk/by-id/nvme-A",
                        "full_path": "/dev/nvme0n1"
                    },
                    "all_devices": [
                        { "device": "nvme0n1", "disk_by_id": "nvme-A" },
                        { "device": "nvme1n1", "disk_by_id": "nvme-B" }
                    ]
                })),
            ),
        ]
        .into();
        let terraform = RecordingTerraform::with_outputs(outputs);
        let kubeconfig = config.kubeconfig_path();
        let mut provisioner =
            Provisioner::new(config, state, services(&terraform, &StaticResolver)).unwrap();

        provisioner.execute(Phase::Bootstrap).await.unwrap();

        assert_eq!(std::fs::read_to_string(&kubeconfig).unwrap(), "apiVersion: v1");
        let state = provisioner.state();
        assert_eq!(state.credentials.kubeconfig.as_ref(), Some(&kubeconfig));
        assert_eq!(state.credentials.machine_configs.len(), 1);
        assert_eq!(
            state.servers[0].install_disk.as_deref(),
            Some("/dev/disk/by-id/nvme-A")
        );
        assert_eq!(state.servers[0].storage_disks.len(), 1);
        assert_eq!(state.servers[0].storage_disks[0].path, "/dev/disk/by-id/nvme-B");
    }

    #[test]
    fn test_provision_outputs_store_ssh_keypair() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let output_dir = config.output_dir();
        let key_path = config.credentials_dir().join(".ssh/id_rsa");
        let state = selected_state(&output_dir);
        let terraform = RecordingTerraform::default();
        let mut provisioner =
            Provisioner::new(config, state, services(&terraform, &StaticResolver)).unwrap();

        provisioner.store_ssh_keypair(&OutputMap::new()).unwrap();
        assert_eq!(provisioner.state().credentials.ssh_private_key, None);

        let outputs: OutputMap = [
            ("ssh_private_key".to_string(), output("PRIVATE".into())),
            ("ssh_public_key".to_string(), output("ssh-rsa AAAA".into())),
        ]
        .into();
        provisioner.store_ssh_keypair(&outputs).unwrap();

        assert_eq!(std::fs::read_to_string(&key_path).unwrap(), "PRIVATE");
        let saved = ClusterState::load(&output_dir).unwrap().unwrap();
        assert_eq!(saved.credentials.ssh_private_key, Some(key_path));
    }

    #[tokio::test]
    async fn test_failed_phase_is_recorded_for_resume() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let output_dir = config.output_dir();
        let state = selected_state(&output_dir);
        let terraform = RecordingTerraform::default();
        let mut provisioner =
            Provisioner::new(config, state, services(&terraform, &StaticResolver)).unwrap();

        // No kubeconfig has been written yet.
        let err = provisioner
            .run_to_completion(Phase::HealthCheck)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("kubeconfig not found"));

        let saved = ClusterState::load(&output_dir).unwrap().unwrap();
        assert!(saved
            .last_error
            .as_deref()
            .unwrap()
            .contains("kubeconfig not found"));
        assert_eq!(saved.completed_phase, None);
        assert_eq!(saved.next_phase(), Some(Phase::Provision));
    }

    #[tokio::test]
    async fn test_cancelled_run_stops_before_next_phase() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let state = selected_state(&config.output_dir());
        let terraform = RecordingTerraform::default();
        let services = services(&terraform, &StaticResolver);
        services.cancel.cancel();
        let mut provisioner = Provisioner::new(config, state, services).unwrap();

        assert!(provisioner.run_to_completion(Phase::Provision).await.is_err());
        assert!(terraform.calls.lock().unwrap().is_empty());
    }
}
