//! Server selection stage.
//!
//! Runs before anything destructive happens: picks servers, assigns roles
//! and private addresses, checks rescue support, plans the network and asks
//! for confirmation. Only then is the vSwitch attached and every server
//! driven through the rescue cycle.

use std::collections::BTreeMap;

use anyhow::{bail, Context, Result};
use dialoguer::theme::ColorfulTheme;
use dialoguer::{Confirm, Input, MultiSelect, Sort};
use rand::Rng;
use robot_metal::poll::ProgressSink;
use robot_metal::providers::VSwitch;
use robot_metal::topology::validate_selection;
use robot_metal::vswitch::Consent;
use robot_metal::{
    assign_role, ClusterTopology, Inventory, NetworkRanges, Probe, RescueManager, SelectionError,
    Server, VSwitchManager,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::ClusterConfig;
use crate::state::{ClusterState, SelectedServer, VSwitchRecord};
use crate::ui;

/// Length of the destructive-action confirmation code.
pub const CONFIRMATION_CODE_LEN: usize = 6;

/// Operator interaction during selection.
pub trait Prompter: Send + Sync {
    /// Pick servers and their order.
    ///
    /// # Errors
    ///
    /// Returns an error if the prompt cannot be shown.
    fn pick_servers(&self, available: &[Server], topology: ClusterTopology)
        -> Result<Vec<String>>;

    /// Whether a cloud-bound vSwitch may be deleted and recreated.
    fn confirm_recreate(&self, vswitch: &VSwitch) -> bool;

    /// Ask the operator to type `code`; true only on an exact match.
    ///
    /// # Errors
    ///
    /// Returns an error if input cannot be read.
    fn confirm_destructive(&self, cluster_name: &str, code: &str) -> Result<bool>;
}

/// Terminal prompts.
#[derive(Debug, Default, Clone, Copy)]
pub struct DialoguerPrompter;

impl Prompter for DialoguerPrompter {
    fn pick_servers(
        &self,
        available: &[Server],
        topology: ClusterTopology,
    ) -> Result<Vec<String>> {
        let theme = ColorfulTheme::default();
        let items: Vec<String> = available
            .iter()
            .map(|s| format!("{} - {} [{} {}]", s.id, s.label(), s.product, s.dc))
            .collect();

        let picked = MultiSelect::with_theme(&theme)
            .with_prompt(format!(
                "Select servers for a {topology} cluster ({})",
                topology.description()
            ))
            .items(&items)
            .interact()?;
        if picked.is_empty() {
            bail!("No servers selected");
        }

        let order = if picked.len() > 1 {
            let picked_items: Vec<&String> = picked.iter().map(|&i| &items[i]).collect();
            let sorted = Sort::with_theme(&theme)
                .with_prompt("Order the servers; control plane nodes come first")
                .items(&picked_items)
                .interact()?;
            sorted.into_iter().map(|i| picked[i]).collect()
        } else {
            picked
        };

        Ok(order.into_iter().map(|i| available[i].id.clone()).collect())
    }

    fn confirm_recreate(&self, vswitch: &VSwitch) -> bool {
        ui::print_warning(&format!(
            "vSwitch '{}' (id {}) is connected to a cloud network and cannot be reused.",
            vswitch.name, vswitch.id
        ));
        Confirm::with_theme(&ColorfulTheme::default())
            .with_prompt("Delete it and create a new one?")
            .default(false)
            .interact()
            .unwrap_or(false)
    }

    fn confirm_destructive(&self, cluster_name: &str, code: &str) -> Result<bool> {
        ui::print_critical_warning(cluster_name);
        let answer: String = Input::with_theme(&ColorfulTheme::default())
            .with_prompt(format!("Type {code} to proceed (anything else cancels)"))
            .allow_empty(true)
            .interact_text()?;
        Ok(answer.trim() == code)
    }
}

/// [`Consent`] backed by a [`Prompter`].
struct PromptConsent<'a>(&'a dyn Prompter);

impl Consent for PromptConsent<'_> {
    fn confirm_recreate(&self, vswitch: &VSwitch) -> bool {
        self.0.confirm_recreate(vswitch)
    }
}

/// Random lowercase confirmation code.
#[must_use]
pub fn confirmation_code<R: Rng + ?Sized>(rng: &mut R) -> String {
    (0..CONFIRMATION_CODE_LEN)
        .map(|_| char::from(rng.gen_range(b'a'..=b'z')))
        .collect()
}

/// Inventory servers in the order of `ids`.
///
/// # Errors
///
/// [`SelectionError::UnknownServer`] for an id that is not available.
pub fn resolve_servers(available: &[Server], ids: &[String]) -> Result<Vec<Server>, SelectionError> {
    ids.iter()
        .map(|id| {
            available
                .iter()
                .find(|s| &s.id == id)
                .cloned()
                .ok_or_else(|| SelectionError::UnknownServer(id.clone()))
        })
        .collect()
}

/// Assign roles and private addresses in selection order.
///
/// # Errors
///
/// Returns an error if the selection does not fit the topology or the
/// vSwitch subnet runs out of addresses.
pub fn build_selection(
    servers: &[Server],
    topology: ClusterTopology,
    ranges: &NetworkRanges,
) -> Result<Vec<SelectedServer>> {
    let ids: Vec<String> = servers.iter().map(|s| s.id.clone()).collect();
    validate_selection(topology, &ids)?;

    servers
        .iter()
        .enumerate()
        .map(|(i, server)| {
            Ok(SelectedServer {
                id: server.id.clone(),
                name: server.name.clone(),
                ip: server.ip.clone(),
                private_ip: ranges.private_ip(i)?,
                role: assign_role(i, topology, servers.len()),
                product: server.product.clone(),
                dc: server.dc.clone(),
                install_disk: None,
                storage_disks: Vec::new(),
            })
        })
        .collect()
}

/// Drives the selection stage.
pub struct SelectionStage<'a> {
    inventory: &'a dyn Inventory,
    reachability: &'a dyn Probe,
    prompter: &'a dyn Prompter,
    progress: &'a dyn ProgressSink,
    cancel: CancellationToken,
    assume_yes: bool,
}

impl<'a> SelectionStage<'a> {
    #[must_use]
    pub fn new(
        inventory: &'a dyn Inventory,
        reachability: &'a dyn Probe,
        prompter: &'a dyn Prompter,
        progress: &'a dyn ProgressSink,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            inventory,
            reachability,
            prompter,
            progress,
            cancel,
            assume_yes: false,
        }
    }

    /// Skip the typed confirmation.
    #[must_use]
    pub fn assume_yes(mut self, yes: bool) -> Self {
        self.assume_yes = yes;
        self
    }

    /// Run the stage and record its outcome in `state`.
    ///
    /// # Errors
    ///
    /// Returns an error on any precondition failure, provider error,
    /// declined confirmation, attachment failure or rescue failure. Rescue
    /// passwords captured before a failure are saved to the state first.
    pub async fn run(&self, config: &ClusterConfig, state: &mut ClusterState) -> Result<()> {
        ui::print_section("Server Selection");

        ui::print_step("Validating Robot credentials");
        self.inventory
            .validate_credentials()
            .await
            .context("Robot credentials rejected")?;

        let available: Vec<Server> = self
            .inventory
            .list_servers()
            .await
            .context("Failed to list servers")?
            .into_iter()
            .filter(|s| !s.cancelled)
            .collect();
        if available.is_empty() {
            bail!("No active servers on this Robot account");
        }
        info!(servers = available.len(), "Listed servers");

        let ids = if config.servers.is_empty() {
            self.prompter.pick_servers(&available, config.topology)?
        } else {
            config.servers.clone()
        };
        let servers = resolve_servers(&available, &ids)?;

        let ranges = NetworkRanges::generate().context("Failed to plan network ranges")?;
        let selected = build_selection(&servers, config.topology, &ranges)?;

        let targets: Vec<_> = selected.iter().map(SelectedServer::target).collect();
        let rescue = RescueManager::new(
            self.inventory,
            self.reachability,
            self.progress,
            self.cancel.clone(),
        );
        ui::print_step("Checking rescue system support");
        rescue.preflight(&targets).await?;

        let manager = VSwitchManager::new(self.inventory, self.cancel.clone());
        let plan = manager
            .plan_segment(&config.name, &PromptConsent(self.prompter))
            .await?;

        ui::print_section("Summary");
        ui::print_kv("Cluster", &config.name);
        ui::print_kv("Topology", &config.topology.to_string());
        ui::print_kv("Cluster network", &ranges.cluster.to_string());
        ui::print_kv("vSwitch subnet", &ranges.vswitch_subnet.to_string());
        ui::print_kv("Load balancer subnet", &ranges.load_balancer_subnet.to_string());
        ui::print_kv("vSwitch", &plan.describe());
        println!();
        ui::print_selection(&selected);

        if self.assume_yes {
            warn!("Skipping destructive-action confirmation");
        } else {
            let code = confirmation_code(&mut rand::thread_rng());
            if !self.prompter.confirm_destructive(&config.name, &code)? {
                bail!("Provisioning cancelled: confirmation code did not match");
            }
        }

        ui::print_step(&plan.describe());
        let vswitch = manager.ensure_segment(&plan).await?;
        ui::print_success(&format!(
            "vSwitch '{}' ready (id {}, VLAN {})",
            vswitch.name, vswitch.id, vswitch.vlan
        ));

        ui::print_step("Attaching servers to the vSwitch");
        manager
            .attach_and_monitor(&vswitch.id, &ids, self.progress)
            .await?;
        ui::print_success("All servers attached");

        ui::print_step("Booting servers into the rescue system");
        let passwords = match rescue.run(&targets).await {
            Ok(outcome) => outcome.passwords,
            Err(e) => {
                if let Some(partial) = e.passwords() {
                    report_partial_passwords(partial, &selected);
                    state.rescue_passwords.clone_from(partial);
                    state.save()?;
                }
                return Err(e.into());
            }
        };
        ui::print_success("All servers are in the rescue system");

        state.record_selection(
            selected,
            ranges,
            VSwitchRecord {
                id: vswitch.id,
                vlan: vswitch.vlan,
            },
            passwords,
        )?;
        Ok(())
    }
}

fn report_partial_passwords(passwords: &BTreeMap<String, String>, selected: &[SelectedServer]) {
    if passwords.is_empty() {
        return;
    }
    ui::print_warning(&format!(
        "Rescue passwords were captured for {} of {} servers and saved to the state file",
        passwords.len(),
        selected.len()
    ));
    for server in selected {
        let status = if passwords.contains_key(&server.id) {
            "captured"
        } else {
            "missing"
        };
        ui::print_list_item(&format!("{}: {status}", server.label()));
    }
}
