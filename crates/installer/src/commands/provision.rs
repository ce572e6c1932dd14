use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Args;
use robot_metal::talos::Talosctl;
use robot_metal::IcmpProbe;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::RobotArgs;
use crate::config::ClusterConfig;
use crate::dns::SystemResolver;
use crate::infra::TerraformCli;
use crate::orchestrator::{Provisioner, Services};
use crate::selection::{DialoguerPrompter, SelectionStage};
use crate::state::{ClusterState, Phase};
use crate::ui::{self, TableProgress};

/// Provision a Talos cluster on Robot servers
#[derive(Args)]
pub struct ProvisionCommand {
    /// Cluster configuration file
    #[arg(short, long, value_name = "FILE")]
    config: PathBuf,

    /// Resume a previous run at this phase
    #[arg(long, value_name = "PHASE")]
    resume: Option<Phase>,

    /// Skip the destructive-action confirmation and operator prompts
    #[arg(short, long)]
    yes: bool,

    /// terraform binary (default: found on PATH)
    #[arg(long, value_name = "PATH")]
    terraform: Option<PathBuf>,

    /// talosctl binary
    #[arg(long, value_name = "PATH", default_value = "talosctl")]
    talosctl: PathBuf,

    #[command(flatten)]
    robot: RobotArgs,
}

impl ProvisionCommand {
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        ui::print_banner();

        let config = ClusterConfig::load(&self.config)?;
        info!(cluster = %config.name, topology = %config.topology, "Loaded configuration");

        ui::print_step("Checking prerequisites");
        let terraform = match &self.terraform {
            Some(path) => TerraformCli::with_binary(path),
            None => TerraformCli::locate()?,
        };
        let talosctl = Talosctl::default().with_binary(&self.talosctl);
        let version = talosctl
            .check_installed()
            .await
            .context("talosctl is required for network discovery")?;
        info!(talosctl = %version, "Found talosctl");

        let output_dir = config.output_dir();
        let existing = ClusterState::load(&output_dir)?;
        let progress = TableProgress;

        let (state, start) = match self.resume {
            Some(phase) => {
                let Some(state) = existing else {
                    bail!(
                        "No saved state in {}; run provision without --resume first",
                        output_dir.display()
                    );
                };
                if state.cluster_name != config.name {
                    bail!(
                        "Saved state belongs to cluster '{}', not '{}'",
                        state.cluster_name,
                        config.name
                    );
                }
                (state, phase)
            }
            None => {
                if let Some(previous) = existing.as_ref().filter(|s| s.selection_complete) {
                    let hint = previous.next_phase().map_or_else(
                        || "the previous run completed".to_string(),
                        |p| format!("pass --resume {p} to continue it instead"),
                    );
                    ui::print_warning(&format!(
                        "A previous run exists in {} and will be replaced; {hint}",
                        output_dir.display()
                    ));
                }

                let robot = self.robot.client()?;
                let mut state = ClusterState::new(&config.name, config.topology, &output_dir);
                SelectionStage::new(
                    &robot,
                    &IcmpProbe,
                    &DialoguerPrompter,
                    &progress,
                    cancel.clone(),
                )
                .assume_yes(self.yes)
                .run(&config, &mut state)
                .await?;
                (state, Phase::Provision)
            }
        };

        let services = Services {
            terraform: &terraform,
            maintenance: Arc::new(talosctl),
            resolver: &SystemResolver,
            progress: &progress,
            cancel,
        };
        Provisioner::new(config, state, services)?
            .assume_yes(self.yes)
            .run_to_completion(start)
            .await
    }
}
