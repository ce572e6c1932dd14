use std::path::PathBuf;

use anyhow::{anyhow, bail, Result};
use clap::Args;
use robot_metal::talos::{DiscoveryTarget, NetworkDiscovery, Talosctl};

use crate::config::ClusterConfig;
use crate::state::ClusterState;
use crate::ui;

/// Run network discovery against the servers of a saved cluster
#[derive(Args, Debug)]
pub struct DiscoverCommand {
    /// Cluster configuration file
    #[arg(short, long, value_name = "FILE")]
    config: PathBuf,

    /// Store the results in the cluster state
    #[arg(long)]
    save: bool,

    /// talosctl binary
    #[arg(long, value_name = "PATH", default_value = "talosctl")]
    talosctl: PathBuf,
}

impl DiscoverCommand {
    pub async fn run(&self) -> Result<()> {
        let config = ClusterConfig::load(&self.config)?;
        let output_dir = config.output_dir();
        let mut state = ClusterState::load(&output_dir)?
            .ok_or_else(|| anyhow!("No saved state in {}", output_dir.display()))?;
        if state.servers.is_empty() {
            bail!("No servers selected for cluster '{}'", state.cluster_name);
        }
        let ranges = state
            .ranges
            .ok_or_else(|| anyhow!("No network ranges in state"))?;

        let talosctl = Talosctl::default().with_binary(&self.talosctl);
        let targets: Vec<DiscoveryTarget> = state
            .servers
            .iter()
            .map(|s| DiscoveryTarget {
                server_id: s.id.clone(),
                name: s.name.clone(),
                public_ip: s.ip.clone(),
                private_ip: Some(s.private_ip),
            })
            .collect();

        let spinner = ui::spinner("Querying maintenance API");
        let report = NetworkDiscovery::new(&talosctl, &ranges)
            .discover_all(&targets)
            .await;
        spinner.finish_and_clear();

        println!("{}", serde_json::to_string_pretty(&report)?);
        if !report.success {
            ui::print_warning(&format!(
                "Discovery succeeded on {} of {} servers",
                report.success_count(),
                report.servers.len()
            ));
        }

        if self.save {
            state.set_discovery(report.servers)?;
            ui::print_success("Saved discovery results");
        }
        Ok(())
    }
}
