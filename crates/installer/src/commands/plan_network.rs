use anyhow::Result;
use clap::Args;
use robot_metal::NetworkRanges;

use crate::ui;

/// Generate a private network plan
#[derive(Args, Debug)]
pub struct PlanNetworkCommand {
    /// Show private addresses for this many nodes
    #[arg(short, long, default_value_t = 3)]
    nodes: usize,

    /// Print JSON instead of a summary
    #[arg(long)]
    json: bool,
}

impl PlanNetworkCommand {
    pub fn run(&self) -> Result<()> {
        let ranges = NetworkRanges::generate()?;

        if self.json {
            println!("{}", serde_json::to_string_pretty(&ranges)?);
            return Ok(());
        }

        ui::print_section("Network Plan");
        ui::print_kv("Cluster network", &ranges.cluster.to_string());
        ui::print_kv("vSwitch subnet", &ranges.vswitch_subnet.to_string());
        ui::print_kv("vSwitch gateway", &ranges.vswitch_gateway().to_string());
        ui::print_kv("Load balancer subnet", &ranges.load_balancer_subnet.to_string());
        println!();
        for i in 0..self.nodes {
            ui::print_list_item(&format!("node {}: {}", i + 1, ranges.private_ip(i)?));
        }
        Ok(())
    }
}
