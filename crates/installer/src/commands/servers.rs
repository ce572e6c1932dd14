use anyhow::{Context, Result};
use clap::Args;
use robot_metal::Inventory;

use super::RobotArgs;
use crate::ui;

/// List servers on the Robot account
#[derive(Args)]
pub struct ServersCommand {
    /// Include cancelled servers
    #[arg(long)]
    all: bool,

    /// Print JSON instead of a table
    #[arg(long)]
    json: bool,

    #[command(flatten)]
    robot: RobotArgs,
}

impl ServersCommand {
    pub async fn run(&self) -> Result<()> {
        let robot = self.robot.client()?;
        let servers: Vec<_> = robot
            .list_servers()
            .await
            .context("Failed to list servers")?
            .into_iter()
            .filter(|s| self.all || !s.cancelled)
            .collect();

        if self.json {
            println!("{}", serde_json::to_string_pretty(&servers)?);
            return Ok(());
        }

        if servers.is_empty() {
            ui::print_warning("No servers found");
            return Ok(());
        }
        ui::print_inventory(&servers);
        Ok(())
    }
}
