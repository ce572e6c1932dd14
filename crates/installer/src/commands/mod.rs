//! CLI subcommands.

pub mod discover;
pub mod plan_network;
pub mod provision;
pub mod servers;

use anyhow::{anyhow, Result};
use clap::Args;
use robot_metal::HetznerRobot;

/// Robot webservice credentials.
#[derive(Args, Clone)]
pub struct RobotArgs {
    /// Robot webservice username.
    #[arg(long, env = "ROBOT_USERNAME", hide_env_values = true)]
    robot_username: Option<String>,

    /// Robot webservice password.
    #[arg(long, env = "ROBOT_PASSWORD", hide_env_values = true)]
    robot_password: Option<String>,
}

impl RobotArgs {
    /// Build a client from the supplied credentials.
    ///
    /// # Errors
    ///
    /// Returns an error if either credential is missing or the client cannot be built.
    pub fn client(&self) -> Result<HetznerRobot> {
        let username = self
            .robot_username
            .as_deref()
            .ok_or_else(|| anyhow!("Robot username missing; pass --robot-username or set ROBOT_USERNAME"))?;
        let password = self
            .robot_password
            .as_deref()
            .ok_or_else(|| anyhow!("Robot password missing; pass --robot-password or set ROBOT_PASSWORD"))?;
        Ok(HetznerRobot::new(username, password)?)
    }
}
