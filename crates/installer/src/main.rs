//! Robot cluster provisioning CLI.
//!
//! Selects Hetzner Robot dedicated servers, wires them onto a private
//! vSwitch, installs Talos Linux and bootstraps Kubernetes.

// Allow product names without backticks in doc comments
#![allow(clippy::doc_markdown)]

use std::process::ExitCode;

use clap::{Parser, Subcommand};
use robot_installer::commands::discover::DiscoverCommand;
use robot_installer::commands::plan_network::PlanNetworkCommand;
use robot_installer::commands::provision::ProvisionCommand;
use robot_installer::commands::servers::ServersCommand;
use robot_installer::ui;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use tracing_subscriber::EnvFilter;

/// Talos clusters on Hetzner Robot dedicated servers.
#[derive(Parser)]
#[command(
    name = "robot-provision",
    version,
    about = "Provision Talos Kubernetes clusters on Hetzner Robot servers",
    long_about = "Provision Talos Kubernetes clusters on Hetzner Robot servers.\n\n\
                  Selects servers, attaches them to a private vSwitch, boots them\n\
                  into the rescue system, installs Talos Linux and bootstraps\n\
                  Kubernetes.\n\n\
                  Progress is saved after every phase; a failed run can be\n\
                  resumed with --resume <phase>."
)]
#[command(propagate_version = true)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Provision a cluster.
    ///
    /// Destroys all data on the selected servers.
    Provision(ProvisionCommand),

    /// Print a freshly generated private network plan.
    PlanNetwork(PlanNetworkCommand),

    /// List servers on the Robot account.
    Servers(ServersCommand),

    /// Run network discovery against a saved cluster.
    Discover(DiscoverCommand),
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("info,robot_metal=debug,robot_installer=debug")
    } else {
        EnvFilter::new("warn,robot_metal=info,robot_installer=info")
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping after the current check");
            on_signal.cancel();
        }
    });

    let result = match cli.command {
        Commands::Provision(cmd) => cmd.run(cancel).await,
        Commands::PlanNetwork(cmd) => cmd.run(),
        Commands::Servers(cmd) => cmd.run().await,
        Commands::Discover(cmd) => cmd.run().await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            ui::print_error_chain(&e);
            ExitCode::FAILURE
        }
    }
}
