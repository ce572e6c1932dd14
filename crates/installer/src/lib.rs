//! Talos cluster provisioning for Hetzner Robot dedicated servers.
//!
//! Drives a cluster from bare servers to a running Kubernetes control plane:
//! server selection, vSwitch attachment and the rescue cycle happen first,
//! then a resumable sequence of phases installs Talos, discovers node
//! networking, publishes the API endpoint, bootstraps the cluster and checks
//! its health.
//!
//! # Example
//!
//! ```ignore
//! use robot_installer::{ClusterConfig, ClusterState, Phase, Provisioner, Services};
//!
//! let config = ClusterConfig::load("cluster.yaml".as_ref())?;
//! let state = ClusterState::load(&config.output_dir())?.expect("saved state");
//! let mut provisioner = Provisioner::new(config, state, services)?;
//! provisioner.run_to_completion(Phase::Bootstrap).await?;
//! ```

// Allow product names without backticks in doc comments
#![allow(clippy::doc_markdown)]
// Allow async functions that don't use await (may need await in future)
#![allow(clippy::unused_async)]

pub mod commands;
pub mod config;
pub mod dns;
pub mod health;
pub mod infra;
pub mod orchestrator;
pub mod selection;
pub mod state;
pub mod ui;

pub use config::ClusterConfig;
pub use orchestrator::{Provisioner, Services};
pub use state::{ClusterState, Phase};
