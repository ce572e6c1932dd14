//! Post-bootstrap health checks.

use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Node;
use kube::api::{Api, ListParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use robot_metal::poll::{wait_for_all, Poller, ProgressSink, Target};
use robot_metal::{IcmpProbe, Probe, ProbeOutcome};
use tracing::info;

/// Lists nodes through the Kubernetes API.
pub struct KubeApiProbe {
    client: Client,
}

impl KubeApiProbe {
    /// Build a client from a kubeconfig file.
    ///
    /// # Errors
    ///
    /// Returns an error if the kubeconfig cannot be read or the client cannot be created.
    pub async fn from_kubeconfig(path: &Path) -> Result<Self> {
        let kubeconfig = Kubeconfig::read_from(path)
            .with_context(|| format!("Failed to read kubeconfig from {}", path.display()))?;

        let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .context("Failed to create Kubernetes config from kubeconfig")?;

        let client = Client::try_from(config).context("Failed to create Kubernetes client")?;

        Ok(Self { client })
    }
}

#[async_trait]
impl Probe for KubeApiProbe {
    fn describe(&self) -> String {
        "kubernetes api".to_string()
    }

    async fn check(&self, _target: &Target) -> ProbeOutcome {
        let nodes: Api<Node> = Api::all(self.client.clone());
        match nodes.list(&ListParams::default()).await {
            Ok(list) => {
                info!(nodes = list.items.len(), "Kubernetes API responding");
                ProbeOutcome::Reachable
            }
            Err(e) => ProbeOutcome::Unreachable(e.to_string()),
        }
    }
}

/// Wait for ICMP on every node, then for the Kubernetes API.
///
/// Both waits share the interval; each gets the full budget.
///
/// # Errors
///
/// Returns an error naming the nodes or endpoint that did not answer.
pub async fn check_cluster(
    nodes: &[Target],
    endpoint: &str,
    kubeconfig: &Path,
    ping: &Poller,
    api: &Poller,
    progress: &dyn ProgressSink,
) -> Result<()> {
    wait_for_all("Node ping", nodes, &IcmpProbe, ping, progress)
        .await
        .context("Nodes did not answer ping")?;

    let probe = KubeApiProbe::from_kubeconfig(kubeconfig).await?;
    let target = Target::new("kube-api", endpoint, endpoint);
    wait_for_all("Kubernetes API", &[target], &probe, api, progress)
        .await
        .context("Kubernetes API did not become accessible")?;
    Ok(())
}
