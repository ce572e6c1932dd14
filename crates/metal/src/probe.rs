//! Reachability probes used with [`crate::poll::wait_for_all`].

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::process::Command;

use crate::poll::Target;
use crate::talos::MaintenanceApi;

/// Talos API port.
pub const TALOS_API_PORT: u16 = 50000;

/// Kubernetes API port.
pub const K8S_API_PORT: u16 = 6443;

/// Result of probing one target once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// The target answered.
    Reachable,
    /// Not yet; keep polling.
    Unreachable(String),
    /// The target will never become reachable; stop waiting.
    Failed(String),
}

/// A single reachability check.
#[async_trait]
pub trait Probe: Send + Sync {
    /// Short description for logs ("tcp/50000").
    fn describe(&self) -> String;

    /// Probe one target.
    async fn check(&self, target: &Target) -> ProbeOutcome;
}

/// TCP connect probe.
#[derive(Debug, Clone, Copy)]
pub struct TcpProbe {
    port: u16,
    connect_timeout: Duration,
}

impl TcpProbe {
    /// Probe `port` with a 5 second connect timeout.
    #[must_use]
    pub const fn new(port: u16) -> Self {
        Self {
            port,
            connect_timeout: Duration::from_secs(5),
        }
    }
}

#[async_trait]
impl Probe for TcpProbe {
    fn describe(&self) -> String {
        format!("tcp/{}", self.port)
    }

    async fn check(&self, target: &Target) -> ProbeOutcome {
        let connect = TcpStream::connect((target.address.as_str(), self.port));
        match tokio::time::timeout(self.connect_timeout, connect).await {
            Ok(Ok(_)) => ProbeOutcome::Reachable,
            Ok(Err(e)) => ProbeOutcome::Unreachable(e.to_string()),
            Err(_) => ProbeOutcome::Unreachable("connect timed out".to_string()),
        }
    }
}

/// ICMP echo probe using the system `ping`.
#[derive(Debug, Clone, Copy, Default)]
pub struct IcmpProbe;

#[async_trait]
impl Probe for IcmpProbe {
    fn describe(&self) -> String {
        "icmp".to_string()
    }

    async fn check(&self, target: &Target) -> ProbeOutcome {
        let status = Command::new("ping")
            .args(["-c", "1", "-W", "3", &target.address])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .status()
            .await;
        match status {
            Ok(status) if status.success() => ProbeOutcome::Reachable,
            Ok(_) => ProbeOutcome::Unreachable("no echo reply".to_string()),
            Err(e) => ProbeOutcome::Unreachable(format!("ping: {e}")),
        }
    }
}

/// Probe that calls the maintenance API version endpoint.
///
/// A node that answers "not available in maintenance mode" is reachable.
#[derive(Clone)]
pub struct MaintenanceProbe {
    api: Arc<dyn MaintenanceApi>,
}

impl MaintenanceProbe {
    /// Wrap a maintenance API client.
    #[must_use]
    pub fn new(api: Arc<dyn MaintenanceApi>) -> Self {
        Self { api }
    }
}

#[async_trait]
impl Probe for MaintenanceProbe {
    fn describe(&self) -> String {
        "maintenance api".to_string()
    }

    async fn check(&self, target: &Target) -> ProbeOutcome {
        match self.api.version(&target.address).await {
            Ok(_) => ProbeOutcome::Reachable,
            Err(e) if e.is_maintenance_signal() => ProbeOutcome::Reachable,
            Err(e) => ProbeOutcome::Unreachable(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::talos::{AddressSpec, LinkSpec, MaintenanceError, RouteSpec};
    use tokio::net::TcpListener;

    struct VersionOnly(fn() -> Result<String, MaintenanceError>);

    #[async_trait]
    impl MaintenanceApi for VersionOnly {
        async fn version(&self, _node: &str) -> Result<String, MaintenanceError> {
            (self.0)()
        }
        async fn addresses(&self, _node: &str) -> Result<Vec<AddressSpec>, MaintenanceError> {
            Ok(Vec::new())
        }
        async fn links(&self, _node: &str) -> Result<Vec<LinkSpec>, MaintenanceError> {
            Ok(Vec::new())
        }
        async fn routes(&self, _node: &str) -> Result<Vec<RouteSpec>, MaintenanceError> {
            Ok(Vec::new())
        }
    }

    fn local() -> Target {
        Target::new("1", "node-1", "127.0.0.1")
    }

    #[tokio::test]
    async fn test_tcp_probe_open_and_closed_port() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let open = listener.local_addr().unwrap().port();
        assert_eq!(TcpProbe::new(open).check(&local()).await, ProbeOutcome::Reachable);

        let closed = {
            let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap().port()
        };
        assert!(matches!(
            TcpProbe::new(closed).check(&local()).await,
            ProbeOutcome::Unreachable(_)
        ));
        assert_eq!(TcpProbe::new(TALOS_API_PORT).describe(), "tcp/50000");
    }

    #[tokio::test]
    async fn test_maintenance_probe_accepts_maintenance_errors() {
        let probe = MaintenanceProbe::new(Arc::new(VersionOnly(|| {
            Err(MaintenanceError::Command {
                command: "version".into(),
                stderr: "API is not implemented in maintenance mode".into(),
            })
        })));
        assert_eq!(probe.check(&local()).await, ProbeOutcome::Reachable);

        let probe = MaintenanceProbe::new(Arc::new(VersionOnly(|| {
            Err(MaintenanceError::Command {
                command: "version".into(),
                stderr: "connection refused".into(),
            })
        })));
        assert!(matches!(
            probe.check(&local()).await,
            ProbeOutcome::Unreachable(_)
        ));

        let probe = MaintenanceProbe::new(Arc::new(VersionOnly(|| Ok("v1.9.0".into()))));
        assert_eq!(probe.check(&local()).await, ProbeOutcome::Reachable);
    }
}
