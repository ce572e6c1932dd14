//! Node maintenance API.
//!
//! Before a node has joined a cluster its Talos API only accepts insecure
//! connections and answers a handful of read-only resource queries. We use it
//! to probe reachability and to read addresses, links and routes. The
//! insecure transport must never be used once the node has been bootstrapped.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

/// Default timeout for a single `talosctl` invocation.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors from the maintenance API.
#[derive(Error, Debug)]
pub enum MaintenanceError {
    /// `talosctl` could not be started.
    #[error("failed to run talosctl (is it installed?): {0}")]
    Spawn(#[from] std::io::Error),

    /// `talosctl` exited non-zero.
    #[error("talosctl {command} failed: {stderr}")]
    Command { command: String, stderr: String },

    /// `talosctl` did not finish in time.
    #[error("talosctl {command} timed out after {}s", .timeout.as_secs())]
    Timeout { command: String, timeout: Duration },

    /// Output could not be parsed.
    #[error("failed to parse talosctl output: {0}")]
    Parse(#[from] serde_json::Error),
}

impl MaintenanceError {
    /// Whether the error means the node answered but is still in maintenance
    /// mode, which counts as reachable.
    #[must_use]
    pub fn is_maintenance_signal(&self) -> bool {
        match self {
            Self::Command { stderr, .. } => {
                stderr.contains("maintenance mode") || stderr.contains("Unimplemented")
            }
            _ => false,
        }
    }
}

/// Resource envelope: `{"metadata": {...}, "spec": {...}}`.
#[derive(Debug, Clone, Deserialize)]
pub struct Resource<T> {
    /// Resource metadata.
    pub metadata: ResourceMetadata,
    /// Resource spec.
    pub spec: T,
}

/// Resource metadata.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResourceMetadata {
    /// Resource id (for links, the interface name).
    pub id: String,
    /// Resource namespace.
    #[serde(default)]
    pub namespace: String,
}

/// An address assigned to a link.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddressSpec {
    /// Address with prefix (`65.109.58.113/26`).
    pub address: String,
    /// Link the address is on.
    #[serde(default)]
    pub link_name: String,
    /// `inet4` or `inet6`.
    #[serde(default)]
    pub family: String,
    /// Address scope (`global`, `host`, `link`).
    #[serde(default)]
    pub scope: String,
}

/// A network link.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkSpec {
    /// Interface name.
    pub name: String,
    /// Link kind (`vlan`, `bond`, empty for physical).
    pub kind: String,
    /// MAC address.
    pub hardware_addr: String,
    /// Operational state (`up`, `down`).
    pub operational_state: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawLinkSpec {
    #[serde(default)]
    kind: String,
    #[serde(default)]
    hardware_addr: String,
    #[serde(default)]
    operational_state: String,
}

/// A route table entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteSpec {
    /// Destination (`0.0.0.0/0`, or empty for default).
    #[serde(default)]
    pub dst: String,
    /// Next hop.
    #[serde(default)]
    pub gateway: String,
    /// Outbound link.
    #[serde(default)]
    pub out_link_name: String,
    /// `inet4` or `inet6`.
    #[serde(default)]
    pub family: String,
}

impl RouteSpec {
    /// Whether this is an IPv4 default route with a usable gateway.
    #[must_use]
    pub fn is_default_v4(&self) -> bool {
        self.family == "inet4"
            && (self.dst.is_empty() || self.dst == "0.0.0.0/0")
            && !self.gateway.is_empty()
            && self.gateway != "<nil>"
    }
}

/// Read-only queries against a node in maintenance mode.
#[async_trait]
pub trait MaintenanceApi: Send + Sync {
    /// Server version; used as the reachability probe.
    async fn version(&self, node: &str) -> Result<String, MaintenanceError>;

    /// Addresses on all links.
    async fn addresses(&self, node: &str) -> Result<Vec<AddressSpec>, MaintenanceError>;

    /// All links.
    async fn links(&self, node: &str) -> Result<Vec<LinkSpec>, MaintenanceError>;

    /// Route table.
    async fn routes(&self, node: &str) -> Result<Vec<RouteSpec>, MaintenanceError>;
}

/// Maintenance API over the `talosctl` CLI.
#[derive(Debug, Clone)]
pub struct Talosctl {
    binary: PathBuf,
    timeout: Duration,
}

impl Default for Talosctl {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("talosctl"),
            timeout: COMMAND_TIMEOUT,
        }
    }
}

impl Talosctl {
    /// Use a specific `talosctl` binary.
    #[must_use]
    pub fn with_binary(mut self, binary: impl Into<PathBuf>) -> Self {
        self.binary = binary.into();
        self
    }

    /// Check that the client works.
    ///
    /// # Errors
    ///
    /// Returns an error if `talosctl` is missing or broken.
    pub async fn check_installed(&self) -> Result<String, MaintenanceError> {
        let output = Command::new(&self.binary)
            .args(["version", "--client"])
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await?;
        if !output.status.success() {
            return Err(MaintenanceError::Command {
                command: "version --client".to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn run(&self, node: &str, args: &[&str]) -> Result<String, MaintenanceError> {
        let command = args.join(" ");
        debug!(node = %node, command = %command, "Running talosctl");

        let child = Command::new(&self.binary)
            .args(args)
            .args(["--insecure", "-n", node, "-e", node])
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();

        let output = tokio::time::timeout(self.timeout, child)
            .await
            .map_err(|_| MaintenanceError::Timeout {
                command: command.clone(),
                timeout: self.timeout,
            })??;

        if !output.status.success() {
            return Err(MaintenanceError::Command {
                command,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn get<T: DeserializeOwned>(
        &self,
        node: &str,
        resource: &str,
    ) -> Result<Vec<Resource<T>>, MaintenanceError> {
        let stdout = self.run(node, &["get", resource, "-o", "json"]).await?;
        parse_resources(&stdout)
    }
}

#[async_trait]
impl MaintenanceApi for Talosctl {
    async fn version(&self, node: &str) -> Result<String, MaintenanceError> {
        self.run(node, &["version"]).await
    }

    async fn addresses(&self, node: &str) -> Result<Vec<AddressSpec>, MaintenanceError> {
        let resources = self.get::<AddressSpec>(node, "addresses").await?;
        Ok(resources.into_iter().map(|r| r.spec).collect())
    }

    async fn links(&self, node: &str) -> Result<Vec<LinkSpec>, MaintenanceError> {
        let resources = self.get::<RawLinkSpec>(node, "links").await?;
        Ok(resources
            .into_iter()
            .map(|r| LinkSpec {
                name: r.metadata.id,
                kind: r.spec.kind,
                hardware_addr: r.spec.hardware_addr,
                operational_state: r.spec.operational_state,
            })
            .collect())
    }

    async fn routes(&self, node: &str) -> Result<Vec<RouteSpec>, MaintenanceError> {
        let resources = self.get::<RouteSpec>(node, "routes").await?;
        Ok(resources.into_iter().map(|r| r.spec).collect())
    }
}

/// Parse a stream of concatenated JSON resource documents.
///
/// # Errors
///
/// Returns an error if any document is malformed.
pub fn parse_resources<T: DeserializeOwned>(
    stdout: &str,
) -> Result<Vec<Resource<T>>, MaintenanceError> {
    serde_json::Deserializer::from_str(stdout)
        .into_iter::<Resource<T>>()
        .map(|r| r.map_err(MaintenanceError::from))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const ROUTES: &str = r#"{
    "node": "65.109.58.113",
    "metadata": {"namespace": "network", "type": "RouteStatuses.net.talos.dev", "id": "inet4/65.109.58.65//1024", "version": 1},
    "spec": {"family": "inet4", "dst": "", "src": "", "gateway": "65.109.58.65", "outLinkIndex": 2, "outLinkName": "enp9s0", "table": "main", "priority": 1024, "scope": "global", "type": "unicast", "protocol": "static"}
}
{
    "node": "65.109.58.113",
    "metadata": {"namespace": "network", "type": "RouteStatuses.net.talos.dev", "id": "inet6//fe80::/64", "version": 1},
    "spec": {"family": "inet6", "dst": "fe80::/64", "gateway": "", "outLinkName": "enp9s0"}
}"#;

    #[test]
    fn test_parse_route_stream() {
        let routes: Vec<Resource<RouteSpec>> = parse_resources(ROUTES).unwrap();
        assert_eq!(routes.len(), 2);
        assert_eq!(routes[0].spec.out_link_name, "enp9s0");
        assert!(routes[0].spec.is_default_v4());
        assert!(!routes[1].spec.is_default_v4());
        assert_eq!(routes[0].metadata.namespace, "network");
    }

    #[test]
    fn test_parse_links_use_metadata_id() {
        let json = r#"{"metadata": {"id": "enp9s0"}, "spec": {"kind": "", "hardwareAddr": "a8:a1:59:0e:2c:41", "operationalState": "up"}}
{"metadata": {"id": "lo"}, "spec": {"operationalState": "unknown"}}"#;
        let links: Vec<Resource<RawLinkSpec>> = parse_resources(json).unwrap();
        assert_eq!(links[0].metadata.id, "enp9s0");
        assert_eq!(links[0].spec.hardware_addr, "a8:a1:59:0e:2c:41");
        assert_eq!(links[1].spec.operational_state, "unknown");
    }

    #[test]
    fn test_default_route_rejects_nil_gateway() {
        let route = RouteSpec {
            dst: "0.0.0.0/0".into(),
            gateway: "<nil>".into(),
            out_link_name: "eth0".into(),
            family: "inet4".into(),
        };
        assert!(!route.is_default_v4());
    }

    #[test]
    fn test_maintenance_signal() {
        let err = MaintenanceError::Command {
            command: "version".into(),
            stderr: "rpc error: code = Unimplemented desc = API is not implemented in maintenance mode".into(),
        };
        assert!(err.is_maintenance_signal());

        let err = MaintenanceError::Command {
            command: "version".into(),
            stderr: "connection refused".into(),
        };
        assert!(!err.is_maintenance_signal());
    }

    #[test]
    fn test_malformed_output() {
        assert!(matches!(
            parse_resources::<RouteSpec>("{not json"),
            Err(MaintenanceError::Parse(_))
        ));
        assert!(parse_resources::<RouteSpec>("").unwrap().is_empty());
    }
}
