//! Per-node network discovery over the maintenance API.
//!
//! The public interface is the outbound link of the IPv4 default route; its
//! address is the one on that link matching the server's public IP. The
//! private interface is guessed from RFC 1918 addresses, but the private
//! address itself is computed from the planned vSwitch subnet because the
//! VLAN interface does not exist yet.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::maintenance::{AddressSpec, LinkSpec, MaintenanceApi, MaintenanceError, RouteSpec};
use crate::network::{is_rfc1918, with_prefix, NetworkRanges};

/// Public interface found via the default route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicInterface {
    /// Link name (`enp9s0`).
    pub name: String,
    /// Default gateway.
    pub gateway: String,
    /// Address with prefix (`65.109.58.113/26`).
    pub address: String,
}

/// Private interface guessed from RFC 1918 addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrivateInterface {
    /// Link name.
    pub name: String,
    /// RFC 1918 addresses with prefix on that link.
    pub addresses: Vec<String>,
    /// Whether every IPv4 address on the link is private.
    pub exclusive: bool,
}

/// Find the public interface from the route table and addresses.
///
/// Returns `None` when there is no usable IPv4 default route or no address on
/// its link matches `public_ip`.
#[must_use]
pub fn find_public_interface(
    routes: &[RouteSpec],
    addresses: &[AddressSpec],
    public_ip: &str,
) -> Option<PublicInterface> {
    let route = routes.iter().find(|r| r.is_default_v4())?;
    let address = addresses.iter().find(|a| {
        a.link_name == route.out_link_name
            && a.family == "inet4"
            && (a.address == public_ip || a.address.starts_with(&format!("{public_ip}/")))
    })?;

    Some(PublicInterface {
        name: route.out_link_name.clone(),
        gateway: route.gateway.clone(),
        address: address.address.clone(),
    })
}

/// Pick the link most likely to be the private interface.
///
/// Loopback, the `external` pseudo-link, links reported down and IPv6
/// addresses are ignored. A link carrying only RFC 1918 addresses wins;
/// otherwise the first link with any RFC 1918 address.
#[must_use]
pub fn detect_private_interface(
    addresses: &[AddressSpec],
    links: &[LinkSpec],
) -> Option<PrivateInterface> {
    #[derive(Default)]
    struct Group {
        private: Vec<String>,
        public: usize,
    }

    let is_down = |name: &str| {
        links
            .iter()
            .any(|l| l.name == name && l.operational_state == "down")
    };

    let mut groups: BTreeMap<&str, Group> = BTreeMap::new();
    for addr in addresses {
        if addr.link_name == "lo"
            || addr.link_name == "external"
            || addr.family == "inet6"
            || is_down(&addr.link_name)
        {
            continue;
        }
        let ip = addr.address.split('/').next().unwrap_or_default();
        let group = groups.entry(addr.link_name.as_str()).or_default();
        match ip.parse::<Ipv4Addr>() {
            Ok(ip) if is_rfc1918(ip) => group.private.push(addr.address.clone()),
            _ => group.public += 1,
        }
    }

    let pick = |exclusive: bool| {
        groups
            .iter()
            .find(|(_, g)| !g.private.is_empty() && (!exclusive || g.public == 0))
            .map(|(name, g)| PrivateInterface {
                name: (*name).to_string(),
                addresses: g.private.clone(),
                exclusive: g.public == 0,
            })
    };
    pick(true).or_else(|| pick(false))
}

/// A server to run discovery against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryTarget {
    /// Server id.
    pub server_id: String,
    /// Server name.
    pub name: String,
    /// Public IP (maintenance API endpoint).
    pub public_ip: String,
    /// Planned private IP, when assigned.
    pub private_ip: Option<Ipv4Addr>,
}

/// Network facts for one server.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredNetworkInfo {
    pub server_id: String,
    pub name: String,
    pub public_ip: String,
    pub public_interface: Option<String>,
    pub public_gateway: Option<String>,
    pub public_address: Option<String>,
    pub private_interface: Option<String>,
    /// Private address with the vSwitch prefix length.
    pub private_address: Option<String>,
    /// vSwitch gateway, identical on every server.
    pub private_gateway: Option<String>,
    /// Non-fatal gaps.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    /// Set when the node could not be queried.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DiscoveredNetworkInfo {
    /// Whether discovery reached the node and read its state.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Discovery results for every server.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryReport {
    /// One entry per target, failed or not.
    pub servers: Vec<DiscoveredNetworkInfo>,
    /// Whether every server succeeded.
    pub success: bool,
}

impl DiscoveryReport {
    /// Number of successful servers.
    #[must_use]
    pub fn success_count(&self) -> usize {
        self.servers.iter().filter(|s| s.is_success()).count()
    }
}

/// Runs discovery against a set of nodes.
pub struct NetworkDiscovery<'a> {
    api: &'a dyn MaintenanceApi,
    ranges: &'a NetworkRanges,
}

impl<'a> NetworkDiscovery<'a> {
    /// Discovery using `ranges` for computed private addresses.
    #[must_use]
    pub fn new(api: &'a dyn MaintenanceApi, ranges: &'a NetworkRanges) -> Self {
        Self { api, ranges }
    }

    /// Discover every target concurrently. Failures are recorded per server
    /// and results keep the order of `targets`.
    pub async fn discover_all(&self, targets: &[DiscoveryTarget]) -> DiscoveryReport {
        let servers = join_all(targets.iter().map(|t| self.discover(t))).await;
        let success = servers.iter().all(DiscoveredNetworkInfo::is_success);
        info!(
            total = servers.len(),
            succeeded = servers.iter().filter(|s| s.is_success()).count(),
            "Network discovery finished"
        );
        DiscoveryReport { servers, success }
    }

    /// Discover one target.
    pub async fn discover(&self, target: &DiscoveryTarget) -> DiscoveredNetworkInfo {
        let mut info = DiscoveredNetworkInfo {
            server_id: target.server_id.clone(),
            name: target.name.clone(),
            public_ip: target.public_ip.clone(),
            private_gateway: Some(self.ranges.vswitch_gateway().to_string()),
            ..DiscoveredNetworkInfo::default()
        };

        let (addresses, links, routes) = match self.fetch(&target.public_ip).await {
            Ok(data) => data,
            Err(e) => {
                warn!(server_id = %target.server_id, error = %e, "Network discovery failed");
                info.error = Some(e.to_string());
                return info;
            }
        };

        match find_public_interface(&routes, &addresses, &target.public_ip) {
            Some(public) => {
                info.public_interface = Some(public.name);
                info.public_gateway = Some(public.gateway);
                info.public_address = Some(public.address);
            }
            None => {
                warn!(server_id = %target.server_id, "No public interface found via default route");
                info.warnings
                    .push("public interface not found via default route".to_string());
            }
        }

        let private = detect_private_interface(&addresses, &links);
        info.private_interface = private.as_ref().map(|p| p.name.clone());
        info.private_address = match target.private_ip {
            Some(ip) => Some(with_prefix(ip, &self.ranges.vswitch_subnet)),
            None => {
                let fallback = private.and_then(|p| p.addresses.into_iter().next());
                if fallback.is_none() {
                    info.warnings.push("no private address assigned or discovered".to_string());
                }
                fallback
            }
        };

        info!(
            server_id = %target.server_id,
            public_interface = ?info.public_interface,
            private_address = ?info.private_address,
            "Discovered network"
        );
        info
    }

    async fn fetch(
        &self,
        node: &str,
    ) -> Result<(Vec<AddressSpec>, Vec<LinkSpec>, Vec<RouteSpec>), MaintenanceError> {
        match self.api.version(node).await {
            Err(e) if !e.is_maintenance_signal() => return Err(e),
            _ => {}
        }
        let addresses = self.api.addresses(node).await?;
        let links = self.api.links(node).await?;
        let routes = self.api.routes(node).await?;
        debug!(
            node = %node,
            addresses = addresses.len(),
            links = links.len(),
            routes = routes.len(),
            "Fetched network resources"
        );
        Ok((addresses, links, routes))
    }
}
