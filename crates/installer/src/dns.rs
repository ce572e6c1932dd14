//! Control plane endpoint DNS.
//!
//! The API endpoint is `kube.<domain>` with one A record per control plane
//! node. Records are created by the operator; this module only waits until
//! every expected address resolves.

use std::collections::BTreeSet;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use async_trait::async_trait;
use robot_metal::poll::{wait_for_all, AvailabilityError, Poller, ProgressSink, Target};
use robot_metal::{Probe, ProbeOutcome};

/// Resolves A records.
#[async_trait]
pub trait Resolver: Send + Sync {
    /// IPv4 addresses for `host`.
    async fn lookup_ipv4(&self, host: &str) -> std::io::Result<BTreeSet<Ipv4Addr>>;
}

/// Resolver using the system configuration.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemResolver;

#[async_trait]
impl Resolver for SystemResolver {
    async fn lookup_ipv4(&self, host: &str) -> std::io::Result<BTreeSet<Ipv4Addr>> {
        let addrs = tokio::net::lookup_host((host, 0)).await?;
        Ok(addrs
            .filter_map(|a| match a.ip() {
                IpAddr::V4(v4) => Some(v4),
                IpAddr::V6(_) => None,
            })
            .collect())
    }
}

/// Probe whose targets are expected A record values of one name.
pub struct DnsRecordProbe<'a> {
    resolver: &'a dyn Resolver,
    host: String,
}

impl<'a> DnsRecordProbe<'a> {
    #[must_use]
    pub fn new(resolver: &'a dyn Resolver, host: impl Into<String>) -> Self {
        Self {
            resolver,
            host: host.into(),
        }
    }
}

#[async_trait]
impl Probe for DnsRecordProbe<'_> {
    fn describe(&self) -> String {
        format!("dns A {}", self.host)
    }

    async fn check(&self, target: &Target) -> ProbeOutcome {
        match self.resolver.lookup_ipv4(&self.host).await {
            Ok(resolved) if resolved.iter().any(|ip| ip.to_string() == target.address) => {
                ProbeOutcome::Reachable
            }
            Ok(resolved) if resolved.is_empty() => {
                ProbeOutcome::Unreachable("not found".to_string())
            }
            Ok(_) => ProbeOutcome::Unreachable("waiting".to_string()),
            Err(e) => ProbeOutcome::Unreachable(format!("lookup failed: {e}")),
        }
    }
}

/// Wait until `host` resolves to every address in `expected`.
///
/// # Errors
///
/// Returns an [`AvailabilityError`] naming the addresses still missing.
pub async fn wait_for_records(
    resolver: &dyn Resolver,
    host: &str,
    expected: &[String],
    poller: &Poller,
    progress: &dyn ProgressSink,
) -> Result<Duration, AvailabilityError> {
    let targets: Vec<Target> = expected
        .iter()
        .map(|ip| Target::new(ip.clone(), format!("{host} A {ip}"), ip.clone()))
        .collect();
    let probe = DnsRecordProbe::new(resolver, host);
    wait_for_all("DNS propagation", &targets, &probe, poller, progress).await
}
