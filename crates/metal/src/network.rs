//! Private address planning for a cluster.
//!
//! Every cluster gets a random /16 inside `172.16.0.0/12` with two /20
//! subnets carved out of it: one for the vSwitch and one reserved for load
//! balancers. Neither subnet may start at the `.0.0` block, whose first host
//! is the cluster network's own gateway.

use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use rand::rngs::OsRng;
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// First host offset used for node addresses inside the vSwitch subnet.
pub const PRIVATE_HOST_OFFSET: u32 = 10;

/// Errors produced while planning or validating address ranges.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum NetworkPlanError {
    /// A CIDR string could not be parsed.
    #[error("invalid CIDR {cidr}: {reason}")]
    InvalidCidr { cidr: String, reason: String },

    /// A subnet lies outside the cluster network.
    #[error("subnet {subnet} is not contained in cluster network {cluster}")]
    NotContained { subnet: Ipv4Net, cluster: Ipv4Net },

    /// Two subnets overlap.
    #[error("subnets {first} and {second} overlap")]
    Overlap { first: Ipv4Net, second: Ipv4Net },

    /// A subnet starts at the cluster network's base block.
    #[error("subnet {subnet} starts at the base of {cluster} and would collide with its gateway")]
    ReservedBase { subnet: Ipv4Net, cluster: Ipv4Net },

    /// A host offset does not fit in the subnet.
    #[error("host offset {offset} is outside subnet {subnet}")]
    HostOutOfRange { subnet: Ipv4Net, offset: u32 },
}

/// The three address blocks assigned to a cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkRanges {
    /// Cluster network (/16).
    pub cluster: Ipv4Net,
    /// vSwitch subnet (/20) for node private addresses.
    pub vswitch_subnet: Ipv4Net,
    /// Load balancer subnet (/20).
    pub load_balancer_subnet: Ipv4Net,
}

impl NetworkRanges {
    /// Generate fresh ranges from the operating system's secure random source.
    ///
    /// # Errors
    ///
    /// Returns an error only if the generated ranges fail validation, which
    /// indicates a bug in the planner.
    pub fn generate() -> Result<Self, NetworkPlanError> {
        Self::generate_with(&mut OsRng)
    }

    /// Generate ranges from the given random source.
    ///
    /// # Errors
    ///
    /// See [`NetworkRanges::generate`].
    pub fn generate_with<R: Rng + ?Sized>(rng: &mut R) -> Result<Self, NetworkPlanError> {
        let second_octet: u8 = rng.gen_range(16..=31);
        let third_octet: u8 = rng.gen_range(0..=255);
        Self::from_octets(second_octet, third_octet)
    }

    /// Derive ranges from a chosen second and third octet.
    ///
    /// The third octet is aligned down to a /20 boundary and bumped to 16 when
    /// it would land on the base block. The load balancer subnet follows the
    /// vSwitch subnet, wrapping back to a low block near the top of the /16.
    ///
    /// # Errors
    ///
    /// Returns an error if the resulting ranges are inconsistent.
    pub fn from_octets(second_octet: u8, third_octet: u8) -> Result<Self, NetworkPlanError> {
        let mut vswitch_block = u16::from(third_octet / 16 * 16);
        if vswitch_block == 0 {
            vswitch_block = 16;
        }

        let mut lb_block = vswitch_block + 16;
        if lb_block > 240 {
            lb_block = if vswitch_block == 16 { 32 } else { 16 };
        }

        let cluster = parse_cidr(&format!("172.{second_octet}.0.0/16"))?;
        let vswitch_subnet = parse_cidr(&format!("172.{second_octet}.{vswitch_block}.0/20"))?;
        let load_balancer_subnet = parse_cidr(&format!("172.{second_octet}.{lb_block}.0/20"))?;

        let ranges = Self {
            cluster,
            vswitch_subnet,
            load_balancer_subnet,
        };
        ranges.validate()?;
        Ok(ranges)
    }

    /// Check containment, disjointness and gateway safety.
    ///
    /// # Errors
    ///
    /// Returns the first violated constraint.
    pub fn validate(&self) -> Result<(), NetworkPlanError> {
        for subnet in [self.vswitch_subnet, self.load_balancer_subnet] {
            if !self.cluster.contains(&subnet) {
                return Err(NetworkPlanError::NotContained {
                    subnet,
                    cluster: self.cluster,
                });
            }
            if subnet.network() == self.cluster.network() || subnet.contains(&gateway(&self.cluster))
            {
                return Err(NetworkPlanError::ReservedBase {
                    subnet,
                    cluster: self.cluster,
                });
            }
        }

        if overlaps(&self.vswitch_subnet, &self.load_balancer_subnet) {
            return Err(NetworkPlanError::Overlap {
                first: self.vswitch_subnet,
                second: self.load_balancer_subnet,
            });
        }

        Ok(())
    }

    /// Gateway of the vSwitch subnet, shared by every node.
    #[must_use]
    pub fn vswitch_gateway(&self) -> Ipv4Addr {
        gateway(&self.vswitch_subnet)
    }

    /// Private address for the node at `index` in selection order.
    ///
    /// # Errors
    ///
    /// Returns an error if the subnet has no room for the index.
    pub fn private_ip(&self, index: usize) -> Result<Ipv4Addr, NetworkPlanError> {
        let offset = u32::try_from(index)
            .ok()
            .and_then(|i| i.checked_add(PRIVATE_HOST_OFFSET))
            .ok_or(NetworkPlanError::HostOutOfRange {
                subnet: self.vswitch_subnet,
                offset: u32::MAX,
            })?;
        host_address(&self.vswitch_subnet, offset)
    }
}

impl std::fmt::Display for NetworkRanges {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "cluster {} / vswitch {} / load balancer {}",
            self.cluster, self.vswitch_subnet, self.load_balancer_subnet
        )
    }
}

/// Parse an IPv4 CIDR, normalizing it to its network address.
///
/// # Errors
///
/// Returns [`NetworkPlanError::InvalidCidr`] on malformed input.
pub fn parse_cidr(cidr: &str) -> Result<Ipv4Net, NetworkPlanError> {
    cidr.parse::<Ipv4Net>()
        .map(|net| net.trunc())
        .map_err(|e| NetworkPlanError::InvalidCidr {
            cidr: cidr.to_string(),
            reason: e.to_string(),
        })
}

/// Gateway of a subnet: network address plus one.
#[must_use]
pub fn gateway(net: &Ipv4Net) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(net.network()).saturating_add(1))
}

/// Address at `offset` from the subnet's network address.
///
/// # Errors
///
/// Returns an error when the offset reaches the broadcast address or beyond.
pub fn host_address(net: &Ipv4Net, offset: u32) -> Result<Ipv4Addr, NetworkPlanError> {
    let base = u32::from(net.network());
    let broadcast = u32::from(net.broadcast());
    match base.checked_add(offset) {
        Some(addr) if offset > 0 && addr < broadcast => Ok(Ipv4Addr::from(addr)),
        _ => Err(NetworkPlanError::HostOutOfRange {
            subnet: *net,
            offset,
        }),
    }
}

/// Combine a host address with a subnet's prefix length (`172.20.16.10/20`).
#[must_use]
pub fn with_prefix(ip: Ipv4Addr, net: &Ipv4Net) -> String {
    format!("{ip}/{}", net.prefix_len())
}

/// Whether an address falls in an RFC 1918 private block.
#[must_use]
pub fn is_rfc1918(ip: Ipv4Addr) -> bool {
    ip.is_private()
}

fn overlaps(a: &Ipv4Net, b: &Ipv4Net) -> bool {
    a.contains(&b.network()) || b.contains(&a.network())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_ranges_hold_invariants() {
        for _ in 0..1000 {
            let ranges = NetworkRanges::generate().unwrap();
            let cluster_gw = gateway(&ranges.cluster);

            assert_eq!(ranges.cluster.prefix_len(), 16);
            assert!(ranges.cluster.contains(&ranges.vswitch_subnet));
            assert!(ranges.cluster.contains(&ranges.load_balancer_subnet));
            assert!(!overlaps(&ranges.vswitch_subnet, &ranges.load_balancer_subnet));
            assert_ne!(ranges.vswitch_subnet.network(), ranges.cluster.network());
            assert_ne!(ranges.load_balancer_subnet.network(), ranges.cluster.network());
            assert_ne!(cluster_gw, gateway(&ranges.vswitch_subnet));
            assert_ne!(cluster_gw, gateway(&ranges.load_balancer_subnet));

            let second = ranges.cluster.network().octets()[1];
            assert!((16..=31).contains(&second));
        }
    }

    #[test]
    fn test_zero_block_is_bumped() {
        let ranges = NetworkRanges::from_octets(20, 7).unwrap();
        assert_eq!(ranges.cluster.to_string(), "172.20.0.0/16");
        assert_eq!(ranges.vswitch_subnet.to_string(), "172.20.16.0/20");
        assert_eq!(ranges.load_balancer_subnet.to_string(), "172.20.32.0/20");
    }

    #[test]
    fn test_top_block_wraps_load_balancer() {
        let ranges = NetworkRanges::from_octets(31, 250).unwrap();
        assert_eq!(ranges.vswitch_subnet.to_string(), "172.31.240.0/20");
        assert_eq!(ranges.load_balancer_subnet.to_string(), "172.31.16.0/20");
    }

    #[test]
    fn test_alignment() {
        let ranges = NetworkRanges::from_octets(18, 100).unwrap();
        assert_eq!(ranges.vswitch_subnet.to_string(), "172.18.96.0/20");
        assert_eq!(ranges.load_balancer_subnet.to_string(), "172.18.112.0/20");
    }

    #[test]
    fn test_validate_rejects_bad_layouts() {
        let cluster = parse_cidr("172.20.0.0/16").unwrap();
        let base = NetworkRanges {
            cluster,
            vswitch_subnet: parse_cidr("172.20.0.0/20").unwrap(),
            load_balancer_subnet: parse_cidr("172.20.32.0/20").unwrap(),
        };
        assert!(matches!(
            base.validate(),
            Err(NetworkPlanError::ReservedBase { .. })
        ));

        let overlapping = NetworkRanges {
            cluster,
            vswitch_subnet: parse_cidr("172.20.16.0/20").unwrap(),
            load_balancer_subnet: parse_cidr("172.20.16.0/20").unwrap(),
        };
        assert!(matches!(
            overlapping.validate(),
            Err(NetworkPlanError::Overlap { .. })
        ));

        let outside = NetworkRanges {
            cluster,
            vswitch_subnet: parse_cidr("172.21.16.0/20").unwrap(),
            load_balancer_subnet: parse_cidr("172.20.32.0/20").unwrap(),
        };
        assert!(matches!(
            outside.validate(),
            Err(NetworkPlanError::NotContained { .. })
        ));
    }

    #[test]
    fn test_private_ips_start_at_offset_ten() {
        let ranges = NetworkRanges::from_octets(21, 224).unwrap();
        assert_eq!(ranges.private_ip(0).unwrap(), Ipv4Addr::new(172, 21, 224, 10));
        assert_eq!(ranges.private_ip(2).unwrap(), Ipv4Addr::new(172, 21, 224, 12));
        assert_eq!(ranges.vswitch_gateway(), Ipv4Addr::new(172, 21, 224, 1));
        assert_eq!(
            with_prefix(ranges.private_ip(0).unwrap(), &ranges.vswitch_subnet),
            "172.21.224.10/20"
        );
    }

    #[test]
    fn test_host_address_bounds() {
        let net = parse_cidr("10.0.0.0/30").unwrap();
        assert_eq!(host_address(&net, 1).unwrap(), Ipv4Addr::new(10, 0, 0, 1));
        assert!(host_address(&net, 3).is_err());
        assert!(host_address(&net, 0).is_err());
    }

    #[test]
    fn test_parse_cidr_errors() {
        assert!(matches!(
            parse_cidr("not-a-cidr"),
            Err(NetworkPlanError::InvalidCidr { .. })
        ));
        assert!(is_rfc1918("172.16.5.4".parse().unwrap()));
        assert!(!is_rfc1918("65.109.58.113".parse().unwrap()));
    }
}
