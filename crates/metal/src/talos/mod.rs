//! Talos maintenance-mode access and network discovery.
//!
//! Nodes that booted the Talos installer but have no machine configuration
//! yet expose a read-only API. This module wraps it and derives the network
//! facts the bootstrap phase needs.

mod discovery;
mod maintenance;

pub use discovery::{
    detect_private_interface, find_public_interface, DiscoveredNetworkInfo, DiscoveryReport,
    DiscoveryTarget, NetworkDiscovery, PrivateInterface, PublicInterface,
};
pub use maintenance::{
    parse_resources, AddressSpec, LinkSpec, MaintenanceApi, MaintenanceError, Resource,
    ResourceMetadata, RouteSpec, Talosctl,
};
