//! Hetzner Robot dedicated server provider.
//!
//! Implements the [`Inventory`](crate::providers::Inventory) trait for the
//! Hetzner Robot webservice: servers, vSwitches, the rescue system and
//! hardware resets.

mod client;
mod models;

pub use client::HetznerRobot;
