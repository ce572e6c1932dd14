//! Provider abstractions for dedicated server inventories.

pub mod hetzner;
mod traits;

pub use traits::{
    AttachedServer, AttachmentStatus, Inventory, ProviderError, RescueState, Server,
    ServerDetails, VSwitch, VSwitchDetails,
};
