//! Inventory trait and common types for dedicated server providers.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur during provider operations.
#[derive(Error, Debug)]
pub enum ProviderError {
    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// API returned an error response.
    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// A dedicated server as reported by the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Server {
    /// Provider-assigned server number.
    pub id: String,
    /// Server name set in the provider console.
    pub name: String,
    /// Primary public IPv4 address.
    pub ip: String,
    /// Product / SKU (e.g. "AX52").
    pub product: String,
    /// Datacenter (e.g. "FSN1-DC14").
    pub dc: String,
    /// Lifecycle status ("ready", "in process").
    pub status: String,
    /// Whether the server has been cancelled.
    pub cancelled: bool,
    /// Paid-until date, when reported.
    pub paid_until: Option<String>,
}

impl Server {
    /// Display label used in prompts and tables.
    #[must_use]
    pub fn label(&self) -> String {
        if self.name.is_empty() {
            format!("#{} ({})", self.id, self.ip)
        } else {
            format!("{} ({})", self.name, self.ip)
        }
    }
}

/// Server details including boot capabilities.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerDetails {
    /// Base server information.
    pub server: Server,
    /// Whether the rescue system can be booted.
    pub rescue_available: bool,
    /// Whether hardware reset is available.
    pub reset_available: bool,
}

/// A private network segment (vSwitch).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VSwitch {
    /// Provider id.
    pub id: String,
    /// Segment name.
    pub name: String,
    /// VLAN tag (4000-4091).
    pub vlan: u16,
    /// Whether the segment has been cancelled.
    pub cancelled: bool,
}

/// Attachment state of one server on a vSwitch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttachmentStatus {
    /// Not attached to the segment.
    #[serde(rename = "not attached")]
    NotAttached,
    /// Attachment requested and still being applied.
    #[serde(rename = "in process")]
    InProcess,
    /// Attached and usable.
    #[serde(rename = "ready")]
    Ready,
    /// The provider failed to attach the server.
    #[serde(rename = "failed")]
    Failed,
}

impl AttachmentStatus {
    /// Parse the provider's status string. Unknown values count as in process.
    #[must_use]
    pub fn from_provider(status: &str) -> Self {
        match status {
            "ready" => Self::Ready,
            "failed" => Self::Failed,
            "not attached" | "" => Self::NotAttached,
            _ => Self::InProcess,
        }
    }

    /// Whether no further attach call is needed.
    #[must_use]
    pub fn is_settling_or_ready(self) -> bool {
        matches!(self, Self::Ready | Self::InProcess)
    }
}

impl std::fmt::Display for AttachmentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotAttached => write!(f, "not attached"),
            Self::InProcess => write!(f, "in process"),
            Self::Ready => write!(f, "ready"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// A server attached to a vSwitch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachedServer {
    /// Server number.
    pub server_id: String,
    /// Server public IP.
    pub server_ip: String,
    /// Attachment status.
    pub status: AttachmentStatus,
}

/// vSwitch details with attached servers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VSwitchDetails {
    /// Segment identity.
    pub vswitch: VSwitch,
    /// Servers attached to the segment.
    pub servers: Vec<AttachedServer>,
    /// Whether a cloud network is bound to the segment.
    pub has_cloud_network: bool,
}

impl VSwitchDetails {
    /// Attachment status of a server, `NotAttached` when absent.
    #[must_use]
    pub fn status_of(&self, server_id: &str) -> AttachmentStatus {
        self.servers
            .iter()
            .find(|s| s.server_id == server_id)
            .map_or(AttachmentStatus::NotAttached, |s| s.status)
    }
}

/// Rescue system state for one server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RescueState {
    /// Server number.
    pub server_id: String,
    /// Whether the rescue system is armed for next boot.
    pub active: bool,
    /// One-time root password, only present right after activation.
    pub password: Option<String>,
}

/// Operations against a dedicated server inventory.
///
/// Every call is a single request; callers own retry and polling.
#[async_trait]
pub trait Inventory: Send + Sync {
    /// List all servers on the account.
    async fn list_servers(&self) -> Result<Vec<Server>, ProviderError>;

    /// Get server details by id.
    async fn get_server(&self, id: &str) -> Result<ServerDetails, ProviderError>;

    /// List all vSwitches.
    async fn list_vswitches(&self) -> Result<Vec<VSwitch>, ProviderError>;

    /// Get vSwitch details including attached servers.
    async fn get_vswitch(&self, id: &str) -> Result<VSwitchDetails, ProviderError>;

    /// Create a vSwitch.
    async fn create_vswitch(&self, name: &str, vlan: u16) -> Result<VSwitch, ProviderError>;

    /// Cancel a vSwitch immediately.
    async fn delete_vswitch(&self, id: &str) -> Result<(), ProviderError>;

    /// Attach servers to a vSwitch in one request.
    async fn attach_servers(&self, vswitch_id: &str, server_ids: &[String])
        -> Result<(), ProviderError>;

    /// Get the rescue system state.
    async fn rescue_status(&self, id: &str) -> Result<RescueState, ProviderError>;

    /// Arm the rescue system and return its one-time password.
    async fn enable_rescue(&self, id: &str) -> Result<RescueState, ProviderError>;

    /// Disarm the rescue system.
    async fn disable_rescue(&self, id: &str) -> Result<(), ProviderError>;

    /// Trigger a hardware reset.
    async fn reset_server(&self, id: &str) -> Result<(), ProviderError>;

    /// Check that the credentials are accepted.
    async fn validate_credentials(&self) -> Result<(), ProviderError> {
        self.list_servers().await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attachment_status_parsing() {
        assert_eq!(AttachmentStatus::from_provider("ready"), AttachmentStatus::Ready);
        assert_eq!(AttachmentStatus::from_provider("failed"), AttachmentStatus::Failed);
        assert_eq!(
            AttachmentStatus::from_provider("in process"),
            AttachmentStatus::InProcess
        );
        assert_eq!(
            AttachmentStatus::from_provider("not attached"),
            AttachmentStatus::NotAttached
        );
        assert!(AttachmentStatus::InProcess.is_settling_or_ready());
        assert!(!AttachmentStatus::Failed.is_settling_or_ready());
    }

    #[test]
    fn test_status_of_missing_server() {
        let details = VSwitchDetails {
            vswitch: VSwitch {
                id: "1".into(),
                name: "prod".into(),
                vlan: 4000,
                cancelled: false,
            },
            servers: vec![AttachedServer {
                server_id: "10".into(),
                server_ip: "1.2.3.4".into(),
                status: AttachmentStatus::Ready,
            }],
            has_cloud_network: false,
        };

        assert_eq!(details.status_of("10"), AttachmentStatus::Ready);
        assert_eq!(details.status_of("11"), AttachmentStatus::NotAttached);
    }
}
