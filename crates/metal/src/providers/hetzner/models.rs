//! Hetzner Robot API request and response models.
//!
//! Based on the Hetzner Robot webservice documentation. List endpoints return
//! bare JSON arrays of wrapper objects.

use serde::{Deserialize, Serialize};

// ============================================================================
// Server types
// ============================================================================

/// Server wrapper as returned by `GET /server` and `GET /server/{id}`.
#[derive(Debug, Deserialize)]
pub struct HetznerServer {
    /// Server details wrapper.
    pub server: ServerData,
}

/// Server details.
#[derive(Debug, Deserialize)]
pub struct ServerData {
    /// Server number (unique identifier).
    pub server_number: i64,
    /// Server name/label.
    #[serde(default)]
    pub server_name: String,
    /// Server IP address.
    pub server_ip: String,
    /// IPv6 network.
    pub server_ipv6_net: Option<String>,
    /// Product name (plan).
    #[serde(default)]
    pub product: String,
    /// Data center location.
    #[serde(default)]
    pub dc: String,
    /// Server status.
    #[serde(default)]
    pub status: String,
    /// Paid until date.
    pub paid_until: Option<String>,
    /// Whether the server is cancelled.
    #[serde(default)]
    pub cancelled: bool,
    /// Rescue system available (only on `GET /server/{id}`).
    #[serde(default)]
    pub rescue: bool,
    /// Hardware reset available (only on `GET /server/{id}`).
    #[serde(default)]
    pub reset: bool,
}

// ============================================================================
// vSwitch types
// ============================================================================

/// vSwitch as returned by `GET /vswitch`, `POST /vswitch` and `GET /vswitch/{id}`.
#[derive(Debug, Deserialize)]
pub struct VSwitchResponse {
    /// vSwitch ID.
    pub id: i64,
    /// vSwitch name.
    pub name: String,
    /// VLAN ID.
    pub vlan: u16,
    /// Whether cancelled.
    #[serde(default)]
    pub cancelled: bool,
    /// Attached servers (detail endpoint only).
    #[serde(default)]
    pub server: Vec<VSwitchServer>,
    /// Bound cloud networks (detail endpoint only).
    #[serde(default)]
    pub cloud_network: Vec<serde_json::Value>,
}

/// Server entry inside a vSwitch.
#[derive(Debug, Deserialize)]
pub struct VSwitchServer {
    /// Server IP.
    #[serde(default)]
    pub server_ip: String,
    /// Server number.
    pub server_number: i64,
    /// Attachment status: "ready", "in process", "failed".
    #[serde(default)]
    pub status: String,
}

/// Request for `POST /vswitch`.
#[derive(Debug, Serialize)]
pub struct CreateVSwitchRequest {
    /// vSwitch name.
    pub name: String,
    /// VLAN ID.
    pub vlan: u16,
}

/// Request for `DELETE /vswitch/{id}`.
#[derive(Debug, Serialize)]
pub struct CancelVSwitchRequest {
    /// Cancellation date, "now" for immediate.
    pub cancellation_date: String,
}

// ============================================================================
// Boot / reset types
// ============================================================================

/// Rescue activation request for `POST /boot/{server-number}/rescue`.
#[derive(Debug, Serialize)]
pub struct RescueRequest {
    /// Operating system (e.g., "linux").
    pub os: String,
}

/// Rescue response wrapper.
#[derive(Debug, Deserialize)]
pub struct RescueResponse {
    /// Rescue details.
    pub rescue: RescueDetails,
}

/// Rescue system details.
#[derive(Debug, Deserialize)]
pub struct RescueDetails {
    /// Server IP.
    #[serde(default)]
    pub server_ip: String,
    /// Server number.
    pub server_number: i64,
    /// Whether rescue is active.
    pub active: bool,
    /// Root password (only present right after activation).
    pub password: Option<String>,
}

/// Reset request for `POST /reset/{server-number}`.
#[derive(Debug, Serialize)]
pub struct ResetRequest {
    /// Reset type: "sw", "hw", "man", or "power".
    #[serde(rename = "type")]
    pub reset_type: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vswitch_detail_deserialization() {
        let json = r#"{
            "id": 4321,
            "name": "prod-cluster",
            "vlan": 4000,
            "cancelled": false,
            "server": [
                {"server_ip": "123.123.123.123", "server_ipv6_net": "2a01:4f8::", "server_number": 321, "status": "ready"},
                {"server_ip": "123.123.123.124", "server_ipv6_net": "2a01:4f8::", "server_number": 421, "status": "in process"}
            ],
            "subnet": [],
            "cloud_network": [{"id": 123, "ip": "10.0.2.0", "mask": 24, "gateway": "10.0.2.1"}]
        }"#;

        let vswitch: VSwitchResponse = serde_json::from_str(json).unwrap();
        assert_eq!(vswitch.vlan, 4000);
        assert_eq!(vswitch.server.len(), 2);
        assert_eq!(vswitch.server[1].status, "in process");
        assert_eq!(vswitch.cloud_network.len(), 1);
    }

    #[test]
    fn test_rescue_null_password() {
        let json = r#"{
            "rescue": {
                "server_ip": "123.123.123.123",
                "server_ipv6_net": "2a01:4f8:111:4221::",
                "server_number": 321,
                "os": ["linux", "vkvm"],
                "active": false,
                "password": null,
                "authorized_key": [],
                "host_key": []
            }
        }"#;

        let rescue: RescueResponse = serde_json::from_str(json).unwrap();
        assert!(!rescue.rescue.active);
        assert!(rescue.rescue.password.is_none());
    }
}
