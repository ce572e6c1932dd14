//! Hetzner Robot API client implementation.
//!
//! Uses the Hetzner Robot API for dedicated server management.
//! API Documentation: <https://robot.hetzner.com/doc/webservice/en.html>

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use tracing::{debug, info, warn};

use super::models::{
    CancelVSwitchRequest, CreateVSwitchRequest, HetznerServer, RescueRequest, RescueResponse,
    ResetRequest, VSwitchResponse,
};
use crate::providers::traits::{
    AttachedServer, AttachmentStatus, Inventory, ProviderError, RescueState, Server,
    ServerDetails, VSwitch, VSwitchDetails,
};

/// Base URL for Hetzner Robot API.
const API_BASE_URL: &str = "https://robot-ws.your-server.de";

/// Default timeout for API requests.
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Hetzner Robot dedicated server inventory.
#[derive(Clone)]
pub struct HetznerRobot {
    /// HTTP client.
    client: Client,
    /// API base URL.
    base_url: String,
    /// Robot API username.
    username: String,
    /// Robot API password.
    password: String,
}

impl HetznerRobot {
    /// Create a new Hetzner Robot client.
    ///
    /// # Arguments
    /// * `username` - Hetzner Robot webservice username
    /// * `password` - Hetzner Robot webservice password
    ///
    /// # Errors
    /// Returns error if credentials are empty or the HTTP client cannot be created.
    pub fn new(
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Result<Self, ProviderError> {
        let username = username.into();
        let password = password.into();
        if username.is_empty() || password.is_empty() {
            return Err(ProviderError::Config(
                "Hetzner Robot username and password are required".to_string(),
            ));
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()?;

        Ok(Self {
            client,
            base_url: API_BASE_URL.to_string(),
            username,
            password,
        })
    }

    /// Create a client from a `username:password` token.
    ///
    /// # Errors
    /// Returns error if the token has no colon separator.
    pub fn from_token(token: &str) -> Result<Self, ProviderError> {
        let (username, password) = token.split_once(':').ok_or_else(|| {
            ProviderError::Config("token must be in the form username:password".to_string())
        })?;
        Self::new(username, password)
    }

    /// Point the client at a different API endpoint.
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Make an authenticated GET request.
    async fn get<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, ProviderError> {
        let url = format!("{}{path}", self.base_url);
        debug!(url = %url, "GET request");

        let response = self
            .client
            .get(&url)
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await?;

        Self::handle_response(response).await
    }

    /// Make an authenticated POST request with form data.
    async fn post_form<T, B>(&self, path: &str, body: &B) -> Result<T, ProviderError>
    where
        T: serde::de::DeserializeOwned,
        B: serde::Serialize + ?Sized,
    {
        let url = format!("{}{path}", self.base_url);
        debug!(url = %url, "POST request (form)");

        let response = self
            .client
            .post(&url)
            .basic_auth(&self.username, Some(&self.password))
            .form(body)
            .send()
            .await?;

        Self::handle_response(response).await
    }

    /// Make an authenticated POST request whose response body is ignored.
    async fn post_form_empty<B: serde::Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<(), ProviderError> {
        let url = format!("{}{path}", self.base_url);
        debug!(url = %url, "POST request (empty response)");

        let response = self
            .client
            .post(&url)
            .basic_auth(&self.username, Some(&self.password))
            .form(body)
            .send()
            .await?;

        Self::check_status(response).await
    }

    /// Make an authenticated DELETE request, optionally with a form body.
    async fn delete<B: serde::Serialize + ?Sized>(
        &self,
        path: &str,
        body: Option<&B>,
    ) -> Result<(), ProviderError> {
        let url = format!("{}{path}", self.base_url);
        debug!(url = %url, "DELETE request");

        let mut request = self
            .client
            .delete(&url)
            .basic_auth(&self.username, Some(&self.password));
        if let Some(body) = body {
            request = request.form(body);
        }

        Self::check_status(request.send().await?).await
    }

    /// Map a non-2xx response to an error, discarding any success body.
    async fn check_status(response: reqwest::Response) -> Result<(), ProviderError> {
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let text = response.text().await.unwrap_or_default();
        if status == StatusCode::NOT_FOUND {
            Err(ProviderError::NotFound(text))
        } else {
            Err(ProviderError::Api {
                status: status.as_u16(),
                message: text,
            })
        }
    }

    /// Handle API response, parsing JSON or error.
    async fn handle_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, ProviderError> {
        let status = response.status();
        let text = response.text().await?;

        if status.is_success() {
            serde_json::from_str(&text).map_err(|e| {
                warn!(error = %e, body = %text, "Failed to parse response");
                ProviderError::Serialization(e)
            })
        } else if status == StatusCode::NOT_FOUND {
            Err(ProviderError::NotFound(text))
        } else {
            Err(ProviderError::Api {
                status: status.as_u16(),
                message: text,
            })
        }
    }

    /// Convert a Robot server record to our Server type.
    fn to_server(server: &HetznerServer) -> Server {
        let s = &server.server;
        Server {
            id: s.server_number.to_string(),
            name: s.server_name.clone(),
            ip: s.server_ip.clone(),
            product: s.product.clone(),
            dc: s.dc.clone(),
            status: s.status.clone(),
            cancelled: s.cancelled,
            paid_until: s.paid_until.clone(),
        }
    }

    fn to_vswitch(vswitch: &VSwitchResponse) -> VSwitch {
        VSwitch {
            id: vswitch.id.to_string(),
            name: vswitch.name.clone(),
            vlan: vswitch.vlan,
            cancelled: vswitch.cancelled,
        }
    }

    fn to_rescue_state(id: &str, rescue: &RescueResponse) -> RescueState {
        RescueState {
            server_id: id.to_string(),
            active: rescue.rescue.active,
            password: rescue
                .rescue
                .password
                .clone()
                .filter(|password| !password.is_empty()),
        }
    }
}

#[async_trait]
impl Inventory for HetznerRobot {
    async fn list_servers(&self) -> Result<Vec<Server>, ProviderError> {
        let response: Vec<HetznerServer> = self.get("/server").await?;
        Ok(response.iter().map(Self::to_server).collect())
    }

    async fn get_server(&self, id: &str) -> Result<ServerDetails, ProviderError> {
        let response: HetznerServer = self.get(&format!("/server/{id}")).await?;
        Ok(ServerDetails {
            server: Self::to_server(&response),
            rescue_available: response.server.rescue,
            reset_available: response.server.reset,
        })
    }

    async fn list_vswitches(&self) -> Result<Vec<VSwitch>, ProviderError> {
        let response: Vec<VSwitchResponse> = self.get("/vswitch").await?;
        Ok(response.iter().map(Self::to_vswitch).collect())
    }

    async fn get_vswitch(&self, id: &str) -> Result<VSwitchDetails, ProviderError> {
        let response: VSwitchResponse = self.get(&format!("/vswitch/{id}")).await?;
        let servers = response
            .server
            .iter()
            .map(|s| AttachedServer {
                server_id: s.server_number.to_string(),
                server_ip: s.server_ip.clone(),
                status: AttachmentStatus::from_provider(&s.status),
            })
            .collect();

        Ok(VSwitchDetails {
            vswitch: Self::to_vswitch(&response),
            servers,
            has_cloud_network: !response.cloud_network.is_empty(),
        })
    }

    async fn create_vswitch(&self, name: &str, vlan: u16) -> Result<VSwitch, ProviderError> {
        info!(name = %name, vlan, "Creating vSwitch");
        let req = CreateVSwitchRequest {
            name: name.to_string(),
            vlan,
        };
        let response: VSwitchResponse = self.post_form("/vswitch", &req).await?;
        Ok(Self::to_vswitch(&response))
    }

    async fn delete_vswitch(&self, id: &str) -> Result<(), ProviderError> {
        info!(vswitch_id = %id, "Cancelling vSwitch");
        let req = CancelVSwitchRequest {
            cancellation_date: "now".to_string(),
        };
        self.delete(&format!("/vswitch/{id}"), Some(&req)).await
    }

    async fn attach_servers(
        &self,
        vswitch_id: &str,
        server_ids: &[String],
    ) -> Result<(), ProviderError> {
        if server_ids.is_empty() {
            return Ok(());
        }

        info!(
            vswitch_id = %vswitch_id,
            servers = ?server_ids,
            "Attaching servers to vSwitch"
        );
        let form: Vec<(&str, &str)> = server_ids
            .iter()
            .map(|id| ("server[]", id.as_str()))
            .collect();
        self.post_form_empty(&format!("/vswitch/{vswitch_id}/server"), &form)
            .await
    }

    async fn rescue_status(&self, id: &str) -> Result<RescueState, ProviderError> {
        let response: RescueResponse = self.get(&format!("/boot/{id}/rescue")).await?;
        Ok(Self::to_rescue_state(id, &response))
    }

    async fn enable_rescue(&self, id: &str) -> Result<RescueState, ProviderError> {
        info!(server_id = %id, "Activating rescue system");
        let req = RescueRequest {
            os: "linux".to_string(),
        };
        let response: RescueResponse = self.post_form(&format!("/boot/{id}/rescue"), &req).await?;
        Ok(Self::to_rescue_state(id, &response))
    }

    async fn disable_rescue(&self, id: &str) -> Result<(), ProviderError> {
        info!(server_id = %id, "Deactivating rescue system");
        self.delete::<()>(&format!("/boot/{id}/rescue"), None).await
    }

    async fn reset_server(&self, id: &str) -> Result<(), ProviderError> {
        info!(server_id = %id, "Triggering hardware reset");
        let req = ResetRequest {
            reset_type: "hw".to_string(),
        };
        self.post_form_empty(&format!("/reset/{id}"), &req).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{basic_auth, body_string, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn client_for(server: &MockServer) -> HetznerRobot {
        HetznerRobot::new("robot-user", "secret")
            .unwrap()
            .with_base_url(server.uri())
    }

    #[test]
    fn test_empty_credentials_rejected() {
        assert!(matches!(
            HetznerRobot::new("", "secret"),
            Err(ProviderError::Config(_))
        ));
        assert!(HetznerRobot::from_token("no-colon").is_err());
        assert!(HetznerRobot::from_token("user:pass").is_ok());
    }

    #[tokio::test]
    async fn test_list_servers_maps_fields() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/server"))
            .and(basic_auth("robot-user", "secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                {"server": {
                    "server_ip": "123.123.123.123",
                    "server_ipv6_net": "2a01:f48:111:4221::",
                    "server_number": 321,
                    "server_name": "node-a",
                    "product": "AX52",
                    "dc": "FSN1-DC14",
                    "traffic": "5 TB",
                    "status": "ready",
                    "cancelled": false,
                    "paid_until": "2026-12-31"
                }}
            ])))
            .mount(&server)
            .await;

        let servers = client_for(&server).await.list_servers().await.unwrap();
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].id, "321");
        assert_eq!(servers[0].name, "node-a");
        assert_eq!(servers[0].product, "AX52");
        assert!(!servers[0].cancelled);
    }

    #[tokio::test]
    async fn test_get_server_reports_rescue_capability() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/server/321"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "server": {
                    "server_ip": "123.123.123.123",
                    "server_number": 321,
                    "server_name": "node-a",
                    "product": "AX52",
                    "dc": "FSN1-DC14",
                    "status": "ready",
                    "cancelled": false,
                    "paid_until": "2026-12-31",
                    "reset": true,
                    "rescue": false,
                    "vnc": true,
                    "windows": false
                }
            })))
            .mount(&server)
            .await;

        let details = client_for(&server).await.get_server("321").await.unwrap();
        assert!(!details.rescue_available);
        assert!(details.reset_available);
    }

    #[tokio::test]
    async fn test_attach_is_one_batched_request() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/vswitch/4321/server"))
            .and(body_string("server%5B%5D=321&server%5B%5D=421"))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;

        client_for(&server)
            .await
            .attach_servers("4321", &["321".to_string(), "421".to_string()])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_get_vswitch_detects_cloud_network() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/vswitch/4321"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": 4321,
                "name": "prod",
                "vlan": 4002,
                "cancelled": false,
                "server": [{"server_ip": "1.2.3.4", "server_number": 321, "status": "failed"}],
                "subnet": [],
                "cloud_network": [{"id": 9, "ip": "10.0.0.0", "mask": 24, "gateway": "10.0.0.1"}]
            })))
            .mount(&server)
            .await;

        let details = client_for(&server).await.get_vswitch("4321").await.unwrap();
        assert!(details.has_cloud_network);
        assert_eq!(details.vswitch.vlan, 4002);
        assert_eq!(details.status_of("321"), AttachmentStatus::Failed);
    }

    #[tokio::test]
    async fn test_enable_rescue_returns_password() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/boot/321/rescue"))
            .and(body_string("os=linux"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "rescue": {
                    "server_ip": "123.123.123.123",
                    "server_number": 321,
                    "os": "linux",
                    "active": true,
                    "password": "jEt0dtUvomJ",
                    "authorized_key": [],
                    "host_key": []
                }
            })))
            .mount(&server)
            .await;

        let state = client_for(&server).await.enable_rescue("321").await.unwrap();
        assert!(state.active);
        assert_eq!(state.password.as_deref(), Some("jEt0dtUvomJ"));
    }

    #[tokio::test]
    async fn test_error_statuses_are_mapped() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/reset/321"))
            .respond_with(ResponseTemplate::new(409).set_body_string("RESET_NOT_AVAILABLE"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/vswitch/1"))
            .respond_with(ResponseTemplate::new(404).set_body_string("NOT_FOUND"))
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        match client.reset_server("321").await {
            Err(ProviderError::Api { status, message }) => {
                assert_eq!(status, 409);
                assert!(message.contains("RESET_NOT_AVAILABLE"));
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert!(matches!(
            client.get_vswitch("1").await,
            Err(ProviderError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_vswitch_cancels_now() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/vswitch/4321"))
            .and(body_string("cancellation_date=now"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        client_for(&server).await.delete_vswitch("4321").await.unwrap();
    }
}
