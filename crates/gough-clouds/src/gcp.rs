//! GCP Compute Engine driver.
//!
//! Authenticates as a service account: a short-lived RS256 JWT is exchanged
//! at the OAuth token endpoint for an access token, which is cached until
//! shortly before expiry.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use gough_core::MachineState;

use crate::error::{CloudError, Result};
use crate::registry::DriverConfig;
use crate::types::{Descriptor, Machine, MachineFilters, MachineSpec};
use crate::util::classify_ips;
use crate::{CloudDriver, REQUEST_TIMEOUT};

const DEFAULT_API_BASE: &str = "https://compute.googleapis.com/compute/v1";
const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const COMPUTE_SCOPE: &str = "https://www.googleapis.com/auth/compute";
const TOKEN_SLACK_SECONDS: i64 = 60;

/// Driver for GCP Compute Engine.
pub struct GcpDriver {
    client: reqwest::Client,
    api_base: String,
    token_uri: String,
    project: String,
    zone: String,
    client_email: String,
    private_key_pem: String,
    token: RwLock<Option<CachedToken>>,
}

struct CachedToken {
    access_token: String,
    expires_at: DateTime<Utc>,
}

/// Map a GCP instance status into the unified state.
///
/// `STOPPING`/`SUSPENDING` still count as running: the machine is up until
/// the transition finishes.
#[must_use]
pub fn map_state(status: &str) -> MachineState {
    match status {
        "PROVISIONING" | "STAGING" => MachineState::Pending,
        "RUNNING" | "STOPPING" | "SUSPENDING" => MachineState::Running,
        "STOPPED" | "SUSPENDED" => MachineState::Stopped,
        "REPAIRING" => MachineState::Error,
        "TERMINATED" => MachineState::Terminated,
        _ => MachineState::Unknown,
    }
}

#[derive(Serialize)]
struct JwtClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: i64,
}

#[derive(Debug, Deserialize)]
struct InstanceList {
    #[serde(default)]
    items: Vec<GcpInstance>,
    #[serde(default, rename = "nextPageToken")]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GcpInstance {
    name: String,
    #[serde(default)]
    status: String,
    #[serde(default, rename = "machineType")]
    machine_type: String,
    #[serde(default, rename = "networkInterfaces")]
    network_interfaces: Vec<NetworkInterface>,
    #[serde(default, rename = "creationTimestamp")]
    creation_timestamp: Option<DateTime<Utc>>,
    #[serde(default, rename = "lastStartTimestamp")]
    last_start_timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    labels: std::collections::BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct NetworkInterface {
    #[serde(default, rename = "networkIP")]
    network_ip: String,
    #[serde(default, rename = "accessConfigs")]
    access_configs: Vec<AccessConfig>,
}

#[derive(Debug, Deserialize)]
struct AccessConfig {
    #[serde(default, rename = "natIP")]
    nat_ip: String,
}

impl GcpDriver {
    /// Build a driver from registry configuration.
    ///
    /// Credentials: `project_id`, `client_email`, `private_key` (service
    /// account PEM), and a `zone` (falls back to the provider region).
    ///
    /// # Errors
    ///
    /// Returns [`CloudError::Auth`] when required fields are missing.
    pub fn from_config(config: &DriverConfig) -> Result<Self> {
        let project = config.require("project_id")?;
        let client_email = config.require("client_email")?;
        let private_key_pem = config.require("private_key")?;
        let zone = config
            .optional("zone")
            .unwrap_or_else(|| config.region.clone());

        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| CloudError::cloud(e.to_string()))?;

        Ok(Self {
            client,
            api_base: config
                .optional("api_base")
                .unwrap_or_else(|| DEFAULT_API_BASE.to_string()),
            token_uri: config
                .optional("token_uri")
                .unwrap_or_else(|| DEFAULT_TOKEN_URI.to_string()),
            project,
            zone,
            client_email,
            private_key_pem,
            token: RwLock::new(None),
        })
    }

    fn zone_url(&self, suffix: &str) -> String {
        format!(
            "{}/projects/{}/zones/{}/{suffix}",
            self.api_base, self.project, self.zone
        )
    }

    async fn access_token(&self) -> Result<String> {
        {
            let cached = self.token.read().await;
            if let Some(token) = cached.as_ref() {
                if token.expires_at > Utc::now() + Duration::seconds(TOKEN_SLACK_SECONDS) {
                    return Ok(token.access_token.clone());
                }
            }
        }

        let now = Utc::now();
        let claims = JwtClaims {
            iss: &self.client_email,
            scope: COMPUTE_SCOPE,
            aud: &self.token_uri,
            iat: now.timestamp(),
            exp: (now + Duration::hours(1)).timestamp(),
        };
        let key = EncodingKey::from_rsa_pem(self.private_key_pem.as_bytes())
            .map_err(|e| CloudError::Auth(format!("invalid service account key: {e}")))?;
        let assertion = jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, &key)
            .map_err(|e| CloudError::Auth(format!("failed to sign token request: {e}")))?;

        let response = self
            .client
            .post(&self.token_uri)
            .form(&[
                ("grant_type", "urn:ietf:params:oauth:grant-type:jwt-bearer"),
                ("assertion", assertion.as_str()),
            ])
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(CloudError::Auth(format!(
                "token exchange failed: {status}: {body}"
            )));
        }

        let token: TokenResponse = response.json().await?;
        let access_token = token.access_token.clone();
        *self.token.write().await = Some(CachedToken {
            access_token: token.access_token,
            expires_at: now + Duration::seconds(token.expires_in.max(60)),
        });
        Ok(access_token)
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        let token = self.access_token().await?;
        let response = request.bearer_auth(token).send().await?;
        if response.status().is_success() {
            Ok(response)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(CloudError::from_status(status, &body))
        }
    }

    fn parse_instance(&self, instance: GcpInstance) -> Machine {
        let state = map_state(&instance.status);

        let mut private = Vec::new();
        let mut public = Vec::new();
        for interface in &instance.network_interfaces {
            if !interface.network_ip.is_empty() {
                private.push(interface.network_ip.clone());
            }
            for access in &interface.access_configs {
                if !access.nat_ip.is_empty() {
                    public.push(access.nat_ip.clone());
                }
            }
        }
        // NAT IPs are always public and networkIPs private by construction,
        // but placeholder values still need filtering.
        let (public_ips, _) = classify_ips(&public);
        let (_, private_ips) = classify_ips(&private);

        let size = instance
            .machine_type
            .rsplit('/')
            .next()
            .unwrap_or_default()
            .to_string();

        let mut extra = serde_json::Map::new();
        extra.insert("status".into(), serde_json::json!(instance.status));

        let mut machine = Machine::new(instance.name.clone(), instance.name, state);
        machine.region = self.zone.clone();
        machine.size = size;
        machine.public_ips = public_ips;
        machine.private_ips = private_ips;
        machine.tags = instance.labels;
        machine.extra = extra;
        machine.created_at = instance.creation_timestamp;
        machine.updated_at = instance.last_start_timestamp;
        machine
    }

    async fn instance_action(&self, id: &str, action: &str) -> Result<()> {
        self.send(
            self.client
                .post(self.zone_url(&format!("instances/{id}/{action}"))),
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl CloudDriver for GcpDriver {
    fn name(&self) -> &'static str {
        "gcp"
    }

    async fn authenticate(&self) -> Result<()> {
        self.access_token().await?;
        Ok(())
    }

    async fn list_machines(&self, filters: &MachineFilters) -> Result<Vec<Machine>> {
        let mut machines = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut request = self.client.get(self.zone_url("instances"));
            if let Some(token) = &page_token {
                request = request.query(&[("pageToken", token.as_str())]);
            }

            let page: InstanceList = self.send(request).await?.json().await?;
            machines.extend(page.items.into_iter().map(|i| self.parse_instance(i)));

            page_token = page.next_page_token;
            if page_token.is_none() {
                break;
            }
        }

        machines.retain(|m| filters.matches(m));
        Ok(machines)
    }

    async fn get_machine(&self, id: &str) -> Result<Machine> {
        let instance: GcpInstance = self
            .send(self.client.get(self.zone_url(&format!("instances/{id}"))))
            .await?
            .json()
            .await?;
        Ok(self.parse_instance(instance))
    }

    async fn create_machine(&self, spec: &MachineSpec) -> Result<Machine> {
        let machine_type = format!("zones/{}/machineTypes/{}", self.zone, spec.size);
        let network = spec
            .networks
            .first()
            .cloned()
            .unwrap_or_else(|| "global/networks/default".to_string());

        let mut metadata_items = Vec::new();
        if !spec.cloud_init.is_empty() {
            // GCP cloud-init rides in the `user-data` metadata key.
            metadata_items.push(serde_json::json!({
                "key": "user-data",
                "value": spec.cloud_init,
            }));
        }

        let mut disk_params = serde_json::json!({ "sourceImage": spec.image });
        if spec.storage_gb > 0 {
            disk_params["diskSizeGb"] = serde_json::json!(spec.storage_gb.to_string());
        }

        let body = serde_json::json!({
            "name": spec.name,
            "machineType": machine_type,
            "disks": [{
                "boot": true,
                "autoDelete": true,
                "initializeParams": disk_params,
            }],
            "networkInterfaces": [{
                "network": network,
                "accessConfigs": [{
                    "type": "ONE_TO_ONE_NAT",
                    "name": "External NAT",
                }],
            }],
            "metadata": { "items": metadata_items },
            "labels": spec.tags,
        });

        self.send(self.client.post(self.zone_url("instances")).json(&body))
            .await?;

        // Insert returns an operation; the instance object is fetched by
        // name, in whatever transitional state it is in.
        self.get_machine(&spec.name).await
    }

    async fn destroy_machine(&self, id: &str) -> Result<()> {
        self.send(
            self.client
                .delete(self.zone_url(&format!("instances/{id}"))),
        )
        .await?;
        Ok(())
    }

    async fn start_machine(&self, id: &str) -> Result<()> {
        self.instance_action(id, "start").await
    }

    async fn stop_machine(&self, id: &str) -> Result<()> {
        self.instance_action(id, "stop").await
    }

    async fn reboot_machine(&self, id: &str) -> Result<()> {
        self.instance_action(id, "reset").await
    }

    async fn list_sizes(&self) -> Result<Vec<Descriptor>> {
        #[derive(Deserialize)]
        struct MachineTypeList {
            #[serde(default)]
            items: Vec<MachineType>,
            #[serde(default, rename = "nextPageToken")]
            next_page_token: Option<String>,
        }

        #[derive(Deserialize)]
        struct MachineType {
            name: String,
            #[serde(default)]
            description: String,
        }

        let mut sizes = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut request = self.client.get(self.zone_url("machineTypes"));
            if let Some(token) = &page_token {
                request = request.query(&[("pageToken", token.as_str())]);
            }
            let page: MachineTypeList = self.send(request).await?.json().await?;
            sizes.extend(
                page.items
                    .into_iter()
                    .map(|t| Descriptor::new(t.name.clone(), t.description)),
            );
            page_token = page.next_page_token;
            if page_token.is_none() {
                break;
            }
        }
        Ok(sizes)
    }

    async fn list_regions(&self) -> Result<Vec<Descriptor>> {
        #[derive(Deserialize)]
        struct ZoneList {
            #[serde(default)]
            items: Vec<Zone>,
        }

        #[derive(Deserialize)]
        struct Zone {
            name: String,
            #[serde(default)]
            region: String,
        }

        let url = format!("{}/projects/{}/zones", self.api_base, self.project);
        let zones: ZoneList = self.send(self.client.get(url)).await?.json().await?;
        Ok(zones
            .items
            .into_iter()
            .map(|z| Descriptor::new(z.name, z.region))
            .collect())
    }

    async fn get_console_output(&self, id: &str) -> Result<String> {
        #[derive(Deserialize)]
        struct SerialOutput {
            #[serde(default)]
            contents: String,
        }

        let output: SerialOutput = self
            .send(
                self.client
                    .get(self.zone_url(&format!("instances/{id}/serialPort"))),
            )
            .await?
            .json()
            .await?;
        Ok(output.contents)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    // Throwaway RSA key used only to exercise the signing path in tests.
    const TEST_KEY: &str = include_str!("testdata/gcp_test_key.pem");

    fn driver(server: &MockServer) -> GcpDriver {
        let config = DriverConfig {
            kind: "gcp".to_string(),
            region: "us-central1-a".to_string(),
            credentials: [
                ("project_id".to_string(), serde_json::json!("test-project")),
                (
                    "client_email".to_string(),
                    serde_json::json!("sa@test-project.iam.gserviceaccount.com"),
                ),
                ("private_key".to_string(), serde_json::json!(TEST_KEY)),
                (
                    "api_base".to_string(),
                    serde_json::json!(format!("{}/compute/v1", server.uri())),
                ),
                (
                    "token_uri".to_string(),
                    serde_json::json!(format!("{}/token", server.uri())),
                ),
            ]
            .into_iter()
            .collect(),
        };
        GcpDriver::from_config(&config).unwrap()
    }

    async fn mount_token(server: &MockServer) {
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "test-access-token",
                "expires_in": 3600,
                "token_type": "Bearer",
            })))
            .mount(server)
            .await;
    }

    #[test]
    fn state_map() {
        assert_eq!(map_state("PROVISIONING"), MachineState::Pending);
        assert_eq!(map_state("STAGING"), MachineState::Pending);
        assert_eq!(map_state("RUNNING"), MachineState::Running);
        assert_eq!(map_state("STOPPING"), MachineState::Running);
        assert_eq!(map_state("SUSPENDING"), MachineState::Running);
        assert_eq!(map_state("STOPPED"), MachineState::Stopped);
        assert_eq!(map_state("SUSPENDED"), MachineState::Stopped);
        assert_eq!(map_state("REPAIRING"), MachineState::Error);
        assert_eq!(map_state("TERMINATED"), MachineState::Terminated);
    }

    #[tokio::test]
    async fn token_exchange_and_instance_get() {
        let server = MockServer::start().await;
        mount_token(&server).await;

        Mock::given(method("GET"))
            .and(path(
                "/compute/v1/projects/test-project/zones/us-central1-a/instances/web-1",
            ))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "name": "web-1",
                "status": "RUNNING",
                "machineType": "projects/test-project/zones/us-central1-a/machineTypes/n1-standard-2",
                "networkInterfaces": [{
                    "networkIP": "10.128.0.3",
                    "accessConfigs": [{ "natIP": "203.0.113.55" }],
                }],
                "labels": { "env": "prod" },
            })))
            .mount(&server)
            .await;

        let machine = driver(&server).get_machine("web-1").await.unwrap();
        assert_eq!(machine.state, MachineState::Running);
        assert_eq!(machine.size, "n1-standard-2");
        assert_eq!(machine.public_ips, vec!["203.0.113.55"]);
        assert_eq!(machine.private_ips, vec!["10.128.0.3"]);
    }

    #[tokio::test]
    async fn failed_token_exchange_is_auth_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(400).set_body_string("invalid_grant"))
            .mount(&server)
            .await;

        let result = driver(&server).authenticate().await;
        assert!(matches!(result, Err(CloudError::Auth(_))));
    }

    #[tokio::test]
    async fn console_output_reads_serial_port() {
        let server = MockServer::start().await;
        mount_token(&server).await;

        Mock::given(method("GET"))
            .and(path(
                "/compute/v1/projects/test-project/zones/us-central1-a/instances/web-1/serialPort",
            ))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "contents": "boot log here"
            })))
            .mount(&server)
            .await;

        let output = driver(&server).get_console_output("web-1").await.unwrap();
        assert_eq!(output, "boot log here");
    }
}
