//! LXD driver (containers and VMs over the LXD REST API).

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::Deserialize;

use gough_core::MachineState;

use crate::error::{CloudError, Result};
use crate::registry::DriverConfig;
use crate::types::{Descriptor, Machine, MachineFilters, MachineSpec};
use crate::util::classify_ips;
use crate::{CloudDriver, REQUEST_TIMEOUT};

/// Driver for LXD.
///
/// Authenticates with a trusted client certificate. Most mutating calls
/// return background operations; the driver waits on the operation endpoint
/// so callers observe the same synchronous semantics as other backends.
pub struct LxdDriver {
    client: reqwest::Client,
    api_base: String,
}

/// Map an LXD instance status into the unified state.
#[must_use]
pub fn map_state(status: &str) -> MachineState {
    match status {
        "Running" => MachineState::Running,
        "Stopped" | "Frozen" => MachineState::Stopped,
        "Starting" | "Stopping" => MachineState::Pending,
        "Aborting" | "Error" => MachineState::Error,
        _ => MachineState::Unknown,
    }
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    #[serde(default)]
    metadata: Option<T>,
    #[serde(default)]
    operation: String,
}

#[derive(Debug, Default, Deserialize)]
struct LxdInstance {
    name: String,
    #[serde(default)]
    status: String,
    #[serde(default, rename = "type")]
    instance_type: String,
    #[serde(default)]
    config: BTreeMap<String, String>,
    #[serde(default)]
    state: Option<LxdInstanceState>,
    #[serde(default)]
    created_at: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Debug, Deserialize)]
struct LxdInstanceState {
    #[serde(default)]
    network: Option<BTreeMap<String, LxdNetwork>>,
}

#[derive(Debug, Deserialize)]
struct LxdNetwork {
    #[serde(default)]
    addresses: Vec<LxdAddress>,
}

#[derive(Debug, Deserialize)]
struct LxdAddress {
    address: String,
    #[serde(default)]
    scope: String,
}

impl LxdDriver {
    /// Build a driver from registry configuration.
    ///
    /// Credentials: `url`, and for TLS endpoints `client_cert` +
    /// `client_key` in PEM. `verify_ssl: "false"` disables server
    /// verification for self-signed clusters.
    ///
    /// # Errors
    ///
    /// Returns [`CloudError::Auth`] when `url` is missing or the identity
    /// cannot be loaded.
    pub fn from_config(config: &DriverConfig) -> Result<Self> {
        let url = config.require("url")?;

        let mut builder = reqwest::Client::builder().timeout(REQUEST_TIMEOUT);

        if let (Some(cert), Some(key)) =
            (config.optional("client_cert"), config.optional("client_key"))
        {
            let identity = reqwest::Identity::from_pem(format!("{cert}\n{key}").as_bytes())
                .map_err(|e| CloudError::Auth(format!("invalid LXD client identity: {e}")))?;
            builder = builder.identity(identity);
        }

        if config.optional("verify_ssl").as_deref() == Some("false") {
            builder = builder.danger_accept_invalid_certs(true);
        }

        let client = builder
            .build()
            .map_err(|e| CloudError::cloud(e.to_string()))?;

        Ok(Self {
            client,
            api_base: url.trim_end_matches('/').to_string(),
        })
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        let response = request.send().await?;
        if response.status().is_success() {
            Ok(response)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(CloudError::from_status(status, &body))
        }
    }

    /// Wait for a background operation to finish.
    async fn wait_operation(&self, operation: &str) -> Result<()> {
        if operation.is_empty() {
            return Ok(());
        }
        let url = format!("{}{operation}/wait?timeout=30", self.api_base);
        self.send(self.client.get(url)).await?;
        Ok(())
    }

    fn parse_instance(instance: LxdInstance) -> Machine {
        let state = map_state(&instance.status);

        let mut addresses = Vec::new();
        if let Some(network) = instance.state.as_ref().and_then(|s| s.network.as_ref()) {
            for (interface, net) in network {
                if interface == "lo" {
                    continue;
                }
                for addr in &net.addresses {
                    if addr.scope == "global" {
                        addresses.push(addr.address.clone());
                    }
                }
            }
        }
        let (public_ips, private_ips) = classify_ips(&addresses);

        let image = instance
            .config
            .get("image.description")
            .cloned()
            .unwrap_or_default();

        let mut extra = serde_json::Map::new();
        extra.insert("status".into(), serde_json::json!(instance.status));
        extra.insert("type".into(), serde_json::json!(instance.instance_type));

        // `name` doubles as the external id; LXD instance names are unique
        // per project.
        let mut machine = Machine::new(instance.name.clone(), instance.name, state);
        machine.image = image;
        machine.public_ips = public_ips;
        machine.private_ips = private_ips;
        machine.extra = extra;
        machine.created_at = instance.created_at;
        machine
    }

    async fn change_state(&self, id: &str, action: &str) -> Result<()> {
        let envelope: Envelope<serde_json::Value> = self
            .send(
                self.client
                    .put(format!("{}/1.0/instances/{id}/state", self.api_base))
                    .json(&serde_json::json!({
                        "action": action,
                        "timeout": 30,
                        "force": false,
                    })),
            )
            .await?
            .json()
            .await?;
        self.wait_operation(&envelope.operation).await
    }
}

#[async_trait]
impl CloudDriver for LxdDriver {
    fn name(&self) -> &'static str {
        "lxd"
    }

    async fn authenticate(&self) -> Result<()> {
        // Trusted certificates see "trusted" in the server metadata.
        #[derive(Default, Deserialize)]
        struct ServerInfo {
            #[serde(default)]
            auth: String,
        }

        let envelope: Envelope<ServerInfo> = self
            .send(self.client.get(format!("{}/1.0", self.api_base)))
            .await?
            .json()
            .await?;

        match envelope.metadata {
            Some(info) if info.auth == "trusted" => Ok(()),
            _ => Err(CloudError::Auth(
                "LXD client certificate is not trusted".into(),
            )),
        }
    }

    async fn list_machines(&self, filters: &MachineFilters) -> Result<Vec<Machine>> {
        let envelope: Envelope<Vec<LxdInstance>> = self
            .send(
                self.client
                    .get(format!("{}/1.0/instances", self.api_base))
                    .query(&[("recursion", "2")]),
            )
            .await?
            .json()
            .await?;

        let mut machines: Vec<Machine> = envelope
            .metadata
            .unwrap_or_default()
            .into_iter()
            .map(Self::parse_instance)
            .collect();
        machines.retain(|m| filters.matches(m));
        Ok(machines)
    }

    async fn get_machine(&self, id: &str) -> Result<Machine> {
        let envelope: Envelope<LxdInstance> = self
            .send(
                self.client
                    .get(format!("{}/1.0/instances/{id}", self.api_base))
                    .query(&[("recursion", "1")]),
            )
            .await?
            .json()
            .await?;

        envelope
            .metadata
            .map(Self::parse_instance)
            .ok_or_else(|| CloudError::NotFound(id.to_string()))
    }

    async fn create_machine(&self, spec: &MachineSpec) -> Result<Machine> {
        let mut config = BTreeMap::new();
        if !spec.cloud_init.is_empty() {
            // LXD carries cloud-init in the instance config.
            config.insert("user.user-data".to_string(), spec.cloud_init.clone());
        }
        if let Some(cpu) = spec.extra_str("limits_cpu") {
            config.insert("limits.cpu".to_string(), cpu.to_string());
        }
        if let Some(memory) = spec.extra_str("limits_memory") {
            config.insert("limits.memory".to_string(), memory.to_string());
        }

        let body = serde_json::json!({
            "name": spec.name,
            "source": {
                "type": "image",
                "alias": spec.image,
            },
            "config": config,
            "type": spec.extra_str("instance_type").unwrap_or("container"),
        });

        let envelope: Envelope<serde_json::Value> = self
            .send(
                self.client
                    .post(format!("{}/1.0/instances", self.api_base))
                    .json(&body),
            )
            .await?
            .json()
            .await?;
        self.wait_operation(&envelope.operation).await?;

        self.get_machine(&spec.name).await
    }

    async fn destroy_machine(&self, id: &str) -> Result<()> {
        let envelope: Envelope<serde_json::Value> = self
            .send(
                self.client
                    .delete(format!("{}/1.0/instances/{id}", self.api_base)),
            )
            .await?
            .json()
            .await?;
        self.wait_operation(&envelope.operation).await
    }

    async fn start_machine(&self, id: &str) -> Result<()> {
        self.change_state(id, "start").await
    }

    async fn stop_machine(&self, id: &str) -> Result<()> {
        self.change_state(id, "stop").await
    }

    async fn reboot_machine(&self, id: &str) -> Result<()> {
        self.change_state(id, "restart").await
    }

    async fn list_images(&self, _filters: &MachineFilters) -> Result<Vec<Descriptor>> {
        #[derive(Deserialize)]
        struct LxdImage {
            fingerprint: String,
            #[serde(default)]
            properties: BTreeMap<String, String>,
        }

        let envelope: Envelope<Vec<LxdImage>> = self
            .send(
                self.client
                    .get(format!("{}/1.0/images", self.api_base))
                    .query(&[("recursion", "1")]),
            )
            .await?
            .json()
            .await?;

        Ok(envelope
            .metadata
            .unwrap_or_default()
            .into_iter()
            .map(|image| {
                let name = image
                    .properties
                    .get("description")
                    .cloned()
                    .unwrap_or_else(|| image.fingerprint.clone());
                Descriptor::new(image.fingerprint, name)
            })
            .collect())
    }

    async fn get_console_output(&self, id: &str) -> Result<String> {
        let result = self
            .send(
                self.client
                    .get(format!("{}/1.0/instances/{id}/console", self.api_base)),
            )
            .await;
        match result {
            Ok(response) => Ok(response.text().await.unwrap_or_default()),
            Err(CloudError::NotFound(_)) => Ok(String::new()),
            Err(other) => Err(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn driver(server: &MockServer) -> LxdDriver {
        let config = DriverConfig {
            kind: "lxd".to_string(),
            region: String::new(),
            credentials: [("url".to_string(), serde_json::json!(server.uri()))]
                .into_iter()
                .collect(),
        };
        LxdDriver::from_config(&config).unwrap()
    }

    #[test]
    fn state_map() {
        assert_eq!(map_state("Running"), MachineState::Running);
        assert_eq!(map_state("Stopped"), MachineState::Stopped);
        assert_eq!(map_state("Frozen"), MachineState::Stopped);
        assert_eq!(map_state("Starting"), MachineState::Pending);
        assert_eq!(map_state("Stopping"), MachineState::Pending);
        assert_eq!(map_state("Aborting"), MachineState::Error);
        assert_eq!(map_state("Error"), MachineState::Error);
        assert_eq!(map_state("Weird"), MachineState::Unknown);
    }

    #[tokio::test]
    async fn untrusted_certificate_fails_authenticate() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/1.0"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "metadata": { "auth": "untrusted" }
            })))
            .mount(&server)
            .await;

        let result = driver(&server).authenticate().await;
        assert!(matches!(result, Err(CloudError::Auth(_))));
    }

    #[tokio::test]
    async fn instance_addresses_are_classified() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/1.0/instances/web-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "metadata": {
                    "name": "web-1",
                    "status": "Running",
                    "type": "container",
                    "config": { "image.description": "Ubuntu jammy" },
                    "state": {
                        "network": {
                            "eth0": {
                                "addresses": [
                                    { "address": "10.114.0.9", "scope": "global" },
                                    { "address": "203.0.113.20", "scope": "global" },
                                    { "address": "fe80::1", "scope": "link" }
                                ]
                            },
                            "lo": {
                                "addresses": [
                                    { "address": "127.0.0.1", "scope": "local" }
                                ]
                            }
                        }
                    }
                }
            })))
            .mount(&server)
            .await;

        let machine = driver(&server).get_machine("web-1").await.unwrap();
        assert_eq!(machine.state, MachineState::Running);
        assert_eq!(machine.public_ips, vec!["203.0.113.20"]);
        assert_eq!(machine.private_ips, vec!["10.114.0.9"]);
        assert_eq!(machine.image, "Ubuntu jammy");
    }

    #[tokio::test]
    async fn stop_waits_on_the_operation() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/1.0/instances/web-1/state"))
            .respond_with(ResponseTemplate::new(202).set_body_json(serde_json::json!({
                "operation": "/1.0/operations/op-7"
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/1.0/operations/op-7/wait"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "metadata": { "status": "Success" }
            })))
            .expect(1)
            .mount(&server)
            .await;

        driver(&server).stop_machine("web-1").await.unwrap();
    }
}
