//! Canonical MaaS driver (bare metal).
//!
//! MaaS is the one backend where machines pre-exist: creation is a
//! two-phase allocate-then-deploy against the pool, and destruction releases
//! the machine back rather than deleting it. A deploy failure must release
//! the allocation or the machine leaks from the pool.

use std::collections::BTreeMap;

use async_trait::async_trait;
use base64::Engine;
use rand::Rng;
use serde::Deserialize;

use gough_core::MachineState;

use crate::error::{CloudError, Result};
use crate::registry::DriverConfig;
use crate::types::{Descriptor, Machine, MachineFilters, MachineSpec};
use crate::util::classify_ips;
use crate::{CloudDriver, REQUEST_TIMEOUT};

/// Driver for canonical MaaS.
pub struct MaasDriver {
    client: reqwest::Client,
    api_base: String,
    consumer_key: String,
    token_key: String,
    token_secret: String,
}

/// Map a MaaS `(status_name, power_state)` pair into the unified state.
///
/// Deployed machines report their power state separately; a powered-off
/// deployed machine is stopped, not running.
#[must_use]
pub fn map_state(status_name: &str, power_state: &str) -> MachineState {
    match status_name {
        "New" => MachineState::Pending,
        "Commissioning" | "Testing" => MachineState::Commissioning,
        "Ready" => MachineState::Ready,
        "Allocated" | "Reserved" => MachineState::Allocated,
        "Deploying" => MachineState::Deploying,
        "Deployed" => {
            if power_state == "off" {
                MachineState::Stopped
            } else {
                MachineState::Running
            }
        }
        "Releasing" | "Disk erasing" => MachineState::Pending,
        "Broken" => MachineState::Error,
        s if s.starts_with("Failed") => MachineState::Error,
        _ => MachineState::Unknown,
    }
}

#[derive(Debug, Deserialize)]
struct MaasMachine {
    system_id: String,
    #[serde(default)]
    hostname: String,
    #[serde(default)]
    status_name: String,
    #[serde(default)]
    power_state: String,
    #[serde(default)]
    ip_addresses: Vec<String>,
    #[serde(default)]
    osystem: String,
    #[serde(default)]
    distro_series: String,
    #[serde(default)]
    cpu_count: u32,
    #[serde(default)]
    memory: u64,
    #[serde(default)]
    tag_names: Vec<String>,
}

impl MaasDriver {
    /// Build a driver from registry configuration.
    ///
    /// Credentials: `url` and `api_key` in the MaaS
    /// `consumer:token:secret` format.
    ///
    /// # Errors
    ///
    /// Returns [`CloudError::Auth`] when fields are missing or the key is
    /// malformed.
    pub fn from_config(config: &DriverConfig) -> Result<Self> {
        let url = config.require("url")?;
        let api_key = config.require("api_key")?;

        let parts: Vec<&str> = api_key.split(':').collect();
        let [consumer_key, token_key, token_secret] = parts.as_slice() else {
            return Err(CloudError::Auth(
                "MaaS api_key must be consumer:token:secret".into(),
            ));
        };

        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| CloudError::cloud(e.to_string()))?;

        Ok(Self {
            client,
            api_base: format!("{}/api/2.0", url.trim_end_matches('/')),
            consumer_key: (*consumer_key).to_string(),
            token_key: (*token_key).to_string(),
            token_secret: (*token_secret).to_string(),
        })
    }

    /// Construct the OAuth 1.0 PLAINTEXT authorization header MaaS expects.
    /// The consumer secret is always empty, so the signature is
    /// `&<token_secret>`.
    fn oauth_header(&self) -> String {
        let nonce: u64 = rand::thread_rng().gen();
        let timestamp = chrono::Utc::now().timestamp();
        format!(
            "OAuth oauth_version=\"1.0\", oauth_signature_method=\"PLAINTEXT\", \
             oauth_consumer_key=\"{}\", oauth_token=\"{}\", oauth_signature=\"&{}\", \
             oauth_nonce=\"{nonce}\", oauth_timestamp=\"{timestamp}\"",
            self.consumer_key, self.token_key, self.token_secret
        )
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        let response = request
            .header("Authorization", self.oauth_header())
            .send()
            .await?;
        if response.status().is_success() {
            Ok(response)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(CloudError::from_status(status, &body))
        }
    }

    fn parse_machine(machine: MaasMachine) -> Machine {
        let state = map_state(&machine.status_name, &machine.power_state);
        let (public_ips, private_ips) = classify_ips(&machine.ip_addresses);

        let mut tags = BTreeMap::new();
        for tag in &machine.tag_names {
            tags.insert(tag.clone(), "true".to_string());
        }

        let mut extra = serde_json::Map::new();
        extra.insert("status_name".into(), serde_json::json!(machine.status_name));
        extra.insert("power_state".into(), serde_json::json!(machine.power_state));
        extra.insert("cpu_count".into(), serde_json::json!(machine.cpu_count));
        extra.insert("memory_mb".into(), serde_json::json!(machine.memory));

        let mut result = Machine::new(machine.system_id, machine.hostname, state);
        result.image = if machine.osystem.is_empty() {
            String::new()
        } else {
            format!("{}/{}", machine.osystem, machine.distro_series)
        };
        result.size = format!("{}c-{}MB", machine.cpu_count, machine.memory);
        result.public_ips = public_ips;
        result.private_ips = private_ips;
        result.tags = tags;
        result.extra = extra;
        result
    }

    /// Release an allocation after a failed deploy. Release errors are
    /// logged and swallowed; the deploy error is what the caller sees.
    async fn release_after_failure(&self, system_id: &str) {
        let url = format!("{}/machines/{system_id}/", self.api_base);
        let result = self
            .send(self.client.post(&url).query(&[("op", "release")]))
            .await;
        if let Err(e) = result {
            tracing::warn!(
                system_id,
                error = %e,
                "failed to release machine after deploy failure"
            );
        } else {
            tracing::info!(system_id, "released machine after deploy failure");
        }
    }
}

#[async_trait]
impl CloudDriver for MaasDriver {
    fn name(&self) -> &'static str {
        "maas"
    }

    async fn authenticate(&self) -> Result<()> {
        self.send(self.client.get(format!("{}/users/?op=whoami", self.api_base)))
            .await
            .map_err(|e| match e {
                CloudError::Auth(msg) => CloudError::Auth(msg),
                other => CloudError::Auth(other.to_string()),
            })?;
        Ok(())
    }

    async fn list_machines(&self, filters: &MachineFilters) -> Result<Vec<Machine>> {
        let machines: Vec<MaasMachine> = self
            .send(self.client.get(format!("{}/machines/", self.api_base)))
            .await?
            .json()
            .await?;

        let mut machines: Vec<Machine> = machines.into_iter().map(Self::parse_machine).collect();
        machines.retain(|m| filters.matches(m));
        Ok(machines)
    }

    async fn get_machine(&self, id: &str) -> Result<Machine> {
        let machine: MaasMachine = self
            .send(self.client.get(format!("{}/machines/{id}/", self.api_base)))
            .await?
            .json()
            .await?;
        Ok(Self::parse_machine(machine))
    }

    async fn create_machine(&self, spec: &MachineSpec) -> Result<Machine> {
        // Phase one: allocate from the pool. A no-match answer is a capacity
        // problem, not an internal one.
        let mut allocate_params: Vec<(String, String)> = Vec::new();
        if !spec.name.is_empty() {
            allocate_params.push(("name".into(), spec.name.clone()));
        }
        for tag in spec.tags.keys() {
            allocate_params.push(("tags".into(), tag.clone()));
        }

        let allocated: MaasMachine = match self
            .send(
                self.client
                    .post(format!("{}/machines/", self.api_base))
                    .query(&[("op", "allocate")])
                    .form(&allocate_params),
            )
            .await
        {
            Ok(response) => response.json().await?,
            Err(CloudError::Cloud { message, code, .. })
                if code.as_deref() == Some("409") || message.contains("No machine matching") =>
            {
                return Err(CloudError::Quota(format!(
                    "no machine matching constraints: {message}"
                )));
            }
            Err(other) => return Err(other),
        };

        let system_id = allocated.system_id.clone();

        // Phase two: deploy. `osystem/distro_series` come from the image
        // (`ubuntu/jammy`) or explicit extras.
        let (osystem, distro_series) = match spec.image.split_once('/') {
            Some((os, series)) => (os.to_string(), series.to_string()),
            None => (
                spec.extra_str("osystem").unwrap_or("ubuntu").to_string(),
                spec.extra_str("distro_series").unwrap_or("jammy").to_string(),
            ),
        };

        let mut deploy_params = vec![
            ("osystem".to_string(), osystem),
            ("distro_series".to_string(), distro_series),
        ];
        if !spec.cloud_init.is_empty() {
            deploy_params.push((
                "user_data".to_string(),
                base64::engine::general_purpose::STANDARD.encode(&spec.cloud_init),
            ));
        }

        let deploy_result = self
            .send(
                self.client
                    .post(format!("{}/machines/{system_id}/", self.api_base))
                    .query(&[("op", "deploy")])
                    .form(&deploy_params),
            )
            .await;

        match deploy_result {
            Ok(response) => {
                let machine: MaasMachine = response.json().await?;
                Ok(Self::parse_machine(machine))
            }
            Err(deploy_error) => {
                self.release_after_failure(&system_id).await;
                Err(deploy_error)
            }
        }
    }

    async fn destroy_machine(&self, id: &str) -> Result<()> {
        // Releasing returns the machine to the pool; MaaS machines are
        // hardware and never deleted through this path.
        self.send(
            self.client
                .post(format!("{}/machines/{id}/", self.api_base))
                .query(&[("op", "release")]),
        )
        .await?;
        Ok(())
    }

    async fn start_machine(&self, id: &str) -> Result<()> {
        self.send(
            self.client
                .post(format!("{}/machines/{id}/", self.api_base))
                .query(&[("op", "power_on")]),
        )
        .await?;
        Ok(())
    }

    async fn stop_machine(&self, id: &str) -> Result<()> {
        self.send(
            self.client
                .post(format!("{}/machines/{id}/", self.api_base))
                .query(&[("op", "power_off")]),
        )
        .await?;
        Ok(())
    }

    async fn list_images(&self, _filters: &MachineFilters) -> Result<Vec<Descriptor>> {
        #[derive(Deserialize)]
        struct BootResource {
            id: u64,
            name: String,
        }

        let resources: Vec<BootResource> = self
            .send(self.client.get(format!("{}/boot-resources/", self.api_base)))
            .await?
            .json()
            .await?;
        Ok(resources
            .into_iter()
            .map(|r| Descriptor::new(r.id.to_string(), r.name))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn driver(server: &MockServer) -> MaasDriver {
        let config = DriverConfig {
            kind: "maas".to_string(),
            region: String::new(),
            credentials: [
                ("url".to_string(), serde_json::json!(server.uri())),
                (
                    "api_key".to_string(),
                    serde_json::json!("consumer:token:secret"),
                ),
            ]
            .into_iter()
            .collect(),
        };
        MaasDriver::from_config(&config).unwrap()
    }

    fn machine_json(system_id: &str, status_name: &str) -> serde_json::Value {
        serde_json::json!({
            "system_id": system_id,
            "hostname": format!("node-{system_id}"),
            "status_name": status_name,
            "power_state": "on",
            "ip_addresses": ["10.0.1.5"],
            "osystem": "ubuntu",
            "distro_series": "jammy",
            "cpu_count": 8,
            "memory": 16384,
            "tag_names": ["rack-1"],
        })
    }

    #[test]
    fn state_map() {
        assert_eq!(map_state("New", ""), MachineState::Pending);
        assert_eq!(map_state("Commissioning", ""), MachineState::Commissioning);
        assert_eq!(map_state("Ready", ""), MachineState::Ready);
        assert_eq!(map_state("Allocated", ""), MachineState::Allocated);
        assert_eq!(map_state("Reserved", ""), MachineState::Allocated);
        assert_eq!(map_state("Deploying", ""), MachineState::Deploying);
        assert_eq!(map_state("Deployed", "on"), MachineState::Running);
        assert_eq!(map_state("Deployed", "off"), MachineState::Stopped);
        assert_eq!(map_state("Failed deployment", ""), MachineState::Error);
        assert_eq!(map_state("Broken", ""), MachineState::Error);
    }

    #[test]
    fn malformed_api_key_is_rejected() {
        let config = DriverConfig {
            kind: "maas".to_string(),
            region: String::new(),
            credentials: [
                ("url".to_string(), serde_json::json!("http://maas")),
                ("api_key".to_string(), serde_json::json!("only-one-part")),
            ]
            .into_iter()
            .collect(),
        };
        assert!(MaasDriver::from_config(&config).is_err());
    }

    #[test]
    fn oauth_header_shape() {
        let config = DriverConfig {
            kind: "maas".to_string(),
            region: String::new(),
            credentials: [
                ("url".to_string(), serde_json::json!("http://maas")),
                ("api_key".to_string(), serde_json::json!("ck:tk:ts")),
            ]
            .into_iter()
            .collect(),
        };
        let driver = MaasDriver::from_config(&config).unwrap();
        let header = driver.oauth_header();
        assert!(header.starts_with("OAuth oauth_version=\"1.0\""));
        assert!(header.contains("oauth_signature_method=\"PLAINTEXT\""));
        assert!(header.contains("oauth_consumer_key=\"ck\""));
        assert!(header.contains("oauth_token=\"tk\""));
        assert!(header.contains("oauth_signature=\"&ts\""));
    }

    #[tokio::test]
    async fn allocate_no_match_is_quota_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/2.0/machines/"))
            .and(query_param("op", "allocate"))
            .respond_with(
                ResponseTemplate::new(409)
                    .set_body_string("No machine matching the given constraints could be found"),
            )
            .mount(&server)
            .await;

        let spec = MachineSpec {
            name: "node".to_string(),
            image: "ubuntu/jammy".to_string(),
            ..MachineSpec::default()
        };

        let result = driver(&server).create_machine(&spec).await;
        assert!(matches!(result, Err(CloudError::Quota(_))));
    }

    #[tokio::test]
    async fn deploy_failure_releases_the_allocation() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/api/2.0/machines/"))
            .and(query_param("op", "allocate"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(machine_json("abc123", "Allocated")),
            )
            .mount(&server)
            .await;

        Mock::given(method("POST"))
            .and(path("/api/2.0/machines/abc123/"))
            .and(query_param("op", "deploy"))
            .respond_with(ResponseTemplate::new(500).set_body_string("deploy exploded"))
            .mount(&server)
            .await;

        Mock::given(method("POST"))
            .and(path("/api/2.0/machines/abc123/"))
            .and(query_param("op", "release"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(machine_json("abc123", "Ready")),
            )
            .expect(1)
            .mount(&server)
            .await;

        let spec = MachineSpec {
            name: "node".to_string(),
            image: "ubuntu/jammy".to_string(),
            cloud_init: "#cloud-config".to_string(),
            ..MachineSpec::default()
        };

        let result = driver(&server).create_machine(&spec).await;
        assert!(matches!(result, Err(CloudError::Cloud { .. })));
    }

    #[tokio::test]
    async fn deployed_machine_parses() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/2.0/machines/abc123/"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(machine_json("abc123", "Deployed")),
            )
            .mount(&server)
            .await;

        let machine = driver(&server).get_machine("abc123").await.unwrap();
        assert_eq!(machine.state, MachineState::Running);
        assert_eq!(machine.image, "ubuntu/jammy");
        assert_eq!(machine.private_ips, vec!["10.0.1.5"]);
        assert!(machine.tags.contains_key("rack-1"));
    }
}
