//! Vultr driver (API v2).

use std::collections::BTreeMap;

use async_trait::async_trait;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::Deserialize;

use gough_core::MachineState;

use crate::error::{CloudError, Result};
use crate::registry::DriverConfig;
use crate::types::{Descriptor, Machine, MachineFilters, MachineSpec};
use crate::util::classify_ips;
use crate::{CloudDriver, REQUEST_TIMEOUT};

const DEFAULT_API_BASE: &str = "https://api.vultr.com/v2";
const PAGE_SIZE: u32 = 100;

/// Driver for Vultr cloud compute.
pub struct VultrDriver {
    client: reqwest::Client,
    api_base: String,
    api_key: String,
    region: String,
}

/// Map a Vultr `(status, power_status)` pair into the unified state.
///
/// `active` alone is ambiguous; the power status decides between running
/// and stopped. Suspended and locked instances are unreachable, which for
/// lifecycle purposes is stopped.
#[must_use]
pub fn map_state(status: &str, power_status: &str) -> MachineState {
    match (status, power_status) {
        ("active", "running") => MachineState::Running,
        ("active", _) => MachineState::Stopped,
        ("pending", _) | ("resizing", _) => MachineState::Pending,
        ("suspended", _) | ("locked", _) => MachineState::Stopped,
        _ => MachineState::Unknown,
    }
}

#[derive(Debug, Deserialize)]
struct InstanceEnvelope {
    instance: VultrInstance,
}

#[derive(Debug, Deserialize)]
struct InstanceListEnvelope {
    instances: Vec<VultrInstance>,
    #[serde(default)]
    meta: Option<Meta>,
}

#[derive(Debug, Deserialize)]
struct Meta {
    #[serde(default)]
    links: Option<Links>,
}

#[derive(Debug, Deserialize)]
struct Links {
    #[serde(default)]
    next: String,
}

#[derive(Debug, Deserialize)]
struct VultrInstance {
    id: String,
    #[serde(default)]
    label: String,
    #[serde(default)]
    hostname: String,
    #[serde(default)]
    region: String,
    #[serde(default)]
    plan: String,
    #[serde(default)]
    os: String,
    #[serde(default)]
    main_ip: String,
    #[serde(default)]
    internal_ip: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    power_status: String,
    #[serde(default)]
    date_created: Option<DateTime<Utc>>,
    #[serde(default)]
    tags: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct OsListEnvelope {
    os: Vec<OsEntry>,
}

#[derive(Debug, Deserialize)]
struct OsEntry {
    id: u64,
    name: String,
}

#[derive(Debug, Deserialize)]
struct PlanListEnvelope {
    plans: Vec<PlanEntry>,
}

#[derive(Debug, Deserialize)]
struct PlanEntry {
    id: String,
    #[serde(default)]
    vcpu_count: u32,
    #[serde(default)]
    ram: u32,
}

#[derive(Debug, Deserialize)]
struct RegionListEnvelope {
    regions: Vec<RegionEntry>,
}

#[derive(Debug, Deserialize)]
struct RegionEntry {
    id: String,
    #[serde(default)]
    city: String,
}

impl VultrDriver {
    /// Build a driver from registry configuration.
    ///
    /// # Errors
    ///
    /// Returns [`CloudError::Auth`] when `api_key` is missing.
    pub fn from_config(config: &DriverConfig) -> Result<Self> {
        let api_key = config.require("api_key")?;
        let api_base = config
            .optional("api_base")
            .unwrap_or_else(|| DEFAULT_API_BASE.to_string());
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| CloudError::cloud(e.to_string()))?;
        Ok(Self {
            client,
            api_base: api_base.trim_end_matches('/').to_string(),
            api_key,
            region: config.region.clone(),
        })
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        let response = request.bearer_auth(&self.api_key).send().await?;
        if response.status().is_success() {
            Ok(response)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(CloudError::from_status(status, &body))
        }
    }

    fn parse_instance(&self, instance: VultrInstance) -> Machine {
        let state = map_state(&instance.status, &instance.power_status);
        let hostname = if instance.label.is_empty() {
            instance.hostname.clone()
        } else {
            instance.label.clone()
        };

        let (mut public_ips, mut private_ips) = classify_ips([instance.main_ip.as_str()]);
        let (extra_public, extra_private) = classify_ips([instance.internal_ip.as_str()]);
        public_ips.extend(extra_public);
        private_ips.extend(extra_private);

        let mut tags = BTreeMap::new();
        for tag in &instance.tags {
            match tag.split_once(':') {
                Some((k, v)) => tags.insert(k.to_string(), v.to_string()),
                None => tags.insert(tag.clone(), "true".to_string()),
            };
        }

        let mut extra = serde_json::Map::new();
        extra.insert("status".into(), serde_json::json!(instance.status));
        extra.insert("power_status".into(), serde_json::json!(instance.power_status));

        let mut machine = Machine::new(instance.id, hostname, state);
        machine.region = instance.region;
        machine.size = instance.plan;
        machine.image = instance.os;
        machine.public_ips = public_ips;
        machine.private_ips = private_ips;
        machine.tags = tags;
        machine.extra = extra;
        machine.created_at = instance.date_created;
        machine
    }
}

#[async_trait]
impl CloudDriver for VultrDriver {
    fn name(&self) -> &'static str {
        "vultr"
    }

    async fn authenticate(&self) -> Result<()> {
        self.send(self.client.get(format!("{}/account", self.api_base)))
            .await
            .map_err(|e| match e {
                CloudError::Auth(msg) => CloudError::Auth(msg),
                other => CloudError::Auth(other.to_string()),
            })?;
        Ok(())
    }

    async fn list_machines(&self, filters: &MachineFilters) -> Result<Vec<Machine>> {
        let mut machines = Vec::new();
        let mut cursor = String::new();

        loop {
            let mut request = self
                .client
                .get(format!("{}/instances", self.api_base))
                .query(&[("per_page", PAGE_SIZE.to_string())]);
            if !cursor.is_empty() {
                request = request.query(&[("cursor", cursor.as_str())]);
            }

            let page: InstanceListEnvelope = self.send(request).await?.json().await?;
            machines.extend(page.instances.into_iter().map(|i| self.parse_instance(i)));

            cursor = page
                .meta
                .and_then(|m| m.links)
                .map(|l| l.next)
                .unwrap_or_default();
            if cursor.is_empty() {
                break;
            }
        }

        machines.retain(|m| filters.matches(m));
        Ok(machines)
    }

    async fn get_machine(&self, id: &str) -> Result<Machine> {
        let envelope: InstanceEnvelope = self
            .send(self.client.get(format!("{}/instances/{id}", self.api_base)))
            .await?
            .json()
            .await?;
        Ok(self.parse_instance(envelope.instance))
    }

    async fn create_machine(&self, spec: &MachineSpec) -> Result<Machine> {
        let region = if spec.region.is_empty() {
            self.region.clone()
        } else {
            spec.region.clone()
        };

        let mut body = serde_json::json!({
            "region": region,
            "plan": spec.size,
            "label": spec.name,
            "hostname": spec.name,
        });

        // Numeric images are Vultr OS ids; anything else is a custom image.
        if let Ok(os_id) = spec.image.parse::<u64>() {
            body["os_id"] = serde_json::json!(os_id);
        } else {
            body["image_id"] = serde_json::json!(spec.image);
        }

        if !spec.cloud_init.is_empty() {
            body["user_data"] = serde_json::json!(
                base64::engine::general_purpose::STANDARD.encode(&spec.cloud_init)
            );
        }

        if !spec.tags.is_empty() {
            let tags: Vec<String> = spec.tags.iter().map(|(k, v)| format!("{k}:{v}")).collect();
            body["tags"] = serde_json::json!(tags);
        }

        let envelope: InstanceEnvelope = self
            .send(
                self.client
                    .post(format!("{}/instances", self.api_base))
                    .json(&body),
            )
            .await?
            .json()
            .await?;
        Ok(self.parse_instance(envelope.instance))
    }

    async fn destroy_machine(&self, id: &str) -> Result<()> {
        self.send(
            self.client
                .delete(format!("{}/instances/{id}", self.api_base)),
        )
        .await?;
        Ok(())
    }

    async fn start_machine(&self, id: &str) -> Result<()> {
        self.send(
            self.client
                .post(format!("{}/instances/{id}/start", self.api_base)),
        )
        .await?;
        Ok(())
    }

    async fn stop_machine(&self, id: &str) -> Result<()> {
        self.send(
            self.client
                .post(format!("{}/instances/{id}/halt", self.api_base)),
        )
        .await?;
        Ok(())
    }

    async fn reboot_machine(&self, id: &str) -> Result<()> {
        self.send(
            self.client
                .post(format!("{}/instances/{id}/reboot", self.api_base)),
        )
        .await?;
        Ok(())
    }

    async fn list_images(&self, _filters: &MachineFilters) -> Result<Vec<Descriptor>> {
        let envelope: OsListEnvelope = self
            .send(self.client.get(format!("{}/os", self.api_base)))
            .await?
            .json()
            .await?;
        Ok(envelope
            .os
            .into_iter()
            .map(|os| Descriptor::new(os.id.to_string(), os.name))
            .collect())
    }

    async fn list_sizes(&self) -> Result<Vec<Descriptor>> {
        let envelope: PlanListEnvelope = self
            .send(self.client.get(format!("{}/plans", self.api_base)))
            .await?
            .json()
            .await?;
        Ok(envelope
            .plans
            .into_iter()
            .map(|plan| {
                let mut descriptor = Descriptor::new(
                    plan.id.clone(),
                    format!("{} ({} vCPU, {} MB)", plan.id, plan.vcpu_count, plan.ram),
                );
                descriptor.extra.insert("vcpu_count".into(), serde_json::json!(plan.vcpu_count));
                descriptor.extra.insert("ram_mb".into(), serde_json::json!(plan.ram));
                descriptor
            })
            .collect())
    }

    async fn list_regions(&self) -> Result<Vec<Descriptor>> {
        let envelope: RegionListEnvelope = self
            .send(self.client.get(format!("{}/regions", self.api_base)))
            .await?
            .json()
            .await?;
        Ok(envelope
            .regions
            .into_iter()
            .map(|region| Descriptor::new(region.id, region.city))
            .collect())
    }
}
