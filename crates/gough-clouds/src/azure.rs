//! Azure virtual machines driver (ARM REST).
//!
//! Authenticates with a client-credentials OAuth flow against Entra ID and
//! talks to the Azure Resource Manager compute API. Terminal provisioning
//! states take precedence over power state when mapping into the unified
//! model.

use async_trait::async_trait;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use tokio::sync::RwLock;

use gough_core::MachineState;

use crate::error::{CloudError, Result};
use crate::registry::DriverConfig;
use crate::types::{Descriptor, Machine, MachineFilters, MachineSpec};
use crate::{CloudDriver, REQUEST_TIMEOUT};

const COMPUTE_API_VERSION: &str = "2023-09-01";
const NETWORK_API_VERSION: &str = "2023-09-01";
const DEFAULT_ARM_BASE: &str = "https://management.azure.com";
const DEFAULT_LOGIN_BASE: &str = "https://login.microsoftonline.com";
const TOKEN_SLACK_SECONDS: i64 = 60;

/// Driver for Azure virtual machines.
pub struct AzureDriver {
    client: reqwest::Client,
    arm_base: String,
    login_base: String,
    tenant_id: String,
    client_id: String,
    client_secret: String,
    subscription_id: String,
    resource_group: String,
    location: String,
    token: RwLock<Option<CachedToken>>,
}

struct CachedToken {
    access_token: String,
    expires_at: DateTime<Utc>,
}

/// Map Azure `(provisioning_state, power_state_code)` into the unified
/// state. Terminal and transitional provisioning states win; otherwise the
/// `PowerState/...` instance-view code decides.
#[must_use]
pub fn map_state(provisioning_state: &str, power_state: Option<&str>) -> MachineState {
    match provisioning_state {
        "Failed" | "Canceled" => return MachineState::Error,
        "Creating" | "Updating" | "Deleting" => return MachineState::Pending,
        _ => {}
    }

    match power_state {
        Some("PowerState/running") => MachineState::Running,
        Some("PowerState/starting") => MachineState::Pending,
        Some("PowerState/stopping" | "PowerState/deallocating") => MachineState::Pending,
        Some("PowerState/stopped" | "PowerState/deallocated") => MachineState::Stopped,
        _ => MachineState::Unknown,
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: i64,
}

#[derive(Debug, Deserialize)]
struct VmListResponse {
    #[serde(default)]
    value: Vec<AzureVm>,
    #[serde(default, rename = "nextLink")]
    next_link: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AzureVm {
    name: String,
    #[serde(default)]
    location: String,
    #[serde(default)]
    tags: std::collections::BTreeMap<String, String>,
    #[serde(default)]
    properties: VmProperties,
}

#[derive(Debug, Default, Deserialize)]
struct VmProperties {
    #[serde(default, rename = "provisioningState")]
    provisioning_state: String,
    #[serde(default, rename = "hardwareProfile")]
    hardware_profile: Option<HardwareProfile>,
    #[serde(default, rename = "storageProfile")]
    storage_profile: Option<StorageProfile>,
    #[serde(default, rename = "networkProfile")]
    network_profile: Option<NetworkProfile>,
    #[serde(default, rename = "instanceView")]
    instance_view: Option<InstanceView>,
    #[serde(default, rename = "timeCreated")]
    time_created: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct HardwareProfile {
    #[serde(default, rename = "vmSize")]
    vm_size: String,
}

#[derive(Debug, Deserialize)]
struct StorageProfile {
    #[serde(default, rename = "imageReference")]
    image_reference: Option<ImageReference>,
}

#[derive(Debug, Deserialize)]
struct ImageReference {
    #[serde(default)]
    publisher: String,
    #[serde(default)]
    offer: String,
    #[serde(default)]
    sku: String,
}

#[derive(Debug, Deserialize)]
struct NetworkProfile {
    #[serde(default, rename = "networkInterfaces")]
    network_interfaces: Vec<NicReference>,
}

#[derive(Debug, Deserialize)]
struct NicReference {
    #[serde(default)]
    id: String,
}

#[derive(Debug, Deserialize)]
struct InstanceView {
    #[serde(default)]
    statuses: Vec<InstanceStatus>,
}

#[derive(Debug, Deserialize)]
struct InstanceStatus {
    #[serde(default)]
    code: String,
}

#[derive(Debug, Deserialize)]
struct NicResource {
    #[serde(default)]
    properties: NicProperties,
}

#[derive(Debug, Default, Deserialize)]
struct NicProperties {
    #[serde(default, rename = "ipConfigurations")]
    ip_configurations: Vec<IpConfiguration>,
}

#[derive(Debug, Deserialize)]
struct IpConfiguration {
    #[serde(default)]
    properties: IpConfigurationProperties,
}

#[derive(Debug, Default, Deserialize)]
struct IpConfigurationProperties {
    #[serde(default, rename = "privateIPAddress")]
    private_ip: Option<String>,
    #[serde(default, rename = "publicIPAddress")]
    public_ip: Option<PublicIpReference>,
}

#[derive(Debug, Deserialize)]
struct PublicIpReference {
    #[serde(default)]
    id: String,
}

#[derive(Debug, Deserialize)]
struct PublicIpResource {
    #[serde(default)]
    properties: PublicIpProperties,
}

#[derive(Debug, Default, Deserialize)]
struct PublicIpProperties {
    #[serde(default, rename = "ipAddress")]
    ip_address: Option<String>,
}

impl AzureDriver {
    /// Build a driver from registry configuration.
    ///
    /// Credentials: `tenant_id`, `client_id`, `client_secret`,
    /// `subscription_id`, `resource_group`. The provider region is the
    /// Azure location.
    ///
    /// # Errors
    ///
    /// Returns [`CloudError::Auth`] when required fields are missing.
    pub fn from_config(config: &DriverConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| CloudError::cloud(e.to_string()))?;

        Ok(Self {
            client,
            arm_base: config
                .optional("arm_base")
                .unwrap_or_else(|| DEFAULT_ARM_BASE.to_string()),
            login_base: config
                .optional("login_base")
                .unwrap_or_else(|| DEFAULT_LOGIN_BASE.to_string()),
            tenant_id: config.require("tenant_id")?,
            client_id: config.require("client_id")?,
            client_secret: config.require("client_secret")?,
            subscription_id: config.require("subscription_id")?,
            resource_group: config.require("resource_group")?,
            location: config.region.clone(),
            token: RwLock::new(None),
        })
    }

    fn vm_url(&self, suffix: &str) -> String {
        format!(
            "{}/subscriptions/{}/resourceGroups/{}/providers/Microsoft.Compute/virtualMachines{suffix}",
            self.arm_base, self.subscription_id, self.resource_group
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

        let url = format!(
            "{}/{}/oauth2/v2.0/token",
            self.login_base, self.tenant_id
        );
        let scope = format!("{}/.default", DEFAULT_ARM_BASE);
        let response = self
            .client
            .post(url)
            .form(&[
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("scope", scope.as_str()),
                ("grant_type", "client_credentials"),
            ])
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(CloudError::Auth(format!(
                "token request failed: {status}: {body}"
            )));
        }

        let token: TokenResponse = response.json().await?;
        let access_token = token.access_token.clone();
        *self.token.write().await = Some(CachedToken {
            access_token: token.access_token,
            expires_at: Utc::now() + Duration::seconds(token.expires_in.max(60)),
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

    fn parse_vm(&self, vm: AzureVm) -> Machine {
        let power_state = vm
            .properties
            .instance_view
            .as_ref()
            .and_then(|view| {
                view.statuses
                    .iter()
                    .find(|s| s.code.starts_with("PowerState/"))
            })
            .map(|s| s.code.clone());
        let state = map_state(&vm.properties.provisioning_state, power_state.as_deref());

        let size = vm
            .properties
            .hardware_profile
            .as_ref()
            .map(|h| h.vm_size.clone())
            .unwrap_or_default();
        let image = vm
            .properties
            .storage_profile
            .as_ref()
            .and_then(|s| s.image_reference.as_ref())
            .map(|i| format!("{}:{}:{}", i.publisher, i.offer, i.sku))
            .unwrap_or_default();

        let mut extra = serde_json::Map::new();
        extra.insert(
            "provisioning_state".into(),
            serde_json::json!(vm.properties.provisioning_state),
        );
        if let Some(code) = power_state {
            extra.insert("power_state".into(), serde_json::json!(code));
        }
        if let Some(profile) = &vm.properties.network_profile {
            let nics: Vec<&str> = profile
                .network_interfaces
                .iter()
                .map(|n| n.id.as_str())
                .collect();
            extra.insert("network_interfaces".into(), serde_json::json!(nics));
        }

        let mut machine = Machine::new(vm.name.clone(), vm.name, state);
        machine.region = vm.location;
        machine.size = size;
        machine.image = image;
        machine.tags = vm.tags;
        machine.extra = extra;
        machine.created_at = vm.properties.time_created;
        machine
    }

    /// Resolve the VM's addresses by walking its NIC and public-IP
    /// resources. Address data lives outside the VM object in ARM.
    async fn resolve_ips(&self, machine: &mut Machine) -> Result<()> {
        let nic_ids: Vec<String> = machine
            .extra
            .get("network_interfaces")
            .and_then(serde_json::Value::as_array)
            .map(|ids| {
                ids.iter()
                    .filter_map(|v| v.as_str().map(ToString::to_string))
                    .collect()
            })
            .unwrap_or_default();

        for nic_id in nic_ids {
            let url = format!(
                "{}{nic_id}?api-version={NETWORK_API_VERSION}",
                self.arm_base
            );
            let nic: NicResource = self.send(self.client.get(url)).await?.json().await?;

            for ip_config in nic.properties.ip_configurations {
                if let Some(private) = ip_config.properties.private_ip {
                    machine.private_ips.push(private);
                }
                if let Some(public_ref) = ip_config.properties.public_ip {
                    let url = format!(
                        "{}{}?api-version={NETWORK_API_VERSION}",
                        self.arm_base, public_ref.id
                    );
                    let public: PublicIpResource =
                        self.send(self.client.get(url)).await?.json().await?;
                    if let Some(address) = public.properties.ip_address {
                        machine.public_ips.push(address);
                    }
                }
            }
        }
        Ok(())
    }

    async fn vm_action(&self, id: &str, action: &str) -> Result<()> {
        let url = format!(
            "{}?api-version={COMPUTE_API_VERSION}",
            self.vm_url(&format!("/{id}/{action}"))
        );
        self.send(self.client.post(url)).await?;
        Ok(())
    }
}

#[async_trait]
impl CloudDriver for AzureDriver {
    fn name(&self) -> &'static str {
        "azure"
    }

    async fn authenticate(&self) -> Result<()> {
        self.access_token().await?;
        Ok(())
    }

    async fn list_machines(&self, filters: &MachineFilters) -> Result<Vec<Machine>> {
        let mut machines = Vec::new();
        let mut url = format!(
            "{}?api-version={COMPUTE_API_VERSION}&$expand=instanceView",
            self.vm_url("")
        );

        loop {
            let page: VmListResponse = self.send(self.client.get(&url)).await?.json().await?;
            machines.extend(page.value.into_iter().map(|vm| self.parse_vm(vm)));
            match page.next_link {
                Some(next) => url = next,
                None => break,
            }
        }

        machines.retain(|m| filters.matches(m));
        Ok(machines)
    }

    async fn get_machine(&self, id: &str) -> Result<Machine> {
        let url = format!(
            "{}?api-version={COMPUTE_API_VERSION}&$expand=instanceView",
            self.vm_url(&format!("/{id}"))
        );
        let vm: AzureVm = self.send(self.client.get(url)).await?.json().await?;
        let mut machine = self.parse_vm(vm);
        self.resolve_ips(&mut machine).await?;
        Ok(machine)
    }

    async fn create_machine(&self, spec: &MachineSpec) -> Result<Machine> {
        let nic_id = spec.networks.first().ok_or_else(|| {
            CloudError::cloud("azure create requires a network interface id in `networks`")
        })?;

        // Image reference format: publisher:offer:sku[:version].
        let parts: Vec<&str> = spec.image.split(':').collect();
        let [publisher, offer, sku, rest @ ..] = parts.as_slice() else {
            return Err(CloudError::cloud(
                "azure image must be publisher:offer:sku[:version]",
            ));
        };
        let version = rest.first().copied().unwrap_or("latest");

        let admin_username = spec.extra_str("admin_username").unwrap_or("azureuser");

        let mut os_profile = serde_json::json!({
            "computerName": spec.name,
            "adminUsername": admin_username,
            "linuxConfiguration": {
                "disablePasswordAuthentication": true,
                "ssh": {
                    "publicKeys": spec.ssh_keys.iter().map(|key| serde_json::json!({
                        "path": format!("/home/{admin_username}/.ssh/authorized_keys"),
                        "keyData": key,
                    })).collect::<Vec<_>>(),
                },
            },
        });
        if !spec.cloud_init.is_empty() {
            // Azure carries cloud-init as base64 customData.
            os_profile["customData"] = serde_json::json!(
                base64::engine::general_purpose::STANDARD.encode(&spec.cloud_init)
            );
        }

        let body = serde_json::json!({
            "location": if spec.region.is_empty() { &self.location } else { &spec.region },
            "tags": spec.tags,
            "properties": {
                "hardwareProfile": { "vmSize": spec.size },
                "storageProfile": {
                    "imageReference": {
                        "publisher": publisher,
                        "offer": offer,
                        "sku": sku,
                        "version": version,
                    },
                },
                "osProfile": os_profile,
                "networkProfile": {
                    "networkInterfaces": [{ "id": nic_id }],
                },
            },
        });

        let url = format!(
            "{}?api-version={COMPUTE_API_VERSION}",
            self.vm_url(&format!("/{}", spec.name))
        );
        let vm: AzureVm = self
            .send(self.client.put(url).json(&body))
            .await?
            .json()
            .await?;
        Ok(self.parse_vm(vm))
    }

    async fn destroy_machine(&self, id: &str) -> Result<()> {
        let url = format!(
            "{}?api-version={COMPUTE_API_VERSION}",
            self.vm_url(&format!("/{id}"))
        );
        self.send(self.client.delete(url)).await?;
        Ok(())
    }

    async fn start_machine(&self, id: &str) -> Result<()> {
        self.vm_action(id, "start").await
    }

    async fn stop_machine(&self, id: &str) -> Result<()> {
        self.vm_action(id, "powerOff").await
    }

    async fn reboot_machine(&self, id: &str) -> Result<()> {
        self.vm_action(id, "restart").await
    }

    async fn list_sizes(&self) -> Result<Vec<Descriptor>> {
        #[derive(Deserialize)]
        struct SizeList {
            #[serde(default)]
            value: Vec<VmSize>,
        }

        #[derive(Deserialize)]
        struct VmSize {
            name: String,
            #[serde(default, rename = "numberOfCores")]
            cores: u32,
            #[serde(default, rename = "memoryInMB")]
            memory_mb: u32,
        }

        let url = format!(
            "{}/subscriptions/{}/providers/Microsoft.Compute/locations/{}/vmSizes?api-version={COMPUTE_API_VERSION}",
            self.arm_base, self.subscription_id, self.location
        );
        let sizes: SizeList = self.send(self.client.get(url)).await?.json().await?;
        Ok(sizes
            .value
            .into_iter()
            .map(|s| {
                Descriptor::new(
                    s.name.clone(),
                    format!("{} ({} cores, {} MB)", s.name, s.cores, s.memory_mb),
                )
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn driver(server: &MockServer) -> AzureDriver {
        let config = DriverConfig {
            kind: "azure".to_string(),
            region: "eastus".to_string(),
            credentials: [
                ("tenant_id", "tenant"),
                ("client_id", "client"),
                ("client_secret", "secret"),
                ("subscription_id", "sub-1"),
                ("resource_group", "rg-1"),
            ]
            .into_iter()
            .map(|(k, v)| (k.to_string(), serde_json::json!(v)))
            .chain([
                ("arm_base".to_string(), serde_json::json!(server.uri())),
                ("login_base".to_string(), serde_json::json!(server.uri())),
            ])
            .collect(),
        };
        AzureDriver::from_config(&config).unwrap()
    }

    async fn mount_token(server: &MockServer) {
        Mock::given(method("POST"))
            .and(path("/tenant/oauth2/v2.0/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "arm-token",
                "expires_in": 3600,
            })))
            .mount(server)
            .await;
    }

    #[test]
    fn provisioning_state_takes_precedence() {
        assert_eq!(map_state("Failed", Some("PowerState/running")), MachineState::Error);
        assert_eq!(map_state("Canceled", None), MachineState::Error);
        assert_eq!(
            map_state("Creating", Some("PowerState/running")),
            MachineState::Pending
        );
        assert_eq!(map_state("Deleting", None), MachineState::Pending);
    }

    #[test]
    fn power_state_drives_stable_provisioning() {
        assert_eq!(
            map_state("Succeeded", Some("PowerState/running")),
            MachineState::Running
        );
        assert_eq!(
            map_state("Succeeded", Some("PowerState/deallocated")),
            MachineState::Stopped
        );
        assert_eq!(
            map_state("Succeeded", Some("PowerState/starting")),
            MachineState::Pending
        );
        assert_eq!(map_state("Succeeded", None), MachineState::Unknown);
    }

    #[tokio::test]
    async fn list_parses_instance_view() {
        let server = MockServer::start().await;
        mount_token(&server).await;

        Mock::given(method("GET"))
            .and(path(
                "/subscriptions/sub-1/resourceGroups/rg-1/providers/Microsoft.Compute/virtualMachines",
            ))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "value": [{
                    "name": "vm-a",
                    "location": "eastus",
                    "tags": { "env": "prod" },
                    "properties": {
                        "provisioningState": "Succeeded",
                        "hardwareProfile": { "vmSize": "Standard_B2s" },
                        "storageProfile": {
                            "imageReference": {
                                "publisher": "Canonical",
                                "offer": "ubuntu-server",
                                "sku": "22_04-lts",
                            },
                        },
                        "instanceView": {
                            "statuses": [
                                { "code": "ProvisioningState/succeeded" },
                                { "code": "PowerState/running" },
                            ],
                        },
                    },
                }],
            })))
            .mount(&server)
            .await;

        let machines = driver(&server)
            .list_machines(&MachineFilters::default())
            .await
            .unwrap();
        assert_eq!(machines.len(), 1);
        assert_eq!(machines[0].state, MachineState::Running);
        assert_eq!(machines[0].size, "Standard_B2s");
        assert_eq!(machines[0].image, "Canonical:ubuntu-server:22_04-lts");
    }

    #[tokio::test]
    async fn create_requires_a_nic() {
        let server = MockServer::start().await;
        mount_token(&server).await;

        let spec = MachineSpec {
            name: "vm-a".to_string(),
            image: "Canonical:ubuntu-server:22_04-lts".to_string(),
            size: "Standard_B2s".to_string(),
            ..MachineSpec::default()
        };
        let result = driver(&server).create_machine(&spec).await;
        assert!(result.is_err());
    }
}
