//! AWS EC2 driver.
//!
//! Uses the official EC2 SDK with static credentials loaded from the
//! secrets store; the instance-profile and environment credential chains are
//! deliberately not consulted.

use async_trait::async_trait;
use aws_sdk_ec2::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_ec2::error::ProvideErrorMetadata;
use aws_sdk_ec2::types::{
    Instance, InstanceNetworkInterfaceSpecification, InstanceType, ResourceType, Tag,
    TagSpecification,
};
use aws_sdk_ec2::Client;
use base64::Engine;

use gough_core::MachineState;

use crate::error::{CloudError, Result};
use crate::registry::DriverConfig;
use crate::types::{Descriptor, Machine, MachineFilters, MachineSpec};
use crate::CloudDriver;

/// Driver for AWS EC2.
pub struct AwsDriver {
    client: Client,
    region: String,
}

/// Map an EC2 instance state name into the unified state.
///
/// `stopping` maps to pending (a transition in progress), and both
/// `shutting-down` and `terminated` collapse into terminated.
#[must_use]
pub fn map_state(state_name: &str) -> MachineState {
    match state_name {
        "pending" => MachineState::Pending,
        "running" => MachineState::Running,
        "stopping" => MachineState::Pending,
        "stopped" => MachineState::Stopped,
        "shutting-down" | "terminated" => MachineState::Terminated,
        _ => MachineState::Unknown,
    }
}

/// How the networking section of a `RunInstances` request is composed.
///
/// When a public address is requested on an explicit subnet, EC2 requires a
/// `NetworkInterfaces` block carrying the subnet and security groups; the
/// top-level `SubnetId`/`SecurityGroupIds` parameters must then be absent or
/// the request is rejected as conflicting.
#[derive(Debug, Default, PartialEq)]
pub struct NetworkPlan {
    /// The composed interface specification, when one is required.
    pub interface: Option<InterfacePlan>,
    /// Top-level subnet id, when no interface block is used.
    pub subnet_id: Option<String>,
    /// Top-level security group ids, when no interface block is used.
    pub security_group_ids: Vec<String>,
}

/// Fields of a composed `NetworkInterfaces` entry.
#[derive(Debug, PartialEq)]
pub struct InterfacePlan {
    /// Subnet for the interface.
    pub subnet_id: String,
    /// Security groups for the interface.
    pub security_group_ids: Vec<String>,
}

/// Compose the networking parameters for a machine spec.
#[must_use]
pub fn network_plan(spec: &MachineSpec) -> NetworkPlan {
    let subnet_id = spec
        .extra_str("subnet_id")
        .map(ToString::to_string)
        .or_else(|| spec.networks.first().cloned());
    let security_group_ids: Vec<String> = spec
        .extra
        .get("security_group_ids")
        .and_then(serde_json::Value::as_array)
        .map(|ids| {
            ids.iter()
                .filter_map(|v| v.as_str().map(ToString::to_string))
                .collect()
        })
        .unwrap_or_default();

    if spec.extra_bool("associate_public_ip") {
        if let Some(subnet_id) = subnet_id {
            return NetworkPlan {
                interface: Some(InterfacePlan {
                    subnet_id,
                    security_group_ids,
                }),
                subnet_id: None,
                security_group_ids: Vec::new(),
            };
        }
    }

    NetworkPlan {
        interface: None,
        subnet_id,
        security_group_ids,
    }
}

fn map_sdk_error<E>(err: &aws_sdk_ec2::error::SdkError<E>) -> CloudError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
{
    if matches!(err, aws_sdk_ec2::error::SdkError::TimeoutError(_)) {
        return CloudError::timeout(err.to_string());
    }

    let code = err.code().unwrap_or_default().to_string();
    let message = err.message().unwrap_or("ec2 request failed").to_string();

    match code.as_str() {
        "AuthFailure" | "UnauthorizedOperation" | "InvalidClientTokenId"
        | "SignatureDoesNotMatch" => CloudError::Auth(message),
        c if c.ends_with(".NotFound") => CloudError::NotFound(message),
        "InstanceLimitExceeded" | "InsufficientInstanceCapacity" | "RequestLimitExceeded"
        | "VcpuLimitExceeded" => CloudError::Quota(message),
        c if c.contains("LimitExceeded") => CloudError::Quota(message),
        _ => CloudError::Cloud {
            message,
            code: if code.is_empty() { None } else { Some(code) },
            timeout: false,
        },
    }
}

impl AwsDriver {
    /// Build a driver from registry configuration.
    ///
    /// Credentials: `access_key`, `secret_key`, optional `session_token`.
    ///
    /// # Errors
    ///
    /// Returns [`CloudError::Auth`] when required fields are missing.
    pub fn from_config(config: &DriverConfig) -> Result<Self> {
        let access_key = config.require("access_key")?;
        let secret_key = config.require("secret_key")?;
        let credentials = Credentials::new(
            access_key,
            secret_key,
            config.optional("session_token"),
            None,
            "gough-secrets-store",
        );

        let mut builder = aws_sdk_ec2::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()))
            .credentials_provider(credentials);
        if let Some(endpoint) = config.optional("endpoint_url") {
            builder = builder.endpoint_url(endpoint);
        }

        Ok(Self {
            client: Client::from_conf(builder.build()),
            region: config.region.clone(),
        })
    }

    fn parse_instance(&self, instance: &Instance) -> Machine {
        let external_id = instance.instance_id().unwrap_or_default().to_string();
        let state = instance
            .state()
            .and_then(|s| s.name())
            .map_or(MachineState::Unknown, |name| map_state(name.as_str()));

        let mut tags = std::collections::BTreeMap::new();
        for tag in instance.tags() {
            if let (Some(key), Some(value)) = (tag.key(), tag.value()) {
                tags.insert(key.to_string(), value.to_string());
            }
        }
        let hostname = tags
            .get("Name")
            .cloned()
            .unwrap_or_else(|| external_id.clone());

        let mut extra = serde_json::Map::new();
        if let Some(zone) = instance.placement().and_then(|p| p.availability_zone()) {
            extra.insert("availability_zone".into(), serde_json::json!(zone));
        }
        if let Some(subnet) = instance.subnet_id() {
            extra.insert("subnet_id".into(), serde_json::json!(subnet));
        }

        let mut machine = Machine::new(external_id, hostname, state);
        machine.region = self.region.clone();
        machine.size = instance
            .instance_type()
            .map(|t| t.as_str().to_string())
            .unwrap_or_default();
        machine.image = instance.image_id().unwrap_or_default().to_string();
        machine.public_ips = instance
            .public_ip_address()
            .map(|ip| vec![ip.to_string()])
            .unwrap_or_default();
        machine.private_ips = instance
            .private_ip_address()
            .map(|ip| vec![ip.to_string()])
            .unwrap_or_default();
        machine.tags = tags;
        machine.extra = extra;
        machine.created_at = instance
            .launch_time()
            .and_then(|t| chrono::DateTime::from_timestamp(t.secs(), t.subsec_nanos()));
        machine
    }
}

#[async_trait]
impl CloudDriver for AwsDriver {
    fn name(&self) -> &'static str {
        "aws"
    }

    async fn authenticate(&self) -> Result<()> {
        self.client
            .describe_regions()
            .send()
            .await
            .map_err(|e| CloudError::Auth(map_sdk_error(&e).to_string()))?;
        Ok(())
    }

    async fn list_machines(&self, filters: &MachineFilters) -> Result<Vec<Machine>> {
        let mut machines = Vec::new();
        let mut next_token: Option<String> = None;

        loop {
            let response = self
                .client
                .describe_instances()
                .set_next_token(next_token.take())
                .send()
                .await
                .map_err(|e| map_sdk_error(&e))?;

            for reservation in response.reservations() {
                for instance in reservation.instances() {
                    machines.push(self.parse_instance(instance));
                }
            }

            next_token = response.next_token().map(ToString::to_string);
            if next_token.is_none() {
                break;
            }
        }

        machines.retain(|m| filters.matches(m));
        Ok(machines)
    }

    async fn get_machine(&self, id: &str) -> Result<Machine> {
        let response = self
            .client
            .describe_instances()
            .instance_ids(id)
            .send()
            .await
            .map_err(|e| map_sdk_error(&e))?;

        response
            .reservations()
            .iter()
            .flat_map(aws_sdk_ec2::types::Reservation::instances)
            .next()
            .map(|instance| self.parse_instance(instance))
            .ok_or_else(|| CloudError::NotFound(id.to_string()))
    }

    async fn create_machine(&self, spec: &MachineSpec) -> Result<Machine> {
        let mut tags = vec![Tag::builder().key("Name").value(&spec.name).build()];
        for (key, value) in &spec.tags {
            tags.push(Tag::builder().key(key).value(value).build());
        }
        let tag_spec = TagSpecification::builder()
            .resource_type(ResourceType::Instance)
            .set_tags(Some(tags))
            .build();

        let mut request = self
            .client
            .run_instances()
            .image_id(&spec.image)
            .instance_type(InstanceType::from(spec.size.as_str()))
            .min_count(1)
            .max_count(1)
            .tag_specifications(tag_spec);

        if !spec.cloud_init.is_empty() {
            // EC2 requires base64-encoded user data.
            request = request.user_data(
                base64::engine::general_purpose::STANDARD.encode(&spec.cloud_init),
            );
        }
        if let Some(key_name) = spec.extra_str("key_name") {
            request = request.key_name(key_name);
        }

        let plan = network_plan(spec);
        if let Some(interface) = plan.interface {
            let nic = InstanceNetworkInterfaceSpecification::builder()
                .device_index(0)
                .subnet_id(interface.subnet_id)
                .associate_public_ip_address(true)
                .set_groups(if interface.security_group_ids.is_empty() {
                    None
                } else {
                    Some(interface.security_group_ids)
                })
                .build();
            request = request.network_interfaces(nic);
        } else {
            if let Some(subnet_id) = plan.subnet_id {
                request = request.subnet_id(subnet_id);
            }
            if !plan.security_group_ids.is_empty() {
                request = request.set_security_group_ids(Some(plan.security_group_ids));
            }
        }

        let response = request.send().await.map_err(|e| map_sdk_error(&e))?;
        response
            .instances()
            .first()
            .map(|instance| self.parse_instance(instance))
            .ok_or_else(|| CloudError::cloud("run_instances returned no instance"))
    }

    async fn destroy_machine(&self, id: &str) -> Result<()> {
        self.client
            .terminate_instances()
            .instance_ids(id)
            .send()
            .await
            .map_err(|e| map_sdk_error(&e))?;
        Ok(())
    }

    async fn start_machine(&self, id: &str) -> Result<()> {
        self.client
            .start_instances()
            .instance_ids(id)
            .send()
            .await
            .map_err(|e| map_sdk_error(&e))?;
        Ok(())
    }

    async fn stop_machine(&self, id: &str) -> Result<()> {
        self.client
            .stop_instances()
            .instance_ids(id)
            .send()
            .await
            .map_err(|e| map_sdk_error(&e))?;
        Ok(())
    }

    async fn reboot_machine(&self, id: &str) -> Result<()> {
        self.client
            .reboot_instances()
            .instance_ids(id)
            .send()
            .await
            .map_err(|e| map_sdk_error(&e))?;
        Ok(())
    }

    async fn list_images(&self, _filters: &MachineFilters) -> Result<Vec<Descriptor>> {
        let response = self
            .client
            .describe_images()
            .owners("self")
            .send()
            .await
            .map_err(|e| map_sdk_error(&e))?;

        Ok(response
            .images()
            .iter()
            .filter_map(|image| {
                let id = image.image_id()?;
                Some(Descriptor::new(id, image.name().unwrap_or(id)))
            })
            .collect())
    }

    async fn list_sizes(&self) -> Result<Vec<Descriptor>> {
        let mut sizes = Vec::new();
        let mut next_token: Option<String> = None;

        loop {
            let response = self
                .client
                .describe_instance_types()
                .set_next_token(next_token.take())
                .send()
                .await
                .map_err(|e| map_sdk_error(&e))?;

            for instance_type in response.instance_types() {
                if let Some(name) = instance_type.instance_type() {
                    sizes.push(Descriptor::new(name.as_str(), name.as_str()));
                }
            }

            next_token = response.next_token().map(ToString::to_string);
            if next_token.is_none() {
                break;
            }
        }
        Ok(sizes)
    }

    async fn list_regions(&self) -> Result<Vec<Descriptor>> {
        let response = self
            .client
            .describe_regions()
            .send()
            .await
            .map_err(|e| map_sdk_error(&e))?;

        Ok(response
            .regions()
            .iter()
            .filter_map(|region| {
                let name = region.region_name()?;
                Some(Descriptor::new(name, region.endpoint().unwrap_or(name)))
            })
            .collect())
    }

    async fn get_console_output(&self, id: &str) -> Result<String> {
        let response = self
            .client
            .get_console_output()
            .instance_id(id)
            .send()
            .await
            .map_err(|e| map_sdk_error(&e))?;

        let Some(encoded) = response.output() else {
            return Ok(String::new());
        };
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| CloudError::cloud(format!("console output decode failed: {e}")))?;
        Ok(String::from_utf8_lossy(&decoded).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_map() {
        assert_eq!(map_state("pending"), MachineState::Pending);
        assert_eq!(map_state("running"), MachineState::Running);
        assert_eq!(map_state("stopping"), MachineState::Pending);
        assert_eq!(map_state("stopped"), MachineState::Stopped);
        assert_eq!(map_state("shutting-down"), MachineState::Terminated);
        assert_eq!(map_state("terminated"), MachineState::Terminated);
        assert_eq!(map_state("weird"), MachineState::Unknown);
    }

    #[test]
    fn public_ip_with_subnet_composes_an_interface() {
        let mut spec = MachineSpec::default();
        spec.extra
            .insert("subnet_id".into(), serde_json::json!("subnet-1"));
        spec.extra
            .insert("associate_public_ip".into(), serde_json::json!(true));
        spec.extra.insert(
            "security_group_ids".into(),
            serde_json::json!(["sg-1", "sg-2"]),
        );

        let plan = network_plan(&spec);
        let interface = plan.interface.expect("interface block expected");
        assert_eq!(interface.subnet_id, "subnet-1");
        assert_eq!(interface.security_group_ids, vec!["sg-1", "sg-2"]);
        // The same request must not also carry top-level parameters.
        assert!(plan.subnet_id.is_none());
        assert!(plan.security_group_ids.is_empty());
    }

    #[test]
    fn subnet_without_public_ip_stays_top_level() {
        let mut spec = MachineSpec::default();
        spec.extra
            .insert("subnet_id".into(), serde_json::json!("subnet-1"));
        spec.extra
            .insert("security_group_ids".into(), serde_json::json!(["sg-1"]));

        let plan = network_plan(&spec);
        assert!(plan.interface.is_none());
        assert_eq!(plan.subnet_id.as_deref(), Some("subnet-1"));
        assert_eq!(plan.security_group_ids, vec!["sg-1"]);
    }

    #[test]
    fn public_ip_without_subnet_needs_no_interface() {
        let mut spec = MachineSpec::default();
        spec.extra
            .insert("associate_public_ip".into(), serde_json::json!(true));

        let plan = network_plan(&spec);
        assert!(plan.interface.is_none());
        assert!(plan.subnet_id.is_none());
    }
}
