//! Unified types shared by every driver.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use gough_core::MachineState;
use serde::{Deserialize, Serialize};

/// A machine as reported by a provider, normalized to the unified model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Machine {
    /// The provider's identifier for this machine.
    pub external_id: String,
    /// Hostname or display name.
    pub hostname: String,
    /// Unified lifecycle state.
    pub state: MachineState,
    /// Region or zone, when known.
    pub region: String,
    /// Instance size or flavor.
    pub size: String,
    /// OS image.
    pub image: String,
    /// Publicly routable addresses.
    pub public_ips: Vec<String>,
    /// Private addresses.
    pub private_ips: Vec<String>,
    /// Provider tags or labels.
    pub tags: BTreeMap<String, String>,
    /// Provider-specific data that has no unified field.
    pub extra: serde_json::Map<String, serde_json::Value>,
    /// Creation time, when the provider reports one.
    pub created_at: Option<DateTime<Utc>>,
    /// The provider's last-modified time, when reported. Used by the cache
    /// reconciler for last-writer-wins decisions.
    pub updated_at: Option<DateTime<Utc>>,
}

impl Machine {
    /// A minimal machine with the given id, name, and state. The remaining
    /// fields start empty and are filled in by driver parsers.
    #[must_use]
    pub fn new(external_id: impl Into<String>, hostname: impl Into<String>, state: MachineState) -> Self {
        Self {
            external_id: external_id.into(),
            hostname: hostname.into(),
            state,
            region: String::new(),
            size: String::new(),
            image: String::new(),
            public_ips: Vec::new(),
            private_ips: Vec::new(),
            tags: BTreeMap::new(),
            extra: serde_json::Map::new(),
            created_at: None,
            updated_at: None,
        }
    }
}

/// Specification for creating a new machine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MachineSpec {
    /// Machine name or hostname.
    pub name: String,
    /// OS image (e.g. `ubuntu-22.04`, an AMI id, an image alias).
    pub image: String,
    /// Instance size (e.g. `t3.medium`, `n1-standard-2`).
    pub size: String,
    /// Region or zone; optional for providers with a fixed endpoint.
    #[serde(default)]
    pub region: String,
    /// Cloud-init user data. Drivers that do not support cloud-init reject a
    /// non-empty value.
    #[serde(default)]
    pub cloud_init: String,
    /// SSH public keys to authorize where the provider supports it.
    #[serde(default)]
    pub ssh_keys: Vec<String>,
    /// Network or subnet identifiers.
    #[serde(default)]
    pub networks: Vec<String>,
    /// Root disk size in GB; 0 means provider default.
    #[serde(default)]
    pub storage_gb: u32,
    /// Tags or labels.
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    /// Provider-specific options (e.g. `subnet_id`, `associate_public_ip`,
    /// `osystem`, `distro_series`).
    #[serde(default)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl MachineSpec {
    /// Fetch a string-valued provider-specific option.
    #[must_use]
    pub fn extra_str(&self, key: &str) -> Option<&str> {
        self.extra.get(key).and_then(serde_json::Value::as_str)
    }

    /// Fetch a boolean provider-specific option (defaults to false).
    #[must_use]
    pub fn extra_bool(&self, key: &str) -> bool {
        self.extra
            .get(key)
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false)
    }
}

/// Filters applied to machine listings. Drivers apply what their API
/// supports and filter the remainder client-side.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MachineFilters {
    /// Restrict to machines whose name contains this substring.
    #[serde(default)]
    pub name: Option<String>,
    /// Restrict to machines carrying all of these tags.
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

impl MachineFilters {
    /// Whether a machine passes the client-side portion of the filter.
    #[must_use]
    pub fn matches(&self, machine: &Machine) -> bool {
        if let Some(name) = &self.name {
            if !machine.hostname.contains(name.as_str()) {
                return false;
            }
        }
        self.tags
            .iter()
            .all(|(k, v)| machine.tags.get(k).is_some_and(|mv| mv == v))
    }
}

/// A description of an image, size, or region offered by a provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Descriptor {
    /// Provider identifier for the offering.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// Additional provider-specific detail.
    #[serde(default)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Descriptor {
    /// A descriptor with no extra detail.
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            extra: serde_json::Map::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filters_match_name_and_tags() {
        let mut machine = Machine::new("i-1", "web-prod-1", MachineState::Running);
        machine.tags.insert("env".into(), "prod".into());

        let mut filters = MachineFilters {
            name: Some("web".into()),
            ..MachineFilters::default()
        };
        assert!(filters.matches(&machine));

        filters.tags.insert("env".into(), "staging".into());
        assert!(!filters.matches(&machine));
    }

    #[test]
    fn spec_extra_accessors() {
        let mut spec = MachineSpec::default();
        spec.extra
            .insert("subnet_id".into(), serde_json::json!("subnet-1"));
        spec.extra
            .insert("associate_public_ip".into(), serde_json::json!(true));

        assert_eq!(spec.extra_str("subnet_id"), Some("subnet-1"));
        assert!(spec.extra_bool("associate_public_ip"));
        assert!(!spec.extra_bool("missing"));
    }
}
