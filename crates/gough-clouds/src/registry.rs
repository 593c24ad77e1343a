//! Driver registry and factory.
//!
//! Maps backend names to driver constructors. Credentials arrive as the
//! secret map the control plane loaded from the secrets store; each factory
//! validates the fields its backend needs and fails fast with a clear error.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{CloudError, Result};
use crate::CloudDriver;

/// Configuration handed to a driver factory.
#[derive(Debug, Clone, Default)]
pub struct DriverConfig {
    /// Backend name (`maas`, `lxd`, `aws`, `gcp`, `azure`, `vultr`).
    pub kind: String,
    /// Default region or zone for the driver instance.
    pub region: String,
    /// Credential fields loaded from the secrets store.
    pub credentials: serde_json::Map<String, serde_json::Value>,
}

impl DriverConfig {
    /// Fetch a required string credential field.
    ///
    /// # Errors
    ///
    /// Returns [`CloudError::Auth`] naming the missing field.
    pub fn require(&self, field: &str) -> Result<String> {
        self.credentials
            .get(field)
            .and_then(serde_json::Value::as_str)
            .map(ToString::to_string)
            .ok_or_else(|| {
                CloudError::Auth(format!(
                    "missing credential field `{field}` for {} driver",
                    self.kind
                ))
            })
    }

    /// Fetch an optional string credential field.
    #[must_use]
    pub fn optional(&self, field: &str) -> Option<String> {
        self.credentials
            .get(field)
            .and_then(serde_json::Value::as_str)
            .map(ToString::to_string)
    }
}

type DriverFactory = Box<dyn Fn(&DriverConfig) -> Result<Arc<dyn CloudDriver>> + Send + Sync>;

/// Registry mapping backend names to driver factories.
pub struct DriverRegistry {
    factories: HashMap<String, DriverFactory>,
}

impl DriverRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// A registry with every built-in driver registered.
    #[must_use]
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("maas", |config| {
            Ok(Arc::new(crate::maas::MaasDriver::from_config(config)?))
        });
        registry.register("lxd", |config| {
            Ok(Arc::new(crate::lxd::LxdDriver::from_config(config)?))
        });
        registry.register("aws", |config| {
            Ok(Arc::new(crate::aws::AwsDriver::from_config(config)?))
        });
        registry.register("gcp", |config| {
            Ok(Arc::new(crate::gcp::GcpDriver::from_config(config)?))
        });
        registry.register("azure", |config| {
            Ok(Arc::new(crate::azure::AzureDriver::from_config(config)?))
        });
        registry.register("vultr", |config| {
            Ok(Arc::new(crate::vultr::VultrDriver::from_config(config)?))
        });
        registry
    }

    /// Register a driver factory under a backend name.
    pub fn register<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(&DriverConfig) -> Result<Arc<dyn CloudDriver>> + Send + Sync + 'static,
    {
        self.factories.insert(name.to_string(), Box::new(factory));
    }

    /// Construct a driver for the given configuration.
    ///
    /// # Errors
    ///
    /// Returns [`CloudError::Cloud`] for unknown backend names, or the
    /// factory's own validation error.
    pub fn create(&self, config: &DriverConfig) -> Result<Arc<dyn CloudDriver>> {
        let factory = self.factories.get(&config.kind).ok_or_else(|| {
            CloudError::cloud(format!("unknown provider type: {}", config.kind))
        })?;
        factory(config)
    }

    /// Names of all registered backends.
    #[must_use]
    pub fn backend_names(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }
}

impl Default for DriverRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(kind: &str, fields: &[(&str, &str)]) -> DriverConfig {
        DriverConfig {
            kind: kind.to_string(),
            region: "test-region".to_string(),
            credentials: fields
                .iter()
                .map(|(k, v)| ((*k).to_string(), serde_json::json!(v)))
                .collect(),
        }
    }

    #[test]
    fn registry_has_all_six_backends() {
        let registry = DriverRegistry::with_defaults();
        let mut names = registry.backend_names();
        names.sort_unstable();
        assert_eq!(names, vec!["aws", "azure", "gcp", "lxd", "maas", "vultr"]);
    }

    #[test]
    fn unknown_backend_is_rejected() {
        let registry = DriverRegistry::with_defaults();
        let result = registry.create(&config("openstack", &[]));
        assert!(result.is_err());
    }

    #[test]
    fn vultr_factory_validates_credentials() {
        let registry = DriverRegistry::with_defaults();
        assert!(registry.create(&config("vultr", &[])).is_err());
        assert!(registry
            .create(&config("vultr", &[("api_key", "k")]))
            .is_ok());
    }

    #[test]
    fn missing_field_error_names_the_field() {
        let config = config("aws", &[]);
        let err = config.require("access_key").unwrap_err();
        assert!(err.to_string().contains("access_key"));
    }
}
