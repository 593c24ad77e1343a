//! Machine orchestration: per-request provider dispatch and the cache.
//!
//! The orchestrator resolves a provider row, loads its credentials from the
//! secrets store, obtains a pooled driver, invokes the operation, and
//! writes the normalized machine through to the cache. A single auth error
//! triggers one re-authentication and retry before surfacing.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;

use gough_clouds::{
    CloudDriver, DriverConfig, DriverRegistry, Machine, MachineFilters, MachineSpec,
};
use gough_core::{MachineState, ProviderId};
use gough_secrets::SecretsBackend;
use gough_store::{CloudProvider, MachineRecord, Store};

use crate::error::{ControlError, Result};
use crate::ControlConfig;

/// The machine orchestrator.
pub struct MachineOrchestrator<S: Store> {
    store: Arc<S>,
    secrets: Arc<dyn SecretsBackend>,
    registry: DriverRegistry,
    pool: RwLock<HashMap<ProviderId, Arc<dyn CloudDriver>>>,
    // Serializes create_machine per (provider, name) to avoid duplicate-name
    // races at providers that key on names.
    create_locks: tokio::sync::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    config: ControlConfig,
}

impl<S: Store> MachineOrchestrator<S> {
    /// Create the orchestrator.
    #[must_use]
    pub fn new(
        store: Arc<S>,
        secrets: Arc<dyn SecretsBackend>,
        registry: DriverRegistry,
        config: ControlConfig,
    ) -> Self {
        Self {
            store,
            secrets,
            registry,
            pool: RwLock::new(HashMap::new()),
            create_locks: tokio::sync::Mutex::new(HashMap::new()),
            config,
        }
    }

    /// Preload a driver instance for a provider, bypassing the registry.
    ///
    /// Used by tests and by callers that wire custom driver factories.
    pub fn insert_driver(&self, provider_id: ProviderId, driver: Arc<dyn CloudDriver>) {
        self.pool.write().insert(provider_id, driver);
    }

    /// Resolve a provider row.
    ///
    /// # Errors
    ///
    /// Returns [`ControlError::NotFound`] for unknown providers.
    pub fn provider(&self, provider_id: &ProviderId) -> Result<CloudProvider> {
        self.store
            .get_provider(provider_id)?
            .ok_or_else(|| ControlError::NotFound(format!("provider {provider_id}")))
    }

    /// Obtain the pooled driver for a provider, constructing it on first
    /// use with credentials from the secrets store.
    ///
    /// # Errors
    ///
    /// Returns [`ControlError::NotFound`] for unknown providers, secrets
    /// errors for missing credentials, and driver construction errors.
    pub async fn driver(&self, provider_id: &ProviderId) -> Result<Arc<dyn CloudDriver>> {
        if let Some(driver) = self.pool.read().get(provider_id) {
            return Ok(Arc::clone(driver));
        }

        let provider = self.provider(provider_id)?;
        let credentials = self.secrets.get(&provider.credentials_ref).await?;
        let driver = self.registry.create(&DriverConfig {
            kind: provider.kind.as_str().to_string(),
            region: provider.region.clone(),
            credentials,
        })?;

        self.pool
            .write()
            .insert(*provider_id, Arc::clone(&driver));
        Ok(driver)
    }

    /// List machines at the provider, refreshing the cache with each.
    ///
    /// # Errors
    ///
    /// Surfaces driver errors; cache write failures fail the call.
    pub async fn list_machines(
        &self,
        provider_id: &ProviderId,
        filters: &MachineFilters,
    ) -> Result<Vec<MachineRecord>> {
        let driver = self.driver(provider_id).await?;
        let machines = match driver.list_machines(filters).await {
            Err(e) if e.is_auth() => {
                driver.authenticate().await?;
                driver.list_machines(filters).await?
            }
            other => other?,
        };

        let mut records = Vec::with_capacity(machines.len());
        for machine in machines {
            records.push(self.reconcile_one(provider_id, &machine)?);
        }
        Ok(records)
    }

    /// Fetch one machine from the provider and refresh its cache row.
    ///
    /// # Errors
    ///
    /// Surfaces driver errors, including `NotFound`.
    pub async fn get_machine(
        &self,
        provider_id: &ProviderId,
        external_id: &str,
    ) -> Result<MachineRecord> {
        let driver = self.driver(provider_id).await?;
        let machine = match driver.get_machine(external_id).await {
            Err(e) if e.is_auth() => {
                driver.authenticate().await?;
                driver.get_machine(external_id).await?
            }
            other => other?,
        };
        self.reconcile_one(provider_id, &machine)
    }

    /// Create a machine.
    ///
    /// Creation is serialized per `(provider, name)`. After the provider
    /// returns an object reference, the orchestrator waits inline up to
    /// `max_inline_wait_s` for the machine to leave its transitional state;
    /// if it does not, the transitional machine is returned and the client
    /// polls.
    ///
    /// # Errors
    ///
    /// Surfaces driver errors (quota errors for pool exhaustion included).
    pub async fn create_machine(
        &self,
        provider_id: &ProviderId,
        spec: &MachineSpec,
    ) -> Result<MachineRecord> {
        let lock = {
            let mut locks = self.create_locks.lock().await;
            Arc::clone(
                locks
                    .entry(format!("{provider_id}/{}", spec.name))
                    .or_default(),
            )
        };
        let _guard = lock.lock().await;

        let driver = self.driver(provider_id).await?;
        let machine = match driver.create_machine(spec).await {
            Err(e) if e.is_auth() => {
                driver.authenticate().await?;
                driver.create_machine(spec).await?
            }
            other => other?,
        };
        let record = self.reconcile_one(provider_id, &machine)?;

        if !record.state.is_transitional() {
            return Ok(record);
        }

        // Bounded inline wait for fast providers; a timeout here is not an
        // error, the client just sees the transitional state.
        let cancel = CancellationToken::new();
        match driver
            .wait_for_state(
                &record.external_id,
                MachineState::Running,
                self.config.max_inline_wait(),
                &cancel,
            )
            .await
        {
            Ok(machine) => self.reconcile_one(provider_id, &machine),
            Err(e) if e.is_timeout() => Ok(record),
            Err(e) => {
                tracing::warn!(
                    provider_id = %provider_id,
                    external_id = %record.external_id,
                    error = %e,
                    "inline wait after create failed"
                );
                Ok(record)
            }
        }
    }

    /// Destroy a machine and mark its cache row terminated.
    ///
    /// # Errors
    ///
    /// Surfaces driver errors.
    pub async fn destroy_machine(&self, provider_id: &ProviderId, external_id: &str) -> Result<()> {
        let driver = self.driver(provider_id).await?;
        match driver.destroy_machine(external_id).await {
            Err(e) if e.is_auth() => {
                driver.authenticate().await?;
                driver.destroy_machine(external_id).await?;
            }
            other => other?,
        }
        self.mark_terminated(provider_id, external_id)?;
        Ok(())
    }

    /// Start, stop, or reboot a machine, then refresh its cache row.
    ///
    /// # Errors
    ///
    /// Surfaces driver errors; an illegal transition arrives as the
    /// provider's conflict error.
    pub async fn lifecycle(
        &self,
        provider_id: &ProviderId,
        external_id: &str,
        operation: LifecycleOp,
    ) -> Result<MachineRecord> {
        let driver = self.driver(provider_id).await?;

        let invoke = |driver: Arc<dyn CloudDriver>| async move {
            match operation {
                LifecycleOp::Start => driver.start_machine(external_id).await,
                LifecycleOp::Stop => driver.stop_machine(external_id).await,
                LifecycleOp::Reboot => driver.reboot_machine(external_id).await,
            }
        };

        match invoke(Arc::clone(&driver)).await {
            Err(e) if e.is_auth() => {
                driver.authenticate().await?;
                invoke(Arc::clone(&driver)).await?;
            }
            other => other?,
        }

        self.get_machine(provider_id, external_id).await
    }

    /// Fetch console output for a machine.
    ///
    /// # Errors
    ///
    /// Surfaces driver errors.
    pub async fn console_output(
        &self,
        provider_id: &ProviderId,
        external_id: &str,
    ) -> Result<String> {
        let driver = self.driver(provider_id).await?;
        Ok(driver.get_console_output(external_id).await?)
    }

    /// Write one provider-reported machine through to the cache.
    ///
    /// The natural key and `created_at` never change. When the provider
    /// reports its own modification time, an older report does not
    /// downgrade a newer cache row (webhooks and the sync loop race).
    ///
    /// # Errors
    ///
    /// Returns a store error if the write fails.
    pub fn reconcile_one(
        &self,
        provider_id: &ProviderId,
        machine: &Machine,
    ) -> Result<MachineRecord> {
        let existing = self.store.get_machine(provider_id, &machine.external_id)?;

        if let (Some(existing), Some(reported)) = (&existing, machine.updated_at) {
            if existing.updated_at > reported {
                return Ok(existing.clone());
            }
        }

        let now = Utc::now();
        let record = MachineRecord {
            provider_id: *provider_id,
            external_id: machine.external_id.clone(),
            hostname: machine.hostname.clone(),
            state: machine.state,
            public_ips: machine.public_ips.clone(),
            private_ips: machine.private_ips.clone(),
            size: machine.size.clone(),
            image: machine.image.clone(),
            tags: machine.tags.clone(),
            extra: machine.extra.clone(),
            created_at: existing
                .as_ref()
                .map_or_else(|| machine.created_at.unwrap_or(now), |e| e.created_at),
            updated_at: now,
        };
        self.store.put_machine(&record)?;
        Ok(record)
    }

    /// Mark a cache row terminated without touching the provider.
    ///
    /// # Errors
    ///
    /// Returns a store error if the write fails.
    pub fn mark_terminated(&self, provider_id: &ProviderId, external_id: &str) -> Result<()> {
        if let Some(mut record) = self.store.get_machine(provider_id, external_id)? {
            if record.state != MachineState::Terminated {
                record.state = MachineState::Terminated;
                record.updated_at = Utc::now();
                self.store.put_machine(&record)?;
            }
        }
        Ok(())
    }

    /// The store handle, for the sync loop.
    #[must_use]
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }
}

/// A machine lifecycle operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleOp {
    /// Power on.
    Start,
    /// Power off.
    Stop,
    /// Restart.
    Reboot,
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use gough_clouds::{CloudError, Descriptor};
    use gough_secrets::encrypted::{derive_key, EncryptedDbBackend};
    use gough_store::{ProviderKind, RocksStore};
    use parking_lot::Mutex;

    /// In-memory driver that scripts machine listings.
    struct ScriptedDriver {
        machines: Mutex<Vec<Machine>>,
    }

    impl ScriptedDriver {
        fn new(machines: Vec<Machine>) -> Self {
            Self {
                machines: Mutex::new(machines),
            }
        }
    }

    #[async_trait]
    impl CloudDriver for ScriptedDriver {
        fn name(&self) -> &'static str {
            "scripted"
        }

        async fn authenticate(&self) -> gough_clouds::Result<()> {
            Ok(())
        }

        async fn list_machines(
            &self,
            _filters: &MachineFilters,
        ) -> gough_clouds::Result<Vec<Machine>> {
            Ok(self.machines.lock().clone())
        }

        async fn get_machine(&self, id: &str) -> gough_clouds::Result<Machine> {
            self.machines
                .lock()
                .iter()
                .find(|m| m.external_id == id)
                .cloned()
                .ok_or_else(|| CloudError::NotFound(id.to_string()))
        }

        async fn create_machine(&self, spec: &MachineSpec) -> gough_clouds::Result<Machine> {
            let machine = Machine::new(format!("m-{}", spec.name), &spec.name, MachineState::Running);
            self.machines.lock().push(machine.clone());
            Ok(machine)
        }

        async fn destroy_machine(&self, id: &str) -> gough_clouds::Result<()> {
            self.machines.lock().retain(|m| m.external_id != id);
            Ok(())
        }

        async fn start_machine(&self, _id: &str) -> gough_clouds::Result<()> {
            Ok(())
        }

        async fn stop_machine(&self, id: &str) -> gough_clouds::Result<()> {
            let mut machines = self.machines.lock();
            let machine = machines
                .iter_mut()
                .find(|m| m.external_id == id)
                .ok_or_else(|| CloudError::NotFound(id.to_string()))?;
            machine.state = MachineState::Stopped;
            Ok(())
        }

        async fn list_images(
            &self,
            _filters: &MachineFilters,
        ) -> gough_clouds::Result<Vec<Descriptor>> {
            Ok(Vec::new())
        }
    }

    struct Fixture {
        _store_dir: tempfile::TempDir,
        _secrets_dir: tempfile::TempDir,
        store: Arc<RocksStore>,
        orchestrator: MachineOrchestrator<RocksStore>,
        provider_id: ProviderId,
    }

    fn fixture(machines: Vec<Machine>) -> Fixture {
        let store_dir = tempfile::tempdir().unwrap();
        let secrets_dir = tempfile::tempdir().unwrap();
        let store = Arc::new(RocksStore::open(store_dir.path()).unwrap());
        let secrets: Arc<dyn SecretsBackend> = Arc::new(
            EncryptedDbBackend::open(secrets_dir.path(), derive_key(Some("k")).unwrap()).unwrap(),
        );

        let provider_id = ProviderId::generate();
        store
            .put_provider(&CloudProvider {
                id: provider_id,
                name: "test".to_string(),
                kind: ProviderKind::Vultr,
                region: "ewr".to_string(),
                credentials_ref: "cloud/test".to_string(),
                webhook_secret_ref: None,
                active: true,
                last_sync_at: None,
                created_at: Utc::now(),
            })
            .unwrap();

        let orchestrator = MachineOrchestrator::new(
            Arc::clone(&store),
            secrets,
            DriverRegistry::with_defaults(),
            ControlConfig::default(),
        );
        orchestrator.insert_driver(provider_id, Arc::new(ScriptedDriver::new(machines)));

        Fixture {
            _store_dir: store_dir,
            _secrets_dir: secrets_dir,
            store,
            orchestrator,
            provider_id,
        }
    }

    #[tokio::test]
    async fn list_writes_through_to_cache() {
        let f = fixture(vec![Machine::new("m-1", "web-1", MachineState::Running)]);

        let records = f
            .orchestrator
            .list_machines(&f.provider_id, &MachineFilters::default())
            .await
            .unwrap();
        assert_eq!(records.len(), 1);

        let cached = f
            .store
            .get_machine(&f.provider_id, "m-1")
            .unwrap()
            .unwrap();
        assert_eq!(cached.state, MachineState::Running);
        assert_eq!(cached.hostname, "web-1");
    }

    #[tokio::test]
    async fn reconcile_preserves_created_at_and_key() {
        let f = fixture(vec![]);
        let mut machine = Machine::new("m-1", "web-1", MachineState::Pending);

        let first = f.orchestrator.reconcile_one(&f.provider_id, &machine).unwrap();
        machine.state = MachineState::Running;
        let second = f.orchestrator.reconcile_one(&f.provider_id, &machine).unwrap();

        assert_eq!(first.created_at, second.created_at);
        assert_eq!(second.state, MachineState::Running);
        assert_eq!(second.external_id, "m-1");
    }

    #[tokio::test]
    async fn stale_provider_report_does_not_downgrade() {
        let f = fixture(vec![]);
        let mut machine = Machine::new("m-1", "web-1", MachineState::Running);
        f.orchestrator.reconcile_one(&f.provider_id, &machine).unwrap();

        // A report with an old provider timestamp arrives afterwards.
        machine.state = MachineState::Stopped;
        machine.updated_at = Some(Utc::now() - chrono::Duration::hours(1));
        let record = f.orchestrator.reconcile_one(&f.provider_id, &machine).unwrap();
        assert_eq!(record.state, MachineState::Running);
    }

    #[tokio::test]
    async fn destroy_marks_cache_terminated() {
        let f = fixture(vec![Machine::new("m-1", "web-1", MachineState::Running)]);
        f.orchestrator
            .list_machines(&f.provider_id, &MachineFilters::default())
            .await
            .unwrap();

        f.orchestrator
            .destroy_machine(&f.provider_id, "m-1")
            .await
            .unwrap();

        let cached = f
            .store
            .get_machine(&f.provider_id, "m-1")
            .unwrap()
            .unwrap();
        assert_eq!(cached.state, MachineState::Terminated);
    }

    #[tokio::test]
    async fn lifecycle_refreshes_cache() {
        let f = fixture(vec![Machine::new("m-1", "web-1", MachineState::Running)]);

        let record = f
            .orchestrator
            .lifecycle(&f.provider_id, "m-1", LifecycleOp::Stop)
            .await
            .unwrap();
        assert_eq!(record.state, MachineState::Stopped);
    }

    #[tokio::test]
    async fn unknown_provider_is_not_found() {
        let f = fixture(vec![]);
        let result = f.orchestrator.driver(&ProviderId::generate()).await;
        assert!(matches!(result, Err(ControlError::NotFound(_))));
    }
}
