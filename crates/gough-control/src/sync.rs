//! Periodic inventory synchronization.
//!
//! One reconcile pass per active provider: machines present at the
//! provider but absent from the cache are inserted, cached machines the
//! provider no longer reports are marked terminated, and the overlap has
//! its mutable fields refreshed. A provider failure skips that provider
//! for the cycle and never aborts the loop.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use rand::Rng;
use tokio_util::sync::CancellationToken;

use gough_clouds::MachineFilters;
use gough_core::MachineState;
use gough_store::{CloudProvider, Store};

use crate::error::Result;
use crate::orchestrator::MachineOrchestrator;
use crate::ControlConfig;

/// Counters from one provider reconcile pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SyncStats {
    /// Machines newly inserted into the cache.
    pub inserted: usize,
    /// Machines whose cache row was refreshed.
    pub updated: usize,
    /// Machines marked terminated because the provider stopped reporting
    /// them.
    pub terminated: usize,
}

/// The inventory sync worker.
pub struct InventorySync<S: Store> {
    orchestrator: Arc<MachineOrchestrator<S>>,
    config: ControlConfig,
}

impl<S: Store + 'static> InventorySync<S> {
    /// Create the sync worker.
    #[must_use]
    pub fn new(orchestrator: Arc<MachineOrchestrator<S>>, config: ControlConfig) -> Self {
        Self {
            orchestrator,
            config,
        }
    }

    /// Reconcile one provider.
    ///
    /// # Errors
    ///
    /// Surfaces driver and store errors; the caller decides whether to skip
    /// the cycle.
    pub async fn sync_provider(&self, provider: &CloudProvider) -> Result<SyncStats> {
        let store = self.orchestrator.store();
        let before: HashSet<String> = store
            .list_machines_by_provider(&provider.id)?
            .into_iter()
            .map(|m| m.external_id)
            .collect();

        let driver = self.orchestrator.driver(&provider.id).await?;
        let listed = driver.list_machines(&MachineFilters::default()).await?;

        let mut stats = SyncStats::default();
        let mut seen = HashSet::with_capacity(listed.len());

        for machine in &listed {
            seen.insert(machine.external_id.clone());
            if before.contains(&machine.external_id) {
                stats.updated += 1;
            } else {
                stats.inserted += 1;
            }
            self.orchestrator.reconcile_one(&provider.id, machine)?;
        }

        // Anything cached but no longer reported is gone at the provider.
        for record in store.list_machines_by_provider(&provider.id)? {
            if !seen.contains(&record.external_id) && record.state != MachineState::Terminated {
                self.orchestrator
                    .mark_terminated(&provider.id, &record.external_id)?;
                stats.terminated += 1;
            }
        }

        let mut provider = provider.clone();
        provider.last_sync_at = Some(Utc::now());
        store.put_provider(&provider)?;

        Ok(stats)
    }

    /// One pass over all active providers.
    pub async fn sync_all(&self) {
        let providers = match self.orchestrator.store().list_providers() {
            Ok(providers) => providers,
            Err(e) => {
                tracing::error!(error = %e, "failed to list providers for sync");
                return;
            }
        };

        for provider in providers.into_iter().filter(|p| p.active) {
            match self.sync_provider(&provider).await {
                Ok(stats) => {
                    tracing::debug!(
                        provider = %provider.name,
                        inserted = stats.inserted,
                        updated = stats.updated,
                        terminated = stats.terminated,
                        "inventory sync completed"
                    );
                }
                Err(e) => {
                    tracing::error!(
                        provider = %provider.name,
                        error = %e,
                        "inventory sync failed, skipping provider this cycle"
                    );
                }
            }
        }
    }

    /// Run the sync loop until cancelled. Each cycle sleeps the configured
    /// interval jittered ±10% so a fleet of servers does not thundering-herd
    /// the providers.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            let base = self.config.sync_interval_s;
            #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            let jittered = {
                let factor: f64 = rand::thread_rng().gen_range(0.9..1.1);
                ((base as f64) * factor) as u64
            };

            tokio::select! {
                () = cancel.cancelled() => {
                    tracing::info!("inventory sync loop stopping");
                    return;
                }
                () = tokio::time::sleep(std::time::Duration::from_secs(jittered.max(1))) => {}
            }

            self.sync_all().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use gough_clouds::{CloudDriver, CloudError, DriverRegistry, Machine, MachineSpec};
    use gough_core::ProviderId;
    use gough_secrets::encrypted::{derive_key, EncryptedDbBackend};
    use gough_secrets::SecretsBackend;
    use gough_store::{ProviderKind, RocksStore};
    use parking_lot::Mutex;

    struct ListOnlyDriver {
        machines: Mutex<Vec<Machine>>,
    }

    #[async_trait]
    impl CloudDriver for ListOnlyDriver {
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
            Err(CloudError::NotFound(id.to_string()))
        }

        async fn create_machine(&self, _spec: &MachineSpec) -> gough_clouds::Result<Machine> {
            unimplemented!()
        }

        async fn destroy_machine(&self, _id: &str) -> gough_clouds::Result<()> {
            Ok(())
        }

        async fn start_machine(&self, _id: &str) -> gough_clouds::Result<()> {
            Ok(())
        }

        async fn stop_machine(&self, _id: &str) -> gough_clouds::Result<()> {
            Ok(())
        }
    }

    struct Fixture {
        _store_dir: tempfile::TempDir,
        _secrets_dir: tempfile::TempDir,
        store: Arc<RocksStore>,
        sync: InventorySync<RocksStore>,
        provider: CloudProvider,
        machines: Arc<ListOnlyDriver>,
    }

    fn fixture(initial: Vec<Machine>) -> Fixture {
        let store_dir = tempfile::tempdir().unwrap();
        let secrets_dir = tempfile::tempdir().unwrap();
        let store = Arc::new(RocksStore::open(store_dir.path()).unwrap());
        let secrets: Arc<dyn SecretsBackend> = Arc::new(
            EncryptedDbBackend::open(secrets_dir.path(), derive_key(Some("k")).unwrap()).unwrap(),
        );

        let provider = CloudProvider {
            id: ProviderId::generate(),
            name: "test".to_string(),
            kind: ProviderKind::Vultr,
            region: "ewr".to_string(),
            credentials_ref: "cloud/test".to_string(),
            webhook_secret_ref: None,
            active: true,
            last_sync_at: None,
            created_at: Utc::now(),
        };
        store.put_provider(&provider).unwrap();

        let orchestrator = Arc::new(MachineOrchestrator::new(
            Arc::clone(&store),
            secrets,
            DriverRegistry::with_defaults(),
            ControlConfig::default(),
        ));
        let driver = Arc::new(ListOnlyDriver {
            machines: Mutex::new(initial),
        });
        orchestrator.insert_driver(provider.id, Arc::clone(&driver) as _);

        Fixture {
            _store_dir: store_dir,
            _secrets_dir: secrets_dir,
            store,
            sync: InventorySync::new(orchestrator, ControlConfig::default()),
            provider,
            machines: driver,
        }
    }

    #[tokio::test]
    async fn inserts_new_machines() {
        let f = fixture(vec![Machine::new("s-01", "node-1", MachineState::Running)]);

        let stats = f.sync.sync_provider(&f.provider).await.unwrap();
        assert_eq!(stats.inserted, 1);
        assert_eq!(stats.terminated, 0);

        let cached = f.store.get_machine(&f.provider.id, "s-01").unwrap().unwrap();
        assert_eq!(cached.state, MachineState::Running);

        let provider = f.store.get_provider(&f.provider.id).unwrap().unwrap();
        assert!(provider.last_sync_at.is_some());
    }

    #[tokio::test]
    async fn missing_machine_is_marked_terminated() {
        let f = fixture(vec![Machine::new("s-01", "node-1", MachineState::Running)]);
        f.sync.sync_provider(&f.provider).await.unwrap();

        // Provider stops reporting the machine.
        f.machines.machines.lock().clear();
        let stats = f.sync.sync_provider(&f.provider).await.unwrap();
        assert_eq!(stats.terminated, 1);

        let cached = f.store.get_machine(&f.provider.id, "s-01").unwrap().unwrap();
        assert_eq!(cached.state, MachineState::Terminated);

        // A further sync does not re-terminate.
        let stats = f.sync.sync_provider(&f.provider).await.unwrap();
        assert_eq!(stats.terminated, 0);
    }

    #[tokio::test]
    async fn overlap_updates_mutable_fields() {
        let f = fixture(vec![Machine::new("s-01", "node-1", MachineState::Pending)]);
        f.sync.sync_provider(&f.provider).await.unwrap();
        let first = f.store.get_machine(&f.provider.id, "s-01").unwrap().unwrap();

        {
            let mut machines = f.machines.machines.lock();
            machines[0].state = MachineState::Running;
            machines[0].public_ips = vec!["203.0.113.9".to_string()];
        }

        let stats = f.sync.sync_provider(&f.provider).await.unwrap();
        assert_eq!(stats.updated, 1);

        let second = f.store.get_machine(&f.provider.id, "s-01").unwrap().unwrap();
        assert_eq!(second.state, MachineState::Running);
        assert_eq!(second.public_ips, vec!["203.0.113.9"]);
        assert_eq!(second.created_at, first.created_at);
    }
}
