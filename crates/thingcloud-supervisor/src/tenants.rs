use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};

use futures::future::BoxFuture;
use thingcloud_common::{CloudError, Result, TenantConfig, TenantId};

/// Source of tenant records.
///
/// Lookups happen on every start, so an edit to a tenant (say, removing its
/// developer key) is picked up by the next restart.
pub trait TenantStore: Send + Sync + 'static {
    /// The record for `tenant`, or [`CloudError::UnknownTenant`].
    fn get(&self, tenant: TenantId) -> BoxFuture<'_, Result<TenantConfig>>;

    /// Tenants to start with the supervisor.
    fn running_tenants(&self) -> BoxFuture<'_, Result<Vec<TenantId>>>;
}

/// Tenant records in a JSON file holding an array of [`TenantConfig`].
#[derive(Debug, Clone)]
pub struct JsonTenantStore {
    path: PathBuf,
}

impl JsonTenantStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    async fn load(&self) -> Result<Vec<TenantConfig>> {
        let bytes = tokio::fs::read(&self.path).await.map_err(|e| {
            CloudError::Config(format!("cannot read tenant file {}: {}", self.path.display(), e))
        })?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

impl TenantStore for JsonTenantStore {
    fn get(&self, tenant: TenantId) -> BoxFuture<'_, Result<TenantConfig>> {
        Box::pin(async move {
            self.load()
                .await?
                .into_iter()
                .find(|config| config.id == tenant)
                .ok_or(CloudError::UnknownTenant(tenant))
        })
    }

    fn running_tenants(&self) -> BoxFuture<'_, Result<Vec<TenantId>>> {
        Box::pin(async move {
            Ok(self
                .load()
                .await?
                .into_iter()
                .filter(|config| config.running)
                .map(|config| config.id)
                .collect())
        })
    }
}

/// In-memory tenant records.
#[derive(Debug, Default)]
pub struct MemoryTenantStore {
    tenants: Mutex<HashMap<TenantId, TenantConfig>>,
}

impl MemoryTenantStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tenants(tenants: impl IntoIterator<Item = TenantConfig>) -> Self {
        let store = Self::new();
        for config in tenants {
            store.insert(config);
        }
        store
    }

    fn tenants(&self) -> MutexGuard<'_, HashMap<TenantId, TenantConfig>> {
        self.tenants.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn insert(&self, config: TenantConfig) {
        self.tenants().insert(config.id, config);
    }

    /// Applies `f` to a stored record. Returns `false` for unknown tenants.
    pub fn update(&self, tenant: TenantId, f: impl FnOnce(&mut TenantConfig)) -> bool {
        match self.tenants().get_mut(&tenant) {
            Some(config) => {
                f(config);
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, tenant: TenantId) -> Option<TenantConfig> {
        self.tenants().remove(&tenant)
    }
}

impl TenantStore for MemoryTenantStore {
    fn get(&self, tenant: TenantId) -> BoxFuture<'_, Result<TenantConfig>> {
        let config = self.tenants().get(&tenant).cloned();
        Box::pin(async move { config.ok_or(CloudError::UnknownTenant(tenant)) })
    }

    fn running_tenants(&self) -> BoxFuture<'_, Result<Vec<TenantId>>> {
        let mut running: Vec<_> = self
            .tenants()
            .values()
            .filter(|config| config.running)
            .map(|config| config.id)
            .collect();
        running.sort_unstable();
        Box::pin(async move { Ok(running) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_json_store_rereads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tenants.json");
        let records = json!([
            {"id": 1, "running": true},
            {"id": 2, "developerKey": "dev", "running": false},
        ]);
        std::fs::write(&path, serde_json::to_vec(&records).unwrap()).unwrap();

        let store = JsonTenantStore::new(&path);
        assert_eq!(store.running_tenants().await.unwrap(), vec![1]);
        assert!(store.get(2).await.unwrap().needs_dedicated_process());

        let records = json!([{"id": 2, "running": true}]);
        std::fs::write(&path, serde_json::to_vec(&records).unwrap()).unwrap();
        assert!(!store.get(2).await.unwrap().needs_dedicated_process());
        assert!(matches!(store.get(1).await, Err(CloudError::UnknownTenant(1))));
    }

    #[tokio::test]
    async fn test_json_store_missing_file() {
        let store = JsonTenantStore::new("/nonexistent/tenants.json");
        assert!(matches!(store.get(1).await, Err(CloudError::Config(_))));
    }

    #[tokio::test]
    async fn test_memory_store_update() {
        let store = MemoryTenantStore::with_tenants([
            TenantConfig::new(3).with_running(true),
            TenantConfig::new(1).with_running(true),
            TenantConfig::new(2),
        ]);
        assert_eq!(store.running_tenants().await.unwrap(), vec![1, 3]);

        assert!(store.update(2, |config| config.developer_key = Some("k".into())));
        assert_eq!(store.get(2).await.unwrap().developer_key.as_deref(), Some("k"));
        assert!(!store.update(9, |_| {}));

        store.remove(3);
        assert!(matches!(store.get(3).await, Err(CloudError::UnknownTenant(3))));
    }
}
