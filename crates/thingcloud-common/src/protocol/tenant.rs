use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Globally unique tenant identifier.
pub type TenantId = i64;

/// Per-tenant record provided by the account store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct TenantConfig {
    pub id: TenantId,
    #[serde(default)]
    pub cloud_id: String,
    #[serde(default)]
    pub auth_token: String,
    #[serde(default)]
    pub developer_key: Option<String>,
    #[serde(default = "default_locale")]
    pub locale: String,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default)]
    pub storage_key: String,
    #[serde(default)]
    pub model_tag: Option<String>,
    #[serde(default)]
    pub force_separate_process: bool,
    /// Whether the tenant should be started with the supervisor.
    #[serde(default)]
    pub running: bool,
}

fn default_locale() -> String {
    "en-US".to_string()
}

fn default_timezone() -> String {
    "UTC".to_string()
}

impl TenantConfig {
    pub fn new(id: TenantId) -> Self {
        Self {
            id,
            cloud_id: format!("cloud-{}", id),
            locale: default_locale(),
            timezone: default_timezone(),
            ..Default::default()
        }
    }

    pub fn with_developer_key(mut self, key: impl Into<String>) -> Self {
        self.developer_key = Some(key.into());
        self
    }

    pub fn with_separate_process(mut self, separate: bool) -> Self {
        self.force_separate_process = separate;
        self
    }

    pub fn with_running(mut self, running: bool) -> Self {
        self.running = running;
        self
    }

    /// Developer tenants and explicitly isolated tenants get their own process.
    pub fn needs_dedicated_process(&self) -> bool {
        self.force_separate_process || self.developer_key.is_some()
    }
}

/// Working directory of a tenant under the supervisor root.
pub fn tenant_dir(root: &Path, tenant: TenantId) -> PathBuf {
    root.join(tenant.to_string())
}

/// Cache directory of a tenant, removed by cache clears.
pub fn cache_dir(root: &Path, tenant: TenantId) -> PathBuf {
    tenant_dir(root, tenant).join("cache")
}
