use std::path::{Path, PathBuf};

use thingcloud_common::protocol::{cache_dir, tenant_dir};
use thingcloud_common::rpc::Proxy;
use thingcloud_common::{Result, TenantConfig, TenantId};

/// Everything an engine may touch on behalf of its tenant.
pub struct Platform {
    config: TenantConfig,
    working_dir: PathBuf,
    cache_dir: PathBuf,
    thingpedia: Option<Proxy>,
}

impl Platform {
    pub fn new(config: TenantConfig, root: &Path, thingpedia: Option<Proxy>) -> Self {
        Self {
            working_dir: tenant_dir(root, config.id),
            cache_dir: cache_dir(root, config.id),
            config,
            thingpedia,
        }
    }

    pub fn tenant(&self) -> TenantId {
        self.config.id
    }

    pub fn config(&self) -> &TenantConfig {
        &self.config
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    pub fn thingpedia(&self) -> Option<&Proxy> {
        self.thingpedia.as_ref()
    }

    /// Creates the working and cache directories.
    pub async fn ensure_dirs(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.cache_dir).await?;
        Ok(())
    }

    /// Developer key as seen by the supervisor, falling back to the local config.
    pub async fn developer_key(&self) -> Result<Option<String>> {
        match &self.thingpedia {
            Some(thingpedia) => thingpedia.call_as("getDeveloperKey", vec![]).await,
            None => Ok(self.config.developer_key.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_platform_dirs() {
        let root = tempfile::tempdir().unwrap();
        let platform = Platform::new(TenantConfig::new(5).with_developer_key("k"), root.path(), None);

        assert_eq!(platform.working_dir(), root.path().join("5"));
        platform.ensure_dirs().await.unwrap();
        assert!(root.path().join("5").join("cache").is_dir());
        assert_eq!(platform.developer_key().await.unwrap().as_deref(), Some("k"));
    }
}
