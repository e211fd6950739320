//! Engines managed as custom resources of a container cluster.
//!
//! Every tenant maps to one `Engine` resource (`thingcloud.io/v1`) named
//! `engine-<id>`. An operator outside this crate runs the engine and reports
//! `status.phase` and `status.address`; this backend only creates, patches
//! and deletes resources through the cluster's HTTP API.

use std::sync::Arc;

use futures::future::BoxFuture;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use hyper::{Method, Request, StatusCode};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use serde_json::{json, Value};
use thingcloud_common::{CloudError, Result, TenantId};
use tokio::sync::broadcast;
use tokio::time::Instant;

use crate::config::ClusterConfig;
use crate::direct::connect_engine;
use crate::manager::{ClientEvent, EngineCache, EngineManager, EngineRef};

pub const API_VERSION: &str = "thingcloud.io/v1";
pub const ENGINE_KIND: &str = "Engine";
const APP_LABEL: &str = "thingcloud-engine";
const MERGE_PATCH: &str = "application/merge-patch+json";

type HttpClient = Client<HttpConnector, Full<Bytes>>;

/// Name of the resource hosting `tenant`.
pub fn resource_name(tenant: TenantId) -> String {
    format!("engine-{}", tenant)
}

/// Name of the volume claim holding the tenant's data.
pub fn volume_claim_name(tenant: TenantId) -> String {
    format!("engine-{}-data", tenant)
}

/// The manifest posted to start `tenant`.
pub fn engine_manifest(tenant: TenantId, clear_cache: bool) -> Value {
    json!({
        "apiVersion": API_VERSION,
        "kind": ENGINE_KIND,
        "metadata": {
            "name": resource_name(tenant),
            "labels": {
                "app": APP_LABEL,
                "thingcloud.io/tenant": tenant.to_string(),
            },
        },
        "spec": {
            "tenantId": tenant,
            "clearCache": clear_cache,
        },
    })
}

fn phase(resource: &Value) -> Option<&str> {
    resource.pointer("/status/phase").and_then(Value::as_str)
}

fn is_terminating(resource: &Value) -> bool {
    resource
        .pointer("/metadata/deletionTimestamp")
        .is_some_and(|ts| !ts.is_null())
}

fn api_error(status: StatusCode, body: &Value) -> CloudError {
    let message = body
        .get("message")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| format!("cluster API returned {}", status));
    CloudError::Remote {
        message,
        code: Some(format!("HTTP{}", status.as_u16())),
    }
}

struct ClusterInner {
    config: ClusterConfig,
    http: HttpClient,
    cache: Arc<EngineCache>,
}

impl ClusterInner {
    fn collection_url(&self) -> String {
        format!(
            "{}/apis/{}/namespaces/{}/engines",
            self.config.api_url.trim_end_matches('/'),
            API_VERSION,
            self.config.namespace
        )
    }

    fn resource_url(&self, tenant: TenantId) -> String {
        format!("{}/{}", self.collection_url(), resource_name(tenant))
    }

    fn volume_claim_url(&self, tenant: TenantId) -> String {
        format!(
            "{}/api/v1/namespaces/{}/persistentvolumeclaims/{}",
            self.config.api_url.trim_end_matches('/'),
            self.config.namespace,
            volume_claim_name(tenant)
        )
    }

    /// Sends one API request. Non-JSON bodies come back as a JSON string.
    async fn request(&self, method: Method, url: &str, body: Option<(&str, Value)>) -> Result<(StatusCode, Value)> {
        let mut builder = Request::builder()
            .method(method.clone())
            .uri(url)
            .header(ACCEPT, "application/json");
        if let Some(token) = &self.config.bearer_token {
            builder = builder.header(AUTHORIZATION, format!("Bearer {}", token));
        }
        let payload = match body {
            Some((content_type, value)) => {
                builder = builder.header(CONTENT_TYPE, content_type);
                Bytes::from(serde_json::to_vec(&value)?)
            }
            None => Bytes::new(),
        };
        let request = builder
            .body(Full::new(payload))
            .map_err(|e| CloudError::InvalidArgument(format!("bad request to {}: {}", url, e)))?;

        let timeout = self.config.request_timeout;
        let response = tokio::time::timeout(timeout, self.http.request(request))
            .await
            .map_err(|_| CloudError::Timeout(timeout.as_millis() as u64))?
            .map_err(|e| CloudError::Transport(format!("{} {} failed: {}", method, url, e)))?;

        let status = response.status();
        let bytes = response
            .into_body()
            .collect()
            .await
            .map_err(|e| CloudError::Transport(e.to_string()))?
            .to_bytes();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()))
        };
        tracing::debug!("{} {} -> {}", method, url, status);
        Ok((status, value))
    }

    async fn get_resource(&self, tenant: TenantId) -> Result<Option<Value>> {
        let (status, body) = self.request(Method::GET, &self.resource_url(tenant), None).await?;
        match status {
            StatusCode::NOT_FOUND => Ok(None),
            s if s.is_success() => Ok(Some(body)),
            s => Err(api_error(s, &body)),
        }
    }

    /// Creates the resource. An existing resource counts as created unless
    /// it is still being deleted, in which case creation is retried until
    /// `deadline`.
    async fn create(&self, tenant: TenantId, clear_cache: bool, deadline: Instant) -> Result<()> {
        loop {
            let manifest = engine_manifest(tenant, clear_cache);
            let (status, body) = self
                .request(Method::POST, &self.collection_url(), Some(("application/json", manifest)))
                .await?;
            if status.is_success() {
                tracing::info!("Created engine resource for tenant {}", tenant);
                return Ok(());
            }
            if status != StatusCode::CONFLICT {
                return Err(api_error(status, &body));
            }

            match self.get_resource(tenant).await? {
                Some(existing) if !is_terminating(&existing) => return Ok(()),
                _ => {
                    tracing::debug!("Engine resource for tenant {} is still terminating", tenant);
                }
            }
            if Instant::now() >= deadline {
                return Err(CloudError::Timeout(self.config.start_timeout.as_millis() as u64));
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }

    async fn wait_running(&self, tenant: TenantId, deadline: Instant) -> Result<()> {
        loop {
            if let Some(resource) = self.get_resource(tenant).await? {
                match phase(&resource) {
                    Some("Running") => return Ok(()),
                    Some("Failed") => {
                        let message = resource
                            .pointer("/status/message")
                            .and_then(Value::as_str)
                            .unwrap_or("engine failed to start");
                        return Err(CloudError::Remote {
                            message: message.to_string(),
                            code: Some("ECHILD".to_string()),
                        });
                    }
                    _ => {}
                }
            }
            if Instant::now() >= deadline {
                return Err(CloudError::Timeout(self.config.start_timeout.as_millis() as u64));
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }

    async fn start(&self, tenant: TenantId, clear_cache: bool) -> Result<()> {
        let deadline = Instant::now() + self.config.start_timeout;
        self.create(tenant, clear_cache, deadline).await?;
        self.wait_running(tenant, deadline).await
    }

    /// Deletes `url`; a missing object is not an error.
    async fn delete(&self, url: &str) -> Result<()> {
        let (status, body) = self.request(Method::DELETE, url, None).await?;
        if status.is_success() || status == StatusCode::NOT_FOUND {
            Ok(())
        } else {
            Err(api_error(status, &body))
        }
    }

    async fn kill(&self, tenant: TenantId) -> Result<()> {
        let result = self.delete(&self.resource_url(tenant)).await;
        self.cache.close(tenant);
        result
    }

    async fn engine_address(&self, tenant: TenantId) -> Result<String> {
        let resource = self.get_resource(tenant).await?.ok_or(CloudError::NoSuchEngine(tenant))?;
        match (phase(&resource), resource.pointer("/status/address").and_then(Value::as_str)) {
            (Some("Running"), Some(address)) => Ok(address.to_string()),
            _ => Err(CloudError::NoSuchEngine(tenant)),
        }
    }
}

/// Front end for engines hosted by a container cluster.
#[derive(Clone)]
pub struct ClusterEngineManager {
    inner: Arc<ClusterInner>,
}

impl ClusterEngineManager {
    pub fn new(config: ClusterConfig) -> Self {
        let http = Client::builder(TokioExecutor::new()).build_http();
        Self {
            inner: Arc::new(ClusterInner {
                config,
                http,
                cache: EngineCache::new(),
            }),
        }
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.inner.config
    }

    pub fn resource_url(&self, tenant: TenantId) -> String {
        self.inner.resource_url(tenant)
    }
}

impl EngineManager for ClusterEngineManager {
    fn get_engine(&self, tenant: TenantId) -> BoxFuture<'_, Result<EngineRef>> {
        Box::pin(async move {
            let inner = self.inner.clone();
            self.inner
                .cache
                .get_or_connect(tenant, move || {
                    Box::pin(async move {
                        let address = inner.engine_address(tenant).await?;
                        connect_engine(
                            &address,
                            tenant,
                            inner.config.auth_token.as_deref(),
                            inner.config.connect_timeout,
                        )
                        .await
                    })
                })
                .await
        })
    }

    fn start_user(&self, tenant: TenantId) -> BoxFuture<'_, Result<()>> {
        Box::pin(self.inner.start(tenant, false))
    }

    fn kill_user(&self, tenant: TenantId) -> BoxFuture<'_, Result<()>> {
        Box::pin(self.inner.kill(tenant))
    }

    fn restart_user(&self, tenant: TenantId) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.inner.kill(tenant).await?;
            self.inner.start(tenant, false).await
        })
    }

    fn delete_user(&self, tenant: TenantId) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.inner.kill(tenant).await?;
            self.inner.delete(&self.inner.volume_claim_url(tenant)).await?;
            tracing::info!("Deleted engine data for tenant {}", tenant);
            Ok(())
        })
    }

    fn clear_cache(&self, tenant: TenantId) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let patch = json!({"spec": {"clearCache": true}});
            let (status, body) = self
                .inner
                .request(Method::PATCH, &self.inner.resource_url(tenant), Some((MERGE_PATCH, patch)))
                .await?;
            // Without a resource there is no cache to clear.
            if status.is_success() || status == StatusCode::NOT_FOUND {
                Ok(())
            } else {
                Err(api_error(status, &body))
            }
        })
    }

    fn restart_user_without_cache(&self, tenant: TenantId) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.inner.kill(tenant).await?;
            self.inner.start(tenant, true).await
        })
    }

    fn is_running(&self, tenant: TenantId) -> BoxFuture<'_, Result<bool>> {
        Box::pin(async move {
            let resource = self.inner.get_resource(tenant).await?;
            Ok(resource.as_ref().and_then(phase) == Some("Running"))
        })
    }

    fn get_process_id(&self, tenant: TenantId) -> BoxFuture<'_, Result<Option<String>>> {
        Box::pin(async move {
            let resource = self.inner.get_resource(tenant).await?;
            Ok(resource.map(|_| resource_name(tenant)))
        })
    }

    fn kill_all_users(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let url = format!("{}?labelSelector=app%3D{}", self.inner.collection_url(), APP_LABEL);
            let result = self.inner.delete(&url).await;
            self.inner.cache.close_all();
            result
        })
    }

    fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.inner.cache.subscribe()
    }
}
