use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use futures::future::BoxFuture;
use serde_json::{json, Map, Value};
use thingcloud_common::protocol::{ENGINE_METHODS, WEBHOOK_METHODS, WEBSOCKET_METHODS};
use thingcloud_common::rpc::{arg, RpcChannel, Stub};
use thingcloud_common::{CloudError, Result};

use super::{Engine, EngineFactory};
use crate::platform::Platform;

const PREFS_FILE: &str = "prefs.json";

/// Built-in engine: a persistent preference store plus message counters.
pub struct BasicEngine {
    platform: Platform,
    prefs: Mutex<Map<String, Value>>,
    developer_key: Mutex<Option<String>>,
    websocket_messages: AtomicU64,
    webhook_calls: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl BasicEngine {
    pub fn new(platform: Platform) -> Self {
        Self {
            platform,
            prefs: Mutex::new(Map::new()),
            developer_key: Mutex::new(None),
            websocket_messages: AtomicU64::new(0),
            webhook_calls: AtomicU64::new(0),
        }
    }

    pub fn platform(&self) -> &Platform {
        &self.platform
    }

    fn info(&self) -> Value {
        let config = self.platform.config();
        json!({
            "id": config.id,
            "cloudId": config.cloud_id,
            "locale": config.locale,
            "timezone": config.timezone,
            "modelTag": config.model_tag,
            "developerKey": lock(&self.developer_key).clone(),
            "workingDir": self.platform.working_dir().display().to_string(),
        })
    }

    async fn save_prefs(&self) -> Result<()> {
        let bytes = {
            let prefs = lock(&self.prefs);
            serde_json::to_vec_pretty(&*prefs)?
        };
        tokio::fs::write(self.platform.working_dir().join(PREFS_FILE), bytes).await?;
        Ok(())
    }

    async fn load_prefs(&self) -> Result<()> {
        let path = self.platform.working_dir().join(PREFS_FILE);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let prefs: Map<String, Value> = serde_json::from_slice(&bytes)?;
        *lock(&self.prefs) = prefs;
        Ok(())
    }
}

impl Engine for BasicEngine {
    fn open(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.platform.ensure_dirs().await?;
            self.load_prefs().await?;
            let key = self.platform.developer_key().await?;
            *lock(&self.developer_key) = key;
            tracing::info!("Engine for tenant {} opened", self.platform.tenant());
            Ok(())
        })
    }

    fn close(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.save_prefs().await?;
            tracing::info!("Engine for tenant {} closed", self.platform.tenant());
            Ok(())
        })
    }

    fn engine_stub(self: Arc<Self>) -> Arc<dyn Stub> {
        Arc::new(EngineApi(self))
    }

    fn websocket_stub(self: Arc<Self>) -> Arc<dyn Stub> {
        Arc::new(WebsocketApi(self))
    }

    fn webhook_stub(self: Arc<Self>) -> Arc<dyn Stub> {
        Arc::new(WebhookApi(self))
    }
}

/// Creates a [`BasicEngine`] per tenant.
#[derive(Debug, Default, Clone, Copy)]
pub struct BasicEngineFactory;

impl EngineFactory for BasicEngineFactory {
    fn create(&self, platform: Platform) -> Result<Arc<dyn Engine>> {
        Ok(Arc::new(BasicEngine::new(platform)))
    }
}

struct EngineApi(Arc<BasicEngine>);

impl Stub for EngineApi {
    fn methods(&self) -> &'static [&'static str] {
        ENGINE_METHODS
    }

    fn invoke(self: Arc<Self>, method: String, args: Vec<Value>, _channel: RpcChannel) -> BoxFuture<'static, Result<Value>> {
        Box::pin(async move {
            let engine = &self.0;
            match method.as_str() {
                "getInfo" => Ok(engine.info()),
                "getPreference" => {
                    let key: String = arg(&args, 0)?;
                    Ok(lock(&engine.prefs).get(&key).cloned().unwrap_or(Value::Null))
                }
                "setPreference" => {
                    let key: String = arg(&args, 0)?;
                    let value = args.get(1).cloned().unwrap_or(Value::Null);
                    lock(&engine.prefs).insert(key, value);
                    engine.save_prefs().await?;
                    Ok(Value::Null)
                }
                "getPreferences" => Ok(Value::Object(lock(&engine.prefs).clone())),
                other => Err(CloudError::MethodNotAllowed {
                    target: "engine".to_string(),
                    method: other.to_string(),
                }),
            }
        })
    }
}

struct WebsocketApi(Arc<BasicEngine>);

impl Stub for WebsocketApi {
    fn methods(&self) -> &'static [&'static str] {
        WEBSOCKET_METHODS
    }

    fn invoke(self: Arc<Self>, method: String, args: Vec<Value>, _channel: RpcChannel) -> BoxFuture<'static, Result<Value>> {
        Box::pin(async move {
            match method.as_str() {
                "send" => {
                    tracing::debug!("Websocket message for tenant {}: {:?}", self.0.platform.tenant(), args.first());
                    let count = self.0.websocket_messages.fetch_add(1, Ordering::Relaxed) + 1;
                    Ok(json!(count))
                }
                "ping" => Ok(json!("pong")),
                other => Err(CloudError::MethodNotAllowed {
                    target: "websocket".to_string(),
                    method: other.to_string(),
                }),
            }
        })
    }
}

struct WebhookApi(Arc<BasicEngine>);

impl Stub for WebhookApi {
    fn methods(&self) -> &'static [&'static str] {
        WEBHOOK_METHODS
    }

    fn invoke(self: Arc<Self>, method: String, args: Vec<Value>, _channel: RpcChannel) -> BoxFuture<'static, Result<Value>> {
        Box::pin(async move {
            if method != "handleCallback" {
                return Err(CloudError::MethodNotAllowed {
                    target: "webhook".to_string(),
                    method,
                });
            }
            let id: String = arg(&args, 0)?;
            let calls = self.0.webhook_calls.fetch_add(1, Ordering::Relaxed) + 1;
            Ok(json!({"status": 200, "id": id, "calls": calls}))
        })
    }
}
