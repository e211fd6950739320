//! RPC surfaces exchanged between front ends, supervisors and workers.

use serde_json::{json, Value};

use super::{TenantConfig, TenantId};
use crate::error::Result;
use crate::rpc::Proxy;

/// Methods of the supervisor stub offered on a `master` control connection.
pub const SUPERVISOR_METHODS: &[&str] = &[
    "startUser",
    "killUser",
    "restartUser",
    "deleteUser",
    "clearCache",
    "restartUserWithoutCache",
    "isRunning",
    "getProcessId",
    "killAllUsers",
];

/// Methods of the stub a worker registers with its supervisor.
pub const WORKER_METHODS: &[&str] = &["runEngine", "killEngine"];

/// Methods of a hosted engine.
pub const ENGINE_METHODS: &[&str] = &["getInfo", "getPreference", "setPreference", "getPreferences"];

/// Websocket capability of a hosted engine.
pub const WEBSOCKET_METHODS: &[&str] = &["send", "ping"];

/// Webhook capability of a hosted engine.
pub const WEBHOOK_METHODS: &[&str] = &["handleCallback"];

/// One-shot stub a front end passes with a `direct` request.
pub const DIRECT_REPLY_METHODS: &[&str] = &["ready", "error"];

/// Delegate notified when a worker drops an engine.
pub const DELEGATE_METHODS: &[&str] = &["engineRemoved"];

/// Per-tenant collaborator the supervisor lends to the engine.
pub const THINGPEDIA_METHODS: &[&str] = &["getDeveloperKey", "getLocale", "getModelTag"];

/// Typed view of a supervisor proxy.
#[derive(Clone, Debug)]
pub struct SupervisorProxy {
    proxy: Proxy,
}

impl SupervisorProxy {
    pub fn new(proxy: Proxy) -> Self {
        Self { proxy }
    }

    pub fn proxy(&self) -> &Proxy {
        &self.proxy
    }

    pub async fn start_user(&self, tenant: TenantId) -> Result<()> {
        self.proxy.call("startUser", vec![json!(tenant)]).await.map(drop)
    }

    pub async fn kill_user(&self, tenant: TenantId) -> Result<()> {
        self.proxy.call("killUser", vec![json!(tenant)]).await.map(drop)
    }

    pub async fn restart_user(&self, tenant: TenantId) -> Result<()> {
        self.proxy.call("restartUser", vec![json!(tenant)]).await.map(drop)
    }

    pub async fn delete_user(&self, tenant: TenantId) -> Result<()> {
        self.proxy.call("deleteUser", vec![json!(tenant)]).await.map(drop)
    }

    pub async fn clear_cache(&self, tenant: TenantId) -> Result<()> {
        self.proxy.call("clearCache", vec![json!(tenant)]).await.map(drop)
    }

    pub async fn restart_user_without_cache(&self, tenant: TenantId) -> Result<()> {
        self.proxy
            .call("restartUserWithoutCache", vec![json!(tenant)])
            .await
            .map(drop)
    }

    pub async fn is_running(&self, tenant: TenantId) -> Result<bool> {
        self.proxy.call_as("isRunning", vec![json!(tenant)]).await
    }

    pub async fn get_process_id(&self, tenant: TenantId) -> Result<Option<String>> {
        self.proxy.call_as("getProcessId", vec![json!(tenant)]).await
    }

    pub async fn kill_all_users(&self) -> Result<()> {
        self.proxy.call("killAllUsers", vec![]).await.map(drop)
    }
}

/// Typed view of a worker proxy.
#[derive(Clone, Debug)]
pub struct WorkerProxy {
    proxy: Proxy,
}

impl WorkerProxy {
    pub fn new(proxy: Proxy) -> Self {
        Self { proxy }
    }

    /// Starts an engine; resolves to a proxy for it.
    ///
    /// `thingpedia` and `delegate` are exported stubs (see
    /// [`RpcChannel::export`](crate::rpc::RpcChannel::export)).
    pub async fn run_engine(&self, config: &TenantConfig, thingpedia: Value, delegate: Value) -> Result<Proxy> {
        let engine = self
            .proxy
            .call("runEngine", vec![serde_json::to_value(config)?, thingpedia, delegate])
            .await?;
        self.proxy.channel().import_proxy(&engine)
    }

    pub async fn kill_engine(&self, tenant: TenantId) -> Result<()> {
        self.proxy.call("killEngine", vec![json!(tenant)]).await.map(drop)
    }
}
