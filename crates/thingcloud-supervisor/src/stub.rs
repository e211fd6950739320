//! Objects the supervisor exports over RPC.

use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::{json, Value};
use thingcloud_common::protocol::{DELEGATE_METHODS, SUPERVISOR_METHODS, THINGPEDIA_METHODS};
use thingcloud_common::rpc::{arg, RpcChannel, Stub};
use thingcloud_common::{CloudError, Result, TenantConfig, TenantId};

use crate::supervisor::{ProcessSupervisor, WeakSupervisor};

/// The supervisor's lifecycle API, offered on `master` control connections.
pub struct SupervisorStub {
    supervisor: ProcessSupervisor,
}

impl SupervisorStub {
    pub fn new(supervisor: ProcessSupervisor) -> Self {
        Self { supervisor }
    }
}

impl Stub for SupervisorStub {
    fn methods(&self) -> &'static [&'static str] {
        SUPERVISOR_METHODS
    }

    fn invoke(self: Arc<Self>, method: String, args: Vec<Value>, _channel: RpcChannel) -> BoxFuture<'static, Result<Value>> {
        Box::pin(async move {
            let supervisor = &self.supervisor;
            if method == "killAllUsers" {
                supervisor.kill_all_users().await?;
                return Ok(Value::Null);
            }

            let tenant: TenantId = arg(&args, 0)?;
            match method.as_str() {
                "startUser" => supervisor.start_user(tenant).await?,
                "killUser" => supervisor.kill_user(tenant).await?,
                "restartUser" => supervisor.restart_user(tenant).await?,
                "deleteUser" => supervisor.delete_user(tenant).await?,
                "clearCache" => supervisor.clear_cache(tenant).await?,
                "restartUserWithoutCache" => supervisor.restart_user_without_cache(tenant).await?,
                "isRunning" => return Ok(json!(supervisor.is_running(tenant))),
                "getProcessId" => return Ok(json!(supervisor.get_process_id(tenant))),
                other => {
                    return Err(CloudError::MethodNotAllowed {
                        target: "supervisor".to_string(),
                        method: other.to_string(),
                    })
                }
            }
            Ok(Value::Null)
        })
    }
}

/// Tenant-scoped lookups lent to a worker along with `runEngine`.
pub struct ThingpediaClientStub {
    config: TenantConfig,
}

impl ThingpediaClientStub {
    pub fn new(config: TenantConfig) -> Self {
        Self { config }
    }
}

impl Stub for ThingpediaClientStub {
    fn methods(&self) -> &'static [&'static str] {
        THINGPEDIA_METHODS
    }

    fn invoke(self: Arc<Self>, method: String, _args: Vec<Value>, _channel: RpcChannel) -> BoxFuture<'static, Result<Value>> {
        Box::pin(async move {
            match method.as_str() {
                "getDeveloperKey" => Ok(json!(self.config.developer_key)),
                "getLocale" => Ok(json!(self.config.locale)),
                "getModelTag" => Ok(json!(self.config.model_tag)),
                other => Err(CloudError::MethodNotAllowed {
                    target: "thingpedia".to_string(),
                    method: other.to_string(),
                }),
            }
        })
    }
}

/// Receives `engineRemoved` for one started engine.
///
/// Carries the generation of the start that exported it, so a notice from
/// an engine that has since been replaced leaves the new one alone.
pub struct EngineDelegateStub {
    supervisor: WeakSupervisor,
    tenant: TenantId,
    generation: u64,
}

impl EngineDelegateStub {
    pub(crate) fn new(supervisor: WeakSupervisor, tenant: TenantId, generation: u64) -> Self {
        Self {
            supervisor,
            tenant,
            generation,
        }
    }
}

impl Stub for EngineDelegateStub {
    fn methods(&self) -> &'static [&'static str] {
        DELEGATE_METHODS
    }

    fn invoke(self: Arc<Self>, method: String, _args: Vec<Value>, _channel: RpcChannel) -> BoxFuture<'static, Result<Value>> {
        Box::pin(async move {
            if method != "engineRemoved" {
                return Err(CloudError::MethodNotAllowed {
                    target: "delegate".to_string(),
                    method,
                });
            }
            if let Some(supervisor) = self.supervisor.upgrade() {
                supervisor.engine_removed(self.tenant, self.generation);
            }
            Ok(Value::Null)
        })
    }
}
