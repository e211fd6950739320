//! Implementations of the `thingcloud` subcommands.

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use serde_json::{json, Value};
use thingcloud_client::{ClientConfig, EngineManager, LocalEngineManager};
use thingcloud_common::auth::{AuthConfig, CONTROL_TOKEN_ENV};
use thingcloud_common::TenantId;
use thingcloud_supervisor::{
    ControlListener, InProcessLauncher, JsonTenantStore, ProcessSupervisor, SandboxConfig, SupervisorConfig,
    TenantStore,
};
use thingcloud_worker::{BasicEngineFactory, WorkerOptions};

use crate::{CtlArgs, SupervisorArgs, WorkerArgs};

fn control_token(flag: Option<String>) -> Option<String> {
    flag.or_else(|| std::env::var(CONTROL_TOKEN_ENV).ok())
}

/// Builds the supervisor configuration described by the flags.
pub fn supervisor_config(args: &SupervisorArgs) -> SupervisorConfig {
    let mut config = SupervisorConfig::new(&args.root)
        .with_shard_id(args.shard)
        .with_auth(AuthConfig::from_optional(control_token(args.token.clone())))
        .with_restart_delay(Duration::from_millis(args.restart_delay_ms))
        .with_kill_timeout(Duration::from_millis(args.kill_timeout_ms));
    if let Some(count) = args.shared_processes {
        config = config.with_shared_processes(count);
    }
    if let Some(launcher) = &args.sandbox {
        config = config.with_sandbox(SandboxConfig::new(launcher).with_args(args.sandbox_args.clone()));
    }
    if let Some(program) = &args.worker_program {
        config = config.with_worker_program(program);
    }
    config
}

/// Runs a supervisor shard until interrupted, then stops every engine.
pub async fn run_supervisor(args: SupervisorArgs) -> Result<()> {
    let config = supervisor_config(&args);
    if !config.auth.requires_auth() {
        tracing::warn!("Control listener accepts unauthenticated connections");
    }
    tracing::info!(
        "Starting supervisor for shard {} with {} shared workers in {}",
        config.shard_id,
        config.shared_processes,
        config.root_dir.display()
    );

    let tenants: Arc<dyn TenantStore> = Arc::new(JsonTenantStore::new(&args.tenants));
    let auth = config.auth.clone();
    let handshake_timeout = config.handshake_timeout;
    let supervisor = if args.in_process {
        tracing::info!("Running workers in-process");
        ProcessSupervisor::new(config, Arc::new(InProcessLauncher::new(Arc::new(BasicEngineFactory))), tenants)
    } else {
        ProcessSupervisor::with_process_launcher(config, tenants)?
    };

    supervisor.start().await.context("failed to start shared workers")?;
    let listener = ControlListener::bind(&args.listen, supervisor.clone(), auth, handshake_timeout).await?;
    tracing::info!("Supervisor listening on {}", listener.local_addr()?);

    let status = (args.status_interval_secs > 0).then(|| {
        tokio::spawn(log_status(supervisor.clone(), Duration::from_secs(args.status_interval_secs)))
    });

    let outcome = tokio::select! {
        result = listener.run() => result.map_err(anyhow::Error::from),
        signal = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupted, stopping every engine");
            signal.map_err(anyhow::Error::from)
        }
    };

    if let Some(status) = status {
        status.abort();
    }
    supervisor.kill_all_users().await?;
    tracing::info!("Supervisor stopped");
    outcome
}

async fn log_status(supervisor: ProcessSupervisor, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let uses: Vec<String> = supervisor
            .shared_use_counts()
            .iter()
            .map(|count| count.map_or_else(|| "-".to_string(), |n| n.to_string()))
            .collect();
        tracing::info!(
            "{} workers, {} tenants running, shared use counts [{}]",
            supervisor.worker_count(),
            supervisor.running_tenants().len(),
            uses.join(", ")
        );
    }
}

/// Runs a worker process on the IPC channel inherited from the supervisor.
pub async fn run_worker(args: WorkerArgs) -> Result<()> {
    let kind = args.kind().map_err(|e| anyhow!(e))?;
    thingcloud_worker::run_worker(WorkerOptions {
        kind,
        root: PathBuf::from(args.root),
    })
    .await?;
    Ok(())
}

/// A lifecycle operation of `thingcloud ctl`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CtlAction {
    Start,
    Kill,
    Restart,
    Delete,
    ClearCache,
    RestartWithoutCache,
    IsRunning,
    ProcessId,
    Info,
    KillAll,
}

impl CtlAction {
    pub fn needs_tenant(self) -> bool {
        self != CtlAction::KillAll
    }
}

impl FromStr for CtlAction {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "start" => CtlAction::Start,
            "kill" => CtlAction::Kill,
            "restart" => CtlAction::Restart,
            "delete" => CtlAction::Delete,
            "clear-cache" => CtlAction::ClearCache,
            "restart-without-cache" => CtlAction::RestartWithoutCache,
            "is-running" => CtlAction::IsRunning,
            "process-id" => CtlAction::ProcessId,
            "info" => CtlAction::Info,
            "kill-all" => CtlAction::KillAll,
            other => bail!("unknown action '{}'", other),
        })
    }
}

/// Performs `action` through `manager` and returns what to print.
pub async fn perform(manager: &dyn EngineManager, action: CtlAction, tenant: Option<TenantId>) -> Result<Value> {
    let tenant = match (action.needs_tenant(), tenant) {
        (true, Some(tenant)) => tenant,
        (true, None) => bail!("this action needs a tenant id"),
        (false, _) => 0,
    };

    let result = match action {
        CtlAction::Start => manager.start_user(tenant).await.map(|_| Value::Null),
        CtlAction::Kill => manager.kill_user(tenant).await.map(|_| Value::Null),
        CtlAction::Restart => manager.restart_user(tenant).await.map(|_| Value::Null),
        CtlAction::Delete => manager.delete_user(tenant).await.map(|_| Value::Null),
        CtlAction::ClearCache => manager.clear_cache(tenant).await.map(|_| Value::Null),
        CtlAction::RestartWithoutCache => manager.restart_user_without_cache(tenant).await.map(|_| Value::Null),
        CtlAction::IsRunning => manager.is_running(tenant).await.map(|running| json!(running)),
        CtlAction::ProcessId => manager.get_process_id(tenant).await.map(|id| json!(id)),
        CtlAction::Info => match manager.get_engine(tenant).await {
            Ok(engine) => {
                let info = engine.engine().call("getInfo", vec![]).await;
                engine.close();
                info
            }
            Err(e) => Err(e),
        },
        CtlAction::KillAll => manager.kill_all_users().await.map(|_| Value::Null),
    };
    result.map_err(|e| anyhow!("{} ({})", e, e.code()))
}

/// Runs one `ctl` call and prints its result as JSON.
pub async fn run_ctl(args: CtlArgs) -> Result<()> {
    let action: CtlAction = args.action.parse()?;
    if args.shards.is_empty() {
        bail!("at least one --shard is required");
    }

    let mut config = ClientConfig::new(args.shards);
    if let Some(token) = control_token(args.token) {
        config = config.with_auth_token(token);
    }
    let manager = LocalEngineManager::new(config)?;
    manager.start().await?;

    let result = perform(&manager, action, args.tenant).await;
    manager.stop().await;

    println!("{}", serde_json::to_string(&result?)?);
    Ok(())
}
