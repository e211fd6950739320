#![allow(dead_code)]

use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::Value;
use thingcloud_common::protocol::{WorkerMessage, DIRECT_REPLY_METHODS};
use thingcloud_common::rpc::{RpcChannel, Stub};
use thingcloud_common::transport::{IpcChannel, IpcMessage};
use thingcloud_common::{Result, TenantConfig, TenantId};
use thingcloud_supervisor::{
    LaunchSpec, LaunchedWorker, MemoryTenantStore, ProcessHandle, ProcessSupervisor, SupervisorConfig, WorkerId,
    WorkerKind, WorkerLauncher,
};
use thingcloud_worker::{BasicEngineFactory, Worker};
use tokio::sync::{oneshot, watch};
use tokio::task::AbortHandle;

static NEXT_PID: AtomicU32 = AtomicU32::new(10_000);

/// A worker running as a task, reached through a relay that stands in for
/// the process boundary.
pub struct TaskHandle {
    pub id: WorkerId,
    pid: u32,
    worker: AbortHandle,
    relay: AbortHandle,
    exit: watch::Receiver<Option<Option<i32>>>,
    hard_kills: Arc<AtomicUsize>,
}

impl TaskHandle {
    /// Simulates a crash: the worker disappears without being asked.
    pub fn crash(&self) {
        self.worker.abort();
        self.relay.abort();
    }
}

impl ProcessHandle for TaskHandle {
    fn pid(&self) -> Option<u32> {
        Some(self.pid)
    }

    fn wait(&self) -> BoxFuture<'_, Option<i32>> {
        let mut exit = self.exit.clone();
        Box::pin(async move {
            match exit.wait_for(Option::is_some).await {
                Ok(status) => status.flatten(),
                Err(_) => None,
            }
        })
    }

    fn hard_kill(&self) -> Result<()> {
        self.hard_kills.fetch_add(1, Ordering::SeqCst);
        self.crash();
        Ok(())
    }
}

/// Launches workers as tasks of the test runtime.
#[derive(Default)]
pub struct TaskLauncher {
    stubborn: Mutex<HashSet<TenantId>>,
    launched: Mutex<Vec<Arc<TaskHandle>>>,
    pub hard_kills: Arc<AtomicUsize>,
    pub directs: Arc<AtomicUsize>,
}

impl TaskLauncher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Dedicated workers of `tenant` will never see `exit`.
    pub fn make_stubborn(&self, tenant: TenantId) {
        self.stubborn.lock().unwrap().insert(tenant);
    }

    pub fn handle(&self, id: &str) -> Arc<TaskHandle> {
        self.launched
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|handle| handle.id.as_str() == id)
            .cloned()
            .unwrap_or_else(|| panic!("no worker {}", id))
    }

    pub fn launch_count(&self) -> usize {
        self.launched.lock().unwrap().len()
    }

    /// Whether every worker launched so far has exited.
    pub fn all_exited(&self) -> bool {
        self.launched.lock().unwrap().iter().all(|handle| handle.exit.borrow().is_some())
    }

    fn start(&self, spec: &LaunchSpec) -> Result<LaunchedWorker> {
        let (supervisor_side, relay_outer) = IpcChannel::pair()?;
        let (relay_inner, worker_side) = IpcChannel::pair()?;

        let worker = Worker::new(spec.root.clone(), Arc::new(BasicEngineFactory));
        let (exit_tx, exit_rx) = watch::channel(None);
        let worker_task = tokio::spawn(worker.serve(worker_side));
        let worker_abort = worker_task.abort_handle();
        tokio::spawn(async move {
            let status = match worker_task.await {
                Ok(Ok(())) => Some(0),
                Ok(Err(_)) => Some(1),
                Err(_) => None,
            };
            exit_tx.send_replace(Some(status));
        });

        let drop_exit = match spec.kind {
            WorkerKind::Dedicated(tenant) => self.stubborn.lock().unwrap().contains(&tenant),
            WorkerKind::Shared(_) => false,
        };
        let directs = self.directs.clone();
        let relay = tokio::spawn(async move {
            let (outer_tx, mut outer_rx) = relay_outer.split();
            let (inner_tx, mut inner_rx) = relay_inner.split();
            loop {
                tokio::select! {
                    down = outer_rx.recv() => match down {
                        Ok(Some(IpcMessage { message: WorkerMessage::Exit, .. })) if drop_exit => {}
                        Ok(Some(IpcMessage { message, fd: Some(fd) })) => {
                            directs.fetch_add(1, Ordering::SeqCst);
                            if inner_tx.send_with_fd(&message, fd).await.is_err() {
                                break;
                            }
                        }
                        Ok(Some(IpcMessage { message, fd: None })) => {
                            if inner_tx.send(&message).await.is_err() {
                                break;
                            }
                        }
                        _ => break,
                    },
                    up = inner_rx.recv() => match up {
                        Ok(Some(IpcMessage { message, .. })) => {
                            if outer_tx.send(&message).await.is_err() {
                                break;
                            }
                        }
                        _ => break,
                    },
                }
            }
        });

        let handle = Arc::new(TaskHandle {
            id: spec.id.clone(),
            pid: NEXT_PID.fetch_add(1, Ordering::SeqCst),
            worker: worker_abort,
            relay: relay.abort_handle(),
            exit: exit_rx,
            hard_kills: self.hard_kills.clone(),
        });
        self.launched.lock().unwrap().push(handle.clone());
        Ok(LaunchedWorker {
            ipc: supervisor_side,
            handle,
        })
    }
}

impl WorkerLauncher for TaskLauncher {
    fn launch<'a>(&'a self, spec: &'a LaunchSpec) -> BoxFuture<'a, Result<LaunchedWorker>> {
        Box::pin(async move { self.start(spec) })
    }
}

pub fn test_config(root: &Path, shared: usize) -> SupervisorConfig {
    SupervisorConfig::new(root)
        .with_shared_processes(shared)
        .with_restart_delay(Duration::from_millis(50))
        .with_kill_timeout(Duration::from_millis(300))
        .with_startup_timeout(Duration::from_secs(5))
        .with_handshake_timeout(Duration::from_secs(5))
}

pub struct Harness {
    pub supervisor: ProcessSupervisor,
    pub launcher: Arc<TaskLauncher>,
    pub tenants: Arc<MemoryTenantStore>,
    pub root: tempfile::TempDir,
}

pub async fn start_supervisor(shared: usize, tenants: Vec<TenantConfig>) -> Harness {
    let root = tempfile::tempdir().unwrap();
    let launcher = TaskLauncher::new();
    let store = Arc::new(MemoryTenantStore::with_tenants(tenants));
    let supervisor = ProcessSupervisor::new(test_config(root.path(), shared), launcher.clone(), store.clone());
    supervisor.start().await.unwrap();
    Harness {
        supervisor,
        launcher,
        tenants: store,
        root,
    }
}

pub async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..300 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(check());
}

pub type ReplyResult = std::result::Result<Vec<Value>, String>;

/// The one-shot stub a front end passes along with `direct`.
pub struct Reply {
    tx: Mutex<Option<oneshot::Sender<(ReplyResult, RpcChannel)>>>,
}

impl Reply {
    pub fn new() -> (Arc<Self>, oneshot::Receiver<(ReplyResult, RpcChannel)>) {
        let (tx, rx) = oneshot::channel();
        (Arc::new(Self { tx: Mutex::new(Some(tx)) }), rx)
    }
}

impl Stub for Reply {
    fn methods(&self) -> &'static [&'static str] {
        DIRECT_REPLY_METHODS
    }

    fn invoke(self: Arc<Self>, method: String, args: Vec<Value>, channel: RpcChannel) -> BoxFuture<'static, Result<Value>> {
        Box::pin(async move {
            let outcome = match method.as_str() {
                "ready" => Ok(args),
                _ => Err(args.first().and_then(Value::as_str).unwrap_or_default().to_string()),
            };
            if let Some(tx) = self.tx.lock().unwrap().take() {
                let _ = tx.send((outcome, channel));
            }
            Ok(Value::Null)
        })
    }
}
