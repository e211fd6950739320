use std::fmt;
use std::os::fd::AsFd;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thingcloud_common::protocol::{WorkerMessage, WorkerProxy};
use thingcloud_common::rpc::RpcChannel;
use thingcloud_common::transport::{IpcMessage, IpcReceiver, IpcSender};
use thingcloud_common::{CloudError, Result, TenantId};
use tokio::sync::{mpsc, watch};

use crate::launcher::{LaunchSpec, ProcessHandle, WorkerLauncher};

/// Stable name of a worker process, reported by `getProcessId`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(String);

impl WorkerId {
    pub fn shared(serial: u64) -> Self {
        Self(format!("shared-{}", serial))
    }

    pub fn dedicated(tenant: TenantId) -> Self {
        Self(format!("tenant-{}", tenant))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Role of a worker: a shared pool slot or one tenant's own process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerKind {
    Shared(usize),
    Dedicated(TenantId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Launched; waiting for the worker to report ready.
    Starting,
    /// Serving requests.
    Ready,
    /// IPC gone or exit requested; waiting for the process to end.
    Dying,
    /// Process reaped.
    Dead,
}

/// Timeouts applied to one worker.
#[derive(Debug, Clone, Copy)]
pub struct ProcessTimeouts {
    /// Time to report ready after launch.
    pub startup: Duration,
    /// Time to exit after the IPC channel closed before a hard kill.
    pub kill: Duration,
}

/// Sent once per worker, after its process is gone.
pub struct WorkerEvent {
    pub worker: Arc<WorkerProcess>,
    pub status: Option<i32>,
}

/// A running worker as seen by the supervisor.
pub struct WorkerProcess {
    id: WorkerId,
    kind: WorkerKind,
    rpc: RpcChannel,
    proxy: OnceLock<WorkerProxy>,
    sender: IpcSender,
    handle: Arc<dyn ProcessHandle>,
    state: watch::Sender<WorkerState>,
    use_count: AtomicUsize,
    hard_killed: AtomicBool,
}

impl fmt::Debug for WorkerProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerProcess")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("state", &self.state())
            .field("pid", &self.handle.pid())
            .finish()
    }
}

impl WorkerProcess {
    /// Launches a worker and waits for it to report ready.
    ///
    /// The returned worker is watched by a monitor task which sends exactly
    /// one [`WorkerEvent`] on `events` once the process is gone.
    pub async fn spawn(
        launcher: &dyn WorkerLauncher,
        spec: LaunchSpec,
        timeouts: ProcessTimeouts,
        events: mpsc::UnboundedSender<WorkerEvent>,
    ) -> Result<Arc<Self>> {
        let launched = launcher.launch(&spec).await?;
        let (sender, mut receiver) = launched.ipc.split();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Value>();
        let worker = Arc::new(Self::starting(spec, RpcChannel::new(outbound_tx), sender, launched.handle));

        let ready_id = match tokio::time::timeout(timeouts.startup, wait_ready(&mut receiver)).await {
            Ok(Ok(id)) => id,
            Ok(Err(e)) => {
                tracing::warn!("Worker {} failed during startup: {}", worker.id, e);
                worker.abandon();
                return Err(e);
            }
            Err(_) => {
                tracing::warn!("Worker {} did not become ready within {:?}", worker.id, timeouts.startup);
                worker.hard_kill();
                worker.abandon();
                return Err(CloudError::Timeout(timeouts.startup.as_millis() as u64));
            }
        };
        worker.mark_ready(ready_id);

        let (id, rpc, sender) = (worker.id.clone(), worker.rpc.clone(), worker.sender.clone());
        tokio::spawn(async move {
            while let Some(data) = outbound_rx.recv().await {
                if let Err(e) = sender.send(&WorkerMessage::Rpc { data }).await {
                    tracing::debug!("IPC to worker {} failed: {}", id, e);
                    rpc.close();
                    break;
                }
            }
        });

        tokio::spawn(worker.clone().monitor(receiver, timeouts.kill, events));
        tracing::info!("Worker {} ready", worker.id);
        Ok(worker)
    }

    fn starting(spec: LaunchSpec, rpc: RpcChannel, sender: IpcSender, handle: Arc<dyn ProcessHandle>) -> Self {
        Self {
            id: spec.id,
            kind: spec.kind,
            rpc,
            proxy: OnceLock::new(),
            sender,
            handle,
            state: watch::channel(WorkerState::Starting).0,
            use_count: AtomicUsize::new(0),
            hard_killed: AtomicBool::new(false),
        }
    }

    /// Moves a starting worker to `Ready`, talking to the stub `ready_id`.
    fn mark_ready(&self, ready_id: String) {
        let _ = self.proxy.set(WorkerProxy::new(self.rpc.get_proxy(ready_id)));
        self.state.send_if_modified(|state| {
            let starting = *state == WorkerState::Starting;
            if starting {
                *state = WorkerState::Ready;
            }
            starting
        });
    }

    /// Gives up on a worker that never became ready; it is `Dead` once reaped.
    fn abandon(self: Arc<Self>) {
        self.state.send_replace(WorkerState::Dying);
        self.rpc.close();
        tokio::spawn(async move {
            let status = self.handle.wait().await;
            tracing::debug!("Reaped failed worker {} with status {:?}", self.id, status);
            self.state.send_replace(WorkerState::Dead);
        });
    }

    /// Funnels IPC close and process exit into one exit event.
    async fn monitor(
        self: Arc<Self>,
        mut receiver: IpcReceiver,
        kill_timeout: Duration,
        events: mpsc::UnboundedSender<WorkerEvent>,
    ) {
        let handle = self.handle.clone();
        let wait = handle.wait();
        tokio::pin!(wait);

        let exited = loop {
            tokio::select! {
                status = &mut wait => break Some(status),
                received = receiver.recv() => match received {
                    Ok(Some(IpcMessage { message: WorkerMessage::Rpc { data }, .. })) => self.rpc.dispatch(data),
                    Ok(Some(IpcMessage { message, .. })) => {
                        tracing::debug!("Ignoring {:?} from worker {}", message, self.id)
                    }
                    Ok(None) => break None,
                    Err(e) => {
                        tracing::warn!("IPC from worker {} failed: {}", self.id, e);
                        break None;
                    }
                },
            }
        };

        self.state.send_replace(WorkerState::Dying);
        self.rpc.close();

        let status = match exited {
            Some(status) => status,
            None => match tokio::time::timeout(kill_timeout, &mut wait).await {
                Ok(status) => status,
                Err(_) => {
                    tracing::warn!("Worker {} closed IPC but is still alive", self.id);
                    self.hard_kill();
                    wait.await
                }
            },
        };

        self.state.send_replace(WorkerState::Dead);
        let _ = events.send(WorkerEvent {
            worker: self.clone(),
            status,
        });
    }

    pub fn id(&self) -> &WorkerId {
        &self.id
    }

    pub fn kind(&self) -> WorkerKind {
        self.kind
    }

    pub fn pid(&self) -> Option<u32> {
        self.handle.pid()
    }

    pub fn rpc(&self) -> &RpcChannel {
        &self.rpc
    }

    /// The worker's stub; only available once it reported ready.
    pub fn proxy(&self) -> Result<&WorkerProxy> {
        self.proxy
            .get()
            .ok_or_else(|| CloudError::Spawn(format!("worker {} is not ready", self.id)))
    }

    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    #[cfg(test)]
    pub(crate) fn set_state(&self, state: WorkerState) {
        self.state.send_replace(state);
    }

    pub fn is_ready(&self) -> bool {
        self.state() == WorkerState::Ready
    }

    pub fn use_count(&self) -> usize {
        self.use_count.load(Ordering::SeqCst)
    }

    pub fn add_use(&self) {
        self.use_count.fetch_add(1, Ordering::SeqCst);
    }

    pub fn remove_use(&self) {
        let _ = self
            .use_count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }

    /// Kills the process. Only the first call signals it.
    pub fn hard_kill(&self) -> bool {
        if self.hard_killed.swap(true, Ordering::SeqCst) {
            return false;
        }
        tracing::warn!("Hard-killing worker {}", self.id);
        if let Err(e) = self.handle.hard_kill() {
            tracing::warn!("Failed to kill worker {}: {}", self.id, e);
        }
        true
    }

    pub fn was_hard_killed(&self) -> bool {
        self.hard_killed.load(Ordering::SeqCst)
    }

    /// Resolves once the process has been reaped.
    pub async fn dead(&self) {
        let mut state = self.state.subscribe();
        let _ = state.wait_for(|state| *state == WorkerState::Dead).await;
    }

    /// Asks the worker to exit, and kills it if it has not exited after
    /// `grace`. A kill is reported as [`CloudError::Timeout`] once the
    /// process is gone.
    pub async fn terminate(&self, grace: Duration) -> Result<()> {
        if self.state() == WorkerState::Dead {
            return Ok(());
        }
        if let Err(e) = self.sender.send(&WorkerMessage::Exit).await {
            tracing::debug!("Could not send exit to worker {}: {}", self.id, e);
        }
        self.state.send_if_modified(|state| {
            let live = matches!(*state, WorkerState::Starting | WorkerState::Ready);
            if live {
                *state = WorkerState::Dying;
            }
            live
        });

        if tokio::time::timeout(grace, self.dead()).await.is_ok() {
            return Ok(());
        }
        self.hard_kill();
        self.dead().await;
        Err(CloudError::Timeout(grace.as_millis() as u64))
    }

    /// Hands a front-end connection to the worker.
    pub async fn send_direct(
        &self,
        tenant: TenantId,
        reply_id: String,
        buffered: Vec<u8>,
        socket: impl AsFd,
    ) -> Result<()> {
        let message = WorkerMessage::Direct {
            target: tenant,
            reply_id,
            buffered,
        };
        self.sender.send_with_fd(&message, socket).await
    }
}

async fn wait_ready(receiver: &mut IpcReceiver) -> Result<String> {
    loop {
        match receiver.recv().await? {
            Some(IpcMessage {
                message: WorkerMessage::Ready { id },
                ..
            }) => return Ok(id),
            Some(IpcMessage { message, .. }) => {
                tracing::debug!("Ignoring {:?} before ready", message)
            }
            None => return Err(CloudError::Spawn("worker exited before ready".to_string())),
        }
    }
}
