use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use thingcloud_common::transport::IpcChannel;
use thingcloud_common::Result;
use thingcloud_worker::{EngineFactory, Worker};
use tokio::sync::watch;
use tokio::task::AbortHandle;

use crate::launcher::{LaunchSpec, LaunchedWorker, ProcessHandle, WorkerLauncher};

// Pseudo PIDs, far above anything the kernel hands out by default.
static NEXT_TASK_ID: AtomicU32 = AtomicU32::new(4_000_000);

/// Runs workers as tasks of the supervisor's own runtime, connected over a
/// real Unix socket pair. Meant for development and tests: a crashing
/// engine takes the supervisor down with it.
pub struct InProcessLauncher {
    factory: Arc<dyn EngineFactory>,
}

impl InProcessLauncher {
    pub fn new(factory: Arc<dyn EngineFactory>) -> Self {
        Self { factory }
    }
}

impl WorkerLauncher for InProcessLauncher {
    fn launch<'a>(&'a self, spec: &'a LaunchSpec) -> BoxFuture<'a, Result<LaunchedWorker>> {
        Box::pin(async move {
            let (supervisor_side, worker_side) = IpcChannel::pair()?;
            let worker = Worker::new(spec.root.clone(), self.factory.clone());
            let task = tokio::spawn(worker.serve(worker_side));
            let abort = task.abort_handle();

            let (exit_tx, exit_rx) = watch::channel(None);
            let id = spec.id.clone();
            tokio::spawn(async move {
                let status = match task.await {
                    Ok(Ok(())) => Some(0),
                    Ok(Err(e)) => {
                        tracing::warn!("In-process worker {} failed: {}", id, e);
                        Some(1)
                    }
                    Err(_) => None,
                };
                exit_tx.send_replace(Some(status));
            });

            let pid = NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed);
            tracing::debug!("Started in-process worker {} as task {}", spec.id, pid);
            Ok(LaunchedWorker {
                ipc: supervisor_side,
                handle: Arc::new(TaskHandle {
                    pid,
                    abort,
                    exit: exit_rx,
                }),
            })
        })
    }
}

struct TaskHandle {
    pid: u32,
    abort: AbortHandle,
    exit: watch::Receiver<Option<Option<i32>>>,
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
        self.abort.abort();
        Ok(())
    }
}
