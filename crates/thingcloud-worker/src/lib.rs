//! thingcloud worker process
//!
//! A worker hosts the engines of one tenant (dedicated) or of many tenants
//! (shared). It talks to its supervisor over an inherited Unix socket, serves
//! `runEngine` / `killEngine` through the RPC stub it registers at startup,
//! and accepts front-end connections handed over by the control plane.
//!
//! Any panic takes the whole process down: once a worker's runtime state is
//! suspect it must not keep serving the other tenants it hosts.

pub mod engine;
pub mod handle;
pub mod platform;
pub mod worker;

use std::path::PathBuf;
use std::sync::Arc;

use thingcloud_common::transport::IpcChannel;
use thingcloud_common::{Result, TenantId};

pub use engine::{BasicEngine, BasicEngineFactory, Engine, EngineFactory, EngineStubs};
pub use handle::{EngineHandle, EngineState};
pub use platform::Platform;
pub use worker::Worker;

/// Exit status of a worker that panicked.
pub const PANIC_EXIT_CODE: i32 = 101;

/// Whether a worker hosts many tenants or exactly one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerKind {
    Shared,
    Dedicated(TenantId),
}

/// Options of a worker process started by `thingcloud worker`.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub kind: WorkerKind,
    pub root: PathBuf,
}

/// Makes any panic terminate the process with [`PANIC_EXIT_CODE`].
pub fn install_panic_hook() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        tracing::error!("Worker panicked: {}", info);
        default_hook(info);
        std::process::exit(PANIC_EXIT_CODE);
    }));
}

/// Runs a worker on the IPC channel named by the environment, with the
/// built-in engine.
pub async fn run_worker(options: WorkerOptions) -> Result<()> {
    install_panic_hook();
    match options.kind {
        WorkerKind::Shared => tracing::info!("Starting shared worker in {}", options.root.display()),
        WorkerKind::Dedicated(tenant) => {
            tracing::info!("Starting dedicated worker for tenant {} in {}", tenant, options.root.display())
        }
    }

    let ipc = IpcChannel::from_env()?;
    let worker = Worker::new(options.root, Arc::new(BasicEngineFactory));
    worker.serve(ipc).await
}
