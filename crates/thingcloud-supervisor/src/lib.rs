//! thingcloud supervisor
//!
//! One supervisor runs per shard. It owns a pool of shared worker processes
//! plus one dedicated process per isolated tenant, keeps the map from tenant
//! to hosting worker, and restarts shared workers that crash. Front ends
//! reach it through the [`ControlListener`]: as a `master` RPC client driving
//! tenant lifecycles, or with `direct` connections that are passed straight
//! to the worker hosting a tenant.

pub mod config;
pub mod inprocess;
pub mod launcher;
pub mod listener;
pub mod pool;
pub mod process;
pub mod stub;
pub mod supervisor;
pub mod tenants;

pub use config::{SandboxConfig, SupervisorConfig};
pub use inprocess::InProcessLauncher;
pub use launcher::{ChildHandle, LaunchSpec, LaunchedWorker, ProcessHandle, ProcessLauncher, WorkerLauncher, SANDBOX_FD_ENV};
pub use listener::ControlListener;
pub use process::{WorkerEvent, WorkerId, WorkerKind, WorkerProcess, WorkerState};
pub use stub::SupervisorStub;
pub use supervisor::ProcessSupervisor;
pub use tenants::{JsonTenantStore, MemoryTenantStore, TenantStore};
