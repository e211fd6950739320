//! Wire types shared by every component.
//!
//! - [`control`]: first frames on a control-plane connection
//! - [`worker`]: supervisor ↔ worker IPC envelope
//! - [`tenant`]: tenant configuration records
//! - [`supervisor`]: RPC method names and typed proxies

pub mod control;
pub mod supervisor;
pub mod tenant;
pub mod worker;

pub use control::{ControlFrame, ErrorFrame};
pub use supervisor::{
    SupervisorProxy, WorkerProxy, DELEGATE_METHODS, DIRECT_REPLY_METHODS, ENGINE_METHODS,
    SUPERVISOR_METHODS, THINGPEDIA_METHODS, WEBHOOK_METHODS, WEBSOCKET_METHODS, WORKER_METHODS,
};
pub use tenant::{cache_dir, tenant_dir, TenantConfig, TenantId};
pub use worker::WorkerMessage;
