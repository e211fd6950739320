//! thingcloud common types and transport
//!
//! Shared building blocks of the thingcloud control plane, used by the
//! worker, supervisor, client and CLI crates:
//!
//! - [`transport`]: newline-delimited JSON framing, the worker IPC channel
//!   (with socket descriptor passing) and a TCP connect helper
//! - [`rpc`]: bidirectional stub/proxy RPC over framed JSON
//! - [`protocol`]: control, IPC and tenant wire types plus method tables
//! - [`lock`]: per-tenant FIFO locks
//! - [`shard`]: tenant → shard routing
//! - [`auth`]: control-plane shared token
//!
//! # Wire format
//!
//! Every connection carries UTF-8 JSON values, one per line. Control sockets
//! start with `{"control": ...}` frames, RPC traffic uses `{"rpc": ...}`
//! frames, and the supervisor ↔ worker channel wraps everything in
//! `{"type": ...}` envelopes.

pub mod auth;
pub mod error;
pub mod lock;
pub mod protocol;
pub mod rpc;
pub mod shard;
pub mod transport;

pub use error::{CloudError, Result};
pub use protocol::{TenantConfig, TenantId};
