//! Front-end access to tenant engines.
//!
//! An [`EngineManager`] hides where engines run. [`LocalEngineManager`]
//! talks to shards of process supervisors over their control endpoints;
//! [`ClusterEngineManager`] drives engines deployed as cluster resources.
//! Both hand out [`EngineRef`]s: direct RPC connections to a running engine,
//! memoized per tenant until the connection closes.

pub mod cluster;
pub mod config;
pub mod direct;
pub mod local;
pub mod manager;

pub use cluster::ClusterEngineManager;
pub use config::{ClientConfig, ClusterConfig, DEFAULT_RECONNECT_DELAY};
pub use direct::{connect_engine, connect_supervisor};
pub use local::LocalEngineManager;
pub use manager::{ClientEvent, EngineManager, EngineRef};
