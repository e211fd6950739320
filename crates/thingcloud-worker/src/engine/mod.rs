//! The engine seam.
//!
//! A worker does not know what an engine does; it only opens it, closes it
//! and hands its three RPC capabilities to whoever asks.

mod basic;

use std::sync::Arc;

use futures::future::BoxFuture;
use thingcloud_common::rpc::Stub;
use thingcloud_common::Result;

use crate::platform::Platform;

pub use basic::{BasicEngine, BasicEngineFactory};

/// A tenant's engine instance.
pub trait Engine: Send + Sync + 'static {
    fn open(&self) -> BoxFuture<'_, Result<()>>;

    fn close(&self) -> BoxFuture<'_, Result<()>>;

    fn engine_stub(self: Arc<Self>) -> Arc<dyn Stub>;

    fn websocket_stub(self: Arc<Self>) -> Arc<dyn Stub>;

    fn webhook_stub(self: Arc<Self>) -> Arc<dyn Stub>;
}

/// Builds engines for a worker.
pub trait EngineFactory: Send + Sync + 'static {
    fn create(&self, platform: Platform) -> Result<Arc<dyn Engine>>;
}

/// The RPC stubs of one engine, created once per engine so re-exports share ids.
#[derive(Clone)]
pub struct EngineStubs {
    pub engine: Arc<dyn Stub>,
    pub websocket: Arc<dyn Stub>,
    pub webhook: Arc<dyn Stub>,
}

impl EngineStubs {
    pub fn for_engine(engine: &Arc<dyn Engine>) -> Self {
        Self {
            engine: engine.clone().engine_stub(),
            websocket: engine.clone().websocket_stub(),
            webhook: engine.clone().webhook_stub(),
        }
    }
}
