use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use thingcloud_common::rpc::{Proxy, RpcChannel};
use thingcloud_common::TenantId;

use crate::engine::{Engine, EngineStubs};

/// Upper bound on waiting for the supervisor to acknowledge `engineRemoved`.
const DELEGATE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Opening,
    Running,
    Stopped,
}

struct HandleInner {
    state: EngineState,
    engine: Option<Arc<dyn Engine>>,
    stubs: Option<EngineStubs>,
    channels: Vec<RpcChannel>,
    delegate: Option<Proxy>,
    thingpedia: Option<Proxy>,
}

/// A tenant's engine as hosted by this worker.
///
/// A handle starts `Opening`. A kill can arrive before the engine finished
/// opening; it flips the handle to `Stopped` and the pending start notices
/// through [`set_running`](Self::set_running) returning `false`.
pub struct EngineHandle {
    tenant: TenantId,
    inner: Mutex<HandleInner>,
}

impl EngineHandle {
    pub fn new(tenant: TenantId, delegate: Option<Proxy>, thingpedia: Option<Proxy>) -> Arc<Self> {
        Arc::new(Self {
            tenant,
            inner: Mutex::new(HandleInner {
                state: EngineState::Opening,
                engine: None,
                stubs: None,
                channels: Vec::new(),
                delegate,
                thingpedia,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, HandleInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn tenant(&self) -> TenantId {
        self.tenant
    }

    pub fn state(&self) -> EngineState {
        self.lock().state
    }

    pub fn is_stopped(&self) -> bool {
        self.state() == EngineState::Stopped
    }

    /// Marks an opened engine as running. Returns `false` if the handle was
    /// stopped in the meantime; the caller then owns closing `engine`.
    pub fn set_running(&self, engine: Arc<dyn Engine>, stubs: EngineStubs) -> bool {
        let mut inner = self.lock();
        if inner.state == EngineState::Stopped {
            return false;
        }
        inner.state = EngineState::Running;
        inner.engine = Some(engine);
        inner.stubs = Some(stubs);
        true
    }

    /// Stubs of a running engine.
    pub fn stubs(&self) -> Option<EngineStubs> {
        let inner = self.lock();
        match inner.state {
            EngineState::Running => inner.stubs.clone(),
            _ => None,
        }
    }

    /// Tracks a direct channel until it closes or the engine stops.
    pub fn attach(self: &Arc<Self>, channel: RpcChannel) {
        {
            let mut inner = self.lock();
            if inner.state == EngineState::Stopped {
                drop(inner);
                channel.close();
                return;
            }
            inner.channels.push(channel.clone());
        }

        let handle = Arc::downgrade(self);
        tokio::spawn(async move {
            channel.closed().await;
            if let Some(handle) = handle.upgrade() {
                handle.lock().channels.retain(|c| !c.same_channel(&channel));
            }
        });
    }

    pub fn channel_count(&self) -> usize {
        self.lock().channels.len()
    }

    /// Stops the engine: closes it and every attached channel, tells the
    /// delegate, and releases the supervisor's proxies. Idempotent.
    pub async fn stop(&self) {
        let (engine, channels, delegate, thingpedia) = {
            let mut inner = self.lock();
            if inner.state == EngineState::Stopped {
                return;
            }
            inner.state = EngineState::Stopped;
            inner.stubs = None;
            (
                inner.engine.take(),
                std::mem::take(&mut inner.channels),
                inner.delegate.take(),
                inner.thingpedia.take(),
            )
        };

        if let Some(engine) = engine {
            if let Err(e) = engine.close().await {
                tracing::warn!("Failed to close engine for tenant {}: {}", self.tenant, e);
            }
        }

        for channel in channels {
            channel.close();
        }

        if let Some(delegate) = delegate {
            match tokio::time::timeout(DELEGATE_TIMEOUT, delegate.call("engineRemoved", vec![])).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => tracing::debug!("engineRemoved for tenant {} failed: {}", self.tenant, e),
                Err(_) => tracing::warn!("engineRemoved for tenant {} timed out", self.tenant),
            }
            delegate.release();
        }
        if let Some(thingpedia) = thingpedia {
            thingpedia.release();
        }

        tracing::info!("Engine for tenant {} stopped", self.tenant);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{EngineFactory, BasicEngineFactory};
    use crate::platform::Platform;
    use thingcloud_common::TenantConfig;
    use tokio::sync::mpsc;

    fn idle_channel() -> RpcChannel {
        let (tx, _rx) = mpsc::unbounded_channel();
        RpcChannel::new(tx)
    }

    #[tokio::test]
    async fn test_stop_before_running_refuses_engine() {
        let root = tempfile::tempdir().unwrap();
        let handle = EngineHandle::new(1, None, None);
        assert_eq!(handle.state(), EngineState::Opening);

        handle.stop().await;
        let engine = BasicEngineFactory
            .create(Platform::new(TenantConfig::new(1), root.path(), None))
            .unwrap();
        let stubs = EngineStubs::for_engine(&engine);
        assert!(!handle.set_running(engine, stubs));
        assert!(handle.stubs().is_none());
    }

    #[tokio::test]
    async fn test_stop_closes_attached_channels() {
        let root = tempfile::tempdir().unwrap();
        let handle = EngineHandle::new(2, None, None);
        let engine = BasicEngineFactory
            .create(Platform::new(TenantConfig::new(2), root.path(), None))
            .unwrap();
        engine.open().await.unwrap();
        let stubs = EngineStubs::for_engine(&engine);
        assert!(handle.set_running(engine, stubs));
        assert!(handle.stubs().is_some());

        let first = idle_channel();
        let second = idle_channel();
        handle.attach(first.clone());
        handle.attach(second.clone());
        assert_eq!(handle.channel_count(), 2);

        handle.stop().await;
        assert!(first.is_closed());
        assert!(second.is_closed());
        assert_eq!(handle.channel_count(), 0);

        // Attaching after stop closes right away.
        let late = idle_channel();
        handle.attach(late.clone());
        assert!(late.is_closed());
    }

    #[tokio::test]
    async fn test_closed_channel_is_detached() {
        let handle = EngineHandle::new(3, None, None);
        let channel = idle_channel();
        handle.attach(channel.clone());
        channel.close();
        for _ in 0..50 {
            if handle.channel_count() == 0 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(handle.channel_count(), 0);
    }
}
