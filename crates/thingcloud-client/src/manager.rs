use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use futures::future::{BoxFuture, FutureExt, Shared};
use thingcloud_common::rpc::{Proxy, RpcChannel};
use thingcloud_common::{CloudError, Result, TenantId};
use tokio::sync::broadcast;

const EVENT_CAPACITY: usize = 64;

/// Notifications from an [`EngineManager`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// The direct connection to the tenant's engine closed.
    SocketClosed(TenantId),
}

/// A connected engine and its capabilities.
#[derive(Clone)]
pub struct EngineRef {
    tenant: TenantId,
    channel: RpcChannel,
    engine: Proxy,
    websocket: Proxy,
    webhook: Proxy,
}

impl EngineRef {
    pub fn new(tenant: TenantId, channel: RpcChannel, engine: Proxy, websocket: Proxy, webhook: Proxy) -> Self {
        Self {
            tenant,
            channel,
            engine,
            websocket,
            webhook,
        }
    }

    pub fn tenant(&self) -> TenantId {
        self.tenant
    }

    pub fn engine(&self) -> &Proxy {
        &self.engine
    }

    pub fn websocket(&self) -> &Proxy {
        &self.websocket
    }

    pub fn webhook(&self) -> &Proxy {
        &self.webhook
    }

    pub fn channel(&self) -> &RpcChannel {
        &self.channel
    }

    pub fn is_closed(&self) -> bool {
        self.channel.is_closed()
    }

    pub fn close(&self) {
        self.channel.close();
    }
}

impl fmt::Debug for EngineRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineRef")
            .field("tenant", &self.tenant)
            .field("engine", &self.engine)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Front-end view of tenant engines, whatever hosts them.
pub trait EngineManager: Send + Sync {
    /// A connection to the tenant's running engine. Concurrent callers share
    /// one connection attempt; the result is reused until the connection
    /// closes.
    fn get_engine(&self, tenant: TenantId) -> BoxFuture<'_, Result<EngineRef>>;
    fn start_user(&self, tenant: TenantId) -> BoxFuture<'_, Result<()>>;
    fn kill_user(&self, tenant: TenantId) -> BoxFuture<'_, Result<()>>;
    fn restart_user(&self, tenant: TenantId) -> BoxFuture<'_, Result<()>>;
    fn delete_user(&self, tenant: TenantId) -> BoxFuture<'_, Result<()>>;
    fn clear_cache(&self, tenant: TenantId) -> BoxFuture<'_, Result<()>>;
    fn restart_user_without_cache(&self, tenant: TenantId) -> BoxFuture<'_, Result<()>>;
    fn is_running(&self, tenant: TenantId) -> BoxFuture<'_, Result<bool>>;
    fn get_process_id(&self, tenant: TenantId) -> BoxFuture<'_, Result<Option<String>>>;
    fn kill_all_users(&self) -> BoxFuture<'_, Result<()>>;
    fn subscribe(&self) -> broadcast::Receiver<ClientEvent>;
}

type EngineFuture = Shared<BoxFuture<'static, std::result::Result<EngineRef, Arc<CloudError>>>>;

struct CacheEntry {
    serial: u64,
    engine: EngineFuture,
}

/// Memoized engine connections, one per tenant.
pub(crate) struct EngineCache {
    entries: Mutex<HashMap<TenantId, CacheEntry>>,
    next_serial: AtomicU64,
    events: broadcast::Sender<ClientEvent>,
}

impl EngineCache {
    pub(crate) fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Arc::new(Self {
            entries: Mutex::new(HashMap::new()),
            next_serial: AtomicU64::new(0),
            events,
        })
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<TenantId, CacheEntry>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    /// Returns the cached engine for `tenant`, connecting with `connect` if
    /// there is none. A failed attempt is not cached.
    pub(crate) async fn get_or_connect<F>(self: &Arc<Self>, tenant: TenantId, connect: F) -> Result<EngineRef>
    where
        F: FnOnce() -> BoxFuture<'static, Result<EngineRef>>,
    {
        let engine = {
            let mut entries = self.entries();
            match entries.get(&tenant) {
                Some(entry) => entry.engine.clone(),
                None => {
                    let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);
                    let engine = watch_engine(Arc::downgrade(self), tenant, serial, connect())
                        .boxed()
                        .shared();
                    entries.insert(
                        tenant,
                        CacheEntry {
                            serial,
                            engine: engine.clone(),
                        },
                    );
                    engine
                }
            }
        };
        engine.await.map_err(CloudError::Shared)
    }

    fn evict(&self, tenant: TenantId, serial: u64) -> bool {
        let mut entries = self.entries();
        if entries.get(&tenant).is_some_and(|entry| entry.serial == serial) {
            entries.remove(&tenant);
            true
        } else {
            false
        }
    }

    /// Drops the tenant's engine, closing its connection if it was open.
    pub(crate) fn close(&self, tenant: TenantId) {
        let entry = self.entries().remove(&tenant);
        if let Some(Some(Ok(engine))) = entry.map(|entry| entry.engine.peek().cloned()) {
            engine.close();
        }
    }

    pub(crate) fn close_all(&self) {
        let entries: Vec<_> = self.entries().drain().map(|(_, entry)| entry).collect();
        for entry in entries {
            if let Some(Ok(engine)) = entry.engine.peek() {
                engine.close();
            }
        }
    }

    pub(crate) fn contains(&self, tenant: TenantId) -> bool {
        self.entries().contains_key(&tenant)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries().len()
    }
}

async fn watch_engine(
    cache: Weak<EngineCache>,
    tenant: TenantId,
    serial: u64,
    connect: BoxFuture<'static, Result<EngineRef>>,
) -> std::result::Result<EngineRef, Arc<CloudError>> {
    match connect.await {
        Ok(engine) => {
            let channel = engine.channel().clone();
            tokio::spawn(async move {
                channel.closed().await;
                if let Some(cache) = cache.upgrade() {
                    cache.evict(tenant, serial);
                    tracing::debug!("Connection to engine of tenant {} closed", tenant);
                    let _ = cache.events.send(ClientEvent::SocketClosed(tenant));
                }
            });
            Ok(engine)
        }
        Err(e) => {
            if let Some(cache) = cache.upgrade() {
                cache.evict(tenant, serial);
            }
            Err(Arc::new(e))
        }
    }
}
