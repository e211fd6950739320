use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use futures::future::{join_all, BoxFuture};
use thingcloud_common::protocol::SupervisorProxy;
use thingcloud_common::shard::ShardMap;
use thingcloud_common::{CloudError, Result, TenantId};
use tokio::sync::{broadcast, oneshot, watch};
use tokio::task::JoinHandle;

use crate::config::ClientConfig;
use crate::direct::{connect_engine, connect_supervisor};
use crate::manager::{ClientEvent, EngineCache, EngineManager, EngineRef};

struct LocalInner {
    config: ClientConfig,
    shards: ShardMap,
    links: Vec<Mutex<Option<SupervisorProxy>>>,
    cache: Arc<EngineCache>,
    stop: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

/// Front end for shards of local-process supervisors.
///
/// Keeps one `master` connection per shard and reconnects when it drops.
/// While a shard is disconnected, calls for its tenants fail right away with
/// [`CloudError::SupervisorUnreachable`].
#[derive(Clone)]
pub struct LocalEngineManager {
    inner: Arc<LocalInner>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl LocalEngineManager {
    pub fn new(config: ClientConfig) -> Result<Self> {
        let shards = ShardMap::new(config.shards.clone())?;
        let links = (0..shards.len()).map(|_| Mutex::new(None)).collect();
        let (stop, _) = watch::channel(false);
        Ok(Self {
            inner: Arc::new(LocalInner {
                config,
                shards,
                links,
                cache: EngineCache::new(),
                stop,
                tasks: Mutex::new(Vec::new()),
                started: AtomicBool::new(false),
            }),
        })
    }

    pub fn shards(&self) -> &ShardMap {
        &self.inner.shards
    }

    /// Connects to every shard. Returns once each shard has been tried
    /// once; shards that could not be reached keep being retried.
    pub async fn start(&self) -> Result<()> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut first_attempts = Vec::new();
        for shard in 0..self.inner.shards.len() {
            let (tx, rx) = oneshot::channel();
            first_attempts.push(rx);
            let task = tokio::spawn(maintain_link(self.inner.clone(), shard, tx));
            lock(&self.inner.tasks).push(task);
        }
        join_all(first_attempts).await;
        Ok(())
    }

    /// Stops reconnecting and closes every connection.
    pub async fn stop(&self) {
        self.inner.stop.send_replace(true);
        for link in &self.inner.links {
            if let Some(proxy) = lock(link).take() {
                proxy.proxy().channel().close();
            }
        }
        self.inner.cache.close_all();
        let tasks: Vec<_> = lock(&self.inner.tasks).drain(..).collect();
        join_all(tasks).await;
    }

    /// Whether the control connection of `shard` is up.
    pub fn is_connected(&self, shard: usize) -> bool {
        self.inner
            .links
            .get(shard)
            .is_some_and(|link| lock(link).as_ref().is_some_and(|p| !p.proxy().channel().is_closed()))
    }

    fn supervisor_at(&self, shard: usize) -> Result<SupervisorProxy> {
        let link = self.inner.links.get(shard).ok_or(CloudError::InvalidShard {
            shard,
            count: self.inner.links.len(),
        })?;
        match lock(link).as_ref() {
            Some(proxy) if !proxy.proxy().channel().is_closed() => Ok(proxy.clone()),
            _ => Err(CloudError::SupervisorUnreachable(shard)),
        }
    }

    fn supervisor_for(&self, tenant: TenantId) -> Result<SupervisorProxy> {
        self.supervisor_at(self.inner.shards.shard_for(tenant))
    }
}

async fn maintain_link(inner: Arc<LocalInner>, shard: usize, first: oneshot::Sender<()>) {
    let mut first = Some(first);
    let mut stop = inner.stop.subscribe();
    let address = match inner.shards.address(shard) {
        Ok(address) => address.to_string(),
        Err(e) => {
            tracing::error!("{}", e);
            return;
        }
    };

    while !*stop.borrow() {
        match connect_supervisor(&address, inner.config.auth_token.as_deref(), inner.config.connect_timeout).await {
            Ok(proxy) => {
                tracing::info!("Connected to supervisor for shard {} at {}", shard, address);
                let channel = proxy.proxy().channel().clone();
                *lock(&inner.links[shard]) = Some(proxy);
                if let Some(first) = first.take() {
                    let _ = first.send(());
                }

                tokio::select! {
                    _ = channel.closed() => {
                        tracing::warn!("Lost connection to supervisor for shard {}", shard);
                    }
                    _ = stop.wait_for(|stopped| *stopped) => {}
                }
                lock(&inner.links[shard]).take();
                channel.close();
            }
            Err(e) => {
                tracing::warn!("Cannot reach supervisor for shard {} at {}: {}", shard, address, e);
                if let Some(first) = first.take() {
                    let _ = first.send(());
                }
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(inner.config.reconnect_delay) => {}
            _ = stop.wait_for(|stopped| *stopped) => {}
        }
    }
}

impl EngineManager for LocalEngineManager {
    fn get_engine(&self, tenant: TenantId) -> BoxFuture<'_, Result<EngineRef>> {
        Box::pin(async move {
            // A cached engine keeps its own connection; only a new one needs
            // the shard to be up.
            if !self.inner.cache.contains(tenant) {
                self.supervisor_for(tenant)?;
            }
            let address = self.inner.shards.address_for(tenant).to_string();
            let token = self.inner.config.auth_token.clone();
            let timeout = self.inner.config.connect_timeout;
            self.inner
                .cache
                .get_or_connect(tenant, move || {
                    Box::pin(async move { connect_engine(&address, tenant, token.as_deref(), timeout).await })
                })
                .await
        })
    }

    fn start_user(&self, tenant: TenantId) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move { self.supervisor_for(tenant)?.start_user(tenant).await })
    }

    fn kill_user(&self, tenant: TenantId) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let result = self.supervisor_for(tenant)?.kill_user(tenant).await;
            self.inner.cache.close(tenant);
            result
        })
    }

    fn restart_user(&self, tenant: TenantId) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let supervisor = self.supervisor_for(tenant)?;
            self.inner.cache.close(tenant);
            supervisor.restart_user(tenant).await
        })
    }

    fn delete_user(&self, tenant: TenantId) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let result = self.supervisor_for(tenant)?.delete_user(tenant).await;
            self.inner.cache.close(tenant);
            result
        })
    }

    fn clear_cache(&self, tenant: TenantId) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move { self.supervisor_for(tenant)?.clear_cache(tenant).await })
    }

    fn restart_user_without_cache(&self, tenant: TenantId) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let supervisor = self.supervisor_for(tenant)?;
            self.inner.cache.close(tenant);
            supervisor.restart_user_without_cache(tenant).await
        })
    }

    fn is_running(&self, tenant: TenantId) -> BoxFuture<'_, Result<bool>> {
        Box::pin(async move { self.supervisor_for(tenant)?.is_running(tenant).await })
    }

    fn get_process_id(&self, tenant: TenantId) -> BoxFuture<'_, Result<Option<String>>> {
        Box::pin(async move { self.supervisor_for(tenant)?.get_process_id(tenant).await })
    }

    fn kill_all_users(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let supervisors = (0..self.inner.shards.len())
                .map(|shard| self.supervisor_at(shard))
                .collect::<Result<Vec<_>>>()?;
            let results = join_all(supervisors.iter().map(|supervisor| supervisor.kill_all_users())).await;
            self.inner.cache.close_all();
            results.into_iter().collect()
        })
    }

    fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.inner.cache.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use thingcloud_common::rpc::RpcChannel;

    #[test]
    fn test_requires_a_shard() {
        assert!(matches!(
            LocalEngineManager::new(ClientConfig::new(vec![])),
            Err(CloudError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_unreachable_shard_fails_fast() {
        // Nothing listens on port 9 of the loopback interface.
        let config = ClientConfig::new(vec!["127.0.0.1:9".to_string()])
            .with_reconnect_delay(std::time::Duration::from_secs(60));
        let manager = LocalEngineManager::new(config).unwrap();
        manager.start().await.unwrap();
        assert!(!manager.is_connected(0));

        let err = manager.start_user(3).await.unwrap_err();
        assert_eq!(err.to_string(), "Supervisor for shard 0 is unreachable");
        assert!(matches!(manager.get_engine(3).await, Err(CloudError::SupervisorUnreachable(0))));

        manager.stop().await;
    }

    #[tokio::test]
    async fn test_cached_engine_outlives_supervisor_link() {
        let config = ClientConfig::new(vec!["127.0.0.1:9".to_string()])
            .with_reconnect_delay(std::time::Duration::from_secs(60));
        let manager = LocalEngineManager::new(config).unwrap();
        manager.start().await.unwrap();

        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let channel = RpcChannel::new(tx);
        let engine = EngineRef::new(
            3,
            channel.clone(),
            channel.get_proxy("engine"),
            channel.get_proxy("websocket"),
            channel.get_proxy("webhook"),
        );
        manager
            .inner
            .cache
            .get_or_connect(3, move || Box::pin(async move { Ok(engine) }))
            .await
            .unwrap();

        assert!(!manager.is_connected(0));
        let cached = manager.get_engine(3).await.unwrap();
        assert!(cached.channel().same_channel(&channel));
        assert!(matches!(manager.get_engine(4).await, Err(CloudError::SupervisorUnreachable(0))));

        manager.stop().await;
    }
}
