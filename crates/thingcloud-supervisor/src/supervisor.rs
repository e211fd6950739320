use std::collections::{HashMap, HashSet};
use std::os::fd::AsFd;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use futures::future::{join_all, try_join_all};
use thingcloud_common::lock::KeyedLock;
use thingcloud_common::protocol::{cache_dir, tenant_dir};
use thingcloud_common::rpc::Proxy;
use thingcloud_common::{CloudError, Result, TenantId};
use tokio::sync::{mpsc, watch};

use crate::config::SupervisorConfig;
use crate::launcher::{LaunchSpec, ProcessLauncher, WorkerLauncher};
use crate::pool::SharedPool;
use crate::process::{ProcessTimeouts, WorkerEvent, WorkerId, WorkerKind, WorkerProcess};
use crate::stub::{EngineDelegateStub, ThingpediaClientStub};
use crate::tenants::TenantStore;

/// A tenant's engine and the worker hosting it.
struct Assignment {
    worker: Arc<WorkerProcess>,
    engine: Proxy,
    generation: u64,
}

struct SupervisorState {
    pool: SharedPool,
    dedicated: HashMap<TenantId, Arc<WorkerProcess>>,
    assignments: HashMap<TenantId, Assignment>,
    // Tenants evicted by a shared worker crash, to be started again once the
    // replacement is up. A kill in the meantime cancels the restart.
    pending_restart: HashSet<TenantId>,
}

impl SupervisorState {
    /// Removes the tenant's assignment and the bookkeeping that goes with it.
    fn take_assignment(&mut self, tenant: TenantId) -> Option<Assignment> {
        let assignment = self.assignments.remove(&tenant)?;
        match assignment.worker.kind() {
            WorkerKind::Shared(_) => assignment.worker.remove_use(),
            WorkerKind::Dedicated(_) => self.forget_dedicated(tenant, &assignment.worker),
        }
        Some(assignment)
    }

    fn forget_dedicated(&mut self, tenant: TenantId, worker: &Arc<WorkerProcess>) {
        if self.dedicated.get(&tenant).is_some_and(|w| Arc::ptr_eq(w, worker)) {
            self.dedicated.remove(&tenant);
        }
    }
}

struct SupervisorInner {
    config: SupervisorConfig,
    launcher: Arc<dyn WorkerLauncher>,
    tenants: Arc<dyn TenantStore>,
    locks: KeyedLock<TenantId>,
    state: Mutex<SupervisorState>,
    events_tx: mpsc::UnboundedSender<WorkerEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<WorkerEvent>>>,
    generation: AtomicU64,
    shared_serial: AtomicU64,
    shutting_down: AtomicBool,
    // Number of tenant starts in progress.
    starts: watch::Sender<usize>,
}

/// Holds a slot in the in-progress start count until dropped.
struct StartInProgress<'a>(&'a watch::Sender<usize>);

impl<'a> StartInProgress<'a> {
    fn enter(starts: &'a watch::Sender<usize>) -> Self {
        starts.send_modify(|n| *n += 1);
        Self(starts)
    }
}

impl Drop for StartInProgress<'_> {
    fn drop(&mut self) {
        self.0.send_modify(|n| *n = n.saturating_sub(1));
    }
}

fn shutting_down_error() -> CloudError {
    CloudError::Spawn("supervisor is shutting down".to_string())
}

/// Owns the worker processes of one shard and the tenant → worker map.
///
/// Every lifecycle operation on a tenant runs under that tenant's lock, so
/// operations on one tenant happen one at a time in arrival order while
/// different tenants proceed in parallel. Cloning is cheap.
#[derive(Clone)]
pub struct ProcessSupervisor {
    inner: Arc<SupervisorInner>,
}

/// Non-owning handle held by stubs exported to workers.
#[derive(Clone)]
pub(crate) struct WeakSupervisor(Weak<SupervisorInner>);

impl WeakSupervisor {
    #[cfg(test)]
    pub(crate) fn dangling() -> Self {
        Self(Weak::new())
    }

    pub(crate) fn upgrade(&self) -> Option<ProcessSupervisor> {
        self.0.upgrade().map(|inner| ProcessSupervisor { inner })
    }
}

fn is_not_found(e: &std::io::Error) -> bool {
    e.kind() == std::io::ErrorKind::NotFound
}

async fn remove_dir(path: &Path) -> Result<()> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(e) if is_not_found(&e) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

impl ProcessSupervisor {
    pub fn new(config: SupervisorConfig, launcher: Arc<dyn WorkerLauncher>, tenants: Arc<dyn TenantStore>) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(SupervisorInner {
                state: Mutex::new(SupervisorState {
                    pool: SharedPool::new(config.shared_processes),
                    dedicated: HashMap::new(),
                    assignments: HashMap::new(),
                    pending_restart: HashSet::new(),
                }),
                config,
                launcher,
                tenants,
                locks: KeyedLock::new(),
                events_tx,
                events_rx: Mutex::new(Some(events_rx)),
                generation: AtomicU64::new(0),
                shared_serial: AtomicU64::new(0),
                shutting_down: AtomicBool::new(false),
                starts: watch::channel(0).0,
            }),
        }
    }

    /// A supervisor launching real worker processes.
    pub fn with_process_launcher(config: SupervisorConfig, tenants: Arc<dyn TenantStore>) -> Result<Self> {
        let launcher = Arc::new(ProcessLauncher::from_config(&config)?);
        Ok(Self::new(config, launcher, tenants))
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.inner.config
    }

    pub(crate) fn downgrade(&self) -> WeakSupervisor {
        WeakSupervisor(Arc::downgrade(&self.inner))
    }

    fn state(&self) -> MutexGuard<'_, SupervisorState> {
        self.inner.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn root(&self) -> &Path {
        &self.inner.config.root_dir
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::SeqCst)
    }

    /// Starts the shared pool and every tenant marked running.
    ///
    /// Failing to start a shared worker is fatal; failing to start a tenant
    /// is only logged.
    pub async fn start(&self) -> Result<()> {
        let events = self
            .inner
            .events_rx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
            .ok_or_else(|| CloudError::Config("supervisor already started".to_string()))?;
        tokio::spawn(run_event_loop(self.downgrade(), events));

        tracing::info!(
            "Shard {}: starting {} shared workers",
            self.inner.config.shard_id,
            self.inner.config.shared_processes
        );
        let workers = try_join_all(
            (0..self.inner.config.shared_processes).map(|slot| self.spawn_worker(WorkerKind::Shared(slot))),
        )
        .await?;
        {
            let mut state = self.state();
            for (slot, worker) in workers.into_iter().enumerate() {
                state.pool.set(slot, worker);
            }
        }

        let running = self.inner.tenants.running_tenants().await?;
        tracing::info!("Shard {}: starting {} tenants", self.inner.config.shard_id, running.len());
        join_all(running.into_iter().map(|tenant| async move {
            if let Err(e) = self.start_user(tenant).await {
                tracing::warn!("Failed to start tenant {}: {}", tenant, e);
            }
        }))
        .await;
        Ok(())
    }

    async fn spawn_worker(&self, kind: WorkerKind) -> Result<Arc<WorkerProcess>> {
        let id = match kind {
            WorkerKind::Shared(_) => WorkerId::shared(self.inner.shared_serial.fetch_add(1, Ordering::SeqCst)),
            WorkerKind::Dedicated(tenant) => WorkerId::dedicated(tenant),
        };
        let spec = LaunchSpec {
            id,
            kind,
            root: self.inner.config.root_dir.clone(),
        };
        let timeouts = ProcessTimeouts {
            startup: self.inner.config.startup_timeout,
            kill: self.inner.config.kill_timeout,
        };
        WorkerProcess::spawn(&*self.inner.launcher, spec, timeouts, self.inner.events_tx.clone()).await
    }

    /// Starts the tenant's engine unless it is already running.
    pub async fn start_user(&self, tenant: TenantId) -> Result<()> {
        let _guard = self.inner.locks.acquire(tenant).await;
        self.start_user_locked(tenant).await
    }

    async fn start_user_locked(&self, tenant: TenantId) -> Result<()> {
        {
            let mut state = self.state();
            state.pending_restart.remove(&tenant);
            if state.assignments.contains_key(&tenant) {
                tracing::debug!("Tenant {} is already running", tenant);
                return Ok(());
            }
        }
        if self.is_shutting_down() {
            return Err(shutting_down_error());
        }
        let _in_progress = StartInProgress::enter(&self.inner.starts);

        let config = self.inner.tenants.get(tenant).await?;
        let worker = if config.needs_dedicated_process() {
            let worker = self.spawn_worker(WorkerKind::Dedicated(tenant)).await?;
            // kill_all_users drains the map after raising the flag, so the
            // flag is read under the same lock as the insert.
            let accepted = {
                let mut state = self.state();
                let accepted = !self.is_shutting_down();
                if accepted {
                    state.dedicated.insert(tenant, worker.clone());
                }
                accepted
            };
            if !accepted {
                tracing::info!("Shutting down, dropping new worker {}", worker.id());
                if let Err(e) = worker.terminate(self.inner.config.kill_timeout).await {
                    tracing::warn!("Worker {}: {}", worker.id(), e);
                }
                return Err(shutting_down_error());
            }
            worker
        } else {
            let worker = self
                .state()
                .pool
                .next_worker()
                .ok_or_else(|| CloudError::Spawn("no shared worker available".to_string()))?;
            worker.add_use();
            worker
        };

        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let channel = worker.rpc();
        let thingpedia = channel.export(Arc::new(ThingpediaClientStub::new(config.clone())));
        let delegate = channel.export(Arc::new(EngineDelegateStub::new(self.downgrade(), tenant, generation)));

        tracing::info!("Starting tenant {} on worker {}", tenant, worker.id());
        let started = match worker.proxy() {
            Ok(proxy) => proxy.run_engine(&config, thingpedia, delegate).await,
            Err(e) => Err(e),
        };
        let engine = match started {
            Ok(engine) => engine,
            Err(e) => {
                tracing::warn!("Tenant {} failed to start on worker {}: {}", tenant, worker.id(), e);
                self.roll_back_start(tenant, &worker).await;
                return Err(e);
            }
        };

        // Checked under the state lock so that a worker exit or a shutdown
        // is either seen here or evicts the new assignment.
        let rejected = {
            let mut state = self.state();
            if self.is_shutting_down() {
                Some((engine, shutting_down_error()))
            } else if worker.is_ready() {
                state.assignments.insert(
                    tenant,
                    Assignment {
                        worker: worker.clone(),
                        engine,
                        generation,
                    },
                );
                None
            } else {
                Some((engine, CloudError::ChannelClosed))
            }
        };
        if let Some((engine, e)) = rejected {
            tracing::warn!("Tenant {} not started on worker {}: {}", tenant, worker.id(), e);
            engine.release();
            self.roll_back_start(tenant, &worker).await;
            return Err(e);
        }
        Ok(())
    }

    async fn roll_back_start(&self, tenant: TenantId, worker: &Arc<WorkerProcess>) {
        match worker.kind() {
            WorkerKind::Shared(_) => worker.remove_use(),
            WorkerKind::Dedicated(_) => {
                self.state().forget_dedicated(tenant, worker);
                if let Err(e) = worker.terminate(self.inner.config.kill_timeout).await {
                    tracing::warn!("Worker {} for tenant {}: {}", worker.id(), tenant, e);
                }
            }
        }
    }

    /// Stops the tenant's engine. Stopping a tenant that is not running succeeds.
    pub async fn kill_user(&self, tenant: TenantId) -> Result<()> {
        let _guard = self.inner.locks.acquire(tenant).await;
        self.kill_user_locked(tenant).await
    }

    async fn kill_user_locked(&self, tenant: TenantId) -> Result<()> {
        let assignment = {
            let mut state = self.state();
            state.pending_restart.remove(&tenant);
            state.take_assignment(tenant)
        };
        let Some(Assignment { worker, engine, .. }) = assignment else {
            tracing::debug!("Tenant {} is not running", tenant);
            return Ok(());
        };

        tracing::info!("Stopping tenant {} on worker {}", tenant, worker.id());
        engine.release();
        match worker.kind() {
            WorkerKind::Shared(_) => match worker.proxy()?.kill_engine(tenant).await {
                Ok(()) => Ok(()),
                Err(e) if e.is_disconnect() => {
                    tracing::debug!("Worker {} is gone, tenant {} counts as stopped", worker.id(), tenant);
                    Ok(())
                }
                Err(e) => Err(e),
            },
            WorkerKind::Dedicated(_) => match worker.terminate(self.inner.config.kill_timeout).await {
                Ok(()) => Ok(()),
                Err(CloudError::Timeout(ms)) => {
                    tracing::warn!("Worker {} ignored exit for {}ms and was killed", worker.id(), ms);
                    Ok(())
                }
                Err(e) => Err(e),
            },
        }
    }

    pub async fn restart_user(&self, tenant: TenantId) -> Result<()> {
        let _guard = self.inner.locks.acquire(tenant).await;
        self.kill_user_locked(tenant).await?;
        self.start_user_locked(tenant).await
    }

    /// Removes the tenant's cache directory.
    pub async fn clear_cache(&self, tenant: TenantId) -> Result<()> {
        let _guard = self.inner.locks.acquire(tenant).await;
        self.clear_cache_locked(tenant).await
    }

    async fn clear_cache_locked(&self, tenant: TenantId) -> Result<()> {
        let dir = cache_dir(self.root(), tenant);
        tracing::info!("Clearing cache of tenant {} ({})", tenant, dir.display());
        remove_dir(&dir).await
    }

    pub async fn restart_user_without_cache(&self, tenant: TenantId) -> Result<()> {
        let _guard = self.inner.locks.acquire(tenant).await;
        self.kill_user_locked(tenant).await?;
        self.clear_cache_locked(tenant).await?;
        self.start_user_locked(tenant).await
    }

    /// Stops the tenant and removes its working directory.
    pub async fn delete_user(&self, tenant: TenantId) -> Result<()> {
        let guard = self.inner.locks.acquire(tenant).await;
        self.kill_user_locked(tenant).await?;
        let dir = tenant_dir(self.root(), tenant);
        tracing::info!("Deleting tenant {} ({})", tenant, dir.display());
        let removed = remove_dir(&dir).await;
        drop(guard);
        self.inner.locks.forget(&tenant);
        removed
    }

    /// Terminates every worker, bypassing tenant locks, and waits for starts
    /// already in progress to give up. No worker is started afterwards.
    pub async fn kill_all_users(&self) -> Result<()> {
        self.inner.shutting_down.store(true, Ordering::SeqCst);
        let (workers, assignments) = {
            let mut state = self.state();
            state.pending_restart.clear();
            let assignments: Vec<_> = state.assignments.drain().map(|(_, a)| a).collect();
            let mut workers = state.pool.clear();
            workers.extend(state.dedicated.drain().map(|(_, w)| w));
            (workers, assignments)
        };
        drop(assignments);

        tracing::info!("Terminating {} workers", workers.len());
        let grace = self.inner.config.kill_timeout;
        join_all(workers.iter().map(|worker| async move {
            if let Err(e) = worker.terminate(grace).await {
                tracing::warn!("Worker {}: {}", worker.id(), e);
            }
        }))
        .await;

        let mut starts = self.inner.starts.subscribe();
        if *starts.borrow() > 0 {
            tracing::info!("Waiting for {} starts in progress", *starts.borrow());
        }
        let _ = starts.wait_for(|n| *n == 0).await;
        tracing::info!("All workers stopped");
        Ok(())
    }

    pub fn is_running(&self, tenant: TenantId) -> bool {
        self.state().assignments.contains_key(&tenant)
    }

    /// The worker hosting the tenant.
    pub fn get_process_id(&self, tenant: TenantId) -> Option<WorkerId> {
        self.state().assignments.get(&tenant).map(|a| a.worker.id().clone())
    }

    /// Hands a front-end connection to the worker hosting `tenant`.
    pub async fn send_socket(
        &self,
        tenant: TenantId,
        socket: impl AsFd,
        reply_id: String,
        buffered: Vec<u8>,
    ) -> Result<()> {
        let worker = self
            .state()
            .assignments
            .get(&tenant)
            .map(|a| a.worker.clone())
            .ok_or(CloudError::NoSuchEngine(tenant))?;
        tracing::debug!("Passing connection for tenant {} to worker {}", tenant, worker.id());
        worker.send_direct(tenant, reply_id, buffered, socket).await
    }

    /// Live worker processes, shared and dedicated.
    pub fn worker_count(&self) -> usize {
        let state = self.state();
        state.pool.workers().len() + state.dedicated.len()
    }

    /// Tenants per shared slot; `None` while a slot is being replaced.
    pub fn shared_use_counts(&self) -> Vec<Option<usize>> {
        self.state().pool.use_counts()
    }

    pub fn running_tenants(&self) -> Vec<TenantId> {
        let mut tenants: Vec<_> = self.state().assignments.keys().copied().collect();
        tenants.sort_unstable();
        tenants
    }

    /// Called when a worker reports that it dropped an engine on its own.
    /// Stale notices (from an engine that was since replaced) are ignored.
    pub(crate) fn engine_removed(&self, tenant: TenantId, generation: u64) {
        let removed = {
            let mut state = self.state();
            match state.assignments.get(&tenant) {
                Some(a) if a.generation == generation => state.take_assignment(tenant),
                _ => None,
            }
        };
        let Some(Assignment { worker, .. }) = removed else {
            return;
        };

        tracing::info!("Worker {} dropped the engine of tenant {}", worker.id(), tenant);
        if let WorkerKind::Dedicated(_) = worker.kind() {
            let grace = self.inner.config.kill_timeout;
            tokio::spawn(async move {
                if let Err(e) = worker.terminate(grace).await {
                    tracing::warn!("Worker {}: {}", worker.id(), e);
                }
            });
        }
    }

    fn on_worker_exit(&self, event: WorkerEvent) {
        let WorkerEvent { worker, status } = event;
        tracing::info!("Worker {} exited with status {:?}", worker.id(), status);

        match worker.kind() {
            WorkerKind::Dedicated(tenant) => {
                let mut state = self.state();
                state.forget_dedicated(tenant, &worker);
                if state.assignments.get(&tenant).is_some_and(|a| Arc::ptr_eq(&a.worker, &worker)) {
                    state.assignments.remove(&tenant);
                }
            }
            WorkerKind::Shared(slot) => {
                let evicted = {
                    let mut state = self.state();
                    state.pool.clear_if(slot, &worker);
                    let evicted: Vec<TenantId> = state
                        .assignments
                        .iter()
                        .filter(|(_, a)| Arc::ptr_eq(&a.worker, &worker))
                        .map(|(tenant, _)| *tenant)
                        .collect();
                    for tenant in &evicted {
                        state.assignments.remove(tenant);
                        if !self.is_shutting_down() {
                            state.pending_restart.insert(*tenant);
                        }
                    }
                    evicted
                };

                if self.is_shutting_down() {
                    return;
                }
                tracing::warn!(
                    "Shared worker {} died hosting {} tenants; replacing it in {:?}",
                    worker.id(),
                    evicted.len(),
                    self.inner.config.restart_delay
                );
                tokio::spawn(restart_shared(self.downgrade(), slot, evicted));
            }
        }
    }

    async fn start_if_pending(&self, tenant: TenantId) -> Result<()> {
        let _guard = self.inner.locks.acquire(tenant).await;
        if !self.state().pending_restart.contains(&tenant) {
            tracing::debug!("Tenant {} was stopped before its restart", tenant);
            return Ok(());
        }
        self.start_user_locked(tenant).await
    }
}

async fn run_event_loop(supervisor: WeakSupervisor, mut events: mpsc::UnboundedReceiver<WorkerEvent>) {
    while let Some(event) = events.recv().await {
        let Some(supervisor) = supervisor.upgrade() else {
            break;
        };
        supervisor.on_worker_exit(event);
    }
}

/// Replaces the shared worker in `slot`, then restarts the tenants it hosted.
async fn restart_shared(supervisor: WeakSupervisor, slot: usize, evicted: Vec<TenantId>) {
    let supervisor = loop {
        let Some(delay) = supervisor.upgrade().map(|s| s.config().restart_delay) else {
            return;
        };
        tokio::time::sleep(delay).await;

        let Some(current) = supervisor.upgrade() else {
            return;
        };
        if current.is_shutting_down() {
            return;
        }
        match current.spawn_worker(WorkerKind::Shared(slot)).await {
            Ok(worker) => {
                let accepted = {
                    let mut state = current.state();
                    let accepted = !current.is_shutting_down();
                    if accepted {
                        state.pool.set(slot, worker.clone());
                    }
                    accepted
                };
                if !accepted {
                    let _ = worker.terminate(current.config().kill_timeout).await;
                    return;
                }
                tracing::info!("Worker {} replaces shared slot {}", worker.id(), slot);
                break current;
            }
            Err(e) => tracing::warn!("Failed to replace shared slot {}: {}; retrying", slot, e),
        }
    };

    for tenant in evicted {
        if let Err(e) = supervisor.start_if_pending(tenant).await {
            tracing::warn!("Failed to restart tenant {}: {}", tenant, e);
        }
    }
}
