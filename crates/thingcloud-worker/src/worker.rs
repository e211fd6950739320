use std::collections::HashMap;
use std::os::fd::OwnedFd;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use futures::future::{join_all, BoxFuture};
use serde_json::{json, Value};
use thingcloud_common::protocol::{WorkerMessage, WORKER_METHODS};
use thingcloud_common::rpc::{arg, Proxy, RpcChannel, Stub};
use thingcloud_common::transport::{IpcChannel, IpcMessage};
use thingcloud_common::{CloudError, Result, TenantConfig, TenantId};
use tokio::sync::mpsc;

use crate::engine::{EngineFactory, EngineStubs};
use crate::handle::EngineHandle;
use crate::platform::Platform;

struct WorkerInner {
    root: PathBuf,
    factory: Arc<dyn EngineFactory>,
    engines: Mutex<HashMap<TenantId, Arc<EngineHandle>>>,
}

/// A worker process: hosts engines and answers its supervisor.
///
/// Cloning is cheap; clones share the same engine table.
#[derive(Clone)]
pub struct Worker {
    inner: Arc<WorkerInner>,
}

impl Worker {
    /// Creates a worker storing tenant data under `root`.
    ///
    /// # Arguments
    /// * `root` - Directory holding one working directory per tenant
    /// * `factory` - Builds the engine for every `runEngine` request
    pub fn new(root: impl Into<PathBuf>, factory: Arc<dyn EngineFactory>) -> Self {
        Self {
            inner: Arc::new(WorkerInner {
                root: root.into(),
                factory,
                engines: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    fn engines(&self) -> MutexGuard<'_, HashMap<TenantId, Arc<EngineHandle>>> {
        self.inner
            .engines
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Tenants with a handle in this worker, in any state.
    pub fn tenants(&self) -> Vec<TenantId> {
        self.engines().keys().copied().collect()
    }

    pub fn handle(&self, tenant: TenantId) -> Option<Arc<EngineHandle>> {
        self.engines().get(&tenant).cloned()
    }

    /// Serves the supervisor over `ipc` until told to exit or the supervisor
    /// goes away. Every hosted engine is stopped before returning.
    pub async fn serve(self, ipc: IpcChannel) -> Result<()> {
        let (sender, mut receiver) = ipc.split();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Value>();
        let rpc = RpcChannel::new(outbound_tx);

        let pump_sender = sender.clone();
        let pump_rpc = rpc.clone();
        let pump = tokio::spawn(async move {
            while let Some(data) = outbound_rx.recv().await {
                if let Err(e) = pump_sender.send(&WorkerMessage::Rpc { data }).await {
                    tracing::warn!("Lost IPC channel to supervisor: {}", e);
                    pump_rpc.close();
                    break;
                }
            }
        });

        let stub_id = rpc.add_stub(Arc::new(WorkerStub {
            worker: self.clone(),
        }));
        sender.send(&WorkerMessage::Ready { id: stub_id }).await?;
        tracing::info!("Worker ready (pid {})", std::process::id());

        loop {
            match receiver.recv().await {
                Ok(Some(IpcMessage { message, fd })) => match message {
                    WorkerMessage::Exit => {
                        tracing::info!("Exit requested by supervisor");
                        break;
                    }
                    WorkerMessage::Rpc { data } => rpc.dispatch(data),
                    WorkerMessage::Direct {
                        target,
                        reply_id,
                        buffered,
                    } => match fd {
                        Some(fd) => self.spawn_direct(target, reply_id, buffered, fd),
                        None => tracing::warn!("Direct request for tenant {} without a socket", target),
                    },
                    WorkerMessage::Ready { .. } => {
                        tracing::warn!("Ignoring unexpected ready message from supervisor")
                    }
                },
                Ok(None) => {
                    tracing::info!("Supervisor closed the IPC channel");
                    rpc.close();
                    break;
                }
                Err(e) => {
                    tracing::warn!("IPC receive failed: {}", e);
                    rpc.close();
                    break;
                }
            }
        }

        // Keep dispatching replies while engines stop: their delegates
        // still talk to the supervisor.
        let stopping = self.stop_all();
        tokio::pin!(stopping);
        let mut draining = !rpc.is_closed();
        loop {
            tokio::select! {
                _ = &mut stopping => break,
                received = receiver.recv(), if draining => match received {
                    Ok(Some(IpcMessage { message: WorkerMessage::Rpc { data }, .. })) => rpc.dispatch(data),
                    Ok(Some(_)) => {}
                    Ok(None) | Err(_) => {
                        rpc.close();
                        draining = false;
                    }
                },
            }
        }

        rpc.close();
        let _ = pump.await;
        Ok(())
    }

    /// Starts the engine for `config.id` and returns it once running.
    pub async fn run_engine(
        &self,
        config: TenantConfig,
        thingpedia: Option<Proxy>,
        delegate: Option<Proxy>,
    ) -> Result<EngineStubs> {
        let tenant = config.id;
        let handle = {
            let mut engines = self.engines();
            if engines.contains_key(&tenant) {
                drop(engines);
                release_all([thingpedia, delegate]);
                return Err(CloudError::AlreadyRunning(tenant));
            }
            let handle = EngineHandle::new(tenant, delegate, thingpedia.clone());
            engines.insert(tenant, handle.clone());
            handle
        };

        tracing::info!("Starting engine for tenant {}", tenant);
        let platform = Platform::new(config, &self.inner.root, thingpedia);
        let opened = async {
            let engine = self.inner.factory.create(platform)?;
            engine.open().await?;
            Ok::<_, CloudError>(engine)
        }
        .await;

        let engine = match opened {
            Ok(engine) => engine,
            Err(e) => {
                tracing::warn!("Engine for tenant {} failed to open: {}", tenant, e);
                self.forget_handle(&handle);
                handle.stop().await;
                return Err(e);
            }
        };

        let stubs = EngineStubs::for_engine(&engine);
        if !handle.set_running(engine.clone(), stubs.clone()) {
            tracing::info!("Engine for tenant {} was killed while opening", tenant);
            if let Err(e) = engine.close().await {
                tracing::warn!("Failed to close engine for tenant {}: {}", tenant, e);
            }
            return Err(CloudError::EngineStopped(tenant));
        }

        tracing::info!("Engine for tenant {} running", tenant);
        Ok(stubs)
    }

    /// Stops the engine for `tenant`. Unknown tenants are not an error.
    pub async fn kill_engine(&self, tenant: TenantId) {
        let handle = self.engines().remove(&tenant);
        match handle {
            Some(handle) => handle.stop().await,
            None => tracing::debug!("killEngine for tenant {} which is not hosted here", tenant),
        }
    }

    /// Stops every hosted engine concurrently.
    pub async fn stop_all(&self) {
        let handles: Vec<_> = self.engines().drain().map(|(_, handle)| handle).collect();
        if !handles.is_empty() {
            tracing::info!("Stopping {} engines", handles.len());
        }
        join_all(handles.iter().map(|handle| handle.stop())).await;
    }

    fn forget_handle(&self, handle: &Arc<EngineHandle>) {
        let mut engines = self.engines();
        if let Some(current) = engines.get(&handle.tenant()) {
            if Arc::ptr_eq(current, handle) {
                engines.remove(&handle.tenant());
            }
        }
    }

    fn spawn_direct(&self, target: TenantId, reply_id: String, buffered: Vec<u8>, fd: OwnedFd) {
        let worker = self.clone();
        tokio::spawn(async move {
            if let Err(e) = worker.handle_direct(target, reply_id, buffered, fd).await {
                tracing::warn!("Direct connection for tenant {} failed: {}", target, e);
            }
        });
    }

    /// Serves a connection handed over by the control plane.
    async fn handle_direct(&self, target: TenantId, reply_id: String, buffered: Vec<u8>, fd: OwnedFd) -> Result<()> {
        let socket = std::net::TcpStream::from(fd);
        socket.set_nonblocking(true)?;
        let socket = tokio::net::TcpStream::from_std(socket)?;

        let channel = RpcChannel::over_stream_with_buffer(socket, buffered);
        let reply = channel.get_proxy(reply_id);

        let running = self
            .handle(target)
            .and_then(|handle| handle.stubs().map(|stubs| (handle, stubs)));

        let Some((handle, stubs)) = running else {
            tracing::debug!("Direct connection for tenant {} which is not running", target);
            let message = format!("Engine for tenant {} is not running", target);
            let result = reply.call("error", vec![json!(message)]).await;
            channel.close();
            return result.map(drop);
        };

        let args = vec![
            channel.export(stubs.engine),
            channel.export(stubs.websocket),
            channel.export(stubs.webhook),
        ];
        handle.attach(channel.clone());

        match reply.call("ready", args).await {
            Ok(_) => {
                reply.release();
                tracing::debug!("Direct connection for tenant {} attached", target);
                Ok(())
            }
            Err(e) => {
                channel.close();
                Err(e)
            }
        }
    }
}

fn release_all<const N: usize>(proxies: [Option<Proxy>; N]) {
    for proxy in proxies.into_iter().flatten() {
        proxy.release();
    }
}

fn import_optional(channel: &RpcChannel, value: Option<&Value>) -> Result<Option<Proxy>> {
    match value {
        Some(value) if !value.is_null() => Ok(Some(channel.import_proxy(value)?)),
        _ => Ok(None),
    }
}

/// The stub a worker registers with its supervisor.
struct WorkerStub {
    worker: Worker,
}

impl Stub for WorkerStub {
    fn methods(&self) -> &'static [&'static str] {
        WORKER_METHODS
    }

    fn invoke(self: Arc<Self>, method: String, args: Vec<Value>, channel: RpcChannel) -> BoxFuture<'static, Result<Value>> {
        Box::pin(async move {
            match method.as_str() {
                "runEngine" => {
                    let config: TenantConfig = arg(&args, 0)?;
                    let thingpedia = import_optional(&channel, args.get(1))?;
                    let delegate = import_optional(&channel, args.get(2))?;
                    let stubs = self.worker.run_engine(config, thingpedia, delegate).await?;
                    Ok(channel.export(stubs.engine))
                }
                "killEngine" => {
                    let tenant: TenantId = arg(&args, 0)?;
                    self.worker.kill_engine(tenant).await;
                    Ok(Value::Null)
                }
                other => Err(CloudError::MethodNotAllowed {
                    target: "worker".to_string(),
                    method: other.to_string(),
                }),
            }
        })
    }
}
