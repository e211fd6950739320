use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::AbortHandle;

use super::message::{RpcError, RpcMessage, PROXY_MARKER, STUB_MARKER};
use super::{Proxy, Stub};
use crate::error::{CloudError, Result};
use crate::transport::framing::{FramedReader, FramedWriter};

/// An object received from the peer.
pub enum RpcObject {
    /// The peer's stub, reachable through a proxy.
    Remote(Proxy),
    /// One of our own stubs handed back by the peer.
    Local(Arc<dyn Stub>),
}

impl RpcObject {
    pub fn into_proxy(self) -> Result<Proxy> {
        match self {
            RpcObject::Remote(proxy) => Ok(proxy),
            RpcObject::Local(_) => Err(CloudError::InvalidArgument(
                "expected a remote object, got a local one".to_string(),
            )),
        }
    }
}

struct StubEntry {
    stub: Arc<dyn Stub>,
    refs: usize,
}

#[derive(Default)]
struct ChannelState {
    stubs: HashMap<String, StubEntry>,
    // Arc address of an exported stub -> its id, so re-exports share an id.
    exported: HashMap<usize, String>,
    pending: HashMap<u64, oneshot::Sender<Result<Value>>>,
    closed: bool,
}

struct ChannelInner {
    outbound: Mutex<Option<mpsc::UnboundedSender<Value>>>,
    state: Mutex<ChannelState>,
    next_stub: AtomicU64,
    next_call: AtomicU64,
    closed_tx: watch::Sender<bool>,
    unhandled_tx: mpsc::UnboundedSender<Value>,
    unhandled_rx: Mutex<Option<mpsc::UnboundedReceiver<Value>>>,
    reader: Mutex<Option<AbortHandle>>,
}

/// One end of an RPC connection. Clones share the same channel.
#[derive(Clone)]
pub struct RpcChannel {
    inner: Arc<ChannelInner>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn stub_key(stub: &Arc<dyn Stub>) -> usize {
    Arc::as_ptr(stub) as *const () as usize
}

impl RpcChannel {
    /// Creates a channel whose outgoing frames are pushed to `outbound`.
    ///
    /// The owner feeds incoming frames through [`dispatch`](Self::dispatch)
    /// and calls [`close`](Self::close) when the transport goes away.
    pub fn new(outbound: mpsc::UnboundedSender<Value>) -> Self {
        let (closed_tx, _) = watch::channel(false);
        let (unhandled_tx, unhandled_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(ChannelInner {
                outbound: Mutex::new(Some(outbound)),
                state: Mutex::new(ChannelState::default()),
                next_stub: AtomicU64::new(0),
                next_call: AtomicU64::new(1),
                closed_tx,
                unhandled_tx,
                unhandled_rx: Mutex::new(Some(unhandled_rx)),
                reader: Mutex::new(None),
            }),
        }
    }

    /// Runs a channel over a byte stream, spawning its reader and writer.
    pub fn over_stream<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::over_stream_with_buffer(stream, Vec::new())
    }

    /// Like [`over_stream`](Self::over_stream), for a stream whose first
    /// bytes were already read by someone else.
    pub fn over_stream_with_buffer<S>(stream: S, buffered: Vec<u8>) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let (tx, mut rx) = mpsc::unbounded_channel::<Value>();
        let channel = Self::new(tx);

        tokio::spawn(async move {
            let mut writer = FramedWriter::new(write_half);
            while let Some(frame) = rx.recv().await {
                if let Err(e) = writer.write_frame(&frame).await {
                    tracing::debug!("RPC writer stopped: {}", e);
                    break;
                }
            }
            let _ = writer.end().await;
        });

        let reader_channel = channel.clone();
        let reader = tokio::spawn(async move {
            let mut reader = FramedReader::with_buffer(read_half, buffered);
            loop {
                match reader.read_frame().await {
                    Ok(Some(frame)) => reader_channel.dispatch(frame),
                    Ok(None) => break,
                    Err(e) => {
                        tracing::debug!("RPC reader stopped: {}", e);
                        break;
                    }
                }
            }
            reader_channel.close();
        });
        *lock(&channel.inner.reader) = Some(reader.abort_handle());

        channel
    }

    /// Handles one incoming frame.
    ///
    /// Frames without an `rpc` key are queued for [`take_unhandled`](Self::take_unhandled).
    pub fn dispatch(&self, frame: Value) {
        if !RpcMessage::is_rpc_frame(&frame) {
            let _ = self.inner.unhandled_tx.send(frame);
            return;
        }

        let message: RpcMessage = match serde_json::from_value(frame) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!("Dropping malformed RPC frame: {}", e);
                return;
            }
        };

        match message {
            RpcMessage::Call {
                id,
                target,
                method,
                args,
            } => self.handle_call(id, target, method, args),
            RpcMessage::Reply { id, result, error } => {
                let sender = lock(&self.inner.state).pending.remove(&id);
                match sender {
                    Some(sender) => {
                        let outcome = match error {
                            Some(error) => Err(CloudError::from(error)),
                            None => Ok(result),
                        };
                        let _ = sender.send(outcome);
                    }
                    None => tracing::debug!("Reply for unknown call {}", id),
                }
            }
            RpcMessage::Release { target } => self.release_stub(&target),
        }
    }

    fn handle_call(&self, id: u64, target: String, method: String, args: Vec<Value>) {
        let stub = lock(&self.inner.state)
            .stubs
            .get(&target)
            .map(|entry| entry.stub.clone());

        let stub = match stub {
            Some(stub) => stub,
            None => {
                self.send_reply(id, Err(CloudError::UnknownObject(target)));
                return;
            }
        };

        if !stub.methods().contains(&method.as_str()) {
            self.send_reply(id, Err(CloudError::MethodNotAllowed { target, method }));
            return;
        }

        tracing::debug!("RPC call {} -> {}.{}", id, target, method);
        let channel = self.clone();
        let call = stub.invoke(method, args, self.clone());
        tokio::spawn(async move {
            let result = call.await;
            channel.send_reply(id, result);
        });
    }

    fn send_reply(&self, id: u64, result: Result<Value>) {
        let reply = match result {
            Ok(result) => RpcMessage::Reply {
                id,
                result,
                error: None,
            },
            Err(err) => RpcMessage::Reply {
                id,
                result: Value::Null,
                error: Some(RpcError::from(&err)),
            },
        };
        match serde_json::to_value(&reply) {
            Ok(frame) => {
                let _ = self.send_raw(frame);
            }
            Err(e) => tracing::warn!("Failed to encode reply {}: {}", id, e),
        }
    }

    pub(crate) async fn call(&self, target: &str, method: &str, args: Vec<Value>) -> Result<Value> {
        let id = self.inner.next_call.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        {
            let mut state = lock(&self.inner.state);
            if state.closed {
                return Err(CloudError::ChannelClosed);
            }
            state.pending.insert(id, tx);
        }

        let frame = serde_json::to_value(RpcMessage::Call {
            id,
            target: target.to_string(),
            method: method.to_string(),
            args,
        })?;
        if let Err(e) = self.send_raw(frame) {
            lock(&self.inner.state).pending.remove(&id);
            return Err(e);
        }

        rx.await.unwrap_or(Err(CloudError::ChannelClosed))
    }

    pub(crate) fn send_release(&self, target: &str) {
        if self.is_closed() {
            return;
        }
        let frame = json!({"rpc": "release", "target": target});
        let _ = self.send_raw(frame);
    }

    /// Sends a frame as-is, e.g. a control frame sharing the connection.
    pub fn send_raw(&self, frame: Value) -> Result<()> {
        let outbound = lock(&self.inner.outbound);
        match outbound.as_ref() {
            Some(sender) => sender.send(frame).map_err(|_| CloudError::ChannelClosed),
            None => Err(CloudError::ChannelClosed),
        }
    }

    /// Registers `stub` and returns its id.
    ///
    /// Registering the same object again returns the same id and adds one
    /// export reference.
    pub fn add_stub(&self, stub: Arc<dyn Stub>) -> String {
        let key = stub_key(&stub);
        let mut state = lock(&self.inner.state);

        if let Some(id) = state.exported.get(&key).cloned() {
            if let Some(entry) = state.stubs.get_mut(&id) {
                entry.refs += 1;
                return id;
            }
        }

        let id = self.inner.next_stub.fetch_add(1, Ordering::Relaxed).to_string();
        if !state.closed {
            state.exported.insert(key, id.clone());
            state.stubs.insert(id.clone(), StubEntry { stub, refs: 1 });
        }
        id
    }

    /// Registers `stub` and encodes it for transfer to the peer.
    pub fn export(&self, stub: Arc<dyn Stub>) -> Value {
        let methods = stub.methods();
        let id = self.add_stub(stub);
        json!({ STUB_MARKER: id, "methods": methods })
    }

    /// A proxy for the peer's object `id`, without a method allowlist.
    pub fn get_proxy(&self, id: impl Into<String>) -> Proxy {
        Proxy::new(self.clone(), id.into(), None)
    }

    /// Decodes an object reference received from the peer.
    pub fn import(&self, value: &Value) -> Result<RpcObject> {
        if let Some(id) = value.get(STUB_MARKER) {
            let id = marker_id(id)?;
            let methods = value.get("methods").and_then(Value::as_array).map(|methods| {
                methods
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect::<Vec<_>>()
                    .into()
            });
            return Ok(RpcObject::Remote(Proxy::new(self.clone(), id, methods)));
        }

        if let Some(id) = value.get(PROXY_MARKER) {
            let id = marker_id(id)?;
            let state = lock(&self.inner.state);
            return match state.stubs.get(&id) {
                Some(entry) => Ok(RpcObject::Local(entry.stub.clone())),
                None => Err(CloudError::UnknownObject(id)),
            };
        }

        Err(CloudError::InvalidArgument(format!("not an object reference: {}", value)))
    }

    /// Imports a value that must be a remote object.
    pub fn import_proxy(&self, value: &Value) -> Result<Proxy> {
        self.import(value)?.into_proxy()
    }

    fn release_stub(&self, target: &str) {
        let released = {
            let mut state = lock(&self.inner.state);
            let remove = match state.stubs.get_mut(target) {
                Some(entry) => {
                    entry.refs = entry.refs.saturating_sub(1);
                    entry.refs == 0
                }
                None => false,
            };
            if remove {
                let entry = state.stubs.remove(target);
                if let Some(entry) = &entry {
                    let key = stub_key(&entry.stub);
                    state.exported.remove(&key);
                }
                entry
            } else {
                None
            }
        };

        if let Some(entry) = released {
            tracing::debug!("RPC stub {} released", target);
            entry.stub.on_released();
        }
    }

    /// Number of live stubs registered on this side.
    pub fn stub_count(&self) -> usize {
        lock(&self.inner.state).stubs.len()
    }

    /// Takes the receiver of non-RPC frames. Returns `None` after the first call.
    pub fn take_unhandled(&self) -> Option<mpsc::UnboundedReceiver<Value>> {
        lock(&self.inner.unhandled_rx).take()
    }

    /// Closes the channel. Pending calls fail with [`CloudError::ChannelClosed`]
    /// and every stub is released. Calling it again does nothing.
    pub fn close(&self) {
        let (pending, stubs) = {
            let mut state = lock(&self.inner.state);
            if state.closed {
                return;
            }
            state.closed = true;
            state.exported.clear();
            (
                std::mem::take(&mut state.pending),
                std::mem::take(&mut state.stubs),
            )
        };

        // Dropping the sender lets the writer flush what is queued and shut down.
        lock(&self.inner.outbound).take();
        if let Some(reader) = lock(&self.inner.reader).take() {
            reader.abort();
        }

        for (_, sender) in pending {
            let _ = sender.send(Err(CloudError::ChannelClosed));
        }
        for (_, entry) in stubs {
            entry.stub.on_released();
        }

        self.inner.closed_tx.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.inner.closed_tx.borrow()
    }

    /// Resolves once the channel is closed.
    pub async fn closed(&self) {
        let mut rx = self.inner.closed_tx.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Whether two handles refer to the same channel.
    pub fn same_channel(&self, other: &RpcChannel) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

fn marker_id(value: &Value) -> Result<String> {
    match value {
        Value::String(id) => Ok(id.clone()),
        Value::Number(id) => Ok(id.to_string()),
        other => Err(CloudError::InvalidArgument(format!("invalid object id: {}", other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::arg;
    use futures::future::BoxFuture;
    use std::sync::atomic::AtomicUsize;

    struct Calculator {
        released: Arc<AtomicUsize>,
    }

    impl Stub for Calculator {
        fn methods(&self) -> &'static [&'static str] {
            &["add", "echo", "fail", "callBack"]
        }

        fn invoke(
            self: Arc<Self>,
            method: String,
            args: Vec<Value>,
            channel: RpcChannel,
        ) -> BoxFuture<'static, Result<Value>> {
            Box::pin(async move {
                match method.as_str() {
                    "add" => Ok(json!(arg::<i64>(&args, 0)? + arg::<i64>(&args, 1)?)),
                    "echo" => Ok(args.into_iter().next().unwrap_or(Value::Null)),
                    "fail" => Err(CloudError::Remote {
                        message: "requested failure".into(),
                        code: Some("EBUSY".into()),
                    }),
                    "callBack" => {
                        let callback = channel.import_proxy(&args[0])?;
                        let result = callback.call("echo", vec![json!("from server")]).await;
                        callback.release();
                        result
                    }
                    _ => unreachable!(),
                }
            })
        }

        fn on_released(&self) {
            self.released.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn calculator() -> (Arc<Calculator>, Arc<AtomicUsize>) {
        let released = Arc::new(AtomicUsize::new(0));
        (
            Arc::new(Calculator {
                released: released.clone(),
            }),
            released,
        )
    }

    fn pair() -> (RpcChannel, RpcChannel) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        (RpcChannel::over_stream(a), RpcChannel::over_stream(b))
    }

    #[tokio::test]
    async fn test_call_round_trip() {
        let (server, client) = pair();
        let (calc, _) = calculator();
        let id = server.add_stub(calc);
        let proxy = client.get_proxy(id);

        assert_eq!(proxy.call("add", vec![json!(2), json!(40)]).await.unwrap(), json!(42));

        let payload = json!({"nested": [1, "two", {"three": 3.5}], "unicode": "žluť\n", "null": null});
        assert_eq!(proxy.call("echo", vec![payload.clone()]).await.unwrap(), payload);
    }

    #[tokio::test]
    async fn test_remote_error_and_allowlist() {
        let (server, client) = pair();
        let (calc, _) = calculator();
        let proxy = client.get_proxy(server.add_stub(calc));

        let err = proxy.call("fail", vec![]).await.unwrap_err();
        assert_eq!(err.code(), "EBUSY");
        assert_eq!(err.to_string(), "requested failure");

        let err = proxy.call("drop_tables", vec![]).await.unwrap_err();
        assert_eq!(err.code(), "EPERM");

        let err = client.get_proxy("99").call("add", vec![]).await.unwrap_err();
        assert_eq!(err.code(), "ENOENT");
    }

    #[tokio::test]
    async fn test_exported_object_becomes_proxy() {
        let (server, client) = pair();
        let (calc, _) = calculator();
        let (callback, callback_released) = calculator();
        let proxy = client.get_proxy(server.add_stub(calc));

        let exported = client.export(callback);
        let result = proxy.call("callBack", vec![exported]).await.unwrap();
        assert_eq!(result, json!("from server"));

        // The server released its proxy to our callback.
        for _ in 0..50 {
            if callback_released.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(callback_released.load(Ordering::SeqCst), 1);
        assert_eq!(client.stub_count(), 0);
    }

    #[tokio::test]
    async fn test_proxy_resolves_back_to_local_stub() {
        let (server, client) = pair();
        let (calc, _) = calculator();
        let id = server.add_stub(calc);

        let proxy = client.get_proxy(id);
        match server.import(&proxy.to_value()).unwrap() {
            RpcObject::Local(stub) => assert!(stub.methods().contains(&"add")),
            RpcObject::Remote(_) => panic!("expected local stub"),
        }
    }

    #[tokio::test]
    async fn test_reexport_shares_id_and_counts_refs() {
        let (server, client) = pair();
        let (calc, released) = calculator();
        let stub: Arc<dyn Stub> = calc;

        let first = server.add_stub(stub.clone());
        let second = server.add_stub(stub);
        assert_eq!(first, second);

        client.get_proxy(first.clone()).release();
        let proxy = client.get_proxy(first);
        assert_eq!(proxy.call("add", vec![json!(1), json!(1)]).await.unwrap(), json!(2));
        assert_eq!(released.load(Ordering::SeqCst), 0);

        proxy.clone().release();
        // Round trip so the release is processed first.
        let err = proxy.call("add", vec![json!(1), json!(1)]).await.unwrap_err();
        assert_eq!(err.code(), "ENOENT");
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_close_fails_pending_and_releases_stubs() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let channel = RpcChannel::new(tx);
        let (calc, released) = calculator();
        channel.add_stub(calc);

        let pending = {
            let channel = channel.clone();
            tokio::spawn(async move { channel.get_proxy("0").call("add", vec![]).await })
        };
        tokio::task::yield_now().await;

        channel.close();
        channel.close();
        let err = pending.await.unwrap().unwrap_err();
        assert!(matches!(err, CloudError::ChannelClosed));
        assert_eq!(released.load(Ordering::SeqCst), 1);
        assert!(channel.is_closed());
        channel.closed().await;

        let err = channel.get_proxy("0").call("add", vec![]).await.unwrap_err();
        assert!(matches!(err, CloudError::ChannelClosed));
    }

    #[tokio::test]
    async fn test_peer_disconnect_closes_channel() {
        let (a, b) = tokio::io::duplex(1024);
        let channel = RpcChannel::over_stream(a);
        drop(b);
        tokio::time::timeout(std::time::Duration::from_secs(1), channel.closed())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_non_rpc_frames_are_unhandled() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let channel = RpcChannel::new(tx);
        let mut unhandled = channel.take_unhandled().unwrap();
        assert!(channel.take_unhandled().is_none());

        channel.dispatch(json!({"control": "new-object"}));
        assert_eq!(unhandled.recv().await.unwrap(), json!({"control": "new-object"}));
    }
}
