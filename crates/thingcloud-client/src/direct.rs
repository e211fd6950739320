//! Control-connection handshakes shared by every backend.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::Value;
use thingcloud_common::protocol::{ControlFrame, ErrorFrame, SupervisorProxy, DIRECT_REPLY_METHODS};
use thingcloud_common::rpc::{RpcChannel, Stub};
use thingcloud_common::transport::{connect, encode_frame, FramedReader};
use thingcloud_common::{CloudError, Result, TenantId};
use tokio::io::AsyncWriteExt;
use tokio::sync::oneshot;

use crate::manager::EngineRef;

/// Upper bound on a handshake once the TCP connection is up.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

type ReplyOutcome = std::result::Result<Vec<Value>, CloudError>;

/// The stub a worker answers through after taking over a direct connection.
struct DirectReply {
    tx: Mutex<Option<oneshot::Sender<ReplyOutcome>>>,
}

impl Stub for DirectReply {
    fn methods(&self) -> &'static [&'static str] {
        DIRECT_REPLY_METHODS
    }

    fn invoke(self: Arc<Self>, method: String, args: Vec<Value>, _channel: RpcChannel) -> BoxFuture<'static, Result<Value>> {
        Box::pin(async move {
            let outcome = match method.as_str() {
                "ready" => Ok(args),
                _ => Err(CloudError::Remote {
                    message: args
                        .first()
                        .and_then(Value::as_str)
                        .unwrap_or("engine refused the connection")
                        .to_string(),
                    code: None,
                }),
            };
            let tx = self.tx.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).take();
            if let Some(tx) = tx {
                let _ = tx.send(outcome);
            }
            Ok(Value::Null)
        })
    }
}

fn control_frame(frame: &ControlFrame) -> Result<Value> {
    Ok(serde_json::to_value(frame)?)
}

/// Opens a direct connection to the engine of `tenant` behind the control
/// endpoint at `addr`.
pub async fn connect_engine(
    addr: &str,
    tenant: TenantId,
    token: Option<&str>,
    connect_timeout: Duration,
) -> Result<EngineRef> {
    let stream = connect(addr, connect_timeout).await?;
    let channel = RpcChannel::over_stream(stream);

    match tokio::time::timeout(HANDSHAKE_TIMEOUT, direct_handshake(&channel, tenant, token)).await {
        Ok(Ok(engine)) => Ok(engine),
        Ok(Err(e)) => {
            channel.close();
            Err(e)
        }
        Err(_) => {
            channel.close();
            Err(CloudError::Timeout(HANDSHAKE_TIMEOUT.as_millis() as u64))
        }
    }
}

async fn direct_handshake(channel: &RpcChannel, tenant: TenantId, token: Option<&str>) -> Result<EngineRef> {
    let (tx, rx) = oneshot::channel();
    let reply_id = channel.add_stub(Arc::new(DirectReply {
        tx: Mutex::new(Some(tx)),
    }));
    let mut unhandled = channel
        .take_unhandled()
        .ok_or_else(|| CloudError::Protocol("control frames already taken".to_string()))?;

    if let Some(token) = token {
        channel.send_raw(control_frame(&ControlFrame::Auth {
            token: token.to_string(),
        })?)?;
    }
    channel.send_raw(control_frame(&ControlFrame::Direct {
        target: tenant,
        reply_id,
    })?)?;

    let capabilities = tokio::select! {
        biased;
        outcome = rx => outcome.map_err(|_| CloudError::ChannelClosed)??,
        frame = unhandled.recv() => {
            return Err(match frame.as_ref().and_then(ErrorFrame::from_value) {
                Some(error) => error.into(),
                None => CloudError::Protocol(format!("unexpected frame during handshake: {:?}", frame)),
            });
        }
        _ = channel.closed() => return Err(CloudError::Connection("connection closed during handshake".to_string())),
    };

    let mut proxies = capabilities.iter().map(|value| channel.import_proxy(value));
    let mut next = || {
        proxies
            .next()
            .unwrap_or_else(|| Err(CloudError::Protocol("engine sent too few capabilities".to_string())))
    };
    let engine = next()?;
    let websocket = next()?;
    let webhook = next()?;
    tracing::debug!("Direct connection to tenant {} established", tenant);
    Ok(EngineRef::new(tenant, channel.clone(), engine, websocket, webhook))
}

/// Opens a `master` control connection and returns the supervisor proxy.
pub async fn connect_supervisor(addr: &str, token: Option<&str>, connect_timeout: Duration) -> Result<SupervisorProxy> {
    let mut stream = connect(addr, connect_timeout).await?;

    let mut hello = Vec::new();
    if let Some(token) = token {
        hello.extend(encode_frame(&ControlFrame::Auth {
            token: token.to_string(),
        })?);
    }
    hello.extend(encode_frame(&ControlFrame::Master)?);
    stream.write_all(&hello).await?;

    let mut reader = FramedReader::new(stream);
    let rpc_id = tokio::time::timeout(HANDSHAKE_TIMEOUT, async {
        loop {
            let frame = reader
                .read_frame()
                .await?
                .ok_or_else(|| CloudError::Connection("supervisor closed the connection".to_string()))?;
            if let Some(error) = ErrorFrame::from_value(&frame) {
                return Err(CloudError::from(error));
            }
            match ControlFrame::from_value(frame)? {
                ControlFrame::Ready { rpc_id } => return Ok(rpc_id),
                other => tracing::debug!("Ignoring {:?} before ready", other),
            }
        }
    })
    .await
    .map_err(|_| CloudError::Timeout(HANDSHAKE_TIMEOUT.as_millis() as u64))??;

    let (stream, buffered) = reader.into_parts();
    let channel = RpcChannel::over_stream_with_buffer(stream, buffered);
    Ok(SupervisorProxy::new(channel.get_proxy(rpc_id)))
}
