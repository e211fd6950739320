//! Control-plane TCP listener.
//!
//! Every connection starts with newline-delimited control frames. After an
//! optional `auth` frame it picks a role: `master` turns the connection into
//! an RPC channel serving the supervisor API, `direct` hands the socket itself
//! to the worker running the target tenant.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use thingcloud_common::auth::AuthConfig;
use thingcloud_common::protocol::{ControlFrame, ErrorFrame};
use thingcloud_common::rpc::RpcChannel;
use thingcloud_common::transport::{encode_frame, FramedReader};
use thingcloud_common::{CloudError, Result, TenantId};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};

use crate::stub::SupervisorStub;
use crate::supervisor::ProcessSupervisor;

const INVALID_TOKEN: &str = "invalid authentication token";

enum Role {
    Master,
    Direct { target: TenantId, reply_id: String },
}

/// Accepts control connections for one supervisor.
pub struct ControlListener {
    listener: TcpListener,
    supervisor: ProcessSupervisor,
    auth: AuthConfig,
    handshake_timeout: Duration,
}

impl ControlListener {
    /// Binds the control port.
    ///
    /// # Arguments
    /// * `addr` - Address to listen on, e.g. `127.0.0.1:8100`
    /// * `supervisor` - Supervisor served to `master` connections
    /// * `auth` - Token connections must present; disabled means every
    ///   connection starts authenticated
    /// * `handshake_timeout` - Time a connection has to pick its role
    pub async fn bind(
        addr: &str,
        supervisor: ProcessSupervisor,
        auth: AuthConfig,
        handshake_timeout: Duration,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| CloudError::Transport(format!("Failed to bind to {}: {}", addr, e)))?;
        Ok(Self {
            listener,
            supervisor,
            auth,
            handshake_timeout,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .map_err(|e| CloudError::Transport(format!("Failed to get local address: {}", e)))
    }

    /// Accepts connections until the listener fails.
    pub async fn run(self) -> Result<()> {
        tracing::info!("Control listener on {}", self.local_addr()?);
        let auth = Arc::new(self.auth);

        loop {
            let (stream, peer) = self
                .listener
                .accept()
                .await
                .map_err(|e| CloudError::Transport(format!("Failed to accept connection: {}", e)))?;

            let supervisor = self.supervisor.clone();
            let auth = auth.clone();
            let handshake_timeout = self.handshake_timeout;
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, supervisor, &auth, handshake_timeout).await {
                    tracing::debug!("Control connection from {} ended: {}", peer, e);
                }
            });
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    supervisor: ProcessSupervisor,
    auth: &AuthConfig,
    handshake_timeout: Duration,
) -> Result<()> {
    let mut reader = FramedReader::new(stream);

    let role = match tokio::time::timeout(handshake_timeout, handshake(&mut reader, auth)).await {
        Err(_) => {
            tracing::debug!("Control connection picked no role within {:?}", handshake_timeout);
            return Ok(());
        }
        Ok(Ok(Some(role))) => role,
        Ok(Ok(None)) => return Ok(()),
        Ok(Err(frame)) => {
            tracing::debug!("Rejecting control connection: {}", frame.error);
            return write_error(reader.get_mut(), &frame).await;
        }
    };

    match role {
        Role::Direct { target, reply_id } => {
            let (mut stream, buffered) = reader.into_parts();
            if let Err(e) = supervisor.send_socket(target, &stream, reply_id, buffered).await {
                tracing::debug!("Cannot pass connection to tenant {}: {}", target, e);
                write_error(&mut stream, &ErrorFrame::from(&e)).await?;
            }
            Ok(())
        }
        Role::Master => {
            let (stream, buffered) = reader.into_parts();
            serve_master(stream, buffered, supervisor).await
        }
    }
}

/// Reads control frames until the connection picks a role. `None` means the
/// peer hung up first.
async fn handshake(
    reader: &mut FramedReader<TcpStream>,
    auth: &AuthConfig,
) -> std::result::Result<Option<Role>, ErrorFrame> {
    let mut authenticated = !auth.requires_auth();
    loop {
        let frame = match reader.read_frame().await {
            Ok(Some(frame)) => frame,
            Ok(None) => return Ok(None),
            Err(e) => return Err(ErrorFrame::from(&e)),
        };
        let frame = ControlFrame::from_value(frame).map_err(|e| ErrorFrame::from(&e))?;

        match frame {
            ControlFrame::Auth { token } => {
                if !auth.validate_token(&token) {
                    return Err(ErrorFrame::new(INVALID_TOKEN, "EPERM"));
                }
                authenticated = true;
            }
            ControlFrame::NewObject => {}
            ControlFrame::Master | ControlFrame::Direct { .. } if !authenticated => {
                return Err(ErrorFrame::from(&CloudError::Authentication(
                    "connection is not authenticated".to_string(),
                )));
            }
            ControlFrame::Master => return Ok(Some(Role::Master)),
            ControlFrame::Direct { target, reply_id } => return Ok(Some(Role::Direct { target, reply_id })),
            ControlFrame::Ready { .. } => {
                return Err(ErrorFrame::from(&CloudError::Protocol(
                    "unexpected ready frame".to_string(),
                )));
            }
        }
    }
}

async fn serve_master(stream: TcpStream, buffered: Vec<u8>, supervisor: ProcessSupervisor) -> Result<()> {
    let channel = RpcChannel::over_stream_with_buffer(stream, buffered);
    let rpc_id = channel.add_stub(Arc::new(SupervisorStub::new(supervisor)));
    channel.send_raw(serde_json::to_value(ControlFrame::Ready { rpc_id })?)?;
    tracing::info!("Front end attached as master");

    let Some(mut unhandled) = channel.take_unhandled() else {
        return Ok(());
    };
    loop {
        tokio::select! {
            _ = channel.closed() => break,
            frame = unhandled.recv() => match frame {
                Some(frame) => tracing::debug!("Ignoring control frame on master connection: {}", frame),
                None => break,
            },
        }
    }
    tracing::info!("Master connection closed");
    Ok(())
}

async fn write_error(stream: &mut TcpStream, frame: &ErrorFrame) -> Result<()> {
    let bytes = encode_frame(frame)?;
    stream.write_all(&bytes).await?;
    stream.shutdown().await?;
    Ok(())
}
