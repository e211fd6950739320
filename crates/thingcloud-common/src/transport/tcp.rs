use std::net::ToSocketAddrs;
use std::time::Duration;

use tokio::net::TcpStream;

use crate::error::{CloudError, Result};

/// Default timeout for establishing a TCP connection (5 seconds)
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Connects to a `host:port` address, trying every resolved address in turn.
///
/// # Errors
///
/// Returns `CloudError::Connection` if the address cannot be resolved or no
/// resolved address accepts the connection within `timeout`.
pub async fn connect(addr: &str, timeout: Duration) -> Result<TcpStream> {
    let socket_addrs = addr
        .to_socket_addrs()
        .map_err(|e| CloudError::Connection(format!("Invalid address '{}': {}", addr, e)))?;

    let mut last_err = None;
    for socket_addr in socket_addrs {
        match tokio::time::timeout(timeout, TcpStream::connect(&socket_addr)).await {
            Ok(Ok(stream)) => {
                stream.set_nodelay(true)?;
                return Ok(stream);
            }
            Ok(Err(e)) => last_err = Some(e.to_string()),
            Err(_) => last_err = Some(format!("timed out after {}ms", timeout.as_millis())),
        }
    }

    Err(CloudError::Connection(format!(
        "Failed to connect to {}: {}",
        addr,
        last_err.unwrap_or_else(|| "no addresses resolved".to_string())
    )))
}
