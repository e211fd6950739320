use std::sync::Arc;

use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde_json::Value;

use super::RpcChannel;
use crate::error::{CloudError, Result};

/// A local object callable from the peer.
///
/// `invoke` is only called for names listed in [`methods`](Stub::methods);
/// anything else is rejected by the channel with `EPERM`.
pub trait Stub: Send + Sync + 'static {
    fn methods(&self) -> &'static [&'static str];

    /// Runs `method`. `channel` is the channel the call arrived on, used to
    /// import objects passed as arguments or export objects returned.
    fn invoke(
        self: Arc<Self>,
        method: String,
        args: Vec<Value>,
        channel: RpcChannel,
    ) -> BoxFuture<'static, Result<Value>>;

    /// Called once the last export of this stub is released.
    fn on_released(&self) {}
}

/// Deserializes positional argument `index`; a missing argument reads as `null`.
pub fn arg<T: DeserializeOwned>(args: &[Value], index: usize) -> Result<T> {
    let value = args.get(index).cloned().unwrap_or(Value::Null);
    serde_json::from_value(value)
        .map_err(|e| CloudError::InvalidArgument(format!("argument {}: {}", index, e)))
}
