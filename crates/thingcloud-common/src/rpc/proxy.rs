use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::{json, Value};

use super::message::PROXY_MARKER;
use super::RpcChannel;
use crate::error::{CloudError, Result};

/// Local stand-in for a stub owned by the peer.
#[derive(Clone)]
pub struct Proxy {
    channel: RpcChannel,
    id: String,
    methods: Option<Arc<[String]>>,
}

impl Proxy {
    pub(crate) fn new(channel: RpcChannel, id: String, methods: Option<Arc<[String]>>) -> Self {
        Self { channel, id, methods }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn channel(&self) -> &RpcChannel {
        &self.channel
    }

    /// Method names advertised by the peer, when the proxy came from an export.
    pub fn methods(&self) -> Option<&[String]> {
        self.methods.as_deref()
    }

    /// Calls `method` on the remote object.
    ///
    /// Methods missing from the advertised list fail locally without a round
    /// trip.
    pub async fn call(&self, method: &str, args: Vec<Value>) -> Result<Value> {
        if let Some(methods) = &self.methods {
            if !methods.iter().any(|m| m == method) {
                return Err(CloudError::MethodNotAllowed {
                    target: self.id.clone(),
                    method: method.to_string(),
                });
            }
        }
        self.channel.call(&self.id, method, args).await
    }

    /// Calls `method` and deserializes the result.
    pub async fn call_as<T: DeserializeOwned>(&self, method: &str, args: Vec<Value>) -> Result<T> {
        let value = self.call(method, args).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Tells the owner this reference is gone. A no-op on a closed channel.
    pub fn release(self) {
        self.channel.send_release(&self.id);
    }

    /// Encodes a reference the owner resolves back to its own stub.
    pub fn to_value(&self) -> Value {
        json!({ PROXY_MARKER: self.id })
    }
}

impl fmt::Debug for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Proxy").field("id", &self.id).finish()
    }
}
