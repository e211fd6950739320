use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CloudError;

/// Key marking an exported stub inside a value: `{"$rpcStub": id, "methods": [..]}`.
pub const STUB_MARKER: &str = "$rpcStub";
/// Key marking a reference back to the receiver's own stub: `{"$rpcProxy": id}`.
pub const PROXY_MARKER: &str = "$rpcProxy";

/// Frames carried by an RPC channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "rpc", rename_all = "kebab-case")]
pub enum RpcMessage {
    Call {
        id: u64,
        target: String,
        method: String,
        #[serde(default)]
        args: Vec<Value>,
    },
    Reply {
        id: u64,
        #[serde(default)]
        result: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<RpcError>,
    },
    Release {
        target: String,
    },
}

impl RpcMessage {
    /// Whether a raw frame belongs to the RPC layer at all.
    pub fn is_rpc_frame(frame: &Value) -> bool {
        frame.get("rpc").is_some()
    }
}

/// Error payload of a failed call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RpcError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl From<&CloudError> for RpcError {
    fn from(err: &CloudError) -> Self {
        match err {
            CloudError::Remote { message, code } => RpcError {
                message: message.clone(),
                code: code.clone(),
            },
            _ => RpcError {
                message: err.to_string(),
                code: Some(err.code().to_string()),
            },
        }
    }
}

impl From<RpcError> for CloudError {
    fn from(err: RpcError) -> Self {
        CloudError::Remote {
            message: err.message,
            code: err.code,
        }
    }
}
