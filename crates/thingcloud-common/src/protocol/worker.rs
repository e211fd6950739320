use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::TenantId;

/// Envelope for every message on the supervisor ↔ worker channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum WorkerMessage {
    /// Stop every engine and exit.
    Exit,
    /// Hand-off of a front-end connection; the socket travels alongside.
    Direct {
        target: TenantId,
        #[serde(rename = "replyId")]
        reply_id: String,
        /// Bytes the listener read past the `direct` frame.
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        buffered: Vec<u8>,
    },
    Rpc {
        data: Value,
    },
    Ready {
        id: String,
    },
}

impl WorkerMessage {
    pub fn carries_fd(&self) -> bool {
        matches!(self, WorkerMessage::Direct { .. })
    }
}
