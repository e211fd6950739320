use std::sync::Arc;

use thiserror::Error;

use crate::protocol::TenantId;

#[derive(Error, Debug)]
pub enum CloudError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("JSON serialization error: {0}")]
    JsonSerialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("RPC channel closed")]
    ChannelClosed,

    #[error("{message}")]
    Remote {
        message: String,
        code: Option<String>,
    },

    #[error("No such RPC object: {0}")]
    UnknownObject(String),

    #[error("Method {method} is not exposed by object {target}")]
    MethodNotAllowed { target: String, method: String },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("No engine running for tenant {0}")]
    NoSuchEngine(TenantId),

    #[error("Unknown tenant {0}")]
    UnknownTenant(TenantId),

    #[error("Engine for tenant {0} is already running")]
    AlreadyRunning(TenantId),

    #[error("Engine for tenant {0} was stopped while starting")]
    EngineStopped(TenantId),

    #[error("Supervisor for shard {0} is unreachable")]
    SupervisorUnreachable(usize),

    #[error("Invalid shard {shard} (have {count} shards)")]
    InvalidShard { shard: usize, count: usize },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to spawn worker: {0}")]
    Spawn(String),

    #[error("Operation timed out after {0}ms")]
    Timeout(u64),

    #[error(transparent)]
    Shared(Arc<CloudError>),
}

impl CloudError {
    /// Short machine-readable code sent alongside error messages on the wire.
    pub fn code(&self) -> &str {
        match self {
            CloudError::Remote { code: Some(code), .. } => code,
            CloudError::Remote { code: None, .. } => "EREMOTE",
            CloudError::Transport(_) | CloudError::Connection(_) => "ECONNREFUSED",
            CloudError::JsonSerialization(_) | CloudError::Protocol(_) => "EPROTO",
            CloudError::Io(_) => "EIO",
            CloudError::ChannelClosed => "ECONNRESET",
            CloudError::UnknownObject(_) | CloudError::NoSuchEngine(_) | CloudError::UnknownTenant(_) => "ENOENT",
            CloudError::MethodNotAllowed { .. } | CloudError::Authentication(_) => "EPERM",
            CloudError::InvalidArgument(_) | CloudError::InvalidShard { .. } | CloudError::Config(_) => "EINVAL",
            CloudError::AlreadyRunning(_) => "EEXIST",
            CloudError::EngineStopped(_) => "ECANCELED",
            CloudError::SupervisorUnreachable(_) => "EHOSTUNREACH",
            CloudError::Spawn(_) => "ECHILD",
            CloudError::Timeout(_) => "ETIMEDOUT",
            CloudError::Shared(inner) => inner.code(),
        }
    }

    /// Whether the error means the peer (channel or process) is gone.
    pub fn is_disconnect(&self) -> bool {
        match self {
            CloudError::ChannelClosed | CloudError::Connection(_) => true,
            CloudError::Shared(inner) => inner.is_disconnect(),
            _ => false,
        }
    }
}

impl From<rustix::io::Errno> for CloudError {
    fn from(err: rustix::io::Errno) -> Self {
        CloudError::Io(err.into())
    }
}

pub type Result<T> = std::result::Result<T, CloudError>;
