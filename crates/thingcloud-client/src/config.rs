use std::time::Duration;

use thingcloud_common::transport::DEFAULT_CONNECT_TIMEOUT;

/// Default delay between reconnection attempts to a supervisor.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Configuration of a front end talking to local-process supervisors.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Control address of every shard, indexed by shard id.
    pub shards: Vec<String>,
    /// Token presented on every control connection.
    pub auth_token: Option<String>,
    /// Delay before reconnecting to a supervisor that went away.
    ///
    /// Default: 5 seconds
    pub reconnect_delay: Duration,
    /// Timeout for opening a TCP connection.
    ///
    /// Default: 5 seconds
    pub connect_timeout: Duration,
}

impl ClientConfig {
    pub fn new(shards: Vec<String>) -> Self {
        Self {
            shards,
            auth_token: None,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

/// Configuration of the cluster-native backend.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Base URL of the cluster API, e.g. `http://127.0.0.1:8001`.
    pub api_url: String,
    /// Namespace holding the `Engine` resources.
    ///
    /// Default: `default`
    pub namespace: String,
    /// Bearer token for the cluster API.
    pub bearer_token: Option<String>,
    /// Token presented on direct engine connections.
    pub auth_token: Option<String>,
    /// How long `start_user` waits for an engine to run.
    ///
    /// Default: 120 seconds
    pub start_timeout: Duration,
    /// Interval between status polls.
    ///
    /// Default: 1 second
    pub poll_interval: Duration,
    /// Timeout of a single API request.
    ///
    /// Default: 30 seconds
    pub request_timeout: Duration,
    /// Timeout for opening direct connections.
    ///
    /// Default: 5 seconds
    pub connect_timeout: Duration,
}

impl ClusterConfig {
    pub fn new(api_url: impl Into<String>) -> Self {
        Self {
            api_url: api_url.into(),
            namespace: "default".to_string(),
            bearer_token: None,
            auth_token: None,
            start_timeout: Duration::from_secs(120),
            poll_interval: Duration::from_secs(1),
            request_timeout: Duration::from_secs(30),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }

    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    pub fn with_start_timeout(mut self, timeout: Duration) -> Self {
        self.start_timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}
