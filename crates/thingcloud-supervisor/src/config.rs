use std::path::PathBuf;
use std::time::Duration;

use thingcloud_common::auth::AuthConfig;

/// Default delay before a crashed shared worker is replaced.
pub const DEFAULT_RESTART_DELAY: Duration = Duration::from_secs(5);
/// Default grace period between `exit` and a hard kill.
pub const DEFAULT_KILL_TIMEOUT: Duration = Duration::from_secs(30);
/// Default time a control connection has to pick its role.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);
/// Default time a new worker has to report ready.
pub const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(30);

/// Sandbox launcher wrapping every worker process.
///
/// The launcher is run as `<launcher> <args..> <worker program> <worker args..>`
/// and must report the real worker PID on the side channel.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    pub launcher: PathBuf,
    pub args: Vec<String>,
}

impl SandboxConfig {
    pub fn new(launcher: impl Into<PathBuf>) -> Self {
        Self {
            launcher: launcher.into(),
            args: Vec::new(),
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }
}

/// Configuration of one supervisor shard.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Index of this shard, used in logs.
    ///
    /// Default: 0
    pub shard_id: usize,
    /// Directory holding one working directory per tenant.
    ///
    /// Default: `./tenants`
    pub root_dir: PathBuf,
    /// Number of shared worker processes.
    ///
    /// Default: twice the available parallelism
    pub shared_processes: usize,
    /// Token front ends must present on control connections.
    ///
    /// Default: disabled
    pub auth: AuthConfig,
    /// Delay before replacing a crashed shared worker.
    ///
    /// Default: 5 seconds
    pub restart_delay: Duration,
    /// Grace period for a worker to exit after `exit` before it is killed.
    ///
    /// Default: 30 seconds
    pub kill_timeout: Duration,
    /// Time a control connection has to select its role.
    ///
    /// Default: 30 seconds
    pub handshake_timeout: Duration,
    /// Time a new worker has to report ready.
    ///
    /// Default: 30 seconds
    pub startup_timeout: Duration,
    /// Optional sandbox wrapping every worker.
    pub sandbox: Option<SandboxConfig>,
    /// Worker binary; the running executable when unset.
    pub worker_program: Option<PathBuf>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            shard_id: 0,
            root_dir: PathBuf::from("./tenants"),
            shared_processes: default_shared_processes(),
            auth: AuthConfig::disabled(),
            restart_delay: DEFAULT_RESTART_DELAY,
            kill_timeout: DEFAULT_KILL_TIMEOUT,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
            sandbox: None,
            worker_program: None,
        }
    }
}

/// Twice the host's available parallelism.
pub fn default_shared_processes() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get() * 2)
        .unwrap_or(2)
}

impl SupervisorConfig {
    pub fn new(root_dir: impl Into<PathBuf>) -> Self {
        Self {
            root_dir: root_dir.into(),
            ..Self::default()
        }
    }

    pub fn with_shard_id(mut self, shard_id: usize) -> Self {
        self.shard_id = shard_id;
        self
    }

    pub fn with_shared_processes(mut self, count: usize) -> Self {
        self.shared_processes = count;
        self
    }

    pub fn with_auth(mut self, auth: AuthConfig) -> Self {
        self.auth = auth;
        self
    }

    pub fn with_restart_delay(mut self, delay: Duration) -> Self {
        self.restart_delay = delay;
        self
    }

    pub fn with_kill_timeout(mut self, timeout: Duration) -> Self {
        self.kill_timeout = timeout;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    pub fn with_sandbox(mut self, sandbox: SandboxConfig) -> Self {
        self.sandbox = Some(sandbox);
        self
    }

    pub fn with_worker_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.worker_program = Some(program.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SupervisorConfig::default();
        assert_eq!(config.restart_delay, Duration::from_secs(5));
        assert_eq!(config.kill_timeout, Duration::from_secs(30));
        assert!(config.shared_processes >= 2);
        assert_eq!(config.shared_processes % 2, 0);
        assert!(!config.auth.requires_auth());
    }

    #[test]
    fn test_builders() {
        let config = SupervisorConfig::new("/tmp/tc")
            .with_shard_id(3)
            .with_shared_processes(1)
            .with_auth(AuthConfig::with_token("t"))
            .with_kill_timeout(Duration::from_millis(200))
            .with_sandbox(SandboxConfig::new("/usr/bin/sandbox").with_args(vec!["-q".into()]));
        assert_eq!(config.shard_id, 3);
        assert_eq!(config.shared_processes, 1);
        assert!(config.auth.requires_auth());
        assert_eq!(config.kill_timeout, Duration::from_millis(200));
        assert_eq!(config.sandbox.unwrap().args, vec!["-q".to_string()]);
    }
}
