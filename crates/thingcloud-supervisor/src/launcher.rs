//! Starting worker processes.
//!
//! [`ProcessLauncher`] runs the worker binary (`thingcloud worker ...`) with
//! one end of a Unix socket pair inherited as [`IPC_FD_ENV`]. With a sandbox
//! configured, the sandbox launcher is run instead, with the worker command
//! line appended to its own arguments. It gets a second inherited socket,
//! named by [`SANDBOX_FD_ENV`], on which it reports the PID of the real worker
//! as `{"child-pid": N}`; hard kills go to that PID.

use std::io;
use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream as StdUnixStream;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, OnceLock};

use futures::future::BoxFuture;
use rustix::io::{fcntl_setfd, FdFlags};
use rustix::process::{kill_process, Pid, Signal};
use thingcloud_common::transport::{FramedReader, IpcChannel, IPC_FD_ENV};
use thingcloud_common::{CloudError, Result, TenantId};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

use crate::config::{SandboxConfig, SupervisorConfig};
use crate::process::{WorkerId, WorkerKind};

/// Environment variable naming the sandbox side-channel descriptor.
pub const SANDBOX_FD_ENV: &str = "THINGCLOUD_SANDBOX_FD";

/// What to start.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub id: WorkerId,
    pub kind: WorkerKind,
    pub root: PathBuf,
}

impl LaunchSpec {
    /// Worker command line, after the program name.
    pub fn worker_args(&self) -> Vec<String> {
        let mut args = vec!["worker".to_string()];
        match self.kind {
            WorkerKind::Shared(_) => args.push("--shared".to_string()),
            WorkerKind::Dedicated(tenant) => {
                args.push("--tenant".to_string());
                args.push(tenant.to_string());
            }
        }
        args.push("--root".to_string());
        args.push(self.root.display().to_string());
        args
    }

    pub fn tenant(&self) -> Option<TenantId> {
        match self.kind {
            WorkerKind::Dedicated(tenant) => Some(tenant),
            WorkerKind::Shared(_) => None,
        }
    }
}

/// A started worker: its IPC channel and a handle on the process.
pub struct LaunchedWorker {
    pub ipc: IpcChannel,
    pub handle: Arc<dyn ProcessHandle>,
}

/// Control over a running worker process.
pub trait ProcessHandle: Send + Sync + 'static {
    /// PID of the process the supervisor started.
    fn pid(&self) -> Option<u32>;

    /// PID of the worker inside the sandbox, once reported.
    fn inner_pid(&self) -> Option<u32> {
        None
    }

    /// Resolves with the exit code once the process is gone; `None` when it
    /// was killed by a signal.
    fn wait(&self) -> BoxFuture<'_, Option<i32>>;

    /// Sends SIGKILL (or its equivalent) to the worker.
    fn hard_kill(&self) -> Result<()>;
}

/// Starts worker processes.
pub trait WorkerLauncher: Send + Sync + 'static {
    fn launch<'a>(&'a self, spec: &'a LaunchSpec) -> BoxFuture<'a, Result<LaunchedWorker>>;
}

/// Launches workers as child processes of the supervisor.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    program: PathBuf,
    sandbox: Option<SandboxConfig>,
}

impl ProcessLauncher {
    pub fn new(program: impl Into<PathBuf>, sandbox: Option<SandboxConfig>) -> Self {
        Self {
            program: program.into(),
            sandbox,
        }
    }

    /// Uses the configured worker program, or the running executable.
    pub fn from_config(config: &SupervisorConfig) -> Result<Self> {
        let program = match &config.worker_program {
            Some(program) => program.clone(),
            None => std::env::current_exe()
                .map_err(|e| CloudError::Config(format!("cannot locate worker executable: {}", e)))?,
        };
        Ok(Self::new(program, config.sandbox.clone()))
    }

    fn command(&self, spec: &LaunchSpec) -> Command {
        let mut command = match &self.sandbox {
            Some(sandbox) => {
                let mut command = Command::new(&sandbox.launcher);
                command.args(&sandbox.args).arg(&self.program);
                command
            }
            None => Command::new(&self.program),
        };
        command
            .args(spec.worker_args())
            .stdin(Stdio::null())
            .kill_on_drop(false);
        command
    }

    async fn spawn(&self, spec: &LaunchSpec) -> Result<LaunchedWorker> {
        let (parent_ipc, child_ipc) = StdUnixStream::pair()?;
        let child_ipc = OwnedFd::from(child_ipc);

        let side_channel = match self.sandbox {
            Some(_) => {
                let (parent, child) = StdUnixStream::pair()?;
                Some((parent, OwnedFd::from(child)))
            }
            None => None,
        };

        let mut command = self.command(spec);
        command.env(IPC_FD_ENV, child_ipc.as_raw_fd().to_string());
        let mut inherited: Vec<RawFd> = vec![child_ipc.as_raw_fd()];
        if let Some((_, child_side)) = &side_channel {
            command.env(SANDBOX_FD_ENV, child_side.as_raw_fd().to_string());
            inherited.push(child_side.as_raw_fd());
        }

        // SAFETY: the closure only calls fcntl on descriptors that stay open
        // in the parent until spawn returns, which is async-signal-safe.
        unsafe {
            command.pre_exec(move || {
                for fd in &inherited {
                    fcntl_setfd(BorrowedFd::borrow_raw(*fd), FdFlags::empty()).map_err(io::Error::from)?;
                }
                Ok(())
            });
        }

        let child = command
            .spawn()
            .map_err(|e| CloudError::Spawn(format!("{}: {}", self.program.display(), e)))?;
        drop(child_ipc);

        let handle = Arc::new(ChildHandle::new(child));
        if let Some((parent_side, child_side)) = side_channel {
            drop(child_side);
            handle.watch_side_channel(parent_side)?;
        }

        tracing::info!(
            "Launched worker {} (pid {})",
            spec.id,
            handle.pid().map(|pid| pid.to_string()).unwrap_or_else(|| "?".to_string())
        );
        Ok(LaunchedWorker {
            ipc: IpcChannel::from_std(parent_ipc)?,
            handle,
        })
    }
}

impl WorkerLauncher for ProcessLauncher {
    fn launch<'a>(&'a self, spec: &'a LaunchSpec) -> BoxFuture<'a, Result<LaunchedWorker>> {
        Box::pin(self.spawn(spec))
    }
}

/// A worker running as a child process.
pub struct ChildHandle {
    pid: Option<u32>,
    inner_pid: Arc<OnceLock<u32>>,
    child: Mutex<Child>,
}

impl ChildHandle {
    pub fn new(child: Child) -> Self {
        Self {
            pid: child.id(),
            inner_pid: Arc::new(OnceLock::new()),
            child: Mutex::new(child),
        }
    }

    fn watch_side_channel(&self, stream: StdUnixStream) -> Result<()> {
        stream.set_nonblocking(true)?;
        let stream = tokio::net::UnixStream::from_std(stream)?;
        let inner_pid = self.inner_pid.clone();
        let pid = self.pid;
        tokio::spawn(async move {
            let mut reader = FramedReader::new(stream);
            match reader.read_frame().await {
                Ok(Some(frame)) => match frame.get("child-pid").and_then(|v| v.as_u64()) {
                    Some(child_pid) => {
                        tracing::debug!("Sandbox {:?} runs worker pid {}", pid, child_pid);
                        let _ = inner_pid.set(child_pid as u32);
                    }
                    None => tracing::warn!("Malformed sandbox report: {}", frame),
                },
                Ok(None) => tracing::debug!("Sandbox {:?} closed its side channel", pid),
                Err(e) => tracing::warn!("Failed to read sandbox side channel: {}", e),
            }
        });
        Ok(())
    }
}

fn exit_code(status: io::Result<ExitStatus>) -> Option<i32> {
    match status {
        Ok(status) => status.code(),
        Err(e) => {
            tracing::warn!("Failed to wait for worker: {}", e);
            None
        }
    }
}

impl ProcessHandle for ChildHandle {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn inner_pid(&self) -> Option<u32> {
        self.inner_pid.get().copied()
    }

    fn wait(&self) -> BoxFuture<'_, Option<i32>> {
        Box::pin(async move {
            let mut child = self.child.lock().await;
            exit_code(child.wait().await)
        })
    }

    fn hard_kill(&self) -> Result<()> {
        let target = self
            .inner_pid()
            .or(self.pid)
            .ok_or_else(|| CloudError::Spawn("worker has no pid".to_string()))?;
        let pid = i32::try_from(target)
            .ok()
            .and_then(Pid::from_raw)
            .ok_or_else(|| CloudError::Spawn(format!("invalid pid {}", target)))?;
        kill_process(pid, Signal::KILL)?;
        Ok(())
    }
}
