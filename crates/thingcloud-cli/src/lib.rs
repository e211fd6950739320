// Copyright 2026 thingcloud Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! # thingcloud CLI
//!
//! Command-line entry point for the three roles of a thingcloud deployment:
//!
//! - `thingcloud supervisor`: one shard's process supervisor and its control
//!   listener
//! - `thingcloud worker`: a worker process; started by the supervisor, never
//!   by hand
//! - `thingcloud ctl`: one lifecycle call against a set of shards, printing
//!   raw JSON for scripting
//!
//! Arguments are parsed with `argh`; the commands themselves live in
//! [`commands`].

pub mod commands;

use argh::FromArgs;
use thingcloud_common::TenantId;

/// thingcloud - multi-tenant engine hosting
#[derive(FromArgs, Debug)]
pub struct Cli {
    #[argh(subcommand)]
    pub command: Commands,
}

#[derive(FromArgs, Debug)]
#[argh(subcommand)]
pub enum Commands {
    Supervisor(SupervisorArgs),
    Worker(WorkerArgs),
    Ctl(CtlArgs),
}

/// Arguments for running one supervisor shard.
///
/// # Example
///
/// ```bash
/// THINGCLOUD_CONTROL_TOKEN=s3cret thingcloud supervisor \
///   -l 0.0.0.0:8100 -r /srv/thingcloud/tenants -t /srv/thingcloud/tenants.json
/// ```
#[derive(FromArgs, Debug)]
#[argh(subcommand, name = "supervisor")]
/// run a process supervisor shard
pub struct SupervisorArgs {
    /// address of the control listener
    #[argh(option, short = 'l', default = "\"127.0.0.1:8100\".into()")]
    pub listen: String,

    /// directory holding one working directory per tenant
    #[argh(option, short = 'r', default = "\"./tenants\".into()")]
    pub root: String,

    /// JSON file with the tenant records, re-read on every lookup
    #[argh(option, short = 't', default = "\"tenants.json\".into()")]
    pub tenants: String,

    /// index of this shard
    #[argh(option, long = "shard", default = "0")]
    pub shard: usize,

    /// number of shared worker processes (default: twice the CPU count)
    #[argh(option, long = "shared-processes")]
    pub shared_processes: Option<usize>,

    /// token control connections must present; falls back to
    /// THINGCLOUD_CONTROL_TOKEN, and an empty token disables authentication
    #[argh(option, long = "token")]
    pub token: Option<String>,

    /// sandbox launcher wrapping every worker
    #[argh(option, long = "sandbox")]
    pub sandbox: Option<String>,

    /// extra argument for the sandbox launcher, placed before the worker
    /// command line; may be repeated
    #[argh(option, long = "sandbox-arg")]
    pub sandbox_args: Vec<String>,

    /// worker binary (default: this executable)
    #[argh(option, long = "worker-program")]
    pub worker_program: Option<String>,

    /// run workers as tasks of this process instead of child processes
    #[argh(switch, long = "in-process")]
    pub in_process: bool,

    /// delay before restarting a crashed shared worker, in milliseconds
    #[argh(option, long = "restart-delay-ms", default = "5000")]
    pub restart_delay_ms: u64,

    /// time a worker has to exit before it is killed, in milliseconds
    #[argh(option, long = "kill-timeout-ms", default = "30000")]
    pub kill_timeout_ms: u64,

    /// seconds between status log lines; 0 disables them
    #[argh(option, long = "status-interval", default = "60")]
    pub status_interval_secs: u64,
}

/// Arguments of a worker process.
#[derive(FromArgs, Debug)]
#[argh(subcommand, name = "worker")]
/// run a worker process (started by the supervisor)
pub struct WorkerArgs {
    /// host engines of many tenants
    #[argh(switch, long = "shared")]
    pub shared: bool,

    /// host the engine of this tenant only
    #[argh(option, long = "tenant")]
    pub tenant: Option<TenantId>,

    /// directory holding one working directory per tenant
    #[argh(option, long = "root", default = "\"./tenants\".into()")]
    pub root: String,
}

impl WorkerArgs {
    /// The worker kind, requiring exactly one of `--shared` and `--tenant`.
    pub fn kind(&self) -> Result<thingcloud_worker::WorkerKind, String> {
        match (self.shared, self.tenant) {
            (true, None) => Ok(thingcloud_worker::WorkerKind::Shared),
            (false, Some(tenant)) => Ok(thingcloud_worker::WorkerKind::Dedicated(tenant)),
            _ => Err("exactly one of --shared and --tenant is required".to_string()),
        }
    }
}

/// Arguments for a single lifecycle call.
///
/// # Examples
///
/// ```bash
/// thingcloud ctl -s 127.0.0.1:8100 -s 127.0.0.1:8101 start 42
/// thingcloud ctl -s 127.0.0.1:8100 process-id 42
/// thingcloud ctl -s 127.0.0.1:8100 kill-all
/// ```
#[derive(FromArgs, Debug)]
#[argh(subcommand, name = "ctl")]
/// call a supervisor lifecycle operation
pub struct CtlArgs {
    /// control address of a shard, in shard order; may be repeated
    #[argh(option, short = 's', long = "shard")]
    pub shards: Vec<String>,

    /// control token (default: THINGCLOUD_CONTROL_TOKEN)
    #[argh(option, long = "token")]
    pub token: Option<String>,

    /// one of start, kill, restart, delete, clear-cache,
    /// restart-without-cache, is-running, process-id, info, kill-all
    #[argh(positional)]
    pub action: String,

    /// tenant the action applies to
    #[argh(positional)]
    pub tenant: Option<TenantId>,
}
