//! # thingcloud entry point
//!
//! ```bash
//! # Run a shard with workers as child processes
//! thingcloud supervisor -l 0.0.0.0:8100 -r ./tenants -t tenants.json
//!
//! # Same, with workers inside the supervisor (development)
//! thingcloud supervisor --in-process
//!
//! # Start tenant 42 on whichever shard owns it
//! thingcloud ctl -s 127.0.0.1:8100 -s 127.0.0.1:8101 start 42
//! ```

use anyhow::Result;
use thingcloud_cli::{commands, Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    let cli: Cli = argh::from_env();

    // ctl prints JSON on stdout for scripts; keep logs out of it.
    if !matches!(cli.command, Commands::Ctl(_)) {
        let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .init();
    }

    match cli.command {
        Commands::Supervisor(args) => commands::run_supervisor(args).await,
        Commands::Worker(args) => commands::run_worker(args).await,
        Commands::Ctl(args) => commands::run_ctl(args).await,
    }
}
