//! # mesh-runner
//!
//! Main entry point for the agent mesh.
//!
//! Loads a JSON topology, provisions every declared endpoint, starts one
//! worker per agent and shuts everything down on SIGINT or SIGTERM.
//!
//! # Usage
//!
//! ```bash
//! mesh-runner config/pipeline.json --log-level debug --json-logs
//! ```

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use mesh_core::config::load_config;
use mesh_core::logging::{LogOptions, init_logging};
use mesh_runner::Supervisor;
use tracing::{error, info};

/// Multi-agent trading pipeline runner.
#[derive(Parser)]
#[command(name = "mesh-runner", about = "Multi-agent trading pipeline runner")]
struct Cli {
    /// Configuration file path (JSON).
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error). Overrides the config.
    #[arg(short, long)]
    log_level: Option<String>,

    /// Optional log directory for file output. Overrides the config.
    #[arg(long)]
    log_dir: Option<String>,

    /// Emit JSON log lines.
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // 1. Load configuration (its logging block feeds step 2)
    let loaded = load_config(&cli.config);
    let logging = loaded.as_ref().map(|c| c.logging.clone()).unwrap_or_default();

    // 2. Initialize logging, CLI flags first
    let level = cli.log_level.as_deref().unwrap_or(&logging.level);
    init_logging(&LogOptions {
        level,
        dir: cli.log_dir.as_deref().or(logging.dir.as_deref()),
        file_prefix: "mesh-runner",
        json: cli.json_logs || logging.json,
    });
    info!("mesh-runner starting, config={}, log_level={level}", cli.config.display());

    let config = match loaded {
        Ok(config) => config,
        Err(e) => {
            error!("{e}");
            return Err(e).context("loading configuration");
        }
    };
    info!(
        "config loaded, {} agent(s), {} endpoint(s)",
        config.topology.len(),
        config.topology.declared_endpoints()
    );

    // 3. Provision endpoints and start agents
    let supervisor = match Supervisor::start(config).await {
        Ok(supervisor) => supervisor,
        Err(e) => {
            error!("startup failed: {e:#}");
            return Err(e);
        }
    };
    info!("press Ctrl+C to stop");

    // 4. Run until signalled, then stop everything
    let summary = supervisor.run_until_signal().await;
    if !summary.aborted.is_empty() {
        error!(agents = ?summary.aborted, "agents had to be aborted");
    }

    info!("goodbye");
    Ok(())
}
