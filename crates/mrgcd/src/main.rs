//! mrgcd — the MRGC daemon.
//!
//! Single binary that assembles one region's control plane:
//! - State store (redb replica)
//! - Node registry
//! - Health monitor
//! - Failover controller
//! - Autoscaler
//! - Store purge loop
//! - REST API
//!
//! # Usage
//!
//! ```text
//! mrgcd run --config /etc/mrgc/us-east-1.toml --data-dir /var/lib/mrgc
//! mrgcd check-config --config /etc/mrgc/us-east-1.toml
//! ```

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use mrgc_core::ControlPlaneConfig;
use tracing::info;
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "info,mrgcd=debug,mrgc=debug";

#[derive(Parser)]
#[command(name = "mrgcd", about = "Multi-region GPU control plane daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the control plane for one region.
    Run {
        /// Path to the TOML configuration file.
        #[arg(long)]
        config: PathBuf,

        /// Override the configured region.
        #[arg(long)]
        region: Option<String>,

        /// Data directory for the local state replica.
        #[arg(long, default_value = "/var/lib/mrgc")]
        data_dir: PathBuf,

        /// Port for the REST API.
        #[arg(long, default_value = "8080")]
        port: u16,

        /// Emit logs as JSON lines.
        #[arg(long)]
        log_json: bool,
    },
    /// Validate a configuration file and print the effective settings.
    CheckConfig {
        #[arg(long)]
        config: PathBuf,
    },
}

fn init_tracing(json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            config,
            region,
            data_dir,
            port,
            log_json,
        } => {
            init_tracing(log_json);
            let mut cfg = ControlPlaneConfig::load(&config)?;
            if let Some(region) = region {
                cfg.region = region;
                cfg.validate()?;
            }
            info!(config = %config.display(), region = %cfg.region, "configuration loaded");
            mrgcd::run(cfg, &data_dir, port).await
        }
        Command::CheckConfig { config } => {
            init_tracing(false);
            let cfg = ControlPlaneConfig::load(&config)?;
            print!("{}", cfg.to_toml_string()?);
            Ok(())
        }
    }
}
