//! CLI entry point: parses flags, loads configuration, wires the rule store,
//! broadcaster, CA, interceptor, and control plane together, and runs until a
//! shutdown signal arrives.

mod config;
mod server;
mod sweeper;

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use config::ConfigLoader;

#[derive(Parser)]
#[command(name = "warden")]
#[command(author, version, about = "Intercepting HTTP(S) forward proxy", long_about = None)]
struct Cli {
    /// Path to configuration file (defaults to configs/config.yaml if present)
    #[arg(short, long, global = true, env = "WARDEN_CONFIG")]
    config: Option<PathBuf>,

    /// Directory holding ca.crt/ca.key (created on first run if absent)
    #[arg(long, default_value = "certs")]
    ca_dir: PathBuf,
}

fn init_logging(fallback_level: &str) {
    let fallback = format!("{fallback_level},warden=debug");
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let app_config = ConfigLoader::new().with_cli_path(cli.config).load();

    init_logging(&app_config.logging.level);

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "warden starting");

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;

    runtime.block_on(server::run(app_config, cli.ca_dir))
}
