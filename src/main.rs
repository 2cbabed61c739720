use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;

use silo::config;
use silo::logging;
use silo::server;

#[derive(Parser, Debug)]
#[command(name = "silo", about = "Caching reverse proxy for package repositories", version)]
struct Cli {
    /// Config file path
    #[arg(short = 'c', long = "config", default_value = "/etc/silo.yaml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let (mut cfg, ignored) = config::load(&cli.config)?;
    logging::init(&cfg.logging, cli.verbose)?;

    if !ignored.is_empty() {
        log::warn!("ignoring unknown config fields: {}", ignored.join(", "));
    }

    cfg.validate()?;

    log::info!("silo starting with config {}", cli.config.display());
    server::run(cfg).await
}
