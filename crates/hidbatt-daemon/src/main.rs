//! hidbatt daemon - main entry point
//!
//! Tracks battery state of Logitech peripherals from the local HID++
//! protocol and from G HUB, serves the merged registry over HTTP and
//! optionally publishes it to an MQTT broker.

mod api;
mod config;
mod mqtt;
mod server;
mod state;
mod ws;

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "hidbatt")]
#[command(about = "Battery monitor for Logitech HID++ and G HUB devices")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "hidbatt.toml")]
    config: PathBuf,

    /// Bind address for the HTTP feed
    #[arg(short, long)]
    bind: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Shorthand for debug logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = config::load_config(&args.config)?;
    if let Some(bind) = args.bind {
        config.daemon.bind = bind;
    }

    let level = config
        .logging
        .effective_level(&args.log_level, args.verbose);
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    info!("hidbatt v{}", env!("CARGO_PKG_VERSION"));
    info!(
        path = %args.config.display(),
        found = args.config.exists(),
        native = config.native.enabled,
        ghub = config.ghub.enabled,
        mqtt = config.mqtt.enabled,
        "Configuration loaded"
    );

    config.validate()?;

    let state = state::AppState::new(config.clone()).await?;

    if config.daemon.http_enabled {
        server::run(state, &config.daemon.bind).await?;
    } else {
        info!("HTTP feed disabled, running until interrupted");
        tokio::signal::ctrl_c().await?;
    }

    Ok(())
}
