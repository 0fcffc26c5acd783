//! RNet Daemon - bridge between an RNet serial bus and TCP clients
//!
//! # Usage
//!
//! ```bash
//! # Run with ./rnet.toml
//! rnetd
//!
//! # Explicit configuration and overrides
//! rnetd --config /etc/rnet.toml --port 3001 --bus /dev/ttyUSB1
//!
//! # Use a serial-over-TCP bridge instead of a local device
//! rnetd --bus 192.168.1.20:4001
//!
//! # Validate the configuration and exit
//! rnetd check
//!
//! # Enable debug logging
//! RUST_LOG=rnetd=debug rnetd
//! ```
//!
//! # Signal Handling
//!
//! - SIGTERM/SIGINT: Graceful shutdown
//! - SIGHUP: Re-read the server name from the configuration and re-advertise

use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use rnetd::bridge::{Bridge, BridgeOptions};
use rnetd::config::{BusEndpoint, Config, DEFAULT_CONFIG_PATH};
use rnetd::discovery::{Context, DisabledPublisher, LogPublisher, ServicePublisher};
use rnetd::serial::connector_for;

/// RNet bridge daemon
#[derive(Parser, Debug)]
#[command(name = "rnetd", version, about)]
struct Args {
    /// Configuration file
    #[arg(short, long, env = "RNET_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// TCP port to listen on (overrides the configuration)
    #[arg(short, long)]
    port: Option<u16>,

    /// Bus device path or serial bridge host:port (overrides the configuration)
    #[arg(short, long)]
    bus: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the bridge (default)
    Run,
    /// Validate the configuration and print a summary
    Check,
}

/// Log directives used when `RUST_LOG` is not set.
const DEFAULT_LOG_FILTER: &str = "rnetd=info,rnet_core=info,rnet_protocol=info";

/// `RUST_LOG` wins outright; the defaults apply only without it.
fn log_filter(rust_log: Option<&str>) -> EnvFilter {
    match rust_log {
        Some(directives) if !directives.trim().is_empty() => EnvFilter::new(directives),
        _ => EnvFilter::new(DEFAULT_LOG_FILTER),
    }
}

/// Loads the configuration and applies command-line overrides.
fn load_config(args: &Args) -> Result<Config> {
    let mut config = Config::load(&args.config)
        .with_context(|| format!("Failed to load {}", args.config.display()))?;

    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(bus) = &args.bus {
        config.bus.set_endpoint(BusEndpoint::parse(bus));
    }
    config.validate()?;
    config.bus.endpoint()?;
    Ok(config)
}

fn main() -> Result<()> {
    let args = Args::parse();
    match args.command {
        Some(Command::Check) => {
            let config = match load_config(&args) {
                Ok(config) => config,
                Err(e) => {
                    eprintln!("Invalid configuration: {e:#}");
                    process::exit(1);
                }
            };
            let zones: usize = config.controllers.iter().map(|c| c.zones.len()).sum();
            println!("Configuration OK: {}", args.config.display());
            println!("  name:        {}", config.name);
            println!("  listen:      {}", config.server.bind_addr()?);
            println!("  bus:         {:?}", config.bus.endpoint()?);
            println!("  controllers: {}", config.controllers.len());
            println!("  zones:       {zones}");
            println!("  sources:     {}", config.sources.len());
            Ok(())
        }
        Some(Command::Run) | None => run_daemon(args),
    }
}

/// Runs the daemon (async entry point).
#[tokio::main]
async fn run_daemon(args: Args) -> Result<()> {
    let rust_log = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    tracing_subscriber::fmt()
        .with_env_filter(log_filter(rust_log.as_deref()))
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = process::id(),
        "RNet daemon starting"
    );

    let config = load_config(&args)?;
    let endpoint = config.bus.endpoint()?;

    let publisher: Arc<dyn ServicePublisher> = if config.discovery.enabled {
        Arc::new(LogPublisher)
    } else {
        Arc::new(DisabledPublisher)
    };
    let ctx = Context::new(publisher, config.discovery.service_type.clone());

    let bridge = Bridge::start(
        config.build_store(),
        BridgeOptions::from_config(&config)?,
        connector_for(&endpoint, config.bus.baud_rate),
        &ctx,
    )
    .await
    .context("Failed to start bridge")?;

    info!(
        addr = %bridge.local_addr(),
        bus = ?endpoint,
        name = %bridge.name(),
        "Bridge running"
    );

    if let Err(e) = wait_for_shutdown_signal(&bridge, &args.config).await {
        error!(error = %e, "Error waiting for shutdown signal");
    }
    info!("Shutdown signal received");

    bridge.shutdown().await;
    info!("RNet daemon stopped");
    Ok(())
}

/// Waits for a shutdown signal (SIGTERM or SIGINT), renaming on SIGHUP.
async fn wait_for_shutdown_signal(bridge: &Bridge, config_path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sighup = signal(SignalKind::hangup())?;

        loop {
            tokio::select! {
                _ = sigterm.recv() => {
                    info!("Received SIGTERM");
                    break;
                }
                _ = sigint.recv() => {
                    info!("Received SIGINT");
                    break;
                }
                _ = sighup.recv() => {
                    info!("Received SIGHUP, reloading server name");
                    match Config::load(config_path) {
                        Ok(config) if config.name != bridge.name() => bridge.rename(config.name),
                        Ok(_) => info!("Server name unchanged"),
                        Err(e) => warn!(error = %e, "Failed to reload configuration"),
                    }
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = (bridge, config_path);
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rust_log_overrides_default_level() {
        let filter = log_filter(Some("rnetd=debug")).to_string();
        assert!(filter.contains("rnetd=debug"), "{filter}");
        assert!(!filter.contains("rnetd=info"), "{filter}");
    }

    #[test]
    fn test_default_filter_without_rust_log() {
        for unset in [None, Some(""), Some("  ")] {
            let filter = log_filter(unset).to_string();
            assert!(filter.contains("rnetd=info"), "{filter}");
            assert!(filter.contains("rnet_protocol=info"), "{filter}");
        }
    }
}
