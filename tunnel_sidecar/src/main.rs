//! Tunnel sidecar daemon
//!
//! Runs as the entrypoint of a privileged container: brings the tunnel up,
//! locks egress to it, starts the proxy daemons and serves the health and
//! metrics endpoints until it is told to stop.

use clap::Parser;
use shared_utils::logging::{init_logging, init_logging_from_config, LogOptions};
use shared_utils::SidecarConfig;
use std::path::PathBuf;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tunnel_sidecar::{Facilities, Sidecar, SidecarError};

/// Command-line arguments for the sidecar
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Path to a TOML configuration file. Without one, defaults and
    /// environment variables are used.
    #[clap(short, long)]
    config: Option<PathBuf>,

    /// Override the configured log level
    #[clap(short, long)]
    log_level: Option<String>,

    /// Print the effective configuration and exit
    #[clap(long)]
    check_config: bool,
}

fn load_config(args: &Args) -> Result<SidecarConfig, SidecarError> {
    let mut config = match &args.config {
        Some(path) => SidecarConfig::load(path)?,
        None => SidecarConfig::from_env()?,
    };
    if let Some(level) = &args.log_level {
        config.log_level = level.clone();
    }
    Ok(config)
}

/// Cancel `token` on the first SIGTERM, SIGINT or SIGQUIT.
fn watch_signals(token: CancellationToken) -> std::io::Result<()> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigquit = signal(SignalKind::quit())?;

    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down"),
            _ = sigint.recv() => info!("Received SIGINT, shutting down"),
            _ = sigquit.recv() => info!("Received SIGQUIT, shutting down"),
        }
        token.cancel();
    });
    Ok(())
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            let guard = init_logging(LogOptions::default());
            error!("Invalid configuration: {}", e);
            drop(guard);
            std::process::exit(e.exit_code());
        }
    };

    if args.check_config {
        match config.to_toml_string() {
            Ok(rendered) => {
                print!("{}", rendered);
                std::process::exit(0);
            }
            Err(e) => {
                eprintln!("Cannot render configuration: {}", e);
                std::process::exit(SidecarError::from(e).exit_code());
            }
        }
    }

    let guard = init_logging_from_config(&config);
    info!(
        "Tunnel sidecar {} starting (interface {})",
        env!("CARGO_PKG_VERSION"),
        config.tunnel.interface
    );

    let code = match run(config).await {
        Ok(()) => {
            info!("Tunnel sidecar stopped");
            0
        }
        Err(e) => {
            error!("Tunnel sidecar exiting: {}", e);
            e.exit_code()
        }
    };

    // Flush buffered log lines before exiting
    drop(guard);
    std::process::exit(code);
}

async fn run(config: SidecarConfig) -> Result<(), SidecarError> {
    let shutdown = CancellationToken::new();
    watch_signals(shutdown.clone())?;
    Sidecar::new(config, Facilities::linux()).run(shutdown).await
}
