//! Prism relay binary.
//!
//! Runs the broker that editor instances and CLI clients connect to.

use clap::Parser;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use prism_relay::{Relay, RelayConfig};

/// Prism relay.
#[derive(Parser, Debug)]
#[command(name = "relay")]
#[command(about = "Run the Prism editor relay")]
#[command(version)]
struct Cli {
    /// Port to listen on (overrides relay.toml).
    #[arg(short, long)]
    port: Option<u16>,

    /// Path to configuration file.
    #[arg(short, long, value_name = "FILE")]
    config: Option<std::path::PathBuf>,

    /// Buffer commands for busy instances instead of rejecting them.
    #[arg(long)]
    enable_queue: bool,

    /// Per-instance queue capacity (implies --enable-queue).
    #[arg(long, value_name = "N")]
    queue_capacity: Option<usize>,

    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .init();

    info!("Prism relay starting");

    let mut config = RelayConfig::load(cli.config.as_deref()).unwrap_or_else(|e| {
        info!(error = %e, "Failed to load config, using defaults");
        RelayConfig::default()
    });

    if let Some(port) = cli.port {
        config.listen.port = port;
    }
    if cli.enable_queue || cli.queue_capacity.is_some() {
        config.queue.enabled = true;
    }
    if let Some(capacity) = cli.queue_capacity {
        config.queue.capacity = capacity;
    }

    info!(
        addr = %config.listen.addr(),
        queue_enabled = config.queue.enabled,
        "Configuration loaded"
    );

    let relay = Relay::new(config);

    let listener = match relay.bind().await {
        Ok(listener) => listener,
        Err(e) => {
            error!(error = %e, "Failed to bind listen socket");
            std::process::exit(1);
        }
    };

    let cancel = relay.shutdown_token();
    tokio::spawn(async move {
        shutdown_signal().await;
        cancel.cancel();
    });

    relay.serve(listener).await?;

    info!("Relay shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            info!("Received SIGTERM, initiating shutdown");
        }
    }
}
