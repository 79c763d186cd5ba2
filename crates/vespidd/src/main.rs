//! Vespid Query Node daemon
//!
//! Usage:
//!   # Defaults (standalone, in-process bus)
//!   vespidd
//!
//!   # With explicit identity and bind address
//!   vespidd --node-id 3 --bind 0.0.0.0:21123

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use vespid_core::MemoryBus;
use vespidd::{Cli, Server};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing with configured log level
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| cli.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Err(e) = cli.validate() {
        eprintln!("Configuration error: {}", e);
        std::process::exit(1);
    }

    print_banner(&cli);

    let bus = MemoryBus::new();
    let server = Server::new(cli.to_config(), bus).await?;

    tokio::select! {
        result = server.start() => result,
        _ = wait_for_shutdown_signal() => {
            tracing::info!("Shutdown signal received, exiting");
            Ok(())
        }
    }
}

/// Wait for shutdown signals (Ctrl+C or SIGTERM)
async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM");
        }
    }
}

fn print_banner(cli: &Cli) {
    eprintln!(
        r#"
__   _____  ___ _ __ (_) __| |
\ \ / / _ \/ __| '_ \| |/ _` |
 \ V /  __/\__ \ |_) | | (_| |
  \_/ \___||___/ .__/|_|\__,_|
               |_|

Vespid Query Node

  Node ID:  {}
  Bind:     {}

"#,
        cli.node_id, cli.bind
    );
}
