use std::path::PathBuf;

use clap::Parser;
use tokio_util::sync::CancellationToken;

use calls_offloader::config::Config;
use calls_offloader::logger;
use calls_offloader::service::Service;

#[derive(Parser, Debug)]
#[command(name = "calls-offloader")]
#[command(about = "Offloads resource-intensive call workloads to containerized jobs")]
#[command(version)]
struct Args {
    /// Path to the configuration file.
    #[arg(long, default_value = "config/config.toml")]
    config: PathBuf,
}

/// Translate SIGINT/SIGTERM into a cancellation so every subsystem can drain
/// gracefully.
fn install_shutdown_handler() -> CancellationToken {
    let token = CancellationToken::new();
    let token_clone = token.clone();

    tokio::spawn(async move {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("received SIGINT, initiating graceful shutdown");
            }
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM, initiating graceful shutdown");
            }
        }

        token_clone.cancel();
    });

    token
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = Config::load(&args.config)?;
    config.is_valid()?;

    logger::init(&config.logger)?;

    let service = Service::new(config).await?;
    let shutdown = install_shutdown_handler();

    service.run(shutdown).await
}
