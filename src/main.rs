//! `rstc`: a leech-only BitTorrent v1 client.
use std::process::ExitCode;

use clap::Parser;
use rs_torrent_client::config::AppConfig;
use rs_torrent_client::orchestrator::Orchestrator;
use rs_torrent_client::torrent::Torrent;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    let config = AppConfig::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(config.log_filter()))
        .init();

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = ?e, "fatal error");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: AppConfig) -> anyhow::Result<()> {
    let bytes = std::fs::read(&config.torrent)
        .map_err(|e| anyhow::anyhow!("failed to read {}: {e}", config.torrent.display()))?;
    let torrent = Torrent::parse(&bytes)?;

    tracing::info!(
        name = %torrent.info.name,
        pieces = torrent.info.num_pieces(),
        total_size = torrent.total_size,
        "loaded torrent"
    );

    let orchestrator = Orchestrator::new(torrent, &config);
    orchestrator.run().await
}
