mod aggregator;
mod api;
mod config;
mod db;
mod error;
mod indexer;
mod models;
mod parser;
mod rpc;
mod stream;

#[cfg(test)]
mod testutil;

use aggregator::AggregateCache;
use db::{DonationStats, SqliteLedger};
use rpc::{ChainSoClient, TxSource};
use eyre::eyre;
use std::sync::Arc;
use tokio::signal;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> eyre::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stdout)
        .with_target(false)
        .init();

    info!("Donation tracker starting...");

    let cfg = config::load()?;
    info!("  Wallet: {} ({})", cfg.wallet, cfg.network);
    info!("  DB Path: {}", cfg.db_path);
    info!("  Listen: {}:{}", cfg.bind_host, cfg.port);
    info!("  Refresh every: {:?}", cfg.refresh_interval());

    // Opening runs migrations
    let store = Arc::new(SqliteLedger::open(&cfg.db_path)?);
    let source: Arc<dyn TxSource> = Arc::new(ChainSoClient::new(&cfg)?);
    let cache = Arc::new(AggregateCache::new());
    let shutdown = CancellationToken::new();

    let refresher_handle = tokio::spawn({
        let cache = Arc::clone(&cache);
        let stats: Arc<dyn DonationStats> = store.clone();
        aggregator::run_refresher(cache, stats, cfg.refresh_interval(), shutdown.clone())
    });

    let mut indexer_handle = tokio::spawn(indexer::run(
        Arc::clone(&store),
        source,
        cfg.ingest_options(),
        shutdown.clone(),
    ));

    let mut api_handle = tokio::spawn(api::serve(cfg.clone(), Arc::clone(&cache), shutdown.clone()));

    // The ingestion task may finish on its own; keep serving until the API
    // stops or a shutdown signal arrives.
    let mut indexer_done = false;
    let mut api_done = false;
    let mut api_outcome = Ok(());
    loop {
        tokio::select! {
            res = &mut api_handle => {
                api_done = true;
                api_outcome = task_outcome("API", res);
                break;
            }
            res = &mut indexer_handle, if !indexer_done => {
                indexer_done = true;
                // logged; the API keeps serving what is already stored
                let _ = task_outcome("Ingestion", res);
            }
            _ = signal::ctrl_c() => {
                info!("Shutdown signal received, stopping...");
                break;
            }
        }
    }

    shutdown.cancel();
    if let Err(e) = refresher_handle.await {
        error!("Refresher task panicked: {:?}", e);
    }
    if !indexer_done {
        let _ = task_outcome("Ingestion", indexer_handle.await);
    }
    if !api_done {
        api_outcome = task_outcome("API", api_handle.await);
    }

    info!("Donation tracker stopped.");
    api_outcome
}

/// Log how a spawned task ended and turn failures into an error.
fn task_outcome<E: std::fmt::Display>(
    task: &str,
    res: Result<Result<(), E>, JoinError>,
) -> eyre::Result<()> {
    match res {
        Ok(Ok(())) => {
            info!("{} exited cleanly", task);
            Ok(())
        }
        Ok(Err(e)) => {
            error!("{} error: {}", task, e);
            Err(eyre!("{} error: {}", task, e))
        }
        Err(e) => {
            error!("{} task panicked: {:?}", task, e);
            Err(eyre!("{} task panicked: {}", task, e))
        }
    }
}
