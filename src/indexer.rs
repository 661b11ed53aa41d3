use crate::config::InvalidValuePolicy;
use crate::db::SqliteLedger;
use crate::error::{IngestError, StoreError};
use crate::rpc::TxSource;
use crate::stream::{FetchStream, StreamOptions};
use futures_util::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestOptions {
    pub stream: StreamOptions,
    pub on_invalid_value: InvalidValuePolicy,
    /// reopen the stream this long after it closes; `None` = run once
    pub resume_interval: Option<Duration>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestReport {
    pub inserted: u64,
    pub duplicates: u64,
    pub rejected: u64,
}

/// Ingestion task: drain the source into the ledger.
///
/// Without a resume interval this is a single pass: the task ends when the
/// stream closes. With one, the task sleeps and reopens from the newest
/// stored tx id, until shutdown.
pub async fn run(
    store: Arc<SqliteLedger>,
    source: Arc<dyn TxSource>,
    opts: IngestOptions,
    shutdown: CancellationToken,
) -> Result<(), IngestError> {
    info!("Ingestion task started");

    loop {
        match ingest_once(store.clone(), source.clone(), &opts, &shutdown).await {
            Ok(report) => info!(
                "Ingestion pass finished: {} new, {} already stored, {} rejected",
                report.inserted, report.duplicates, report.rejected
            ),
            Err(e @ IngestError::Rejected(_)) => {
                error!("Ingestion stopped: {}", e);
                return Err(e);
            }
            Err(e) if opts.resume_interval.is_none() => {
                error!("Ingestion stopped: {}", e);
                return Err(e);
            }
            Err(e) => warn!("Ingestion pass failed: {}", e),
        }

        let Some(interval) = opts.resume_interval else {
            return Ok(());
        };

        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("Ingestion task shutting down");
                return Ok(());
            }
            _ = sleep(interval) => {}
        }
    }
}

/// One stream lifetime, resuming from the newest stored tx id.
pub async fn ingest_once(
    store: Arc<SqliteLedger>,
    source: Arc<dyn TxSource>,
    opts: &IngestOptions,
    shutdown: &CancellationToken,
) -> Result<IngestReport, IngestError> {
    let cursor = {
        let store = store.clone();
        task::spawn_blocking(move || store.last_tx_id())
            .await
            .map_err(StoreError::from)??
            .unwrap_or_default()
    };
    info!("Fetching transactions after {:?}", cursor);

    let mut stream = FetchStream::open(source, cursor, opts.stream.clone(), shutdown).await?;
    let mut report = IngestReport::default();

    while let Some(item) = stream.next().await {
        let tx = item?;
        let id = format!("{}:{}", tx.tx_id, tx.output_no);

        let store = store.clone();
        let written = task::spawn_blocking(move || store.ingest(&tx))
            .await
            .map_err(StoreError::from)?;

        match written {
            Ok(true) => {
                report.inserted += 1;
                info!("💾 Stored {}", id);
            }
            Ok(false) => {
                report.duplicates += 1;
                debug!("Already stored {}", id);
            }
            Err(StoreError::InvalidValue(e)) => match opts.on_invalid_value {
                InvalidValuePolicy::Skip => {
                    report.rejected += 1;
                    warn!("Skipping {}: {}", id, e);
                }
                InvalidValuePolicy::Abort => return Err(IngestError::Rejected(e)),
            },
            Err(e) => return Err(e.into()),
        }
    }

    Ok(report)
}
