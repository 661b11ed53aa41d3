// src/stream.rs
use crate::error::FetchError;
use crate::models::Tx;
use crate::rpc::TxSource;
use futures_util::Stream;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamOptions {
    /// TXs buffered between the page fetcher and the consumer
    pub capacity: usize,
    /// extra attempts per page; 0 means the first failure ends the stream
    pub retries: u32,
    /// delay before the first retry, doubled on each further one
    pub backoff: Duration,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            capacity: 100,
            retries: 0,
            backoff: Duration::from_secs(2),
        }
    }
}

/// Every TX received after a cursor, page by page.
///
/// A background task walks the source: it forwards each page in order,
/// moves its cursor to the last tx id of that page and asks for the next
/// one. The stream ends cleanly (`None`) on the first empty page. A fetch
/// or decode failure is delivered as one final `Err` item before the end.
/// The buffer is bounded, so a slow consumer holds the fetcher back.
pub struct FetchStream {
    rx: mpsc::Receiver<Result<Tx, FetchError>>,
    cancel: CancellationToken,
}

impl FetchStream {
    /// Fetch the first page after `after` ("" = from the beginning) and
    /// start streaming. A failing first page is returned as the error.
    pub async fn open(
        source: Arc<dyn TxSource>,
        after: impl Into<String>,
        opts: StreamOptions,
        shutdown: &CancellationToken,
    ) -> Result<Self, FetchError> {
        let cursor = after.into();
        let cancel = shutdown.child_token();

        let first = match fetch_page(&*source, &cursor, &opts, &cancel).await {
            Some(page) => page?,
            None => Vec::new(),
        };

        let (tx, rx) = mpsc::channel(opts.capacity.max(1));
        tokio::spawn(pump(source, cursor, first, tx, opts, cancel.clone()));

        Ok(Self { rx, cancel })
    }
}

impl Drop for FetchStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl Stream for FetchStream {
    type Item = Result<Tx, FetchError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

async fn pump(
    source: Arc<dyn TxSource>,
    mut cursor: String,
    mut page: Vec<Tx>,
    out: mpsc::Sender<Result<Tx, FetchError>>,
    opts: StreamOptions,
    cancel: CancellationToken,
) {
    loop {
        if page.is_empty() {
            debug!("Source drained after cursor {:?}", cursor);
            return;
        }

        debug!("Page of {} txs after cursor {:?}", page.len(), cursor);
        let next_cursor = page.last().map(|t| t.tx_id.clone());

        for tx in page {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                sent = out.send(Ok(tx)) => {
                    if sent.is_err() {
                        return; // consumer gone
                    }
                }
            }
        }

        if let Some(next) = next_cursor {
            cursor = next;
        }

        page = match fetch_page(&*source, &cursor, &opts, &cancel).await {
            Some(Ok(next)) => next,
            Some(Err(e)) => {
                warn!("Fetch after cursor {:?} failed, closing stream: {}", cursor, e);
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {}
                    _ = out.send(Err(e)) => {}
                }
                return;
            }
            None => return,
        };
    }
}

/// One page, with the configured retries. `None` when cancelled.
async fn fetch_page(
    source: &dyn TxSource,
    cursor: &str,
    opts: &StreamOptions,
    cancel: &CancellationToken,
) -> Option<Result<Vec<Tx>, FetchError>> {
    let mut attempt: u32 = 0;
    loop {
        let res = tokio::select! {
            biased;
            _ = cancel.cancelled() => return None,
            res = source.fetch_page(cursor) => res,
        };

        match res {
            Ok(page) => return Some(Ok(page)),
            Err(e) if attempt < opts.retries => {
                let delay = opts.backoff.saturating_mul(1u32 << attempt.min(16));
                attempt += 1;
                warn!(
                    "⚠️ Page fetch failed (attempt {}): {}. Retrying in {:?}...",
                    attempt, e, delay
                );
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return None,
                    _ = sleep(delay) => {}
                }
            }
            Err(e) => return Some(Err(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{tx, PagedSource};
    use futures_util::StreamExt;
    use tokio::time::timeout;

    fn five() -> Vec<Tx> {
        (1..=5).map(|i| tx(&format!("t{i}"), 0, "1")).collect()
    }

    fn opts() -> StreamOptions {
        StreamOptions {
            capacity: 4,
            retries: 0,
            backoff: Duration::from_millis(1),
        }
    }

    async fn drain(stream: &mut FetchStream) -> (Vec<String>, Option<FetchError>) {
        let mut ids = Vec::new();
        while let Some(item) = timeout(Duration::from_secs(5), stream.next()).await.unwrap() {
            match item {
                Ok(t) => ids.push(t.tx_id),
                Err(e) => {
                    assert!(stream.next().await.is_none(), "stream continued after error");
                    return (ids, Some(e));
                }
            }
        }
        (ids, None)
    }

    #[tokio::test]
    async fn test_walks_all_pages_then_ends() {
        let source = Arc::new(PagedSource::new(five(), 2));
        let shutdown = CancellationToken::new();
        let mut stream = FetchStream::open(source.clone(), "", opts(), &shutdown)
            .await
            .unwrap();

        let (ids, err) = drain(&mut stream).await;
        assert_eq!(ids, vec!["t1", "t2", "t3", "t4", "t5"]);
        assert!(err.is_none());
        assert_eq!(source.cursors(), vec!["", "t2", "t4", "t5"]);
    }

    #[tokio::test]
    async fn test_resumes_after_cursor() {
        let source = Arc::new(PagedSource::new(five(), 2));
        let shutdown = CancellationToken::new();
        let mut stream = FetchStream::open(source.clone(), "t3", opts(), &shutdown)
            .await
            .unwrap();

        let (ids, err) = drain(&mut stream).await;
        assert_eq!(ids, vec!["t4", "t5"]);
        assert!(err.is_none());
    }

    #[tokio::test]
    async fn test_first_page_failure_fails_open() {
        let source = Arc::new(PagedSource::new(five(), 2).failing_on(&[0]));
        let shutdown = CancellationToken::new();
        let res = FetchStream::open(source, "", opts(), &shutdown).await;
        assert!(matches!(res, Err(FetchError::Status(503))));
    }

    #[tokio::test]
    async fn test_mid_stream_failure_is_distinct_from_exhaustion() {
        let source = Arc::new(PagedSource::new(five(), 2).failing_on(&[1]));
        let shutdown = CancellationToken::new();
        let mut stream = FetchStream::open(source.clone(), "", opts(), &shutdown)
            .await
            .unwrap();

        let (ids, err) = drain(&mut stream).await;
        assert_eq!(ids, vec!["t1", "t2"]);
        assert!(matches!(err, Some(FetchError::Status(503))));
        assert_eq!(source.calls(), 2, "no retry by default");
    }

    #[tokio::test]
    async fn test_bounded_retry_recovers() {
        let source = Arc::new(PagedSource::new(five(), 2).failing_on(&[1, 2]));
        let shutdown = CancellationToken::new();
        let options = StreamOptions {
            retries: 2,
            ..opts()
        };
        let mut stream = FetchStream::open(source.clone(), "", options, &shutdown)
            .await
            .unwrap();

        let (ids, err) = drain(&mut stream).await;
        assert_eq!(ids.len(), 5);
        assert!(err.is_none());
        assert_eq!(source.cursors()[1..3], ["t2".to_string(), "t2".to_string()]);
    }

    #[tokio::test]
    async fn test_slow_consumer_holds_back_fetcher() {
        let txs: Vec<Tx> = (0..10).map(|i| tx(&format!("t{i}"), 0, "1")).collect();
        let source = Arc::new(PagedSource::new(txs, 10));
        let shutdown = CancellationToken::new();
        let options = StreamOptions {
            capacity: 1,
            ..opts()
        };
        let mut stream = FetchStream::open(source.clone(), "", options, &shutdown)
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(source.calls(), 1, "fetcher ran ahead of a blocked consumer");

        let (ids, _) = drain(&mut stream).await;
        assert_eq!(ids.len(), 10);
        assert_eq!(source.calls(), 2);
    }

    #[tokio::test]
    async fn test_cancellation_closes_stream() {
        let txs: Vec<Tx> = (0..10).map(|i| tx(&format!("t{i}"), 0, "1")).collect();
        let source = Arc::new(PagedSource::new(txs, 10));
        let shutdown = CancellationToken::new();
        let options = StreamOptions {
            capacity: 1,
            ..opts()
        };
        let mut stream = FetchStream::open(source.clone(), "", options, &shutdown)
            .await
            .unwrap();

        shutdown.cancel();
        let (ids, err) = drain(&mut stream).await;
        assert!(ids.len() < 10);
        assert!(err.is_none());
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test]
    async fn test_empty_source_ends_immediately() {
        let source = Arc::new(PagedSource::new(Vec::new(), 2));
        let shutdown = CancellationToken::new();
        let mut stream = FetchStream::open(source.clone(), "", opts(), &shutdown)
            .await
            .unwrap();
        assert!(stream.next().await.is_none());
        assert_eq!(source.calls(), 1);
    }
}
