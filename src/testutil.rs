//! Shared fixtures for unit tests.

use crate::db::SqliteLedger;
use crate::error::FetchError;
use crate::models::Tx;
use crate::rpc::TxSource;
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::{tempdir, TempDir};

/// On-disk ledger in a fresh temp dir; keep the dir alive for the test.
pub fn temp_ledger() -> (TempDir, Arc<SqliteLedger>) {
    let dir = tempdir().unwrap();
    let ledger = SqliteLedger::open(dir.path().join("ledger.db")).unwrap();
    (dir, Arc::new(ledger))
}

pub fn tx(id: &str, output_no: i64, value: &str) -> Tx {
    Tx {
        tx_id: id.to_string(),
        output_no,
        script_asm: format!("asm-{id}"),
        script_hex: format!("hex-{id}"),
        value: value.to_string(),
        confirmations: 6,
        time: 1_400_000_000,
    }
}

/// In-memory source that serves `txs` in pages after a cursor, the way
/// chain.so does. Can be told to fail on selected calls.
pub struct PagedSource {
    txs: Mutex<Vec<Tx>>,
    page_size: usize,
    calls: AtomicUsize,
    fail_on_calls: Vec<usize>,
    cursors: Mutex<Vec<String>>,
}

impl PagedSource {
    pub fn new(txs: Vec<Tx>, page_size: usize) -> Self {
        Self {
            txs: Mutex::new(txs),
            page_size,
            calls: AtomicUsize::new(0),
            fail_on_calls: Vec::new(),
            cursors: Mutex::new(Vec::new()),
        }
    }

    /// Fail the listed calls (0-based) with a status error.
    pub fn failing_on(mut self, calls: &[usize]) -> Self {
        self.fail_on_calls = calls.to_vec();
        self
    }

    pub fn push(&self, tx: Tx) {
        self.txs.lock().unwrap().push(tx);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn cursors(&self) -> Vec<String> {
        self.cursors.lock().unwrap().clone()
    }
}

#[async_trait]
impl TxSource for PagedSource {
    async fn fetch_page(&self, after: &str) -> Result<Vec<Tx>, FetchError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        self.cursors.lock().unwrap().push(after.to_string());
        if self.fail_on_calls.contains(&call) {
            return Err(FetchError::Status(503));
        }

        let txs = self.txs.lock().unwrap();
        let start = if after.is_empty() {
            0
        } else {
            // past every output of the cursor transaction
            match txs.iter().rposition(|t| t.tx_id == after) {
                Some(pos) => pos + 1,
                None => return Ok(Vec::new()),
            }
        };
        Ok(txs.iter().skip(start).take(self.page_size).cloned().collect())
    }
}
