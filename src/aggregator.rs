use crate::db::DonationStats;
use crate::error::{CacheError, StoreError};
use crate::models::{Aggregates, Info, Tx};
use chrono::Utc;
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::task;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

enum Snapshot {
    Uninitialized,
    Healthy(Info),
    Degraded(Arc<StoreError>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheHealth {
    Uninitialized,
    Healthy,
    Degraded,
}

/// In-memory donation statistics, republished as a whole on every refresh.
///
/// Readers only ever take the shared lock on the snapshot and never reach
/// the ledger. A failed refresh replaces the snapshot with the failure, so
/// reads fail until the next good refresh instead of serving stale numbers.
pub struct AggregateCache {
    snapshot: RwLock<Snapshot>,
}

impl Default for AggregateCache {
    fn default() -> Self {
        Self::new()
    }
}

impl AggregateCache {
    pub fn new() -> Self {
        Self {
            snapshot: RwLock::new(Snapshot::Uninitialized),
        }
    }

    /// One refresh cycle against `store`.
    ///
    /// The queries run before the snapshot lock is taken; the lock is held
    /// only for the swap. The ledger lock is therefore never acquired while
    /// the snapshot lock is held.
    pub fn refresh(&self, store: &dyn DonationStats) -> Result<(), Arc<StoreError>> {
        self.publish(store.aggregates())
    }

    fn publish(&self, staged: Result<Aggregates, StoreError>) -> Result<(), Arc<StoreError>> {
        let (next, res) = match staged {
            Ok(agg) => (Snapshot::Healthy(Info::from_aggregates(agg, Utc::now())), Ok(())),
            Err(e) => {
                let e = Arc::new(e);
                (Snapshot::Degraded(e.clone()), Err(e))
            }
        };

        // a snapshot is only ever replaced whole, so a poisoned lock still
        // guards a complete one
        let mut guard = self.snapshot.write().unwrap_or_else(PoisonError::into_inner);
        let recovered = matches!(*guard, Snapshot::Degraded(_)) && res.is_ok();
        *guard = next;
        drop(guard);

        if recovered {
            info!("Statistics refresh recovered");
        }
        res
    }

    fn with_info<T>(&self, f: impl FnOnce(&Info) -> Result<T, CacheError>) -> Result<T, CacheError> {
        let guard = self.snapshot.read().unwrap_or_else(PoisonError::into_inner);
        match &*guard {
            Snapshot::Uninitialized => Err(CacheError::Uninitialized),
            Snapshot::Degraded(e) => Err(CacheError::Degraded(e.clone())),
            Snapshot::Healthy(info) => f(info),
        }
    }

    pub fn get_info(&self) -> Result<Info, CacheError> {
        self.with_info(|info| Ok(info.clone()))
    }

    pub fn get_total(&self) -> Result<Decimal, CacheError> {
        self.with_info(|info| Ok(info.total_amount))
    }

    pub fn get_count(&self) -> Result<i64, CacheError> {
        self.with_info(|info| Ok(info.count))
    }

    pub fn get_largest(&self) -> Result<Tx, CacheError> {
        self.with_info(|info| {
            info.largest
                .clone()
                .ok_or(CacheError::NotFound("largest donation"))
        })
    }

    pub fn get_most_recent(&self) -> Result<Tx, CacheError> {
        self.with_info(|info| {
            info.most_recent
                .clone()
                .ok_or(CacheError::NotFound("recent donation"))
        })
    }

    pub fn health(&self) -> CacheHealth {
        match &*self.snapshot.read().unwrap_or_else(PoisonError::into_inner) {
            Snapshot::Uninitialized => CacheHealth::Uninitialized,
            Snapshot::Healthy(_) => CacheHealth::Healthy,
            Snapshot::Degraded(_) => CacheHealth::Degraded,
        }
    }
}

/// Refresh `cache` from `store` every `interval` until shutdown.
pub async fn run_refresher(
    cache: Arc<AggregateCache>,
    store: Arc<dyn DonationStats>,
    interval: Duration,
    shutdown: CancellationToken,
) {
    info!("Statistics refresher started (every {:?})", interval);

    loop {
        let staged = {
            let store = store.clone();
            task::spawn_blocking(move || store.aggregates())
                .await
                .unwrap_or_else(|e| Err(StoreError::from(e)))
        };

        match cache.publish(staged) {
            Ok(()) => debug!("Statistics refreshed"),
            Err(e) => error!("Statistics refresh failed: {}", e),
        }

        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("Statistics refresher stopped");
                return;
            }
            _ = sleep(interval) => {}
        }
    }
}
