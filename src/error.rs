// src/error.rs
use std::sync::Arc;
use thiserror::Error;

/// Failure while pulling a page from the transaction source.
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("transaction source returned HTTP {0}")]
    Status(u16),

    #[error("could not decode transaction page: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("transaction source reported status {0:?}")]
    Api(String),
}

/// A wire `value` that cannot be stored as an exact count of base units.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValueParseError {
    #[error("malformed decimal value {0:?}")]
    Malformed(String),

    #[error("negative value {0:?}")]
    Negative(String),

    #[error("value {0:?} has more than 8 decimal places")]
    TooPrecise(String),

    #[error("value {0:?} is out of range")]
    Overflow(String),
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("rejected write: {0}")]
    InvalidValue(#[from] ValueParseError),

    #[error("no {0} in an empty ledger")]
    NotFound(&'static str),

    #[error("ledger lock poisoned")]
    Poisoned,

    #[error("blocking task failed: {0}")]
    Task(String),
}

impl From<tokio::task::JoinError> for StoreError {
    fn from(err: tokio::task::JoinError) -> Self {
        StoreError::Task(err.to_string())
    }
}

/// Read failure on the aggregate cache. Never carries stale numbers.
#[derive(Error, Debug, Clone)]
pub enum CacheError {
    #[error("statistics are not available yet")]
    Uninitialized,

    #[error("statistics refresh failed: {0}")]
    Degraded(#[source] Arc<StoreError>),

    #[error("no {0} recorded yet")]
    NotFound(&'static str),
}

#[derive(Error, Debug)]
pub enum IngestError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("ingestion aborted on invalid value: {0}")]
    Rejected(ValueParseError),
}
