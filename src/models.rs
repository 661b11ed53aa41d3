// src/models.rs
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// One transaction output received by the tracked wallet.
///
/// This is the wire shape of the transaction source and of the HTTP API:
/// `value` stays a decimal string here and only becomes an integer count
/// of base units inside the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tx {
    #[serde(rename = "txid")]
    pub tx_id: String,
    pub output_no: i64,
    #[serde(default)]
    pub script_asm: String,
    #[serde(default)]
    pub script_hex: String,
    pub value: String,
    #[serde(default)]
    pub confirmations: i64,
    #[serde(default)]
    pub time: i64,
}

/// Result of one pass over the ledger, before it is published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Aggregates {
    pub total_amount: Decimal,
    pub count: i64,
    pub largest: Option<Tx>,
    pub most_recent: Option<Tx>,
}

/// Published snapshot of donation statistics.
#[derive(Debug, Clone, Serialize)]
pub struct Info {
    pub total_amount: Decimal,
    pub count: i64,
    pub largest: Option<Tx>,
    pub most_recent: Option<Tx>,
    pub refreshed_at: DateTime<Utc>,
}

impl Info {
    pub fn from_aggregates(agg: Aggregates, refreshed_at: DateTime<Utc>) -> Self {
        Self {
            total_amount: agg.total_amount,
            count: agg.count,
            largest: agg.largest,
            most_recent: agg.most_recent,
            refreshed_at,
        }
    }
}
