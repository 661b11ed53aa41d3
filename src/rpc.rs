// src/rpc.rs
use crate::config::Config;
use crate::error::FetchError;
use crate::models::Tx;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info};

/// A paginated feed of outputs received by one address.
///
/// `fetch_page("")` returns the oldest page; `fetch_page(id)` returns the
/// page that follows the transaction `id`. An empty page means there is
/// nothing newer yet.
#[async_trait]
pub trait TxSource: Send + Sync {
    async fn fetch_page(&self, after: &str) -> Result<Vec<Tx>, FetchError>;
}

#[derive(Debug, Deserialize)]
struct ApiEnvelope {
    status: String,
    #[serde(default)]
    data: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct ReceivedPage {
    #[serde(default)]
    #[allow(dead_code)]
    network: String,
    #[serde(default)]
    #[allow(dead_code)]
    address: String,
    #[serde(default)]
    txs: Vec<Tx>,
}

/// Decode a `get_tx_received` response body.
pub fn decode_page(body: &str) -> Result<Vec<Tx>, FetchError> {
    let envelope: ApiEnvelope = serde_json::from_str(body)?;
    if envelope.status != "success" {
        return Err(FetchError::Api(envelope.status));
    }
    let page: ReceivedPage = serde_json::from_value(envelope.data)?;
    Ok(page.txs)
}

/// chain.so v2 client for one wallet.
pub struct ChainSoClient {
    client: Client,
    base_url: String,
    network: String,
    wallet: String,
}

impl ChainSoClient {
    pub fn new(cfg: &Config) -> Result<Self, FetchError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(cfg.request_timeout_secs))
            .build()?;

        info!(
            "Transaction source: {} ({} wallet {})",
            cfg.api_base_url, cfg.network, cfg.wallet
        );

        Ok(Self {
            client,
            base_url: cfg.api_base_url.trim_end_matches('/').to_string(),
            network: cfg.network.clone(),
            wallet: cfg.wallet.clone(),
        })
    }

    fn page_url(&self, after: &str) -> String {
        format!(
            "{}/get_tx_received/{}/{}/{}",
            self.base_url, self.network, self.wallet, after
        )
    }
}

#[async_trait]
impl TxSource for ChainSoClient {
    async fn fetch_page(&self, after: &str) -> Result<Vec<Tx>, FetchError> {
        let url = self.page_url(after);
        debug!("📡 GET {}", url);

        let resp = self.client.get(&url).send().await?;
        if !resp.status().is_success() {
            return Err(FetchError::Status(resp.status().as_u16()));
        }
        let text = resp.text().await?;
        debug!("📩 Raw page response: {}", text);

        decode_page(&text)
    }
}
