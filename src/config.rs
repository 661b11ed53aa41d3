use crate::indexer::IngestOptions;
use crate::stream::StreamOptions;
use dotenvy::dotenv;
use eyre::{eyre, Result, WrapErr};
use serde::Deserialize;
use std::{env, fs, time::Duration};
use tracing::{info, warn};

/// What the ingestion task does with a record whose value cannot be stored.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvalidValuePolicy {
    /// log it and keep ingesting
    #[default]
    Skip,
    Abort,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default, alias = "Wallet")]
    pub wallet: String,
    #[serde(default = "default_network")]
    pub network: String,
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,
    #[serde(default = "default_db_path")]
    pub db_path: String,
    #[serde(default = "default_bind_host")]
    pub bind_host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default, alias = "AllowedOrigins")]
    pub allowed_origins: Vec<String>,
    #[serde(default = "default_allowed_methods", alias = "AllowedMethods")]
    pub allowed_methods: Vec<String>,
    #[serde(default = "default_refresh_interval_ms")]
    pub refresh_interval_ms: u64,
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default)]
    pub fetch_retries: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default)]
    pub on_invalid_value: InvalidValuePolicy,
    #[serde(default)]
    pub resume_interval_secs: Option<u64>,
}

fn default_network() -> String {
    "DOGE".to_string()
}
fn default_api_base_url() -> String {
    "https://chain.so/api/v2".to_string()
}
fn default_db_path() -> String {
    "./txData.db".to_string()
}
fn default_bind_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_allowed_methods() -> Vec<String> {
    vec!["GET".to_string()]
}
fn default_refresh_interval_ms() -> u64 {
    1000
}
fn default_channel_capacity() -> usize {
    100
}
fn default_request_timeout_secs() -> u64 {
    15
}
fn default_retry_backoff_ms() -> u64 {
    2000
}

impl Config {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms)
    }

    pub fn stream_options(&self) -> StreamOptions {
        StreamOptions {
            capacity: self.channel_capacity,
            retries: self.fetch_retries,
            backoff: Duration::from_millis(self.retry_backoff_ms),
        }
    }

    pub fn ingest_options(&self) -> IngestOptions {
        IngestOptions {
            stream: self.stream_options(),
            on_invalid_value: self.on_invalid_value,
            resume_interval: self.resume_interval_secs.map(Duration::from_secs),
        }
    }

    /// Apply `PORT`, `DATABASE_URL` and `WALLET_ADDRESS` on top of the file.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(port) = lookup("PORT") {
            match port.trim().parse() {
                Ok(p) => self.port = p,
                Err(_) => warn!("Ignoring invalid PORT {:?}, using {}", port, self.port),
            }
        }
        if let Some(path) = lookup("DATABASE_URL") {
            self.db_path = path;
        }
        if let Some(wallet) = lookup("WALLET_ADDRESS") {
            self.wallet = wallet;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.wallet.trim().is_empty() {
            return Err(eyre!("config: wallet address is required"));
        }
        if self.channel_capacity == 0 {
            return Err(eyre!("config: channel_capacity must be at least 1"));
        }
        if self.refresh_interval_ms == 0 {
            return Err(eyre!("config: refresh_interval_ms must be positive"));
        }
        Ok(())
    }

    #[cfg(test)]
    pub fn for_wallet(wallet: &str) -> Self {
        let mut cfg = parse("{}").expect("defaults parse");
        cfg.wallet = wallet.to_string();
        cfg
    }
}

pub fn parse(raw: &str) -> Result<Config> {
    serde_json::from_str(raw).wrap_err("invalid config JSON")
}

pub fn load() -> Result<Config> {
    dotenv().ok();

    let path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.json".to_string());
    let raw = fs::read_to_string(&path).wrap_err_with(|| format!("reading {}", path))?;

    let mut cfg = parse(&raw)?;
    cfg.apply_overrides(|key| env::var(key).ok());
    cfg.validate()?;

    info!("Loaded config from {}: {:?}", path, cfg);

    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let cfg = parse(r#"{"wallet": "DWallet"}"#).unwrap();
        assert_eq!(cfg.network, "DOGE");
        assert_eq!(cfg.db_path, "./txData.db");
        assert_eq!(cfg.port, 8080);
        assert_eq!(cfg.allowed_methods, vec!["GET"]);
        assert!(cfg.allowed_origins.is_empty());
        assert_eq!(cfg.refresh_interval(), Duration::from_secs(1));
        assert_eq!(cfg.channel_capacity, 100);
        assert_eq!(cfg.fetch_retries, 0);
        assert_eq!(cfg.on_invalid_value, InvalidValuePolicy::Skip);
        assert_eq!(cfg.resume_interval_secs, None);
        cfg.validate().unwrap();
    }

    #[test]
    fn test_pascal_case_key_names() {
        let cfg = parse(
            r#"{
                "Wallet": "DWallet",
                "AllowedOrigins": ["https://example.org"],
                "AllowedMethods": ["GET", "OPTIONS"]
            }"#,
        )
        .unwrap();
        assert_eq!(cfg.wallet, "DWallet");
        assert_eq!(cfg.allowed_origins, vec!["https://example.org"]);
        assert_eq!(cfg.allowed_methods, vec!["GET", "OPTIONS"]);
    }

    #[test]
    fn test_options_mapping() {
        let cfg = parse(
            r#"{
                "wallet": "w",
                "channel_capacity": 8,
                "fetch_retries": 3,
                "retry_backoff_ms": 50,
                "on_invalid_value": "abort",
                "resume_interval_secs": 30
            }"#,
        )
        .unwrap();
        let opts = cfg.ingest_options();
        assert_eq!(opts.stream.capacity, 8);
        assert_eq!(opts.stream.retries, 3);
        assert_eq!(opts.stream.backoff, Duration::from_millis(50));
        assert_eq!(opts.on_invalid_value, InvalidValuePolicy::Abort);
        assert_eq!(opts.resume_interval, Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("PORT", "9000"),
            ("DATABASE_URL", "/tmp/other.db"),
            ("WALLET_ADDRESS", "DFromEnv"),
        ]
        .into_iter()
        .collect();

        let mut cfg = parse("{}").unwrap();
        cfg.apply_overrides(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(cfg.port, 9000);
        assert_eq!(cfg.db_path, "/tmp/other.db");
        assert_eq!(cfg.wallet, "DFromEnv");
    }

    #[test]
    fn test_bad_port_override_is_ignored() {
        let mut cfg = parse(r#"{"wallet": "w", "port": 7000}"#).unwrap();
        cfg.apply_overrides(|k| (k == "PORT").then(|| "not-a-port".to_string()));
        assert_eq!(cfg.port, 7000);
    }

    #[test]
    fn test_validation() {
        assert!(parse("{}").unwrap().validate().is_err());
        assert!(parse(r#"{"wallet": "w", "channel_capacity": 0}"#)
            .unwrap()
            .validate()
            .is_err());
        assert!(parse(r#"{"wallet": "w", "refresh_interval_ms": 0}"#)
            .unwrap()
            .validate()
            .is_err());
        assert!(parse("not json").is_err());
    }
}
