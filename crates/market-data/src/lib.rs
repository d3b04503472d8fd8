use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use thiserror::Error;
use trading_core::MarketSnapshot;

#[derive(Error, Debug)]
pub enum MarketDataError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Data unavailable: {0}")]
    DataUnavailable(String),
}

pub type MarketDataResult<T> = Result<T, MarketDataError>;

/// Snapshots older than this are refetched. Short enough that two symbols
/// in the same tick can share a fetch without serving a stale price.
const CACHE_TTL_SECS: i64 = 5;

struct CacheEntry {
    snapshot: MarketSnapshot,
    cached_at: chrono::DateTime<Utc>,
}

/// Client for the market data feed: `GET {base}/snapshot/{symbol}`.
pub struct MarketDataClient {
    client: reqwest::Client,
    base_url: String,
    snapshot_cache: DashMap<String, CacheEntry>,
}

impl MarketDataClient {
    pub fn new(base_url: String, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("Failed to create HTTP client");

        Self {
            client,
            base_url,
            snapshot_cache: DashMap::new(),
        }
    }

    /// Latest snapshot for a symbol (cached, 5s TTL). Any fetch failure
    /// surfaces as `DataUnavailable` and skips the symbol for this tick.
    pub async fn get_snapshot(&self, symbol: &str) -> MarketDataResult<MarketSnapshot> {
        if let Some(entry) = self.snapshot_cache.get(symbol) {
            let age = (Utc::now() - entry.cached_at).num_seconds();
            if age < CACHE_TTL_SECS {
                return Ok(entry.snapshot.clone());
            }
        }

        let response = self
            .client
            .get(format!("{}/snapshot/{}", self.base_url, symbol))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(MarketDataError::DataUnavailable(format!(
                "{}: status {}",
                symbol,
                response.status()
            )));
        }

        let snapshot = response
            .json::<MarketSnapshot>()
            .await
            .map_err(|e| MarketDataError::DataUnavailable(format!("{}: {}", symbol, e)))?;

        self.snapshot_cache.insert(
            symbol.to_string(),
            CacheEntry {
                snapshot: snapshot.clone(),
                cached_at: Utc::now(),
            },
        );

        Ok(snapshot)
    }

    /// Feed reachability check for startup diagnostics.
    pub async fn health(&self) -> bool {
        match self
            .client
            .get(format!("{}/health", self.base_url))
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }
}
