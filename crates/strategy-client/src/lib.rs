use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use trading_core::{Direction, MarketSnapshot, Signal};

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Source unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Malformed response: {0}")]
    Malformed(String),
}

pub type SourceResult<T> = Result<T, SourceError>;

#[derive(Debug, Clone, Serialize)]
struct SignalRequest<'a> {
    symbol: &'a str,
    snapshot: &'a MarketSnapshot,
}

#[derive(Debug, Clone, Deserialize)]
struct SignalResponse {
    direction: Direction,
    confidence: f64,
}

/// HTTP client for one independently deployed strategy signal source.
/// Contract: `POST {base}/signal` returns `{direction, confidence}` within
/// the request timeout; `GET {base}/health` is the liveness probe.
#[derive(Clone)]
pub struct StrategySourceClient {
    client: reqwest::Client,
    strategy_id: String,
    base_url: String,
}

impl StrategySourceClient {
    pub fn new(strategy_id: String, base_url: String, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("Failed to create HTTP client");

        Self {
            client,
            strategy_id,
            base_url,
        }
    }

    pub fn strategy_id(&self) -> &str {
        &self.strategy_id
    }

    /// Request a directional signal for the symbol. Out-of-range confidence
    /// is rejected here so a misbehaving source is treated as absent rather
    /// than skewing the ensemble.
    pub async fn get_signal(&self, symbol: &str, snapshot: &MarketSnapshot) -> SourceResult<Signal> {
        let request = SignalRequest { symbol, snapshot };

        let response = self
            .client
            .post(format!("{}/signal", self.base_url))
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(SourceError::ServiceUnavailable(format!(
                "{}: status {}",
                self.strategy_id,
                response.status()
            )));
        }

        let body = response
            .json::<SignalResponse>()
            .await
            .map_err(|e| SourceError::Malformed(format!("{}: {}", self.strategy_id, e)))?;

        if !(0.0..=1.0).contains(&body.confidence) || !body.confidence.is_finite() {
            return Err(SourceError::Malformed(format!(
                "{}: confidence {} outside [0, 1]",
                self.strategy_id, body.confidence
            )));
        }

        Ok(Signal {
            strategy_id: self.strategy_id.clone(),
            symbol: symbol.to_string(),
            direction: body.direction,
            confidence: body.confidence,
            generated_at: Utc::now(),
        })
    }

    /// Liveness probe. Any transport error counts as dead.
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
