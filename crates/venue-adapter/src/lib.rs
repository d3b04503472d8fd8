use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

mod paper;
mod rest;

pub use paper::PaperVenue;
pub use rest::RestVenue;

// ---------------------------------------------------------------------------
// Unified venue types (venue-agnostic)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "buy"),
            OrderSide::Sell => write!(f, "sell"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    Market,
}

/// An order as handed to a venue. `client_order_id` is generated by the
/// caller and reused across retries so a duplicate acceptance cannot open
/// two positions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    pub client_order_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub quantity: Decimal,
    pub stop_loss_price: Option<Decimal>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fill {
    pub client_order_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub price: Decimal,
    pub quantity: Decimal,
    pub fees: Decimal,
    pub filled_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VenueErrorClass {
    /// Worth retrying: timeouts, rate limits, 5xx.
    Transient,
    /// Never retried: insufficient funds, invalid symbol, rejections.
    Permanent,
}

#[derive(Debug, Clone, Error)]
#[error("{class:?} venue error: {message}")]
pub struct VenueError {
    pub class: VenueErrorClass,
    pub message: String,
}

impl VenueError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            class: VenueErrorClass::Transient,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            class: VenueErrorClass::Permanent,
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        self.class == VenueErrorClass::Transient
    }
}

// ---------------------------------------------------------------------------
// Venue trait
// ---------------------------------------------------------------------------

#[async_trait]
pub trait VenueAdapter: Send + Sync {
    /// Submit a market order and wait for the fill.
    async fn place_order(&self, order: &OrderRequest) -> Result<Fill, VenueError>;

    /// Whether this venue simulates fills.
    fn is_paper(&self) -> bool;

    /// Venue name for logging.
    fn venue_name(&self) -> &str;
}

/// Source of current prices for fill simulation.
#[async_trait]
pub trait PriceFeed: Send + Sync {
    async fn last_price(&self, symbol: &str) -> Option<f64>;
}

#[async_trait]
impl PriceFeed for market_data::MarketDataClient {
    async fn last_price(&self, symbol: &str) -> Option<f64> {
        self.get_snapshot(symbol).await.ok().map(|s| s.price)
    }
}
