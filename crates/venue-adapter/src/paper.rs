use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use rust_decimal::prelude::*;
use rust_decimal::Decimal;

use crate::{Fill, OrderRequest, PriceFeed, VenueAdapter, VenueError};

/// Simulated venue: fills every order at the feed's current price and
/// charges a taker fee. Fills are remembered by client order id, so a
/// resubmitted order returns the original fill instead of filling twice.
pub struct PaperVenue {
    prices: Arc<dyn PriceFeed>,
    /// Taker fee rate, e.g. 0.0026 for 0.26%.
    fee_rate: Decimal,
    fills: DashMap<String, Fill>,
}

impl PaperVenue {
    pub fn new(prices: Arc<dyn PriceFeed>, fee_rate: f64) -> anyhow::Result<Self> {
        anyhow::ensure!(
            fee_rate.is_finite() && fee_rate >= 0.0,
            "taker fee rate {} is not a usable rate",
            fee_rate
        );
        let fee_rate = Decimal::from_f64(fee_rate)
            .ok_or_else(|| anyhow::anyhow!("taker fee rate {} is not representable", fee_rate))?;
        Ok(Self {
            prices,
            fee_rate,
            fills: DashMap::new(),
        })
    }
}

#[async_trait]
impl VenueAdapter for PaperVenue {
    async fn place_order(&self, order: &OrderRequest) -> Result<Fill, VenueError> {
        if let Some(existing) = self.fills.get(&order.client_order_id) {
            return Ok(existing.clone());
        }

        let price = self
            .prices
            .last_price(&order.symbol)
            .await
            .ok_or_else(|| {
                VenueError::transient(format!("no current price for {}", order.symbol))
            })?;

        let price = Decimal::from_f64(price)
            .filter(|p| *p > Decimal::ZERO)
            .ok_or_else(|| {
                VenueError::permanent(format!("invalid price for {}", order.symbol))
            })?;

        let fill = Fill {
            client_order_id: order.client_order_id.clone(),
            symbol: order.symbol.clone(),
            side: order.side,
            price,
            quantity: order.quantity,
            fees: price * order.quantity * self.fee_rate,
            filled_at: Utc::now(),
        };

        self.fills
            .insert(order.client_order_id.clone(), fill.clone());
        Ok(fill)
    }

    fn is_paper(&self) -> bool {
        true
    }

    fn venue_name(&self) -> &str {
        "paper"
    }
}
