use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use serde::Deserialize;

use crate::{Fill, OrderRequest, VenueAdapter, VenueError};

#[derive(Debug, Deserialize)]
struct ExecuteResponse {
    order_id: String,
    price: Decimal,
    quantity: Decimal,
    #[serde(default)]
    fees: Decimal,
}

/// Live venue: forwards orders to an exchange gateway over HTTP
/// (`POST {base}/execute`). The gateway owns the exchange-specific wire
/// protocol; this adapter only classifies failures for retry purposes.
pub struct RestVenue {
    client: reqwest::Client,
    base_url: String,
}

impl RestVenue {
    pub fn new(base_url: String, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("Failed to create HTTP client");

        Self { client, base_url }
    }
}

#[async_trait]
impl VenueAdapter for RestVenue {
    async fn place_order(&self, order: &OrderRequest) -> Result<Fill, VenueError> {
        let response = self
            .client
            .post(format!("{}/execute", self.base_url))
            .json(order)
            .send()
            .await
            .map_err(|e| {
                // Connect errors and timeouts are worth another attempt
                if e.is_timeout() || e.is_connect() {
                    VenueError::transient(e.to_string())
                } else {
                    VenueError::permanent(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = format!("status {}: {}", status, body);
            return if status.is_server_error() || status.as_u16() == 429 {
                Err(VenueError::transient(message))
            } else {
                Err(VenueError::permanent(message))
            };
        }

        let body = response
            .json::<ExecuteResponse>()
            .await
            .map_err(|e| VenueError::permanent(format!("unparseable fill: {}", e)))?;

        tracing_fill(&body, order);

        Ok(Fill {
            client_order_id: order.client_order_id.clone(),
            symbol: order.symbol.clone(),
            side: order.side,
            price: body.price,
            quantity: body.quantity,
            fees: body.fees,
            filled_at: Utc::now(),
        })
    }

    fn is_paper(&self) -> bool {
        false
    }

    fn venue_name(&self) -> &str {
        "rest-gateway"
    }
}

fn tracing_fill(response: &ExecuteResponse, order: &OrderRequest) {
    // Venue-side id logged for reconciliation against the gateway's books
    tracing::info!(
        "[LIVE] {} {} {} filled @ {} (venue order {})",
        order.side,
        order.quantity,
        order.symbol,
        response.price,
        response.order_id
    );
}
