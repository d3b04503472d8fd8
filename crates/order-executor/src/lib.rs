use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use tokio::sync::Mutex;
use uuid::Uuid;

use trading_core::{
    Decision, Direction, ExecutionResult, PipelineError, PortfolioState, Position, PositionSide,
    RiskVerdict,
};
use venue_adapter::{Fill, OrderRequest, OrderSide, OrderType, VenueAdapter};

#[cfg(test)]
mod tests;

/// Sink for executed-order records and portfolio snapshots. The engine
/// backs this with sqlite; journal failures are logged, never allowed to
/// desync the in-memory portfolio from a fill that already happened.
#[async_trait]
pub trait ExecutionJournal: Send + Sync {
    async fn record_order(&self, result: &ExecutionResult, paper: bool) -> anyhow::Result<()>;
    async fn persist_portfolio(&self, portfolio: &PortfolioState) -> anyhow::Result<()>;
}

/// Journal that discards everything. Used in tests and dry runs.
pub struct NoopJournal;

#[async_trait]
impl ExecutionJournal for NoopJournal {
    async fn record_order(&self, _result: &ExecutionResult, _paper: bool) -> anyhow::Result<()> {
        Ok(())
    }

    async fn persist_portfolio(&self, _portfolio: &PortfolioState) -> anyhow::Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Stop distance from entry, in percent (5.0 = 5%). Must be positive;
    /// an order with no derivable stop is never sent.
    pub stop_loss_percent: f64,
    /// Orders below this notional are skipped, not errors.
    pub min_order_notional: f64,
    /// Hard cap on simultaneously open positions, counting opens still in
    /// flight at the venue. The risk gate applies the same cap to its
    /// snapshot; this one holds under concurrent symbols.
    pub max_open_positions: usize,
    /// Sleep before each retry of a transient venue failure. Length bounds
    /// the retry count.
    pub retry_delays: Vec<Duration>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            stop_loss_percent: 5.0,
            min_order_notional: 0.50,
            max_open_positions: 3,
            retry_delays: vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4),
            ],
        }
    }
}

/// What execute() decided to do, resolved under the portfolio lock and
/// then carried across the (unlocked) venue call.
enum OrderPlan {
    Skip(ExecutionResult),
    Open {
        quantity: f64,
        stop_loss_price: f64,
    },
    Close {
        quantity: f64,
    },
}

/// The only component that mutates `PortfolioState`. Everything else reads
/// snapshots. Venue calls happen outside the lock; the lock is retaken to
/// apply the fill.
pub struct OrderExecutor {
    venue: Arc<dyn VenueAdapter>,
    portfolio: Arc<Mutex<PortfolioState>>,
    journal: Arc<dyn ExecutionJournal>,
    config: ExecutorConfig,
    /// Opens planned but not yet applied. Mutated only while holding the
    /// portfolio lock, so plan-time cap checks see every in-flight open.
    pending_opens: AtomicUsize,
}

impl OrderExecutor {
    pub fn new(
        venue: Arc<dyn VenueAdapter>,
        portfolio: Arc<Mutex<PortfolioState>>,
        journal: Arc<dyn ExecutionJournal>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            venue,
            portfolio,
            journal,
            config,
            pending_opens: AtomicUsize::new(0),
        }
    }

    pub fn portfolio(&self) -> Arc<Mutex<PortfolioState>> {
        Arc::clone(&self.portfolio)
    }

    /// Act on an approved decision. Skips (recorded, not errors) when the
    /// verdict rejected, the direction is HOLD, the sized order is below the
    /// minimum notional, or the emergency stop engaged since evaluation.
    /// Only a missing stop-loss is a hard error.
    pub async fn execute(
        &self,
        decision: &Decision,
        verdict: &RiskVerdict,
    ) -> Result<ExecutionResult, PipelineError> {
        if !verdict.approved {
            return self
                .record_skip(ExecutionResult::skipped(
                    &decision.symbol,
                    decision.direction,
                    format!("rejected by risk gate: {}", verdict.reason),
                ))
                .await;
        }

        if decision.direction == Direction::Hold {
            return self
                .record_skip(ExecutionResult::skipped(
                    &decision.symbol,
                    decision.direction,
                    "hold",
                ))
                .await;
        }

        let plan = {
            let portfolio = self.portfolio.lock().await;
            let plan = self.plan_order(decision, verdict, &portfolio)?;
            // Reserve the position slot before the lock drops so a
            // concurrent symbol cannot plan past the cap while this order
            // is at the venue.
            if matches!(plan, OrderPlan::Open { .. }) {
                self.pending_opens.fetch_add(1, Ordering::SeqCst);
            }
            plan
        };

        match plan {
            OrderPlan::Skip(result) => self.record_skip(result).await,
            OrderPlan::Open {
                quantity,
                stop_loss_price,
            } => {
                let result = self
                    .place_and_apply(decision, quantity, Some(stop_loss_price), false)
                    .await;
                self.pending_opens.fetch_sub(1, Ordering::SeqCst);
                result
            }
            OrderPlan::Close { quantity } => {
                self.place_and_apply(decision, quantity, None, true).await
            }
        }
    }

    /// Close the open position in `symbol` at the current price. Used by the
    /// orchestration loop when a snapshot price crosses the position's stop,
    /// and for operator-driven flatten. No-op result if nothing is open.
    pub async fn close_position(
        &self,
        symbol: &str,
        price: f64,
        reason: &str,
    ) -> Result<ExecutionResult, PipelineError> {
        let (direction, quantity) = {
            let portfolio = self.portfolio.lock().await;
            match portfolio.open_positions.get(symbol) {
                Some(position) => {
                    let direction = match position.side {
                        PositionSide::Long => Direction::Sell,
                        PositionSide::Short => Direction::Buy,
                    };
                    (direction, position.quantity)
                }
                None => {
                    return self
                        .record_skip(ExecutionResult::skipped(
                            symbol,
                            Direction::Hold,
                            "no open position to close",
                        ))
                        .await;
                }
            }
        };

        tracing::info!("{}: closing position ({})", symbol, reason);

        let decision = Decision {
            symbol: symbol.to_string(),
            direction,
            ensemble_score: 0.0,
            contributing_signals: Vec::new(),
            suggested_size_fraction: 0.0,
            price,
            decided_at: chrono::Utc::now(),
        };

        self.place_and_apply(&decision, quantity, None, true).await
    }

    /// Resolve intent against the current portfolio. Called with the lock
    /// held; no awaits in here.
    fn plan_order(
        &self,
        decision: &Decision,
        verdict: &RiskVerdict,
        portfolio: &PortfolioState,
    ) -> Result<OrderPlan, PipelineError> {
        let symbol = &decision.symbol;

        let closing = portfolio
            .open_positions
            .get(symbol)
            .map(|p| opposes(p.side, decision.direction))
            .unwrap_or(false);

        if closing {
            let quantity = portfolio.open_positions[symbol].quantity;
            return Ok(OrderPlan::Close { quantity });
        }

        // Risk reduction is the only thing allowed past an engaged stop;
        // re-checked here because the stop may have flipped since the gate
        // saw its snapshot.
        if portfolio.emergency_stop_engaged {
            return Ok(OrderPlan::Skip(ExecutionResult::skipped(
                symbol,
                decision.direction,
                "emergency stop engaged",
            )));
        }

        if portfolio.has_open_position(symbol) {
            return Ok(OrderPlan::Skip(ExecutionResult::skipped(
                symbol,
                decision.direction,
                "position already open",
            )));
        }

        // The gate checked the cap against its snapshot; another symbol may
        // have opened (or be opening) since. Re-check against the live count
        // plus in-flight opens.
        let in_flight = self.pending_opens.load(Ordering::SeqCst);
        if portfolio.open_position_count() + in_flight >= self.config.max_open_positions {
            return Ok(OrderPlan::Skip(ExecutionResult::skipped(
                symbol,
                decision.direction,
                "max open positions reached",
            )));
        }

        if verdict.adjusted_size_fraction <= 0.0 {
            return Ok(OrderPlan::Skip(ExecutionResult::skipped(
                symbol,
                decision.direction,
                "zero size",
            )));
        }

        let notional = verdict.adjusted_size_fraction * portfolio.equity;
        if notional < self.config.min_order_notional {
            return Ok(OrderPlan::Skip(ExecutionResult::skipped(
                symbol,
                decision.direction,
                format!("notional {:.2} below minimum", notional),
            )));
        }

        if self.config.stop_loss_percent <= 0.0 || !decision.price.is_finite() {
            return Err(PipelineError::NoStopLossConfigurable(format!(
                "{}: cannot derive stop from price {} and stop percent {}",
                symbol, decision.price, self.config.stop_loss_percent
            )));
        }

        let stop_fraction = self.config.stop_loss_percent / 100.0;
        let stop_loss_price = match decision.direction {
            Direction::Buy => decision.price * (1.0 - stop_fraction),
            Direction::Sell => decision.price * (1.0 + stop_fraction),
            Direction::Hold => unreachable!("hold handled before planning"),
        };

        Ok(OrderPlan::Open {
            quantity: notional / decision.price,
            stop_loss_price,
        })
    }

    async fn place_and_apply(
        &self,
        decision: &Decision,
        quantity: f64,
        stop_loss_price: Option<f64>,
        closing: bool,
    ) -> Result<ExecutionResult, PipelineError> {
        let symbol = &decision.symbol;
        let side = match decision.direction {
            Direction::Buy => OrderSide::Buy,
            Direction::Sell => OrderSide::Sell,
            Direction::Hold => unreachable!("hold handled before placement"),
        };

        let quantity_dec = Decimal::from_f64(quantity)
            .filter(|q| *q > Decimal::ZERO)
            .ok_or_else(|| {
                PipelineError::InsufficientData(format!(
                    "{}: quantity {} not representable",
                    symbol, quantity
                ))
            })?;
        let stop_dec = stop_loss_price.and_then(Decimal::from_f64);

        // One id for the whole attempt chain: a retry after a lost response
        // must not be able to fill twice.
        let order = OrderRequest {
            client_order_id: Uuid::new_v4().to_string(),
            symbol: symbol.clone(),
            side,
            order_type: OrderType::Market,
            quantity: quantity_dec,
            stop_loss_price: stop_dec,
        };

        let fill = match self.place_with_retry(&order).await {
            Ok(fill) => fill,
            Err(e) => {
                if e.is_transient() {
                    tracing::warn!(
                        "{}: giving up after {} retries: {}",
                        symbol,
                        self.config.retry_delays.len(),
                        e
                    );
                } else {
                    tracing::error!("{}: venue rejected order {}: {}", symbol, order.client_order_id, e);
                }
                return self
                    .record_skip(ExecutionResult::skipped(
                        symbol,
                        decision.direction,
                        format!("venue error: {}", e),
                    ))
                    .await;
            }
        };

        let result = {
            let mut portfolio = self.portfolio.lock().await;
            if closing {
                apply_closing_fill(&mut portfolio, &fill)
            } else {
                apply_opening_fill(
                    &mut portfolio,
                    &fill,
                    stop_loss_price.unwrap_or(0.0),
                    decision.direction,
                )
            }
        };

        self.journal_fill(&result).await;

        tracing::info!(
            "{}: {} {} @ {} (fees {}, order {})",
            symbol,
            decision.direction,
            result.quantity,
            result.fill_price,
            result.fees,
            fill.client_order_id
        );

        Ok(result)
    }

    async fn place_with_retry(&self, order: &OrderRequest) -> Result<Fill, venue_adapter::VenueError> {
        let mut attempt = 0;
        loop {
            match self.venue.place_order(order).await {
                Ok(fill) => return Ok(fill),
                Err(e) if e.is_transient() && attempt < self.config.retry_delays.len() => {
                    let delay = self.config.retry_delays[attempt];
                    attempt += 1;
                    tracing::warn!(
                        "{}: transient venue error (attempt {}), retrying in {:?}: {}",
                        order.symbol,
                        attempt,
                        delay,
                        e
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn record_skip(
        &self,
        result: ExecutionResult,
    ) -> Result<ExecutionResult, PipelineError> {
        if let Some(reason) = &result.skip_reason {
            tracing::debug!("{}: skipped ({})", result.symbol, reason);
        }
        if let Err(e) = self.journal.record_order(&result, self.venue.is_paper()).await {
            tracing::error!("{}: order journal write failed: {}", result.symbol, e);
        }
        Ok(result)
    }

    async fn journal_fill(&self, result: &ExecutionResult) {
        if let Err(e) = self.journal.record_order(result, self.venue.is_paper()).await {
            tracing::error!("{}: order journal write failed: {}", result.symbol, e);
        }
        let portfolio = self.portfolio.lock().await;
        if let Err(e) = self.journal.persist_portfolio(&portfolio).await {
            tracing::error!("portfolio persistence failed: {}", e);
        }
    }
}

fn opposes(side: PositionSide, direction: Direction) -> bool {
    matches!(
        (side, direction),
        (PositionSide::Long, Direction::Sell) | (PositionSide::Short, Direction::Buy)
    )
}

fn apply_opening_fill(
    portfolio: &mut PortfolioState,
    fill: &Fill,
    stop_loss_price: f64,
    direction: Direction,
) -> ExecutionResult {
    let fill_price = fill.price.to_f64().unwrap_or(0.0);
    let quantity = fill.quantity.to_f64().unwrap_or(0.0);
    let fees = fill.fees.to_f64().unwrap_or(0.0);

    let side = match direction {
        Direction::Buy => PositionSide::Long,
        _ => PositionSide::Short,
    };

    portfolio.open_positions.insert(
        fill.symbol.clone(),
        Position {
            symbol: fill.symbol.clone(),
            side,
            entry_price: fill_price,
            quantity,
            stop_loss_price,
            opened_at: fill.filled_at,
            closed_at: None,
            realized_pnl: None,
        },
    );
    portfolio.equity -= fees;
    portfolio.daily_realized_pnl -= fees;
    portfolio.daily_trades += 1;

    ExecutionResult {
        symbol: fill.symbol.clone(),
        skipped: false,
        skip_reason: None,
        order_id: Some(fill.client_order_id.clone()),
        direction,
        quantity,
        fill_price,
        fees,
        realized_pnl: None,
    }
}

fn apply_closing_fill(portfolio: &mut PortfolioState, fill: &Fill) -> ExecutionResult {
    let fill_price = fill.price.to_f64().unwrap_or(0.0);
    let fees = fill.fees.to_f64().unwrap_or(0.0);

    let mut position = match portfolio.open_positions.remove(&fill.symbol) {
        Some(p) => p,
        None => {
            // Fill for a symbol we no longer track; record it, mutate nothing
            tracing::error!("{}: closing fill without an open position", fill.symbol);
            return ExecutionResult {
                symbol: fill.symbol.clone(),
                skipped: false,
                skip_reason: None,
                order_id: Some(fill.client_order_id.clone()),
                direction: match fill.side {
                    OrderSide::Buy => Direction::Buy,
                    OrderSide::Sell => Direction::Sell,
                },
                quantity: fill.quantity.to_f64().unwrap_or(0.0),
                fill_price,
                fees,
                realized_pnl: None,
            };
        }
    };

    let gross = match position.side {
        PositionSide::Long => (fill_price - position.entry_price) * position.quantity,
        PositionSide::Short => (position.entry_price - fill_price) * position.quantity,
    };
    let pnl = gross - fees;

    position.closed_at = Some(fill.filled_at);
    position.realized_pnl = Some(pnl);

    portfolio.equity += pnl;
    portfolio.daily_realized_pnl += pnl;
    portfolio.daily_trades += 1;

    ExecutionResult {
        symbol: fill.symbol.clone(),
        skipped: false,
        skip_reason: None,
        order_id: Some(fill.client_order_id.clone()),
        direction: match fill.side {
            OrderSide::Buy => Direction::Buy,
            OrderSide::Sell => Direction::Sell,
        },
        quantity: position.quantity,
        fill_price,
        fees,
        realized_pnl: Some(pnl),
    }
}
