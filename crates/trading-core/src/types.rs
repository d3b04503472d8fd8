use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Buy,
    Sell,
    Hold,
}

impl Direction {
    pub fn is_actionable(&self) -> bool {
        !matches!(self, Direction::Hold)
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Buy => write!(f, "BUY"),
            Direction::Sell => write!(f, "SELL"),
            Direction::Hold => write!(f, "HOLD"),
        }
    }
}

/// One strategy source's opinion for one symbol at one point in time.
/// A source that failed or timed out contributes no Signal at all.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub strategy_id: String,
    pub symbol: String,
    pub direction: Direction,
    /// Always in [0, 1], including for HOLD.
    pub confidence: f64,
    pub generated_at: DateTime<Utc>,
}

impl Signal {
    /// Confidence signed by direction: +conf for BUY, -conf for SELL, 0 for HOLD.
    pub fn signed_confidence(&self) -> f64 {
        match self.direction {
            Direction::Buy => self.confidence,
            Direction::Sell => -self.confidence,
            Direction::Hold => 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ohlc {
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Latest market state for one symbol, as served by the data feed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketSnapshot {
    pub symbol: String,
    pub price: f64,
    pub volume_24h: f64,
    #[serde(default)]
    pub recent_ohlc: Vec<Ohlc>,
    #[serde(default)]
    pub indicators: HashMap<String, f64>,
    pub fetched_at: DateTime<Utc>,
}

/// The aggregator's fused output for one symbol in one cycle.
/// Created once, consumed exactly once by the risk gate, never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub symbol: String,
    pub direction: Direction,
    /// Weight-normalized average of signed confidences, in [-1, 1].
    pub ensemble_score: f64,
    /// In arrival order; the ensemble math itself is order-independent.
    pub contributing_signals: Vec<Signal>,
    /// Fraction of portfolio equity, in [0, max_position_fraction].
    pub suggested_size_fraction: f64,
    /// Snapshot price the decision was made against.
    pub price: f64,
    pub decided_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerdictReason {
    Ok,
    PositionLimit,
    DailyLossLimit,
    MaxOpenPositions,
    EmergencyStop,
    NoStopLossConfigurable,
}

impl std::fmt::Display for VerdictReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            VerdictReason::Ok => "ok",
            VerdictReason::PositionLimit => "position_limit",
            VerdictReason::DailyLossLimit => "daily_loss_limit",
            VerdictReason::MaxOpenPositions => "max_open_positions",
            VerdictReason::EmergencyStop => "emergency_stop",
            VerdictReason::NoStopLossConfigurable => "no_stop_loss_configurable",
        };
        write!(f, "{s}")
    }
}

/// The risk gate's judgment on one Decision.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RiskVerdict {
    pub approved: bool,
    /// Never exceeds the decision's suggested fraction.
    pub adjusted_size_fraction: f64,
    pub reason: VerdictReason,
}

impl RiskVerdict {
    pub fn approve(fraction: f64, reason: VerdictReason) -> Self {
        Self {
            approved: true,
            adjusted_size_fraction: fraction,
            reason,
        }
    }

    pub fn reject(reason: VerdictReason) -> Self {
        Self {
            approved: false,
            adjusted_size_fraction: 0.0,
            reason,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionSide {
    Long,
    Short,
}

/// An open or closed exposure in one symbol. At most one open Position
/// per symbol; `stop_loss_price` is mandatory while open.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub side: PositionSide,
    pub entry_price: f64,
    pub quantity: f64,
    pub stop_loss_price: f64,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub realized_pnl: Option<f64>,
}

impl Position {
    pub fn is_open(&self) -> bool {
        self.closed_at.is_none()
    }

    pub fn notional(&self) -> f64 {
        self.entry_price * self.quantity
    }
}

/// Process-wide portfolio aggregate. Read by the risk gate as a snapshot,
/// mutated only by the order executor under a single lock.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortfolioState {
    pub open_positions: HashMap<String, Position>,
    pub daily_realized_pnl: f64,
    pub daily_starting_equity: f64,
    pub equity: f64,
    pub daily_trades: u32,
    /// Sticky until an explicit operator reset; survives restarts.
    pub emergency_stop_engaged: bool,
}

impl PortfolioState {
    pub fn new(starting_equity: f64) -> Self {
        Self {
            open_positions: HashMap::new(),
            daily_realized_pnl: 0.0,
            daily_starting_equity: starting_equity,
            equity: starting_equity,
            daily_trades: 0,
            emergency_stop_engaged: false,
        }
    }

    pub fn has_open_position(&self, symbol: &str) -> bool {
        self.open_positions.contains_key(symbol)
    }

    pub fn open_position_count(&self) -> usize {
        self.open_positions.len()
    }

    /// True once the day's realized loss has consumed the configured
    /// fraction of starting equity.
    pub fn daily_loss_breached(&self, daily_loss_limit_fraction: f64) -> bool {
        self.daily_realized_pnl <= -(daily_loss_limit_fraction * self.daily_starting_equity)
    }

    /// Reset the per-day fields at the daily boundary. Open positions and
    /// the emergency stop are untouched.
    pub fn roll_over_day(&mut self) {
        self.daily_realized_pnl = 0.0;
        self.daily_starting_equity = self.equity;
        self.daily_trades = 0;
    }
}

/// Outcome of one Execute call, recorded in the order audit trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub symbol: String,
    pub skipped: bool,
    pub skip_reason: Option<String>,
    pub order_id: Option<String>,
    pub direction: Direction,
    pub quantity: f64,
    pub fill_price: f64,
    pub fees: f64,
    pub realized_pnl: Option<f64>,
}

impl ExecutionResult {
    pub fn skipped(symbol: impl Into<String>, direction: Direction, reason: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            skipped: true,
            skip_reason: Some(reason.into()),
            order_id: None,
            direction,
            quantity: 0.0,
            fill_price: 0.0,
            fees: 0.0,
            realized_pnl: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn signal(direction: Direction, confidence: f64) -> Signal {
        Signal {
            strategy_id: "momentum".to_string(),
            symbol: "SOLUSD".to_string(),
            direction,
            confidence,
            generated_at: Utc::now(),
        }
    }

    #[test]
    fn signed_confidence_by_direction() {
        assert_eq!(signal(Direction::Buy, 0.8).signed_confidence(), 0.8);
        assert_eq!(signal(Direction::Sell, 0.8).signed_confidence(), -0.8);
        assert_eq!(signal(Direction::Hold, 0.8).signed_confidence(), 0.0);
    }

    #[test]
    fn daily_loss_breach_threshold() {
        let mut portfolio = PortfolioState::new(10_000.0);
        portfolio.daily_realized_pnl = -499.0;
        assert!(!portfolio.daily_loss_breached(0.05));
        portfolio.daily_realized_pnl = -500.0;
        assert!(portfolio.daily_loss_breached(0.05));
        portfolio.daily_realized_pnl = -600.0;
        assert!(portfolio.daily_loss_breached(0.05));
    }

    #[test]
    fn rollover_resets_daily_fields_only() {
        let mut portfolio = PortfolioState::new(10_000.0);
        portfolio.equity = 11_000.0;
        portfolio.daily_realized_pnl = 250.0;
        portfolio.daily_trades = 7;
        portfolio.emergency_stop_engaged = true;
        portfolio.open_positions.insert(
            "XXBTZUSD".to_string(),
            Position {
                symbol: "XXBTZUSD".to_string(),
                side: PositionSide::Long,
                entry_price: 60_000.0,
                quantity: 0.01,
                stop_loss_price: 57_000.0,
                opened_at: Utc::now(),
                closed_at: None,
                realized_pnl: None,
            },
        );

        portfolio.roll_over_day();

        assert_eq!(portfolio.daily_realized_pnl, 0.0);
        assert_eq!(portfolio.daily_starting_equity, 11_000.0);
        assert_eq!(portfolio.daily_trades, 0);
        assert!(portfolio.emergency_stop_engaged);
        assert_eq!(portfolio.open_position_count(), 1);
    }
}
