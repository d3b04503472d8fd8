use serde::{Deserialize, Serialize};
use trading_core::{Decision, Direction, PortfolioState, PositionSide, RiskVerdict, VerdictReason};

/// Portfolio-level limits enforced independently of any decision's own
/// reasoning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    pub max_open_positions: usize,
    /// Cap on any single position as a fraction of equity.
    pub max_position_fraction: f64,
    /// Daily realized loss, as a fraction of the day's starting equity,
    /// beyond which all new exposure is rejected.
    pub daily_loss_limit_fraction: f64,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_open_positions: 3,
            max_position_fraction: 0.10,
            daily_loss_limit_fraction: 0.05,
        }
    }
}

/// True when the decision would close or reduce an existing position
/// rather than add exposure.
fn reduces_exposure(decision: &Decision, portfolio: &PortfolioState) -> bool {
    match portfolio.open_positions.get(&decision.symbol) {
        Some(position) => matches!(
            (position.side, decision.direction),
            (PositionSide::Long, Direction::Sell) | (PositionSide::Short, Direction::Buy)
        ),
        None => false,
    }
}

/// Judge one Decision against portfolio state. Pure and idempotent; checks
/// short-circuit in a fixed order so the reported reason is deterministic.
/// Risk reduction is never blocked; the limits gate new exposure only.
pub fn evaluate(decision: &Decision, portfolio: &PortfolioState, config: &RiskConfig) -> RiskVerdict {
    if reduces_exposure(decision, portfolio) {
        return RiskVerdict::approve(decision.suggested_size_fraction, VerdictReason::Ok);
    }

    if portfolio.emergency_stop_engaged {
        tracing::warn!(
            "Risk gate: {} rejected, emergency stop engaged",
            decision.symbol
        );
        return RiskVerdict::reject(VerdictReason::EmergencyStop);
    }

    if decision.direction == Direction::Hold {
        return RiskVerdict::approve(0.0, VerdictReason::Ok);
    }

    if !portfolio.has_open_position(&decision.symbol)
        && portfolio.open_position_count() >= config.max_open_positions
    {
        tracing::info!(
            "Risk gate: {} rejected, {} open positions at limit {}",
            decision.symbol,
            portfolio.open_position_count(),
            config.max_open_positions
        );
        return RiskVerdict::reject(VerdictReason::MaxOpenPositions);
    }

    if portfolio.daily_loss_breached(config.daily_loss_limit_fraction) {
        tracing::warn!(
            "Risk gate: {} rejected, daily loss {:.2} breached limit ({:.1}% of {:.2})",
            decision.symbol,
            portfolio.daily_realized_pnl,
            config.daily_loss_limit_fraction * 100.0,
            portfolio.daily_starting_equity
        );
        return RiskVerdict::reject(VerdictReason::DailyLossLimit);
    }

    if decision.suggested_size_fraction > config.max_position_fraction {
        tracing::info!(
            "Risk gate: {} clamped {:.4} -> {:.4}",
            decision.symbol,
            decision.suggested_size_fraction,
            config.max_position_fraction
        );
        return RiskVerdict::approve(config.max_position_fraction, VerdictReason::PositionLimit);
    }

    RiskVerdict::approve(decision.suggested_size_fraction, VerdictReason::Ok)
}
