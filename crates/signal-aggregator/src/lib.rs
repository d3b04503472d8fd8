use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use strategy_client::StrategySourceClient;
use tokio::task::JoinSet;
use tokio::time::Instant;
use trading_core::{Decision, MarketSnapshot, PipelineError, Signal};

pub mod ensemble;
pub use ensemble::{direction_for, ensemble_score, DEFAULT_WEIGHT};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatorConfig {
    /// strategy_id -> weight in [0, 1]. Need not sum to 1; normalized over
    /// the strategies that respond. Unlisted responders get weight 1.0.
    pub strategy_weights: HashMap<String, f64>,
    /// Half-width of the HOLD band around zero score.
    pub dead_zone_threshold: f64,
    pub per_source_timeout: Duration,
    pub cycle_deadline: Duration,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            strategy_weights: HashMap::new(),
            dead_zone_threshold: 0.15,
            per_source_timeout: Duration::from_secs(2),
            cycle_deadline: Duration::from_secs(5),
        }
    }
}

/// Fuses independent, unreliable strategy opinions into one Decision per
/// symbol under a hard time budget. Has no side effects beyond the HTTP
/// calls themselves.
pub struct SignalAggregator {
    sources: Vec<Arc<StrategySourceClient>>,
    sizer: position_sizer::KellySizer,
    config: AggregatorConfig,
    /// strategy_id -> last health probe result. Known-dead sources are
    /// skipped in the fan-out so they don't burn the per-source budget.
    health: DashMap<String, bool>,
}

impl SignalAggregator {
    pub fn new(
        sources: Vec<Arc<StrategySourceClient>>,
        sizer: position_sizer::KellySizer,
        config: AggregatorConfig,
    ) -> Self {
        Self {
            sources,
            sizer,
            config,
            health: DashMap::new(),
        }
    }

    pub fn source_count(&self) -> usize {
        self.sources.len()
    }

    /// Probe every source's liveness endpoint. Called by the orchestration
    /// loop between ticks; a source with no recorded probe is assumed live.
    pub async fn refresh_health(&self) {
        let mut probes = JoinSet::new();
        for source in &self.sources {
            let source = Arc::clone(source);
            probes.spawn(async move {
                let alive = source.health().await;
                (source.strategy_id().to_string(), alive)
            });
        }

        while let Some(result) = probes.join_next().await {
            if let Ok((strategy_id, alive)) = result {
                if !alive {
                    tracing::warn!("Strategy source {} is down, skipping next fan-out", strategy_id);
                }
                self.health.insert(strategy_id, alive);
            }
        }
    }

    fn is_live(&self, strategy_id: &str) -> bool {
        self.health.get(strategy_id).map(|h| *h).unwrap_or(true)
    }

    /// Fan out to every live source, collect whatever answers in time, and
    /// fuse the responses into one Decision.
    ///
    /// A source that times out, errors, or returns malformed output is
    /// absent for this cycle: excluded from the weighted average entirely,
    /// never a zero-confidence vote. Fails with `NoSignalsAvailable` only
    /// when nothing responds before the cycle deadline; the caller treats
    /// that as HOLD for this symbol.
    pub async fn aggregate(
        &self,
        symbol: &str,
        snapshot: &MarketSnapshot,
    ) -> Result<Decision, PipelineError> {
        if symbol.is_empty() {
            return Err(PipelineError::InsufficientData("empty symbol".to_string()));
        }
        if !snapshot.price.is_finite() || snapshot.price <= 0.0 {
            return Err(PipelineError::InsufficientData(format!(
                "{}: snapshot has no usable price",
                symbol
            )));
        }

        let deadline = Instant::now() + self.config.cycle_deadline;
        let snapshot = Arc::new(snapshot.clone());
        let per_source_timeout = self.config.per_source_timeout;

        let mut fanout = JoinSet::new();
        for source in self.sources.iter().filter(|s| self.is_live(s.strategy_id())) {
            let source = Arc::clone(source);
            let snapshot = Arc::clone(&snapshot);
            let symbol = symbol.to_string();
            fanout.spawn(async move {
                let strategy_id = source.strategy_id().to_string();
                let result =
                    tokio::time::timeout(per_source_timeout, source.get_signal(&symbol, &snapshot))
                        .await;
                (strategy_id, result)
            });
        }

        // Collect in arrival order until the set drains or the deadline
        // hits; dropping the JoinSet cancels any stragglers.
        let mut signals: Vec<Signal> = Vec::new();
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let next = tokio::time::timeout(remaining, fanout.join_next()).await;
            match next {
                Ok(Some(Ok((strategy_id, result)))) => match result {
                    Ok(Ok(signal)) => signals.push(signal),
                    Ok(Err(e)) => {
                        tracing::warn!("Strategy {} absent this cycle: {}", strategy_id, e);
                    }
                    Err(_) => {
                        tracing::warn!(
                            "Strategy {} timed out after {:?}",
                            strategy_id,
                            per_source_timeout
                        );
                    }
                },
                Ok(Some(Err(e))) => {
                    tracing::warn!("Strategy fan-out task failed: {}", e);
                }
                Ok(None) => break, // all sources accounted for
                Err(_) => {
                    tracing::warn!(
                        "{}: cycle deadline hit with {} response(s), cancelling stragglers",
                        symbol,
                        signals.len()
                    );
                    break;
                }
            }
        }
        drop(fanout);

        if signals.is_empty() {
            return Err(PipelineError::NoSignalsAvailable(format!(
                "{}: zero of {} sources responded",
                symbol,
                self.sources.len()
            )));
        }

        let score = ensemble_score(&signals, &self.config.strategy_weights);
        let direction = direction_for(score, self.config.dead_zone_threshold);
        let suggested_size_fraction = self.sizer.size_fraction(score);

        tracing::info!(
            "{}: {} responders, ensemble score {:.4} -> {} (size {:.4})",
            symbol,
            signals.len(),
            score,
            direction,
            suggested_size_fraction
        );

        Ok(Decision {
            symbol: symbol.to_string(),
            direction,
            ensemble_score: score,
            contributing_signals: signals,
            suggested_size_fraction,
            price: snapshot.price,
            decided_at: Utc::now(),
        })
    }
}
