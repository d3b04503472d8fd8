use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use dashmap::DashMap;
use market_data::MarketDataClient;
use order_executor::OrderExecutor;
use risk_gate::RiskConfig;
use serde::Serialize;
use signal_aggregator::SignalAggregator;
use tokio::sync::{Mutex, RwLock, Semaphore};
use tokio::task::JoinSet;
use trading_core::{
    Decision, ExecutionResult, PipelineError, Position, PositionSide, RiskVerdict, VerdictReason,
};

use crate::state_store::StateStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Running,
    Paused,
    Halted,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct CycleSummary {
    pub cycle: u64,
    pub symbols_processed: usize,
    pub decisions: usize,
    pub orders_filled: usize,
    pub skips: usize,
    pub errors: usize,
}

impl CycleSummary {
    fn idle(cycle: u64) -> Self {
        Self {
            cycle,
            ..Self::default()
        }
    }
}

/// Outcome of a symbol's decision phase.
enum Decided {
    /// Open position's stop crossed at this price; flatten it.
    StopCrossed(f64),
    Act(Decision),
    Nothing,
}

fn stop_crossed(position: &Position, price: f64) -> bool {
    match position.side {
        PositionSide::Long => price <= position.stop_loss_price,
        PositionSide::Short => price >= position.stop_loss_price,
    }
}

/// Operator-facing status snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub run_state: RunState,
    pub emergency_stop_engaged: bool,
    pub equity: f64,
    pub daily_realized_pnl: f64,
    pub daily_trades: u32,
    pub open_positions: Vec<Position>,
    pub cycles_run: u64,
}

/// Ties the pipeline stages together: one Aggregate → Evaluate → Execute
/// pass per symbol per tick, symbols concurrent, portfolio mutation
/// serialized inside the executor.
pub struct Engine {
    symbols: Vec<String>,
    aggregator: Arc<SignalAggregator>,
    market_data: Arc<MarketDataClient>,
    executor: Arc<OrderExecutor>,
    store: Arc<StateStore>,
    risk_config: RiskConfig,
    /// Hard budget for a symbol's decision phase (fetch + fan-out). Order
    /// placement is never cancelled mid-flight.
    cycle_deadline: std::time::Duration,
    run_state: RwLock<RunState>,
    /// Most recent (Decision, RiskVerdict) per symbol, for status queries.
    last_decisions: DashMap<String, (Decision, RiskVerdict)>,
    cycles_run: AtomicU64,
    current_day: Mutex<NaiveDate>,
    concurrency: Arc<Semaphore>,
}

impl Engine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        symbols: Vec<String>,
        aggregator: Arc<SignalAggregator>,
        market_data: Arc<MarketDataClient>,
        executor: Arc<OrderExecutor>,
        store: Arc<StateStore>,
        risk_config: RiskConfig,
        cycle_deadline: std::time::Duration,
        max_concurrent_symbols: usize,
    ) -> Self {
        Self {
            symbols,
            aggregator,
            market_data,
            executor,
            store,
            risk_config,
            cycle_deadline,
            run_state: RwLock::new(RunState::Running),
            last_decisions: DashMap::new(),
            cycles_run: AtomicU64::new(0),
            current_day: Mutex::new(Utc::now().date_naive()),
            concurrency: Arc::new(Semaphore::new(max_concurrent_symbols)),
        }
    }

    pub async fn run_state(&self) -> RunState {
        *self.run_state.read().await
    }

    pub async fn pause(&self) {
        let mut state = self.run_state.write().await;
        if *state == RunState::Running {
            *state = RunState::Paused;
            tracing::info!("Engine paused; ticks continue without order placement");
        }
    }

    pub async fn resume(&self) {
        let mut state = self.run_state.write().await;
        match *state {
            RunState::Paused => {
                *state = RunState::Running;
                tracing::info!("Engine resumed");
            }
            RunState::Halted => {
                tracing::warn!("Engine is halted; restart the process to trade again");
            }
            RunState::Running => {}
        }
    }

    /// Terminal. A halted engine never places another order.
    pub async fn halt(&self) {
        let mut state = self.run_state.write().await;
        if *state != RunState::Halted {
            *state = RunState::Halted;
            tracing::warn!("Engine halted");
        }
    }

    pub async fn emergency_stop_engaged(&self) -> bool {
        let portfolio = self.executor.portfolio();
        let portfolio = portfolio.lock().await;
        portfolio.emergency_stop_engaged
    }

    /// Engage the sticky stop: new exposure is refused from this point on,
    /// across restarts, until an operator clears it.
    pub async fn set_emergency_stop(&self, reason: &str) {
        {
            let portfolio = self.executor.portfolio();
            let mut portfolio = portfolio.lock().await;
            if portfolio.emergency_stop_engaged {
                return;
            }
            portfolio.emergency_stop_engaged = true;
        }
        tracing::error!("EMERGENCY STOP engaged: {}", reason);
        if let Err(e) = self.store.set_emergency_stop(true).await {
            tracing::error!("Failed to persist emergency stop: {}", e);
        }
    }

    /// Explicit operator action; nothing in the engine calls this.
    pub async fn clear_emergency_stop(&self) -> anyhow::Result<()> {
        {
            let portfolio = self.executor.portfolio();
            let mut portfolio = portfolio.lock().await;
            portfolio.emergency_stop_engaged = false;
        }
        self.store.set_emergency_stop(false).await?;
        tracing::warn!("Emergency stop cleared by operator");
        Ok(())
    }

    pub async fn status(&self) -> EngineStatus {
        let (equity, daily_realized_pnl, daily_trades, open_positions, emergency) = {
            let portfolio = self.executor.portfolio();
            let portfolio = portfolio.lock().await;
            (
                portfolio.equity,
                portfolio.daily_realized_pnl,
                portfolio.daily_trades,
                portfolio.open_positions.values().cloned().collect(),
                portfolio.emergency_stop_engaged,
            )
        };
        EngineStatus {
            run_state: self.run_state().await,
            emergency_stop_engaged: emergency,
            equity,
            daily_realized_pnl,
            daily_trades,
            open_positions,
            cycles_run: self.cycles_run.load(Ordering::SeqCst),
        }
    }

    pub fn last_decision(&self, symbol: &str) -> Option<(Decision, RiskVerdict)> {
        self.last_decisions.get(symbol).map(|e| e.value().clone())
    }

    /// Reset the per-day counters at the UTC midnight boundary. Runs every
    /// tick, including while paused, so a pause spanning midnight still
    /// starts the new day clean.
    pub async fn roll_over_if_new_day(&self) {
        let today = Utc::now().date_naive();
        {
            let mut day = self.current_day.lock().await;
            if *day == today {
                return;
            }
            *day = today;
        }

        let portfolio = self.executor.portfolio();
        let mut portfolio = portfolio.lock().await;
        portfolio.roll_over_day();
        tracing::info!(
            "Daily rollover: starting equity {:.2}, {} open position(s) carried",
            portfolio.daily_starting_equity,
            portfolio.open_position_count()
        );
        if let Err(e) = self.store.save_portfolio(&portfolio).await {
            tracing::error!("Failed to persist rollover: {}", e);
        }
    }

    /// One full tick: health probes, then every symbol through the pipeline
    /// concurrently. A symbol's failure is contained to that symbol.
    pub async fn run_cycle(self: Arc<Self>) -> CycleSummary {
        let cycle = self.cycles_run.fetch_add(1, Ordering::SeqCst) + 1;

        match self.run_state().await {
            RunState::Running => {}
            RunState::Paused | RunState::Halted => return CycleSummary::idle(cycle),
        }

        self.aggregator.refresh_health().await;

        let mut tasks = JoinSet::new();
        for symbol in self.symbols.clone() {
            let engine = Arc::clone(&self);
            tasks.spawn(async move {
                let _permit = engine.concurrency.acquire().await.unwrap();
                let outcome = engine.process_symbol(&symbol).await;
                (symbol, outcome)
            });
        }

        let mut summary = CycleSummary::idle(cycle);
        while let Some(joined) = tasks.join_next().await {
            let (symbol, outcome) = match joined {
                Ok(pair) => pair,
                Err(e) => {
                    tracing::error!("Symbol task panicked: {}", e);
                    summary.errors += 1;
                    continue;
                }
            };
            summary.symbols_processed += 1;
            match outcome {
                Ok(Some(result)) => {
                    summary.decisions += 1;
                    if result.skipped {
                        summary.skips += 1;
                    } else {
                        summary.orders_filled += 1;
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    summary.errors += 1;
                    match e {
                        PipelineError::DataUnavailable(msg) => {
                            tracing::warn!("{}: skipping cycle, {}", symbol, msg);
                        }
                        other => {
                            tracing::error!("{}: cycle failed: {}", symbol, other);
                        }
                    }
                }
            }
        }

        tracing::info!(
            "Cycle #{} complete: {} symbols, {} decisions, {} filled, {} skipped, {} errors",
            summary.cycle,
            summary.symbols_processed,
            summary.decisions,
            summary.orders_filled,
            summary.skips,
            summary.errors
        );
        summary
    }

    /// Aggregate → Evaluate → Execute for one symbol, strictly in order.
    /// The decision phase runs under the hard cycle deadline; a symbol that
    /// overruns it is abandoned for the tick with no order sent.
    /// `Ok(None)` means nothing to do this tick (no responders).
    async fn process_symbol(&self, symbol: &str) -> Result<Option<ExecutionResult>, PipelineError> {
        let decided = tokio::time::timeout(self.cycle_deadline, self.decide(symbol))
            .await
            .map_err(|_| {
                PipelineError::CycleDeadlineExceeded(format!(
                    "{}: decision phase overran {:?}",
                    symbol, self.cycle_deadline
                ))
            })??;

        match decided {
            Decided::StopCrossed(price) => {
                let result = self
                    .executor
                    .close_position(symbol, price, "stop loss crossed")
                    .await?;
                Ok(Some(result))
            }
            Decided::Act(decision) => self.gate_and_execute(decision).await.map(Some),
            Decided::Nothing => Ok(None),
        }
    }

    /// Decision phase only: no order placement happens in here, so the
    /// deadline wrapper can cancel it at any point.
    async fn decide(&self, symbol: &str) -> Result<Decided, PipelineError> {
        let snapshot = self
            .market_data
            .get_snapshot(symbol)
            .await
            .map_err(|e| PipelineError::DataUnavailable(e.to_string()))?;

        // A crossed stop is acted on before any new opinion is solicited
        let crossed = {
            let portfolio = self.executor.portfolio();
            let portfolio = portfolio.lock().await;
            portfolio
                .open_positions
                .get(symbol)
                .map(|position| stop_crossed(position, snapshot.price))
                .unwrap_or(false)
        };
        if crossed {
            return Ok(Decided::StopCrossed(snapshot.price));
        }

        match self.aggregator.aggregate(symbol, &snapshot).await {
            Ok(decision) => Ok(Decided::Act(decision)),
            Err(PipelineError::NoSignalsAvailable(msg)) => {
                tracing::info!("{}: holding, {}", symbol, msg);
                Ok(Decided::Nothing)
            }
            Err(e) => Err(e),
        }
    }

    async fn gate_and_execute(
        &self,
        decision: Decision,
    ) -> Result<ExecutionResult, PipelineError> {
        let portfolio_snapshot = {
            let portfolio = self.executor.portfolio();
            let portfolio = portfolio.lock().await;
            portfolio.clone()
        };

        let verdict = risk_gate::evaluate(&decision, &portfolio_snapshot, &self.risk_config);

        if verdict.reason == VerdictReason::DailyLossLimit {
            self.set_emergency_stop("daily loss limit breached").await;
        }

        self.last_decisions
            .insert(decision.symbol.clone(), (decision.clone(), verdict));

        self.executor.execute(&decision, &verdict).await
    }
}

/// Cloneable operator surface over a shared engine: pause/resume/halt,
/// emergency stop control, and status snapshots.
#[derive(Clone)]
pub struct EngineHandle {
    engine: Arc<Engine>,
}

impl EngineHandle {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }

    pub async fn pause(&self) {
        self.engine.pause().await;
    }

    pub async fn resume(&self) {
        self.engine.resume().await;
    }

    pub async fn halt(&self) {
        self.engine.halt().await;
    }

    pub async fn set_emergency_stop(&self, reason: &str) {
        self.engine.set_emergency_stop(reason).await;
    }

    pub async fn clear_emergency_stop(&self) -> anyhow::Result<()> {
        self.engine.clear_emergency_stop().await
    }

    pub async fn status(&self) -> EngineStatus {
        self.engine.status().await
    }

    pub fn last_decision(&self, symbol: &str) -> Option<(Decision, RiskVerdict)> {
        self.engine.last_decision(symbol)
    }
}
