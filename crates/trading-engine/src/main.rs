use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use market_data::MarketDataClient;
use order_executor::{ExecutorConfig, OrderExecutor};
use position_sizer::KellySizer;
use risk_gate::RiskConfig;
use signal_aggregator::{AggregatorConfig, SignalAggregator};
use strategy_client::StrategySourceClient;
use tokio::signal::unix::SignalKind;
use tokio::sync::Mutex;
use tokio::time;
use trading_core::PortfolioState;
use venue_adapter::{PaperVenue, RestVenue, VenueAdapter};

mod config;
mod engine;
mod state_store;

use config::{EngineConfig, VenueMode};
use engine::{Engine, EngineHandle, RunState};
use state_store::StateStore;

const HTTP_TIMEOUT: Duration = Duration::from_secs(5);
const PAPER_TAKER_FEE_RATE: f64 = 0.0026;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let json_logging = std::env::var("RUST_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    if json_logging {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
            )
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
            )
            .init();
    }

    // Panic hook: log panic info before crashing
    std::panic::set_hook(Box::new(|info| {
        eprintln!("PANIC: {info}");
        tracing::error!("PANIC: {info}");
    }));

    tracing::info!("Starting Helmsman trading engine");

    let config = EngineConfig::from_env()?;
    tracing::info!("Configuration loaded and validated");
    tracing::info!("  Symbols: {}", config.symbols.join(", "));
    tracing::info!("  Strategy sources: {}", config.strategy_endpoints.len());
    tracing::info!("  Max open positions: {}", config.max_open_positions);
    tracing::info!(
        "  Max position: {:.0}% of equity, daily loss limit {:.0}%",
        config.max_position_fraction * 100.0,
        config.daily_loss_limit_fraction * 100.0
    );
    tracing::info!("  Stop loss: {}%", config.stop_loss_percent);
    tracing::info!("  Tick interval: {:?}", config.tick_interval);

    // State store is fatal at startup: without it there is no trusted
    // portfolio, no emergency-stop memory, no ledger.
    let store = Arc::new(StateStore::connect(&config.database_url).await?);
    store.init_tables().await?;
    store.ping().await?;
    tracing::info!("Startup check: state store OK ({})", config.database_url);

    // Fail closed: an unreadable persisted portfolio aborts startup rather
    // than trading against a guessed state.
    let mut portfolio = store
        .load_portfolio()
        .await?
        .unwrap_or_else(|| PortfolioState::new(config.starting_equity));
    portfolio.emergency_stop_engaged |= store.emergency_stop().await?;
    if portfolio.emergency_stop_engaged {
        tracing::warn!(
            "Emergency stop is engaged from a previous run; only risk-reducing orders will go out"
        );
    }
    tracing::info!(
        "Portfolio restored: equity {:.2}, {} open position(s), daily PnL {:.2}",
        portfolio.equity,
        portfolio.open_position_count(),
        portfolio.daily_realized_pnl
    );

    let market_data = Arc::new(MarketDataClient::new(
        config.market_data_url.clone(),
        HTTP_TIMEOUT,
    ));
    if market_data.health().await {
        tracing::info!("Startup check: market data feed OK ({})", config.market_data_url);
    } else {
        tracing::warn!(
            "Startup check: market data feed unreachable ({}); symbols will be skipped until it returns",
            config.market_data_url
        );
    }

    let venue: Arc<dyn VenueAdapter> = match config.venue_mode {
        VenueMode::Paper => {
            tracing::info!(
                "Paper trading mode (taker fee {:.2}%)",
                PAPER_TAKER_FEE_RATE * 100.0
            );
            Arc::new(PaperVenue::new(
                Arc::clone(&market_data) as Arc<dyn venue_adapter::PriceFeed>,
                PAPER_TAKER_FEE_RATE,
            )?)
        }
        VenueMode::Live => {
            // validate() already required both the URL and the approval flag
            let Some(gateway_url) = config.venue_gateway_url.clone() else {
                anyhow::bail!("VENUE_MODE=live requires VENUE_GATEWAY_URL");
            };
            let reachable = reqwest::Client::new()
                .get(format!("{}/health", gateway_url))
                .timeout(HTTP_TIMEOUT)
                .send()
                .await
                .map(|r| r.status().is_success())
                .unwrap_or(false);
            if !reachable {
                anyhow::bail!("venue gateway {} unreachable; refusing to start live", gateway_url);
            }
            tracing::warn!("LIVE TRADING MODE — REAL MONEY AT RISK ({})", gateway_url);
            Arc::new(RestVenue::new(gateway_url, HTTP_TIMEOUT))
        }
    };

    let sources: Vec<Arc<StrategySourceClient>> = config
        .strategy_endpoints
        .iter()
        .map(|(id, url)| {
            Arc::new(StrategySourceClient::new(
                id.clone(),
                url.clone(),
                config.per_source_timeout,
            ))
        })
        .collect();

    let sizer = KellySizer::new(
        config.kelly_edge_scale,
        config.kelly_win_loss_ratio,
        config.kelly_multiplier,
        config.max_position_fraction,
    )?;

    let aggregator = Arc::new(SignalAggregator::new(
        sources,
        sizer,
        AggregatorConfig {
            strategy_weights: config.strategy_weights.clone(),
            dead_zone_threshold: config.dead_zone_threshold,
            per_source_timeout: config.per_source_timeout,
            cycle_deadline: config.cycle_deadline,
        },
    ));
    tracing::info!(
        "Signal aggregator ready ({} sources)",
        aggregator.source_count()
    );

    // Warn-only probe: dead sources are simply absent from the first fan-out
    aggregator.refresh_health().await;

    let executor = Arc::new(OrderExecutor::new(
        venue,
        Arc::new(Mutex::new(portfolio)),
        Arc::clone(&store) as Arc<dyn order_executor::ExecutionJournal>,
        ExecutorConfig {
            stop_loss_percent: config.stop_loss_percent,
            min_order_notional: config.min_order_notional,
            max_open_positions: config.max_open_positions,
            ..ExecutorConfig::default()
        },
    ));

    let risk_config = RiskConfig {
        max_open_positions: config.max_open_positions,
        max_position_fraction: config.max_position_fraction,
        daily_loss_limit_fraction: config.daily_loss_limit_fraction,
    };

    let engine = Arc::new(Engine::new(
        config.symbols.clone(),
        aggregator,
        Arc::clone(&market_data),
        Arc::clone(&executor),
        Arc::clone(&store),
        risk_config,
        config.cycle_deadline,
        config.max_concurrent_symbols,
    ));
    let handle = EngineHandle::new(Arc::clone(&engine));

    tracing::info!(
        "Engine is now running. Ticking every {:?}. Press Ctrl+C to stop.",
        config.tick_interval
    );

    let heartbeat_interval_cycles: u64 = std::env::var("HEARTBEAT_INTERVAL_CYCLES")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(10);

    let mut interval = time::interval(config.tick_interval);
    let mut sigterm = tokio::signal::unix::signal(SignalKind::terminate())?;
    let shutdown = async {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Received SIGINT");
            }
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM");
            }
        }
    };
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                // Rollover runs even while paused
                engine.roll_over_if_new_day().await;

                if engine.run_state().await == RunState::Halted {
                    tracing::warn!("Engine halted; exiting tick loop");
                    break;
                }

                let summary = Arc::clone(&engine).run_cycle().await;

                if heartbeat_interval_cycles > 0
                    && summary.cycle > 0
                    && summary.cycle % heartbeat_interval_cycles == 0
                {
                    let status = handle.status().await;
                    tracing::info!(
                        "Heartbeat | cycle #{} | {:?} | equity {:.2} | daily PnL {:.2} | {} open | {} trades today{}",
                        status.cycles_run,
                        status.run_state,
                        status.equity,
                        status.daily_realized_pnl,
                        status.open_positions.len(),
                        status.daily_trades,
                        if status.emergency_stop_engaged { " | EMERGENCY STOP" } else { "" }
                    );
                }
            }
            _ = &mut shutdown => {
                tracing::info!("Shutdown signal received, exiting gracefully...");
                break;
            }
        }
    }

    // Final persist so a restart resumes exactly here
    {
        let portfolio = executor.portfolio();
        let portfolio = portfolio.lock().await;
        if let Err(e) = store.save_portfolio(&portfolio).await {
            tracing::error!("Final portfolio persist failed: {}", e);
        }
    }

    tracing::info!("Trading engine shut down.");
    Ok(())
}
