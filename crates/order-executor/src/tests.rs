use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex as StdMutex;

use approx::assert_relative_eq;
use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use venue_adapter::{Fill, OrderRequest, VenueAdapter, VenueError};

use super::*;

struct MockVenue {
    transient_failures: AtomicUsize,
    permanent_failure: bool,
    fill_price: Decimal,
    fees: Decimal,
    requests: StdMutex<Vec<OrderRequest>>,
}

impl MockVenue {
    fn filling(price: Decimal) -> Self {
        Self {
            transient_failures: AtomicUsize::new(0),
            permanent_failure: false,
            fill_price: price,
            fees: Decimal::ZERO,
            requests: StdMutex::new(Vec::new()),
        }
    }

    fn flaky(price: Decimal, failures: usize) -> Self {
        Self {
            transient_failures: AtomicUsize::new(failures),
            ..Self::filling(price)
        }
    }

    fn rejecting() -> Self {
        Self {
            permanent_failure: true,
            ..Self::filling(Decimal::ONE)
        }
    }

    fn attempts(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    fn recorded(&self) -> Vec<OrderRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl VenueAdapter for MockVenue {
    async fn place_order(&self, order: &OrderRequest) -> Result<Fill, VenueError> {
        self.requests.lock().unwrap().push(order.clone());

        if self.permanent_failure {
            return Err(VenueError::permanent("insufficient funds"));
        }

        let remaining = self.transient_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.transient_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(VenueError::transient("gateway timeout"));
        }

        Ok(Fill {
            client_order_id: order.client_order_id.clone(),
            symbol: order.symbol.clone(),
            side: order.side,
            price: self.fill_price,
            quantity: order.quantity,
            fees: self.fees,
            filled_at: Utc::now(),
        })
    }

    fn is_paper(&self) -> bool {
        true
    }

    fn venue_name(&self) -> &str {
        "mock"
    }
}

fn decision(symbol: &str, direction: Direction, price: f64) -> Decision {
    Decision {
        symbol: symbol.to_string(),
        direction,
        ensemble_score: 0.5,
        contributing_signals: Vec::new(),
        suggested_size_fraction: 0.10,
        price,
        decided_at: Utc::now(),
    }
}

fn approved(fraction: f64) -> RiskVerdict {
    RiskVerdict::approve(fraction, trading_core::VerdictReason::Ok)
}

fn executor(venue: Arc<MockVenue>, portfolio: PortfolioState) -> OrderExecutor {
    OrderExecutor::new(
        venue,
        Arc::new(Mutex::new(portfolio)),
        Arc::new(NoopJournal),
        ExecutorConfig::default(),
    )
}

fn open_long(symbol: &str, entry: f64, quantity: f64) -> Position {
    Position {
        symbol: symbol.to_string(),
        side: PositionSide::Long,
        entry_price: entry,
        quantity,
        stop_loss_price: entry * 0.95,
        opened_at: Utc::now(),
        closed_at: None,
        realized_pnl: None,
    }
}

#[tokio::test(start_paused = true)]
async fn transient_failures_retry_with_same_order_id() {
    // Two timeouts, then a fill. One position, one id throughout.
    let venue = Arc::new(MockVenue::flaky(Decimal::from(100), 2));
    let exec = executor(Arc::clone(&venue), PortfolioState::new(10_000.0));

    let result = exec
        .execute(&decision("SOLUSD", Direction::Buy, 100.0), &approved(0.10))
        .await
        .unwrap();

    assert!(!result.skipped);
    assert_eq!(venue.attempts(), 3);

    let ids: Vec<String> = venue
        .recorded()
        .iter()
        .map(|r| r.client_order_id.clone())
        .collect();
    assert!(ids.iter().all(|id| id == &ids[0]));

    let portfolio = exec.portfolio();
    let portfolio = portfolio.lock().await;
    assert_eq!(portfolio.open_position_count(), 1);
    assert!(portfolio.has_open_position("SOLUSD"));
}

#[tokio::test]
async fn opening_orders_always_carry_a_stop() {
    let venue = Arc::new(MockVenue::filling(Decimal::from(200)));
    let exec = executor(Arc::clone(&venue), PortfolioState::new(10_000.0));

    exec.execute(&decision("XETHZUSD", Direction::Buy, 200.0), &approved(0.10))
        .await
        .unwrap();

    let requests = venue.recorded();
    assert_eq!(requests.len(), 1);
    let stop = requests[0].stop_loss_price.expect("open without stop");
    // 5% default below a 200 entry
    assert_eq!(stop, Decimal::from(190));
}

#[tokio::test]
async fn short_entries_stop_above_price() {
    let venue = Arc::new(MockVenue::filling(Decimal::from(200)));
    let exec = executor(Arc::clone(&venue), PortfolioState::new(10_000.0));

    exec.execute(&decision("XETHZUSD", Direction::Sell, 200.0), &approved(0.10))
        .await
        .unwrap();

    let stop = venue.recorded()[0].stop_loss_price.unwrap();
    assert_eq!(stop, Decimal::from(210));
}

#[tokio::test]
async fn missing_stop_config_never_sends_the_order() {
    let venue = Arc::new(MockVenue::filling(Decimal::from(100)));
    let mut config = ExecutorConfig::default();
    config.stop_loss_percent = 0.0;
    let exec = OrderExecutor::new(
        Arc::clone(&venue) as Arc<dyn VenueAdapter>,
        Arc::new(Mutex::new(PortfolioState::new(10_000.0))),
        Arc::new(NoopJournal),
        config,
    );

    let err = exec
        .execute(&decision("SOLUSD", Direction::Buy, 100.0), &approved(0.10))
        .await
        .unwrap_err();

    assert!(matches!(err, PipelineError::NoStopLossConfigurable(_)));
    assert_eq!(venue.attempts(), 0);
}

#[tokio::test]
async fn rejected_verdict_is_a_recorded_skip() {
    let venue = Arc::new(MockVenue::filling(Decimal::from(100)));
    let exec = executor(Arc::clone(&venue), PortfolioState::new(10_000.0));

    let verdict = RiskVerdict::reject(trading_core::VerdictReason::MaxOpenPositions);
    let result = exec
        .execute(&decision("SOLUSD", Direction::Buy, 100.0), &verdict)
        .await
        .unwrap();

    assert!(result.skipped);
    assert_eq!(venue.attempts(), 0);
}

#[tokio::test]
async fn hold_decisions_place_nothing() {
    let venue = Arc::new(MockVenue::filling(Decimal::from(100)));
    let exec = executor(Arc::clone(&venue), PortfolioState::new(10_000.0));

    let result = exec
        .execute(&decision("SOLUSD", Direction::Hold, 100.0), &approved(0.0))
        .await
        .unwrap();

    assert!(result.skipped);
    assert_eq!(venue.attempts(), 0);
}

#[tokio::test]
async fn dust_orders_are_skipped() {
    let venue = Arc::new(MockVenue::filling(Decimal::from(100)));
    // 0.1% of $100 equity is below the $0.50 minimum
    let exec = executor(Arc::clone(&venue), PortfolioState::new(100.0));

    let result = exec
        .execute(&decision("SOLUSD", Direction::Buy, 100.0), &approved(0.001))
        .await
        .unwrap();

    assert!(result.skipped);
    assert_eq!(venue.attempts(), 0);
}

#[tokio::test(start_paused = true)]
async fn exhausted_retries_leave_portfolio_untouched() {
    let venue = Arc::new(MockVenue::flaky(Decimal::from(100), 10));
    let exec = executor(Arc::clone(&venue), PortfolioState::new(10_000.0));

    let result = exec
        .execute(&decision("SOLUSD", Direction::Buy, 100.0), &approved(0.10))
        .await
        .unwrap();

    assert!(result.skipped);
    // initial attempt + one per configured delay
    assert_eq!(venue.attempts(), 4);

    let portfolio = exec.portfolio();
    let portfolio = portfolio.lock().await;
    assert_eq!(portfolio.open_position_count(), 0);
    assert_relative_eq!(portfolio.equity, 10_000.0);
}

#[tokio::test]
async fn permanent_errors_are_not_retried() {
    let venue = Arc::new(MockVenue::rejecting());
    let exec = executor(Arc::clone(&venue), PortfolioState::new(10_000.0));

    let result = exec
        .execute(&decision("SOLUSD", Direction::Buy, 100.0), &approved(0.10))
        .await
        .unwrap();

    assert!(result.skipped);
    assert_eq!(venue.attempts(), 1);
}

#[tokio::test]
async fn closing_fill_realizes_pnl() {
    let mut venue = MockVenue::filling(Decimal::from(110));
    venue.fees = Decimal::new(5, 1); // 0.50
    let venue = Arc::new(venue);

    let mut portfolio = PortfolioState::new(10_000.0);
    portfolio
        .open_positions
        .insert("SOLUSD".to_string(), open_long("SOLUSD", 100.0, 2.0));

    let exec = executor(Arc::clone(&venue), portfolio);

    let result = exec
        .execute(&decision("SOLUSD", Direction::Sell, 110.0), &approved(0.10))
        .await
        .unwrap();

    // (110 - 100) * 2 - 0.50 in fees
    assert_relative_eq!(result.realized_pnl.unwrap(), 19.5);

    let portfolio = exec.portfolio();
    let portfolio = portfolio.lock().await;
    assert_eq!(portfolio.open_position_count(), 0);
    assert_relative_eq!(portfolio.equity, 10_019.5);
    assert_relative_eq!(portfolio.daily_realized_pnl, 19.5);
    assert_eq!(portfolio.daily_trades, 1);
}

#[tokio::test]
async fn emergency_stop_blocks_opens_but_not_closes() {
    let venue = Arc::new(MockVenue::filling(Decimal::from(100)));

    let mut portfolio = PortfolioState::new(10_000.0);
    portfolio.emergency_stop_engaged = true;
    portfolio
        .open_positions
        .insert("SOLUSD".to_string(), open_long("SOLUSD", 100.0, 1.0));

    let exec = executor(Arc::clone(&venue), portfolio);

    let open = exec
        .execute(&decision("XETHZUSD", Direction::Buy, 100.0), &approved(0.10))
        .await
        .unwrap();
    assert!(open.skipped);
    assert_eq!(venue.attempts(), 0);

    let close = exec
        .execute(&decision("SOLUSD", Direction::Sell, 100.0), &approved(0.0))
        .await
        .unwrap();
    assert!(!close.skipped);
    assert_eq!(venue.attempts(), 1);
}

#[tokio::test]
async fn duplicate_entry_for_open_symbol_is_skipped() {
    let venue = Arc::new(MockVenue::filling(Decimal::from(100)));

    let mut portfolio = PortfolioState::new(10_000.0);
    portfolio
        .open_positions
        .insert("SOLUSD".to_string(), open_long("SOLUSD", 100.0, 1.0));

    let exec = executor(Arc::clone(&venue), portfolio);

    let result = exec
        .execute(&decision("SOLUSD", Direction::Buy, 100.0), &approved(0.10))
        .await
        .unwrap();

    assert!(result.skipped);
    assert_eq!(venue.attempts(), 0);
}

#[tokio::test]
async fn position_cap_holds_against_stale_verdicts() {
    // Both verdicts were approved against the same pre-trade snapshot; the
    // second must still be refused once the first has taken the last slot.
    let venue = Arc::new(MockVenue::filling(Decimal::from(100)));
    let mut config = ExecutorConfig::default();
    config.max_open_positions = 1;
    let exec = OrderExecutor::new(
        Arc::clone(&venue) as Arc<dyn VenueAdapter>,
        Arc::new(Mutex::new(PortfolioState::new(10_000.0))),
        Arc::new(NoopJournal),
        config,
    );

    let first = exec
        .execute(&decision("SOLUSD", Direction::Buy, 100.0), &approved(0.05))
        .await
        .unwrap();
    let second = exec
        .execute(&decision("XETHZUSD", Direction::Buy, 100.0), &approved(0.05))
        .await
        .unwrap();

    assert!(!first.skipped);
    assert!(second.skipped);
    assert_eq!(venue.attempts(), 1);

    let portfolio = exec.portfolio();
    let portfolio = portfolio.lock().await;
    assert_eq!(portfolio.open_position_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn in_flight_opens_count_against_the_cap() {
    // The first open is stuck in a retry at the venue when the second is
    // planned; the reserved slot must block it.
    let venue = Arc::new(MockVenue::flaky(Decimal::from(100), 1));
    let mut config = ExecutorConfig::default();
    config.max_open_positions = 1;
    let exec = OrderExecutor::new(
        Arc::clone(&venue) as Arc<dyn VenueAdapter>,
        Arc::new(Mutex::new(PortfolioState::new(10_000.0))),
        Arc::new(NoopJournal),
        config,
    );

    let first_decision = decision("SOLUSD", Direction::Buy, 100.0);
    let first_verdict = approved(0.05);
    let second_decision = decision("XETHZUSD", Direction::Buy, 100.0);
    let second_verdict = approved(0.05);
    let (first, second) = tokio::join!(
        exec.execute(&first_decision, &first_verdict),
        exec.execute(&second_decision, &second_verdict),
    );

    assert!(!first.unwrap().skipped);
    assert!(second.unwrap().skipped);

    let portfolio = exec.portfolio();
    let portfolio = portfolio.lock().await;
    assert_eq!(portfolio.open_position_count(), 1);
    assert!(portfolio.has_open_position("SOLUSD"));
}

#[tokio::test]
async fn failed_open_releases_its_slot() {
    let venue = Arc::new(MockVenue::rejecting());
    let mut config = ExecutorConfig::default();
    config.max_open_positions = 1;
    let exec = OrderExecutor::new(
        Arc::clone(&venue) as Arc<dyn VenueAdapter>,
        Arc::new(Mutex::new(PortfolioState::new(10_000.0))),
        Arc::new(NoopJournal),
        config,
    );

    let rejected = exec
        .execute(&decision("SOLUSD", Direction::Buy, 100.0), &approved(0.05))
        .await
        .unwrap();
    assert!(rejected.skipped);

    // The slot reserved for the failed order is free again
    let open_count = {
        let portfolio = exec.portfolio();
        let portfolio = portfolio.lock().await;
        portfolio.open_position_count()
    };
    assert_eq!(open_count, 0);

    let retry = exec
        .execute(&decision("XETHZUSD", Direction::Buy, 100.0), &approved(0.05))
        .await
        .unwrap();
    // Still the rejecting venue, but it got as far as placing
    assert!(retry.skipped);
    assert_eq!(venue.attempts(), 2);
}

#[tokio::test]
async fn close_position_flattens_by_symbol() {
    let venue = Arc::new(MockVenue::filling(Decimal::from(95)));

    let mut portfolio = PortfolioState::new(10_000.0);
    portfolio
        .open_positions
        .insert("SOLUSD".to_string(), open_long("SOLUSD", 100.0, 2.0));

    let exec = executor(Arc::clone(&venue), portfolio);

    let result = exec
        .close_position("SOLUSD", 95.0, "stop crossed")
        .await
        .unwrap();

    assert!(!result.skipped);
    assert_relative_eq!(result.realized_pnl.unwrap(), -10.0);

    let none = exec
        .close_position("SOLUSD", 95.0, "stop crossed")
        .await
        .unwrap();
    assert!(none.skipped);
}
