use std::collections::HashMap;
use std::env;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VenueMode {
    Paper,
    Live,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    // Universe
    pub symbols: Vec<String>,
    /// Strategy signal sources, `id=url` pairs.
    pub strategy_endpoints: Vec<(String, String)>,
    /// Ensemble weights per strategy id; unlisted ids weigh 1.0.
    pub strategy_weights: HashMap<String, f64>,

    // Risk limits
    pub max_open_positions: usize,
    pub max_position_fraction: f64,
    pub daily_loss_limit_fraction: f64,
    pub stop_loss_percent: f64,
    pub min_order_notional: f64,

    // Aggregation
    pub dead_zone_threshold: f64,
    pub per_source_timeout: Duration,
    pub cycle_deadline: Duration,

    // Kelly sizing
    pub kelly_edge_scale: f64,
    pub kelly_win_loss_ratio: f64,
    pub kelly_multiplier: f64,

    // Loop
    pub tick_interval: Duration,
    pub max_concurrent_symbols: usize,

    // Venue
    pub venue_mode: VenueMode,
    pub venue_gateway_url: Option<String>,
    pub live_trading_approved: bool,

    // Infrastructure
    pub market_data_url: String,
    pub database_url: String,
    pub starting_equity: f64,
}

impl EngineConfig {
    pub fn from_env() -> Result<Self> {
        let venue_mode = match env::var("VENUE_MODE")
            .unwrap_or_else(|_| "paper".to_string())
            .to_lowercase()
            .as_str()
        {
            "paper" => VenueMode::Paper,
            "live" => VenueMode::Live,
            other => bail!("VENUE_MODE must be 'paper' or 'live', got '{}'", other),
        };

        let config = Self {
            symbols: env::var("SYMBOLS")
                .unwrap_or_else(|_| "XXBTZUSD,XETHZUSD,SOLUSD".to_string())
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            strategy_endpoints: parse_pairs(
                &env::var("STRATEGY_ENDPOINTS").context("STRATEGY_ENDPOINTS not set")?,
            )?,
            strategy_weights: parse_weights(
                &env::var("STRATEGY_WEIGHTS").unwrap_or_default(),
            )?,

            max_open_positions: env::var("MAX_OPEN_POSITIONS")
                .unwrap_or_else(|_| "3".to_string())
                .parse()?,
            max_position_fraction: env::var("MAX_POSITION_FRACTION")
                .unwrap_or_else(|_| "0.10".to_string())
                .parse()?,
            daily_loss_limit_fraction: env::var("DAILY_LOSS_LIMIT_FRACTION")
                .unwrap_or_else(|_| "0.05".to_string())
                .parse()?,
            stop_loss_percent: env::var("STOP_LOSS_PERCENT")
                .unwrap_or_else(|_| "5.0".to_string())
                .parse()?,
            min_order_notional: env::var("MIN_ORDER_NOTIONAL_USD")
                .unwrap_or_else(|_| "0.50".to_string())
                .parse()?,

            dead_zone_threshold: env::var("DEAD_ZONE_THRESHOLD")
                .unwrap_or_else(|_| "0.15".to_string())
                .parse()?,
            per_source_timeout: Duration::from_secs(
                env::var("PER_SOURCE_TIMEOUT_SECS")
                    .unwrap_or_else(|_| "2".to_string())
                    .parse()?,
            ),
            cycle_deadline: Duration::from_secs(
                env::var("CYCLE_DEADLINE_SECS")
                    .unwrap_or_else(|_| "5".to_string())
                    .parse()?,
            ),

            kelly_edge_scale: env::var("KELLY_EDGE_SCALE")
                .unwrap_or_else(|_| "0.25".to_string())
                .parse()?,
            kelly_win_loss_ratio: env::var("KELLY_WIN_LOSS_RATIO")
                .unwrap_or_else(|_| "1.5".to_string())
                .parse()?,
            kelly_multiplier: env::var("KELLY_MULTIPLIER")
                .unwrap_or_else(|_| "0.5".to_string())
                .parse()?,

            tick_interval: Duration::from_secs(
                env::var("TICK_INTERVAL_SECS")
                    .unwrap_or_else(|_| "60".to_string())
                    .parse()?,
            ),
            max_concurrent_symbols: env::var("MAX_CONCURRENT_SYMBOLS")
                .unwrap_or_else(|_| "4".to_string())
                .parse()?,

            venue_mode,
            venue_gateway_url: env::var("VENUE_GATEWAY_URL").ok(),
            live_trading_approved: env::var("LIVE_TRADING_APPROVED")
                .map(|v| v.eq_ignore_ascii_case("yes"))
                .unwrap_or(false),

            market_data_url: env::var("MARKET_DATA_URL")
                .unwrap_or_else(|_| "http://localhost:8000".to_string()),
            database_url: env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite:pipeline.db".to_string()),
            starting_equity: env::var("STARTING_EQUITY")
                .unwrap_or_else(|_| "10000.0".to_string())
                .parse()?,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.symbols.is_empty() {
            bail!("SYMBOLS must name at least one symbol");
        }
        if self.strategy_endpoints.is_empty() {
            bail!("STRATEGY_ENDPOINTS must name at least one source");
        }
        if self.max_open_positions == 0 {
            bail!("MAX_OPEN_POSITIONS must be at least 1");
        }
        if !(self.max_position_fraction > 0.0 && self.max_position_fraction <= 1.0) {
            bail!(
                "MAX_POSITION_FRACTION must be in (0, 1], got {}",
                self.max_position_fraction
            );
        }
        if !(self.daily_loss_limit_fraction > 0.0 && self.daily_loss_limit_fraction <= 1.0) {
            bail!(
                "DAILY_LOSS_LIMIT_FRACTION must be in (0, 1], got {}",
                self.daily_loss_limit_fraction
            );
        }
        if !(0.0..1.0).contains(&self.dead_zone_threshold) {
            bail!(
                "DEAD_ZONE_THRESHOLD must be in [0, 1), got {}",
                self.dead_zone_threshold
            );
        }
        if self.stop_loss_percent <= 0.0 {
            bail!(
                "STOP_LOSS_PERCENT must be positive, got {}",
                self.stop_loss_percent
            );
        }
        if self.per_source_timeout.is_zero() || self.cycle_deadline.is_zero() {
            bail!("PER_SOURCE_TIMEOUT_SECS and CYCLE_DEADLINE_SECS must be positive");
        }
        if self.tick_interval.is_zero() {
            bail!("TICK_INTERVAL_SECS must be positive");
        }
        if self.max_concurrent_symbols == 0 {
            bail!("MAX_CONCURRENT_SYMBOLS must be at least 1");
        }
        if self.starting_equity <= 0.0 {
            bail!("STARTING_EQUITY must be positive, got {}", self.starting_equity);
        }
        for (id, weight) in &self.strategy_weights {
            if !(0.0..=1.0).contains(weight) {
                bail!("weight for strategy '{}' must be in [0, 1], got {}", id, weight);
            }
        }
        if self.venue_mode == VenueMode::Live {
            if self.venue_gateway_url.is_none() {
                bail!("VENUE_MODE=live requires VENUE_GATEWAY_URL");
            }
            if !self.live_trading_approved {
                bail!(
                    "VENUE_MODE=live requires LIVE_TRADING_APPROVED=yes. \
                     Real money at risk; paper is the default."
                );
            }
        }
        Ok(())
    }
}

/// Parse a comma list of `key=value` pairs, e.g. `momentum=http://host:8101`.
fn parse_pairs(raw: &str) -> Result<Vec<(String, String)>> {
    let mut pairs = Vec::new();
    for item in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let (key, value) = item
            .split_once('=')
            .with_context(|| format!("expected key=value, got '{}'", item))?;
        if key.trim().is_empty() || value.trim().is_empty() {
            bail!("expected key=value, got '{}'", item);
        }
        pairs.push((key.trim().to_string(), value.trim().to_string()));
    }
    Ok(pairs)
}

fn parse_weights(raw: &str) -> Result<HashMap<String, f64>> {
    let mut weights = HashMap::new();
    for (id, value) in parse_pairs(raw)? {
        let weight: f64 = value
            .parse()
            .with_context(|| format!("weight for '{}' is not a number: '{}'", id, value))?;
        weights.insert(id, weight);
    }
    Ok(weights)
}
