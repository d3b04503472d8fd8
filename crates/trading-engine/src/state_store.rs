use std::str::FromStr;

use anyhow::{Context, Result};
use async_trait::async_trait;
use order_executor::ExecutionJournal;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use trading_core::{ExecutionResult, PipelineError, PortfolioState};

/// Sqlite persistence for everything that must survive a restart: the
/// portfolio aggregate, open positions, the sticky emergency stop, and the
/// order audit ledger.
pub struct StateStore {
    pool: SqlitePool,
}

impl StateStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .with_context(|| format!("invalid DATABASE_URL '{}'", database_url))?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .context("failed to open state database")?;
        Ok(Self::new(pool))
    }

    pub async fn init_tables(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS engine_state (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS positions (
                symbol TEXT PRIMARY KEY,
                side TEXT NOT NULL,
                entry_price REAL NOT NULL,
                quantity REAL NOT NULL,
                stop_loss_price REAL NOT NULL,
                opened_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS order_ledger (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                order_id TEXT,
                symbol TEXT NOT NULL,
                direction TEXT NOT NULL,
                quantity REAL NOT NULL,
                fill_price REAL NOT NULL,
                fees REAL NOT NULL,
                realized_pnl REAL,
                skipped INTEGER NOT NULL,
                skip_reason TEXT,
                paper INTEGER NOT NULL,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_ledger_symbol ON order_ledger(symbol)")
            .execute(&self.pool)
            .await
            .ok();
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_ledger_created ON order_ledger(created_at)")
            .execute(&self.pool)
            .await
            .ok();

        Ok(())
    }

    pub async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn save_state(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO engine_state (key, value, updated_at) VALUES (?, ?, ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        )
        .bind(key)
        .bind(value)
        .bind(chrono::Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_state(&self, key: &str) -> Result<Option<String>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT value FROM engine_state WHERE key = ?")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(v,)| v))
    }

    pub async fn save_portfolio(&self, portfolio: &PortfolioState) -> Result<()> {
        let json = serde_json::to_string(portfolio)?;
        self.save_state("portfolio", &json).await?;

        // Mirror open positions into their own table for operator queries
        sqlx::query("DELETE FROM positions").execute(&self.pool).await?;
        for position in portfolio.open_positions.values() {
            let side = match position.side {
                trading_core::PositionSide::Long => "long",
                trading_core::PositionSide::Short => "short",
            };
            sqlx::query(
                "INSERT INTO positions (symbol, side, entry_price, quantity, stop_loss_price, opened_at)
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(&position.symbol)
            .bind(side)
            .bind(position.entry_price)
            .bind(position.quantity)
            .bind(position.stop_loss_price)
            .bind(position.opened_at.to_rfc3339())
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    /// Restore the persisted portfolio. A present-but-unreadable row is a
    /// hard error; the engine must refuse to trade on state it cannot trust.
    pub async fn load_portfolio(&self) -> Result<Option<PortfolioState>> {
        match self.load_state("portfolio").await? {
            Some(json) => {
                let portfolio = serde_json::from_str(&json).map_err(|e| {
                    anyhow::Error::new(PipelineError::CorruptState(format!(
                        "portfolio row unreadable: {}",
                        e
                    )))
                })?;
                Ok(Some(portfolio))
            }
            None => Ok(None),
        }
    }

    pub async fn set_emergency_stop(&self, engaged: bool) -> Result<()> {
        self.save_state("emergency_stop", if engaged { "1" } else { "0" })
            .await
    }

    /// A present-but-unparsable flag fails closed, same as the portfolio.
    pub async fn emergency_stop(&self) -> Result<bool> {
        match self.load_state("emergency_stop").await?.as_deref() {
            None | Some("0") => Ok(false),
            Some("1") => Ok(true),
            Some(other) => Err(anyhow::Error::new(PipelineError::CorruptState(format!(
                "emergency_stop flag unreadable: '{}'",
                other
            )))),
        }
    }

    pub async fn record_order_row(&self, result: &ExecutionResult, paper: bool) -> Result<()> {
        sqlx::query(
            "INSERT INTO order_ledger
             (order_id, symbol, direction, quantity, fill_price, fees, realized_pnl,
              skipped, skip_reason, paper, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(result.order_id.as_deref())
        .bind(&result.symbol)
        .bind(result.direction.to_string())
        .bind(result.quantity)
        .bind(result.fill_price)
        .bind(result.fees)
        .bind(result.realized_pnl)
        .bind(result.skipped as i64)
        .bind(result.skip_reason.as_deref())
        .bind(paper as i64)
        .bind(chrono::Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn ledger_count(&self) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM order_ledger")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

#[async_trait]
impl ExecutionJournal for StateStore {
    async fn record_order(&self, result: &ExecutionResult, paper: bool) -> Result<()> {
        self.record_order_row(result, paper).await
    }

    async fn persist_portfolio(&self, portfolio: &PortfolioState) -> Result<()> {
        self.save_portfolio(portfolio).await
    }
}
