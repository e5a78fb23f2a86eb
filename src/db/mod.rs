//! Trade history persistence.
//!
//! One row per executed open or close, kept so the bot's record survives
//! restarts and can be summarized from the CLI.

use anyhow::{Context, Result};
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};

use crate::models::{TradeAction, TradeRecord};

/// Database connection pool for the trade history.
pub struct Database {
    pool: SqlitePool,
}

/// Stored history row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StoredTrade {
    pub id: i64,
    pub timestamp: String,
    pub symbol: String,
    pub action: String,
    pub entry_price: Option<f64>,
    pub exit_price: Option<f64>,
    pub reason: Option<String>,
    pub pnl_percent: Option<f64>,
    pub pnl_usdt: Option<f64>,
}

impl StoredTrade {
    pub fn action(&self) -> Option<TradeAction> {
        TradeAction::from_str(&self.action)
    }

    /// Price shown for the row: exit price for closes, entry price for opens.
    pub fn price(&self) -> Option<f64> {
        self.exit_price.or(self.entry_price)
    }
}

impl Database {
    /// Create a new database connection.
    pub async fn new(database_url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .context("Failed to connect to database")?;

        let db = Self { pool };
        db.run_migrations().await?;

        Ok(db)
    }

    /// Private in-memory database. A single connection that never expires,
    /// since every SQLite memory connection is its own database.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .context("Failed to open in-memory database")?;

        let db = Self { pool };
        db.run_migrations().await?;

        Ok(db)
    }

    /// Run all database migrations.
    async fn run_migrations(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                symbol TEXT NOT NULL,
                action TEXT NOT NULL,
                entry_price REAL,
                exit_price REAL,
                reason TEXT,
                pnl_percent REAL,
                pnl_usdt REAL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_history_symbol ON history(symbol, id)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    // ==================== History ====================

    /// Append an executed trade. Entries fill `entry_price`; exits fill
    /// `exit_price` and the PNL columns.
    pub async fn record_trade(&self, trade: &TradeRecord) -> Result<i64> {
        let exit = trade.action.is_exit();
        let (entry_price, exit_price) = if exit {
            (None, Some(trade.price))
        } else {
            (Some(trade.price), None)
        };
        let (pnl_percent, pnl_usdt) = if exit {
            (trade.pnl_percent, trade.pnl_quote)
        } else {
            (None, None)
        };

        let result = sqlx::query(
            r#"
            INSERT INTO history (timestamp, symbol, action, entry_price, exit_price, reason, pnl_percent, pnl_usdt)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(trade.timestamp.to_rfc3339())
        .bind(&trade.symbol)
        .bind(trade.action.as_str())
        .bind(entry_price)
        .bind(exit_price)
        .bind(&trade.reason)
        .bind(pnl_percent)
        .bind(pnl_usdt)
        .execute(&self.pool)
        .await
        .context("Failed to record trade")?;

        Ok(result.last_insert_rowid())
    }

    /// Most recent trades first, optionally for one symbol.
    pub async fn recent_trades(&self, symbol: Option<&str>, limit: i64) -> Result<Vec<StoredTrade>> {
        let trades = match symbol {
            Some(symbol) => {
                sqlx::query_as::<_, StoredTrade>(
                    "SELECT * FROM history WHERE symbol = ? ORDER BY id DESC LIMIT ?",
                )
                .bind(symbol)
                .bind(limit)
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query_as::<_, StoredTrade>("SELECT * FROM history ORDER BY id DESC LIMIT ?")
                    .bind(limit)
                    .fetch_all(&self.pool)
                    .await
            }
        };

        trades.context("Failed to fetch trade history")
    }

    /// Closed trades in execution order, optionally for one symbol.
    pub async fn closed_trades(&self, symbol: Option<&str>) -> Result<Vec<StoredTrade>> {
        let trades = match symbol {
            Some(symbol) => {
                sqlx::query_as::<_, StoredTrade>(
                    "SELECT * FROM history WHERE exit_price IS NOT NULL AND symbol = ? ORDER BY id ASC",
                )
                .bind(symbol)
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query_as::<_, StoredTrade>("SELECT * FROM history WHERE exit_price IS NOT NULL ORDER BY id ASC")
                    .fetch_all(&self.pool)
                    .await
            }
        };

        trades.context("Failed to fetch closed trades")
    }

    /// Delete every history row. Returns the number removed.
    pub async fn clear_history(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM history")
            .execute(&self.pool)
            .await
            .context("Failed to clear history")?;
        Ok(result.rows_affected())
    }
}
