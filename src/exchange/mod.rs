//! Exchange port: everything the orchestrator needs from a derivatives venue.

mod paper;

pub use paper::{PaperConfig, PaperExchange, PaperStats};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ExchangeResult;
use crate::models::{Candle, Position, Series};
use crate::trading::MarketInfo;

/// Confirmation of a placed market order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderResult {
    /// Exchange order id
    pub id: String,

    /// Average fill price, when the venue reports one
    pub average_price: Option<f64>,

    /// Order price as submitted or last traded
    pub price: Option<f64>,

    /// Filled quantity in contracts
    pub filled: Option<f64>,
}

impl OrderResult {
    /// Best known execution price.
    pub fn fill_price(&self) -> Option<f64> {
        self.average_price
            .or(self.price)
            .filter(|p| p.is_finite() && *p > 0.0)
    }
}

/// Trading venue used by the orchestrator. Calls are made one at a time.
#[async_trait]
pub trait Exchange: Send + Sync {
    /// Last traded price, `None` when the venue has nothing usable.
    async fn get_price(&self, symbol: &str) -> ExchangeResult<Option<f64>>;

    /// Most recent `limit` candles for `timeframe`, oldest first.
    async fn get_ohlcv(&self, symbol: &str, timeframe: &str, limit: usize) -> ExchangeResult<Option<Series>>;

    /// Free balance of `asset`. Transient failures read as 0.0.
    async fn get_balance(&self, asset: &str) -> ExchangeResult<f64>;

    /// Open position for `symbol`, normalized; `None` when flat.
    async fn get_position(&self, symbol: &str) -> ExchangeResult<Option<Position>>;

    /// Contract size and minimum order quantity.
    async fn market_info(&self, symbol: &str) -> ExchangeResult<MarketInfo>;

    async fn open_long(&self, symbol: &str, qty: f64) -> ExchangeResult<Option<OrderResult>>;

    async fn open_short(&self, symbol: &str, qty: f64) -> ExchangeResult<Option<OrderResult>>;

    /// Reduce-only market close of `position`. Never opens or flips exposure.
    /// `None` when there was nothing left to close.
    async fn close(&self, symbol: &str, position: &Position) -> ExchangeResult<Option<OrderResult>>;
}

/// Source of public market data for simulated venues.
#[async_trait]
pub trait MarketFeed: Send + Sync {
    async fn last_price(&self, symbol: &str) -> ExchangeResult<Option<f64>>;

    async fn candles(&self, symbol: &str, timeframe: &str, limit: usize) -> ExchangeResult<Vec<Candle>>;

    async fn market_info(&self, symbol: &str) -> ExchangeResult<MarketInfo> {
        let _ = symbol;
        Ok(MarketInfo::default())
    }
}
