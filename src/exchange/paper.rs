//! Simulated one-way USDT-margined account driven by live public prices.
//!
//! Fills happen at the feed's last price with slippage against the taker,
//! margin is notional / leverage, and a position whose mark crosses its
//! liquidation price is wiped out with its margin.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{Exchange, MarketFeed, OrderResult};
use crate::error::{ExchangeError, ExchangeResult};
use crate::models::{MarginMode, Position, PositionSide, Series};
use crate::trading::MarketInfo;

/// Maintenance margin rate used for the liquidation estimate.
const MAINTENANCE_MARGIN_RATE: Decimal = dec!(0.005);

/// Paper account settings.
#[derive(Debug, Clone)]
pub struct PaperConfig {
    /// Starting free balance in the quote asset
    pub initial_balance: Decimal,

    /// Leverage applied to every position
    pub leverage: Decimal,

    /// Taker fee rate (0.0005 = 0.05%)
    pub fee_rate: Decimal,

    /// Simulated slippage against the taker (0.0005 = 0.05%)
    pub slippage: Decimal,

    /// Asset the balance is held in
    pub quote_asset: String,
}

impl Default for PaperConfig {
    fn default() -> Self {
        Self {
            initial_balance: dec!(1000),
            leverage: dec!(10),
            fee_rate: dec!(0.0005),
            slippage: dec!(0.0005),
            quote_asset: "USDT".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
struct PaperPosition {
    side: PositionSide,
    contracts: Decimal,
    contract_size: Decimal,
    entry_price: Decimal,
    margin: Decimal,
    opened_at: DateTime<Utc>,
}

impl PaperPosition {
    fn base_qty(&self) -> Decimal {
        self.contracts * self.contract_size
    }

    fn pnl_at(&self, price: Decimal) -> Decimal {
        let diff = match self.side {
            PositionSide::Long => price - self.entry_price,
            PositionSide::Short => self.entry_price - price,
        };
        diff * self.base_qty()
    }

    fn liquidation_price(&self) -> Decimal {
        if self.base_qty().is_zero() {
            return Decimal::ZERO;
        }
        let buffer = (self.margin / self.base_qty()) * (Decimal::ONE - MAINTENANCE_MARGIN_RATE);
        match self.side {
            PositionSide::Long => (self.entry_price - buffer).max(Decimal::ZERO),
            PositionSide::Short => self.entry_price + buffer,
        }
    }

    fn is_liquidated_at(&self, price: Decimal) -> bool {
        match self.side {
            PositionSide::Long => price <= self.liquidation_price(),
            PositionSide::Short => price >= self.liquidation_price(),
        }
    }
}

#[derive(Debug)]
struct Account {
    balance: Decimal,
    positions: HashMap<String, PaperPosition>,
    realized_pnl: Decimal,
    total_fees: Decimal,
    orders: usize,
    liquidations: usize,
}

/// Paper trading venue.
pub struct PaperExchange<F> {
    feed: F,
    config: PaperConfig,
    account: Mutex<Account>,
    started_at: DateTime<Utc>,
}

fn to_decimal(value: f64, what: &str) -> ExchangeResult<Decimal> {
    Decimal::from_f64(value)
        .filter(|_| value.is_finite())
        .ok_or_else(|| ExchangeError::InvalidOrder(format!("{what} {value} is not a usable number")))
}

fn to_f64(value: Decimal) -> f64 {
    value.to_f64().unwrap_or(0.0)
}

impl<F: MarketFeed> PaperExchange<F> {
    pub fn new(feed: F, config: PaperConfig) -> Self {
        let account = Account {
            balance: config.initial_balance,
            positions: HashMap::new(),
            realized_pnl: Decimal::ZERO,
            total_fees: Decimal::ZERO,
            orders: 0,
            liquidations: 0,
        };
        Self {
            feed,
            config,
            account: Mutex::new(account),
            started_at: Utc::now(),
        }
    }

    async fn mark_price(&self, symbol: &str) -> ExchangeResult<Decimal> {
        let price = self
            .feed
            .last_price(symbol)
            .await?
            .ok_or_else(|| ExchangeError::Unavailable(format!("no price for {symbol}")))?;
        to_decimal(price, "price")
    }

    fn order(&self, account: &mut Account, fill: Decimal, qty: Decimal) -> OrderResult {
        account.orders += 1;
        OrderResult {
            id: uuid::Uuid::new_v4().to_string(),
            average_price: Some(to_f64(fill)),
            price: Some(to_f64(fill)),
            filled: Some(to_f64(qty)),
        }
    }

    async fn open(&self, symbol: &str, side: PositionSide, qty: f64) -> ExchangeResult<Option<OrderResult>> {
        if !(qty.is_finite() && qty > 0.0) {
            return Err(ExchangeError::InvalidOrder(format!("quantity {qty} must be positive")));
        }
        let qty = to_decimal(qty, "quantity")?;
        let info = self.feed.market_info(symbol).await?;
        let contract_size = to_decimal(info.contract_size, "contract size")?;
        let mark = self.mark_price(symbol).await?;

        let fill = match side {
            PositionSide::Long => mark * (Decimal::ONE + self.config.slippage),
            PositionSide::Short => mark * (Decimal::ONE - self.config.slippage),
        };
        let notional = fill * qty * contract_size;
        let margin = notional / self.config.leverage.max(Decimal::ONE);
        let fee = notional * self.config.fee_rate;

        let mut account = self.account.lock().await;

        if let Some(existing) = account.positions.get(symbol) {
            if existing.side != side {
                return Err(ExchangeError::InvalidOrder(format!(
                    "{symbol} has an open {} position; close it before opening {side}",
                    existing.side
                )));
            }
        }
        if account.balance < margin + fee {
            return Err(ExchangeError::InsufficientFunds(format!(
                "need {:.2} {} (margin + fee), have {:.2}",
                margin + fee,
                self.config.quote_asset,
                account.balance
            )));
        }

        account.balance -= margin + fee;
        account.total_fees += fee;

        let merged = match account.positions.remove(symbol) {
            Some(existing) => {
                let contracts = existing.contracts + qty;
                PaperPosition {
                    entry_price: (existing.entry_price * existing.contracts + fill * qty) / contracts,
                    contracts,
                    margin: existing.margin + margin,
                    ..existing
                }
            }
            None => PaperPosition {
                side,
                contracts: qty,
                contract_size,
                entry_price: fill,
                margin,
                opened_at: Utc::now(),
            },
        };
        info!(
            symbol = %symbol,
            side = %side,
            qty = %qty,
            fill = %fill.round_dp(6),
            margin = %margin.round_dp(2),
            "Paper order filled"
        );
        account.positions.insert(symbol.to_string(), merged);

        Ok(Some(self.order(&mut account, fill, qty)))
    }

    /// Snapshot of the simulated account.
    pub async fn stats(&self) -> PaperStats {
        let account = self.account.lock().await;
        let locked_margin = account.positions.values().map(|p| p.margin).sum();
        PaperStats {
            initial_balance: self.config.initial_balance,
            free_balance: account.balance,
            locked_margin,
            realized_pnl: account.realized_pnl,
            total_fees: account.total_fees,
            orders: account.orders,
            open_positions: account.positions.len(),
            liquidations: account.liquidations,
            running_since: self.started_at,
        }
    }
}

#[async_trait]
impl<F: MarketFeed> Exchange for PaperExchange<F> {
    async fn get_price(&self, symbol: &str) -> ExchangeResult<Option<f64>> {
        self.feed.last_price(symbol).await
    }

    async fn get_ohlcv(&self, symbol: &str, timeframe: &str, limit: usize) -> ExchangeResult<Option<Series>> {
        let candles = self.feed.candles(symbol, timeframe, limit).await?;
        if candles.is_empty() {
            return Ok(None);
        }
        Ok(Some(Series::new(candles)))
    }

    async fn get_balance(&self, asset: &str) -> ExchangeResult<f64> {
        if !asset.eq_ignore_ascii_case(&self.config.quote_asset) {
            debug!(asset = %asset, "Paper account holds no such asset");
            return Ok(0.0);
        }
        Ok(to_f64(self.account.lock().await.balance))
    }

    async fn get_position(&self, symbol: &str) -> ExchangeResult<Option<Position>> {
        let mark = self.mark_price(symbol).await.ok();
        let mut account = self.account.lock().await;

        let Some(held) = account.positions.get(symbol).cloned() else {
            return Ok(None);
        };
        let mark = mark.unwrap_or(held.entry_price);

        if held.is_liquidated_at(mark) {
            warn!(
                symbol = %symbol,
                side = %held.side,
                mark = %mark,
                liquidation = %held.liquidation_price().round_dp(6),
                "Paper position liquidated"
            );
            account.positions.remove(symbol);
            account.realized_pnl -= held.margin;
            account.liquidations += 1;
            return Ok(None);
        }

        let unrealized = held.pnl_at(mark);
        let pnl_ratio = if held.margin > Decimal::ZERO {
            Some(to_f64(unrealized / held.margin))
        } else {
            None
        };

        Ok(Some(Position {
            symbol: symbol.to_string(),
            side: held.side,
            contracts: to_f64(held.contracts),
            entry_price: to_f64(held.entry_price),
            mark_price: to_f64(mark),
            liquidation_price: Some(to_f64(held.liquidation_price())),
            pnl_pct: pnl_ratio,
            unrealized_pnl: Some(to_f64(unrealized)),
            leverage: Some(to_f64(self.config.leverage)),
            margin_mode: Some(MarginMode::Isolated),
            contract_size: to_f64(held.contract_size),
            initial_margin: Some(to_f64(held.margin)),
            opened_at: Some(held.opened_at),
        }))
    }

    async fn market_info(&self, symbol: &str) -> ExchangeResult<MarketInfo> {
        self.feed.market_info(symbol).await
    }

    async fn open_long(&self, symbol: &str, qty: f64) -> ExchangeResult<Option<OrderResult>> {
        self.open(symbol, PositionSide::Long, qty).await
    }

    async fn open_short(&self, symbol: &str, qty: f64) -> ExchangeResult<Option<OrderResult>> {
        self.open(symbol, PositionSide::Short, qty).await
    }

    async fn close(&self, symbol: &str, position: &Position) -> ExchangeResult<Option<OrderResult>> {
        let mark = self.mark_price(symbol).await?;
        let mut account = self.account.lock().await;

        let Some(held) = account.positions.get(symbol).cloned() else {
            debug!(symbol = %symbol, "Nothing to close");
            return Ok(None);
        };
        if held.side != position.side {
            return Err(ExchangeError::InvalidOrder(format!(
                "reduce-only close of {} rejected, account holds {}",
                position.side, held.side
            )));
        }

        let requested = to_decimal(position.contracts, "quantity")?;
        let qty = requested.min(held.contracts);
        if qty <= Decimal::ZERO {
            return Err(ExchangeError::InvalidOrder("close quantity must be positive".to_string()));
        }

        let fill = match held.side {
            PositionSide::Long => mark * (Decimal::ONE - self.config.slippage),
            PositionSide::Short => mark * (Decimal::ONE + self.config.slippage),
        };
        let share = qty / held.contracts;
        let margin = held.margin * share;
        let pnl = held.pnl_at(fill) * share;
        let fee = fill * qty * held.contract_size * self.config.fee_rate;

        account.balance += (margin + pnl - fee).max(Decimal::ZERO);
        account.realized_pnl += pnl - fee;
        account.total_fees += fee;

        let net = (pnl - fee).round_dp(4);
        if qty == held.contracts {
            account.positions.remove(symbol);
        } else if let Some(rest) = account.positions.get_mut(symbol) {
            rest.contracts -= qty;
            rest.margin -= margin;
        }
        info!(
            symbol = %symbol,
            side = %held.side,
            qty = %qty,
            fill = %fill.round_dp(6),
            pnl = %net,
            "Paper position closed"
        );

        Ok(Some(self.order(&mut account, fill, qty)))
    }
}

/// Paper account summary.
#[derive(Debug, Clone)]
pub struct PaperStats {
    pub initial_balance: Decimal,
    pub free_balance: Decimal,
    pub locked_margin: Decimal,
    pub realized_pnl: Decimal,
    pub total_fees: Decimal,
    pub orders: usize,
    pub open_positions: usize,
    pub liquidations: usize,
    pub running_since: DateTime<Utc>,
}

impl std::fmt::Display for PaperStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let equity = self.free_balance + self.locked_margin;
        let return_pct = if self.initial_balance > Decimal::ZERO {
            (equity - self.initial_balance) / self.initial_balance * dec!(100)
        } else {
            Decimal::ZERO
        };

        writeln!(f, "\n{:=^50}", " PAPER ACCOUNT ")?;
        writeln!(f, "Running since: {}", self.running_since.format("%Y-%m-%d %H:%M"))?;
        writeln!(f)?;
        writeln!(f, "Initial Balance:  ${:.2}", self.initial_balance)?;
        writeln!(f, "Free Balance:     ${:.2}", self.free_balance)?;
        writeln!(f, "Locked Margin:    ${:.2}", self.locked_margin)?;
        writeln!(f, "Realized P&L:     ${:.2} ({:.2}%)", self.realized_pnl, return_pct)?;
        writeln!(f, "Total Fees:       ${:.2}", self.total_fees)?;
        writeln!(f)?;
        writeln!(f, "Orders:           {}", self.orders)?;
        writeln!(f, "Open Positions:   {}", self.open_positions)?;
        writeln!(f, "Liquidations:     {}", self.liquidations)?;
        writeln!(f, "{:=^50}", "")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Candle;

    struct FixedFeed {
        price: std::sync::Mutex<Option<f64>>,
    }

    impl FixedFeed {
        fn at(price: f64) -> Self {
            Self {
                price: std::sync::Mutex::new(Some(price)),
            }
        }

        fn set(&self, price: f64) {
            *self.price.lock().unwrap() = Some(price);
        }
    }

    #[async_trait]
    impl MarketFeed for FixedFeed {
        async fn last_price(&self, _symbol: &str) -> ExchangeResult<Option<f64>> {
            Ok(*self.price.lock().unwrap())
        }

        async fn candles(&self, _symbol: &str, _timeframe: &str, _limit: usize) -> ExchangeResult<Vec<Candle>> {
            Ok(Vec::new())
        }
    }

    fn frictionless() -> PaperConfig {
        PaperConfig {
            fee_rate: Decimal::ZERO,
            slippage: Decimal::ZERO,
            ..Default::default()
        }
    }

    const SYMBOL: &str = "BTC/USDT:USDT";

    #[tokio::test]
    async fn test_open_mark_and_close_long() {
        let exchange = PaperExchange::new(FixedFeed::at(100.0), frictionless());

        // 10 contracts at 100 = 1000 notional, 100 margin at 10x
        exchange.open_long(SYMBOL, 10.0).await.unwrap().unwrap();
        assert_eq!(exchange.get_balance("USDT").await.unwrap(), 900.0);

        exchange.feed.set(105.0);
        let position = exchange.get_position(SYMBOL).await.unwrap().unwrap();
        assert_eq!(position.side, PositionSide::Long);
        assert_eq!(position.unrealized_pnl, Some(50.0));
        assert_eq!(position.pnl_pct, Some(0.5));

        let order = exchange.close(SYMBOL, &position).await.unwrap().unwrap();
        assert_eq!(order.fill_price(), Some(105.0));
        assert_eq!(exchange.get_balance("USDT").await.unwrap(), 1050.0);
        assert!(exchange.get_position(SYMBOL).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_close_is_reduce_only() {
        let exchange = PaperExchange::new(FixedFeed::at(100.0), frictionless());
        let phantom = Position::new(SYMBOL, PositionSide::Long, 1.0, 100.0);

        assert!(exchange.close(SYMBOL, &phantom).await.unwrap().is_none());

        exchange.open_short(SYMBOL, 1.0).await.unwrap();
        let err = exchange.close(SYMBOL, &phantom).await.unwrap_err();
        assert!(matches!(err, ExchangeError::InvalidOrder(_)));
    }

    #[tokio::test]
    async fn test_rejects_opposite_open_and_oversized_orders() {
        let exchange = PaperExchange::new(FixedFeed::at(100.0), frictionless());
        exchange.open_long(SYMBOL, 1.0).await.unwrap();

        let err = exchange.open_short(SYMBOL, 1.0).await.unwrap_err();
        assert!(matches!(err, ExchangeError::InvalidOrder(_)));

        let err = exchange.open_long(SYMBOL, 1_000.0).await.unwrap_err();
        assert!(matches!(err, ExchangeError::InsufficientFunds(_)));
        assert!(err.is_critical());
    }

    #[tokio::test]
    async fn test_adding_to_position_averages_entry() {
        let exchange = PaperExchange::new(FixedFeed::at(100.0), frictionless());
        exchange.open_long(SYMBOL, 1.0).await.unwrap();
        exchange.feed.set(110.0);
        exchange.open_long(SYMBOL, 1.0).await.unwrap();

        let position = exchange.get_position(SYMBOL).await.unwrap().unwrap();
        assert_eq!(position.contracts, 2.0);
        assert_eq!(position.entry_price, 105.0);
    }

    #[tokio::test]
    async fn test_liquidation_wipes_position() {
        let exchange = PaperExchange::new(FixedFeed::at(100.0), frictionless());
        exchange.open_short(SYMBOL, 10.0).await.unwrap();

        exchange.feed.set(115.0);
        assert!(exchange.get_position(SYMBOL).await.unwrap().is_none());

        let stats = exchange.stats().await;
        assert_eq!(stats.liquidations, 1);
        assert_eq!(stats.free_balance, dec!(900));
    }

    #[tokio::test]
    async fn test_fees_and_slippage_cost_money() {
        let exchange = PaperExchange::new(FixedFeed::at(100.0), PaperConfig::default());
        exchange.open_long(SYMBOL, 1.0).await.unwrap();
        let position = exchange.get_position(SYMBOL).await.unwrap().unwrap();
        exchange.close(SYMBOL, &position).await.unwrap();

        assert!(exchange.get_balance("USDT").await.unwrap() < 1000.0);
        assert_eq!(exchange.get_balance("BTC").await.unwrap(), 0.0);
    }
}
