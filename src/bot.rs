//! Bot runner: the position-management loop.
//!
//! Each iteration:
//! - Fetches price, candles, balance and the open position
//! - Runs the exit filters in precedence order (stop-loss, auto-profit, trailing stop)
//! - Asks strategies for an inversion while a position is open
//! - Asks strategies for an entry while flat
//!
//! The loop only stops on an explicit shutdown request.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use tracing::{debug, error, info, warn};

use crate::error::ExchangeError;
use crate::events::{AccountSnapshot, BotEvent, EventSink, LogLevel};
use crate::exchange::Exchange;
use crate::filters::{auto_profit, stop_loss, trailing_stop, ExitKind, TrailingStopState};
use crate::indicators;
use crate::models::{columns, Position, PositionSide, Series, TradeAction, TradeRecord};
use crate::state::TrailingStateStore;
use crate::strategy::{evaluate_isolated, Signal, SignalAction, StrategyRegistry};
use crate::trading::{compute_order_size, MarketInfo, SharedConfig, TradingConfig};

/// Waits used by the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopTiming {
    /// No configuration available yet
    pub config_retry: Duration,

    /// Configuration has no symbol
    pub symbol_retry: Duration,

    /// Pause after a successful close so the exchange settles
    pub post_close_pause: Duration,

    /// Floor for the sleep between iterations
    pub min_sleep: Duration,

    /// Longest uninterrupted sleep; bounds shutdown latency
    pub sleep_slice: Duration,
}

impl Default for LoopTiming {
    fn default() -> Self {
        Self {
            config_retry: Duration::from_secs(15),
            symbol_retry: Duration::from_secs(10),
            post_close_pause: Duration::from_secs(2),
            min_sleep: Duration::from_millis(100),
            sleep_slice: Duration::from_secs(1),
        }
    }
}

impl LoopTiming {
    /// Millisecond waits for tests and simulations.
    pub fn immediate() -> Self {
        Self {
            config_retry: Duration::from_millis(1),
            symbol_retry: Duration::from_millis(1),
            post_close_pause: Duration::from_millis(1),
            min_sleep: Duration::from_millis(1),
            sleep_slice: Duration::from_millis(1),
        }
    }
}

/// What an iteration did.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Action {
    /// An exit filter fired; `closed` tells whether the close went through
    Exit { kind: ExitKind, closed: bool },

    /// A strategy inverted the position; the close succeeded, `opened` is the new side's result
    Inverted { to: PositionSide, opened: bool },

    /// A strategy opened a position
    Opened { side: PositionSide },
}

/// Outcome of one iteration.
#[derive(Debug, Clone, PartialEq)]
pub enum Tick {
    /// Data was missing; nothing was evaluated
    Waiting { reason: String, retry_in: Duration },

    /// The iteration ran to the end
    Completed { action: Option<Action>, interval: Duration },
}

/// Main bot runner.
pub struct Bot {
    exchange: Arc<dyn Exchange>,
    config: SharedConfig,
    registry: Arc<StrategyRegistry>,
    state_store: Arc<dyn TrailingStateStore>,
    events: EventSink,
    timing: LoopTiming,

    // Runtime state
    current_symbol: Option<String>,
    checked_config: Option<Arc<TradingConfig>>,
    trailing: TrailingStopState,
    last_interval: Duration,

    // Shutdown signal
    shutdown: Arc<AtomicBool>,
}

impl Bot {
    pub fn new(
        exchange: Arc<dyn Exchange>,
        config: SharedConfig,
        registry: StrategyRegistry,
        state_store: Arc<dyn TrailingStateStore>,
        events: EventSink,
    ) -> Self {
        Self {
            exchange,
            config,
            registry: Arc::new(registry),
            state_store,
            events,
            timing: LoopTiming::default(),
            current_symbol: None,
            checked_config: None,
            trailing: TrailingStopState::default(),
            last_interval: TradingConfig::default().loop_interval(),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_timing(mut self, timing: LoopTiming) -> Self {
        self.timing = timing;
        self
    }

    /// Get shutdown signal for external control.
    pub fn shutdown_signal(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    /// Trailing stop state for the current symbol.
    pub fn trailing_state(&self) -> TrailingStopState {
        self.trailing
    }

    /// Main run loop.
    pub async fn run(&mut self) -> Result<()> {
        info!(strategies = ?self.registry.names(), "Starting bot run loop");
        self.events.log(LogLevel::Info, "Bot started");

        // Register shutdown handler
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            info!("Shutdown signal received");
            shutdown.store(true, Ordering::SeqCst);
        });

        while !self.shutdown.load(Ordering::SeqCst) {
            let started = Instant::now();

            let wait = match self.tick().await {
                Ok(Tick::Waiting { reason, retry_in }) => {
                    debug!(reason = %reason, retry_in = ?retry_in, "Waiting");
                    retry_in
                }
                Ok(Tick::Completed { action, interval }) => {
                    if let Some(action) = action {
                        debug!(action = ?action, "Iteration acted");
                    }
                    interval.saturating_sub(started.elapsed()).max(self.timing.min_sleep)
                }
                Err(e) => self.handle_error(e),
            };

            self.interruptible_sleep(wait).await;
        }

        info!("Bot stopped");
        self.events.log(LogLevel::Info, "Bot stopped");
        Ok(())
    }

    /// Single iteration of the main loop.
    pub async fn tick(&mut self) -> Result<Tick> {
        // 1. Configuration snapshot, stable for the whole iteration
        let Some(config) = self.config.snapshot().await else {
            self.log(LogLevel::Warn, "Waiting for configuration...".to_string());
            return Ok(Tick::Waiting {
                reason: "no configuration".to_string(),
                retry_in: self.timing.config_retry,
            });
        };
        let interval = config.loop_interval();
        self.last_interval = interval;

        if !self
            .checked_config
            .as_ref()
            .is_some_and(|checked| Arc::ptr_eq(checked, &config))
        {
            for name in self.registry.unknown(&config.strategies) {
                self.log(LogLevel::Warn, format!("Unknown strategy '{name}' skipped"));
            }
            self.checked_config = Some(config.clone());
        }

        let symbol = config.symbol.trim().to_string();
        if symbol.is_empty() {
            self.log(LogLevel::Error, "No symbol configured".to_string());
            return Ok(Tick::Waiting {
                reason: "no symbol".to_string(),
                retry_in: self.timing.symbol_retry,
            });
        }
        if self.current_symbol.as_deref() != Some(symbol.as_str()) {
            self.switch_symbol(&symbol).await;
        }

        // 2. Market data
        let Some(price) = self.exchange.get_price(&symbol).await? else {
            self.log(LogLevel::Warn, format!("No price for {symbol}"));
            return Ok(Tick::Waiting {
                reason: "no price".to_string(),
                retry_in: interval,
            });
        };
        self.events.emit(BotEvent::Price {
            symbol: symbol.clone(),
            price,
        });

        let limit = indicators::required_candles(&config);
        let series = match self.exchange.get_ohlcv(&symbol, &config.timeframe, limit).await? {
            Some(series) if !series.is_empty() => series,
            _ => {
                self.log(LogLevel::Error, format!("No OHLCV for {symbol}/{}", config.timeframe));
                return Ok(Tick::Waiting {
                    reason: "no candles".to_string(),
                    retry_in: interval,
                });
            }
        };

        // 3. Indicators
        let mut series = series;
        indicators::apply(&mut series, &config);
        let series = Arc::new(series);
        self.events.emit(BotEvent::Candles(series.clone()));

        // 4. Account
        let balance = self.exchange.get_balance(&config.quote_asset).await?;
        let position = self
            .exchange
            .get_position(&symbol)
            .await?
            .filter(Position::is_valid);

        self.emit_snapshot(&symbol, balance, position.as_ref(), &series);

        // 5. Exit filters, or reset trailing state when flat
        let mut action = match &position {
            Some(position) => self.manage_open_position(&symbol, position, price, &config).await,
            None => {
                let outcome = trailing_stop::evaluate(None, Some(price), &self.trailing, &config);
                self.update_trailing(&symbol, outcome.state).await;
                None
            }
        };

        // 6. Inversion
        if let (Some(position), None) = (&position, action) {
            action = self
                .evaluate_inversion(&symbol, position, price, balance, &series, &config)
                .await;
        }

        // 7. Entry
        if position.is_none() && action.is_none() {
            action = self.evaluate_entry(&symbol, price, balance, &series, &config).await;
        }

        Ok(Tick::Completed { action, interval })
    }

    async fn switch_symbol(&mut self, symbol: &str) {
        if let Some(previous) = &self.current_symbol {
            self.log(
                LogLevel::Info,
                format!("Symbol changed from {previous} to {symbol}, reloading trailing stop state"),
            );
        }
        self.trailing = self.state_store.load(symbol).await;
        self.current_symbol = Some(symbol.to_string());
        info!(symbol = %symbol, state = ?self.trailing, "Trailing stop state loaded");
    }

    /// Exit phase. The first filter that fires consumes the phase whether or
    /// not its close succeeds: inversion and entry only run when no exit
    /// fired, so a failed close is retried by the next iteration's filters.
    async fn manage_open_position(
        &mut self,
        symbol: &str,
        position: &Position,
        price: f64,
        config: &TradingConfig,
    ) -> Option<Action> {
        if config.filters.stop_loss {
            if let Some(reason) = stop_loss::evaluate(Some(position), Some(price), config) {
                return Some(self.fire_exit(ExitKind::StopLoss, symbol, position, price, &reason).await);
            }
        }

        if config.filters.auto_profit {
            if let Some(reason) = auto_profit::evaluate(Some(position), Some(price), config) {
                return Some(self.fire_exit(ExitKind::AutoProfit, symbol, position, price, &reason).await);
            }
        }

        if config.filters.trailing_stop {
            let outcome = trailing_stop::evaluate(Some(position), Some(price), &self.trailing, config);
            debug!(reason = %outcome.reason, "Trailing stop evaluated");
            self.update_trailing(symbol, outcome.state).await;
            if outcome.should_close {
                return Some(
                    self.fire_exit(ExitKind::TrailingStop, symbol, position, price, &outcome.reason)
                        .await,
                );
            }
        }

        None
    }

    async fn fire_exit(
        &mut self,
        kind: ExitKind,
        symbol: &str,
        position: &Position,
        price: f64,
        reason: &str,
    ) -> Action {
        self.log(LogLevel::Warn, format!("{} triggered for {symbol}", kind.label()));
        let closed = self
            .close_position(symbol, position, price, kind.history_action(), reason)
            .await;
        Action::Exit { kind, closed }
    }

    /// First enabled strategy whose signal passes `wanted`, in registration order.
    fn first_signal(
        &self,
        series: &Series,
        position: Option<&Position>,
        config: &TradingConfig,
        wanted: impl Fn(SignalAction) -> bool,
    ) -> Option<(String, Signal)> {
        for (name, strategy) in self.registry.enabled(&config.strategies) {
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }
            if let Some(signal) = evaluate_isolated(name, strategy, series, position, config) {
                if wanted(signal.action) {
                    return Some((name.to_string(), signal));
                }
                debug!(strategy = %name, action = signal.action.as_str(), "Signal ignored in this phase");
            }
        }
        None
    }

    async fn evaluate_inversion(
        &mut self,
        symbol: &str,
        position: &Position,
        price: f64,
        balance: f64,
        series: &Series,
        config: &TradingConfig,
    ) -> Option<Action> {
        let (name, signal) =
            self.first_signal(series, Some(position), config, |a| a == SignalAction::Invert)?;
        self.log(
            LogLevel::Info,
            format!("Inversion requested [{name}]: {}", signal.reason),
        );

        if !self
            .close_position(symbol, position, price, TradeAction::Close, &signal.reason)
            .await
        {
            warn!(symbol = %symbol, "Inversion aborted: close did not go through");
            return None;
        }

        // The position is gone now; a failed re-read falls back to the
        // figures from the start of the iteration so the open still happens.
        let balance = match self.exchange.get_balance(&config.quote_asset).await {
            Ok(fresh) => fresh,
            Err(e) => {
                warn!(error = %e, balance, "Balance re-read failed after inversion close");
                balance
            }
        };
        let price = match self.exchange.get_price(symbol).await {
            Ok(Some(fresh)) => fresh,
            Ok(None) => price,
            Err(e) => {
                warn!(error = %e, price, "Price re-read failed after inversion close");
                price
            }
        };

        let to = position.side.opposite();
        let opened = self
            .open_position(symbol, to, config, balance, price, &signal.reason)
            .await;
        Some(Action::Inverted { to, opened })
    }

    async fn evaluate_entry(
        &mut self,
        symbol: &str,
        price: f64,
        balance: f64,
        series: &Series,
        config: &TradingConfig,
    ) -> Option<Action> {
        let (name, signal) = self.first_signal(series, None, config, |a| {
            matches!(a, SignalAction::Long | SignalAction::Short)
        })?;
        let side = match signal.action {
            SignalAction::Short => PositionSide::Short,
            _ => PositionSide::Long,
        };
        self.log(
            LogLevel::Info,
            format!("Entry signal [{name}]: {side} - {}", signal.reason),
        );

        self.open_position(symbol, side, config, balance, price, &signal.reason)
            .await
            .then_some(Action::Opened { side })
    }

    /// Market-close `position`. Trailing state is reset whatever the outcome.
    async fn close_position(
        &mut self,
        symbol: &str,
        position: &Position,
        price: f64,
        action: TradeAction,
        reason: &str,
    ) -> bool {
        self.log(
            LogLevel::Info,
            format!("Closing {} {symbol} ({reason})", position.side),
        );
        let pnl_ratio = position.pnl_ratio_or_compute(price);
        let pnl_quote = position.unrealized_pnl_or_zero();

        let closed = match self.exchange.close(symbol, position).await {
            Ok(Some(order)) => {
                let close_price = order.fill_price().unwrap_or(price);
                self.log(
                    LogLevel::Info,
                    format!("Closed ({reason}) @ ~{close_price:.4} id:{}", order.id),
                );
                self.events.emit(BotEvent::Trade(TradeRecord::closed(
                    symbol, action, close_price, reason, pnl_ratio, pnl_quote,
                )));
                true
            }
            Ok(None) => {
                self.log(
                    LogLevel::Warn,
                    format!("Close ({reason}) returned no order. Already closed?"),
                );
                false
            }
            Err(e) => {
                self.log(LogLevel::Error, format!("Close ({reason}) failed: {e}"));
                if e.is_critical() {
                    self.critical(format!("Close failed ({reason})"), &e);
                }
                false
            }
        };

        self.reset_trailing(symbol).await;
        if closed {
            tokio::time::sleep(self.timing.post_close_pause).await;
        }
        closed
    }

    /// Size and place a market order on `side`.
    async fn open_position(
        &mut self,
        symbol: &str,
        side: PositionSide,
        config: &TradingConfig,
        balance: f64,
        price: f64,
        reason: &str,
    ) -> bool {
        self.log(
            LogLevel::Info,
            format!("Opening {} {symbol} ({reason})", side.as_str().to_uppercase()),
        );

        let info = match self.exchange.market_info(symbol).await {
            Ok(info) => info,
            Err(e) => {
                warn!(symbol = %symbol, error = %e, "Market info unavailable, using defaults");
                MarketInfo::default()
            }
        };
        let qty = compute_order_size(
            balance,
            config.trade_pct,
            config.leverage,
            price,
            info.contract_size,
            info.min_qty,
        );
        if qty <= 0.0 {
            self.log(
                LogLevel::Warn,
                format!("Order size is zero (balance {balance:.2}, price {price:.4}), not opening"),
            );
            return false;
        }

        let result = match side {
            PositionSide::Long => self.exchange.open_long(symbol, qty).await,
            PositionSide::Short => self.exchange.open_short(symbol, qty).await,
        };

        match result {
            Ok(Some(order)) => {
                let fill = order.fill_price().unwrap_or(price);
                let filled = order.filled.unwrap_or(qty);
                self.log(
                    LogLevel::Info,
                    format!(
                        "Entered {} {filled:.4} @ ~{fill:.4} id:{}",
                        side.as_str().to_uppercase(),
                        order.id
                    ),
                );
                self.events
                    .emit(BotEvent::Trade(TradeRecord::opened(symbol, side, fill, reason)));
                self.reset_trailing(symbol).await;
                true
            }
            Ok(None) => {
                self.log(LogLevel::Error, format!("Open {side} returned no order"));
                false
            }
            Err(e) => {
                self.log(LogLevel::Error, format!("Open {side} failed: {e}"));
                if e.is_critical() {
                    self.critical(format!("Open {side} failed"), &e);
                }
                false
            }
        }
    }

    /// Store `state` if it differs from the current one.
    async fn update_trailing(&mut self, symbol: &str, state: TrailingStopState) {
        if state != self.trailing {
            self.trailing = state;
            self.state_store.save(symbol, &state).await;
        }
    }

    async fn reset_trailing(&mut self, symbol: &str) {
        if !self.trailing.is_reset() {
            self.log(LogLevel::Info, format!("Resetting trailing stop for {symbol}"));
            self.update_trailing(symbol, TrailingStopState::default()).await;
        }
    }

    fn emit_snapshot(&self, symbol: &str, balance: f64, position: Option<&Position>, series: &Series) {
        self.events.emit(BotEvent::Snapshot(AccountSnapshot {
            symbol: symbol.to_string(),
            balance,
            position: position.cloned(),
            rsi: series.last_value(columns::RSI),
            ema_fast: series.last_value(columns::EMA_FAST),
            ema_slow: series.last_value(columns::EMA_SLOW),
            trailing: self.trailing,
        }));
    }

    /// Pick the wait after a failed iteration.
    fn handle_error(&self, e: anyhow::Error) -> Duration {
        match e.downcast_ref::<ExchangeError>() {
            Some(err) if err.is_critical() => {
                let wait = err.retry_after();
                self.log(LogLevel::Error, format!("Critical exchange error: {err}. Retrying in {}s", wait.as_secs()));
                self.critical("Exchange error".to_string(), err);
                wait
            }
            Some(err) if err.is_transient() => {
                let wait = err.retry_after();
                self.log(LogLevel::Warn, format!("{err}. Retrying in {}s", wait.as_secs()));
                wait
            }
            Some(err) => {
                self.log(LogLevel::Error, format!("Exchange error: {err}"));
                self.last_interval
            }
            None => {
                error!("Unexpected error in bot tick: {:?}", e);
                self.events.log(LogLevel::Error, format!("Unexpected error: {e:#}"));
                self.last_interval
            }
        }
    }

    fn critical(&self, title: String, e: &ExchangeError) {
        self.events.emit(BotEvent::Critical {
            title,
            message: e.to_string(),
        });
    }

    /// Sleep in slices so a shutdown request is noticed quickly.
    async fn interruptible_sleep(&self, duration: Duration) {
        let mut remaining = duration;
        while !remaining.is_zero() && !self.shutdown.load(Ordering::SeqCst) {
            let slice = remaining.min(self.timing.sleep_slice);
            tokio::time::sleep(slice).await;
            remaining = remaining.saturating_sub(slice);
        }
    }

    /// Log to tracing and to the event stream.
    fn log(&self, level: LogLevel, message: String) {
        match level {
            LogLevel::Info => info!("{}", message),
            LogLevel::Warn => warn!("{}", message),
            LogLevel::Error => error!("{}", message),
        }
        self.events.log(level, message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use tokio::sync::mpsc::UnboundedReceiver;

    use crate::error::ExchangeResult;
    use crate::exchange::OrderResult;
    use crate::models::series_from_closes;
    use crate::state::MemoryStateStore;

    const SYMBOL: &str = "BTC/USDT:USDT";

    #[derive(Default)]
    struct Script {
        price: Option<f64>,
        series: Option<Series>,
        balance: f64,
        position: Option<Position>,
        close_error: Option<fn() -> ExchangeError>,
        balance_error_after: Option<usize>,
        opens: Vec<(PositionSide, f64)>,
        closes: usize,
        balance_reads: usize,
    }

    /// Exchange double driven by a mutable script.
    struct ScriptedExchange {
        script: Mutex<Script>,
    }

    impl ScriptedExchange {
        fn new(script: Script) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script),
            })
        }

        fn with<R>(&self, f: impl FnOnce(&mut Script) -> R) -> R {
            f(&mut self.script.lock().unwrap())
        }

        fn order(price: f64, qty: f64) -> OrderResult {
            OrderResult {
                id: "order-1".to_string(),
                average_price: Some(price),
                price: Some(price),
                filled: Some(qty),
            }
        }

        fn open(&self, side: PositionSide, qty: f64) -> ExchangeResult<Option<OrderResult>> {
            self.with(|s| {
                let price = s.price.unwrap_or(1.0);
                s.opens.push((side, qty));
                s.position = Some(Position::new(SYMBOL, side, qty, price));
                Ok(Some(Self::order(price, qty)))
            })
        }
    }

    #[async_trait]
    impl Exchange for ScriptedExchange {
        async fn get_price(&self, _symbol: &str) -> ExchangeResult<Option<f64>> {
            Ok(self.with(|s| s.price))
        }

        async fn get_ohlcv(&self, _symbol: &str, _timeframe: &str, _limit: usize) -> ExchangeResult<Option<Series>> {
            Ok(self.with(|s| s.series.clone()))
        }

        async fn get_balance(&self, _asset: &str) -> ExchangeResult<f64> {
            self.with(|s| {
                s.balance_reads += 1;
                match s.balance_error_after {
                    Some(limit) if s.balance_reads > limit => {
                        Err(ExchangeError::Network("balance timeout".into()))
                    }
                    _ => Ok(s.balance),
                }
            })
        }

        async fn get_position(&self, _symbol: &str) -> ExchangeResult<Option<Position>> {
            Ok(self.with(|s| s.position.clone()))
        }

        async fn market_info(&self, _symbol: &str) -> ExchangeResult<MarketInfo> {
            Ok(MarketInfo::default())
        }

        async fn open_long(&self, _symbol: &str, qty: f64) -> ExchangeResult<Option<OrderResult>> {
            self.open(PositionSide::Long, qty)
        }

        async fn open_short(&self, _symbol: &str, qty: f64) -> ExchangeResult<Option<OrderResult>> {
            self.open(PositionSide::Short, qty)
        }

        async fn close(&self, _symbol: &str, position: &Position) -> ExchangeResult<Option<OrderResult>> {
            self.with(|s| {
                s.closes += 1;
                if let Some(make_error) = s.close_error {
                    return Err(make_error());
                }
                s.position = None;
                Ok(Some(Self::order(s.price.unwrap_or(1.0), position.contracts)))
            })
        }
    }

    fn script(position: Option<Position>) -> Script {
        Script {
            price: Some(100.0),
            series: Some(series_from_closes(&[100.0; 30])),
            balance: 1000.0,
            position,
            ..Default::default()
        }
    }

    fn config(strategies: &[&str]) -> TradingConfig {
        TradingConfig {
            symbol: SYMBOL.to_string(),
            strategies: strategies.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    fn registry() -> StrategyRegistry {
        let mut registry = StrategyRegistry::new();
        registry.register_fn("always_long", |_, position, _| {
            position.is_none().then(|| Signal::long("cross"))
        });
        registry.register_fn("always_invert", |_, position, _| {
            position.is_some().then(|| Signal::invert("flip"))
        });
        registry
    }

    fn bot(
        exchange: Arc<ScriptedExchange>,
        config: TradingConfig,
        store: Arc<MemoryStateStore>,
    ) -> (Bot, UnboundedReceiver<BotEvent>) {
        let (events, rx) = EventSink::channel();
        let bot = Bot::new(exchange, SharedConfig::new(config), registry(), store, events)
            .with_timing(LoopTiming::immediate());
        (bot, rx)
    }

    fn trades(rx: &mut UnboundedReceiver<BotEvent>) -> Vec<TradeRecord> {
        let mut trades = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let BotEvent::Trade(record) = event {
                trades.push(record);
            }
        }
        trades
    }

    fn completed_action(tick: Tick) -> Option<Action> {
        match tick {
            Tick::Completed { action, .. } => action,
            other => panic!("expected a completed tick, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_entry_opens_and_records_long() {
        let exchange = ScriptedExchange::new(script(None));
        let (mut bot, mut rx) = bot(exchange.clone(), config(&["always_long"]), Arc::new(MemoryStateStore::new()));

        let action = completed_action(bot.tick().await.unwrap());
        assert_eq!(action, Some(Action::Opened { side: PositionSide::Long }));

        // 1000 * 50% * 50x / 100
        let opens = exchange.with(|s| s.opens.clone());
        assert_eq!(opens.len(), 1);
        assert_eq!(opens[0].0, PositionSide::Long);
        assert!((opens[0].1 - 250.0).abs() < 1e-9);

        let trades = trades(&mut rx);
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].action, TradeAction::Long);
        assert_eq!(trades[0].reason, "cross");
    }

    #[tokio::test]
    async fn test_stop_loss_beats_trailing_stop() {
        let mut position = Position::new(SYMBOL, PositionSide::Long, 1.0, 100.0);
        position.pnl_pct = Some(-0.6);
        let exchange = ScriptedExchange::new(script(Some(position)));

        // armed trailing stop that would also fire at -60%
        let store = Arc::new(MemoryStateStore::new());
        let armed = TrailingStopState {
            active: true,
            peak_pnl_pct: 0.3,
            target_pnl_pct: 0.09,
        };
        store.save(SYMBOL, &armed).await;

        let (mut bot, mut rx) = bot(exchange.clone(), config(&[]), store.clone());
        let action = completed_action(bot.tick().await.unwrap());

        assert_eq!(
            action,
            Some(Action::Exit {
                kind: ExitKind::StopLoss,
                closed: true
            })
        );
        let trades = trades(&mut rx);
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].action, TradeAction::StopLoss);
        assert!((trades[0].pnl_percent.unwrap() + 60.0).abs() < 1e-9);
        assert!(store.load(SYMBOL).await.is_reset());
    }

    #[tokio::test]
    async fn test_failed_exit_consumes_phase() {
        let mut position = Position::new(SYMBOL, PositionSide::Long, 1.0, 100.0);
        position.pnl_pct = Some(-0.6);
        let mut s = script(Some(position));
        s.close_error = Some(|| ExchangeError::InsufficientFunds("margin".into()));
        let exchange = ScriptedExchange::new(s);

        let (mut bot, mut rx) = bot(exchange.clone(), config(&["always_invert"]), Arc::new(MemoryStateStore::new()));
        let action = completed_action(bot.tick().await.unwrap());

        assert_eq!(
            action,
            Some(Action::Exit {
                kind: ExitKind::StopLoss,
                closed: false
            })
        );
        // no inversion attempt after the failed stop-loss close
        assert_eq!(exchange.with(|s| s.closes), 1);

        let mut critical = 0;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, BotEvent::Critical { .. }) {
                critical += 1;
            }
        }
        assert_eq!(critical, 1);
    }

    #[tokio::test]
    async fn test_non_critical_close_failure_still_consumes_phase() {
        let mut position = Position::new(SYMBOL, PositionSide::Long, 1.0, 100.0);
        position.pnl_pct = Some(-0.6);
        let mut s = script(Some(position));
        s.close_error = Some(|| ExchangeError::InvalidOrder("reduce-only rejected".into()));
        let exchange = ScriptedExchange::new(s);

        let (mut bot, mut rx) = bot(exchange.clone(), config(&["always_invert"]), Arc::new(MemoryStateStore::new()));
        let action = completed_action(bot.tick().await.unwrap());

        assert_eq!(
            action,
            Some(Action::Exit {
                kind: ExitKind::StopLoss,
                closed: false
            })
        );
        assert_eq!(exchange.with(|s| s.closes), 1);
        assert!(exchange.with(|s| s.opens.is_empty()));

        let mut critical = 0;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, BotEvent::Critical { .. }) {
                critical += 1;
            }
        }
        assert_eq!(critical, 0);

        // next iteration retries the stop-loss once the exchange accepts it
        exchange.with(|s| s.close_error = None);
        let action = completed_action(bot.tick().await.unwrap());
        assert_eq!(
            action,
            Some(Action::Exit {
                kind: ExitKind::StopLoss,
                closed: true
            })
        );
    }

    #[tokio::test]
    async fn test_auto_profit_closes_and_records() {
        let mut position = Position::new(SYMBOL, PositionSide::Long, 1.0, 100.0);
        position.pnl_pct = Some(2.5);
        let exchange = ScriptedExchange::new(script(Some(position)));

        let store = Arc::new(MemoryStateStore::new());
        let armed = TrailingStopState {
            active: true,
            peak_pnl_pct: 2.6,
            target_pnl_pct: 0.78,
        };
        store.save(SYMBOL, &armed).await;

        let (mut bot, mut rx) = bot(exchange.clone(), config(&["always_invert"]), store.clone());
        let action = completed_action(bot.tick().await.unwrap());

        assert_eq!(
            action,
            Some(Action::Exit {
                kind: ExitKind::AutoProfit,
                closed: true
            })
        );
        let trades = trades(&mut rx);
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].action, TradeAction::TakeProfit);
        assert_eq!(trades[0].reason, "Auto-profit: PNL 250.00% >= 200.00%");
        assert!((trades[0].pnl_percent.unwrap() - 250.0).abs() < 1e-9);
        assert!(store.load(SYMBOL).await.is_reset());
        assert!(exchange.with(|s| s.opens.is_empty()));
    }

    #[tokio::test]
    async fn test_trailing_stop_arms_ratchets_and_closes() {
        let mut position = Position::new(SYMBOL, PositionSide::Long, 1.0, 100.0);
        position.pnl_pct = Some(0.3);
        let exchange = ScriptedExchange::new(script(Some(position)));
        let store = Arc::new(MemoryStateStore::new());
        let (mut bot, mut rx) = bot(exchange.clone(), config(&[]), store.clone());

        // arm at +30%: target 9%
        assert_eq!(completed_action(bot.tick().await.unwrap()), None);
        assert!(store.load(SYMBOL).await.active);

        // new peak at +50%: target 15%
        exchange.with(|s| {
            if let Some(p) = s.position.as_mut() {
                p.pnl_pct = Some(0.5);
            }
        });
        assert_eq!(completed_action(bot.tick().await.unwrap()), None);
        let stored = store.load(SYMBOL).await;
        assert!((stored.peak_pnl_pct - 0.5).abs() < 1e-12);
        assert!((stored.target_pnl_pct - 0.15).abs() < 1e-12);

        // give back to +10%, below the target
        exchange.with(|s| {
            if let Some(p) = s.position.as_mut() {
                p.pnl_pct = Some(0.1);
            }
        });
        let action = completed_action(bot.tick().await.unwrap());
        assert_eq!(
            action,
            Some(Action::Exit {
                kind: ExitKind::TrailingStop,
                closed: true
            })
        );

        let trades = trades(&mut rx);
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].action, TradeAction::TrailingStop);
        assert!(trades[0].reason.starts_with("Trailing stop hit: PNL 10.00% <= target 15.00%"));
        assert!(store.load(SYMBOL).await.is_reset());
        assert!(bot.trailing_state().is_reset());
    }

    #[tokio::test]
    async fn test_inversion_closes_then_opens_opposite() {
        let mut position = Position::new(SYMBOL, PositionSide::Long, 2.0, 100.0);
        position.pnl_pct = Some(0.0);
        let exchange = ScriptedExchange::new(script(Some(position)));

        let (mut bot, mut rx) = bot(exchange.clone(), config(&["always_invert"]), Arc::new(MemoryStateStore::new()));
        let action = completed_action(bot.tick().await.unwrap());

        assert_eq!(
            action,
            Some(Action::Inverted {
                to: PositionSide::Short,
                opened: true
            })
        );
        // balance re-read after the close
        assert_eq!(exchange.with(|s| s.balance_reads), 2);

        let actions: Vec<_> = trades(&mut rx).into_iter().map(|t| t.action).collect();
        assert_eq!(actions, vec![TradeAction::Close, TradeAction::Short]);
    }

    #[tokio::test]
    async fn test_inversion_completes_when_reread_fails() {
        let mut position = Position::new(SYMBOL, PositionSide::Long, 2.0, 100.0);
        position.pnl_pct = Some(0.0);
        let mut s = script(Some(position));
        s.balance_error_after = Some(1);
        let exchange = ScriptedExchange::new(s);

        let (mut bot, mut rx) = bot(exchange.clone(), config(&["always_invert"]), Arc::new(MemoryStateStore::new()));
        let action = completed_action(bot.tick().await.unwrap());

        assert_eq!(
            action,
            Some(Action::Inverted {
                to: PositionSide::Short,
                opened: true
            })
        );
        assert_eq!(exchange.with(|s| s.closes), 1);

        // sized from the balance read at the start of the iteration
        let opens = exchange.with(|s| s.opens.clone());
        assert_eq!(opens.len(), 1);
        assert_eq!(opens[0].0, PositionSide::Short);
        assert!((opens[0].1 - 250.0).abs() < 1e-9);

        let actions: Vec<_> = trades(&mut rx).into_iter().map(|t| t.action).collect();
        assert_eq!(actions, vec![TradeAction::Close, TradeAction::Short]);
        assert!(exchange.with(|s| s.position.is_some()));
    }

    #[tokio::test]
    async fn test_inversion_aborts_when_close_fails() {
        let mut position = Position::new(SYMBOL, PositionSide::Long, 1.0, 100.0);
        position.pnl_pct = Some(0.0);
        let mut s = script(Some(position));
        s.close_error = Some(|| ExchangeError::InvalidOrder("reduce-only rejected".into()));
        let exchange = ScriptedExchange::new(s);

        let (mut bot, mut rx) = bot(exchange.clone(), config(&["always_invert"]), Arc::new(MemoryStateStore::new()));
        let action = completed_action(bot.tick().await.unwrap());

        assert_eq!(action, None);
        assert!(exchange.with(|s| s.opens.is_empty()));
        assert!(trades(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_missing_data_waits() {
        let mut s = script(None);
        s.price = None;
        let exchange = ScriptedExchange::new(s);
        let (mut bot, _rx) = bot(exchange.clone(), config(&["always_long"]), Arc::new(MemoryStateStore::new()));

        assert!(matches!(bot.tick().await.unwrap(), Tick::Waiting { .. }));

        exchange.with(|s| {
            s.price = Some(100.0);
            s.series = None;
        });
        assert!(matches!(bot.tick().await.unwrap(), Tick::Waiting { .. }));
        assert!(exchange.with(|s| s.opens.is_empty()));
    }

    #[tokio::test]
    async fn test_no_config_waits() {
        let exchange = ScriptedExchange::new(script(None));
        let (events, _rx) = EventSink::channel();
        let mut bot = Bot::new(
            exchange,
            SharedConfig::empty(),
            registry(),
            Arc::new(MemoryStateStore::new()),
            events,
        )
        .with_timing(LoopTiming::immediate());

        match bot.tick().await.unwrap() {
            Tick::Waiting { retry_in, .. } => assert_eq!(retry_in, LoopTiming::immediate().config_retry),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_trailing_state_persisted_and_reset_when_flat() {
        let mut position = Position::new(SYMBOL, PositionSide::Long, 1.0, 100.0);
        position.pnl_pct = Some(0.3);
        let exchange = ScriptedExchange::new(script(Some(position)));
        let store = Arc::new(MemoryStateStore::new());

        let (mut bot, _rx) = bot(exchange.clone(), config(&[]), store.clone());
        assert_eq!(completed_action(bot.tick().await.unwrap()), None);

        let stored = store.load(SYMBOL).await;
        assert!(stored.active);
        assert!((stored.peak_pnl_pct - 0.3).abs() < 1e-12);
        assert!((stored.target_pnl_pct - 0.09).abs() < 1e-12);

        // position closed elsewhere
        exchange.with(|s| s.position = None);
        bot.tick().await.unwrap();
        assert!(store.load(SYMBOL).await.is_reset());
        assert!(bot.trailing_state().is_reset());
    }

    #[tokio::test]
    async fn test_unknown_strategy_is_skipped() {
        let exchange = ScriptedExchange::new(script(None));
        let (mut bot, _rx) = bot(
            exchange.clone(),
            config(&["does_not_exist", "always_long"]),
            Arc::new(MemoryStateStore::new()),
        );

        let action = completed_action(bot.tick().await.unwrap());
        assert_eq!(action, Some(Action::Opened { side: PositionSide::Long }));
    }

    #[tokio::test]
    async fn test_unknown_strategy_warned_once_per_config() {
        let exchange = ScriptedExchange::new(script(None));
        let (mut bot, mut rx) = bot(
            exchange.clone(),
            config(&["does_not_exist"]),
            Arc::new(MemoryStateStore::new()),
        );

        bot.tick().await.unwrap();
        bot.tick().await.unwrap();

        let mut warnings = 0;
        while let Ok(event) = rx.try_recv() {
            if let BotEvent::Log(line) = event {
                if line.level == LogLevel::Warn && line.message.contains("does_not_exist") {
                    warnings += 1;
                }
            }
        }
        assert_eq!(warnings, 1);
    }

    #[tokio::test]
    async fn test_transient_error_backoff() {
        let exchange = ScriptedExchange::new(script(None));
        let (bot, _rx) = bot(exchange, config(&[]), Arc::new(MemoryStateStore::new()));

        let wait = bot.handle_error(ExchangeError::Network("reset".into()).into());
        assert_eq!(wait, crate::error::NETWORK_BACKOFF);

        let wait = bot.handle_error(anyhow::anyhow!("something odd"));
        assert_eq!(wait, TradingConfig::default().loop_interval());
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let exchange = ScriptedExchange::new(script(None));
        let (mut bot, _rx) = bot(exchange, config(&[]), Arc::new(MemoryStateStore::new()));
        let shutdown = bot.shutdown_signal();

        let handle = tokio::spawn(async move { bot.run().await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.store(true, Ordering::SeqCst);

        let result = tokio::time::timeout(Duration::from_secs(5), handle).await;
        assert!(matches!(result, Ok(Ok(Ok(())))));
    }
}
