//! Perpetual futures autopilot
//!
//! Manages one leveraged position at a time: stop-loss, take-profit and a
//! trailing stop protect the open position, pluggable strategies decide
//! entries and inversions.

mod api;
mod bot;
mod db;
mod error;
mod events;
mod exchange;
mod filters;
mod indicators;
mod metrics;
mod models;
mod state;
mod strategy;
mod trading;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use tracing::{debug, error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use crate::api::MarketClient;
use crate::bot::Bot;
use crate::db::Database;
use crate::events::{BotEvent, EventSink};
use crate::exchange::{Exchange, MarketFeed, PaperConfig, PaperExchange};
use crate::metrics::HistoryStats;
use crate::models::Position;
use crate::state::{JsonStateStore, MemoryStateStore, TrailingStateStore};
use crate::strategy::{load_custom_strategy, Strategy, StrategyRegistry, CUSTOM_STRATEGY_NAME};
use crate::trading::{spawn_reloader, SharedConfig, TradingConfig};

const TRAILING_STATE_FILE: &str = "trailing_state.json";
const CUSTOM_STRATEGY_FILE: &str = "custom_strategy.json";
const CONFIG_RELOAD_EVERY: Duration = Duration::from_secs(5);

/// Perpetual futures autopilot CLI.
#[derive(Parser)]
#[command(name = "autopilot")]
#[command(about = "Automated position management for leveraged perpetual futures", long_about = None)]
struct Cli {
    /// Trading configuration file (JSON)
    #[arg(short, long, env = "AUTOPILOT_CONFIG", default_value = "config.json")]
    config: PathBuf,

    /// Directory for trailing stop state and the custom strategy file
    #[arg(long, env = "AUTOPILOT_DATA_DIR", default_value = "data")]
    data_dir: PathBuf,

    /// Trade history database
    #[arg(short, long, env = "AUTOPILOT_DATABASE", default_value = "sqlite:./autopilot.db?mode=rwc")]
    database: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Paper-trade the configured symbol on live market data
    Run {
        /// Starting paper balance in the quote asset
        #[arg(short, long, default_value = "1000")]
        balance: f64,

        /// Simulated taker fee percentage (0-100)
        #[arg(long, default_value = "0.05")]
        fee: f64,

        /// Simulated slippage percentage (0-100)
        #[arg(long, default_value = "0.05")]
        slippage: f64,

        /// Keep trailing stop state in memory only
        #[arg(long)]
        ephemeral: bool,
    },

    /// Show the effective configuration
    Config {
        /// Write the default configuration to the config path
        #[arg(long)]
        init: bool,
    },

    /// Show recorded trades, newest first
    History {
        /// Only this symbol
        #[arg(short, long)]
        symbol: Option<String>,

        /// Maximum number of rows
        #[arg(short = 'n', long, default_value = "20")]
        limit: i64,

        /// Delete all recorded trades
        #[arg(long)]
        clear: bool,
    },

    /// Show performance of closed trades
    Stats {
        /// Only this symbol
        #[arg(short, long)]
        symbol: Option<String>,
    },

    /// Show or reset the stored trailing stop state for a symbol
    State {
        symbol: String,

        /// Reset the state to inactive
        #[arg(long)]
        reset: bool,
    },

    /// List available strategies
    Strategies,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    // Setup logging
    let log_level = match cli.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Run {
            balance,
            fee,
            slippage,
            ephemeral,
        } => {
            let config = TradingConfig::load_or_init(&cli.config).await?;
            info!(
                symbol = %config.symbol,
                timeframe = %config.timeframe,
                balance = balance,
                "Starting paper trading"
            );

            let client = MarketClient::new()?;
            let (price, market) = futures::try_join!(
                client.last_price(&config.symbol),
                client.market_info(&config.symbol)
            )
            .with_context(|| format!("Market data unavailable for {}", config.symbol))?;

            let paper = Arc::new(PaperExchange::new(
                client,
                PaperConfig {
                    initial_balance: Decimal::try_from(balance)?,
                    leverage: Decimal::try_from(config.leverage)?,
                    fee_rate: Decimal::try_from(fee / 100.0)?,
                    slippage: Decimal::try_from(slippage / 100.0)?,
                    quote_asset: config.quote_asset.clone(),
                },
            ));
            let exchange: Arc<dyn Exchange> = paper.clone();

            let registry = build_registry(&cli.data_dir);
            let store: Arc<dyn TrailingStateStore> = if ephemeral {
                Arc::new(MemoryStateStore::new())
            } else {
                Arc::new(JsonStateStore::new(cli.data_dir.join(TRAILING_STATE_FILE)))
            };
            let db = Arc::new(Database::new(&cli.database).await?);

            let (events, rx) = EventSink::channel();
            let consumer = tokio::spawn(consume_events(rx, db.clone()));

            let shared = SharedConfig::new(config.clone());
            let mut bot = Bot::new(exchange, shared.clone(), registry, store, events);
            let reloader = spawn_reloader(cli.config.clone(), shared, CONFIG_RELOAD_EVERY, bot.shutdown_signal());

            println!("\n=== Perpetual Autopilot (paper) ===");
            println!("Symbol:      {}", config.symbol);
            println!("Last price:  {}", price.map_or("n/a".to_string(), |p| format!("{p:.4}")));
            println!("Contract:    {} per contract, min {}", market.contract_size, market.min_qty);
            println!("Leverage:    {}x, {}% of balance per trade", config.leverage, config.trade_pct);
            println!("Strategies:  {}", config.strategies.join(", "));
            println!("\nThis is SIMULATED trading - no real money involved.");
            println!("Press Ctrl+C to stop.\n");

            // Run the bot
            if let Err(e) = bot.run().await {
                error!(error = %e, "Bot error");
            }

            drop(bot);
            reloader.abort();
            if let Err(e) = consumer.await {
                warn!(error = %e, "Event consumer ended abnormally");
            }

            // Show final stats
            println!("{}", paper.stats().await);
        }

        Commands::Config { init } => {
            if init {
                TradingConfig::default().save(&cli.config).await?;
                println!("Wrote default configuration to {}", cli.config.display());
                return Ok(());
            }

            let config = if tokio::fs::try_exists(&cli.config).await.unwrap_or(false) {
                TradingConfig::load(&cli.config).await?
            } else {
                println!("{} not found, showing defaults.", cli.config.display());
                TradingConfig::default()
            };
            print_config(&config);
        }

        Commands::History { symbol, limit, clear } => {
            let db = Database::new(&cli.database).await?;
            if clear {
                let removed = db.clear_history().await?;
                println!("Removed {} trade(s) from history.", removed);
                return Ok(());
            }

            let trades = db.recent_trades(symbol.as_deref(), limit).await?;

            if trades.is_empty() {
                println!("No trades recorded yet. Use 'autopilot run' to start trading.");
                return Ok(());
            }

            println!(
                "\n{:<26} {:<16} {:<6} {:>14} {:>9} {:>11}  {}",
                "TIME", "SYMBOL", "ACTION", "PRICE", "PNL%", "PNL", "REASON"
            );
            println!("{}", "-".repeat(110));

            for trade in trades {
                println!(
                    "{:<26} {:<16} {:<6} {:>14} {:>9} {:>11}  {}",
                    truncate(&trade.timestamp, 25),
                    truncate(&trade.symbol, 16),
                    trade.action,
                    trade.price().map_or("-".to_string(), |p| format!("{p:.4}")),
                    trade.pnl_percent.map_or("-".to_string(), |p| format!("{p:.2}%")),
                    trade.pnl_usdt.map_or("-".to_string(), |p| format!("{p:.2}")),
                    truncate(trade.reason.as_deref().unwrap_or(""), 40)
                );
            }
        }

        Commands::Stats { symbol } => {
            let db = Database::new(&cli.database).await?;
            let trades = db.closed_trades(symbol.as_deref()).await?;
            println!("{}", HistoryStats::from_trades(&trades));
        }

        Commands::State { symbol, reset } => {
            let store = JsonStateStore::new(cli.data_dir.join(TRAILING_STATE_FILE));
            if reset {
                store.save(&symbol, &Default::default()).await;
                println!("Trailing stop state for {} reset.", symbol);
            }

            let state = store.load(&symbol).await;
            println!("\n=== Trailing Stop: {} ===", symbol);
            println!("Active:  {}", if state.active { "Yes" } else { "No" });
            if state.active {
                println!("Peak:    {:.2}%", state.peak_pnl_pct * 100.0);
                println!("Target:  {:.2}%", state.target_pnl_pct * 100.0);
            }
        }

        Commands::Strategies => {
            let registry = build_registry(&cli.data_dir);
            let enabled = match TradingConfig::load(&cli.config).await {
                Ok(config) => config.strategies,
                Err(_) => TradingConfig::default().strategies,
            };

            println!("\n{:<16} {:>8}", "STRATEGY", "ENABLED");
            println!("{}", "-".repeat(25));
            for name in registry.names() {
                let on = enabled.iter().any(|e| e == name);
                println!("{:<16} {:>8}", name, if on { "yes" } else { "no" });
            }
            if !registry.contains(CUSTOM_STRATEGY_NAME) {
                println!(
                    "\nNo custom strategy loaded (expected at {}).",
                    cli.data_dir.join(CUSTOM_STRATEGY_FILE).display()
                );
            }
        }
    }

    Ok(())
}

/// Built-in strategies plus the user rule file, when it loads.
fn build_registry(data_dir: &std::path::Path) -> StrategyRegistry {
    let mut registry = StrategyRegistry::with_builtins();
    let custom = load_custom_strategy(&data_dir.join(CUSTOM_STRATEGY_FILE));
    registry.set_custom(custom.map(|s| Arc::new(s) as Arc<dyn Strategy>));
    registry
}

/// Print trades and alerts, and write every trade to the history table.
async fn consume_events(mut rx: tokio::sync::mpsc::UnboundedReceiver<BotEvent>, db: Arc<Database>) {
    while let Some(event) = rx.recv().await {
        match event {
            BotEvent::Trade(record) => {
                println!(
                    "[{}] {:<5} {} @ {:.4}{}  {}",
                    record.timestamp.format("%H:%M:%S"),
                    record.action,
                    record.symbol,
                    record.price,
                    record
                        .pnl_percent
                        .map_or(String::new(), |p| format!(" ({p:+.2}%)")),
                    record.reason
                );
                if let Err(e) = db.record_trade(&record).await {
                    warn!(error = %e, "Failed to record trade");
                }
            }
            BotEvent::Critical { title, message } => {
                error!(title = %title, "{}", message);
                eprintln!("!! {}: {}", title, message);
            }
            BotEvent::Snapshot(snapshot) => {
                debug!(
                    symbol = %snapshot.symbol,
                    balance = snapshot.balance,
                    side = ?snapshot.position.as_ref().map(|p| p.side),
                    leverage = ?snapshot.position.as_ref().map(Position::leverage_or_default),
                    notional = ?snapshot.position.as_ref().map(Position::notional),
                    rsi = ?snapshot.rsi,
                    trailing_active = snapshot.trailing.active,
                    "Account snapshot"
                );
            }
            // already traced by the loop
            BotEvent::Price { .. } | BotEvent::Candles(_) | BotEvent::Log(_) => {}
        }
    }
}

fn print_config(config: &TradingConfig) {
    let pct = |v: Option<f64>| v.map_or("off".to_string(), |p| format!("{p}%"));

    println!("\n=== Trading Configuration ===\n");
    println!("Market:");
    println!("  Symbol:               {}", config.symbol);
    println!("  Timeframe:            {}", config.timeframe);
    println!("  Quote Asset:          {}", config.quote_asset);
    println!("  Loop Interval:        {}s", config.loop_interval_secs);

    println!("\nPosition Sizing:");
    println!("  Leverage:             {}x", config.leverage);
    println!("  Trade Size:           {}% of balance", config.trade_pct);

    println!("\nExit Filters:");
    println!("  Stop Loss:            {} ({})", pct(config.stop_loss), on_off(config.filters.stop_loss));
    println!("  Auto Profit:          {} ({})", pct(config.auto_profit), on_off(config.filters.auto_profit));
    println!("  Trailing Trigger:     {}", pct(config.trailing_trigger));
    println!(
        "  Trailing Keep:        {} of peak ({})",
        pct(config.trailing_stop),
        on_off(config.filters.trailing_stop)
    );

    println!("\nIndicators:");
    println!("  RSI:                  period {}, bounds {}", config.rsi_period, config.rsi_threshold);
    println!("  EMA Fast / Slow:      {} / {}", config.ema_fast, config.ema_slow);
    println!("  EMA Trend Filter:     {}", config.ema_filter_period);
    println!("  Trend Filter (EMA):   {}", on_off(config.ema_use_trend_filter));
    println!("  Trend Filter (RSI):   {}", on_off(config.rsi_use_trend_filter));

    println!("\nStrategies:             {}", config.strategies.join(", "));
}

fn on_off(flag: bool) -> &'static str {
    if flag {
        "on"
    } else {
        "off"
    }
}

/// Truncate a string with ellipsis if too long.
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}
