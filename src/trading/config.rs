//! Trading configuration: a flat JSON document, loaded leniently field by field.
//!
//! A bad value never takes the whole configuration down. Unknown or mistyped
//! keys keep their defaults with a warning, and filter percentages that cannot
//! be read as numbers switch the corresponding filter off.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const DEFAULT_RSI_BOUNDS: (f64, f64) = (70.0, 30.0);

/// Longest accepted pause between iterations, in seconds.
pub const MAX_LOOP_INTERVAL_SECS: f64 = 86_400.0;

/// Which exit filters the orchestrator consults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterToggles {
    pub stop_loss: bool,
    pub auto_profit: bool,
    pub trailing_stop: bool,
}

impl Default for FilterToggles {
    fn default() -> Self {
        Self {
            stop_loss: true,
            auto_profit: true,
            trailing_stop: true,
        }
    }
}

/// Configuration for one traded symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradingConfig {
    /// Unified symbol, e.g. `BTC/USDT:USDT`
    pub symbol: String,

    /// Candle timeframe (`1m`, `15m`, `1h`, ...)
    pub timeframe: String,

    /// Leverage used for sizing
    pub leverage: f64,

    /// Percentage of the available balance committed as margin per entry
    pub trade_pct: f64,

    /// Stop-loss threshold in percent of margin; `None` disables the filter
    pub stop_loss: Option<f64>,

    /// Take-profit threshold in percent of margin; `None` disables the filter
    pub auto_profit: Option<f64>,

    /// PNL percent at which trailing protection arms
    pub trailing_trigger: Option<f64>,

    /// Percent of the peak PNL kept as the trailing target (multiplier, not an offset)
    pub trailing_stop: Option<f64>,

    /// RSI lookback
    pub rsi_period: usize,

    /// RSI bounds as `"upper / lower"`
    pub rsi_threshold: String,

    /// Fast EMA span
    pub ema_fast: usize,

    /// Slow EMA span
    pub ema_slow: usize,

    /// Trend-filter EMA span
    pub ema_filter_period: usize,

    /// Require close above/below the filter EMA for EMA entries
    pub ema_use_trend_filter: bool,

    /// Require close above/below the filter EMA for RSI entries
    pub rsi_use_trend_filter: bool,

    /// Seconds between loop iterations
    #[serde(rename = "loop_interval")]
    pub loop_interval_secs: f64,

    /// Asset the account balance is read in
    pub quote_asset: String,

    /// Enabled exit filters
    pub filters: FilterToggles,

    /// Enabled strategies by name
    pub strategies: Vec<String>,
}

impl Default for TradingConfig {
    fn default() -> Self {
        Self {
            symbol: "BTC/USDT:USDT".to_string(),
            timeframe: "15m".to_string(),
            leverage: 50.0,
            trade_pct: 50.0,
            stop_loss: Some(50.0),
            auto_profit: Some(200.0),
            trailing_trigger: Some(25.0),
            trailing_stop: Some(30.0),
            rsi_period: 14,
            rsi_threshold: "70 / 30".to_string(),
            ema_fast: 5,
            ema_slow: 15,
            ema_filter_period: 100,
            ema_use_trend_filter: false,
            rsi_use_trend_filter: false,
            loop_interval_secs: 2.0,
            quote_asset: "USDT".to_string(),
            filters: FilterToggles::default(),
            strategies: vec!["ema_cross".to_string()],
        }
    }
}

impl TradingConfig {
    /// Build a configuration from parsed JSON, collecting a warning for every
    /// value that had to be replaced.
    pub fn from_json(value: &Value) -> (Self, Vec<String>) {
        let mut config = Self::default();
        let mut warnings = Vec::new();

        let Some(map) = value.as_object() else {
            warnings.push("configuration is not a JSON object, using defaults".to_string());
            return (config, warnings);
        };

        merge(map, "symbol", &mut config.symbol, &mut warnings);
        merge(map, "timeframe", &mut config.timeframe, &mut warnings);
        merge(map, "leverage", &mut config.leverage, &mut warnings);
        merge(map, "trade_pct", &mut config.trade_pct, &mut warnings);
        merge_percent(map, "stop_loss", &mut config.stop_loss, &mut warnings);
        merge_percent(map, "auto_profit", &mut config.auto_profit, &mut warnings);
        merge_percent(map, "trailing_trigger", &mut config.trailing_trigger, &mut warnings);
        merge_percent(map, "trailing_stop", &mut config.trailing_stop, &mut warnings);
        merge(map, "rsi_period", &mut config.rsi_period, &mut warnings);
        merge(map, "rsi_threshold", &mut config.rsi_threshold, &mut warnings);
        merge(map, "ema_fast", &mut config.ema_fast, &mut warnings);
        merge(map, "ema_slow", &mut config.ema_slow, &mut warnings);
        merge(map, "ema_filter_period", &mut config.ema_filter_period, &mut warnings);
        merge(map, "ema_use_trend_filter", &mut config.ema_use_trend_filter, &mut warnings);
        merge(map, "rsi_use_trend_filter", &mut config.rsi_use_trend_filter, &mut warnings);
        merge(map, "loop_interval", &mut config.loop_interval_secs, &mut warnings);
        merge(map, "quote_asset", &mut config.quote_asset, &mut warnings);
        merge(map, "filters", &mut config.filters, &mut warnings);
        merge(map, "strategies", &mut config.strategies, &mut warnings);

        config.normalize(&mut warnings);
        (config, warnings)
    }

    fn normalize(&mut self, warnings: &mut Vec<String>) {
        let defaults = Self::default();

        for (name, value, default) in [
            ("rsi_period", &mut self.rsi_period, defaults.rsi_period),
            ("ema_fast", &mut self.ema_fast, defaults.ema_fast),
            ("ema_slow", &mut self.ema_slow, defaults.ema_slow),
            ("ema_filter_period", &mut self.ema_filter_period, defaults.ema_filter_period),
        ] {
            if *value == 0 {
                warnings.push(format!("{name} must be at least 1, using {default}"));
                *value = default;
            }
        }

        if !self.loop_interval_secs.is_finite() || self.loop_interval_secs < 0.0 {
            warnings.push(format!(
                "loop_interval {} is not usable, using {}",
                self.loop_interval_secs, defaults.loop_interval_secs
            ));
            self.loop_interval_secs = defaults.loop_interval_secs;
        } else if self.loop_interval_secs > MAX_LOOP_INTERVAL_SECS {
            warnings.push(format!(
                "loop_interval {} is above {MAX_LOOP_INTERVAL_SECS}, capping it",
                self.loop_interval_secs
            ));
            self.loop_interval_secs = MAX_LOOP_INTERVAL_SECS;
        }

        self.symbol = self.symbol.trim().to_string();
        self.strategies = self
            .strategies
            .iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
    }

    /// Upper and lower RSI bounds, falling back to 70/30 when unparseable or inverted.
    pub fn rsi_bounds(&self) -> (f64, f64) {
        let mut parts = self.rsi_threshold.split('/').map(|p| p.trim().parse::<f64>());
        match (parts.next(), parts.next(), parts.next()) {
            (Some(Ok(upper)), Some(Ok(lower)), None) if upper > lower => (upper, lower),
            _ => {
                debug!(threshold = %self.rsi_threshold, "Unusable RSI threshold, using 70/30");
                DEFAULT_RSI_BOUNDS
            }
        }
    }

    /// Whether any strategy needs the filter EMA.
    pub fn trend_filter_enabled(&self) -> bool {
        self.ema_use_trend_filter || self.rsi_use_trend_filter
    }

    /// Pause between iterations. Values built in code bypass `normalize`,
    /// so anything out of range falls back to the default here as well.
    pub fn loop_interval(&self) -> Duration {
        let secs = self.loop_interval_secs;
        if (0.0..=MAX_LOOP_INTERVAL_SECS).contains(&secs) {
            Duration::from_secs_f64(secs)
        } else {
            Duration::from_secs_f64(Self::default().loop_interval_secs)
        }
    }

    /// Read a configuration file. Syntax errors fail; bad values fall back.
    pub async fn load(path: &Path) -> Result<Self> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let value: Value = serde_json::from_str(&raw)
            .with_context(|| format!("Config {} is not valid JSON", path.display()))?;

        let (config, warnings) = Self::from_json(&value);
        for warning in &warnings {
            warn!(path = %path.display(), "Config: {}", warning);
        }
        Ok(config)
    }

    /// Read the configuration, writing the defaults first when the file does not exist.
    pub async fn load_or_init(path: &Path) -> Result<Self> {
        if tokio::fs::try_exists(path).await.unwrap_or(false) {
            return Self::load(path).await;
        }

        info!(path = %path.display(), "Config not found, writing defaults");
        let config = Self::default();
        config.save(path).await?;
        Ok(config)
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(self)?;
        tokio::fs::write(path, json)
            .await
            .with_context(|| format!("Failed to write config {}", path.display()))
    }
}

fn merge<T: DeserializeOwned>(map: &Map<String, Value>, key: &str, slot: &mut T, warnings: &mut Vec<String>) {
    let Some(raw) = map.get(key) else { return };
    match serde_json::from_value(raw.clone()) {
        Ok(value) => *slot = value,
        Err(e) => warnings.push(format!("{key}: invalid value {raw} ({e}), keeping default")),
    }
}

/// Percentages accept numbers and numeric strings; anything else disables the filter.
fn merge_percent(map: &Map<String, Value>, key: &str, slot: &mut Option<f64>, warnings: &mut Vec<String>) {
    let Some(raw) = map.get(key) else { return };
    *slot = parse_percent(raw);
    if slot.is_none() && !raw.is_null() {
        warnings.push(format!("{key}: {raw} is not a number, filter disabled"));
    }
}

pub fn parse_percent(raw: &Value) -> Option<f64> {
    let value = match raw {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().trim_end_matches('%').trim().parse().ok(),
        _ => None,
    };
    value.filter(|v| v.is_finite())
}

/// Process-wide configuration handle. Readers get an immutable snapshot that
/// stays stable for the whole iteration, writers swap the snapshot.
#[derive(Clone, Default)]
pub struct SharedConfig {
    inner: Arc<RwLock<Option<Arc<TradingConfig>>>>,
}

impl SharedConfig {
    pub fn new(config: TradingConfig) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Some(Arc::new(config)))),
        }
    }

    /// Handle with no configuration loaded yet.
    #[cfg(test)]
    pub fn empty() -> Self {
        Self::default()
    }

    pub async fn snapshot(&self) -> Option<Arc<TradingConfig>> {
        self.inner.read().await.clone()
    }

    pub async fn replace(&self, config: TradingConfig) {
        *self.inner.write().await = Some(Arc::new(config));
    }
}

async fn modified_at(path: &Path) -> Option<SystemTime> {
    tokio::fs::metadata(path).await.ok()?.modified().ok()
}

/// Watch the config file and publish a new snapshot whenever it changes.
/// A file that fails to load leaves the current snapshot in place.
pub fn spawn_reloader(
    path: PathBuf,
    shared: SharedConfig,
    every: Duration,
    shutdown: Arc<AtomicBool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut last_seen = modified_at(&path).await;

        while !shutdown.load(Ordering::SeqCst) {
            tokio::time::sleep(every).await;

            let current = modified_at(&path).await;
            if current.is_none() || current == last_seen {
                continue;
            }
            last_seen = current;

            match TradingConfig::load(&path).await {
                Ok(config) => {
                    info!(symbol = %config.symbol, "Configuration reloaded");
                    shared.replace(config).await;
                }
                Err(e) => warn!(error = %e, "Config reload failed, keeping previous settings"),
            }
        }
    })
}
