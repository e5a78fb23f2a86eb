//! Technical indicators computed over a candle series.
//!
//! Every function returns a vector aligned with its input, with NaN where the
//! indicator is not yet defined.

use crate::models::{columns, Series};
use crate::trading::TradingConfig;

/// Candles fetched on top of the longest lookback.
pub const OHLCV_SAFETY_MARGIN: usize = 50;

/// Exponential moving average with `alpha = 2 / (span + 1)`, seeded with the
/// first value and updated recursively from there.
///
/// All NaN when there are fewer values than `span`.
pub fn ema(values: &[f64], span: usize) -> Vec<f64> {
    let n = values.len();
    let mut result = vec![f64::NAN; n];
    if span == 0 || n < span {
        return result;
    }

    let alpha = 2.0 / (span as f64 + 1.0);
    let mut prev = values[0];
    result[0] = prev;
    for i in 1..n {
        prev = if values[i].is_nan() {
            prev
        } else {
            alpha * values[i] + (1.0 - alpha) * prev
        };
        result[i] = prev;
    }
    result
}

/// Relative Strength Index with Wilder smoothing (`alpha = 1 / period`).
///
/// Gains and losses are smoothed recursively from the first bar; values
/// become defined once `period` observations are in. Zero average loss
/// reads as 100. All NaN with fewer than `period + 1` closes.
pub fn rsi(closes: &[f64], period: usize) -> Vec<f64> {
    let n = closes.len();
    let mut result = vec![f64::NAN; n];
    if period == 0 || n < period + 1 {
        return result;
    }

    let alpha = 1.0 / period as f64;
    let mut avg_gain = 0.0;
    let mut avg_loss = 0.0;

    for i in 0..n {
        let change = if i == 0 { 0.0 } else { closes[i] - closes[i - 1] };
        let change = if change.is_nan() { 0.0 } else { change };
        let (gain, loss) = if change > 0.0 { (change, 0.0) } else { (0.0, -change) };

        if i == 0 {
            avg_gain = gain;
            avg_loss = loss;
        } else {
            avg_gain = alpha * gain + (1.0 - alpha) * avg_gain;
            avg_loss = alpha * loss + (1.0 - alpha) * avg_loss;
        }

        if i + 1 >= period {
            result[i] = rsi_value(avg_gain, avg_loss);
        }
    }
    result
}

fn rsi_value(avg_gain: f64, avg_loss: f64) -> f64 {
    if avg_loss == 0.0 {
        return 100.0;
    }
    let rs = avg_gain / avg_loss;
    (100.0 - 100.0 / (1.0 + rs)).clamp(0.0, 100.0)
}

/// Number of candles to request so every configured indicator is defined on
/// the latest bar.
pub fn required_candles(config: &TradingConfig) -> usize {
    let mut longest = (config.rsi_period + 1).max(config.ema_fast).max(config.ema_slow);
    if config.trend_filter_enabled() {
        longest = longest.max(config.ema_filter_period);
    }
    longest + OHLCV_SAFETY_MARGIN
}

/// Append the configured indicator columns to the series.
pub fn apply(series: &mut Series, config: &TradingConfig) {
    let closes = series.closes();

    series.set_column(columns::EMA_FAST, ema(&closes, config.ema_fast));
    series.set_column(columns::EMA_SLOW, ema(&closes, config.ema_slow));
    series.set_column(columns::RSI, rsi(&closes, config.rsi_period));
    if config.trend_filter_enabled() {
        series.set_column(columns::EMA_FILTER, ema(&closes, config.ema_filter_period));
    }
}
