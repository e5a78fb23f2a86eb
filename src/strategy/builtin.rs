//! Built-in strategies.

use super::{Signal, Strategy};
use crate::indicators;
use crate::models::{columns, Position, PositionSide, Series};
use crate::trading::TradingConfig;

/// Trend filter verdict for the latest close: `(long_ok, short_ok)`.
/// `None` when the filter is required but not computable yet.
fn trend_filter(series: &Series, enabled: bool) -> Option<(bool, bool)> {
    if !enabled {
        return Some((true, true));
    }
    let close = series.last_value(columns::CLOSE)?;
    let filter = series.last_value(columns::EMA_FILTER)?;
    Some((close > filter, close < filter))
}

fn filter_suffix(enabled: bool) -> &'static str {
    if enabled {
        " (trend filter ok)"
    } else {
        ""
    }
}

/// Fast/slow EMA crossover: enters on a cross, inverts on the opposite cross.
pub struct EmaCross;

impl Strategy for EmaCross {
    fn evaluate(&self, series: &Series, position: Option<&Position>, config: &TradingConfig) -> Option<Signal> {
        let fast_prev = series.value(columns::EMA_FAST, 1)?;
        let slow_prev = series.value(columns::EMA_SLOW, 1)?;
        let fast_last = series.value(columns::EMA_FAST, 0)?;
        let slow_last = series.value(columns::EMA_SLOW, 0)?;

        let crossed_up = fast_prev <= slow_prev && fast_last > slow_last;
        let crossed_down = fast_prev >= slow_prev && fast_last < slow_last;
        let periods = format!("EMA{} vs EMA{}", config.ema_fast, config.ema_slow);

        match position.map(|p| p.side) {
            None if crossed_up => Some(Signal::long(format!("EMA cross up ({periods})"))),
            None if crossed_down => Some(Signal::short(format!("EMA cross down ({periods})"))),
            Some(PositionSide::Long) if crossed_down => {
                Some(Signal::invert(format!("Invert long to short: bearish cross ({periods})")))
            }
            Some(PositionSide::Short) if crossed_up => {
                Some(Signal::invert(format!("Invert short to long: bullish cross ({periods})")))
            }
            _ => None,
        }
    }
}

/// Pullback to the fast EMA in the direction of the fast/slow trend.
pub struct EmaPullback;

impl Strategy for EmaPullback {
    fn evaluate(&self, series: &Series, position: Option<&Position>, config: &TradingConfig) -> Option<Signal> {
        let candle = *series.last()?;
        let fast = series.last_value(columns::EMA_FAST)?;
        let slow = series.last_value(columns::EMA_SLOW)?;
        let use_filter = config.ema_use_trend_filter;
        let (trend_long, trend_short) = trend_filter(series, use_filter)?;

        let bounce = fast > slow && candle.low <= fast && candle.is_bullish() && trend_long;
        let rejection = fast < slow && candle.high >= fast && candle.is_bearish() && trend_short;
        let suffix = filter_suffix(use_filter);

        match position.map(|p| p.side) {
            None if bounce => Some(Signal::long(format!(
                "Pullback to EMA{} ({fast:.4}) bounced{suffix}",
                config.ema_fast
            ))),
            None if rejection => Some(Signal::short(format!(
                "Pullback to EMA{} ({fast:.4}) rejected{suffix}",
                config.ema_fast
            ))),
            Some(PositionSide::Long) if rejection => Some(Signal::invert(format!(
                "Invert long to short: EMA{} pullback rejected ({fast:.4}){suffix}",
                config.ema_fast
            ))),
            Some(PositionSide::Short) if bounce => Some(Signal::invert(format!(
                "Invert short to long: EMA{} pullback bounced ({fast:.4}){suffix}",
                config.ema_fast
            ))),
            _ => None,
        }
    }
}

/// RSI leaving an extreme zone. Entry only.
pub struct RsiCross;

impl Strategy for RsiCross {
    fn evaluate(&self, series: &Series, position: Option<&Position>, config: &TradingConfig) -> Option<Signal> {
        if position.is_some() {
            return None;
        }
        let prev = series.value(columns::RSI, 1)?;
        let last = series.value(columns::RSI, 0)?;
        let use_filter = config.rsi_use_trend_filter;
        let (trend_long, trend_short) = trend_filter(series, use_filter)?;
        let (upper, lower) = config.rsi_bounds();
        let suffix = filter_suffix(use_filter);

        if prev < lower && last >= lower && trend_long {
            Some(Signal::long(format!("RSI ({last:.1}) crossed above {lower}{suffix}")))
        } else if prev > upper && last <= upper && trend_short {
            Some(Signal::short(format!("RSI ({last:.1}) crossed below {upper}{suffix}")))
        } else {
            None
        }
    }
}

/// Contrarian RSI levels on a freshly computed RSI. Entry only.
pub struct RsiLevels;

impl Strategy for RsiLevels {
    fn evaluate(&self, series: &Series, position: Option<&Position>, config: &TradingConfig) -> Option<Signal> {
        if position.is_some() {
            return None;
        }
        let rsi = *indicators::rsi(&series.closes(), config.rsi_period).last()?;
        if rsi.is_nan() {
            return None;
        }
        let (upper, lower) = config.rsi_bounds();

        if rsi < lower {
            Some(Signal::long(format!("RSI ({rsi:.1}) below {lower}")))
        } else if rsi > upper {
            Some(Signal::short(format!("RSI ({rsi:.1}) above {upper}")))
        } else {
            None
        }
    }
}

/// Inverts when the latest candle's colour opposes the open position.
pub struct BmsbInvert;

impl Strategy for BmsbInvert {
    fn evaluate(&self, series: &Series, position: Option<&Position>, _config: &TradingConfig) -> Option<Signal> {
        let position = position?;
        let candle = series.last()?;

        match position.side {
            PositionSide::Long if candle.is_bearish() => {
                Some(Signal::invert("Bearish candle against long, inverting to short"))
            }
            PositionSide::Short if candle.is_bullish() => {
                Some(Signal::invert("Bullish candle against short, inverting to long"))
            }
            _ => None,
        }
    }
}
