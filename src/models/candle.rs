//! OHLCV candles and the indicator-augmented series strategies read from.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Column names shared by the indicator pipeline and strategies.
pub mod columns {
    pub const OPEN: &str = "open";
    pub const HIGH: &str = "high";
    pub const LOW: &str = "low";
    pub const CLOSE: &str = "close";
    pub const VOLUME: &str = "volume";
    pub const EMA_FAST: &str = "ema_fast";
    pub const EMA_SLOW: &str = "ema_slow";
    pub const EMA_FILTER: &str = "ema_filter";
    pub const RSI: &str = "rsi";

    /// Every column a series can expose once indicators are applied.
    pub const ALL: [&str; 9] = [OPEN, HIGH, LOW, CLOSE, VOLUME, EMA_FAST, EMA_SLOW, EMA_FILTER, RSI];
}

/// Single OHLCV bar.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    /// Bar open time
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    pub fn is_bullish(&self) -> bool {
        self.close > self.open
    }

    pub fn is_bearish(&self) -> bool {
        self.close < self.open
    }

    fn field(&self, name: &str) -> Option<f64> {
        match name {
            columns::OPEN => Some(self.open),
            columns::HIGH => Some(self.high),
            columns::LOW => Some(self.low),
            columns::CLOSE => Some(self.close),
            columns::VOLUME => Some(self.volume),
            _ => None,
        }
    }
}

/// Time-ordered candles plus named indicator columns aligned to them.
///
/// Indicator values that are not yet defined (warm-up) are stored as NaN and
/// surface as `None` through [`Series::value`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Series {
    candles: Vec<Candle>,
    columns: BTreeMap<String, Vec<f64>>,
}

impl Series {
    /// Build a series, sorting candles by time and dropping duplicate timestamps.
    pub fn new(mut candles: Vec<Candle>) -> Self {
        candles.sort_by_key(|c| c.timestamp);
        candles.dedup_by_key(|c| c.timestamp);
        Self {
            candles,
            columns: BTreeMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.candles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }

    pub fn candles(&self) -> &[Candle] {
        &self.candles
    }

    /// Most recent candle.
    pub fn last(&self) -> Option<&Candle> {
        self.candles.last()
    }

    pub fn closes(&self) -> Vec<f64> {
        self.candles.iter().map(|c| c.close).collect()
    }

    /// Attach an indicator column. Values are aligned to the candles: a short
    /// vector is left-padded with NaN, a long one keeps its most recent values.
    pub fn set_column(&mut self, name: &str, mut values: Vec<f64>) {
        let len = self.candles.len();
        if values.len() > len {
            values.drain(..values.len() - len);
        } else if values.len() < len {
            let mut padded = vec![f64::NAN; len - values.len()];
            padded.extend(values);
            values = padded;
        }
        self.columns.insert(name.to_string(), values);
    }

    pub fn column(&self, name: &str) -> Option<&[f64]> {
        self.columns.get(name).map(Vec::as_slice)
    }

    /// Whether a candle field or indicator column with this name exists.
    pub fn has_column(&self, name: &str) -> bool {
        columns::ALL[..5].contains(&name) || self.columns.contains_key(name)
    }

    /// Value of a candle field or indicator `back` bars from the end
    /// (`0` = latest). `None` when missing or undefined.
    pub fn value(&self, name: &str, back: usize) -> Option<f64> {
        let idx = self.candles.len().checked_sub(back + 1)?;
        let value = match self.candles[idx].field(name) {
            Some(v) => v,
            None => *self.columns.get(name)?.get(idx)?,
        };
        Some(value).filter(|v| !v.is_nan())
    }

    /// Latest value of a column.
    pub fn last_value(&self, name: &str) -> Option<f64> {
        self.value(name, 0)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    /// Candles with the given closes, one minute apart, open = previous close.
    pub(crate) fn series_from_closes(closes: &[f64]) -> Series {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let candles = closes
            .iter()
            .enumerate()
            .map(|(i, &close)| {
                let open = if i == 0 { close } else { closes[i - 1] };
                Candle {
                    timestamp: start + Duration::minutes(i as i64),
                    open,
                    high: open.max(close),
                    low: open.min(close),
                    close,
                    volume: 1.0,
                }
            })
            .collect();
        Series::new(candles)
    }

    #[test]
    fn test_value_lookback() {
        let mut series = series_from_closes(&[1.0, 2.0, 3.0]);
        series.set_column("rsi", vec![f64::NAN, 40.0, 60.0]);

        assert_eq!(series.last_value("close"), Some(3.0));
        assert_eq!(series.value("close", 2), Some(1.0));
        assert_eq!(series.value("close", 3), None);
        assert_eq!(series.value("rsi", 1), Some(40.0));
        assert_eq!(series.value("rsi", 2), None);
        assert_eq!(series.last_value("ema_fast"), None);
    }

    #[test]
    fn test_column_alignment() {
        let mut series = series_from_closes(&[1.0, 2.0, 3.0]);
        series.set_column("ema_fast", vec![5.0]);
        series.set_column("ema_slow", vec![1.0, 2.0, 3.0, 4.0]);

        assert_eq!(series.value("ema_fast", 1), None);
        assert_eq!(series.last_value("ema_fast"), Some(5.0));
        assert_eq!(series.value("ema_slow", 2), Some(2.0));
    }

    #[test]
    fn test_sorted_and_deduplicated() {
        let series = series_from_closes(&[1.0, 2.0]);
        let mut candles = series.candles().to_vec();
        candles.reverse();
        candles.push(candles[0]);

        let rebuilt = Series::new(candles);
        assert_eq!(rebuilt.len(), 2);
        assert_eq!(rebuilt.last_value("close"), Some(2.0));
    }
}
