//! Data models for positions, candles, and trade history.

mod candle;
mod position;
mod trade;

pub use candle::{columns, Candle, Series};
pub use position::{MarginMode, Position, PositionSide, MIN_CONTRACTS};
pub use trade::{TradeAction, TradeRecord};

#[cfg(test)]
pub(crate) use candle::tests::series_from_closes;
