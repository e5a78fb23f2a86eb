//! Exit filters consulted for an open position, in precedence order:
//! stop-loss, auto-profit, trailing stop.

pub mod auto_profit;
pub mod stop_loss;
pub mod trailing_stop;

pub use trailing_stop::{TrailingStopOutcome, TrailingStopState};

use crate::models::TradeAction;

/// Percentages at or below this magnitude switch a filter off.
pub const MIN_ENABLED_PCT: f64 = 0.001;

/// Configured percentage as a usable magnitude, or `None` when the filter is off.
pub fn enabled_pct(raw: Option<f64>) -> Option<f64> {
    raw.map(f64::abs)
        .filter(|pct| pct.is_finite() && *pct > MIN_ENABLED_PCT)
}

/// Which exit filter closed a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    StopLoss,
    AutoProfit,
    TrailingStop,
}

impl ExitKind {
    pub fn label(&self) -> &'static str {
        match self {
            ExitKind::StopLoss => "stop-loss",
            ExitKind::AutoProfit => "auto-profit",
            ExitKind::TrailingStop => "trailing stop",
        }
    }

    /// Action recorded in the trade history.
    pub fn history_action(&self) -> TradeAction {
        match self {
            ExitKind::StopLoss => TradeAction::StopLoss,
            ExitKind::AutoProfit => TradeAction::TakeProfit,
            ExitKind::TrailingStop => TradeAction::TrailingStop,
        }
    }
}
