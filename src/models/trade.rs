//! Trade-history records emitted for every executed open, close and inversion.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::PositionSide;

/// What a history entry records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TradeAction {
    #[serde(rename = "LONG")]
    Long,
    #[serde(rename = "SHORT")]
    Short,
    #[serde(rename = "SL")]
    StopLoss,
    #[serde(rename = "TP")]
    TakeProfit,
    #[serde(rename = "TS")]
    TrailingStop,
    #[serde(rename = "CLOSE")]
    Close,
}

impl TradeAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeAction::Long => "LONG",
            TradeAction::Short => "SHORT",
            TradeAction::StopLoss => "SL",
            TradeAction::TakeProfit => "TP",
            TradeAction::TrailingStop => "TS",
            TradeAction::Close => "CLOSE",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_uppercase().as_str() {
            "LONG" => Some(TradeAction::Long),
            "SHORT" => Some(TradeAction::Short),
            "SL" => Some(TradeAction::StopLoss),
            "TP" => Some(TradeAction::TakeProfit),
            "TS" => Some(TradeAction::TrailingStop),
            "CLOSE" => Some(TradeAction::Close),
            _ => None,
        }
    }

    /// History action for opening on `side`.
    pub fn open(side: PositionSide) -> Self {
        match side {
            PositionSide::Long => TradeAction::Long,
            PositionSide::Short => TradeAction::Short,
        }
    }

    pub fn is_entry(&self) -> bool {
        matches!(self, TradeAction::Long | TradeAction::Short)
    }

    pub fn is_exit(&self) -> bool {
        !self.is_entry()
    }
}

impl std::fmt::Display for TradeAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One executed open or close.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
    /// When the order was confirmed
    pub timestamp: DateTime<Utc>,

    /// Unified symbol
    pub symbol: String,

    /// Entry side or exit kind
    pub action: TradeAction,

    /// Fill price (entry price for opens, exit price for closes)
    pub price: f64,

    /// Human-readable reason from the strategy or filter that fired
    pub reason: String,

    /// PNL in percent at close time (5.0 = +5%); `None` for entries
    pub pnl_percent: Option<f64>,

    /// PNL in quote currency at close time; `None` for entries
    pub pnl_quote: Option<f64>,
}

impl TradeRecord {
    /// Record for a freshly opened position.
    pub fn opened(symbol: &str, side: PositionSide, price: f64, reason: &str) -> Self {
        Self {
            timestamp: Utc::now(),
            symbol: symbol.to_string(),
            action: TradeAction::open(side),
            price,
            reason: reason.to_string(),
            pnl_percent: None,
            pnl_quote: None,
        }
    }

    /// Record for a close, carrying the PNL at the moment of closing.
    pub fn closed(
        symbol: &str,
        action: TradeAction,
        price: f64,
        reason: &str,
        pnl_ratio: f64,
        pnl_quote: f64,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            symbol: symbol.to_string(),
            action,
            price,
            reason: reason.to_string(),
            pnl_percent: Some(pnl_ratio * 100.0),
            pnl_quote: Some(pnl_quote),
        }
    }
}
