//! Position snapshot as reported by the exchange for the traded symbol.
//!
//! The snapshot is read-only: it is refreshed every loop iteration and never
//! patched locally. Fields the exchange may omit are optional, and every place
//! that needs a value for them goes through one of the named fallback policies
//! below instead of inlining a default.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Contracts below this magnitude are treated as "no position".
pub const MIN_CONTRACTS: f64 = 1e-9;

/// Direction of an open position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionSide::Long => "long",
            PositionSide::Short => "short",
        }
    }

    /// The side an inversion flips to.
    pub fn opposite(&self) -> Self {
        match self {
            PositionSide::Long => PositionSide::Short,
            PositionSide::Short => PositionSide::Long,
        }
    }

    /// +1 for long, -1 for short.
    pub fn direction(&self) -> f64 {
        match self {
            PositionSide::Long => 1.0,
            PositionSide::Short => -1.0,
        }
    }

    /// Parse an exchange side label (`long`/`buy`, `short`/`sell`).
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "long" | "buy" => Some(PositionSide::Long),
            "short" | "sell" => Some(PositionSide::Short),
            _ => None,
        }
    }
}

impl std::fmt::Display for PositionSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Margin mode of the position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarginMode {
    Cross,
    Isolated,
}

/// Open position on a derivatives exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    /// Unified symbol, e.g. `BTC/USDT:USDT`
    pub symbol: String,

    /// Position direction
    pub side: PositionSide,

    /// Size in contracts, always a magnitude
    pub contracts: f64,

    /// Average entry price
    pub entry_price: f64,

    /// Mark price at snapshot time
    pub mark_price: f64,

    /// Estimated liquidation price
    #[serde(default)]
    pub liquidation_price: Option<f64>,

    /// Unrealized P&L as a signed ratio of initial margin (0.05 = +5%)
    #[serde(default)]
    pub pnl_pct: Option<f64>,

    /// Unrealized P&L in quote currency
    #[serde(default)]
    pub unrealized_pnl: Option<f64>,

    /// Effective leverage
    #[serde(default)]
    pub leverage: Option<f64>,

    /// Cross or isolated margin
    #[serde(default)]
    pub margin_mode: Option<MarginMode>,

    /// Base units per contract
    #[serde(default = "default_contract_size")]
    pub contract_size: f64,

    /// Margin locked when the position was opened, in quote currency
    #[serde(default)]
    pub initial_margin: Option<f64>,

    /// When the position was opened, if known
    #[serde(default)]
    pub opened_at: Option<DateTime<Utc>>,
}

fn default_contract_size() -> f64 {
    1.0
}

impl Position {
    /// Minimal snapshot with only the required fields filled in.
    pub fn new(symbol: impl Into<String>, side: PositionSide, contracts: f64, entry_price: f64) -> Self {
        Self {
            symbol: symbol.into(),
            side,
            contracts: contracts.abs(),
            entry_price,
            mark_price: entry_price,
            liquidation_price: None,
            pnl_pct: None,
            unrealized_pnl: None,
            leverage: None,
            margin_mode: None,
            contract_size: default_contract_size(),
            initial_margin: None,
            opened_at: None,
        }
    }

    /// Whether the snapshot describes a real open position.
    pub fn is_valid(&self) -> bool {
        self.contracts >= MIN_CONTRACTS && self.valid_entry_price().is_some()
    }

    /// Entry price, or `None` when the exchange reported something unusable.
    pub fn valid_entry_price(&self) -> Option<f64> {
        Some(self.entry_price).filter(|p| p.is_finite() && *p > 0.0)
    }

    /// Fallback policy for PNL, step 1: the exchange's own figure when it is a number.
    pub fn reported_pnl_ratio(&self) -> Option<f64> {
        self.pnl_pct.filter(|p| p.is_finite())
    }

    /// Fallback policy for PNL, step 2: ratio derived from side, entry and a price.
    ///
    /// This is price movement relative to entry, not scaled by leverage.
    pub fn price_pnl_ratio(&self, current_price: f64) -> Option<f64> {
        let entry = self.valid_entry_price()?;
        if !current_price.is_finite() || current_price <= 0.0 {
            return None;
        }
        Some(self.side.direction() * (current_price - entry) / entry)
    }

    /// Full PNL fallback chain: reported, then computed, then 0.0.
    pub fn pnl_ratio_or_compute(&self, current_price: f64) -> f64 {
        self.reported_pnl_ratio()
            .or_else(|| self.price_pnl_ratio(current_price))
            .unwrap_or(0.0)
    }

    /// Fallback policy for leverage: 0.0 when the exchange did not say.
    pub fn leverage_or_default(&self) -> f64 {
        self.leverage.filter(|l| l.is_finite()).unwrap_or(0.0)
    }

    /// Unrealized P&L in quote currency, or 0.0 when unknown.
    pub fn unrealized_pnl_or_zero(&self) -> f64 {
        self.unrealized_pnl.filter(|p| p.is_finite()).unwrap_or(0.0)
    }

    /// Notional value at the mark price.
    pub fn notional(&self) -> f64 {
        self.contracts * self.contract_size * self.mark_price
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reported_pnl_wins_over_price() {
        let mut position = Position::new("BTC/USDT:USDT", PositionSide::Long, 1.0, 100.0);
        position.pnl_pct = Some(0.2);

        assert_eq!(position.pnl_ratio_or_compute(90.0), 0.2);
    }

    #[test]
    fn test_price_fallback_by_side() {
        let long = Position::new("X", PositionSide::Long, 1.0, 100.0);
        let short = Position::new("X", PositionSide::Short, 1.0, 100.0);

        assert!((long.pnl_ratio_or_compute(110.0) - 0.1).abs() < 1e-12);
        assert!((short.pnl_ratio_or_compute(110.0) + 0.1).abs() < 1e-12);
    }

    #[test]
    fn test_nan_pnl_falls_back() {
        let mut position = Position::new("X", PositionSide::Short, 1.0, 200.0);
        position.pnl_pct = Some(f64::NAN);

        assert!((position.pnl_ratio_or_compute(190.0) - 0.05).abs() < 1e-12);
    }

    #[test]
    fn test_missing_inputs_default_to_zero() {
        let position = Position::new("X", PositionSide::Long, 1.0, 0.0);

        assert_eq!(position.pnl_ratio_or_compute(100.0), 0.0);
        assert_eq!(position.leverage_or_default(), 0.0);
        assert!(!position.is_valid());
    }

    #[test]
    fn test_side_parsing() {
        assert_eq!(PositionSide::parse("Sell"), Some(PositionSide::Short));
        assert_eq!(PositionSide::parse(" long "), Some(PositionSide::Long));
        assert_eq!(PositionSide::parse("both"), None);
        assert_eq!(PositionSide::Long.opposite(), PositionSide::Short);
    }
}
