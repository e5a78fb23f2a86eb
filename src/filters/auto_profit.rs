//! Auto-profit (take-profit): close once the gain reaches the configured percentage.

use tracing::{debug, error, info};

use super::enabled_pct;
use crate::models::{Position, PositionSide};
use crate::trading::TradingConfig;

/// Returns the reason when the take-profit fires. Mirrors the stop-loss with
/// the sign reversed.
pub fn evaluate(
    position: Option<&Position>,
    current_price: Option<f64>,
    config: &TradingConfig,
) -> Option<String> {
    let position = position?;
    let price = current_price.filter(|p| p.is_finite() && *p > 0.0)?;
    let tp_pct = enabled_pct(config.auto_profit)?;

    let Some(entry) = position.valid_entry_price() else {
        error!(symbol = %position.symbol, entry = position.entry_price, "Auto-profit skipped: position has no usable entry price");
        return None;
    };

    if let Some(pnl) = position.reported_pnl_ratio() {
        let goal = tp_pct / 100.0;
        debug!(pnl, goal, "Auto-profit check (PNL)");
        if pnl >= goal {
            let reason = format!("Auto-profit: PNL {:.2}% >= {:.2}%", pnl * 100.0, tp_pct);
            info!(symbol = %position.symbol, "{}", reason);
            return Some(reason);
        }
        return None;
    }

    let (threshold, hit) = match position.side {
        PositionSide::Long => {
            let threshold = entry * (1.0 + tp_pct / 100.0);
            (threshold, price >= threshold)
        }
        PositionSide::Short => {
            let threshold = entry * (1.0 - tp_pct / 100.0);
            (threshold, price <= threshold)
        }
    };
    debug!(price, threshold, side = %position.side, "Auto-profit check (price)");

    if hit {
        let reason = format!(
            "Auto-profit: price {:.4} reached {:.4} ({} entry {:.4}, +{:.2}%)",
            price, threshold, position.side, entry, tp_pct
        );
        info!(symbol = %position.symbol, "{}", reason);
        Some(reason)
    } else {
        None
    }
}
