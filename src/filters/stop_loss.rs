//! Stop-loss: close when the loss reaches the configured percentage of margin.

use tracing::{debug, error, warn};

use super::enabled_pct;
use crate::models::{Position, PositionSide};
use crate::trading::TradingConfig;

/// Returns the reason when the stop-loss fires.
///
/// The exchange-reported PNL ratio is authoritative when present. The
/// price threshold is only consulted when that figure is missing.
pub fn evaluate(
    position: Option<&Position>,
    current_price: Option<f64>,
    config: &TradingConfig,
) -> Option<String> {
    let position = position?;
    let price = current_price.filter(|p| p.is_finite() && *p > 0.0)?;
    let sl_pct = enabled_pct(config.stop_loss)?;

    let Some(entry) = position.valid_entry_price() else {
        error!(symbol = %position.symbol, entry = position.entry_price, "Stop-loss skipped: position has no usable entry price");
        return None;
    };

    if let Some(pnl) = position.reported_pnl_ratio() {
        let limit = -(sl_pct / 100.0);
        debug!(pnl, limit, "Stop-loss check (PNL)");
        if pnl <= limit {
            let reason = format!(
                "Stop-loss: PNL {:.2}% <= -{:.2}%",
                pnl * 100.0,
                sl_pct
            );
            warn!(symbol = %position.symbol, "{}", reason);
            return Some(reason);
        }
        return None;
    }

    let (threshold, hit) = match position.side {
        PositionSide::Long => {
            let threshold = entry * (1.0 - sl_pct / 100.0);
            (threshold, price <= threshold)
        }
        PositionSide::Short => {
            let threshold = entry * (1.0 + sl_pct / 100.0);
            (threshold, price >= threshold)
        }
    };
    debug!(price, threshold, side = %position.side, "Stop-loss check (price)");

    if hit {
        let reason = format!(
            "Stop-loss: price {:.4} crossed {:.4} ({} entry {:.4}, -{:.2}%)",
            price, threshold, position.side, entry, sl_pct
        );
        warn!(symbol = %position.symbol, "{}", reason);
        Some(reason)
    } else {
        None
    }
}
