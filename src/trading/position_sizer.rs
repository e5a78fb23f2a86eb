//! Order sizing: margin fraction of the balance, levered, expressed in contracts.

use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

/// Contract quantities are truncated to this many decimals.
pub const QUANTITY_DECIMALS: u32 = 3;

/// Exchange limits that shape an order quantity.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MarketInfo {
    /// Base units per contract
    pub contract_size: f64,

    /// Smallest accepted quantity in contracts
    pub min_qty: f64,
}

impl Default for MarketInfo {
    fn default() -> Self {
        Self {
            contract_size: 1.0,
            min_qty: 0.001,
        }
    }
}

/// Quantity in contracts for a new position.
///
/// `balance * trade_pct/100` is committed as margin, multiplied by `leverage`
/// for the notional, and divided by the value of one contract. The result is
/// truncated (never rounded up) to [`QUANTITY_DECIMALS`]. Returns 0.0 when
/// any input is non-positive or the quantity is below `min_qty`.
pub fn compute_order_size(
    balance: f64,
    trade_pct: f64,
    leverage: f64,
    price: f64,
    contract_size: f64,
    min_qty: f64,
) -> f64 {
    let inputs = [balance, trade_pct, leverage, price];
    if inputs.iter().any(|v| !v.is_finite() || *v <= 0.0) {
        return 0.0;
    }
    let contract_size = if contract_size.is_finite() && contract_size > 0.0 {
        contract_size
    } else {
        1.0
    };

    let decimal = |v: f64| Decimal::from_f64(v).unwrap_or(Decimal::ZERO);
    let margin = decimal(balance) * decimal(trade_pct) / Decimal::ONE_HUNDRED;
    let notional = margin * decimal(leverage);
    let per_contract = decimal(price) * decimal(contract_size);
    if per_contract <= Decimal::ZERO {
        return 0.0;
    }

    let raw = notional / per_contract;
    let qty = raw.round_dp_with_strategy(QUANTITY_DECIMALS, RoundingStrategy::ToZero);
    let qty = qty.to_f64().unwrap_or(0.0);

    if qty <= 0.0 || qty < min_qty {
        0.0
    } else {
        qty
    }
}
