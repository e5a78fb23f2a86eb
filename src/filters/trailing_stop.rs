//! Trailing stop state machine.
//!
//! Arms once PNL reaches the trigger, then tracks the best PNL seen. The exit
//! target is the peak scaled by the distance percentage (`peak * distance/100`),
//! so a distance of 50 keeps half of the peak gain. This is a multiplier on the
//! peak, not an offset below it, and the band narrows as the peak shrinks.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::enabled_pct;
use crate::models::Position;
use crate::trading::TradingConfig;

/// Per-symbol trailing stop state.
///
/// Inactive implies `peak_pnl_pct == 0.0` and `target_pnl_pct == -inf`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrailingStopState {
    /// Whether trailing protection is armed
    pub active: bool,

    /// Highest PNL ratio seen since arming
    pub peak_pnl_pct: f64,

    /// PNL ratio at or below which the position closes; `-inf` never triggers
    #[serde(with = "neg_inf_as_null")]
    pub target_pnl_pct: f64,
}

impl Default for TrailingStopState {
    fn default() -> Self {
        Self {
            active: false,
            peak_pnl_pct: 0.0,
            target_pnl_pct: f64::NEG_INFINITY,
        }
    }
}

impl TrailingStopState {
    /// Whether this is exactly the reset state.
    pub fn is_reset(&self) -> bool {
        *self == Self::default()
    }

    /// Inactive records must carry the reset values; anything else is repaired.
    pub fn normalized(self) -> Self {
        if self.active && self.peak_pnl_pct.is_finite() && !self.target_pnl_pct.is_nan() {
            self
        } else {
            Self::default()
        }
    }

    fn armed(peak: f64, keep_ratio: f64) -> Self {
        Self {
            active: true,
            peak_pnl_pct: peak,
            target_pnl_pct: peak * keep_ratio,
        }
    }
}

/// `-inf` has no JSON representation; it is stored as `null`.
mod neg_inf_as_null {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        if value.is_finite() {
            serializer.serialize_f64(*value)
        } else {
            serializer.serialize_none()
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        Ok(Option::<f64>::deserialize(deserializer)?.unwrap_or(f64::NEG_INFINITY))
    }
}

/// Result of one trailing stop evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct TrailingStopOutcome {
    /// State to carry into the next iteration
    pub state: TrailingStopState,

    /// Close the position now
    pub should_close: bool,

    /// What happened, for logs and trade history
    pub reason: String,
}

impl TrailingStopOutcome {
    fn reset(reason: String) -> Self {
        Self {
            state: TrailingStopState::default(),
            should_close: false,
            reason,
        }
    }

    fn keep(state: TrailingStopState, reason: String) -> Self {
        Self {
            state,
            should_close: false,
            reason,
        }
    }
}

/// Advance the trailing stop by one observation.
///
/// PNL comes from the position's reported ratio when available, otherwise
/// from side, entry and `current_price`, and 0.0 if neither works.
pub fn evaluate(
    position: Option<&Position>,
    current_price: Option<f64>,
    state: &TrailingStopState,
    config: &TradingConfig,
) -> TrailingStopOutcome {
    let price = current_price.filter(|p| p.is_finite() && *p > 0.0);
    let (Some(position), Some(price)) = (position, price) else {
        let reason = if state.active {
            "Trailing stop reset: no position or price".to_string()
        } else {
            "Trailing stop idle: no position or price".to_string()
        };
        return TrailingStopOutcome::reset(reason);
    };

    let (Some(trigger_pct), Some(distance_pct)) = (
        enabled_pct(config.trailing_trigger),
        enabled_pct(config.trailing_stop),
    ) else {
        if state.active {
            warn!(symbol = %position.symbol, "Trailing stop disarmed: trigger or distance not configured");
        }
        return TrailingStopOutcome::reset("Trailing stop disabled: trigger or distance not set".to_string());
    };

    let pnl = position.pnl_ratio_or_compute(price);
    let trigger = trigger_pct / 100.0;
    let keep_ratio = distance_pct / 100.0;

    let mut next = *state;
    let mut reason = None;

    if !next.active && pnl >= trigger {
        next = TrailingStopState::armed(pnl, keep_ratio);
        let msg = format!(
            "Trailing stop armed: PNL {:.2}% >= trigger {:.2}%, target {:.2}%",
            pnl * 100.0,
            trigger_pct,
            next.target_pnl_pct * 100.0
        );
        info!(symbol = %position.symbol, "{}", msg);
        reason = Some(msg);
    }

    if !next.active {
        let msg = format!(
            "Trailing stop waiting: PNL {:.2}% below trigger {:.2}%",
            pnl * 100.0,
            trigger_pct
        );
        debug!(symbol = %position.symbol, "{}", msg);
        return TrailingStopOutcome::keep(next, msg);
    }

    if pnl > next.peak_pnl_pct {
        next = TrailingStopState::armed(pnl, keep_ratio);
        let msg = format!(
            "Trailing stop new peak {:.2}%, target {:.2}%",
            pnl * 100.0,
            next.target_pnl_pct * 100.0
        );
        info!(symbol = %position.symbol, "{}", msg);
        return TrailingStopOutcome::keep(next, msg);
    }

    if pnl <= next.target_pnl_pct {
        let msg = format!(
            "Trailing stop hit: PNL {:.2}% <= target {:.2}% (peak {:.2}%)",
            pnl * 100.0,
            next.target_pnl_pct * 100.0,
            next.peak_pnl_pct * 100.0
        );
        warn!(symbol = %position.symbol, "{}", msg);
        return TrailingStopOutcome {
            state: TrailingStopState::default(),
            should_close: true,
            reason: msg,
        };
    }

    let msg = reason.unwrap_or_else(|| {
        format!(
            "Trailing stop holding: PNL {:.2}% between target {:.2}% and peak {:.2}%",
            pnl * 100.0,
            next.target_pnl_pct * 100.0,
            next.peak_pnl_pct * 100.0
        )
    });
    debug!(symbol = %position.symbol, "{}", msg);
    TrailingStopOutcome::keep(next, msg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PositionSide;

    fn config(trigger: Option<f64>, distance: Option<f64>) -> TradingConfig {
        TradingConfig {
            trailing_trigger: trigger,
            trailing_stop: distance,
            ..Default::default()
        }
    }

    fn long_with_pnl(pnl: f64) -> Position {
        let mut position = Position::new("BTC/USDT:USDT", PositionSide::Long, 1.0, 100.0);
        position.pnl_pct = Some(pnl);
        position
    }

    fn step(state: &TrailingStopState, pnl: f64, config: &TradingConfig) -> TrailingStopOutcome {
        evaluate(Some(&long_with_pnl(pnl)), Some(100.0), state, config)
    }

    #[test]
    fn test_multiplicative_target_sequence() {
        let config = config(Some(5.0), Some(50.0));
        let state = TrailingStopState::default();

        let out = step(&state, 0.0, &config);
        assert!(!out.should_close);
        assert!(out.state.is_reset());

        let out = step(&out.state, 0.06, &config);
        assert!(!out.should_close);
        assert!(out.state.active);
        assert_eq!(out.state.peak_pnl_pct, 0.06);
        assert_eq!(out.state.target_pnl_pct, 0.03);

        let out = step(&out.state, 0.09, &config);
        assert!(!out.should_close);
        assert_eq!(out.state.peak_pnl_pct, 0.09);
        assert_eq!(out.state.target_pnl_pct, 0.045);

        let out = step(&out.state, 0.04, &config);
        assert!(out.should_close);
        assert!(out.state.is_reset());
        assert_eq!(out.state.target_pnl_pct, f64::NEG_INFINITY);
    }

    #[test]
    fn test_hold_between_target_and_peak_is_idempotent() {
        let config = config(Some(5.0), Some(50.0));
        let armed = step(&TrailingStopState::default(), 0.10, &config).state;

        let mut state = armed;
        for pnl in [0.10, 0.09, 0.08, 0.08, 0.051] {
            let out = step(&state, pnl, &config);
            assert!(!out.should_close);
            assert_eq!(out.state, armed);
            state = out.state;
        }
    }

    #[test]
    fn test_below_trigger_leaves_state_untouched() {
        let config = config(Some(5.0), Some(50.0));
        let out = step(&TrailingStopState::default(), 0.049, &config);

        assert!(!out.should_close);
        assert_eq!(out.state, TrailingStopState::default());
        assert!(out.reason.contains("waiting"));
    }

    #[test]
    fn test_missing_position_resets() {
        let config = config(Some(5.0), Some(50.0));
        let armed = step(&TrailingStopState::default(), 0.2, &config).state;
        assert!(armed.active);

        let out = evaluate(None, Some(100.0), &armed, &config);
        assert!(!out.should_close);
        assert!(out.state.is_reset());

        let out = evaluate(Some(&long_with_pnl(0.2)), None, &armed, &config);
        assert!(out.state.is_reset());
    }

    #[test]
    fn test_disabled_config_resets() {
        let armed = step(&TrailingStopState::default(), 0.2, &config(Some(5.0), Some(50.0))).state;

        for disabled in [
            config(None, Some(50.0)),
            config(Some(5.0), Some(0.0)),
            config(Some(0.0005), Some(50.0)),
        ] {
            let out = step(&armed, 0.3, &disabled);
            assert!(!out.should_close);
            assert!(out.state.is_reset());
        }
    }

    #[test]
    fn test_arm_and_close_in_one_step() {
        // distance >= 100 puts the target at or above the peak
        let config = config(Some(5.0), Some(100.0));
        let out = step(&TrailingStopState::default(), 0.07, &config);

        assert!(out.should_close);
        assert!(out.state.is_reset());
    }

    #[test]
    fn test_price_fallback_for_short() {
        let config = config(Some(5.0), Some(50.0));
        let short = Position::new("X", PositionSide::Short, 1.0, 100.0);

        // price down 10% on a short is +10%
        let out = evaluate(Some(&short), Some(90.0), &TrailingStopState::default(), &config);
        assert!(out.state.active);
        assert!((out.state.peak_pnl_pct - 0.1).abs() < 1e-12);
    }

    #[test]
    fn test_state_json_uses_null_for_no_target() {
        let json = serde_json::to_string(&TrailingStopState::default()).unwrap();
        assert_eq!(json, r#"{"active":false,"peak_pnl_pct":0.0,"target_pnl_pct":null}"#);

        let state: TrailingStopState = serde_json::from_str(&json).unwrap();
        assert!(state.is_reset());

        let armed = TrailingStopState {
            active: true,
            peak_pnl_pct: 0.09,
            target_pnl_pct: 0.045,
        };
        let restored: TrailingStopState =
            serde_json::from_str(&serde_json::to_string(&armed).unwrap()).unwrap();
        assert_eq!(restored, armed);
    }

    #[test]
    fn test_normalized_repairs_inconsistent_records() {
        let broken = TrailingStopState {
            active: false,
            peak_pnl_pct: 0.3,
            target_pnl_pct: 0.1,
        };
        assert!(broken.normalized().is_reset());

        let armed = TrailingStopState {
            active: true,
            peak_pnl_pct: 0.3,
            target_pnl_pct: 0.1,
        };
        assert_eq!(armed.normalized(), armed);
    }
}
