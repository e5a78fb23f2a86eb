//! User-supplied strategy loaded from a declarative JSON rule file.
//!
//! ```json
//! {
//!   "name": "fast-cross",
//!   "long":  { "all": [ { "left": "ema_fast", "op": "crosses_above", "right": "ema_slow" } ] },
//!   "short": { "all": [ { "left": "ema_fast", "op": "crosses_below", "right": "ema_slow" } ] },
//!   "invert_long": { "all": [ { "left": "rsi", "op": "gt", "right": 80 } ] }
//! }
//! ```
//!
//! `long`/`short` are entry rules (no open position). `invert_long` fires while
//! holding a long, `invert_short` while holding a short. Operands are column
//! names or numbers. A file that fails to parse or validate is not loaded.

use std::path::Path;

use serde::Deserialize;
use thiserror::Error;
use tracing::{info, warn};

use super::{Signal, Strategy};
use crate::models::{columns, Position, PositionSide, Series};
use crate::trading::TradingConfig;

#[derive(Debug, Error)]
pub enum CustomStrategyError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid rule file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("rule file defines no rules")]
    Empty,

    #[error("rule set '{0}' has no conditions")]
    EmptyRuleSet(&'static str),

    #[error("unknown column '{column}' in rule set '{rule_set}'")]
    UnknownColumn { rule_set: &'static str, column: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparison {
    Gt,
    Ge,
    Lt,
    Le,
    CrossesAbove,
    CrossesBelow,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum Operand {
    Value(f64),
    Column(String),
}

impl Operand {
    fn at(&self, series: &Series, back: usize) -> Option<f64> {
        match self {
            Operand::Value(v) => Some(*v),
            Operand::Column(name) => series.value(name, back),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Condition {
    pub left: Operand,
    pub op: Comparison,
    pub right: Operand,
}

impl Condition {
    /// Undefined operands never match.
    fn holds(&self, series: &Series) -> bool {
        let (Some(left), Some(right)) = (self.left.at(series, 0), self.right.at(series, 0)) else {
            return false;
        };
        match self.op {
            Comparison::Gt => left > right,
            Comparison::Ge => left >= right,
            Comparison::Lt => left < right,
            Comparison::Le => left <= right,
            Comparison::CrossesAbove | Comparison::CrossesBelow => {
                let (Some(left_prev), Some(right_prev)) = (self.left.at(series, 1), self.right.at(series, 1)) else {
                    return false;
                };
                if self.op == Comparison::CrossesAbove {
                    left_prev <= right_prev && left > right
                } else {
                    left_prev >= right_prev && left < right
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RuleSet {
    pub all: Vec<Condition>,
}

impl RuleSet {
    fn matches(&self, series: &Series) -> bool {
        self.all.iter().all(|c| c.holds(series))
    }
}

/// Strategy assembled from a validated rule file.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RuleStrategy {
    #[serde(default = "default_name")]
    pub name: String,
    pub long: Option<RuleSet>,
    pub short: Option<RuleSet>,
    pub invert_long: Option<RuleSet>,
    pub invert_short: Option<RuleSet>,
}

fn default_name() -> String {
    "custom".to_string()
}

impl RuleStrategy {
    pub fn from_json(json: &str) -> Result<Self, CustomStrategyError> {
        let strategy: Self = serde_json::from_str(json)?;
        strategy.validate()?;
        Ok(strategy)
    }

    fn rule_sets(&self) -> [(&'static str, Option<&RuleSet>); 4] {
        [
            ("long", self.long.as_ref()),
            ("short", self.short.as_ref()),
            ("invert_long", self.invert_long.as_ref()),
            ("invert_short", self.invert_short.as_ref()),
        ]
    }

    fn validate(&self) -> Result<(), CustomStrategyError> {
        let mut any = false;
        for (rule_set, rules) in self.rule_sets() {
            let Some(rules) = rules else { continue };
            any = true;
            if rules.all.is_empty() {
                return Err(CustomStrategyError::EmptyRuleSet(rule_set));
            }
            for condition in &rules.all {
                for operand in [&condition.left, &condition.right] {
                    if let Operand::Column(column) = operand {
                        if !columns::ALL.contains(&column.as_str()) {
                            return Err(CustomStrategyError::UnknownColumn {
                                rule_set,
                                column: column.clone(),
                            });
                        }
                    }
                }
            }
        }
        if any {
            Ok(())
        } else {
            Err(CustomStrategyError::Empty)
        }
    }
}

impl Strategy for RuleStrategy {
    fn evaluate(&self, series: &Series, position: Option<&Position>, _config: &TradingConfig) -> Option<Signal> {
        let hit = |rules: &Option<RuleSet>| rules.as_ref().is_some_and(|r| r.matches(series));

        match position.map(|p| p.side) {
            None if hit(&self.long) => Some(Signal::long(format!("{}: long rules matched", self.name))),
            None if hit(&self.short) => Some(Signal::short(format!("{}: short rules matched", self.name))),
            Some(PositionSide::Long) if hit(&self.invert_long) => {
                Some(Signal::invert(format!("{}: invert long rules matched", self.name)))
            }
            Some(PositionSide::Short) if hit(&self.invert_short) => {
                Some(Signal::invert(format!("{}: invert short rules matched", self.name)))
            }
            _ => None,
        }
    }
}

fn read_rules(path: &Path) -> Result<RuleStrategy, CustomStrategyError> {
    let json = std::fs::read_to_string(path).map_err(|source| CustomStrategyError::Io {
        path: path.display().to_string(),
        source,
    })?;
    RuleStrategy::from_json(&json)
}

/// Load the user strategy. Missing or broken files yield `None`.
pub fn load_custom_strategy(path: &Path) -> Option<RuleStrategy> {
    if !path.exists() {
        info!(path = %path.display(), "No custom strategy file");
        return None;
    }
    match read_rules(path) {
        Ok(strategy) => {
            info!(name = %strategy.name, "Custom strategy loaded");
            Some(strategy)
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Custom strategy not loaded");
            None
        }
    }
}
