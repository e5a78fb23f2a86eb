//! Entry and inversion strategies.
//!
//! A strategy is a pure function of the indicator-augmented series, the open
//! position (if any) and the configuration. The registry keeps them by name in
//! registration order and reserves one slot for a user-supplied rule file.

mod builtin;
mod custom;

pub use builtin::{BmsbInvert, EmaCross, EmaPullback, RsiCross, RsiLevels};
pub use custom::{load_custom_strategy, CustomStrategyError, RuleStrategy};

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use tracing::error;

use crate::models::{Position, Series};
use crate::trading::TradingConfig;

/// Registry name reserved for the user-supplied strategy.
pub const CUSTOM_STRATEGY_NAME: &str = "custom";

/// What a strategy asks the orchestrator to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalAction {
    Long,
    Short,
    /// Close the open position and open the opposite side
    Invert,
}

impl SignalAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalAction::Long => "long",
            SignalAction::Short => "short",
            SignalAction::Invert => "invert",
        }
    }
}

/// Transient strategy output; `None` at the call site means "no signal".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signal {
    pub action: SignalAction,
    pub reason: String,
}

impl Signal {
    pub fn new(action: SignalAction, reason: impl Into<String>) -> Self {
        Self {
            action,
            reason: reason.into(),
        }
    }

    pub fn long(reason: impl Into<String>) -> Self {
        Self::new(SignalAction::Long, reason)
    }

    pub fn short(reason: impl Into<String>) -> Self {
        Self::new(SignalAction::Short, reason)
    }

    pub fn invert(reason: impl Into<String>) -> Self {
        Self::new(SignalAction::Invert, reason)
    }
}

/// Entry/inversion rule.
pub trait Strategy: Send + Sync {
    fn evaluate(&self, series: &Series, position: Option<&Position>, config: &TradingConfig) -> Option<Signal>;
}

/// Adapter so plain functions and closures can be registered.
pub struct FnStrategy<F>(pub F);

impl<F> Strategy for FnStrategy<F>
where
    F: Fn(&Series, Option<&Position>, &TradingConfig) -> Option<Signal> + Send + Sync,
{
    fn evaluate(&self, series: &Series, position: Option<&Position>, config: &TradingConfig) -> Option<Signal> {
        (self.0)(series, position, config)
    }
}

/// Named strategies in registration order.
#[derive(Clone, Default)]
pub struct StrategyRegistry {
    entries: Vec<(String, Arc<dyn Strategy>)>,
}

impl StrategyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in strategy.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("rsi", RsiCross);
        registry.register("ema", EmaPullback);
        registry.register("bmsb_invert", BmsbInvert);
        registry.register("rsi_original", RsiLevels);
        registry.register("ema_cross", EmaCross);
        registry
    }

    /// Add a strategy, replacing one of the same name in place.
    pub fn register(&mut self, name: &str, strategy: impl Strategy + 'static) {
        self.register_arc(name, Arc::new(strategy));
    }

    pub fn register_arc(&mut self, name: &str, strategy: Arc<dyn Strategy>) {
        match self.entries.iter_mut().find(|(n, _)| n == name) {
            Some(entry) => entry.1 = strategy,
            None => self.entries.push((name.to_string(), strategy)),
        }
    }

    pub fn register_fn<F>(&mut self, name: &str, f: F)
    where
        F: Fn(&Series, Option<&Position>, &TradingConfig) -> Option<Signal> + Send + Sync + 'static,
    {
        self.register(name, FnStrategy(f));
    }

    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(n, _)| n != name);
        self.entries.len() != before
    }

    /// Install or clear the user-supplied strategy slot.
    pub fn set_custom(&mut self, strategy: Option<Arc<dyn Strategy>>) {
        match strategy {
            Some(strategy) => self.register_arc(CUSTOM_STRATEGY_NAME, strategy),
            None => {
                self.remove(CUSTOM_STRATEGY_NAME);
            }
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.iter().any(|(n, _)| n == name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.entries.iter().map(|(n, _)| n.as_str()).collect()
    }

    /// Names in `enabled` that nothing is registered under.
    pub fn unknown<'a>(&self, enabled: &'a [String]) -> Vec<&'a str> {
        enabled
            .iter()
            .filter(|name| !self.contains(name))
            .map(String::as_str)
            .collect()
    }

    /// Strategies named in `enabled`, in registration order. Unknown names
    /// are skipped.
    pub fn enabled(&self, enabled: &[String]) -> Vec<(&str, &dyn Strategy)> {
        self.entries
            .iter()
            .filter(|(name, _)| enabled.iter().any(|e| e == name))
            .map(|(name, strategy)| (name.as_str(), strategy.as_ref()))
            .collect()
    }
}

/// Run a strategy so that a panic inside it reads as "no signal" instead of
/// taking the loop down.
pub fn evaluate_isolated(
    name: &str,
    strategy: &dyn Strategy,
    series: &Series,
    position: Option<&Position>,
    config: &TradingConfig,
) -> Option<Signal> {
    match catch_unwind(AssertUnwindSafe(|| strategy.evaluate(series, position, config))) {
        Ok(signal) => signal,
        Err(_) => {
            error!(strategy = %name, "Strategy panicked, treating as no signal");
            None
        }
    }
}
