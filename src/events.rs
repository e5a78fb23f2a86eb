//! One-way notifications from the trading loop to whoever is listening.
//!
//! The loop never waits on a consumer: sends go into an unbounded channel and
//! a missing or closed receiver is ignored.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use crate::filters::TrailingStopState;
use crate::models::{Position, Series, TradeRecord};

/// Severity attached to user-facing log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LogLine {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
}

/// Account view published once per iteration.
#[derive(Debug, Clone, PartialEq)]
pub struct AccountSnapshot {
    pub symbol: String,
    pub balance: f64,
    pub position: Option<Position>,
    pub rsi: Option<f64>,
    pub ema_fast: Option<f64>,
    pub ema_slow: Option<f64>,
    pub trailing: TrailingStopState,
}

#[derive(Debug, Clone)]
pub enum BotEvent {
    Price { symbol: String, price: f64 },
    Candles(Arc<Series>),
    Snapshot(AccountSnapshot),
    Log(LogLine),
    /// One executed open or close
    Trade(TradeRecord),
    /// Needs a human: bad credentials, margin problems on close
    Critical { title: String, message: String },
}

/// Fire-and-forget sender handed to the loop.
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    tx: Option<mpsc::UnboundedSender<BotEvent>>,
}

impl EventSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<BotEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// Sink that drops everything.
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn emit(&self, event: BotEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(event);
        }
    }

    pub fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.emit(BotEvent::Log(LogLine {
            timestamp: Utc::now(),
            level,
            message: message.into(),
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_and_closed_receiver() {
        let (sink, mut rx) = EventSink::channel();
        sink.emit(BotEvent::Price {
            symbol: "X".into(),
            price: 1.0,
        });
        sink.log(LogLevel::Warn, "careful");

        assert!(matches!(rx.recv().await, Some(BotEvent::Price { price, .. }) if price == 1.0));
        assert!(matches!(rx.recv().await, Some(BotEvent::Log(line)) if line.level == LogLevel::Warn));

        drop(rx);
        // no receiver left: must not panic
        sink.emit(BotEvent::Critical {
            title: "t".into(),
            message: "m".into(),
        });
        EventSink::disabled().log(LogLevel::Info, "ignored");
    }
}
