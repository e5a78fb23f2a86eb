//! Trade history statistics.

mod calculator;

pub use calculator::HistoryStats;
