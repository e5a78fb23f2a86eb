//! Trading configuration and order sizing.

mod config;
mod position_sizer;

pub use config::{spawn_reloader, SharedConfig, TradingConfig};
pub use position_sizer::{compute_order_size, MarketInfo};
