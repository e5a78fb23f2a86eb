//! Public market data clients.

mod market_client;
mod types;

pub use market_client::{to_contract, MarketClient};
pub use types::*;
