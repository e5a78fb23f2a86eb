//! Response types for the Gate.io USDT-settled futures REST API.
//!
//! Gate returns most numbers as JSON strings, some as numbers.

use serde::{Deserialize, Deserializer};

/// Ticker from /futures/usdt/tickers.
#[derive(Debug, Clone, Deserialize)]
pub struct TickerResponse {
    pub contract: String,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub last: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub mark_price: Option<f64>,
}

/// Candle from /futures/usdt/candlesticks.
#[derive(Debug, Clone, Deserialize)]
pub struct CandleResponse {
    /// Open time, unix seconds
    pub t: i64,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub o: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub h: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub l: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub c: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub v: Option<f64>,
}

/// Contract details from /futures/usdt/contracts/{contract}.
#[derive(Debug, Clone, Deserialize)]
pub struct ContractResponse {
    pub name: String,
    /// Base units per contract
    #[serde(default, deserialize_with = "lenient_f64")]
    pub quanto_multiplier: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub order_size_min: Option<f64>,
    #[serde(default)]
    pub in_delisting: bool,
}

/// Error body returned with non-2xx responses.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiErrorResponse {
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub message: String,
}

/// Accept `"1.5"`, `1.5` or `null`. Unparseable strings read as `None`.
fn lenient_f64<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(f64),
        Text(String),
    }

    Ok(match Option::<Raw>::deserialize(deserializer)? {
        Some(Raw::Number(n)) => Some(n),
        Some(Raw::Text(s)) => s.trim().parse::<f64>().ok(),
        None => None,
    }
    .filter(|n| n.is_finite()))
}
