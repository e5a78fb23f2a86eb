//! Gate.io public futures API client for prices, candles and contract specs.

use std::time::Duration;

use async_trait::async_trait;
use backoff::{future::retry, ExponentialBackoff};
use chrono::{TimeZone, Utc};
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::error::{ExchangeError, ExchangeResult};
use crate::exchange::MarketFeed;
use crate::models::Candle;
use crate::trading::MarketInfo;

use super::types::*;

const GATE_API_BASE: &str = "https://api.gateio.ws/api/v4";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Gate caps candlestick requests at this many bars.
const MAX_CANDLES: usize = 2000;

/// Give up retrying transient failures after this long.
const MAX_RETRY_ELAPSED: Duration = Duration::from_secs(20);

/// Convert a unified symbol (`BTC/USDT:USDT`) to a Gate contract (`BTC_USDT`).
/// Symbols already in contract form pass through.
pub fn to_contract(symbol: &str) -> String {
    let pair = symbol.split(':').next().unwrap_or(symbol);
    pair.replace('/', "_").to_uppercase()
}

/// Client for the read-only Gate.io futures endpoints.
pub struct MarketClient {
    client: Client,
    base_url: String,
}

impl MarketClient {
    pub fn new() -> anyhow::Result<Self> {
        Self::with_base_url(GATE_API_BASE.to_string())
    }

    /// Create with custom base URL (for testing).
    pub fn with_base_url(base_url: String) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to create HTTP client: {e}"))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// GET `path` and decode JSON, retrying network and overload failures.
    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> ExchangeResult<T> {
        let url = format!("{}{}", self.base_url, path);
        debug!(url = %url, "Fetching");

        let policy = ExponentialBackoff {
            initial_interval: Duration::from_millis(500),
            max_interval: Duration::from_secs(5),
            max_elapsed_time: Some(MAX_RETRY_ELAPSED),
            ..Default::default()
        };

        retry(policy, || async {
            match self.get_once(&url).await {
                Ok(value) => Ok(value),
                Err(e) if e.is_transient() => {
                    warn!(url = %url, error = %e, "Retryable market data error");
                    Err(backoff::Error::transient(e))
                }
                Err(e) => Err(backoff::Error::permanent(e)),
            }
        })
        .await
    }

    async fn get_once<T: DeserializeOwned>(&self, url: &str) -> ExchangeResult<T> {
        let response = self.client.get(url).send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &body));
        }

        response.json().await.map_err(ExchangeError::from)
    }

    pub async fn ticker(&self, symbol: &str) -> ExchangeResult<Option<TickerResponse>> {
        let contract = to_contract(symbol);
        let tickers: Vec<TickerResponse> = self
            .get_json(&format!("/futures/usdt/tickers?contract={}", contract))
            .await?;
        Ok(tickers.into_iter().find(|t| t.contract == contract))
    }

    pub async fn candlesticks(&self, symbol: &str, timeframe: &str, limit: usize) -> ExchangeResult<Vec<Candle>> {
        let limit = limit.clamp(1, MAX_CANDLES);
        let items: Vec<CandleResponse> = self
            .get_json(&format!(
                "/futures/usdt/candlesticks?contract={}&interval={}&limit={}",
                to_contract(symbol),
                timeframe,
                limit
            ))
            .await?;

        Ok(items.into_iter().filter_map(to_candle).collect())
    }

    pub async fn contract(&self, symbol: &str) -> ExchangeResult<ContractResponse> {
        self.get_json(&format!("/futures/usdt/contracts/{}", to_contract(symbol)))
            .await
    }
}

/// Map an HTTP failure to the error class the loop reacts to.
fn classify_status(status: StatusCode, body: &str) -> ExchangeError {
    let detail = match serde_json::from_str::<ApiErrorResponse>(body) {
        Ok(api) if !api.label.is_empty() => format!("{} {}: {}", status, api.label, api.message),
        _ => format!("{} - {}", status, body),
    };

    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        ExchangeError::Authentication(detail)
    } else if status == StatusCode::NOT_FOUND || body.contains("CONTRACT_NOT_FOUND") {
        ExchangeError::BadSymbol(detail)
    } else if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        ExchangeError::Unavailable(detail)
    } else {
        ExchangeError::Other(detail)
    }
}

/// Bars with any missing price are dropped.
fn to_candle(item: CandleResponse) -> Option<Candle> {
    Some(Candle {
        timestamp: Utc.timestamp_opt(item.t, 0).single()?,
        open: item.o?,
        high: item.h?,
        low: item.l?,
        close: item.c?,
        volume: item.v.unwrap_or(0.0),
    })
}

#[async_trait]
impl MarketFeed for MarketClient {
    async fn last_price(&self, symbol: &str) -> ExchangeResult<Option<f64>> {
        let ticker = self.ticker(symbol).await?;
        Ok(ticker.and_then(|t| t.last.or(t.mark_price)).filter(|p| *p > 0.0))
    }

    async fn candles(&self, symbol: &str, timeframe: &str, limit: usize) -> ExchangeResult<Vec<Candle>> {
        self.candlesticks(symbol, timeframe, limit).await
    }

    async fn market_info(&self, symbol: &str) -> ExchangeResult<MarketInfo> {
        let contract = self.contract(symbol).await?;
        if contract.in_delisting {
            warn!(contract = %contract.name, "Contract is being delisted");
        }

        let defaults = MarketInfo::default();
        Ok(MarketInfo {
            contract_size: contract
                .quanto_multiplier
                .filter(|v| *v > 0.0)
                .unwrap_or(defaults.contract_size),
            min_qty: contract
                .order_size_min
                .filter(|v| *v > 0.0)
                .unwrap_or(defaults.min_qty),
        })
    }
}
