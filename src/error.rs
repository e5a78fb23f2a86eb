//! Classified exchange errors.
//!
//! The loop decides how to react from the variant alone: transient errors wait
//! and retry, critical ones are surfaced to the user, the rest are logged.

use std::time::Duration;

use thiserror::Error;

/// Wait after a network failure before the next iteration.
pub const NETWORK_BACKOFF: Duration = Duration::from_secs(30);

/// Wait after the exchange reports maintenance or overload.
pub const UNAVAILABLE_BACKOFF: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("network error: {0}")]
    Network(String),

    #[error("exchange unavailable: {0}")]
    Unavailable(String),

    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("insufficient funds: {0}")]
    InsufficientFunds(String),

    #[error("invalid order: {0}")]
    InvalidOrder(String),

    #[error("order or position not found: {0}")]
    NotFound(String),

    #[error("unknown symbol: {0}")]
    BadSymbol(String),

    #[error("exchange error: {0}")]
    Other(String),
}

impl ExchangeError {
    /// Worth retrying after a pause.
    pub fn is_transient(&self) -> bool {
        matches!(self, ExchangeError::Network(_) | ExchangeError::Unavailable(_))
    }

    /// Needs a human: retrying will not help and may do harm.
    pub fn is_critical(&self) -> bool {
        matches!(
            self,
            ExchangeError::Authentication(_) | ExchangeError::InsufficientFunds(_)
        )
    }

    /// Fixed wait before the loop tries again.
    pub fn retry_after(&self) -> Duration {
        match self {
            ExchangeError::Unavailable(_) | ExchangeError::Authentication(_) => UNAVAILABLE_BACKOFF,
            _ => NETWORK_BACKOFF,
        }
    }
}

impl From<reqwest::Error> for ExchangeError {
    fn from(e: reqwest::Error) -> Self {
        match e.status() {
            Some(status) if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN => {
                ExchangeError::Authentication(e.to_string())
            }
            Some(status) if status == reqwest::StatusCode::NOT_FOUND => ExchangeError::BadSymbol(e.to_string()),
            Some(status) if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS => {
                ExchangeError::Unavailable(e.to_string())
            }
            Some(_) => ExchangeError::Other(e.to_string()),
            None if e.is_decode() => ExchangeError::Other(e.to_string()),
            None => ExchangeError::Network(e.to_string()),
        }
    }
}

pub type ExchangeResult<T> = std::result::Result<T, ExchangeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(ExchangeError::Network("timeout".into()).is_transient());
        assert!(ExchangeError::Unavailable("maintenance".into()).is_transient());
        assert!(!ExchangeError::InvalidOrder("qty".into()).is_transient());

        assert!(ExchangeError::InsufficientFunds("margin".into()).is_critical());
        assert!(ExchangeError::Authentication("key".into()).is_critical());
        assert!(!ExchangeError::NotFound("order".into()).is_critical());
    }

    #[test]
    fn test_fixed_backoffs() {
        assert_eq!(ExchangeError::Network("x".into()).retry_after(), NETWORK_BACKOFF);
        assert_eq!(ExchangeError::Unavailable("x".into()).retry_after(), UNAVAILABLE_BACKOFF);
    }

    #[test]
    fn test_survives_anyhow_round_trip() {
        let err: anyhow::Error = ExchangeError::InsufficientFunds("close".into()).into();
        let classified = err.downcast_ref::<ExchangeError>().unwrap();
        assert!(classified.is_critical());
    }
}
