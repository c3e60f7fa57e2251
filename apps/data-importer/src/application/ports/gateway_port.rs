//! Gateway Port (Driven Port)
//!
//! Interface to the market data provider.
//!
//! Fetches never return `Err`. A failed call yields a default value with
//! `failed` set, and the adapter publishes an `ItemFailure` naming the
//! affected symbol code(s) on its own notification hub.

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::application::services::notifications::NotificationHub;
use crate::domain::market_data::{
    Dividend, EarningsEvent, Exchange, IpoEvent, OptionChain, PriceBar, Split, TrendEvent,
};
use crate::domain::symbol::Symbol;

/// Provider-level failure, carried inside `ItemFailure` notifications.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GatewayError {
    /// Missing or rejected API token (401/403).
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Unknown ticker or exchange (404).
    #[error("not found: {0}")]
    NotFound(String),

    /// Provider throttled the request (429).
    #[error("rate limited by provider")]
    RateLimited {
        /// Seconds from `Retry-After`, if sent.
        retry_after_secs: Option<u64>,
    },

    /// Any other non-success status.
    #[error("provider returned {status}: {message}")]
    Server {
        /// HTTP status code.
        status: u16,
        /// Response body or reason.
        message: String,
    },

    /// Connection, TLS or timeout failure.
    #[error("network error: {0}")]
    Network(String),

    /// Response body could not be decoded.
    #[error("invalid response: {0}")]
    Decode(String),

    /// The caller cancelled the request.
    #[error("request cancelled")]
    Cancelled,
}

impl GatewayError {
    /// Whether the error is transient and worth another attempt.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Network(_) | Self::RateLimited { .. } => true,
            Self::Server { status, .. } => *status == 408 || *status >= 500,
            Self::Unauthorized(_) | Self::NotFound(_) | Self::Decode(_) | Self::Cancelled => false,
        }
    }
}

/// Result of one provider fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fetched<T> {
    /// Fetched data, or a default value when `failed`.
    pub data: T,
    /// Usage actually charged by the provider for this fetch.
    pub cost: u32,
    /// Whether the fetch failed and `data` is a substitute.
    pub failed: bool,
}

impl<T> Fetched<T> {
    /// Successful fetch.
    #[must_use]
    pub const fn ok(data: T, cost: u32) -> Self {
        Self {
            data,
            cost,
            failed: false,
        }
    }

    /// Whether real data came back.
    #[must_use]
    pub const fn succeeded(&self) -> bool {
        !self.failed
    }
}

impl<T: Default> Fetched<T> {
    /// Failed fetch with a default value.
    #[must_use]
    pub fn failed(cost: u32) -> Self {
        Self {
            data: T::default(),
            cost,
            failed: true,
        }
    }
}

/// Port for the market data provider.
#[async_trait]
pub trait GatewayPort: Send + Sync {
    /// Hub on which the adapter publishes `ItemFailure` and `Progress`.
    fn notifications(&self) -> &NotificationHub;

    /// List all exchanges.
    async fn fetch_exchange_list(&self, cancel: &CancellationToken) -> Fetched<Vec<Exchange>>;

    /// List all symbols on an exchange.
    async fn fetch_symbol_list(
        &self,
        exchange: &str,
        cancel: &CancellationToken,
    ) -> Fetched<Vec<Symbol>>;

    /// Split history for one symbol.
    async fn fetch_splits(&self, symbol: &Symbol, cancel: &CancellationToken)
    -> Fetched<Vec<Split>>;

    /// Dividend history for one symbol.
    async fn fetch_dividends(
        &self,
        symbol: &Symbol,
        cancel: &CancellationToken,
    ) -> Fetched<Vec<Dividend>>;

    /// End-of-day prices for one symbol.
    async fn fetch_prices(
        &self,
        symbol: &Symbol,
        cancel: &CancellationToken,
    ) -> Fetched<Vec<PriceBar>>;

    /// Option chain for one symbol.
    async fn fetch_options(&self, symbol: &Symbol, cancel: &CancellationToken)
    -> Fetched<OptionChain>;

    /// Earnings calendar.
    async fn fetch_earnings(&self, cancel: &CancellationToken) -> Fetched<Vec<EarningsEvent>>;

    /// IPO calendar.
    async fn fetch_ipos(&self, cancel: &CancellationToken) -> Fetched<Vec<IpoEvent>>;

    /// Estimate trends for `tickers` (`CODE.EX`), in one call.
    ///
    /// A failure names the bare codes of every requested ticker.
    async fn fetch_trends(
        &self,
        tickers: &[String],
        cancel: &CancellationToken,
    ) -> Fetched<Vec<TrendEvent>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(GatewayError::Network("reset".into()), true)]
    #[test_case(GatewayError::RateLimited { retry_after_secs: None }, true)]
    #[test_case(GatewayError::Server { status: 503, message: String::new() }, true)]
    #[test_case(GatewayError::Server { status: 408, message: String::new() }, true)]
    #[test_case(GatewayError::Server { status: 422, message: String::new() }, false)]
    #[test_case(GatewayError::Unauthorized("bad token".into()), false)]
    #[test_case(GatewayError::NotFound("XYZ.US".into()), false)]
    #[test_case(GatewayError::Cancelled, false)]
    fn retryable_classification(error: GatewayError, expected: bool) {
        assert_eq!(error.is_retryable(), expected);
    }

    #[test]
    fn failed_fetch_carries_default() {
        let fetched: Fetched<Vec<Split>> = Fetched::failed(1);
        assert!(fetched.failed);
        assert!(!fetched.succeeded());
        assert!(fetched.data.is_empty());
        assert_eq!(fetched.cost, 1);
    }
}
