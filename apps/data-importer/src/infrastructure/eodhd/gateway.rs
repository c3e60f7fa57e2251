//! HTTP gateway to EOD Historical Data.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use reqwest::header::RETRY_AFTER;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::api_types::{
    self, DividendRow, EarningsResponse, EodRow, ExchangeRow, IposResponse, OptionsResponse,
    SplitRow, SymbolRow, TrendsResponse,
};
use super::error::{from_reqwest, from_status};
use super::retry::{Backoff, RetryPolicy, sleep_or_cancel};
use crate::application::ports::{
    Fetched, GatewayError, GatewayPort, UsageEntry, UsageLedgerPort,
};
use crate::application::services::NotificationHub;
use crate::domain::market_data::{
    Dividend, EarningsEvent, Exchange, IpoEvent, OptionChain, PriceBar, Split, TrendEvent,
};
use crate::domain::quota::{CostTable, Endpoint};
use crate::domain::symbol::Symbol;
use crate::infrastructure::metrics::{self, CallOutcome, FailureKind};

/// Production API root.
pub const DEFAULT_BASE_URL: &str = "https://eodhd.com/api";

/// Gateway settings.
#[derive(Clone)]
pub struct EodhdConfig {
    /// API root, without trailing slash.
    pub base_url: String,
    /// API token sent as `api_token`.
    pub api_token: String,
    /// Per-request timeout.
    pub timeout: Duration,
    /// Retry behavior for transient failures.
    pub retry: RetryPolicy,
}

impl std::fmt::Debug for EodhdConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EodhdConfig")
            .field("base_url", &self.base_url)
            .field("api_token", &"[REDACTED]")
            .field("timeout", &self.timeout)
            .field("retry", &self.retry)
            .finish()
    }
}

impl EodhdConfig {
    /// Settings for the production API with a 30s timeout and no retry.
    #[must_use]
    pub fn new(api_token: impl Into<String>) -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            api_token: api_token.into(),
            timeout: Duration::from_secs(30),
            retry: RetryPolicy::disabled(),
        }
    }

    /// Override the API root.
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Override the retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// Outcome of one logical call, possibly spanning several attempts.
struct Attempted<T> {
    result: Result<T, GatewayError>,
    cost: u32,
}

/// `GatewayPort` over the EODHD REST API.
///
/// Every response the provider returns is billed, success or not. Each
/// one is charged at the cost-table rate and appended to the usage ledger.
pub struct EodhdGateway {
    client: Client,
    base_url: String,
    api_token: String,
    retry: RetryPolicy,
    costs: CostTable,
    ledger: Arc<dyn UsageLedgerPort>,
    hub: NotificationHub,
}

impl std::fmt::Debug for EodhdGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EodhdGateway")
            .field("base_url", &self.base_url)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl EodhdGateway {
    /// Build a gateway.
    pub fn new(
        config: &EodhdConfig,
        costs: CostTable,
        ledger: Arc<dyn UsageLedgerPort>,
    ) -> Result<Self, GatewayError> {
        if config.api_token.trim().is_empty() {
            return Err(GatewayError::Unauthorized("missing API token".to_string()));
        }

        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| GatewayError::Network(e.to_string()))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_token: config.api_token.clone(),
            retry: config.retry.clone(),
            costs,
            ledger,
            hub: NotificationHub::with_defaults(),
        })
    }

    async fn charge(&self, endpoint: Endpoint, target: Option<&str>) -> u32 {
        let cost = self.costs.cost(endpoint);
        let entry = UsageEntry {
            at: Utc::now(),
            endpoint,
            target: target.map(str::to_string),
            cost,
        };
        if let Err(e) = self.ledger.append(entry).await {
            warn!(endpoint = endpoint.as_str(), error = %e, "Failed to append usage ledger entry");
        }
        cost
    }

    /// One HTTP exchange. Returns the decoded body and what it cost.
    async fn attempt<T: DeserializeOwned + Send>(
        &self,
        url: &str,
        params: &[(&str, &str)],
        endpoint: Endpoint,
        target: Option<&str>,
        cancel: &CancellationToken,
    ) -> (Result<T, GatewayError>, u32) {
        let request = self
            .client
            .get(url)
            .query(&[("api_token", self.api_token.as_str()), ("fmt", "json")])
            .query(params);

        let sent = tokio::select! {
            () = cancel.cancelled() => return (Err(GatewayError::Cancelled), 0),
            sent = request.send() => sent,
        };
        let response = match sent {
            Ok(response) => response,
            Err(e) => return (Err(from_reqwest(&e)), 0),
        };

        let cost = self.charge(endpoint, target).await;
        let status = response.status();
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok());

        let body = match response.text().await {
            Ok(body) => body,
            Err(e) => return (Err(from_reqwest(&e)), cost),
        };

        if !status.is_success() {
            let label = target.unwrap_or_else(|| endpoint.as_str());
            return (Err(from_status(status, label, &body, retry_after)), cost);
        }

        let decoded = serde_json::from_str(&body).map_err(|e| GatewayError::Decode(e.to_string()));
        (decoded, cost)
    }

    /// GET `path` with `params` and decode the JSON body, retrying per policy.
    async fn get_json<T: DeserializeOwned + Send>(
        &self,
        endpoint: Endpoint,
        path: &str,
        params: &[(&str, &str)],
        target: Option<&str>,
        cancel: &CancellationToken,
    ) -> Attempted<T> {
        let url = format!("{}{path}", self.base_url);
        let mut backoff = Backoff::new(&self.retry);
        let mut cost = 0;

        loop {
            if cancel.is_cancelled() {
                return Attempted {
                    result: Err(GatewayError::Cancelled),
                    cost,
                };
            }

            let (result, charged) = self.attempt(&url, params, endpoint, target, cancel).await;
            cost += charged;

            let error = match result {
                Ok(data) => {
                    metrics::record_api_call(endpoint, CallOutcome::Success, charged);
                    return Attempted {
                        result: Ok(data),
                        cost,
                    };
                }
                Err(error) => error,
            };
            metrics::record_api_call(
                endpoint,
                CallOutcome::Failure(FailureKind::from(&error)),
                charged,
            );

            if !error.is_retryable() {
                return Attempted {
                    result: Err(error),
                    cost,
                };
            }
            let Some(mut delay) = backoff.next_backoff() else {
                return Attempted {
                    result: Err(error),
                    cost,
                };
            };
            if let GatewayError::RateLimited {
                retry_after_secs: Some(secs),
            } = error
            {
                delay = delay.max(Duration::from_secs(secs)).min(self.retry.max_backoff);
            }

            warn!(
                path,
                error = %error,
                attempt = backoff.attempt(),
                delay_ms = delay.as_millis() as u64,
                "Retryable provider error, retrying"
            );
            if !sleep_or_cancel(delay, cancel).await {
                return Attempted {
                    result: Err(GatewayError::Cancelled),
                    cost,
                };
            }
        }
    }

    /// Turn a call outcome into a `Fetched`, publishing failures.
    fn settle<W, T, F>(&self, attempted: Attempted<W>, affected: Vec<String>, map: F) -> Fetched<T>
    where
        T: Default,
        F: FnOnce(W) -> T,
    {
        match attempted.result {
            Ok(wire) => Fetched::ok(map(wire), attempted.cost),
            Err(GatewayError::Cancelled) => Fetched::failed(attempted.cost),
            Err(error) => {
                debug!(error = %error, symbols = ?affected, "Provider fetch failed");
                metrics::record_item_failure(FailureKind::from(&error));
                self.hub.item_failure(error, affected);
                Fetched::failed(attempted.cost)
            }
        }
    }
}

#[async_trait]
impl GatewayPort for EodhdGateway {
    fn notifications(&self) -> &NotificationHub {
        &self.hub
    }

    async fn fetch_exchange_list(&self, cancel: &CancellationToken) -> Fetched<Vec<Exchange>> {
        let attempted: Attempted<Vec<ExchangeRow>> = self
            .get_json(Endpoint::ExchangeList, "/exchanges-list", &[], None, cancel)
            .await;
        self.settle(attempted, Vec::new(), api_types::into_exchanges)
    }

    async fn fetch_symbol_list(
        &self,
        exchange: &str,
        cancel: &CancellationToken,
    ) -> Fetched<Vec<Symbol>> {
        let exchange = exchange.trim().to_ascii_uppercase();
        let path = format!("/exchange-symbol-list/{exchange}");
        let attempted: Attempted<Vec<SymbolRow>> = self
            .get_json(Endpoint::SymbolList, &path, &[], Some(&exchange), cancel)
            .await;
        self.settle(attempted, vec![exchange.clone()], |rows| {
            api_types::into_symbols(&exchange, rows)
        })
    }

    async fn fetch_splits(&self, symbol: &Symbol, cancel: &CancellationToken) -> Fetched<Vec<Split>> {
        let ticker = symbol.ticker();
        let attempted: Attempted<Vec<SplitRow>> = self
            .get_json(Endpoint::Splits, &format!("/splits/{ticker}"), &[], Some(&ticker), cancel)
            .await;
        self.settle(attempted, vec![symbol.code.clone()], |rows| {
            api_types::into_splits(symbol, rows)
        })
    }

    async fn fetch_dividends(
        &self,
        symbol: &Symbol,
        cancel: &CancellationToken,
    ) -> Fetched<Vec<Dividend>> {
        let ticker = symbol.ticker();
        let attempted: Attempted<Vec<DividendRow>> = self
            .get_json(Endpoint::Dividends, &format!("/div/{ticker}"), &[], Some(&ticker), cancel)
            .await;
        self.settle(attempted, vec![symbol.code.clone()], |rows| {
            api_types::into_dividends(symbol, rows)
        })
    }

    async fn fetch_prices(
        &self,
        symbol: &Symbol,
        cancel: &CancellationToken,
    ) -> Fetched<Vec<PriceBar>> {
        let ticker = symbol.ticker();
        let attempted: Attempted<Vec<EodRow>> = self
            .get_json(Endpoint::Eod, &format!("/eod/{ticker}"), &[], Some(&ticker), cancel)
            .await;
        self.settle(attempted, vec![symbol.code.clone()], |rows| {
            api_types::into_price_bars(symbol, rows)
        })
    }

    async fn fetch_options(&self, symbol: &Symbol, cancel: &CancellationToken) -> Fetched<OptionChain> {
        let ticker = symbol.ticker();
        let attempted: Attempted<OptionsResponse> = self
            .get_json(Endpoint::Options, &format!("/options/{ticker}"), &[], Some(&ticker), cancel)
            .await;
        self.settle(attempted, vec![symbol.code.clone()], |response| {
            api_types::into_option_chain(symbol, response)
        })
    }

    async fn fetch_earnings(&self, cancel: &CancellationToken) -> Fetched<Vec<EarningsEvent>> {
        let attempted: Attempted<EarningsResponse> = self
            .get_json(Endpoint::CalendarEarnings, "/calendar/earnings", &[], None, cancel)
            .await;
        self.settle(attempted, Vec::new(), api_types::into_earnings)
    }

    async fn fetch_ipos(&self, cancel: &CancellationToken) -> Fetched<Vec<IpoEvent>> {
        let attempted: Attempted<IposResponse> = self
            .get_json(Endpoint::CalendarIpos, "/calendar/ipos", &[], None, cancel)
            .await;
        self.settle(attempted, Vec::new(), api_types::into_ipos)
    }

    async fn fetch_trends(
        &self,
        tickers: &[String],
        cancel: &CancellationToken,
    ) -> Fetched<Vec<TrendEvent>> {
        let symbols = tickers.join(",");
        let attempted: Attempted<TrendsResponse> = self
            .get_json(
                Endpoint::CalendarTrends,
                "/calendar/trends",
                &[("symbols", symbols.as_str())],
                None,
                cancel,
            )
            .await;
        let affected = tickers
            .iter()
            .map(|t| t.split_once('.').map_or(t.as_str(), |(code, _)| code).to_string())
            .collect();
        self.settle(attempted, affected, api_types::into_trends)
    }
}
