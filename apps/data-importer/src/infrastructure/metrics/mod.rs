//! Prometheus Metrics Module
//!
//! # Metrics
//!
//! - `importer_api_calls_total{endpoint, outcome}`: provider calls
//! - `importer_api_cost_total{endpoint}`: usage charged by the provider
//! - `importer_quota_denied_total{data_type}`: units refused by the meter
//! - `importer_item_failures_total{kind}`: failed provider fetches
//! - `importer_records_persisted_total{data_type}`: rows upserted
//! - `importer_quota_used` / `importer_quota_limit`: budget gauges
//!
//! The exporter serves `/metrics` when a listen port is configured.

use std::net::SocketAddr;
use std::sync::OnceLock;

use metrics::{counter, describe_counter, describe_gauge, gauge};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use thiserror::Error;

use crate::application::ports::GatewayError;
use crate::domain::quota::{Endpoint, UsageState};

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Metrics setup failure.
#[derive(Debug, Error)]
pub enum MetricsError {
    /// The exporter could not be built (e.g. port in use).
    #[error("failed to build Prometheus exporter: {0}")]
    Build(#[from] BuildError),

    /// Another recorder was installed first.
    #[error("a global metrics recorder is already installed")]
    RecorderInstalled,
}

/// Install the Prometheus recorder, serving `/metrics` on `listen` if set.
///
/// Must be called inside a Tokio runtime when `listen` is set. Later
/// calls return the handle from the first.
pub fn init_metrics(listen: Option<SocketAddr>) -> Result<PrometheusHandle, MetricsError> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle.clone());
    }

    let handle = match listen {
        Some(addr) => {
            let (recorder, exporter) = PrometheusBuilder::new().with_http_listener(addr).build()?;
            let handle = recorder.handle();
            metrics::set_global_recorder(recorder).map_err(|_| MetricsError::RecorderInstalled)?;
            tokio::spawn(exporter);
            handle
        }
        None => PrometheusBuilder::new().install_recorder()?,
    };

    register_metrics();
    Ok(PROMETHEUS_HANDLE.get_or_init(|| handle).clone())
}

/// Handle for rendering metrics, if installed.
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    describe_counter!(
        "importer_api_calls_total",
        "Provider calls by endpoint and outcome"
    );
    describe_counter!(
        "importer_api_cost_total",
        "Usage charged by the provider per endpoint"
    );
    describe_counter!(
        "importer_quota_denied_total",
        "Import units refused by the daily quota"
    );
    describe_counter!(
        "importer_item_failures_total",
        "Failed provider fetches by error kind"
    );
    describe_counter!(
        "importer_records_persisted_total",
        "Rows upserted into the store by data type"
    );
    describe_gauge!("importer_quota_used", "Provider usage consumed today");
    describe_gauge!("importer_quota_limit", "Configured daily usage limit");
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Outcome label for a provider call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    /// 2xx with a decodable body.
    Success,
    /// The call failed.
    Failure(FailureKind),
}

impl CallOutcome {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure(kind) => kind.as_str(),
        }
    }
}

/// Failure label derived from a gateway error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// 401/403.
    Unauthorized,
    /// 404.
    NotFound,
    /// 429.
    RateLimited,
    /// Other non-success status.
    Server,
    /// Transport failure.
    Network,
    /// Undecodable body.
    Decode,
    /// Cancelled by the caller.
    Cancelled,
}

impl FailureKind {
    /// Label value.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unauthorized => "unauthorized",
            Self::NotFound => "not_found",
            Self::RateLimited => "rate_limited",
            Self::Server => "server",
            Self::Network => "network",
            Self::Decode => "decode",
            Self::Cancelled => "cancelled",
        }
    }
}

impl From<&GatewayError> for FailureKind {
    fn from(err: &GatewayError) -> Self {
        match err {
            GatewayError::Unauthorized(_) => Self::Unauthorized,
            GatewayError::NotFound(_) => Self::NotFound,
            GatewayError::RateLimited { .. } => Self::RateLimited,
            GatewayError::Server { .. } => Self::Server,
            GatewayError::Network(_) => Self::Network,
            GatewayError::Decode(_) => Self::Decode,
            GatewayError::Cancelled => Self::Cancelled,
        }
    }
}

/// Record one completed provider call and what it cost.
pub fn record_api_call(endpoint: Endpoint, outcome: CallOutcome, cost: u32) {
    counter!(
        "importer_api_calls_total",
        "endpoint" => endpoint.as_str(),
        "outcome" => outcome.as_str()
    )
    .increment(1);
    counter!(
        "importer_api_cost_total",
        "endpoint" => endpoint.as_str()
    )
    .increment(u64::from(cost));
}

/// Record a unit refused by the quota meter.
pub fn record_quota_denied(data_type: &'static str) {
    counter!(
        "importer_quota_denied_total",
        "data_type" => data_type
    )
    .increment(1);
}

/// Record a failed fetch.
pub fn record_item_failure(kind: FailureKind) {
    counter!(
        "importer_item_failures_total",
        "kind" => kind.as_str()
    )
    .increment(1);
}

/// Record rows upserted for one unit.
pub fn record_records_persisted(data_type: &'static str, count: usize) {
    counter!(
        "importer_records_persisted_total",
        "data_type" => data_type
    )
    .increment(count as u64);
}

/// Publish the current budget.
#[allow(clippy::cast_precision_loss)]
pub fn set_quota(state: UsageState) {
    gauge!("importer_quota_used").set(f64::from(state.used));
    gauge!("importer_quota_limit").set(f64::from(state.daily_limit));
}

// =============================================================================
// Tests
// =============================================================================
