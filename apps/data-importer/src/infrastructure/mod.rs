//! Infrastructure Layer - Adapters and external integrations.
//!
//! - `eodhd`: HTTP gateway to EOD Historical Data
//! - `persistence`: PostgreSQL and in-memory stores
//! - `config`: Environment configuration
//! - `telemetry`: Tracing and OpenTelemetry setup
//! - `metrics`: Prometheus metrics

/// Environment configuration.
pub mod config;

/// EOD Historical Data HTTP gateway.
pub mod eodhd;

/// Prometheus metrics.
pub mod metrics;

/// Store adapters.
pub mod persistence;

/// Tracing and OpenTelemetry.
pub mod telemetry;
