#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::needless_pass_by_value,
        clippy::items_after_statements,
        clippy::cast_possible_wrap
    )
)]

//! Data Importer - Quota-Gated Market Data Ingestion
//!
//! Fetches reference data, corporate actions, prices, option chains and
//! calendar events from EOD Historical Data and upserts them into
//! PostgreSQL, without exceeding the provider's daily usage allowance.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: Pure import vocabulary
//!   - `symbol`: Registry of known (code, exchange) pairs
//!   - `quota`: Cost table and daily usage meter
//!   - `import`: Units of work and configured action items
//!   - `market_data`: Records that flow from provider to store
//!
//! - **Application**: Use cases and port definitions
//!   - `ports`: Gateway, persistence and usage ledger interfaces
//!   - `services`: Notification hub, import orchestrator, maintenance, action runner
//!
//! - **Infrastructure**: Adapters and external integrations
//!   - `eodhd`: HTTP gateway with cost accounting and optional retry
//!   - `persistence`: PostgreSQL (sqlx) and in-memory stores
//!   - `config`: Environment configuration
//!   - `telemetry` / `metrics`: Tracing, OTLP export and Prometheus
//!
//! # Data Flow
//!
//! ```text
//! action item ─► orchestrator ─► quota meter ──(denied)──► QuotaDenied
//!                     │
//!                     ▼
//!                 gateway ──(per-item error)──► ItemFailure
//!                     │
//!                     ▼
//!                   store ◄── usage ledger
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Import types with no external dependencies.
pub mod domain;

/// Application layer - Use cases and port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::import::{ActionItem, ActionSchedule, CalendarKind, DataType, ImportUnit, Scope};
pub use domain::quota::{CostTable, Endpoint, QuotaMeter, UsageState};
pub use domain::symbol::{Symbol, SymbolRegistry};

// Ports
pub use application::ports::{
    Fetched, GatewayError, GatewayPort, PersistenceError, PersistencePort, UsageLedgerPort,
};

// Services
pub use application::services::{
    ActionRunner, ImportError, ImportOrchestrator, ImportOutcome, ImportReport, ImporterSettings,
    MaintenanceService, NotificationHub, RunSummary, RunnerSettings,
};

// Infrastructure config
pub use infrastructure::config::{ConfigError, ImporterConfig};

// Adapters
pub use infrastructure::eodhd::{EodhdConfig, EodhdGateway, RetryPolicy};
pub use infrastructure::persistence::{InMemoryStore, PostgresStore};

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
