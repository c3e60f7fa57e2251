//! Data Importer Binary
//!
//! Runs the configured action items once and exits.
//!
//! # Usage
//!
//! ```bash
//! IMPORTER_ACTIONS="import:bulk:exchanges,import:full:US:symbols,import:full:US:splits" \
//!     cargo run --bin data-importer
//! ```
//!
//! # Environment Variables
//!
//! ## Required
//! - `EODHD_API_KEY`: EOD Historical Data API token
//! - `DATABASE_URL`: PostgreSQL connection string
//!
//! ## Optional
//! - `IMPORTER_ACTIONS`: comma-separated action items run every day (default: none)
//! - `IMPORTER_ACTIONS_MONDAY` .. `IMPORTER_ACTIONS_SUNDAY`: items run on that weekday only
//! - `IMPORTER_ACTIONS_ON_EMPTY_DATABASE`: items run first while no symbols are stored
//! - `IMPORTER_DAILY_LIMIT`: daily usage ceiling (default: 100000)
//! - `IMPORTER_CANCEL_ON_ERROR`: stop after the first failed item (default: false)
//! - `IMPORTER_FIX_FILE`: optionable symbol list (default: Fixes/OptionableSymbols.txt)
//! - `IMPORTER_LOG_RETENTION_DAYS`: age cut-off for `truncate` items (default: 30)
//! - `IMPORTER_HTTP_TIMEOUT_SECS`: per-request timeout (default: 30)
//! - `IMPORTER_RETRY_MAX_ATTEMPTS`: attempts per provider call (default: 1)
//! - `IMPORTER_METRICS_PORT`: Prometheus port, 0 to disable (default: 0)
//! - `EODHD_BASE_URL`: provider API root (default: <https://eodhd.com/api>)
//! - `DB_MAX_CONNECTIONS`: pool size (default: 5)
//! - `OTEL_ENABLED`: export spans over OTLP (default: false)
//! - `RUST_LOG`: log filter (default: info)

use std::net::SocketAddr;
use std::sync::Arc;

use chrono::{Datelike, Utc};
use data_importer::application::ports::UsageLedgerPort;
use data_importer::application::services::{ActionStatus, NotificationHub};
use data_importer::domain::quota::UsageState;
use data_importer::infrastructure::metrics;
use data_importer::infrastructure::telemetry;
use data_importer::{
    ActionItem, ActionRunner, EodhdGateway, ImportOrchestrator, ImportOutcome, ImporterConfig,
    MaintenanceService, PostgresStore, RunSummary, RunnerSettings, init_metrics,
};
use tokio::signal;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    load_dotenv();

    // Initialize telemetry (OpenTelemetry + tracing)
    let _telemetry_guard = telemetry::init()?;

    tracing::info!("Starting data importer");

    let config = ImporterConfig::from_env()?;
    log_config(&config);

    // Initialize Prometheus metrics
    let listen = (config.metrics_port != 0)
        .then(|| SocketAddr::from(([0, 0, 0, 0], config.metrics_port)));
    let _metrics_handle = init_metrics(listen)?;

    let shutdown_token = CancellationToken::new();
    tokio::spawn(await_shutdown(shutdown_token.clone()));

    // Store and usage ledger
    let store = Arc::new(
        PostgresStore::connect(
            config.database.url.expose(),
            config.database.max_connections,
        )
        .await?,
    );
    store.migrate().await?;

    // Provider gateway charges every response to the ledger
    let settings = config.importer();
    let ledger: Arc<dyn UsageLedgerPort> = Arc::clone(&store) as Arc<dyn UsageLedgerPort>;
    let gateway = Arc::new(EodhdGateway::new(
        &config.eodhd(),
        settings.costs.clone(),
        ledger,
    )?);

    let orchestrator = Arc::new(
        ImportOrchestrator::new(gateway, Arc::clone(&store), Arc::clone(&store), settings).await?,
    );
    log_notifications(orchestrator.notifications());
    metrics::set_quota(orchestrator.usage_state());

    let maintenance = MaintenanceService::new(
        Arc::clone(&store),
        config.run.fix_file.clone(),
        Arc::clone(orchestrator.notifications()),
    );
    let runner = ActionRunner::new(
        Arc::clone(&orchestrator),
        maintenance,
        Arc::clone(&store),
        RunnerSettings {
            log_retention: config.run.log_retention,
            cancel_on_error: config.run.cancel_on_error,
        },
    );

    // Pick today's action items; a store without symbols gets its seed list first
    orchestrator.hydrate(&shutdown_token).await?;
    let database_empty = orchestrator.registry().is_empty();
    let weekday = Utc::now().weekday();
    let actions = config.run.schedule.plan(weekday, database_empty);
    tracing::info!(
        %weekday,
        database_empty,
        actions = actions.len(),
        "Action items planned"
    );

    let summary = runner.run(&actions, &shutdown_token).await;
    record_run(&summary);

    let usage = orchestrator.usage_state();
    metrics::set_quota(usage);
    log_summary(&summary, usage);

    Ok(())
}

/// Route hub events into the log.
fn log_notifications(hub: &NotificationHub) {
    hub.on_quota_denied(|denied| {
        tracing::warn!(
            operation = %denied.operation,
            used = denied.used,
            requested_total = denied.requested_total,
            "Quota denied"
        );
    });
    hub.on_item_failure(|failure| {
        tracing::warn!(
            error = %failure.error,
            symbols = ?failure.symbols,
            "Item failed"
        );
    });
    hub.on_progress(|progress| {
        tracing::info!(message = %progress.message, "Progress");
    });
}

/// Record per-item metrics for a finished run.
fn record_run(summary: &RunSummary) {
    for result in &summary.results {
        let ActionStatus::Imported(report) = &result.status else {
            continue;
        };
        let data_type = match &result.item {
            ActionItem::Import(unit) => unit.data_type.as_str(),
            ActionItem::Calendar { kind, .. } => kind.as_str(),
            _ => continue,
        };
        if report.outcome == ImportOutcome::QuotaDenied {
            metrics::record_quota_denied(data_type);
        }
        metrics::record_records_persisted(data_type, report.records);
    }
}

/// Log the parsed configuration.
fn log_config(config: &ImporterConfig) {
    tracing::info!(
        daily_limit = config.run.daily_limit,
        scheduled_actions = config.run.schedule.len(),
        cancel_on_error = config.run.cancel_on_error,
        metrics_port = config.metrics_port,
        "Configuration loaded"
    );
    tracing::debug!(
        base_url = %config.provider.base_url,
        retry_max_attempts = config.provider.retry_max_attempts,
        fix_file = %config.run.fix_file.display(),
        "Provider settings"
    );
}

/// Log what the run did.
fn log_summary(summary: &RunSummary, usage: UsageState) {
    let failures = summary.failures();
    if failures > 0 || summary.not_started > 0 {
        tracing::warn!(
            executed = summary.results.len(),
            failures,
            not_started = summary.not_started,
            used = usage.used,
            daily_limit = usage.daily_limit,
            "Import run finished with errors"
        );
    } else {
        tracing::info!(
            executed = summary.results.len(),
            used = usage.used,
            daily_limit = usage.daily_limit,
            "Import run finished"
        );
    }
}

/// Load .env file from current or ancestor directories.
fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT) and cancel the run.
async fn await_shutdown(shutdown_token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, cancelling run");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, cancelling run");
        }
    }

    shutdown_token.cancel();
}
