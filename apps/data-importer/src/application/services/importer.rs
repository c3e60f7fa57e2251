//! Import Orchestrator
//!
//! Runs one unit of work at a time: resolve the symbol subset, price it
//! with the quota meter, then fetch and persist symbol by symbol.
//!
//! # Flow
//!
//! ```text
//! import(unit)
//!   ├─ cancelled? ──────────────────────────────► Err(Cancelled)
//!   ├─ plan(scope, data type)
//!   │    ├─ SymbolList   → estimate(1) → fetch list → union registry → save
//!   │    ├─ ExchangeList → estimate(1) → fetch list → save
//!   │    ├─ PerSymbol    → hydrate → subset → estimate(n)
//!   │    │                   ├─ denied   → QuotaDenied, no fetch, no write
//!   │    │                   └─ admitted → for each symbol: fetch → charge → save
//!   │    └─ NoOp         → accepted, nothing to do
//!   └─ ImportReport
//! ```
//!
//! Provider failures never abort a unit: the gateway substitutes a
//! default value and publishes `ItemFailure`, which the orchestrator
//! forwards and skips. Persistence failures do abort the unit.
//!
//! The meter and the registry are only touched between awaits; no lock
//! guard lives across a suspension point.

use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::notifications::NotificationHub;
use crate::application::ports::{
    Fetched, GatewayPort, PersistenceError, PersistencePort, UsageLedgerPort,
};
use crate::domain::import::{CalendarKind, DataType, ImportUnit, Scope};
use crate::domain::market_data::{ResolvedEarnings, ResolvedTrend};
use crate::domain::quota::{CostEstimate, CostTable, Endpoint, QuotaMeter, UsageState};
use crate::domain::symbol::{Symbol, SymbolRegistry};

// =============================================================================
// Errors
// =============================================================================

/// Failure of a unit as a whole.
#[derive(Debug, Error)]
pub enum ImportError {
    /// Cancellation was requested.
    #[error("import cancelled")]
    Cancelled,

    /// The store rejected a read or write.
    #[error("persistence failed: {0}")]
    Persistence(PersistenceError),

    /// The unit cannot be run as configured.
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl From<PersistenceError> for ImportError {
    fn from(err: PersistenceError) -> Self {
        match err {
            PersistenceError::Cancelled => Self::Cancelled,
            other => Self::Persistence(other),
        }
    }
}

// =============================================================================
// Settings and Reports
// =============================================================================

/// Orchestrator settings.
#[derive(Debug, Clone)]
pub struct ImporterSettings {
    /// Daily usage ceiling.
    pub daily_limit: u32,
    /// Per-endpoint call costs.
    pub costs: CostTable,
}

impl Default for ImporterSettings {
    fn default() -> Self {
        Self {
            daily_limit: 100_000,
            costs: CostTable::default(),
        }
    }
}

/// How a unit ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportOutcome {
    /// Ran to the end (some items may have failed).
    Completed,
    /// Refused by the quota meter before any fetch.
    QuotaDenied,
    /// Accepted with nothing to do for this scope and data type.
    NoOp,
}

/// Summary of one unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportReport {
    /// What ran, e.g. `Full US Splits`.
    pub label: String,
    /// How it ended.
    pub outcome: ImportOutcome,
    /// Provider calls made.
    pub calls: usize,
    /// Items whose data was written (symbols, or 1 for a list call).
    pub persisted: usize,
    /// Rows written across all items.
    pub records: usize,
    /// Codes whose fetch failed.
    pub failed: Vec<String>,
    /// Usage charged by this unit.
    pub cost: u32,
}

impl ImportReport {
    fn new(label: impl Into<String>, outcome: ImportOutcome) -> Self {
        Self {
            label: label.into(),
            outcome,
            calls: 0,
            persisted: 0,
            records: 0,
            failed: Vec::new(),
            cost: 0,
        }
    }

    fn absorb(&mut self, code: &str, step: Step) {
        self.calls += 1;
        self.cost = self.cost.saturating_add(step.cost);
        match step.written {
            Some(rows) => {
                self.persisted += 1;
                self.records += rows;
            }
            None => self.failed.push(code.to_string()),
        }
    }
}

/// Outcome of one fetch-and-save.
#[derive(Debug, Clone, Copy)]
struct Step {
    cost: u32,
    /// Rows written, or `None` when the fetch failed.
    written: Option<usize>,
}

// =============================================================================
// Dispatch
// =============================================================================

/// Per-symbol data sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dataset {
    Splits,
    Dividends,
    Prices,
    Options,
}

impl Dataset {
    const fn endpoint(self) -> Endpoint {
        match self {
            Self::Splits => Endpoint::Splits,
            Self::Dividends => Endpoint::Dividends,
            Self::Prices => Endpoint::Eod,
            Self::Options => Endpoint::Options,
        }
    }
}

/// What a unit does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ImportPlan {
    SymbolList,
    ExchangeList,
    PerSymbol(Dataset),
    NoOp,
}

const fn plan(scope: Scope, data_type: DataType) -> ImportPlan {
    match (scope, data_type) {
        (_, DataType::Symbols) => ImportPlan::SymbolList,
        (_, DataType::Exchanges) => ImportPlan::ExchangeList,
        (Scope::Full, DataType::Splits) => ImportPlan::PerSymbol(Dataset::Splits),
        (Scope::Full, DataType::Dividends) => ImportPlan::PerSymbol(Dataset::Dividends),
        (Scope::Full, DataType::Prices) => ImportPlan::PerSymbol(Dataset::Prices),
        (Scope::Full, DataType::Options) => ImportPlan::PerSymbol(Dataset::Options),
        // Fundamentals are not imported yet; bulk covers only the exchange list.
        (Scope::Full, DataType::Fundamentals)
        | (
            Scope::Bulk,
            DataType::Splits
            | DataType::Dividends
            | DataType::Prices
            | DataType::Options
            | DataType::Fundamentals,
        ) => ImportPlan::NoOp,
    }
}

// =============================================================================
// Orchestrator
// =============================================================================

/// Quota-gated import orchestrator.
pub struct ImportOrchestrator<G, P, L>
where
    G: GatewayPort,
    P: PersistencePort,
    L: UsageLedgerPort,
{
    gateway: Arc<G>,
    persistence: Arc<P>,
    ledger: Arc<L>,
    registry: SymbolRegistry,
    meter: Mutex<QuotaMeter>,
    notifications: Arc<NotificationHub>,
}

impl<G, P, L> ImportOrchestrator<G, P, L>
where
    G: GatewayPort,
    P: PersistencePort,
    L: UsageLedgerPort,
{
    /// Create an orchestrator.
    ///
    /// Replays today's usage from the ledger into the meter and forwards
    /// every gateway notification onto the orchestrator's own hub.
    pub async fn new(
        gateway: Arc<G>,
        persistence: Arc<P>,
        ledger: Arc<L>,
        settings: ImporterSettings,
    ) -> Result<Self, ImportError> {
        let used = ledger.usage_on(Utc::now().date_naive()).await?;
        let mut meter = QuotaMeter::new(settings.costs, settings.daily_limit);
        meter.reset(settings.daily_limit, used);

        let notifications = Arc::new(NotificationHub::with_defaults());
        let forward = Arc::clone(&notifications);
        gateway.notifications().subscribe_all(move |event| {
            forward.publish(event.clone());
        });

        info!(
            used,
            daily_limit = settings.daily_limit,
            "Usage restored from ledger"
        );

        Ok(Self {
            gateway,
            persistence,
            ledger,
            registry: SymbolRegistry::new(),
            meter: Mutex::new(meter),
            notifications,
        })
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Hub carrying orchestrator and forwarded gateway notifications.
    #[must_use]
    pub const fn notifications(&self) -> &Arc<NotificationHub> {
        &self.notifications
    }

    /// Known symbols.
    #[must_use]
    pub const fn registry(&self) -> &SymbolRegistry {
        &self.registry
    }

    /// Usage consumed today.
    #[must_use]
    pub fn usage(&self) -> u32 {
        self.meter.lock().used()
    }

    /// Daily ceiling.
    #[must_use]
    pub fn daily_limit(&self) -> u32 {
        self.meter.lock().daily_limit()
    }

    /// Snapshot of usage and ceiling.
    #[must_use]
    pub fn usage_state(&self) -> UsageState {
        self.meter.lock().usage_state()
    }

    // =========================================================================
    // Usage
    // =========================================================================

    /// Replace the ceiling and re-read today's usage from the ledger.
    pub async fn reset_usage(&self, new_limit: u32) -> Result<UsageState, ImportError> {
        let used = self.ledger.usage_on(Utc::now().date_naive()).await?;
        let mut meter = self.meter.lock();
        meter.reset(new_limit, used);
        info!(used, daily_limit = new_limit, "Usage reset");
        Ok(meter.usage_state())
    }

    /// Refuse `estimate` if it does not fit; publishes `QuotaDenied`.
    fn admit(&self, operation: &str, estimate: &CostEstimate) -> bool {
        let (admitted, used) = {
            let meter = self.meter.lock();
            (meter.admit(estimate), meter.used())
        };

        if !admitted {
            let requested_total = used.saturating_add(estimate.total_cost);
            warn!(
                operation,
                endpoint = %estimate.endpoint,
                used,
                requested_total,
                "Quota denied"
            );
            self.notifications
                .quota_denied(operation, used, requested_total);
        }
        admitted
    }

    fn charge(&self, cost: u32) {
        if cost > 0 {
            self.meter.lock().record_usage(cost);
        }
    }

    // =========================================================================
    // Registry
    // =========================================================================

    /// Load stored symbols into the registry on first need.
    ///
    /// Returns `true` if this call performed the load.
    pub async fn hydrate(&self, cancel: &CancellationToken) -> Result<bool, ImportError> {
        if self.registry.is_hydrated() {
            return Ok(false);
        }
        let stored = self.persistence.get_all_symbols(cancel).await?;
        let count = stored.len();
        let loaded = self.registry.hydrate_with(stored);
        if loaded {
            debug!(symbols = count, "Symbol registry hydrated");
        }
        Ok(loaded)
    }

    // =========================================================================
    // Import
    // =========================================================================

    /// Run one unit of work.
    ///
    /// Per-symbol failures are reported through notifications and listed
    /// in the report; they do not fail the unit.
    #[tracing::instrument(skip(self, unit, cancel), fields(unit = %unit))]
    pub async fn import(
        &self,
        unit: &ImportUnit,
        cancel: &CancellationToken,
    ) -> Result<ImportReport, ImportError> {
        if cancel.is_cancelled() {
            return Err(ImportError::Cancelled);
        }

        self.notifications.progress(format!(
            "Importing\t{} {} {}",
            unit.scope, unit.exchange, unit.data_type
        ));

        let report = match plan(unit.scope, unit.data_type) {
            ImportPlan::SymbolList => self.import_symbol_list(unit, cancel).await?,
            ImportPlan::ExchangeList => self.import_exchange_list(unit, cancel).await?,
            ImportPlan::PerSymbol(dataset) => self.import_per_symbol(unit, dataset, cancel).await?,
            ImportPlan::NoOp => {
                debug!("Nothing to import for this scope and data type");
                ImportReport::new(unit.to_string(), ImportOutcome::NoOp)
            }
        };

        info!(
            outcome = ?report.outcome,
            calls = report.calls,
            persisted = report.persisted,
            failed = report.failed.len(),
            cost = report.cost,
            "Import unit finished"
        );
        Ok(report)
    }

    async fn import_symbol_list(
        &self,
        unit: &ImportUnit,
        cancel: &CancellationToken,
    ) -> Result<ImportReport, ImportError> {
        require_exchange(unit)?;
        let mut report = ImportReport::new(unit.to_string(), ImportOutcome::Completed);

        let estimate = self.meter.lock().estimate(Endpoint::SymbolList, 1);
        if !self.admit(&unit.operation_label(), &estimate) {
            report.outcome = ImportOutcome::QuotaDenied;
            return Ok(report);
        }

        let fetched = self
            .gateway
            .fetch_symbol_list(&unit.exchange, cancel)
            .await;
        let step = self
            .settle(fetched, cancel, |symbols| async move {
                let added = self.registry.union(symbols.iter().cloned());
                debug!(fetched = symbols.len(), added, "Symbols merged into registry");
                self.persistence.save_symbols(&symbols, cancel).await
            })
            .await?;
        report.absorb(&unit.exchange, step);
        Ok(report)
    }

    async fn import_exchange_list(
        &self,
        unit: &ImportUnit,
        cancel: &CancellationToken,
    ) -> Result<ImportReport, ImportError> {
        let mut report = ImportReport::new(unit.to_string(), ImportOutcome::Completed);

        let estimate = self.meter.lock().estimate(Endpoint::ExchangeList, 1);
        if !self.admit(&unit.operation_label(), &estimate) {
            report.outcome = ImportOutcome::QuotaDenied;
            return Ok(report);
        }

        let fetched = self.gateway.fetch_exchange_list(cancel).await;
        let step = self
            .settle(fetched, cancel, |exchanges| async move {
                self.persistence.save_exchanges(&exchanges, cancel).await
            })
            .await?;
        report.absorb("exchanges", step);
        Ok(report)
    }

    async fn import_per_symbol(
        &self,
        unit: &ImportUnit,
        dataset: Dataset,
        cancel: &CancellationToken,
    ) -> Result<ImportReport, ImportError> {
        require_exchange(unit)?;
        let mut report = ImportReport::new(unit.to_string(), ImportOutcome::Completed);

        let symbols = self.resolve_subset(&unit.exchange, dataset, cancel).await?;
        let estimate = self.meter.lock().estimate(dataset.endpoint(), symbols.len());
        if !self.admit(&unit.operation_label(), &estimate) {
            report.outcome = ImportOutcome::QuotaDenied;
            return Ok(report);
        }

        debug!(
            symbols = symbols.len(),
            estimated_cost = estimate.total_cost,
            "Quota admitted"
        );

        for (index, symbol) in symbols.iter().enumerate() {
            if cancel.is_cancelled() {
                info!(
                    completed = index,
                    remaining = symbols.len() - index,
                    "Import cancelled mid-batch"
                );
                return Err(ImportError::Cancelled);
            }
            let step = self.fetch_and_save(dataset, symbol, cancel).await?;
            report.absorb(&symbol.code, step);
        }

        Ok(report)
    }

    async fn resolve_subset(
        &self,
        exchange: &str,
        dataset: Dataset,
        cancel: &CancellationToken,
    ) -> Result<Vec<Symbol>, ImportError> {
        if dataset == Dataset::Options {
            let mut subset: Vec<Symbol> = self
                .persistence
                .get_symbols_with_options(cancel)
                .await?
                .into_iter()
                .filter(|symbol| symbol.exchange == exchange)
                .collect();
            subset.sort_by(|a, b| a.code.cmp(&b.code));
            return Ok(subset);
        }

        self.hydrate(cancel).await?;
        Ok(self.registry.subset_for_exchange(exchange))
    }

    async fn fetch_and_save(
        &self,
        dataset: Dataset,
        symbol: &Symbol,
        cancel: &CancellationToken,
    ) -> Result<Step, ImportError> {
        let persistence = &self.persistence;
        match dataset {
            Dataset::Splits => {
                let fetched = self.gateway.fetch_splits(symbol, cancel).await;
                self.settle(fetched, cancel, |splits| async move {
                    persistence.save_splits(&splits, cancel).await
                })
                .await
            }
            Dataset::Dividends => {
                let fetched = self.gateway.fetch_dividends(symbol, cancel).await;
                self.settle(fetched, cancel, |dividends| async move {
                    persistence.save_dividends(&dividends, cancel).await
                })
                .await
            }
            Dataset::Prices => {
                let fetched = self.gateway.fetch_prices(symbol, cancel).await;
                self.settle(fetched, cancel, |bars| async move {
                    persistence.save_price_actions(&bars, cancel).await
                })
                .await
            }
            Dataset::Options => {
                let fetched = self.gateway.fetch_options(symbol, cancel).await;
                self.settle(fetched, cancel, |chain| async move {
                    persistence.save_options(&chain, cancel).await
                })
                .await
            }
        }
    }

    /// Charge the fetch, then persist its data unless it failed.
    ///
    /// A fetch that ended because `cancel` fired is charged but neither
    /// saved nor reported as a failed item.
    async fn settle<T, F, Fut>(
        &self,
        fetched: Fetched<T>,
        cancel: &CancellationToken,
        save: F,
    ) -> Result<Step, ImportError>
    where
        F: FnOnce(T) -> Fut,
        Fut: Future<Output = Result<usize, PersistenceError>>,
    {
        self.charge(fetched.cost);
        if fetched.failed && cancel.is_cancelled() {
            return Err(ImportError::Cancelled);
        }
        if fetched.failed {
            return Ok(Step {
                cost: fetched.cost,
                written: None,
            });
        }
        let written = save(fetched.data).await?;
        Ok(Step {
            cost: fetched.cost,
            written: Some(written),
        })
    }

    // =========================================================================
    // Calendar
    // =========================================================================

    /// Import a calendar feed, keeping only records for `exchanges`.
    ///
    /// Earnings and trends are keyed by code only; their exchange is
    /// resolved through the registry and unknown codes are dropped.
    #[tracing::instrument(skip(self, cancel))]
    pub async fn import_calendar(
        &self,
        kind: CalendarKind,
        exchanges: &[String],
        cancel: &CancellationToken,
    ) -> Result<ImportReport, ImportError> {
        if cancel.is_cancelled() {
            return Err(ImportError::Cancelled);
        }

        let exchanges: Vec<String> = exchanges
            .iter()
            .map(|e| e.trim().to_ascii_uppercase())
            .collect();
        let label = format!("Calendar {kind:?} {}", exchanges.join("|"));
        self.notifications.progress(format!("Importing\t{label}"));
        let mut report = ImportReport::new(label, ImportOutcome::Completed);

        let (endpoint, operation) = match kind {
            CalendarKind::Earnings => (Endpoint::CalendarEarnings, "earnings calendar"),
            CalendarKind::Ipos => (Endpoint::CalendarIpos, "ipo calendar"),
            CalendarKind::Trends => return self.import_trends(&exchanges, report, cancel).await,
        };
        let estimate = self.meter.lock().estimate(endpoint, 1);
        if !self.admit(operation, &estimate) {
            report.outcome = ImportOutcome::QuotaDenied;
            return Ok(report);
        }

        let exchanges = exchanges.as_slice();
        let step = if kind == CalendarKind::Earnings {
            self.hydrate(cancel).await?;
            let fetched = self.gateway.fetch_earnings(cancel).await;
            self.settle(fetched, cancel, |events| async move {
                let resolved: Vec<ResolvedEarnings> = events
                    .into_iter()
                    .filter_map(|mut event| {
                        let bare = bare_code(&event.code).to_string();
                        let exchange = self.resolve_exchange(&bare, exchanges)?;
                        event.code = bare;
                        Some(ResolvedEarnings { exchange, event })
                    })
                    .collect();
                self.persistence.save_earnings(&resolved, cancel).await
            })
            .await?
        } else {
            let fetched = self.gateway.fetch_ipos(cancel).await;
            self.settle(fetched, cancel, |ipos| async move {
                let kept: Vec<_> = ipos
                    .into_iter()
                    .filter_map(|mut ipo| {
                        let exchange = exchanges
                            .iter()
                            .find(|e| e.eq_ignore_ascii_case(&ipo.exchange))?;
                        ipo.exchange.clone_from(exchange);
                        Some(ipo)
                    })
                    .collect();
                self.persistence.save_ipos(&kept, cancel).await
            })
            .await?
        };

        report.absorb(operation, step);
        Ok(report)
    }

    /// Trends are requested for the registry's symbols on `exchanges`,
    /// [`TRENDS_BATCH`] tickers per call.
    async fn import_trends(
        &self,
        exchanges: &[String],
        mut report: ImportReport,
        cancel: &CancellationToken,
    ) -> Result<ImportReport, ImportError> {
        const OPERATION: &str = "trends calendar";

        self.hydrate(cancel).await?;
        let tickers: Vec<String> = exchanges
            .iter()
            .flat_map(|exchange| self.registry.subset_for_exchange(exchange))
            .map(|symbol| symbol.ticker())
            .collect();
        if tickers.is_empty() {
            debug!("No registered symbols for the trends calendar");
            report.outcome = ImportOutcome::NoOp;
            return Ok(report);
        }

        let batches: Vec<&[String]> = tickers.chunks(TRENDS_BATCH).collect();
        let estimate = self
            .meter
            .lock()
            .estimate(Endpoint::CalendarTrends, batches.len());
        if !self.admit(OPERATION, &estimate) {
            report.outcome = ImportOutcome::QuotaDenied;
            return Ok(report);
        }

        for batch in batches {
            if cancel.is_cancelled() {
                return Err(ImportError::Cancelled);
            }
            let fetched = self.gateway.fetch_trends(batch, cancel).await;
            let step = self
                .settle(fetched, cancel, |trends| async move {
                    let resolved: Vec<ResolvedTrend> = trends
                        .into_iter()
                        .filter_map(|mut trend| {
                            let bare = bare_code(&trend.code).to_string();
                            let exchange = self.resolve_exchange(&bare, exchanges)?;
                            trend.code = bare;
                            Some(ResolvedTrend { exchange, trend })
                        })
                        .collect();
                    self.persistence.save_trends(&resolved, cancel).await
                })
                .await?;
            report.absorb(OPERATION, step);
        }
        Ok(report)
    }

    /// Registry exchange of `code`, if it is one of `exchanges`.
    fn resolve_exchange(&self, code: &str, exchanges: &[String]) -> Option<String> {
        let exchange = self.registry.lookup(code)?.exchange;
        exchanges.contains(&exchange).then_some(exchange)
    }
}

/// Tickers per `/calendar/trends` call.
pub const TRENDS_BATCH: usize = 100;

fn bare_code(code: &str) -> &str {
    code.split_once('.').map_or(code, |(bare, _)| bare)
}

fn require_exchange(unit: &ImportUnit) -> Result<(), ImportError> {
    if unit.exchange.trim().is_empty() {
        return Err(ImportError::Configuration(format!(
            "{} import requires an exchange code",
            unit.data_type
        )));
    }
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================
