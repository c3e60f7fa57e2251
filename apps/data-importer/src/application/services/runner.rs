//! Action Runner
//!
//! Executes the configured action items in order. Each item's outcome is
//! written to the action log. An item that fails is reported and, unless
//! `cancel_on_error` is set, the run moves on to the next item.

use std::sync::Arc;
use std::time::Instant;

use chrono::{TimeDelta, Utc};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::importer::{ImportError, ImportOrchestrator, ImportOutcome, ImportReport};
use super::maintenance::{MaintenanceError, MaintenanceService};
use crate::application::ports::{GatewayPort, PersistencePort, UsageLedgerPort};
use crate::domain::import::ActionItem;

/// Failure of one action item.
#[derive(Debug, Error)]
pub enum ActionError {
    /// An import or calendar item failed.
    #[error(transparent)]
    Import(#[from] ImportError),

    /// A maintenance item failed.
    #[error(transparent)]
    Maintenance(#[from] MaintenanceError),
}

impl ActionError {
    /// Whether the failure was a cancellation.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(
            self,
            Self::Import(ImportError::Cancelled) | Self::Maintenance(MaintenanceError::Cancelled)
        )
    }
}

/// How one item ended.
#[derive(Debug)]
pub enum ActionStatus {
    /// Import or calendar item that ran.
    Imported(ImportReport),
    /// Maintenance item; rows affected.
    Maintained(u64),
    /// `skip` item.
    Skipped,
    /// The item failed.
    Failed(ActionError),
}

impl ActionStatus {
    /// Outcome label written to the action log.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Imported(report) => match report.outcome {
                ImportOutcome::Completed => "completed",
                ImportOutcome::QuotaDenied => "quota_denied",
                ImportOutcome::NoOp => "no_op",
            },
            Self::Maintained(_) => "completed",
            Self::Skipped => "skipped",
            Self::Failed(e) if e.is_cancelled() => "cancelled",
            Self::Failed(_) => "failed",
        }
    }

    fn detail(&self) -> Option<String> {
        match self {
            Self::Imported(report) => Some(format!(
                "calls={} persisted={} records={} failed={} cost={}",
                report.calls,
                report.persisted,
                report.records,
                report.failed.len(),
                report.cost
            )),
            Self::Maintained(rows) => Some(format!("rows={rows}")),
            Self::Skipped => None,
            Self::Failed(e) => Some(e.to_string()),
        }
    }
}

/// One executed item.
#[derive(Debug)]
pub struct ActionResult {
    /// The item.
    pub item: ActionItem,
    /// What happened.
    pub status: ActionStatus,
}

/// Everything a run did.
#[derive(Debug, Default)]
pub struct RunSummary {
    /// Executed items, in order.
    pub results: Vec<ActionResult>,
    /// Items never started because the run stopped early.
    pub not_started: usize,
}

impl RunSummary {
    /// Items that failed (cancellations included).
    #[must_use]
    pub fn failures(&self) -> usize {
        self.results
            .iter()
            .filter(|r| matches!(r.status, ActionStatus::Failed(_)))
            .count()
    }
}

/// Runner settings.
#[derive(Debug, Clone, Copy)]
pub struct RunnerSettings {
    /// Logs older than this are removed by `truncate` items.
    pub log_retention: TimeDelta,
    /// Stop after the first failed item.
    pub cancel_on_error: bool,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            log_retention: TimeDelta::days(30),
            cancel_on_error: false,
        }
    }
}

/// Sequential action item executor.
pub struct ActionRunner<G, P, L>
where
    G: GatewayPort,
    P: PersistencePort,
    L: UsageLedgerPort,
{
    orchestrator: Arc<ImportOrchestrator<G, P, L>>,
    maintenance: MaintenanceService<P>,
    persistence: Arc<P>,
    settings: RunnerSettings,
}

impl<G, P, L> ActionRunner<G, P, L>
where
    G: GatewayPort,
    P: PersistencePort,
    L: UsageLedgerPort,
{
    /// Create a runner.
    pub const fn new(
        orchestrator: Arc<ImportOrchestrator<G, P, L>>,
        maintenance: MaintenanceService<P>,
        persistence: Arc<P>,
        settings: RunnerSettings,
    ) -> Self {
        Self {
            orchestrator,
            maintenance,
            persistence,
            settings,
        }
    }

    /// Run `items` in order until done, cancelled, or (with
    /// `cancel_on_error`) the first failure.
    pub async fn run(&self, items: &[ActionItem], cancel: &CancellationToken) -> RunSummary {
        let mut summary = RunSummary::default();

        for (index, item) in items.iter().enumerate() {
            if cancel.is_cancelled() {
                summary.not_started = items.len() - index;
                warn!(remaining = summary.not_started, "Run cancelled, skipping remaining actions");
                break;
            }

            let started = Instant::now();
            let status = self.execute(item, cancel).await;
            let elapsed_ms = started.elapsed().as_millis() as u64;

            match &status {
                ActionStatus::Failed(e) => {
                    error!(action = %item, error = %e, elapsed_ms, "Action failed");
                }
                other => {
                    info!(action = %item, outcome = other.label(), elapsed_ms, "Action finished");
                }
            }

            if let Err(e) = self
                .persistence
                .log_action(&item.to_string(), status.label(), status.detail().as_deref())
                .await
            {
                warn!(action = %item, error = %e, "Failed to write action log");
            }

            let stop = matches!(&status, ActionStatus::Failed(e)
                if e.is_cancelled() || self.settings.cancel_on_error);
            summary.results.push(ActionResult {
                item: item.clone(),
                status,
            });

            if stop {
                summary.not_started = items.len() - index - 1;
                if summary.not_started > 0 {
                    warn!(remaining = summary.not_started, "Stopping run after failed action");
                }
                break;
            }
        }

        summary
    }

    async fn execute(&self, item: &ActionItem, cancel: &CancellationToken) -> ActionStatus {
        let result: Result<ActionStatus, ActionError> = match item {
            ActionItem::Import(unit) => self
                .orchestrator
                .import(unit, cancel)
                .await
                .map(ActionStatus::Imported)
                .map_err(ActionError::from),
            ActionItem::Calendar { kind, exchanges } => self
                .orchestrator
                .import_calendar(*kind, exchanges, cancel)
                .await
                .map(ActionStatus::Imported)
                .map_err(ActionError::from),
            ActionItem::Purge(target) => self
                .maintenance
                .purge(*target, cancel)
                .await
                .map(ActionStatus::Maintained)
                .map_err(ActionError::from),
            ActionItem::Truncate(level) => self
                .maintenance
                .truncate_logs(*level, Utc::now() - self.settings.log_retention, cancel)
                .await
                .map(ActionStatus::Maintained)
                .map_err(ActionError::from),
            ActionItem::Fix(fix) => self
                .maintenance
                .apply_fix(*fix, cancel)
                .await
                .map(|updated| ActionStatus::Maintained(updated as u64))
                .map_err(ActionError::from),
            ActionItem::Skip => Ok(ActionStatus::Skipped),
        };
        result.unwrap_or_else(ActionStatus::Failed)
    }
}
