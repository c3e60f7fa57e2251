//! Maintenance
//!
//! Purges, log truncation and named data fixes. These run as configured
//! action items alongside imports and never touch the provider.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::notifications::NotificationHub;
use crate::application::ports::{PersistenceError, PersistencePort};
use crate::domain::import::{Fix, LogLevel, ParseError, PurgeTarget};

/// Codes sent to the store per `set_optionable_on_symbols` call.
pub const OPTIONABLE_FIX_CHUNK: usize = 500;

/// Maintenance failure.
#[derive(Debug, Error)]
pub enum MaintenanceError {
    /// Cancellation was requested.
    #[error("maintenance cancelled")]
    Cancelled,

    /// The store rejected the operation.
    #[error("persistence failed: {0}")]
    Persistence(PersistenceError),

    /// Unknown fix name.
    #[error(transparent)]
    UnknownFix(#[from] ParseError),

    /// The fix input file could not be read.
    #[error("failed to read fix file {path}: {message}")]
    FixFile {
        /// File that was read.
        path: PathBuf,
        /// I/O error text.
        message: String,
    },
}

impl From<PersistenceError> for MaintenanceError {
    fn from(err: PersistenceError) -> Self {
        match err {
            PersistenceError::Cancelled => Self::Cancelled,
            other => Self::Persistence(other),
        }
    }
}

/// Store housekeeping.
pub struct MaintenanceService<P: PersistencePort> {
    persistence: Arc<P>,
    fix_file: PathBuf,
    notifications: Arc<NotificationHub>,
}

impl<P: PersistencePort> MaintenanceService<P> {
    /// Create a service. `fix_file` lists optionable codes, one per line.
    pub fn new(
        persistence: Arc<P>,
        fix_file: impl Into<PathBuf>,
        notifications: Arc<NotificationHub>,
    ) -> Self {
        Self {
            persistence,
            fix_file: fix_file.into(),
            notifications,
        }
    }

    /// Delete a whole data set.
    pub async fn purge(
        &self,
        target: PurgeTarget,
        cancel: &CancellationToken,
    ) -> Result<u64, MaintenanceError> {
        if cancel.is_cancelled() {
            return Err(MaintenanceError::Cancelled);
        }
        self.notifications
            .progress(format!("Purging\t{}", target.as_str()));
        let removed = self.persistence.purge(target, cancel).await?;
        info!(target = target.as_str(), removed, "Purge complete");
        Ok(removed)
    }

    /// Delete logs at or below `level` older than `before`.
    ///
    /// A cut-off in the future deletes nothing.
    pub async fn truncate_logs(
        &self,
        level: LogLevel,
        before: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<u64, MaintenanceError> {
        if cancel.is_cancelled() {
            return Err(MaintenanceError::Cancelled);
        }
        if before > Utc::now() {
            debug!(%before, "Truncation cut-off is in the future, skipping");
            return Ok(0);
        }
        let removed = self.persistence.truncate_logs(level, before, cancel).await?;
        info!(level = level.as_str(), %before, removed, "Logs truncated");
        Ok(removed)
    }

    /// Apply a fix by configured name (case-insensitive).
    pub async fn apply_fix_named(
        &self,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<usize, MaintenanceError> {
        let fix: Fix = name.parse()?;
        self.apply_fix(fix, cancel).await
    }

    /// Apply a fix. Returns the number of symbols updated.
    pub async fn apply_fix(
        &self,
        fix: Fix,
        cancel: &CancellationToken,
    ) -> Result<usize, MaintenanceError> {
        if cancel.is_cancelled() {
            return Err(MaintenanceError::Cancelled);
        }
        match fix {
            Fix::HasOptions => self.flag_optionable(cancel).await,
        }
    }

    async fn flag_optionable(&self, cancel: &CancellationToken) -> Result<usize, MaintenanceError> {
        let contents = tokio::fs::read_to_string(&self.fix_file)
            .await
            .map_err(|e| MaintenanceError::FixFile {
                path: self.fix_file.clone(),
                message: e.to_string(),
            })?;

        let codes: Vec<String> = contents
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect();

        self.notifications.progress(format!(
            "Fixing\thas options ({} codes)",
            codes.len()
        ));

        let mut updated = 0;
        for chunk in codes.chunks(OPTIONABLE_FIX_CHUNK) {
            updated += self
                .persistence
                .set_optionable_on_symbols(chunk, cancel)
                .await?;
        }

        info!(codes = codes.len(), updated, "Optionable fix applied");
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use chrono::Duration;

    use super::*;
    use crate::domain::symbol::Symbol;
    use crate::infrastructure::persistence::InMemoryStore;

    fn service(store: &Arc<InMemoryStore>, fix_file: impl Into<PathBuf>) -> MaintenanceService<InMemoryStore> {
        MaintenanceService::new(
            Arc::clone(store),
            fix_file,
            Arc::new(NotificationHub::with_defaults()),
        )
    }

    #[tokio::test]
    async fn has_options_fix_updates_in_chunks() {
        let store = Arc::new(InMemoryStore::new());
        let cancel = CancellationToken::new();
        let symbols: Vec<Symbol> = (0..1_203)
            .map(|i| Symbol::new(format!("S{i:04}"), "US"))
            .collect();
        store.save_symbols(&symbols, &cancel).await.unwrap();

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "  S0000  ").unwrap();
        writeln!(file).unwrap();
        for i in 1..1_203 {
            writeln!(file, "S{i:04}").unwrap();
        }

        let updated = service(&store, file.path())
            .apply_fix_named("Has Options", &cancel)
            .await
            .unwrap();

        assert_eq!(updated, 1_203);
        assert_eq!(store.optionable_update_calls(), 3);
        assert_eq!(
            store.get_symbols_with_options(&cancel).await.unwrap().len(),
            1_203
        );
    }

    #[tokio::test]
    async fn unknown_fix_is_rejected() {
        let store = Arc::new(InMemoryStore::new());
        let result = service(&store, "unused.txt")
            .apply_fix_named("has dividends", &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(MaintenanceError::UnknownFix(_))));
    }

    #[tokio::test]
    async fn missing_fix_file_is_reported() {
        let store = Arc::new(InMemoryStore::new());
        let dir = tempfile::tempdir().unwrap();
        let result = service(&store, dir.path().join("missing.txt"))
            .apply_fix(Fix::HasOptions, &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(MaintenanceError::FixFile { .. })));
    }

    #[tokio::test]
    async fn future_truncation_is_a_no_op() {
        let store = Arc::new(InMemoryStore::new());
        store.append_log(LogLevel::Info, Utc::now() - Duration::days(3), "old");

        let removed = service(&store, "unused.txt")
            .truncate_logs(
                LogLevel::Error,
                Utc::now() + Duration::days(1),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(removed, 0);
        assert_eq!(store.log_count(), 1);
    }

    #[tokio::test]
    async fn truncation_respects_level_and_cut_off() {
        let store = Arc::new(InMemoryStore::new());
        let now = Utc::now();
        store.append_log(LogLevel::Debug, now - Duration::days(10), "old debug");
        store.append_log(LogLevel::Error, now - Duration::days(10), "old error");
        store.append_log(LogLevel::Debug, now, "fresh debug");

        let removed = service(&store, "unused.txt")
            .truncate_logs(LogLevel::Warn, now - Duration::days(1), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(removed, 1);
        assert_eq!(store.log_count(), 2);
    }

    #[tokio::test]
    async fn purge_imports_clears_market_data() {
        let store = Arc::new(InMemoryStore::new());
        let cancel = CancellationToken::new();
        store
            .save_symbols(&[Symbol::new("AAA", "US")], &cancel)
            .await
            .unwrap();

        let removed = service(&store, "unused.txt")
            .purge(PurgeTarget::Imports, &cancel)
            .await
            .unwrap();

        assert_eq!(removed, 1);
        assert!(store.get_all_symbols(&cancel).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn cancelled_purge_does_nothing() {
        let store = Arc::new(InMemoryStore::new());
        let cancel = CancellationToken::new();
        store
            .save_symbols(&[Symbol::new("AAA", "US")], &cancel)
            .await
            .unwrap();
        cancel.cancel();

        let result = service(&store, "unused.txt")
            .purge(PurgeTarget::Imports, &cancel)
            .await;

        assert!(matches!(result, Err(MaintenanceError::Cancelled)));
        assert_eq!(store.symbol_count(), 1);
    }
}
