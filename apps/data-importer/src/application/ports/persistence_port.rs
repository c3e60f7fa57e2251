//! Persistence Port (Driven Port)
//!
//! Interface to the relational store. Every save is an idempotent upsert
//! keyed by the record's natural key; every call honours cancellation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::domain::import::{LogLevel, PurgeTarget};
use crate::domain::market_data::{
    Dividend, Exchange, IpoEvent, OptionChain, PriceBar, ResolvedEarnings, ResolvedTrend, Split,
};
use crate::domain::symbol::Symbol;

/// Errors from persistence operations.
#[derive(Debug, Clone, Error)]
pub enum PersistenceError {
    /// Database connection error.
    #[error("Database connection error: {0}")]
    Connection(String),

    /// Query execution error.
    #[error("Query error: {0}")]
    Query(String),

    /// Data integrity error.
    #[error("Data integrity error: {0}")]
    Integrity(String),

    /// The caller cancelled before the write.
    #[error("Operation cancelled")]
    Cancelled,
}

/// Port for the import store.
///
/// Save methods return the number of rows written.
#[async_trait]
pub trait PersistencePort: Send + Sync {
    /// Upsert symbols on (code, exchange).
    ///
    /// An existing optionable flag is kept; the other attributes are
    /// replaced.
    async fn save_symbols(
        &self,
        symbols: &[Symbol],
        cancel: &CancellationToken,
    ) -> Result<usize, PersistenceError>;

    /// Upsert exchanges on code.
    async fn save_exchanges(
        &self,
        exchanges: &[Exchange],
        cancel: &CancellationToken,
    ) -> Result<usize, PersistenceError>;

    /// Upsert splits on (code, exchange, date).
    async fn save_splits(
        &self,
        splits: &[Split],
        cancel: &CancellationToken,
    ) -> Result<usize, PersistenceError>;

    /// Upsert dividends on (code, exchange, date).
    async fn save_dividends(
        &self,
        dividends: &[Dividend],
        cancel: &CancellationToken,
    ) -> Result<usize, PersistenceError>;

    /// Upsert price bars on (code, exchange, date).
    async fn save_price_actions(
        &self,
        bars: &[PriceBar],
        cancel: &CancellationToken,
    ) -> Result<usize, PersistenceError>;

    /// Upsert an option chain's contracts on contract name.
    async fn save_options(
        &self,
        chain: &OptionChain,
        cancel: &CancellationToken,
    ) -> Result<usize, PersistenceError>;

    /// Upsert earnings on (code, exchange, report date).
    async fn save_earnings(
        &self,
        earnings: &[ResolvedEarnings],
        cancel: &CancellationToken,
    ) -> Result<usize, PersistenceError>;

    /// Upsert IPOs on (code, exchange).
    async fn save_ipos(
        &self,
        ipos: &[IpoEvent],
        cancel: &CancellationToken,
    ) -> Result<usize, PersistenceError>;

    /// Upsert estimate trends on (code, exchange, date, period).
    async fn save_trends(
        &self,
        trends: &[ResolvedTrend],
        cancel: &CancellationToken,
    ) -> Result<usize, PersistenceError>;

    /// Every stored symbol.
    async fn get_all_symbols(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Vec<Symbol>, PersistenceError>;

    /// Stored symbols flagged optionable.
    async fn get_symbols_with_options(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Vec<Symbol>, PersistenceError>;

    /// Flag every stored symbol with one of `codes` as optionable.
    async fn set_optionable_on_symbols(
        &self,
        codes: &[String],
        cancel: &CancellationToken,
    ) -> Result<usize, PersistenceError>;

    /// Delete a whole data set. Returns rows removed.
    async fn purge(
        &self,
        target: PurgeTarget,
        cancel: &CancellationToken,
    ) -> Result<u64, PersistenceError>;

    /// Record how a configured action item ended.
    async fn log_action(
        &self,
        action: &str,
        outcome: &str,
        detail: Option<&str>,
    ) -> Result<(), PersistenceError>;

    /// Delete log rows at or below `level` written before `before`.
    async fn truncate_logs(
        &self,
        level: LogLevel,
        before: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<u64, PersistenceError>;
}
