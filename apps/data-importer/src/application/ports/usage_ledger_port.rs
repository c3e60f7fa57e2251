//! Usage Ledger Port (Driven Port)
//!
//! Durable record of provider spend. Replayed at startup so a restart
//! does not forget usage already consumed today.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};

use super::PersistenceError;
use crate::domain::quota::Endpoint;

/// One charged provider call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageEntry {
    /// When the call completed.
    pub at: DateTime<Utc>,
    /// Endpoint called.
    pub endpoint: Endpoint,
    /// Ticker or exchange the call was for.
    pub target: Option<String>,
    /// Cost charged.
    pub cost: u32,
}

/// Port for the usage ledger.
#[async_trait]
pub trait UsageLedgerPort: Send + Sync {
    /// Total cost logged on a UTC day.
    async fn usage_on(&self, day: NaiveDate) -> Result<u32, PersistenceError>;

    /// Record one charged call.
    async fn append(&self, entry: UsageEntry) -> Result<(), PersistenceError>;
}

/// Ledger that remembers nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpUsageLedger;

#[async_trait]
impl UsageLedgerPort for NoOpUsageLedger {
    async fn usage_on(&self, _day: NaiveDate) -> Result<u32, PersistenceError> {
        Ok(0)
    }

    async fn append(&self, _entry: UsageEntry) -> Result<(), PersistenceError> {
        Ok(())
    }
}
