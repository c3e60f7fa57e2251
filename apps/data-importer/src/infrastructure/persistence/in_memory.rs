//! In-memory import store.
//!
//! Mirrors the PostgreSQL adapter's upsert keys so repeated writes are
//! idempotent, and counts save calls so tests can assert on side effects.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::application::ports::{
    PersistenceError, PersistencePort, UsageEntry, UsageLedgerPort,
};
use crate::domain::import::{LogLevel, PurgeTarget};
use crate::domain::market_data::{
    Dividend, Exchange, IpoEvent, OptionChain, OptionContract, PriceBar, ResolvedEarnings,
    ResolvedTrend, Split,
};
use crate::domain::symbol::Symbol;

type DatedKey = (String, String, NaiveDate);
type TrendKey = (String, String, NaiveDate, String);

/// Number of save calls per data set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteCounts {
    /// `save_symbols` calls.
    pub symbols: usize,
    /// `save_exchanges` calls.
    pub exchanges: usize,
    /// `save_splits` calls.
    pub splits: usize,
    /// `save_dividends` calls.
    pub dividends: usize,
    /// `save_price_actions` calls.
    pub prices: usize,
    /// `save_options` calls.
    pub options: usize,
    /// `save_earnings` calls.
    pub earnings: usize,
    /// `save_ipos` calls.
    pub ipos: usize,
    /// `save_trends` calls.
    pub trends: usize,
}

impl WriteCounts {
    /// Sum over all data sets.
    #[must_use]
    pub const fn total(&self) -> usize {
        self.symbols
            + self.exchanges
            + self.splits
            + self.dividends
            + self.prices
            + self.options
            + self.earnings
            + self.ipos
            + self.trends
    }
}

#[derive(Debug, Clone)]
struct LogRow {
    level: LogLevel,
    at: DateTime<Utc>,
    #[allow(dead_code)]
    message: String,
}

#[derive(Debug, Default)]
struct Tables {
    symbols: BTreeMap<(String, String), Symbol>,
    exchanges: BTreeMap<String, Exchange>,
    splits: BTreeMap<DatedKey, Split>,
    dividends: BTreeMap<DatedKey, Dividend>,
    prices: BTreeMap<DatedKey, PriceBar>,
    options: HashMap<String, (String, String, OptionContract)>,
    earnings: BTreeMap<DatedKey, ResolvedEarnings>,
    ipos: BTreeMap<(String, String), IpoEvent>,
    trends: BTreeMap<TrendKey, ResolvedTrend>,
    logs: Vec<LogRow>,
    action_logs: Vec<String>,
    usage: Vec<UsageEntry>,
}

impl Tables {
    fn clear_imports(&mut self) -> u64 {
        let removed = self.symbols.len()
            + self.exchanges.len()
            + self.splits.len()
            + self.dividends.len()
            + self.prices.len()
            + self.options.len()
            + self.earnings.len()
            + self.ipos.len()
            + self.trends.len();
        self.symbols.clear();
        self.exchanges.clear();
        self.splits.clear();
        self.dividends.clear();
        self.prices.clear();
        self.options.clear();
        self.earnings.clear();
        self.ipos.clear();
        self.trends.clear();
        removed as u64
    }
}

/// In-memory implementation of `PersistencePort` and `UsageLedgerPort`.
///
/// Suitable for testing and dry runs. Not for production use.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    tables: RwLock<Tables>,
    writes: Mutex<WriteCounts>,
    optionable_calls: Mutex<usize>,
    fail_next_write: Mutex<Option<PersistenceError>>,
}

impl InMemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Save calls made so far.
    #[must_use]
    pub fn writes(&self) -> WriteCounts {
        *self.writes.lock()
    }

    /// `set_optionable_on_symbols` calls made so far.
    #[must_use]
    pub fn optionable_update_calls(&self) -> usize {
        *self.optionable_calls.lock()
    }

    /// Make the next save fail with `error`.
    pub fn fail_next_write(&self, error: PersistenceError) {
        *self.fail_next_write.lock() = Some(error);
    }

    /// Number of stored symbols.
    #[must_use]
    pub fn symbol_count(&self) -> usize {
        self.tables.read().symbols.len()
    }

    /// Stored splits for a symbol, by date.
    #[must_use]
    pub fn splits_for(&self, code: &str, exchange: &str) -> Vec<Split> {
        self.tables
            .read()
            .splits
            .values()
            .filter(|s| s.code == code && s.exchange == exchange)
            .cloned()
            .collect()
    }

    /// Stored dividends for a symbol, by date.
    #[must_use]
    pub fn dividends_for(&self, code: &str, exchange: &str) -> Vec<Dividend> {
        self.tables
            .read()
            .dividends
            .values()
            .filter(|d| d.code == code && d.exchange == exchange)
            .cloned()
            .collect()
    }

    /// Stored earnings rows.
    #[must_use]
    pub fn earnings(&self) -> Vec<ResolvedEarnings> {
        self.tables.read().earnings.values().cloned().collect()
    }

    /// Stored IPO rows.
    #[must_use]
    pub fn ipos(&self) -> Vec<IpoEvent> {
        self.tables.read().ipos.values().cloned().collect()
    }

    /// Stored trend rows.
    #[must_use]
    pub fn trends(&self) -> Vec<ResolvedTrend> {
        self.tables.read().trends.values().cloned().collect()
    }

    /// Append an application log row.
    pub fn append_log(&self, level: LogLevel, at: DateTime<Utc>, message: impl Into<String>) {
        self.tables.write().logs.push(LogRow {
            level,
            at,
            message: message.into(),
        });
    }

    /// Recorded action item outcomes, oldest first.
    #[must_use]
    pub fn action_logs(&self) -> Vec<String> {
        self.tables.read().action_logs.clone()
    }

    /// Number of application log rows.
    #[must_use]
    pub fn log_count(&self) -> usize {
        self.tables.read().logs.len()
    }

    fn begin_write(
        &self,
        cancel: &CancellationToken,
        bump: impl FnOnce(&mut WriteCounts),
    ) -> Result<(), PersistenceError> {
        if cancel.is_cancelled() {
            return Err(PersistenceError::Cancelled);
        }
        if let Some(error) = self.fail_next_write.lock().take() {
            return Err(error);
        }
        bump(&mut self.writes.lock());
        Ok(())
    }
}

fn dated(code: &str, exchange: &str, date: NaiveDate) -> DatedKey {
    (code.to_string(), exchange.to_string(), date)
}

fn check(cancel: &CancellationToken) -> Result<(), PersistenceError> {
    if cancel.is_cancelled() {
        Err(PersistenceError::Cancelled)
    } else {
        Ok(())
    }
}

#[async_trait]
impl PersistencePort for InMemoryStore {
    async fn save_symbols(
        &self,
        symbols: &[Symbol],
        cancel: &CancellationToken,
    ) -> Result<usize, PersistenceError> {
        self.begin_write(cancel, |w| w.symbols += 1)?;
        let mut tables = self.tables.write();
        for symbol in symbols {
            let key = (symbol.code.clone(), symbol.exchange.clone());
            let was_optionable = tables.symbols.get(&key).is_some_and(|s| s.is_optionable);
            let mut stored = symbol.clone();
            stored.is_optionable |= was_optionable;
            tables.symbols.insert(key, stored);
        }
        Ok(symbols.len())
    }

    async fn save_exchanges(
        &self,
        exchanges: &[Exchange],
        cancel: &CancellationToken,
    ) -> Result<usize, PersistenceError> {
        self.begin_write(cancel, |w| w.exchanges += 1)?;
        let mut tables = self.tables.write();
        for exchange in exchanges {
            tables
                .exchanges
                .insert(exchange.code.clone(), exchange.clone());
        }
        Ok(exchanges.len())
    }

    async fn save_splits(
        &self,
        splits: &[Split],
        cancel: &CancellationToken,
    ) -> Result<usize, PersistenceError> {
        self.begin_write(cancel, |w| w.splits += 1)?;
        let mut tables = self.tables.write();
        for split in splits {
            tables
                .splits
                .insert(dated(&split.code, &split.exchange, split.date), split.clone());
        }
        Ok(splits.len())
    }

    async fn save_dividends(
        &self,
        dividends: &[Dividend],
        cancel: &CancellationToken,
    ) -> Result<usize, PersistenceError> {
        self.begin_write(cancel, |w| w.dividends += 1)?;
        let mut tables = self.tables.write();
        for dividend in dividends {
            tables.dividends.insert(
                dated(&dividend.code, &dividend.exchange, dividend.date),
                dividend.clone(),
            );
        }
        Ok(dividends.len())
    }

    async fn save_price_actions(
        &self,
        bars: &[PriceBar],
        cancel: &CancellationToken,
    ) -> Result<usize, PersistenceError> {
        self.begin_write(cancel, |w| w.prices += 1)?;
        let mut tables = self.tables.write();
        for bar in bars {
            tables
                .prices
                .insert(dated(&bar.code, &bar.exchange, bar.date), bar.clone());
        }
        Ok(bars.len())
    }

    async fn save_options(
        &self,
        chain: &OptionChain,
        cancel: &CancellationToken,
    ) -> Result<usize, PersistenceError> {
        self.begin_write(cancel, |w| w.options += 1)?;
        let mut tables = self.tables.write();
        for contract in &chain.contracts {
            tables.options.insert(
                contract.contract_name.clone(),
                (chain.code.clone(), chain.exchange.clone(), contract.clone()),
            );
        }
        Ok(chain.contracts.len())
    }

    async fn save_earnings(
        &self,
        earnings: &[ResolvedEarnings],
        cancel: &CancellationToken,
    ) -> Result<usize, PersistenceError> {
        self.begin_write(cancel, |w| w.earnings += 1)?;
        let mut tables = self.tables.write();
        for row in earnings {
            tables.earnings.insert(
                dated(&row.event.code, &row.exchange, row.event.report_date),
                row.clone(),
            );
        }
        Ok(earnings.len())
    }

    async fn save_ipos(
        &self,
        ipos: &[IpoEvent],
        cancel: &CancellationToken,
    ) -> Result<usize, PersistenceError> {
        self.begin_write(cancel, |w| w.ipos += 1)?;
        let mut tables = self.tables.write();
        for ipo in ipos {
            tables
                .ipos
                .insert((ipo.code.clone(), ipo.exchange.clone()), ipo.clone());
        }
        Ok(ipos.len())
    }

    async fn save_trends(
        &self,
        trends: &[ResolvedTrend],
        cancel: &CancellationToken,
    ) -> Result<usize, PersistenceError> {
        self.begin_write(cancel, |w| w.trends += 1)?;
        let mut tables = self.tables.write();
        for row in trends {
            let key = (
                row.trend.code.clone(),
                row.exchange.clone(),
                row.trend.date,
                row.trend.period.clone(),
            );
            tables.trends.insert(key, row.clone());
        }
        Ok(trends.len())
    }

    async fn get_all_symbols(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Vec<Symbol>, PersistenceError> {
        check(cancel)?;
        Ok(self.tables.read().symbols.values().cloned().collect())
    }

    async fn get_symbols_with_options(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Vec<Symbol>, PersistenceError> {
        check(cancel)?;
        Ok(self
            .tables
            .read()
            .symbols
            .values()
            .filter(|s| s.is_optionable)
            .cloned()
            .collect())
    }

    async fn set_optionable_on_symbols(
        &self,
        codes: &[String],
        cancel: &CancellationToken,
    ) -> Result<usize, PersistenceError> {
        check(cancel)?;
        *self.optionable_calls.lock() += 1;
        let mut tables = self.tables.write();
        let mut updated = 0;
        for symbol in tables.symbols.values_mut() {
            if codes.contains(&symbol.code) {
                symbol.is_optionable = true;
                updated += 1;
            }
        }
        Ok(updated)
    }

    async fn purge(
        &self,
        target: PurgeTarget,
        cancel: &CancellationToken,
    ) -> Result<u64, PersistenceError> {
        check(cancel)?;
        let mut tables = self.tables.write();
        let removed = match target {
            PurgeTarget::Logs => tables.logs.drain(..).count() as u64,
            PurgeTarget::ActionLogs => tables.action_logs.drain(..).count() as u64,
            PurgeTarget::Imports => tables.clear_imports(),
        };
        Ok(removed)
    }

    async fn log_action(
        &self,
        action: &str,
        outcome: &str,
        detail: Option<&str>,
    ) -> Result<(), PersistenceError> {
        let line = match detail {
            Some(detail) => format!("{action}: {outcome} ({detail})"),
            None => format!("{action}: {outcome}"),
        };
        self.tables.write().action_logs.push(line);
        Ok(())
    }

    async fn truncate_logs(
        &self,
        level: LogLevel,
        before: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<u64, PersistenceError> {
        check(cancel)?;
        let mut tables = self.tables.write();
        let before_len = tables.logs.len();
        tables
            .logs
            .retain(|row| !(row.level <= level && row.at < before));
        Ok((before_len - tables.logs.len()) as u64)
    }
}

#[async_trait]
impl UsageLedgerPort for InMemoryStore {
    async fn usage_on(&self, day: NaiveDate) -> Result<u32, PersistenceError> {
        Ok(self
            .tables
            .read()
            .usage
            .iter()
            .filter(|entry| entry.at.date_naive() == day)
            .fold(0u32, |total, entry| total.saturating_add(entry.cost)))
    }

    async fn append(&self, entry: UsageEntry) -> Result<(), PersistenceError> {
        self.tables.write().usage.push(entry);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use rust_decimal::Decimal;

    use super::*;
    use crate::domain::quota::Endpoint;

    fn split(code: &str, date: NaiveDate, after: i64) -> Split {
        Split {
            code: code.to_string(),
            exchange: "US".to_string(),
            date,
            before: Decimal::ONE,
            after: Decimal::from(after),
        }
    }

    #[tokio::test]
    async fn upserts_are_idempotent() {
        let store = InMemoryStore::new();
        let cancel = CancellationToken::new();
        let date = NaiveDate::from_ymd_opt(2022, 7, 15).unwrap();

        store.save_splits(&[split("GOOGL", date, 10)], &cancel).await.unwrap();
        store.save_splits(&[split("GOOGL", date, 20)], &cancel).await.unwrap();

        let stored = store.splits_for("GOOGL", "US");
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].after, Decimal::from(20));
        assert_eq!(store.writes().splits, 2);
    }

    #[tokio::test]
    async fn cancelled_write_is_refused() {
        let store = InMemoryStore::new();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = store.save_symbols(&[Symbol::new("AAA", "US")], &cancel).await;
        assert!(matches!(result, Err(PersistenceError::Cancelled)));
        assert_eq!(store.writes().total(), 0);
        assert_eq!(store.symbol_count(), 0);
    }

    #[tokio::test]
    async fn injected_failure_hits_one_write() {
        let store = InMemoryStore::new();
        let cancel = CancellationToken::new();
        store.fail_next_write(PersistenceError::Query("deadlock".into()));

        assert!(store.save_symbols(&[], &cancel).await.is_err());
        assert!(store.save_symbols(&[], &cancel).await.is_ok());
    }

    #[tokio::test]
    async fn ledger_sums_one_day() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        for (at, cost) in [(now, 1), (now, 10), (now - Duration::days(1), 100)] {
            store
                .append(UsageEntry {
                    at,
                    endpoint: Endpoint::Eod,
                    target: None,
                    cost,
                })
                .await
                .unwrap();
        }

        assert_eq!(store.usage_on(now.date_naive()).await.unwrap(), 11);
    }

    #[tokio::test]
    async fn symbol_reimport_keeps_optionable_flag() {
        let store = InMemoryStore::new();
        let cancel = CancellationToken::new();
        let spy = Symbol::new("SPY", "US");

        store.save_symbols(&[spy.clone()], &cancel).await.unwrap();
        store
            .set_optionable_on_symbols(&["SPY".to_string()], &cancel)
            .await
            .unwrap();

        let renamed = Symbol {
            name: Some("SPDR S&P 500 ETF Trust".to_string()),
            ..spy
        };
        store.save_symbols(&[renamed], &cancel).await.unwrap();

        let optionable = store.get_symbols_with_options(&cancel).await.unwrap();
        assert_eq!(optionable.len(), 1);
        assert_eq!(optionable[0].name.as_deref(), Some("SPDR S&P 500 ETF Trust"));
    }
}
