//! PostgreSQL import store.
//!
//! Upserts are batched with `QueryBuilder::push_values` and keyed by
//! each table's natural key (`ON CONFLICT .. DO UPDATE`), so re-running
//! an import rewrites rows in place. Batches are sized to stay under
//! PostgreSQL's bind parameter limit. Rows repeating a natural key are
//! collapsed to the last one first, since one `ON CONFLICT DO UPDATE`
//! statement cannot touch the same row twice.
//!
//! The same pool backs the usage ledger (`api_usage_log`).

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::hash::Hash;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveTime, TimeDelta, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::query_builder::Separated;
use sqlx::{Postgres, QueryBuilder, Row};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::application::ports::{
    PersistenceError, PersistencePort, UsageEntry, UsageLedgerPort,
};
use crate::domain::import::{LogLevel, PurgeTarget};
use crate::domain::market_data::{
    Dividend, Exchange, IpoEvent, OptionChain, PriceBar, ResolvedEarnings, ResolvedTrend, Split,
};
use crate::domain::symbol::Symbol;

/// PostgreSQL bind parameter ceiling per statement.
const MAX_BIND_PARAMS: usize = 65_535;

/// Tables cleared by `PurgeTarget::Imports`, children first.
const IMPORT_TABLES: [&str; 9] = [
    "options",
    "price_actions",
    "dividends",
    "splits",
    "calendar_earnings",
    "calendar_ipos",
    "calendar_trends",
    "symbols",
    "exchanges",
];

// ============================================================================
// Error Mapping
// ============================================================================

fn map_sqlx(err: sqlx::Error) -> PersistenceError {
    match err {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::Configuration(_) => PersistenceError::Connection(err.to_string()),
        sqlx::Error::Database(ref db)
            if db.is_unique_violation()
                || db.is_foreign_key_violation()
                || db.is_check_violation() =>
        {
            PersistenceError::Integrity(err.to_string())
        }
        other => PersistenceError::Query(other.to_string()),
    }
}

const fn rows_per_batch(columns: usize) -> usize {
    MAX_BIND_PARAMS / columns
}

fn check(cancel: &CancellationToken) -> Result<(), PersistenceError> {
    if cancel.is_cancelled() {
        Err(PersistenceError::Cancelled)
    } else {
        Ok(())
    }
}

/// Keep the last row for each key, in first-seen key order.
fn last_per_key<T, K, F>(rows: &[T], key: F) -> Vec<&T>
where
    K: Eq + Hash,
    F: Fn(&T) -> K,
{
    let mut slots: HashMap<K, usize> = HashMap::with_capacity(rows.len());
    let mut kept: Vec<&T> = Vec::with_capacity(rows.len());
    for row in rows {
        match slots.entry(key(row)) {
            Entry::Occupied(slot) => kept[*slot.get()] = row,
            Entry::Vacant(slot) => {
                slot.insert(kept.len());
                kept.push(row);
            }
        }
    }
    kept
}

fn day_bounds(day: NaiveDate) -> (DateTime<Utc>, DateTime<Utc>) {
    let start = day.and_time(NaiveTime::MIN).and_utc();
    (start, start + TimeDelta::days(1))
}

// ============================================================================
// Store
// ============================================================================

/// PostgreSQL implementation of `PersistencePort` and `UsageLedgerPort`.
#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Connect with the given pool size.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, PersistenceError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(map_sqlx)?;

        info!(max_connections, "PostgreSQL pool connected");
        Ok(Self { pool })
    }

    /// Wrap an existing pool.
    #[must_use]
    pub const fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Apply pending schema migrations.
    pub async fn migrate(&self) -> Result<(), PersistenceError> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(|e| PersistenceError::Query(format!("migration failed: {e}")))?;
        info!("Database migrations applied");
        Ok(())
    }

    /// Batched upsert.
    ///
    /// `insert` is the `INSERT INTO t (cols) ` head, `conflict` the
    /// `ON CONFLICT` tail, `key` the conflict target of one row, and
    /// `bind` pushes one row's `columns` values.
    #[allow(clippy::too_many_arguments)]
    async fn upsert<T, K, KF, F>(
        &self,
        rows: &[T],
        key: KF,
        columns: usize,
        insert: &str,
        conflict: &str,
        mut bind: F,
        cancel: &CancellationToken,
    ) -> Result<usize, PersistenceError>
    where
        T: Sync,
        K: Eq + Hash,
        KF: Fn(&T) -> K + Send,
        F: FnMut(Separated<'_, 'static, Postgres, &'static str>, &T) + Send,
    {
        let rows = last_per_key(rows, key);
        let mut written = 0;
        for batch in rows.chunks(rows_per_batch(columns)) {
            check(cancel)?;
            let mut builder: QueryBuilder<'static, Postgres> = QueryBuilder::new(insert);
            builder.push_values(batch, |row, item| bind(row, *item));
            builder.push(conflict);

            let result = builder
                .build()
                .execute(&self.pool)
                .await
                .map_err(map_sqlx)?;
            written += result.rows_affected() as usize;
        }
        Ok(written)
    }

    async fn fetch_symbols(
        &self,
        sql: &'static str,
        cancel: &CancellationToken,
    ) -> Result<Vec<Symbol>, PersistenceError> {
        check(cancel)?;
        let rows = sqlx::query(sql)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx)?;
        rows.iter().map(symbol_from_row).collect()
    }
}

fn symbol_from_row(row: &PgRow) -> Result<Symbol, PersistenceError> {
    Ok(Symbol {
        code: row.try_get("code").map_err(map_sqlx)?,
        exchange: row.try_get("exchange").map_err(map_sqlx)?,
        name: row.try_get("name").map_err(map_sqlx)?,
        instrument_type: row.try_get("instrument_type").map_err(map_sqlx)?,
        is_optionable: row.try_get("has_options").map_err(map_sqlx)?,
    })
}

// ============================================================================
// Persistence Port
// ============================================================================

#[async_trait]
impl PersistencePort for PostgresStore {
    async fn save_symbols(
        &self,
        symbols: &[Symbol],
        cancel: &CancellationToken,
    ) -> Result<usize, PersistenceError> {
        let written = self
            .upsert(
                symbols,
                |s| (s.code.clone(), s.exchange.clone()),
                5,
                "INSERT INTO symbols (code, exchange, name, instrument_type, has_options) ",
                r"
                ON CONFLICT (code, exchange) DO UPDATE SET
                    name = EXCLUDED.name,
                    instrument_type = EXCLUDED.instrument_type,
                    has_options = symbols.has_options OR EXCLUDED.has_options,
                    updated_at = NOW()
                ",
                |mut row, symbol| {
                    row.push_bind(symbol.code.clone())
                        .push_bind(symbol.exchange.clone())
                        .push_bind(symbol.name.clone())
                        .push_bind(symbol.instrument_type.clone())
                        .push_bind(symbol.is_optionable);
                },
                cancel,
            )
            .await?;
        debug!(written, "Symbols upserted");
        Ok(written)
    }

    async fn save_exchanges(
        &self,
        exchanges: &[Exchange],
        cancel: &CancellationToken,
    ) -> Result<usize, PersistenceError> {
        self.upsert(
            exchanges,
            |e| e.code.clone(),
            5,
            "INSERT INTO exchanges (code, name, operating_mic, country, currency) ",
            r"
            ON CONFLICT (code) DO UPDATE SET
                name = EXCLUDED.name,
                operating_mic = EXCLUDED.operating_mic,
                country = EXCLUDED.country,
                currency = EXCLUDED.currency,
                updated_at = NOW()
            ",
            |mut row, exchange| {
                row.push_bind(exchange.code.clone())
                    .push_bind(exchange.name.clone())
                    .push_bind(exchange.operating_mic.clone())
                    .push_bind(exchange.country.clone())
                    .push_bind(exchange.currency.clone());
            },
            cancel,
        )
        .await
    }

    async fn save_splits(
        &self,
        splits: &[Split],
        cancel: &CancellationToken,
    ) -> Result<usize, PersistenceError> {
        self.upsert(
            splits,
            |s| (s.code.clone(), s.exchange.clone(), s.date),
            5,
            "INSERT INTO splits (code, exchange, date_of_split, before_split, after_split) ",
            r"
            ON CONFLICT (code, exchange, date_of_split) DO UPDATE SET
                before_split = EXCLUDED.before_split,
                after_split = EXCLUDED.after_split,
                updated_at = NOW()
            ",
            |mut row, split| {
                row.push_bind(split.code.clone())
                    .push_bind(split.exchange.clone())
                    .push_bind(split.date)
                    .push_bind(split.before)
                    .push_bind(split.after);
            },
            cancel,
        )
        .await
    }

    async fn save_dividends(
        &self,
        dividends: &[Dividend],
        cancel: &CancellationToken,
    ) -> Result<usize, PersistenceError> {
        self.upsert(
            dividends,
            |d| (d.code.clone(), d.exchange.clone(), d.date),
            10,
            r"INSERT INTO dividends (
                code, exchange, date, value, unadjusted_value, currency,
                declaration_date, record_date, payment_date, period
            ) ",
            r"
            ON CONFLICT (code, exchange, date) DO UPDATE SET
                value = EXCLUDED.value,
                unadjusted_value = EXCLUDED.unadjusted_value,
                currency = EXCLUDED.currency,
                declaration_date = EXCLUDED.declaration_date,
                record_date = EXCLUDED.record_date,
                payment_date = EXCLUDED.payment_date,
                period = EXCLUDED.period,
                updated_at = NOW()
            ",
            |mut row, dividend| {
                row.push_bind(dividend.code.clone())
                    .push_bind(dividend.exchange.clone())
                    .push_bind(dividend.date)
                    .push_bind(dividend.value)
                    .push_bind(dividend.unadjusted_value)
                    .push_bind(dividend.currency.clone())
                    .push_bind(dividend.declaration_date)
                    .push_bind(dividend.record_date)
                    .push_bind(dividend.payment_date)
                    .push_bind(dividend.period.clone());
            },
            cancel,
        )
        .await
    }

    async fn save_price_actions(
        &self,
        bars: &[PriceBar],
        cancel: &CancellationToken,
    ) -> Result<usize, PersistenceError> {
        self.upsert(
            bars,
            |b| (b.code.clone(), b.exchange.clone(), b.date),
            9,
            r"INSERT INTO price_actions (
                code, exchange, date, open, high, low, close, adjusted_close, volume
            ) ",
            r"
            ON CONFLICT (code, exchange, date) DO UPDATE SET
                open = EXCLUDED.open,
                high = EXCLUDED.high,
                low = EXCLUDED.low,
                close = EXCLUDED.close,
                adjusted_close = EXCLUDED.adjusted_close,
                volume = EXCLUDED.volume,
                updated_at = NOW()
            ",
            |mut row, bar| {
                row.push_bind(bar.code.clone())
                    .push_bind(bar.exchange.clone())
                    .push_bind(bar.date)
                    .push_bind(bar.open)
                    .push_bind(bar.high)
                    .push_bind(bar.low)
                    .push_bind(bar.close)
                    .push_bind(bar.adjusted_close)
                    .push_bind(bar.volume);
            },
            cancel,
        )
        .await
    }

    async fn save_options(
        &self,
        chain: &OptionChain,
        cancel: &CancellationToken,
    ) -> Result<usize, PersistenceError> {
        let code = chain.code.clone();
        let exchange = chain.exchange.clone();
        self.upsert(
            &chain.contracts,
            |c| c.contract_name.clone(),
            12,
            r"INSERT INTO options (
                contract_name, code, exchange, option_type, expiration_date, strike,
                last_price, bid, ask, volume, open_interest, implied_volatility
            ) ",
            r"
            ON CONFLICT (contract_name) DO UPDATE SET
                last_price = EXCLUDED.last_price,
                bid = EXCLUDED.bid,
                ask = EXCLUDED.ask,
                volume = EXCLUDED.volume,
                open_interest = EXCLUDED.open_interest,
                implied_volatility = EXCLUDED.implied_volatility,
                updated_at = NOW()
            ",
            |mut row, contract| {
                row.push_bind(contract.contract_name.clone())
                    .push_bind(code.clone())
                    .push_bind(exchange.clone())
                    .push_bind(contract.option_type.as_str())
                    .push_bind(contract.expiration_date)
                    .push_bind(contract.strike)
                    .push_bind(contract.last_price)
                    .push_bind(contract.bid)
                    .push_bind(contract.ask)
                    .push_bind(contract.volume)
                    .push_bind(contract.open_interest)
                    .push_bind(contract.implied_volatility);
            },
            cancel,
        )
        .await
    }

    async fn save_earnings(
        &self,
        earnings: &[ResolvedEarnings],
        cancel: &CancellationToken,
    ) -> Result<usize, PersistenceError> {
        self.upsert(
            earnings,
            |e| (e.event.code.clone(), e.exchange.clone(), e.event.report_date),
            10,
            r"INSERT INTO calendar_earnings (
                code, exchange, report_date, date, before_after_market, currency,
                actual, estimate, difference, percent
            ) ",
            r"
            ON CONFLICT (code, exchange, report_date) DO UPDATE SET
                date = EXCLUDED.date,
                before_after_market = EXCLUDED.before_after_market,
                currency = EXCLUDED.currency,
                actual = EXCLUDED.actual,
                estimate = EXCLUDED.estimate,
                difference = EXCLUDED.difference,
                percent = EXCLUDED.percent,
                updated_at = NOW()
            ",
            |mut row, earning| {
                let event = &earning.event;
                row.push_bind(event.code.clone())
                    .push_bind(earning.exchange.clone())
                    .push_bind(event.report_date)
                    .push_bind(event.date)
                    .push_bind(event.before_after_market.clone())
                    .push_bind(event.currency.clone())
                    .push_bind(event.actual)
                    .push_bind(event.estimate)
                    .push_bind(event.difference)
                    .push_bind(event.percent);
            },
            cancel,
        )
        .await
    }

    async fn save_ipos(
        &self,
        ipos: &[IpoEvent],
        cancel: &CancellationToken,
    ) -> Result<usize, PersistenceError> {
        self.upsert(
            ipos,
            |i| (i.code.clone(), i.exchange.clone()),
            11,
            r"INSERT INTO calendar_ipos (
                code, exchange, name, currency, start_date, filing_date, deal_type,
                price_from, price_to, offer_price, shares
            ) ",
            r"
            ON CONFLICT (code, exchange) DO UPDATE SET
                name = EXCLUDED.name,
                currency = EXCLUDED.currency,
                start_date = EXCLUDED.start_date,
                filing_date = EXCLUDED.filing_date,
                deal_type = EXCLUDED.deal_type,
                price_from = EXCLUDED.price_from,
                price_to = EXCLUDED.price_to,
                offer_price = EXCLUDED.offer_price,
                shares = EXCLUDED.shares,
                updated_at = NOW()
            ",
            |mut row, ipo| {
                row.push_bind(ipo.code.clone())
                    .push_bind(ipo.exchange.clone())
                    .push_bind(ipo.name.clone())
                    .push_bind(ipo.currency.clone())
                    .push_bind(ipo.start_date)
                    .push_bind(ipo.filing_date)
                    .push_bind(ipo.deal_type.clone())
                    .push_bind(ipo.price_from)
                    .push_bind(ipo.price_to)
                    .push_bind(ipo.offer_price)
                    .push_bind(ipo.shares);
            },
            cancel,
        )
        .await
    }

    async fn save_trends(
        &self,
        trends: &[ResolvedTrend],
        cancel: &CancellationToken,
    ) -> Result<usize, PersistenceError> {
        self.upsert(
            trends,
            |t| {
                (
                    t.trend.code.clone(),
                    t.exchange.clone(),
                    t.trend.date,
                    t.trend.period.clone(),
                )
            },
            15,
            r"INSERT INTO calendar_trends (
                code, exchange, date, period, growth,
                earnings_estimate_avg, earnings_estimate_low, earnings_estimate_high,
                earnings_estimate_analysts, revenue_estimate_avg, revenue_estimate_analysts,
                eps_trend_current, eps_trend_30_days_ago,
                eps_revisions_up_30_days, eps_revisions_down_30_days
            ) ",
            r"
            ON CONFLICT (code, exchange, date, period) DO UPDATE SET
                growth = EXCLUDED.growth,
                earnings_estimate_avg = EXCLUDED.earnings_estimate_avg,
                earnings_estimate_low = EXCLUDED.earnings_estimate_low,
                earnings_estimate_high = EXCLUDED.earnings_estimate_high,
                earnings_estimate_analysts = EXCLUDED.earnings_estimate_analysts,
                revenue_estimate_avg = EXCLUDED.revenue_estimate_avg,
                revenue_estimate_analysts = EXCLUDED.revenue_estimate_analysts,
                eps_trend_current = EXCLUDED.eps_trend_current,
                eps_trend_30_days_ago = EXCLUDED.eps_trend_30_days_ago,
                eps_revisions_up_30_days = EXCLUDED.eps_revisions_up_30_days,
                eps_revisions_down_30_days = EXCLUDED.eps_revisions_down_30_days,
                updated_at = NOW()
            ",
            |mut row, resolved| {
                let trend = &resolved.trend;
                row.push_bind(trend.code.clone())
                    .push_bind(resolved.exchange.clone())
                    .push_bind(trend.date)
                    .push_bind(trend.period.clone())
                    .push_bind(trend.growth)
                    .push_bind(trend.earnings_estimate_avg)
                    .push_bind(trend.earnings_estimate_low)
                    .push_bind(trend.earnings_estimate_high)
                    .push_bind(trend.earnings_estimate_analysts)
                    .push_bind(trend.revenue_estimate_avg)
                    .push_bind(trend.revenue_estimate_analysts)
                    .push_bind(trend.eps_trend_current)
                    .push_bind(trend.eps_trend_30_days_ago)
                    .push_bind(trend.eps_revisions_up_30_days)
                    .push_bind(trend.eps_revisions_down_30_days);
            },
            cancel,
        )
        .await
    }

    async fn get_all_symbols(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Vec<Symbol>, PersistenceError> {
        self.fetch_symbols(
            "SELECT code, exchange, name, instrument_type, has_options FROM symbols",
            cancel,
        )
        .await
    }

    async fn get_symbols_with_options(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Vec<Symbol>, PersistenceError> {
        self.fetch_symbols(
            "SELECT code, exchange, name, instrument_type, has_options FROM symbols WHERE has_options",
            cancel,
        )
        .await
    }

    async fn set_optionable_on_symbols(
        &self,
        codes: &[String],
        cancel: &CancellationToken,
    ) -> Result<usize, PersistenceError> {
        check(cancel)?;
        let result = sqlx::query(
            "UPDATE symbols SET has_options = TRUE, updated_at = NOW() WHERE code = ANY($1)",
        )
        .bind(codes)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(result.rows_affected() as usize)
    }

    async fn purge(
        &self,
        target: PurgeTarget,
        cancel: &CancellationToken,
    ) -> Result<u64, PersistenceError> {
        check(cancel)?;
        let tables: &[&str] = match target {
            PurgeTarget::Logs => &["logs"],
            PurgeTarget::ActionLogs => &["action_logs"],
            PurgeTarget::Imports => &IMPORT_TABLES,
        };

        let mut tx = self.pool.begin().await.map_err(map_sqlx)?;
        let mut removed = 0;
        for table in tables {
            let result = sqlx::query(&format!("DELETE FROM {table}"))
                .execute(&mut *tx)
                .await
                .map_err(map_sqlx)?;
            removed += result.rows_affected();
        }
        tx.commit().await.map_err(map_sqlx)?;
        Ok(removed)
    }

    async fn log_action(
        &self,
        action: &str,
        outcome: &str,
        detail: Option<&str>,
    ) -> Result<(), PersistenceError> {
        sqlx::query("INSERT INTO action_logs (action, outcome, detail) VALUES ($1, $2, $3)")
            .bind(action)
            .bind(outcome)
            .bind(detail)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;
        Ok(())
    }

    async fn truncate_logs(
        &self,
        level: LogLevel,
        before: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<u64, PersistenceError> {
        check(cancel)?;
        let result = sqlx::query("DELETE FROM logs WHERE level_rank <= $1 AND logged_at < $2")
            .bind(level.rank())
            .bind(before)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;
        Ok(result.rows_affected())
    }
}

// ============================================================================
// Usage Ledger Port
// ============================================================================

#[async_trait]
impl UsageLedgerPort for PostgresStore {
    async fn usage_on(&self, day: NaiveDate) -> Result<u32, PersistenceError> {
        let (start, end) = day_bounds(day);
        let row = sqlx::query(
            "SELECT COALESCE(SUM(cost), 0)::BIGINT AS used FROM api_usage_log WHERE called_at >= $1 AND called_at < $2",
        )
        .bind(start)
        .bind(end)
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx)?;

        let used: i64 = row.try_get("used").map_err(map_sqlx)?;
        Ok(u32::try_from(used.max(0)).unwrap_or(u32::MAX))
    }

    async fn append(&self, entry: UsageEntry) -> Result<(), PersistenceError> {
        sqlx::query(
            "INSERT INTO api_usage_log (called_at, endpoint, target, cost) VALUES ($1, $2, $3, $4)",
        )
        .bind(entry.at)
        .bind(entry.endpoint.as_str())
        .bind(entry.target)
        .bind(i32::try_from(entry.cost).unwrap_or(i32::MAX))
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }
}
