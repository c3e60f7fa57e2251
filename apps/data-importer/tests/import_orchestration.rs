//! Import Orchestration Integration Tests
//!
//! Drives the orchestrator against a scripted provider and the in-memory
//! store: quota gating, per-symbol failures, cancellation and calendar
//! resolution.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use tokio_util::sync::CancellationToken;

use data_importer::application::ports::{PersistenceError, UsageEntry};
use data_importer::application::services::NotificationEvent;
use data_importer::domain::market_data::{
    Dividend, EarningsEvent, Exchange, IpoEvent, OptionChain, PriceBar, Split, TrendEvent,
};
use data_importer::{
    CalendarKind, CostTable, DataType, Endpoint, Fetched, GatewayError, GatewayPort, ImportError,
    ImportOrchestrator, ImportOutcome, ImportUnit, ImporterSettings, InMemoryStore,
    NotificationHub, PersistencePort, Symbol, UsageLedgerPort,
};

// =============================================================================
// Scripted provider
// =============================================================================

/// Provider that answers from fixed data and records every call.
#[derive(Default)]
struct ScriptedGateway {
    hub: NotificationHub,
    symbol_lists: HashMap<String, Vec<Symbol>>,
    earnings: Vec<EarningsEvent>,
    ipos: Vec<IpoEvent>,
    trends: Vec<TrendEvent>,
    unauthorized: HashSet<String>,
    cancel_after: Option<(usize, CancellationToken)>,
    /// Cancels the token while this code is being fetched.
    cancel_during: Option<(String, CancellationToken)>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedGateway {
    fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    /// Record the call; cancels the scripted token once the limit is hit.
    fn record(&self, target: &str) {
        let mut calls = self.calls.lock();
        calls.push(target.to_string());
        if let Some((limit, token)) = &self.cancel_after
            && calls.len() >= *limit
        {
            token.cancel();
        }
    }

    fn per_symbol<T: Default>(&self, symbol: &Symbol, cost: u32, data: T) -> Fetched<T> {
        self.record(&symbol.code);
        if let Some((code, token)) = &self.cancel_during
            && *code == symbol.code
        {
            token.cancel();
            return Fetched::failed(0);
        }
        if self.unauthorized.contains(&symbol.code) {
            self.hub.item_failure(
                GatewayError::Unauthorized(symbol.ticker()),
                vec![symbol.code.clone()],
            );
            return Fetched::failed(cost);
        }
        Fetched::ok(data, cost)
    }
}

#[async_trait]
impl GatewayPort for ScriptedGateway {
    fn notifications(&self) -> &NotificationHub {
        &self.hub
    }

    async fn fetch_exchange_list(&self, _: &CancellationToken) -> Fetched<Vec<Exchange>> {
        self.record("exchanges");
        Fetched::ok(Vec::new(), 1)
    }

    async fn fetch_symbol_list(
        &self,
        exchange: &str,
        _: &CancellationToken,
    ) -> Fetched<Vec<Symbol>> {
        self.record(exchange);
        let symbols = self.symbol_lists.get(exchange).cloned().unwrap_or_default();
        Fetched::ok(symbols, 1)
    }

    async fn fetch_splits(&self, symbol: &Symbol, _: &CancellationToken) -> Fetched<Vec<Split>> {
        self.per_symbol(symbol, 1, Vec::new())
    }

    async fn fetch_dividends(
        &self,
        symbol: &Symbol,
        _: &CancellationToken,
    ) -> Fetched<Vec<Dividend>> {
        let dividend = Dividend {
            code: symbol.code.clone(),
            exchange: symbol.exchange.clone(),
            date: day(2026, 3, 15),
            value: Decimal::new(25, 2),
            unadjusted_value: Decimal::new(25, 2),
            currency: Some("USD".to_string()),
            declaration_date: None,
            record_date: None,
            payment_date: None,
            period: Some("Quarterly".to_string()),
        };
        self.per_symbol(symbol, 1, vec![dividend])
    }

    async fn fetch_prices(&self, symbol: &Symbol, _: &CancellationToken) -> Fetched<Vec<PriceBar>> {
        self.per_symbol(symbol, 1, Vec::new())
    }

    async fn fetch_options(&self, symbol: &Symbol, _: &CancellationToken) -> Fetched<OptionChain> {
        let chain = OptionChain {
            code: symbol.code.clone(),
            exchange: symbol.exchange.clone(),
            ..OptionChain::default()
        };
        self.per_symbol(symbol, 10, chain)
    }

    async fn fetch_earnings(&self, _: &CancellationToken) -> Fetched<Vec<EarningsEvent>> {
        self.record("earnings");
        Fetched::ok(self.earnings.clone(), 1)
    }

    async fn fetch_ipos(&self, _: &CancellationToken) -> Fetched<Vec<IpoEvent>> {
        self.record("ipos");
        Fetched::ok(self.ipos.clone(), 1)
    }

    async fn fetch_trends(
        &self,
        tickers: &[String],
        _: &CancellationToken,
    ) -> Fetched<Vec<TrendEvent>> {
        self.record(&format!("trends {}", tickers.join(",")));
        Fetched::ok(self.trends.clone(), 1)
    }
}

// =============================================================================
// Helpers
// =============================================================================

type Orchestrator = ImportOrchestrator<ScriptedGateway, InMemoryStore, InMemoryStore>;

fn day(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

fn us(codes: &[&str]) -> Vec<Symbol> {
    codes.iter().map(|code| Symbol::new(*code, "US")).collect()
}

async fn seeded_store(symbols: &[Symbol]) -> Arc<InMemoryStore> {
    let store = Arc::new(InMemoryStore::new());
    store
        .save_symbols(symbols, &CancellationToken::new())
        .await
        .unwrap();
    store
}

async fn orchestrator(
    gateway: ScriptedGateway,
    store: &Arc<InMemoryStore>,
    daily_limit: u32,
) -> (Orchestrator, Arc<ScriptedGateway>) {
    let gateway = Arc::new(gateway);
    let orchestrator = ImportOrchestrator::new(
        Arc::clone(&gateway),
        Arc::clone(store),
        Arc::clone(store),
        ImporterSettings {
            daily_limit,
            ..ImporterSettings::default()
        },
    )
    .await
    .unwrap();
    (orchestrator, gateway)
}

fn earnings(code: &str) -> EarningsEvent {
    EarningsEvent {
        code: code.to_string(),
        report_date: day(2026, 3, 31),
        date: day(2026, 4, 24),
        before_after_market: Some("AfterMarket".to_string()),
        currency: Some("USD".to_string()),
        actual: None,
        estimate: Some(Decimal::new(152, 2)),
        difference: None,
        percent: None,
    }
}

fn trend(code: &str, period: &str) -> TrendEvent {
    TrendEvent {
        code: code.to_string(),
        date: day(2026, 6, 30),
        period: period.to_string(),
        growth: Some(Decimal::new(12, 2)),
        earnings_estimate_avg: Some(Decimal::new(152, 2)),
        earnings_estimate_low: None,
        earnings_estimate_high: None,
        earnings_estimate_analysts: Some(28),
        revenue_estimate_avg: None,
        revenue_estimate_analysts: None,
        eps_trend_current: None,
        eps_trend_30_days_ago: None,
        eps_revisions_up_30_days: Some(3),
        eps_revisions_down_30_days: Some(0),
    }
}

// =============================================================================
// Quota gating
// =============================================================================

#[tokio::test]
async fn denied_unit_makes_no_calls_and_no_writes() {
    let codes: Vec<String> = (0..10).map(|i| format!("S{i:02}")).collect();
    let symbols: Vec<Symbol> = codes.iter().map(|c| Symbol::new(c.as_str(), "US")).collect();
    let store = seeded_store(&symbols).await;
    store
        .append(UsageEntry {
            at: Utc::now(),
            endpoint: Endpoint::Eod,
            target: None,
            cost: 95,
        })
        .await
        .unwrap();

    let gateway = Arc::new(ScriptedGateway::default());
    let orchestrator = ImportOrchestrator::new(
        Arc::clone(&gateway),
        Arc::clone(&store),
        Arc::clone(&store),
        ImporterSettings {
            daily_limit: 100,
            costs: CostTable::default().with_cost(Endpoint::Splits, 2),
        },
    )
    .await
    .unwrap();
    let mut events = orchestrator.notifications().stream();

    let report = orchestrator
        .import(
            &ImportUnit::full("US", DataType::Splits),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(report.outcome, ImportOutcome::QuotaDenied);
    assert!(gateway.calls().is_empty());
    assert_eq!(store.writes().splits, 0);
    assert_eq!(orchestrator.usage(), 95);

    let mut denials = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let NotificationEvent::QuotaDenied(denied) = event {
            denials.push(denied);
        }
    }
    assert_eq!(denials.len(), 1);
    assert_eq!(denials[0].used, 95);
    assert_eq!(denials[0].requested_total, 115);
}

#[tokio::test]
async fn admitted_unit_fetches_each_symbol_and_charges_usage() {
    let store = seeded_store(&us(&["AAA", "BBB", "CCC"])).await;
    let (orchestrator, gateway) = orchestrator(ScriptedGateway::default(), &store, 1_000).await;

    let report = orchestrator
        .import(
            &ImportUnit::full("US", DataType::Dividends),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(report.outcome, ImportOutcome::Completed);
    assert_eq!(gateway.calls(), vec!["AAA", "BBB", "CCC"]);
    assert_eq!(report.persisted, 3);
    assert_eq!(report.records, 3);
    assert_eq!(report.cost, 3);
    assert_eq!(store.writes().dividends, 3);
    assert_eq!(store.dividends_for("BBB", "US").len(), 1);
    assert_eq!(orchestrator.usage(), 3);
}

#[tokio::test]
async fn repeated_import_is_idempotent_in_the_store() {
    let store = seeded_store(&us(&["AAA", "BBB"])).await;
    let (orchestrator, _) = orchestrator(ScriptedGateway::default(), &store, 1_000).await;
    let unit = ImportUnit::full("US", DataType::Dividends);

    orchestrator.import(&unit, &CancellationToken::new()).await.unwrap();
    orchestrator.import(&unit, &CancellationToken::new()).await.unwrap();

    assert_eq!(store.dividends_for("AAA", "US").len(), 1);
    assert_eq!(orchestrator.usage(), 4);
}

// =============================================================================
// Failures
// =============================================================================

#[tokio::test]
async fn unauthorized_symbol_is_reported_and_the_rest_continue() {
    let store = seeded_store(&us(&["SPY", "VTI", "QQQ"])).await;
    let gateway = ScriptedGateway {
        unauthorized: HashSet::from(["VTI".to_string()]),
        ..ScriptedGateway::default()
    };
    let (orchestrator, _) = orchestrator(gateway, &store, 1_000).await;
    let failures = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&failures);
    orchestrator
        .notifications()
        .on_item_failure(move |failure| sink.lock().push(failure.clone()));

    let report = orchestrator
        .import(
            &ImportUnit::full("US", DataType::Dividends),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(report.failed, vec!["VTI"]);
    assert_eq!(report.persisted, 2);
    assert_eq!(store.writes().dividends, 2);

    let failures = failures.lock();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].symbols, vec!["VTI"]);
    assert!(matches!(failures[0].error, GatewayError::Unauthorized(_)));
}

#[tokio::test]
async fn store_failure_aborts_the_unit() {
    let store = seeded_store(&us(&["AAA", "BBB", "CCC"])).await;
    let (orchestrator, gateway) = orchestrator(ScriptedGateway::default(), &store, 1_000).await;
    store.fail_next_write(PersistenceError::Connection("connection reset".into()));

    let result = orchestrator
        .import(
            &ImportUnit::full("US", DataType::Dividends),
            &CancellationToken::new(),
        )
        .await;

    assert!(matches!(result, Err(ImportError::Persistence(_))));
    assert_eq!(gateway.calls(), vec!["AAA"]);
    assert_eq!(store.writes().dividends, 0);
}

// =============================================================================
// Cancellation
// =============================================================================

#[tokio::test]
async fn cancelled_before_start_does_nothing() {
    let store = seeded_store(&us(&["AAA"])).await;
    let (orchestrator, gateway) = orchestrator(ScriptedGateway::default(), &store, 1_000).await;
    let cancel = CancellationToken::new();
    cancel.cancel();

    let result = orchestrator
        .import(&ImportUnit::full("US", DataType::Splits), &cancel)
        .await;

    assert!(matches!(result, Err(ImportError::Cancelled)));
    assert!(gateway.calls().is_empty());
    assert_eq!(orchestrator.usage(), 0);
}

#[tokio::test]
async fn cancellation_mid_batch_keeps_earlier_writes() {
    let store = seeded_store(&us(&["AAA", "BBB", "CCC", "DDD"])).await;
    let cancel = CancellationToken::new();
    let gateway = ScriptedGateway {
        cancel_after: Some((2, cancel.clone())),
        ..ScriptedGateway::default()
    };
    let (orchestrator, gateway) = orchestrator(gateway, &store, 1_000).await;

    let result = orchestrator
        .import(&ImportUnit::full("US", DataType::Dividends), &cancel)
        .await;

    assert!(matches!(result, Err(ImportError::Cancelled)));
    assert_eq!(gateway.calls(), vec!["AAA", "BBB"]);
    assert_eq!(store.dividends_for("AAA", "US").len(), 1);
    assert!(store.dividends_for("CCC", "US").is_empty());
}

#[tokio::test]
async fn cancellation_inside_the_final_fetch_is_not_reported_as_failure() {
    let store = seeded_store(&us(&["AAA", "BBB"])).await;
    let cancel = CancellationToken::new();
    let gateway = ScriptedGateway {
        cancel_during: Some(("BBB".to_string(), cancel.clone())),
        ..ScriptedGateway::default()
    };
    let (orchestrator, gateway) = orchestrator(gateway, &store, 1_000).await;
    let failures = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&failures);
    orchestrator
        .notifications()
        .on_item_failure(move |failure| sink.lock().push(failure.clone()));

    let result = orchestrator
        .import(&ImportUnit::full("US", DataType::Dividends), &cancel)
        .await;

    assert!(matches!(result, Err(ImportError::Cancelled)));
    assert_eq!(gateway.calls(), vec!["AAA", "BBB"]);
    assert_eq!(store.dividends_for("AAA", "US").len(), 1);
    assert!(store.dividends_for("BBB", "US").is_empty());
    assert!(failures.lock().is_empty());
    assert_eq!(orchestrator.usage(), 1);
}

// =============================================================================
// Dispatch
// =============================================================================

#[tokio::test]
async fn lowercase_exchange_matches_registered_symbols() {
    let store = seeded_store(&us(&["AAA"])).await;
    let gateway = ScriptedGateway {
        symbol_lists: HashMap::from([("US".to_string(), us(&["AAA", "BBB"]))]),
        ..ScriptedGateway::default()
    };
    let (orchestrator, gateway) = orchestrator(gateway, &store, 1_000).await;
    let cancel = CancellationToken::new();

    orchestrator
        .import(&ImportUnit::full("us", DataType::Symbols), &cancel)
        .await
        .unwrap();
    let report = orchestrator
        .import(&ImportUnit::full(" us ", DataType::Dividends), &cancel)
        .await
        .unwrap();

    assert_eq!(gateway.calls(), vec!["US", "AAA", "BBB"]);
    assert_eq!(report.persisted, 2);
    assert_eq!(store.dividends_for("BBB", "US").len(), 1);
}

#[tokio::test]
async fn symbol_list_merges_without_duplicates() {
    let store = Arc::new(InMemoryStore::new());
    let gateway = ScriptedGateway {
        symbol_lists: HashMap::from([("US".to_string(), us(&["AAA", "BBB", "AAA"]))]),
        ..ScriptedGateway::default()
    };
    let (orchestrator, _) = orchestrator(gateway, &store, 1_000).await;
    let unit = ImportUnit::full("US", DataType::Symbols);

    orchestrator.import(&unit, &CancellationToken::new()).await.unwrap();
    orchestrator.import(&unit, &CancellationToken::new()).await.unwrap();

    assert_eq!(orchestrator.registry().len(), 2);
    assert_eq!(store.symbol_count(), 2);
    assert_eq!(orchestrator.usage(), 2);
}

#[tokio::test]
async fn options_cover_only_optionable_symbols() {
    let store = seeded_store(&[
        Symbol::new("AAA", "US").optionable(),
        Symbol::new("BBB", "US"),
        Symbol::new("CCC", "LSE").optionable(),
    ])
    .await;
    let (orchestrator, gateway) = orchestrator(ScriptedGateway::default(), &store, 1_000).await;

    let report = orchestrator
        .import(
            &ImportUnit::full("US", DataType::Options),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(gateway.calls(), vec!["AAA"]);
    assert_eq!(report.cost, 10);
    assert_eq!(store.writes().options, 1);
}

#[tokio::test]
async fn fundamentals_are_a_no_op() {
    let store = seeded_store(&us(&["AAA"])).await;
    let (orchestrator, gateway) = orchestrator(ScriptedGateway::default(), &store, 1_000).await;

    let report = orchestrator
        .import(
            &ImportUnit::full("US", DataType::Fundamentals),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(report.outcome, ImportOutcome::NoOp);
    assert!(gateway.calls().is_empty());
    assert_eq!(store.writes().total(), 1);
}

// =============================================================================
// Calendar
// =============================================================================

#[tokio::test]
async fn earnings_resolve_exchange_through_the_registry() {
    let store = seeded_store(&[Symbol::new("AAA", "US"), Symbol::new("BBB", "LSE")]).await;
    let gateway = ScriptedGateway {
        earnings: vec![earnings("AAA.US"), earnings("BBB.LSE"), earnings("ZZZ.US")],
        ..ScriptedGateway::default()
    };
    let (orchestrator, _) = orchestrator(gateway, &store, 1_000).await;

    let report = orchestrator
        .import_calendar(
            CalendarKind::Earnings,
            &["US".to_string()],
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(report.records, 1);
    let saved = store.earnings();
    assert_eq!(saved.len(), 1);
    assert_eq!(saved[0].exchange, "US");
    assert_eq!(saved[0].event.code, "AAA");
}

#[tokio::test]
async fn ipos_keep_configured_exchanges() {
    let ipo = |code: &str, exchange: &str| IpoEvent {
        code: code.to_string(),
        name: None,
        exchange: exchange.to_string(),
        currency: None,
        start_date: Some(day(2026, 5, 1)),
        filing_date: None,
        deal_type: Some("Expected".to_string()),
        price_from: None,
        price_to: None,
        offer_price: None,
        shares: None,
    };
    let store = Arc::new(InMemoryStore::new());
    let gateway = ScriptedGateway {
        ipos: vec![ipo("NEWCO", "Nasdaq"), ipo("OTHER", "TSX")],
        ..ScriptedGateway::default()
    };
    let (orchestrator, _) = orchestrator(gateway, &store, 1_000).await;

    orchestrator
        .import_calendar(
            CalendarKind::Ipos,
            &["NASDAQ".to_string()],
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    let saved = store.ipos();
    assert_eq!(saved.len(), 1);
    assert_eq!(saved[0].code, "NEWCO");
    assert_eq!(saved[0].exchange, "NASDAQ");
}

#[tokio::test]
async fn trends_resolve_exchange_through_the_registry() {
    let store = seeded_store(&[
        Symbol::new("AAA", "US"),
        Symbol::new("BBB", "LSE"),
        Symbol::new("CCC", "US"),
    ])
    .await;
    let gateway = ScriptedGateway {
        trends: vec![
            trend("AAA", "0q"),
            trend("AAA", "+1y"),
            trend("BBB", "0q"),
            trend("ZZZ", "0q"),
        ],
        ..ScriptedGateway::default()
    };
    let (orchestrator, gateway) = orchestrator(gateway, &store, 1_000).await;

    let report = orchestrator
        .import_calendar(
            CalendarKind::Trends,
            &["us".to_string()],
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(gateway.calls(), vec!["trends AAA.US,CCC.US"]);
    assert_eq!(report.records, 2);
    assert_eq!(report.cost, 1);
    let saved = store.trends();
    assert_eq!(saved.len(), 2);
    assert!(saved.iter().all(|t| t.exchange == "US" && t.trend.code == "AAA"));
}

#[tokio::test]
async fn trends_without_registered_symbols_are_a_no_op() {
    let store = Arc::new(InMemoryStore::new());
    let (orchestrator, gateway) = orchestrator(ScriptedGateway::default(), &store, 1_000).await;

    let report = orchestrator
        .import_calendar(
            CalendarKind::Trends,
            &["US".to_string()],
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(report.outcome, ImportOutcome::NoOp);
    assert!(gateway.calls().is_empty());
    assert_eq!(orchestrator.usage(), 0);
}
