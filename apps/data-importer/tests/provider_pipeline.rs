//! Provider Pipeline Integration Tests
//!
//! Runs configured action items through the real HTTP gateway against a
//! mock provider, with the in-memory store acting as store and usage
//! ledger.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use data_importer::application::services::ActionStatus;
use data_importer::infrastructure::config::parse_actions;
use data_importer::{
    ActionRunner, CostTable, EodhdConfig, EodhdGateway, GatewayError, ImportOrchestrator,
    ImporterSettings, InMemoryStore, MaintenanceService, RunnerSettings, UsageLedgerPort,
};

async fn mock_provider() -> MockServer {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/exchange-symbol-list/US"))
        .and(query_param("api_token", "demo"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            r#"[
                {"Code":"AAPL","Name":"Apple Inc","Type":"Common Stock","Exchange":"NASDAQ"},
                {"Code":"VTI","Name":"Vanguard Total Stock Market","Type":"ETF","Exchange":"NYSE ARCA"}
            ]"#,
        ))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/splits/AAPL.US"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            r#"[{"date":"2014-06-09","split":"7.000000/1.000000"},{"date":"2020-08-31","split":"4.000000/1.000000"}]"#,
        ))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/splits/VTI.US"))
        .respond_with(ResponseTemplate::new(401).set_body_string("Unauthenticated"))
        .expect(1)
        .mount(&server)
        .await;

    server
}

#[tokio::test]
async fn configured_actions_import_through_the_gateway() {
    let server = mock_provider().await;
    let store = Arc::new(InMemoryStore::new());

    let config = EodhdConfig::new("demo").with_base_url(server.uri());
    let gateway = Arc::new(
        EodhdGateway::new(
            &config,
            CostTable::default(),
            Arc::clone(&store) as Arc<dyn UsageLedgerPort>,
        )
        .unwrap(),
    );
    let orchestrator = Arc::new(
        ImportOrchestrator::new(
            gateway,
            Arc::clone(&store),
            Arc::clone(&store),
            ImporterSettings::default(),
        )
        .await
        .unwrap(),
    );

    let failures = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&failures);
    orchestrator
        .notifications()
        .on_item_failure(move |failure| sink.lock().push(failure.clone()));

    let maintenance = MaintenanceService::new(
        Arc::clone(&store),
        "Fixes/OptionableSymbols.txt",
        Arc::clone(orchestrator.notifications()),
    );
    let runner = ActionRunner::new(
        Arc::clone(&orchestrator),
        maintenance,
        Arc::clone(&store),
        RunnerSettings::default(),
    );

    let actions = parse_actions("import:full:US:symbols, import:full:US:splits").unwrap();
    let summary = runner.run(&actions, &CancellationToken::new()).await;

    assert_eq!(summary.failures(), 0);
    let ActionStatus::Imported(splits) = &summary.results[1].status else {
        panic!("splits action did not import");
    };
    assert_eq!(splits.failed, vec!["VTI"]);
    assert_eq!(splits.records, 2);

    let stored = store.splits_for("AAPL", "US");
    assert_eq!(stored.len(), 2);
    assert_eq!(stored[1].ratio(), Decimal::from(4));

    let failures = failures.lock();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].symbols, vec!["VTI"]);
    assert!(matches!(failures[0].error, GatewayError::Unauthorized(_)));

    // Symbol list plus two split calls, the 401 included.
    assert_eq!(orchestrator.usage(), 3);
    assert_eq!(store.usage_on(Utc::now().date_naive()).await.unwrap(), 3);
    assert_eq!(orchestrator.reset_usage(50).await.unwrap().used, 3);
    assert_eq!(store.action_logs().len(), 2);
}
