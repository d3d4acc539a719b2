use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tempfile::tempdir;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use tesser_broker::{BrokerError, ExchangeConnector, Quota, RateLimiter};
use tesser_core::{
    AssetId, Balance, ExchangeId, Order, OrderStatus, Position, Side, StateCategory, Symbol,
};
use tesser_ledger::{
    LedgerBook, LedgerBookConfig, LedgerError, LedgerHealth, LedgerMutation, LedgerResult,
    LedgerSource, LedgerState,
};
use tesser_paper::PaperConnector;
use tesser_reconcile::{
    Discrepancy, DiscrepancyType, EngineConfig, ExchangeOutcome, InMemoryReportStore,
    ReconcileError, ReconcileResult, ReconciliationReport, ReportSink, ReportStore,
    RetryPolicy, SessionStatus, Severity, SqliteReportStore, StateReconciliationEngine,
};

fn config() -> EngineConfig {
    EngineConfig {
        retry: RetryPolicy {
            max_retries: 2,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_millis(200),
        },
        ..EngineConfig::default()
    }
}

fn seeded_ledger(exchange: &str, usdt: Decimal) -> Arc<LedgerBook> {
    let book = LedgerBook::new(LedgerBookConfig::default());
    book.commit(
        vec![LedgerMutation::SetBalance {
            exchange: ExchangeId::from(exchange),
            asset: AssetId::from("USDT"),
            balance: Balance::free(usdt),
        }],
        "seed",
    )
    .unwrap();
    Arc::new(book)
}

fn paper(exchange: &str, usdt: Decimal) -> Arc<PaperConnector> {
    let connector = PaperConnector::new(exchange);
    connector.set_balance("USDT", Balance::free(usdt));
    Arc::new(connector)
}

fn connectors(list: &[&Arc<PaperConnector>]) -> Vec<Arc<dyn ExchangeConnector>> {
    list.iter()
        .map(|connector| Arc::clone(*connector) as Arc<dyn ExchangeConnector>)
        .collect()
}

fn open_order(exchange: &str, id: &str) -> Order {
    Order {
        id: id.into(),
        exchange: ExchangeId::from(exchange),
        symbol: Symbol::from("BTCUSDT"),
        side: Side::Buy,
        quantity: dec!(0.5),
        price: Some(dec!(30000)),
        filled_quantity: Decimal::ZERO,
        avg_fill_price: None,
        status: OrderStatus::Accepted,
        client_order_id: None,
        updated_at: Utc::now(),
    }
}

fn count_of(report: &ReconciliationReport, kind: DiscrepancyType) -> usize {
    report
        .discrepancies()
        .iter()
        .filter(|d| d.discrepancy_type == kind)
        .count()
}

#[derive(Default)]
struct RecordingSink {
    published: Mutex<Vec<Uuid>>,
    escalated: Mutex<Vec<String>>,
}

#[async_trait]
impl ReportSink for RecordingSink {
    async fn publish(&self, report: &ReconciliationReport) -> ReconcileResult<()> {
        self.published.lock().push(report.id());
        Ok(())
    }

    async fn escalate(
        &self,
        _report: &ReconciliationReport,
        critical: &[&Discrepancy],
    ) -> ReconcileResult<()> {
        self.escalated
            .lock()
            .extend(critical.iter().map(|d| d.entity_key.clone()));
        Ok(())
    }
}

/// Ledger that always fails with a non-transient error.
struct BrokenLedger;

#[async_trait]
impl LedgerSource for BrokenLedger {
    async fn health_check(&self) -> LedgerResult<LedgerHealth> {
        Err(LedgerError::NotRunning)
    }

    async fn view_as_of(&self, _as_of: DateTime<Utc>) -> LedgerResult<Arc<LedgerState>> {
        Err(LedgerError::InvalidState("journal corrupted".into()))
    }
}

/// Ledger whose reads never finish.
struct StalledLedger;

#[async_trait]
impl LedgerSource for StalledLedger {
    async fn health_check(&self) -> LedgerResult<LedgerHealth> {
        Err(LedgerError::NotRunning)
    }

    async fn view_as_of(&self, _as_of: DateTime<Utc>) -> LedgerResult<Arc<LedgerState>> {
        std::future::pending().await
    }
}

/// Ledger that receives more commits than it retains before each read.
struct BusyLedger {
    book: Arc<LedgerBook>,
}

#[async_trait]
impl LedgerSource for BusyLedger {
    async fn health_check(&self) -> LedgerResult<LedgerHealth> {
        self.book.health_check().await
    }

    async fn view_as_of(&self, as_of: DateTime<Utc>) -> LedgerResult<Arc<LedgerState>> {
        sleep(Duration::from_millis(5)).await;
        for _ in 0..2 {
            self.book.commit(
                vec![LedgerMutation::AdjustBalance {
                    exchange: ExchangeId::from("kraken"),
                    asset: AssetId::from("USDT"),
                    free_delta: dec!(1),
                    locked_delta: Decimal::ZERO,
                }],
                "transfer",
            )?;
        }
        self.book.view_as_of(as_of).await
    }
}

#[tokio::test]
async fn matching_state_completes_without_findings() {
    let ledger = seeded_ledger("binance", dec!(1000));
    let binance = paper("binance", dec!(1000));
    let engine = StateReconciliationEngine::new(config(), connectors(&[&binance]), ledger).unwrap();

    let report = engine
        .perform_full_reconciliation(Duration::from_secs(5))
        .await
        .unwrap();

    assert_eq!(report.status(), SessionStatus::Completed);
    assert!(report.discrepancies().is_empty());
    assert!(report.finished_at() >= report.started_at());
    assert_eq!(report.session().ledger_version, Some(1));
    let summary = report.to_summary();
    assert_eq!(summary["status"], "COMPLETED");
    assert_eq!(summary["total_discrepancies"], 0);
}

#[tokio::test]
async fn balance_drift_is_reported_and_escalated() {
    let ledger = seeded_ledger("binance", dec!(1000));
    let binance = paper("binance", dec!(900));
    let sink = Arc::new(RecordingSink::default());
    let engine = StateReconciliationEngine::new(config(), connectors(&[&binance]), ledger)
        .unwrap()
        .with_sink(sink.clone());

    let report = engine
        .perform_full_reconciliation(Duration::from_secs(5))
        .await
        .unwrap();

    assert_eq!(report.status(), SessionStatus::Completed);
    let critical = report.get_critical_discrepancies();
    assert_eq!(critical.len(), 1);
    assert_eq!(critical[0].discrepancy_type, DiscrepancyType::BalanceMismatch);
    assert_eq!(critical[0].expected_value.as_deref(), Some("1000"));
    assert_eq!(critical[0].actual_value.as_deref(), Some("900"));
    assert_eq!(*sink.published.lock(), vec![report.id()]);
    assert_eq!(sink.escalated.lock().len(), 1);
}

#[tokio::test]
async fn order_tracking_gaps_are_classified() {
    let ledger = seeded_ledger("binance", dec!(1000));
    ledger
        .commit(
            vec![LedgerMutation::UpsertOrder {
                order: open_order("binance", "tracked-1"),
            }],
            "order",
        )
        .unwrap();
    let binance = paper("binance", dec!(1000));
    binance.upsert_order(open_order("binance", "stray-7"));
    let engine = StateReconciliationEngine::new(config(), connectors(&[&binance]), ledger).unwrap();

    let report = engine
        .perform_full_reconciliation(Duration::from_secs(5))
        .await
        .unwrap();

    assert_eq!(count_of(&report, DiscrepancyType::OrderMissing), 1);
    assert_eq!(count_of(&report, DiscrepancyType::OrderUntracked), 1);
    assert!(report
        .discrepancies()
        .iter()
        .all(|d| d.severity == Severity::Critical));
}

#[tokio::test]
async fn position_drift_is_detected() {
    let ledger = seeded_ledger("bybit", dec!(500));
    let position = Position {
        exchange: ExchangeId::from("bybit"),
        symbol: Symbol::from("ETHUSDT"),
        side: Some(Side::Buy),
        quantity: dec!(2),
        entry_price: Some(dec!(2000)),
        mark_price: Some(dec!(2000)),
        updated_at: Utc::now(),
    };
    ledger
        .commit(
            vec![LedgerMutation::SetPosition {
                position: position.clone(),
            }],
            "fill",
        )
        .unwrap();
    let bybit = paper("bybit", dec!(500));
    bybit.set_position(Position {
        quantity: dec!(1.5),
        ..position
    });
    let engine = StateReconciliationEngine::new(config(), connectors(&[&bybit]), ledger).unwrap();

    let report = engine
        .perform_full_reconciliation(Duration::from_secs(5))
        .await
        .unwrap();

    assert_eq!(count_of(&report, DiscrepancyType::PositionMismatch), 1);
    assert_eq!(report.summary().critical_count, 1);
}

#[tokio::test]
async fn one_failing_exchange_yields_partial_report() {
    let ledger = seeded_ledger("binance", dec!(1000));
    let binance = paper("binance", dec!(1000));
    let bybit = paper("bybit", dec!(0));
    bybit.set_connected(false);
    let engine =
        StateReconciliationEngine::new(config(), connectors(&[&binance, &bybit]), ledger).unwrap();

    let report = engine
        .perform_full_reconciliation(Duration::from_secs(5))
        .await
        .unwrap();

    assert_eq!(report.status(), SessionStatus::Partial);
    let checked: Vec<_> = report.summary().exchanges_checked.iter().collect();
    assert_eq!(checked, vec![&ExchangeId::from("binance")]);
    assert_eq!(
        report.session().exchange_outcomes[&ExchangeId::from("bybit")],
        ExchangeOutcome::Failed
    );
    let connectivity: Vec<_> = report
        .discrepancies()
        .iter()
        .filter(|d| d.discrepancy_type == DiscrepancyType::Connectivity)
        .collect();
    assert_eq!(connectivity.len(), 1);
    assert_eq!(connectivity[0].exchange_id, ExchangeId::from("bybit"));
    assert_eq!(connectivity[0].severity, Severity::Critical);
}

#[tokio::test]
async fn all_exchanges_failing_yields_failed_report() {
    let ledger = seeded_ledger("binance", dec!(1000));
    let binance = paper("binance", dec!(1000));
    let bybit = paper("bybit", dec!(0));
    binance.set_connected(false);
    bybit.set_connected(false);
    let engine = StateReconciliationEngine::new(
        EngineConfig {
            retry: RetryPolicy::none(),
            ..config()
        },
        connectors(&[&binance, &bybit]),
        ledger,
    )
    .unwrap();

    let report = engine
        .perform_full_reconciliation(Duration::from_secs(5))
        .await
        .unwrap();

    assert_eq!(report.status(), SessionStatus::Failed);
    assert!(report.summary().exchanges_checked.is_empty());
    assert_eq!(report.discrepancies().len(), 2);
    assert_eq!(count_of(&report, DiscrepancyType::Connectivity), 2);
}

#[tokio::test]
async fn degraded_category_skips_detection_and_marks_partial() {
    let ledger = seeded_ledger("binance", dec!(1000));
    let binance = paper("binance", dec!(1000));
    binance.fail_category(
        StateCategory::Orders,
        BrokerError::Authentication("key revoked".into()),
    );
    let engine = StateReconciliationEngine::new(config(), connectors(&[&binance]), ledger).unwrap();

    let report = engine
        .perform_full_reconciliation(Duration::from_secs(5))
        .await
        .unwrap();

    assert_eq!(report.status(), SessionStatus::Partial);
    assert_eq!(binance.call_count(StateCategory::Orders), 1);
    assert_eq!(count_of(&report, DiscrepancyType::DetectionSkipped), 1);
    assert_eq!(count_of(&report, DiscrepancyType::Connectivity), 1);
    assert_eq!(count_of(&report, DiscrepancyType::BalanceMismatch), 0);
}

#[tokio::test(start_paused = true)]
async fn transient_errors_are_retried() {
    let ledger = seeded_ledger("binance", dec!(1000));
    let binance = paper("binance", dec!(1000));
    binance.fail_category_times(
        StateCategory::Balances,
        BrokerError::Transport("connection reset".into()),
        2,
    );
    let engine = StateReconciliationEngine::new(config(), connectors(&[&binance]), ledger).unwrap();

    let report = engine
        .perform_full_reconciliation(Duration::from_secs(5))
        .await
        .unwrap();

    assert_eq!(report.status(), SessionStatus::Completed);
    assert_eq!(binance.call_count(StateCategory::Balances), 3);
    assert_eq!(binance.call_count(StateCategory::Orders), 1);
}

#[tokio::test(start_paused = true)]
async fn deadline_discards_slow_exchanges() {
    let ledger = seeded_ledger("binance", dec!(1000));
    let binance = paper("binance", dec!(1000));
    let slow = paper("okx", dec!(0));
    slow.set_latency(Duration::from_secs(30));
    let engine = StateReconciliationEngine::new(
        EngineConfig {
            call_timeout: Duration::from_secs(60),
            ..config()
        },
        connectors(&[&binance, &slow]),
        ledger,
    )
    .unwrap();

    let started = Instant::now();
    let report = engine
        .perform_full_reconciliation(Duration::from_secs(2))
        .await
        .unwrap();

    assert!(started.elapsed() < Duration::from_secs(3));
    assert_eq!(report.status(), SessionStatus::Partial);
    assert_eq!(
        report.session().exchange_outcomes[&ExchangeId::from("okx")],
        ExchangeOutcome::Failed
    );
    assert_eq!(count_of(&report, DiscrepancyType::Connectivity), 1);
    assert!(report
        .session()
        .notes
        .iter()
        .any(|note| note.contains("deadline")));
}

#[tokio::test(start_paused = true)]
async fn cancellation_fails_the_session() {
    let ledger = seeded_ledger("binance", dec!(1000));
    let binance = paper("binance", dec!(1000));
    binance.set_latency(Duration::from_secs(10));
    let engine = StateReconciliationEngine::new(config(), connectors(&[&binance]), ledger).unwrap();

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });
    let report = engine
        .perform_full_reconciliation_with_cancel(Duration::from_secs(30), cancel)
        .await
        .unwrap();

    assert_eq!(report.status(), SessionStatus::Failed);
    assert!(report.session().cancelled);
    assert!(!report.session().notes.is_empty());
}

#[tokio::test]
async fn unreadable_ledger_fails_the_session() {
    let binance = paper("binance", dec!(1000));
    let engine =
        StateReconciliationEngine::new(config(), connectors(&[&binance]), Arc::new(BrokenLedger))
            .unwrap();

    let report = engine
        .perform_full_reconciliation(Duration::from_secs(5))
        .await
        .unwrap();

    assert_eq!(report.status(), SessionStatus::Failed);
    assert_eq!(report.session().ledger_version, None);
    assert!(report.discrepancies().is_empty());
    assert!(report
        .session()
        .notes
        .iter()
        .any(|note| note.contains("journal corrupted")));
}

#[tokio::test]
async fn unreadable_ledger_keeps_connectivity_findings() {
    let binance = paper("binance", dec!(1000));
    let bybit = paper("bybit", dec!(0));
    binance.set_connected(false);
    bybit.set_connected(false);
    let engine = StateReconciliationEngine::new(
        EngineConfig {
            retry: RetryPolicy::none(),
            ..config()
        },
        connectors(&[&binance, &bybit]),
        Arc::new(BrokenLedger),
    )
    .unwrap();

    let report = engine
        .perform_full_reconciliation(Duration::from_secs(5))
        .await
        .unwrap();

    assert_eq!(report.status(), SessionStatus::Failed);
    assert_eq!(report.discrepancies().len(), 2);
    assert_eq!(count_of(&report, DiscrepancyType::Connectivity), 2);
    let exchanges: Vec<_> = report
        .discrepancies()
        .iter()
        .map(|d| d.exchange_id.as_str())
        .collect();
    assert_eq!(exchanges, vec!["binance", "bybit"]);
}

#[tokio::test(start_paused = true)]
async fn stalled_ledger_still_reports_unreachable_exchanges() {
    let binance = paper("binance", dec!(1000));
    let bybit = paper("bybit", dec!(0));
    let okx = paper("okx", dec!(0));
    bybit.set_connected(false);
    okx.set_latency(Duration::from_secs(30));
    let engine = StateReconciliationEngine::new(
        EngineConfig {
            retry: RetryPolicy::none(),
            call_timeout: Duration::from_secs(60),
            ledger_timeout: Duration::from_secs(60),
            ..config()
        },
        connectors(&[&binance, &bybit, &okx]),
        Arc::new(StalledLedger),
    )
    .unwrap();

    let report = engine
        .perform_full_reconciliation(Duration::from_secs(2))
        .await
        .unwrap();

    assert_eq!(report.status(), SessionStatus::Failed);
    assert_eq!(report.session().ledger_version, None);
    let connectivity: Vec<_> = report
        .discrepancies()
        .iter()
        .filter(|d| d.discrepancy_type == DiscrepancyType::Connectivity)
        .map(|d| d.exchange_id.as_str())
        .collect();
    assert_eq!(connectivity, vec!["bybit", "okx"]);
    assert_eq!(report.discrepancies().len(), 2);
    assert_eq!(
        report.session().exchange_outcomes[&ExchangeId::from("binance")],
        ExchangeOutcome::Complete
    );
    let notes = &report.session().notes;
    assert!(notes.iter().any(|note| note.contains("deadline")));
    assert!(notes.iter().any(|note| note.contains("ledger read did not finish")));
}

#[tokio::test]
async fn pruned_ledger_history_is_noted() {
    let book = Arc::new(LedgerBook::new(LedgerBookConfig {
        history_limit: 2,
        ..LedgerBookConfig::default()
    }));
    book.commit(
        vec![LedgerMutation::SetBalance {
            exchange: ExchangeId::from("binance"),
            asset: AssetId::from("USDT"),
            balance: Balance::free(dec!(1000)),
        }],
        "seed",
    )
    .unwrap();
    let binance = paper("binance", dec!(1000));
    let engine = StateReconciliationEngine::new(
        config(),
        connectors(&[&binance]),
        Arc::new(BusyLedger { book: book.clone() }),
    )
    .unwrap();

    let report = engine
        .perform_full_reconciliation(Duration::from_secs(5))
        .await
        .unwrap();

    assert_eq!(report.status(), SessionStatus::Completed);
    assert!(report.discrepancies().is_empty());
    assert_eq!(report.session().ledger_version, Some(2));
    assert!(report
        .session()
        .notes
        .iter()
        .any(|note| note.contains("no longer covers the session start")));
}

#[tokio::test]
async fn cancelled_token_is_rejected_before_a_session_starts() {
    let ledger = seeded_ledger("binance", dec!(1000));
    let binance = paper("binance", dec!(1000));
    let store = Arc::new(InMemoryReportStore::new());
    let engine = StateReconciliationEngine::new(config(), connectors(&[&binance]), ledger)
        .unwrap()
        .with_store(store.clone());

    let cancel = CancellationToken::new();
    cancel.cancel();
    let result = engine
        .perform_full_reconciliation_with_cancel(Duration::from_secs(5), cancel)
        .await;

    assert!(matches!(result, Err(ReconcileError::Cancelled)));
    assert!(store.is_empty());
    assert_eq!(binance.call_count(StateCategory::Balances), 0);
}

#[tokio::test]
async fn invalid_setup_is_rejected() {
    let ledger = seeded_ledger("binance", dec!(1000));
    let binance = paper("binance", dec!(1000));

    let empty = StateReconciliationEngine::new(config(), Vec::new(), ledger.clone());
    assert!(matches!(empty, Err(ReconcileError::Configuration(_))));

    let twin = paper("BINANCE", dec!(1));
    let duplicate =
        StateReconciliationEngine::new(config(), connectors(&[&binance, &twin]), ledger.clone());
    assert!(matches!(duplicate, Err(ReconcileError::Configuration(_))));

    let engine = StateReconciliationEngine::new(config(), connectors(&[&binance]), ledger).unwrap();
    assert!(matches!(
        engine.perform_full_reconciliation(Duration::ZERO).await,
        Err(ReconcileError::Configuration(_))
    ));
}

#[tokio::test]
async fn health_check_reports_each_capability() {
    let ledger = seeded_ledger("binance", dec!(1000));
    let binance = paper("binance", dec!(1000));
    let bybit = paper("bybit", dec!(0));
    bybit.set_connected(false);
    let engine = StateReconciliationEngine::new(
        config(),
        connectors(&[&binance, &bybit]),
        ledger.clone(),
    )
    .unwrap();

    let status = engine.health_check().await;
    assert!(status.engine_ready);
    assert!(status.ledger_ready);
    assert!(status.exchange_connected[&ExchangeId::from("binance")]);
    assert!(!status.exchange_connected[&ExchangeId::from("bybit")]);

    ledger.set_running(false);
    let status = engine.health_check().await;
    assert!(!status.engine_ready);
    assert!(!status.ledger_ready);

    let broken =
        StateReconciliationEngine::new(config(), connectors(&[&binance]), Arc::new(BrokenLedger))
            .unwrap();
    assert!(!broken.health_check().await.engine_ready);
}

#[tokio::test]
async fn rate_limiter_spaces_calls_per_exchange() {
    let ledger = seeded_ledger("binance", dec!(1000));
    let binance = paper("binance", dec!(1000));
    let bybit = paper("bybit", dec!(0));
    let quota = Quota::per_second(NonZeroU32::new(10).unwrap())
        .allow_burst(NonZeroU32::new(1).unwrap());
    let engine =
        StateReconciliationEngine::new(config(), connectors(&[&binance, &bybit]), ledger)
            .unwrap()
            .with_rate_limiter(RateLimiter::keyed(quota));

    let report = engine
        .perform_full_reconciliation(Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(report.status(), SessionStatus::Completed);

    let mut first_calls = Vec::new();
    for connector in [&binance, &bybit] {
        let mut times: Vec<Instant> = StateCategory::ALL
            .iter()
            .flat_map(|category| connector.call_times(*category))
            .collect();
        times.sort();
        assert_eq!(times.len(), 3);
        assert!(times[2] - times[0] >= Duration::from_millis(150));
        first_calls.push(times[0]);
    }
    first_calls.sort();
    let skew = first_calls[1] - first_calls[0];
    assert!(skew < Duration::from_millis(90));
}

#[tokio::test]
async fn concurrent_sessions_share_the_exchange_quota() {
    let ledger = seeded_ledger("binance", dec!(1000));
    let binance = paper("binance", dec!(1000));
    let quota = Quota::per_second(NonZeroU32::new(10).unwrap())
        .allow_burst(NonZeroU32::new(1).unwrap());
    let engine = StateReconciliationEngine::new(config(), connectors(&[&binance]), ledger)
        .unwrap()
        .with_rate_limiter(RateLimiter::keyed(quota));

    let (first, second) = tokio::join!(
        engine.perform_full_reconciliation(Duration::from_secs(5)),
        engine.perform_full_reconciliation(Duration::from_secs(5)),
    );
    assert_eq!(first.unwrap().status(), SessionStatus::Completed);
    assert_eq!(second.unwrap().status(), SessionStatus::Completed);

    let mut times: Vec<Instant> = StateCategory::ALL
        .iter()
        .flat_map(|category| binance.call_times(*category))
        .collect();
    times.sort();
    assert_eq!(times.len(), 6);
    for pair in times.windows(2) {
        assert!(pair[1] - pair[0] >= Duration::from_millis(80));
    }
    assert!(times[5] - times[0] >= Duration::from_millis(450));
}

#[tokio::test]
async fn reports_are_persisted() {
    let dir = tempdir().unwrap();
    let store = Arc::new(SqliteReportStore::new(dir.path().join("reports.db")).unwrap());
    let ledger = seeded_ledger("binance", dec!(1000));
    let binance = paper("binance", dec!(990));
    let engine = StateReconciliationEngine::new(config(), connectors(&[&binance]), ledger)
        .unwrap()
        .with_store(store.clone());

    let report = engine
        .perform_full_reconciliation(Duration::from_secs(5))
        .await
        .unwrap();

    let stored = store.get(report.id()).unwrap().expect("report persisted");
    assert_eq!(stored.status(), report.status());
    assert_eq!(stored.discrepancies().len(), report.discrepancies().len());
    assert_eq!(store.recent(10).unwrap().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn ledger_writes_do_not_block_sessions() {
    let ledger = seeded_ledger("binance", dec!(1000));
    let binance = paper("binance", dec!(1000));
    let engine =
        StateReconciliationEngine::new(config(), connectors(&[&binance]), ledger.clone()).unwrap();

    let writer = {
        let ledger = ledger.clone();
        std::thread::spawn(move || {
            for _ in 0..200 {
                ledger
                    .commit(
                        vec![LedgerMutation::AdjustBalance {
                            exchange: ExchangeId::from("binance"),
                            asset: AssetId::from("BTC"),
                            free_delta: dec!(0.001),
                            locked_delta: Decimal::ZERO,
                        }],
                        "fill",
                    )
                    .unwrap();
            }
        })
    };
    let mut versions = Vec::new();
    for _ in 0..5 {
        let report = engine
            .perform_full_reconciliation(Duration::from_secs(5))
            .await
            .unwrap();
        assert_ne!(report.status(), SessionStatus::Failed);
        versions.push(report.session().ledger_version.expect("ledger read"));
    }
    writer.join().unwrap();
    assert!(versions.windows(2).all(|pair| pair[0] <= pair[1]));
}

#[tokio::test(start_paused = true)]
async fn schedule_runs_until_shutdown() {
    let ledger = seeded_ledger("binance", dec!(1000));
    let binance = paper("binance", dec!(1000));
    let store = Arc::new(InMemoryReportStore::new());
    let engine = Arc::new(
        StateReconciliationEngine::new(config(), connectors(&[&binance]), ledger)
            .unwrap()
            .with_store(store.clone()),
    );

    let shutdown = CancellationToken::new();
    assert!(engine
        .clone()
        .spawn_schedule(Duration::ZERO, shutdown.clone())
        .is_err());
    let handle = engine
        .spawn_schedule(Duration::from_secs(60), shutdown.clone())
        .unwrap();
    sleep(Duration::from_secs(150)).await;
    shutdown.cancel();
    handle.await.unwrap();

    assert!(store.len() >= 2);
    assert!(store
        .recent(10)
        .unwrap()
        .iter()
        .all(|report| report.status() == SessionStatus::Completed));
}
