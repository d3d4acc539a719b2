//! Assembles the reconciliation engine from [`AppConfig`].

use std::collections::BTreeMap;
use std::num::NonZeroU32;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use tesser_broker::{get_connector_factory, registered_connectors, ExchangeConnector, RateLimiter};
use tesser_config::{AppConfig, ExchangeConfig, LedgerConfig, ReconciliationConfig, ReportsConfig};
use tesser_core::{AssetId, ExchangeId};
use tesser_ledger::{JournalRepository, LedgerBook, LedgerBookConfig, SqliteJournal};
use tesser_reconcile::{
    EngineConfig, ReportSink, RetryPolicy, SqliteReportStore, StateReconciliationEngine,
    Tolerances, TracingReportSink,
};
use tracing::info;

/// Everything a CLI command needs to run sessions.
pub struct Runtime {
    pub engine: Arc<StateReconciliationEngine>,
    pub ledger: Arc<LedgerBook>,
    pub store: Arc<SqliteReportStore>,
}

pub fn engine_config(settings: &ReconciliationConfig) -> EngineConfig {
    EngineConfig {
        session_timeout: settings.session_timeout(),
        call_timeout: settings.call_timeout(),
        ledger_timeout: settings.ledger_timeout(),
        health_timeout: settings.health_timeout(),
        retry: RetryPolicy {
            max_retries: settings.max_retries,
            initial_backoff: settings.initial_backoff(),
            max_backoff: settings.max_backoff(),
        },
        max_concurrent_collections: settings.max_concurrent_collections,
        tolerances: Tolerances {
            absolute: settings.tolerances.absolute,
            relative: settings.tolerances.relative,
            critical_ratio: settings.tolerances.critical_ratio,
        },
    }
}

/// Open the journal and rebuild the ledger from it.
pub fn open_ledger(config: &LedgerConfig) -> Result<Arc<LedgerBook>> {
    let journal: Arc<dyn JournalRepository> = Arc::new(
        SqliteJournal::new(&config.journal_path).with_context(|| {
            format!(
                "failed to open ledger journal {}",
                config.journal_path.display()
            )
        })?,
    );
    let book = LedgerBook::replay(
        LedgerBookConfig {
            capital_asset: AssetId::from(config.capital_asset.as_str()),
            history_limit: config.history_limit,
        },
        journal,
    )
    .context("failed to replay ledger journal")?;
    info!(
        path = %config.journal_path.display(),
        version = book.latest().version,
        sequence = book.latest().sequence,
        "ledger restored"
    );
    Ok(Arc::new(book))
}

pub fn open_report_store(config: &ReportsConfig) -> Result<Arc<SqliteReportStore>> {
    let store = SqliteReportStore::new(&config.store_path).with_context(|| {
        format!(
            "failed to open report store {}",
            config.store_path.display()
        )
    })?;
    Ok(Arc::new(store))
}

/// Instantiate one connector per configured exchange through the driver registry.
pub fn build_connectors(
    exchanges: &BTreeMap<String, ExchangeConfig>,
) -> Result<Vec<Arc<dyn ExchangeConnector>>> {
    if exchanges.is_empty() {
        bail!("no exchanges configured; add an [exchanges.<name>] section");
    }
    exchanges
        .iter()
        .map(|(name, exchange)| {
            let factory = get_connector_factory(&exchange.driver).ok_or_else(|| {
                anyhow!(
                    "unknown driver '{}' for exchange {name} (available: {})",
                    exchange.driver,
                    registered_connectors().join(", ")
                )
            })?;
            factory
                .build(ExchangeId::from(name.as_str()), &exchange.params)
                .with_context(|| format!("failed to build connector for exchange {name}"))
        })
        .collect()
}

/// Wire ledger, connectors, report store and sinks into an engine.
pub fn build_runtime(config: &AppConfig, sinks: Vec<Arc<dyn ReportSink>>) -> Result<Runtime> {
    let ledger = open_ledger(&config.ledger)?;
    let store = open_report_store(&config.reports)?;
    let connectors = build_connectors(&config.exchanges)?;
    let limiter = RateLimiter::per_exchange(
        config
            .reconciliation
            .requests_per_second
            .and_then(NonZeroU32::new),
    );

    let mut engine = StateReconciliationEngine::new(
        engine_config(&config.reconciliation),
        connectors,
        ledger.clone(),
    )
    .context("invalid reconciliation configuration")?
    .with_rate_limiter(limiter)
    .with_store(store.clone())
    .with_sink(Arc::new(TracingReportSink));
    for sink in sinks {
        engine = engine.with_sink(sink);
    }

    Ok(Runtime {
        engine: Arc::new(engine),
        ledger,
        store,
    })
}
