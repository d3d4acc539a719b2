use std::collections::BTreeMap;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tesser_broker::{ExchangeConnector, RateLimiter};
use tesser_core::ExchangeId;
use tesser_ledger::LedgerSource;
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{sleep_until, timeout, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    aggregate_health, DiscrepancyDetector, EngineConfig, ExchangeSnapshot, ExchangeStateCollector,
    HealthProbes, HealthStatus, LedgerSnapshot, LedgerStateReader, ProbeOutcome, ReconcileError,
    ReconcileResult, ReconciliationReport, ReconciliationSession, ReportBuilder, ReportSink,
    ReportStore,
};

/// Orchestrates reconciliation sessions across every configured exchange.
///
/// The engine only reads from exchanges and the ledger. Sessions may run
/// concurrently; they share the static configuration, the collection
/// semaphore and the per-exchange rate limiter.
pub struct StateReconciliationEngine {
    config: EngineConfig,
    connectors: BTreeMap<ExchangeId, Arc<dyn ExchangeConnector>>,
    ledger: Arc<dyn LedgerSource>,
    collector: ExchangeStateCollector,
    reader: LedgerStateReader,
    detector: DiscrepancyDetector,
    collection_permits: Arc<Semaphore>,
    store: Option<Arc<dyn ReportStore>>,
    sinks: Vec<Arc<dyn ReportSink>>,
}

enum TaskOutput {
    Exchange(ExchangeSnapshot),
    Ledger(ReconcileResult<LedgerSnapshot>),
    Cancelled,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Interruption {
    Cancelled,
    DeadlineElapsed,
}

impl StateReconciliationEngine {
    pub fn new(
        config: EngineConfig,
        connectors: Vec<Arc<dyn ExchangeConnector>>,
        ledger: Arc<dyn LedgerSource>,
    ) -> ReconcileResult<Self> {
        config.validate()?;
        if connectors.is_empty() {
            return Err(ReconcileError::Configuration(
                "at least one exchange connector is required".into(),
            ));
        }
        let mut by_exchange = BTreeMap::new();
        for connector in connectors {
            let exchange = connector.exchange();
            if by_exchange.insert(exchange.clone(), connector).is_some() {
                return Err(ReconcileError::Configuration(format!(
                    "exchange {exchange} is configured more than once"
                )));
            }
        }
        Ok(Self {
            collector: ExchangeStateCollector::from_config(&config, RateLimiter::unlimited()),
            reader: LedgerStateReader::from_config(&config, ledger.clone()),
            detector: DiscrepancyDetector::new(config.tolerances),
            collection_permits: Arc::new(Semaphore::new(config.max_concurrent_collections)),
            config,
            connectors: by_exchange,
            ledger,
            store: None,
            sinks: Vec::new(),
        })
    }

    /// Share `limiter` with every connector call this engine makes.
    pub fn with_rate_limiter(mut self, limiter: RateLimiter) -> Self {
        self.collector = ExchangeStateCollector::from_config(&self.config, limiter);
        self
    }

    pub fn with_store(mut self, store: Arc<dyn ReportStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn ReportSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn exchanges(&self) -> impl Iterator<Item = &ExchangeId> {
        self.connectors.keys()
    }

    /// Probe configuration, ledger and every exchange.
    ///
    /// Never fails: a probe that errors, panics or exceeds the health timeout
    /// reports its capability as unavailable.
    pub async fn health_check(&self) -> HealthStatus {
        let limit = self.config.health_timeout;
        let config = match self.config.validate() {
            Ok(()) => ProbeOutcome::Ready,
            Err(err) => ProbeOutcome::NotReady(err.to_string()),
        };

        let ledger = {
            let source = self.ledger.clone();
            tokio::spawn(async move {
                probe(limit, source.health_check(), |health| {
                    if health.healthy && health.running {
                        ProbeOutcome::Ready
                    } else {
                        ProbeOutcome::NotReady(format!(
                            "healthy={}, running={}",
                            health.healthy, health.running
                        ))
                    }
                })
                .await
            })
        };

        let mut probes = JoinSet::new();
        for (exchange, connector) in &self.connectors {
            let exchange = exchange.clone();
            let connector = connector.clone();
            probes.spawn(async move {
                let outcome = probe(limit, connector.health_check(), |health| {
                    if health.connected && health.healthy {
                        ProbeOutcome::Ready
                    } else {
                        ProbeOutcome::NotReady(format!(
                            "healthy={}, connected={}",
                            health.healthy, health.connected
                        ))
                    }
                })
                .await;
                (exchange, outcome)
            });
        }

        let mut exchanges: BTreeMap<ExchangeId, ProbeOutcome> = self
            .connectors
            .keys()
            .map(|exchange| {
                (
                    exchange.clone(),
                    ProbeOutcome::Unreachable("health probe panicked".into()),
                )
            })
            .collect();
        while let Some(joined) = probes.join_next().await {
            if let Ok((exchange, outcome)) = joined {
                exchanges.insert(exchange, outcome);
            }
        }
        let ledger = ledger
            .await
            .unwrap_or_else(|_| ProbeOutcome::Unreachable("health probe panicked".into()));

        let status = aggregate_health(HealthProbes {
            config,
            ledger,
            exchanges,
        });
        debug!(
            engine_ready = status.engine_ready,
            ledger_ready = status.ledger_ready,
            "health check complete"
        );
        status
    }

    /// Run one session bounded by `timeout`.
    pub async fn perform_full_reconciliation(
        &self,
        timeout: Duration,
    ) -> ReconcileResult<Arc<ReconciliationReport>> {
        self.perform_full_reconciliation_with_cancel(timeout, CancellationToken::new())
            .await
    }

    /// Run one session bounded by `timeout` that stops early when `cancel` fires.
    ///
    /// Configuration errors and a token that is already cancelled are returned
    /// before a session exists. Every other failure is contained in the
    /// returned report.
    pub async fn perform_full_reconciliation_with_cancel(
        &self,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> ReconcileResult<Arc<ReconciliationReport>> {
        if timeout.is_zero() {
            return Err(ReconcileError::Configuration(
                "session timeout must be greater than zero".into(),
            ));
        }
        if cancel.is_cancelled() {
            return Err(ReconcileError::Cancelled);
        }
        let deadline = Instant::now() + timeout;
        let mut session = ReconciliationSession::start();
        let session_id = session.id;
        info!(
            %session_id,
            exchanges = self.connectors.len(),
            timeout_ms = timeout.as_millis() as u64,
            "reconciliation session started"
        );

        let tasks_token = cancel.child_token();
        let mut tasks = self.spawn_collection(&session, &tasks_token);

        let mut ledger: Option<LedgerSnapshot> = None;
        let mut ledger_settled = false;
        let mut buffered: Vec<ExchangeSnapshot> = Vec::new();
        let mut last_captured = session.start_time;
        let mut interrupted = None;

        loop {
            let joined = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    interrupted = Some(Interruption::Cancelled);
                    break;
                }
                _ = sleep_until(deadline) => {
                    interrupted = Some(Interruption::DeadlineElapsed);
                    break;
                }
                joined = tasks.join_next() => joined,
            };
            let Some(joined) = joined else {
                break;
            };
            match joined {
                Ok(TaskOutput::Exchange(mut snapshot)) => {
                    snapshot.captured_at = snapshot.captured_at.max(last_captured);
                    last_captured = snapshot.captured_at;
                    match &ledger {
                        Some(expected) => self.detect_into(&mut session, &snapshot, expected),
                        None if ledger_settled => self.record_unmatched(&mut session, &snapshot),
                        None => buffered.push(snapshot),
                    }
                }
                Ok(TaskOutput::Ledger(Ok(snapshot))) => {
                    ledger_settled = true;
                    session.ledger_version = Some(snapshot.version);
                    if snapshot.is_later_than_requested() {
                        warn!(
                            %session_id,
                            version = snapshot.version,
                            "ledger history no longer covers the session start"
                        );
                        session.add_note(format!(
                            "ledger history no longer covers the session start; compared against version {} committed at {}",
                            snapshot.version,
                            snapshot.committed_at.to_rfc3339()
                        ));
                    }
                    for pending in buffered.drain(..) {
                        self.detect_into(&mut session, &pending, &snapshot);
                    }
                    ledger = Some(snapshot);
                }
                Ok(TaskOutput::Ledger(Err(err))) => {
                    ledger_settled = true;
                    error!(%session_id, error = %err, "ledger state unavailable");
                    session.add_note(format!("ledger unavailable: {err}"));
                }
                Ok(TaskOutput::Cancelled) => {}
                Err(err) => {
                    error!(%session_id, error = %err, "collection task failed");
                }
            }
        }
        tasks_token.cancel();
        tasks.abort_all();

        match interrupted {
            Some(Interruption::Cancelled) => {
                warn!(%session_id, "reconciliation session cancelled");
                session.mark_cancelled();
            }
            Some(Interruption::DeadlineElapsed) => {
                warn!(
                    %session_id,
                    timeout_ms = timeout.as_millis() as u64,
                    "session deadline elapsed"
                );
                session.add_note(format!(
                    "session deadline of {}ms elapsed; outstanding collections discarded",
                    timeout.as_millis()
                ));
            }
            None => {}
        }
        if !ledger_settled {
            session.add_note("ledger read did not finish before the session ended");
        }
        for pending in buffered.drain(..) {
            self.record_unmatched(&mut session, &pending);
        }
        for exchange in self.connectors.keys() {
            if session.exchange_outcomes.contains_key(exchange) {
                continue;
            }
            if interrupted != Some(Interruption::DeadlineElapsed) {
                session.record_failure(exchange);
                continue;
            }
            let captured_at = Utc::now().max(last_captured);
            last_captured = captured_at;
            let snapshot = ExchangeSnapshot::unavailable(
                exchange.clone(),
                captured_at,
                "collection did not finish before the session deadline",
            );
            match &ledger {
                Some(expected) => self.detect_into(&mut session, &snapshot, expected),
                None => self.record_unmatched(&mut session, &snapshot),
            }
        }

        let report = Arc::new(ReportBuilder::finalize(session));
        let summary = report.summary();
        info!(
            %session_id,
            status = %report.status(),
            exchanges_checked = summary.exchanges_checked.len(),
            discrepancies = summary.total_discrepancies,
            critical = summary.critical_count,
            duration_secs = summary.duration_seconds,
            "reconciliation session finished"
        );
        self.publish(&report).await;
        Ok(report)
    }

    /// Run sessions every `interval` until `shutdown` is cancelled.
    pub fn spawn_schedule(
        self: Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> ReconcileResult<JoinHandle<()>> {
        if interval.is_zero() {
            return Err(ReconcileError::Configuration(
                "schedule interval must be greater than zero".into(),
            ));
        }
        Ok(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let session_timeout = self.config.session_timeout;
                match self
                    .perform_full_reconciliation_with_cancel(session_timeout, shutdown.child_token())
                    .await
                {
                    Ok(_) => {}
                    Err(ReconcileError::Cancelled) => break,
                    Err(err) => error!(error = %err, "scheduled reconciliation failed"),
                }
            }
            info!("reconciliation schedule stopped");
        }))
    }

    fn spawn_collection(
        &self,
        session: &ReconciliationSession,
        token: &CancellationToken,
    ) -> JoinSet<TaskOutput> {
        let mut tasks = JoinSet::new();

        let reader = self.reader.clone();
        let as_of = session.start_time;
        let ledger_token = token.clone();
        tasks.spawn(async move {
            tokio::select! {
                _ = ledger_token.cancelled() => TaskOutput::Cancelled,
                result = reader.read_expected_state(as_of) => TaskOutput::Ledger(result),
            }
        });

        for connector in self.connectors.values() {
            let connector = connector.clone();
            let collector = self.collector.clone();
            let permits = self.collection_permits.clone();
            let token = token.clone();
            tasks.spawn(async move {
                let work = async {
                    // a closed semaphore only removes the concurrency bound
                    let _permit = permits.acquire_owned().await.ok();
                    collector.collect(connector.as_ref()).await
                };
                tokio::select! {
                    _ = token.cancelled() => TaskOutput::Cancelled,
                    snapshot = work => TaskOutput::Exchange(snapshot),
                }
            });
        }
        tasks
    }

    fn detect_into(
        &self,
        session: &mut ReconciliationSession,
        snapshot: &ExchangeSnapshot,
        ledger: &LedgerSnapshot,
    ) {
        let findings = self.detector.compare(snapshot, ledger);
        debug!(
            session_id = %session.id,
            exchange = %snapshot.exchange_id,
            findings = findings.len(),
            "exchange compared against ledger"
        );
        session.record_exchange(snapshot, findings);
    }

    /// Record a snapshot that has no ledger view to be compared against.
    fn record_unmatched(&self, session: &mut ReconciliationSession, snapshot: &ExchangeSnapshot) {
        let findings = self.detector.connectivity(snapshot).into_iter().collect();
        session.record_exchange(snapshot, findings);
    }

    async fn publish(&self, report: &Arc<ReconciliationReport>) {
        if let Some(store) = &self.store {
            let store = store.clone();
            let stored = report.clone();
            match tokio::task::spawn_blocking(move || store.append(&stored)).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(
                    session_id = %report.id(),
                    error = %err,
                    "failed to persist reconciliation report"
                ),
                Err(err) => warn!(
                    session_id = %report.id(),
                    error = %err,
                    "report persistence task failed"
                ),
            }
        }
        let critical = report.get_critical_discrepancies();
        for sink in &self.sinks {
            if let Err(err) = sink.publish(report).await {
                warn!(session_id = %report.id(), error = %err, "report sink rejected report");
            }
            if !critical.is_empty() {
                if let Err(err) = sink.escalate(report, &critical).await {
                    warn!(
                        session_id = %report.id(),
                        error = %err,
                        "failed to escalate critical findings"
                    );
                }
            }
        }
    }
}

async fn probe<T, E, F>(
    limit: Duration,
    call: impl Future<Output = Result<T, E>>,
    judge: F,
) -> ProbeOutcome
where
    E: Display,
    F: FnOnce(T) -> ProbeOutcome,
{
    match timeout(limit, call).await {
        Ok(Ok(value)) => judge(value),
        Ok(Err(err)) => ProbeOutcome::Unreachable(err.to_string()),
        Err(_) => ProbeOutcome::TimedOut,
    }
}
