use std::convert::Infallible;
use std::fs::{self, OpenOptions};
use std::io;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, OnceLock};

use anyhow::{Context, Result};
use async_trait::async_trait;
use hyper::body::Body;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Request, Response, StatusCode};
use prometheus::{
    Encoder, GaugeVec, Histogram, HistogramOpts, IntCounterVec, Opts, Registry, TextEncoder,
};
use tesser_reconcile::{
    Discrepancy, ExchangeOutcome, ReconcileResult, ReconciliationReport, ReportSink, Severity,
};
use tracing::{error, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

static FILE_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Install the global tracing subscriber with optional JSON file logging.
///
/// Human readable output goes to stderr so command results on stdout stay
/// machine readable.
pub fn init_tracing(filter: &str, log_path: Option<&Path>) -> Result<()> {
    let stderr_layer = fmt::layer()
        .with_target(false)
        .with_writer(io::stderr)
        .with_filter(EnvFilter::new(filter));
    if let Some(path) = log_path {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)
                .with_context(|| format!("failed to create log directory {dir:?}"))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open log file {}", path.display()))?;
        let (writer, guard) = tracing_appender::non_blocking(file);
        let _ = FILE_GUARD.set(guard);
        let file_layer = fmt::layer()
            .json()
            .with_ansi(false)
            .with_target(true)
            .with_writer(writer)
            .with_filter(EnvFilter::new(filter));
        tracing_subscriber::registry()
            .with(stderr_layer)
            .with(file_layer)
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(stderr_layer)
            .try_init()?;
    }

    Ok(())
}

/// Prometheus metrics describing reconciliation sessions.
pub struct ReconcileMetrics {
    registry: Registry,
    sessions_total: IntCounterVec,
    discrepancies_total: IntCounterVec,
    session_duration: Histogram,
    connection_status: GaugeVec,
}

impl ReconcileMetrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();
        let sessions_total = IntCounterVec::new(
            Opts::new(
                "tesser_reconciliation_sessions_total",
                "Finalized reconciliation sessions by status",
            ),
            &["status"],
        )?;
        let discrepancies_total = IntCounterVec::new(
            Opts::new(
                "tesser_reconciliation_discrepancies_total",
                "Discrepancies reported by severity",
            ),
            &["severity"],
        )?;
        let session_duration = Histogram::with_opts(HistogramOpts::new(
            "tesser_reconciliation_session_duration_seconds",
            "Wall-clock duration of reconciliation sessions",
        ))?;
        let connection_status = GaugeVec::new(
            Opts::new(
                "tesser_exchange_connection_status",
                "Outcome of the last collection per exchange (1=collected, 0=failed)",
            ),
            &["exchange"],
        )?;

        registry.register(Box::new(sessions_total.clone()))?;
        registry.register(Box::new(discrepancies_total.clone()))?;
        registry.register(Box::new(session_duration.clone()))?;
        registry.register(Box::new(connection_status.clone()))?;

        Ok(Self {
            registry,
            sessions_total,
            discrepancies_total,
            session_duration,
            connection_status,
        })
    }

    pub fn registry(&self) -> Registry {
        self.registry.clone()
    }

    pub fn observe_report(&self, report: &ReconciliationReport) {
        let summary = report.summary();
        self.sessions_total
            .with_label_values(&[report.status().as_str()])
            .inc();
        for (severity, count) in [
            (Severity::Critical, summary.critical_count),
            (Severity::Warning, summary.warning_count),
            (Severity::Info, summary.info_count),
        ] {
            self.discrepancies_total
                .with_label_values(&[severity.as_str()])
                .inc_by(count as u64);
        }
        self.session_duration.observe(summary.duration_seconds);
        for (exchange, outcome) in &report.session().exchange_outcomes {
            self.update_connection_status(exchange.as_str(), *outcome != ExchangeOutcome::Failed);
        }
    }

    pub fn update_connection_status(&self, exchange: &str, connected: bool) {
        let value = if connected { 1.0 } else { 0.0 };
        self.connection_status
            .with_label_values(&[exchange])
            .set(value);
    }
}

/// Feeds finalized reports into [`ReconcileMetrics`].
pub struct MetricsSink {
    metrics: Arc<ReconcileMetrics>,
}

impl MetricsSink {
    pub fn new(metrics: Arc<ReconcileMetrics>) -> Self {
        Self { metrics }
    }
}

#[async_trait]
impl ReportSink for MetricsSink {
    async fn publish(&self, report: &ReconciliationReport) -> ReconcileResult<()> {
        self.metrics.observe_report(report);
        Ok(())
    }

    async fn escalate(
        &self,
        _report: &ReconciliationReport,
        _critical: &[&Discrepancy],
    ) -> ReconcileResult<()> {
        Ok(())
    }
}

fn encode_metrics(registry: &Registry) -> Response<Body> {
    let encoder = TextEncoder::new();
    let metric_families = registry.gather();
    let mut buffer = Vec::new();
    if let Err(err) = encoder.encode(&metric_families, &mut buffer) {
        error!(error = %err, "failed to encode Prometheus metrics");
        let mut response = Response::new(Body::from("failed to encode metrics"));
        *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
        return response;
    }
    let mut response = Response::new(Body::from(buffer));
    if let Ok(content_type) = encoder.format_type().parse() {
        response
            .headers_mut()
            .insert(hyper::header::CONTENT_TYPE, content_type);
    }
    response
}

/// Launch a lightweight HTTP server that exposes Prometheus metrics.
pub fn spawn_metrics_server(registry: Registry, addr: SocketAddr) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let make_svc = make_service_fn(move |_| {
            let registry = registry.clone();
            async move {
                Ok::<_, Infallible>(service_fn(move |_req: Request<Body>| {
                    let response = encode_metrics(&registry);
                    async move { Ok::<_, Infallible>(response) }
                }))
            }
        });

        info!(%addr, "metrics server listening");
        if let Err(err) = hyper::Server::bind(&addr).serve(make_svc).await {
            error!(error = %err, %addr, "metrics server terminated");
        } else {
            info!(%addr, "metrics server shutdown");
        }
    })
}
