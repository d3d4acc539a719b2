use async_trait::async_trait;
use tracing::{error, info};

use crate::{Discrepancy, ReconcileResult, ReconciliationReport};

/// Destination for finalized reports.
#[async_trait]
pub trait ReportSink: Send + Sync {
    /// Called once for every finalized report.
    async fn publish(&self, report: &ReconciliationReport) -> ReconcileResult<()>;

    /// Called in addition to `publish` when a report carries critical findings.
    async fn escalate(
        &self,
        report: &ReconciliationReport,
        critical: &[&Discrepancy],
    ) -> ReconcileResult<()>;
}

/// Sink that only writes structured log lines.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingReportSink;

#[async_trait]
impl ReportSink for TracingReportSink {
    async fn publish(&self, report: &ReconciliationReport) -> ReconcileResult<()> {
        let summary = report.summary();
        info!(
            session_id = %report.id(),
            status = %report.status(),
            total = summary.total_discrepancies,
            critical = summary.critical_count,
            duration_secs = summary.duration_seconds,
            "reconciliation report published"
        );
        Ok(())
    }

    async fn escalate(
        &self,
        report: &ReconciliationReport,
        critical: &[&Discrepancy],
    ) -> ReconcileResult<()> {
        for discrepancy in critical {
            error!(
                session_id = %report.id(),
                exchange = %discrepancy.exchange_id,
                kind = %discrepancy.discrepancy_type,
                entity = %discrepancy.entity_key,
                expected = discrepancy.expected_value.as_deref().unwrap_or("-"),
                actual = discrepancy.actual_value.as_deref().unwrap_or("-"),
                "{}",
                discrepancy.description
            );
        }
        Ok(())
    }
}
