use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tesser_core::ExchangeId;
use uuid::Uuid;

use crate::{Discrepancy, ExchangeOutcome, ReconciliationSession, SessionStatus, Severity};

/// Aggregates derived from a finalized session.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReportSummary {
    pub total_discrepancies: usize,
    pub critical_count: usize,
    pub warning_count: usize,
    pub info_count: usize,
    pub duration_seconds: f64,
    pub exchanges_checked: BTreeSet<ExchangeId>,
}

/// A finalized, immutable reconciliation session.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReconciliationReport {
    session: ReconciliationSession,
    summary: ReportSummary,
}

impl ReconciliationReport {
    pub fn session(&self) -> &ReconciliationSession {
        &self.session
    }

    pub fn summary(&self) -> &ReportSummary {
        &self.summary
    }

    pub fn id(&self) -> Uuid {
        self.session.id
    }

    pub fn status(&self) -> SessionStatus {
        self.session.status
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.session.start_time
    }

    pub fn finished_at(&self) -> DateTime<Utc> {
        self.session.end_time.unwrap_or(self.session.start_time)
    }

    pub fn discrepancies(&self) -> &[Discrepancy] {
        &self.session.discrepancies
    }

    /// CRITICAL discrepancies in report order.
    pub fn get_critical_discrepancies(&self) -> Vec<&Discrepancy> {
        self.session
            .discrepancies
            .iter()
            .filter(|discrepancy| discrepancy.is_critical())
            .collect()
    }

    /// Flat key/value view suitable for logs and dashboards.
    pub fn to_summary(&self) -> BTreeMap<String, Value> {
        let mut summary = BTreeMap::new();
        summary.insert("session_id".into(), json!(self.session.id.to_string()));
        summary.insert("status".into(), json!(self.session.status.as_str()));
        summary.insert(
            "total_discrepancies".into(),
            json!(self.summary.total_discrepancies),
        );
        summary.insert("critical_count".into(), json!(self.summary.critical_count));
        summary.insert("warning_count".into(), json!(self.summary.warning_count));
        summary.insert("info_count".into(), json!(self.summary.info_count));
        summary.insert(
            "duration_seconds".into(),
            json!(self.summary.duration_seconds),
        );
        summary.insert(
            "exchanges_checked".into(),
            json!(self
                .summary
                .exchanges_checked
                .iter()
                .map(ExchangeId::as_str)
                .collect::<Vec<_>>()),
        );
        summary.insert(
            "started_at".into(),
            json!(self.session.start_time.to_rfc3339()),
        );
        summary.insert(
            "finished_at".into(),
            json!(self.finished_at().to_rfc3339()),
        );
        summary
    }
}

/// Turns an in-progress session into a report.
pub struct ReportBuilder;

impl ReportBuilder {
    /// Finalize `session` now.
    pub fn finalize(session: ReconciliationSession) -> ReconciliationReport {
        Self::finalize_at(session, Utc::now())
    }

    /// Finalize `session` with an explicit end time.
    ///
    /// The end time is clamped so it never precedes the start time.
    pub fn finalize_at(
        mut session: ReconciliationSession,
        end_time: DateTime<Utc>,
    ) -> ReconciliationReport {
        let end_time = end_time.max(session.start_time);
        session.end_time = Some(end_time);
        session.status = Self::derive_status(&session);

        let count = |severity: Severity| {
            session
                .discrepancies
                .iter()
                .filter(|d| d.severity == severity)
                .count()
        };
        let duration = end_time - session.start_time;
        let summary = ReportSummary {
            total_discrepancies: session.discrepancies.len(),
            critical_count: count(Severity::Critical),
            warning_count: count(Severity::Warning),
            info_count: count(Severity::Info),
            duration_seconds: duration.num_milliseconds() as f64 / 1_000.0,
            exchanges_checked: session.exchanges_checked.clone(),
        };
        ReconciliationReport { session, summary }
    }

    fn derive_status(session: &ReconciliationSession) -> SessionStatus {
        if session.cancelled
            || session.ledger_version.is_none()
            || session.exchanges_checked.is_empty()
        {
            return SessionStatus::Failed;
        }
        let all_complete = session
            .exchange_outcomes
            .values()
            .all(|outcome| *outcome == ExchangeOutcome::Complete);
        if all_complete {
            SessionStatus::Completed
        } else {
            SessionStatus::Partial
        }
    }
}
