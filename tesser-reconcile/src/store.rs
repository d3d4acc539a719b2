use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::RwLock;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use uuid::Uuid;

use crate::{ReconcileError, ReconcileResult, ReconciliationReport};

/// Durable history of finalized reports.
///
/// Stored reports are never overwritten: appending a second report for the
/// same session fails with [`ReconcileError::Storage`].
pub trait ReportStore: Send + Sync {
    fn append(&self, report: &ReconciliationReport) -> ReconcileResult<()>;

    fn get(&self, session_id: Uuid) -> ReconcileResult<Option<ReconciliationReport>>;

    /// Most recent reports, newest first.
    fn recent(&self, limit: usize) -> ReconcileResult<Vec<ReconciliationReport>>;
}

/// Process-local store, mostly useful in tests and one-shot runs.
#[derive(Clone, Default)]
pub struct InMemoryReportStore {
    reports: Arc<RwLock<HashMap<Uuid, ReconciliationReport>>>,
}

impl InMemoryReportStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.reports.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ReportStore for InMemoryReportStore {
    fn append(&self, report: &ReconciliationReport) -> ReconcileResult<()> {
        ensure_final(report)?;
        let mut reports = self.reports.write();
        if reports.contains_key(&report.id()) {
            return Err(already_stored(report));
        }
        reports.insert(report.id(), report.clone());
        Ok(())
    }

    fn get(&self, session_id: Uuid) -> ReconcileResult<Option<ReconciliationReport>> {
        let reports = self.reports.read();
        Ok(reports.get(&session_id).cloned())
    }

    fn recent(&self, limit: usize) -> ReconcileResult<Vec<ReconciliationReport>> {
        let reports = self.reports.read();
        let mut all: Vec<_> = reports.values().cloned().collect();
        all.sort_by(|a, b| b.started_at().cmp(&a.started_at()));
        all.truncate(limit);
        Ok(all)
    }
}

const REPORT_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS reconciliation_reports (
    session_id TEXT PRIMARY KEY,
    started_at TEXT NOT NULL,
    finished_at TEXT NOT NULL,
    status TEXT NOT NULL,
    critical_count INTEGER NOT NULL,
    payload TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS reconciliation_reports_started
    ON reconciliation_reports(started_at);
"#;

/// SQLite-backed store keeping each report as a JSON payload.
#[derive(Clone, Debug)]
pub struct SqliteReportStore {
    path: PathBuf,
}

impl SqliteReportStore {
    pub fn new(path: impl Into<PathBuf>) -> ReconcileResult<Self> {
        let store = Self { path: path.into() };
        store.connect()?.execute_batch(REPORT_SCHEMA)?;
        Ok(store)
    }

    fn connect(&self) -> ReconcileResult<Connection> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(&self.path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;")?;
        Ok(conn)
    }
}

impl ReportStore for SqliteReportStore {
    fn append(&self, report: &ReconciliationReport) -> ReconcileResult<()> {
        ensure_final(report)?;
        let conn = self.connect()?;
        let inserted = conn.execute(
            "INSERT INTO reconciliation_reports (
                session_id, started_at, finished_at, status, critical_count, payload
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                report.id().to_string(),
                report.started_at().to_rfc3339(),
                report.finished_at().to_rfc3339(),
                report.status().as_str(),
                report.summary().critical_count as i64,
                serde_json::to_string(report)?,
            ],
        );
        match inserted {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == ErrorCode::ConstraintViolation =>
            {
                Err(already_stored(report))
            }
            Err(err) => Err(err.into()),
        }
    }

    fn get(&self, session_id: Uuid) -> ReconcileResult<Option<ReconciliationReport>> {
        let conn = self.connect()?;
        let payload: Option<String> = conn
            .query_row(
                "SELECT payload FROM reconciliation_reports WHERE session_id = ?1",
                params![session_id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        payload
            .map(|json| serde_json::from_str(&json).map_err(ReconcileError::from))
            .transpose()
    }

    fn recent(&self, limit: usize) -> ReconcileResult<Vec<ReconciliationReport>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT payload FROM reconciliation_reports ORDER BY started_at DESC LIMIT ?1",
        )?;
        let mut rows = stmt.query(params![limit as i64])?;
        let mut reports = Vec::new();
        while let Some(row) = rows.next()? {
            let payload: String = row.get(0)?;
            reports.push(serde_json::from_str(&payload)?);
        }
        Ok(reports)
    }
}

fn ensure_final(report: &ReconciliationReport) -> ReconcileResult<()> {
    if report.status().is_final() {
        Ok(())
    } else {
        Err(ReconcileError::DataIntegrity(format!(
            "report for session {} is still {}",
            report.id(),
            report.status()
        )))
    }
}

fn already_stored(report: &ReconciliationReport) -> ReconcileError {
    ReconcileError::Storage(format!(
        "a report for session {} is already stored",
        report.id()
    ))
}
