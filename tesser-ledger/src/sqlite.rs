use std::fs;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use uuid::Uuid;

use crate::{JournalQuery, JournalRecord, JournalRepository, LedgerError, LedgerResult};

const JOURNAL_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS journal_records (
    sequence INTEGER PRIMARY KEY,
    record_id TEXT NOT NULL UNIQUE,
    timestamp TEXT NOT NULL,
    exchange TEXT NOT NULL,
    kind TEXT NOT NULL,
    reference_id TEXT NOT NULL,
    payload TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS journal_idx_timestamp_exchange
    ON journal_records(timestamp, exchange);
CREATE INDEX IF NOT EXISTS journal_idx_reference
    ON journal_records(reference_id);
"#;

/// SQLite-backed mutation journal.
#[derive(Clone, Debug)]
pub struct SqliteJournal {
    path: PathBuf,
}

impl SqliteJournal {
    pub fn new(path: impl Into<PathBuf>) -> LedgerResult<Self> {
        let journal = Self { path: path.into() };
        journal.initialize_schema()?;
        Ok(journal)
    }

    fn initialize_schema(&self) -> LedgerResult<()> {
        let conn = self.connect()?;
        conn.execute_batch(JOURNAL_SCHEMA)?;
        Ok(())
    }

    fn connect(&self) -> LedgerResult<Connection> {
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

impl JournalRepository for SqliteJournal {
    fn append_batch(&self, records: &[JournalRecord]) -> LedgerResult<()> {
        if records.is_empty() {
            return Ok(());
        }
        let mut conn = self.connect()?;
        let tx = conn.transaction()?;
        for record in records {
            tx.execute(
                "INSERT INTO journal_records (
                    sequence, record_id, timestamp, exchange, kind, reference_id, payload
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    record.sequence as i64,
                    record.id.to_string(),
                    record.timestamp.to_rfc3339(),
                    record.mutation.exchange().as_str(),
                    record.mutation.kind().as_str(),
                    record.reference_id,
                    serde_json::to_string(&record.mutation)?,
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn latest_sequence(&self) -> LedgerResult<Option<u64>> {
        let conn = self.connect()?;
        let seq: Option<Option<i64>> = conn
            .query_row("SELECT MAX(sequence) FROM journal_records", [], |row| {
                row.get::<_, Option<i64>>(0)
            })
            .optional()?;
        Ok(seq.flatten().map(|value| value as u64))
    }

    fn query(&self, query: JournalQuery) -> LedgerResult<Vec<JournalRecord>> {
        let conn = self.connect()?;
        let mut sql = String::from(
            "SELECT sequence, record_id, timestamp, reference_id, payload
             FROM journal_records
             WHERE (?1 IS NULL OR exchange = ?1)
               AND (?2 IS NULL OR sequence >= ?2)
               AND (?3 IS NULL OR sequence <= ?3)
               AND (?4 IS NULL OR timestamp >= ?4)
               AND (?5 IS NULL OR timestamp <= ?5)",
        );
        sql.push_str(if query.ascending {
            " ORDER BY sequence ASC"
        } else {
            " ORDER BY sequence DESC"
        });
        if query.limit.is_some() {
            sql.push_str(" LIMIT ?6");
        }

        let mut params: Vec<Value> = Vec::with_capacity(6);
        params.push(optional_text(query.exchange.map(|id| id.to_string())));
        params.push(optional_int(query.start_sequence));
        params.push(optional_int(query.end_sequence));
        params.push(optional_text(query.start_time.map(|ts| ts.to_rfc3339())));
        params.push(optional_text(query.end_time.map(|ts| ts.to_rfc3339())));
        if let Some(limit) = query.limit {
            params.push(Value::Integer(limit as i64));
        }

        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query(params_from_iter(params.iter()))?;
        let mut records = Vec::new();
        while let Some(row) = rows.next()? {
            records.push(row_to_record(row)?);
        }
        Ok(records)
    }
}

fn optional_text(value: Option<String>) -> Value {
    value.map(Value::from).unwrap_or(Value::Null)
}

fn optional_int(value: Option<u64>) -> Value {
    value
        .map(|v| Value::Integer(v as i64))
        .unwrap_or(Value::Null)
}

fn row_to_record(row: &rusqlite::Row<'_>) -> LedgerResult<JournalRecord> {
    let sequence: i64 = row.get(0)?;
    let record_id: String = row.get(1)?;
    let timestamp_str: String = row.get(2)?;
    let reference_id: String = row.get(3)?;
    let payload: String = row.get(4)?;

    let timestamp = DateTime::parse_from_rfc3339(&timestamp_str)
        .map_err(|err| {
            LedgerError::Serialization(format!("invalid timestamp {timestamp_str}: {err}"))
        })?
        .with_timezone(&Utc);
    let mutation = serde_json::from_str(&payload).map_err(|err| {
        LedgerError::Serialization(format!("invalid journal payload at {sequence}: {err}"))
    })?;

    Ok(JournalRecord {
        id: Uuid::parse_str(&record_id).map_err(|err| {
            LedgerError::Serialization(format!("invalid record id {record_id}: {err}"))
        })?,
        sequence: sequence as u64,
        timestamp,
        reference_id,
        mutation,
    })
}
