use crate::{JournalQuery, JournalRecord, LedgerResult};

/// Abstraction over durable storage for ledger mutations.
pub trait JournalRepository: Send + Sync {
    /// Persist a single record.
    fn append(&self, record: &JournalRecord) -> LedgerResult<()> {
        self.append_batch(std::slice::from_ref(record))
    }

    /// Persist a committed batch atomically.
    fn append_batch(&self, records: &[JournalRecord]) -> LedgerResult<()>;

    /// Read the latest persisted sequence value.
    fn latest_sequence(&self) -> LedgerResult<Option<u64>>;

    /// Load records matching the supplied query.
    fn query(&self, query: JournalQuery) -> LedgerResult<Vec<JournalRecord>>;
}
