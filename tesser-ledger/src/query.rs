use chrono::{DateTime, Utc};
use tesser_core::ExchangeId;

/// Filter describing which journal records to load from storage.
#[derive(Clone, Debug)]
pub struct JournalQuery {
    pub exchange: Option<ExchangeId>,
    pub start_sequence: Option<u64>,
    pub end_sequence: Option<u64>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
    pub ascending: bool,
}

impl Default for JournalQuery {
    fn default() -> Self {
        Self {
            exchange: None,
            start_sequence: None,
            end_sequence: None,
            start_time: None,
            end_time: None,
            limit: None,
            ascending: true,
        }
    }
}

impl JournalQuery {
    pub fn with_exchange(mut self, exchange: ExchangeId) -> Self {
        self.exchange = Some(exchange);
        self
    }

    pub fn with_sequence_range(mut self, start: Option<u64>, end: Option<u64>) -> Self {
        self.start_sequence = start;
        self.end_sequence = end;
        self
    }

    pub fn with_time_range(
        mut self,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Self {
        self.start_time = start;
        self.end_time = end;
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn descending(mut self) -> Self {
        self.ascending = false;
        self
    }
}
