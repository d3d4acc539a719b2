//! Versioned expected-state ledger and its durable mutation journal.

mod book;
mod error;
mod mutation;
mod query;
mod repository;
mod source;
mod sqlite;
mod state;

pub use book::{LedgerBook, LedgerBookConfig};
pub use error::{LedgerError, LedgerResult};
pub use mutation::{JournalRecord, LedgerMutation, MutationKind};
pub use query::JournalQuery;
pub use repository::JournalRepository;
pub use source::{LedgerHealth, LedgerSource};
pub use sqlite::SqliteJournal;
pub use state::{ExchangeBook, LedgerState};
