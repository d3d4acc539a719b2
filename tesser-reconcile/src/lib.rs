//! State reconciliation between exchange-reported and ledger-expected account state.
//!
//! A session fans out one [`ExchangeStateCollector`] per exchange alongside a
//! [`LedgerStateReader`], compares each snapshot with the
//! [`DiscrepancyDetector`] as it arrives and finalizes everything into an
//! immutable [`ReconciliationReport`].

mod collector;
mod config;
mod detector;
mod discrepancy;
mod engine;
mod error;
mod health;
mod ledger_reader;
mod report;
mod session;
mod sink;
mod snapshot;
mod store;

pub use collector::ExchangeStateCollector;
pub use config::{EngineConfig, RetryPolicy, Tolerances};
pub use detector::DiscrepancyDetector;
pub use discrepancy::{sort_discrepancies, Discrepancy, DiscrepancyType, Severity};
pub use engine::StateReconciliationEngine;
pub use error::{ReconcileError, ReconcileResult};
pub use health::{aggregate_health, HealthProbes, HealthStatus, ProbeOutcome};
pub use ledger_reader::LedgerStateReader;
pub use report::{ReconciliationReport, ReportBuilder, ReportSummary};
pub use session::{ExchangeOutcome, ReconciliationSession, SessionStatus};
pub use sink::{ReportSink, TracingReportSink};
pub use snapshot::{ExchangeSnapshot, ExpectedState, LedgerSnapshot};
pub use store::{InMemoryReportStore, ReportStore, SqliteReportStore};
