use std::time::Duration;

use tesser_broker::BrokerError;
use tesser_core::ExchangeId;
use tesser_ledger::LedgerError;
use thiserror::Error;

/// Result alias for reconciliation operations.
pub type ReconcileResult<T> = Result<T, ReconcileError>;

#[derive(Debug, Error)]
pub enum ReconcileError {
    /// An exchange could not be reached or answered with a transport failure.
    #[error("connectivity failure on {exchange}: {source}")]
    Connectivity {
        exchange: ExchangeId,
        #[source]
        source: BrokerError,
    },
    /// A record violated a structural invariant.
    #[error("data integrity violation: {0}")]
    DataIntegrity(String),
    /// The engine was configured with values it cannot run with.
    #[error("invalid configuration: {0}")]
    Configuration(String),
    #[error("reconciliation cancelled")]
    Cancelled,
    #[error("report storage error: {0}")]
    Storage(String),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error("ledger read timed out after {0:?}")]
    LedgerTimeout(Duration),
}

impl From<rusqlite::Error> for ReconcileError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Storage(value.to_string())
    }
}

impl From<serde_json::Error> for ReconcileError {
    fn from(value: serde_json::Error) -> Self {
        Self::Storage(value.to_string())
    }
}

impl From<std::io::Error> for ReconcileError {
    fn from(value: std::io::Error) -> Self {
        Self::Storage(value.to_string())
    }
}
