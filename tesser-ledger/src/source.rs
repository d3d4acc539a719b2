use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::{LedgerResult, LedgerState};

/// Liveness report for the ledger / capital manager.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerHealth {
    pub healthy: bool,
    pub running: bool,
    pub available_capital: Decimal,
}

/// Read side of the ledger consumed by reconciliation.
#[async_trait]
pub trait LedgerSource: Send + Sync {
    /// Probe the ledger without reading account state.
    async fn health_check(&self) -> LedgerResult<LedgerHealth>;

    /// Newest committed version whose commit time is at or before `as_of`.
    ///
    /// The returned state is immutable, so a reader never observes a write
    /// that lands after the version was published.
    async fn view_as_of(&self, as_of: DateTime<Utc>) -> LedgerResult<Arc<LedgerState>>;
}
