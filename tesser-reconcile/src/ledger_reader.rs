use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tesser_ledger::{LedgerError, LedgerSource};
use tokio::time::{sleep, timeout};
use tracing::warn;

use crate::{EngineConfig, LedgerSnapshot, ReconcileError, ReconcileResult, RetryPolicy};

/// Reads the ledger's expected state at a single instant.
#[derive(Clone)]
pub struct LedgerStateReader {
    source: Arc<dyn LedgerSource>,
    timeout: Duration,
    retry: RetryPolicy,
}

impl LedgerStateReader {
    pub fn new(source: Arc<dyn LedgerSource>, timeout: Duration, retry: RetryPolicy) -> Self {
        Self {
            source,
            timeout,
            retry,
        }
    }

    pub fn from_config(config: &EngineConfig, source: Arc<dyn LedgerSource>) -> Self {
        Self::new(source, config.ledger_timeout, config.retry)
    }

    /// Snapshot of the newest ledger version committed at or before `as_of`.
    pub async fn read_expected_state(&self, as_of: DateTime<Utc>) -> ReconcileResult<LedgerSnapshot> {
        let mut attempt = 0;
        loop {
            let err = match timeout(self.timeout, self.source.view_as_of(as_of)).await {
                Ok(Ok(state)) => return Ok(LedgerSnapshot::from_state(&state, as_of)),
                Ok(Err(err)) => ReconcileError::Ledger(err),
                Err(_) => ReconcileError::LedgerTimeout(self.timeout),
            };
            if !is_transient(&err) || attempt >= self.retry.max_retries {
                return Err(err);
            }
            let delay = self.retry.backoff(attempt);
            attempt += 1;
            warn!(attempt, error = %err, "ledger read failed; retrying");
            sleep(delay).await;
        }
    }
}

fn is_transient(err: &ReconcileError) -> bool {
    matches!(
        err,
        ReconcileError::LedgerTimeout(_) | ReconcileError::Ledger(LedgerError::Storage(_))
    )
}
