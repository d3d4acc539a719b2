use std::future::Future;
use std::time::Duration;

use chrono::Utc;
use tesser_broker::{BrokerError, ExchangeConnector, RateLimiter};
use tesser_core::{ExchangeId, StateCategory};
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

use crate::{EngineConfig, ExchangeSnapshot, ReconcileError, ReconcileResult, RetryPolicy};

/// Fetches one exchange's balances, open orders and positions.
///
/// Each category is fetched independently; a failing category degrades the
/// snapshot instead of aborting the collection.
#[derive(Clone)]
pub struct ExchangeStateCollector {
    limiter: RateLimiter,
    call_timeout: Duration,
    retry: RetryPolicy,
}

impl ExchangeStateCollector {
    pub fn new(limiter: RateLimiter, call_timeout: Duration, retry: RetryPolicy) -> Self {
        Self {
            limiter,
            call_timeout,
            retry,
        }
    }

    pub fn from_config(config: &EngineConfig, limiter: RateLimiter) -> Self {
        Self::new(limiter, config.call_timeout, config.retry)
    }

    pub async fn collect(&self, connector: &dyn ExchangeConnector) -> ExchangeSnapshot {
        let info = connector.info();
        let exchange = info.exchange.clone();
        let (balances, orders, positions) = tokio::join!(
            self.fetch(&exchange, StateCategory::Balances, || connector
                .account_balances()),
            self.fetch(&exchange, StateCategory::Orders, || connector.open_orders()),
            async {
                if info.supports_positions {
                    self.fetch(&exchange, StateCategory::Positions, || connector.positions())
                        .await
                } else {
                    Ok(Vec::new())
                }
            },
        );

        let mut snapshot = ExchangeSnapshot::new(exchange, Utc::now());
        match balances {
            Ok(balances) => snapshot.balances = balances,
            Err(err) => snapshot.mark_degraded(StateCategory::Balances, &err.to_string()),
        }
        match orders {
            Ok(orders) => snapshot.open_orders = orders,
            Err(err) => snapshot.mark_degraded(StateCategory::Orders, &err.to_string()),
        }
        match positions {
            Ok(positions) => snapshot.positions = positions,
            Err(err) => snapshot.mark_degraded(StateCategory::Positions, &err.to_string()),
        }
        if !snapshot.degraded_categories.is_empty() {
            warn!(
                exchange = %snapshot.exchange_id,
                degraded = ?snapshot.degraded_categories,
                "exchange snapshot degraded"
            );
        }
        snapshot
    }

    async fn fetch<T, F, Fut>(
        &self,
        exchange: &ExchangeId,
        category: StateCategory,
        call: F,
    ) -> ReconcileResult<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, BrokerError>>,
    {
        let mut attempt = 0;
        loop {
            self.limiter.until_ready(exchange).await;
            let result = match timeout(self.call_timeout, call()).await {
                Ok(result) => result,
                Err(_) => Err(BrokerError::Timeout(format!(
                    "{category} call exceeded {:?}",
                    self.call_timeout
                ))),
            };
            match result {
                Ok(value) => {
                    debug!(exchange = %exchange, %category, attempt, "category collected");
                    return Ok(value);
                }
                Err(err) if err.is_transient() && attempt < self.retry.max_retries => {
                    let delay = self.retry.backoff(attempt);
                    attempt += 1;
                    warn!(
                        exchange = %exchange,
                        %category,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient collection failure; retrying"
                    );
                    sleep(delay).await;
                }
                Err(err) => {
                    return Err(ReconcileError::Connectivity {
                        exchange: exchange.clone(),
                        source: err,
                    })
                }
            }
        }
    }
}
