use std::num::NonZeroU32;
use std::sync::Arc;

use governor::{DefaultKeyedRateLimiter, Quota};
use tesser_core::ExchangeId;

/// Token bucket shared by every caller hitting the same venue.
///
/// A keyed limiter keeps one bucket per exchange so concurrent sessions
/// against different venues never wait on each other.
#[derive(Clone)]
pub struct RateLimiter {
    inner: Option<Arc<DefaultKeyedRateLimiter<ExchangeId>>>,
}

impl RateLimiter {
    /// Limiter that never waits.
    pub fn unlimited() -> Self {
        Self { inner: None }
    }

    /// One bucket per exchange.
    pub fn keyed(quota: Quota) -> Self {
        Self {
            inner: Some(Arc::new(DefaultKeyedRateLimiter::keyed(quota))),
        }
    }

    /// Per-exchange limiter allowing `per_second` calls, or unlimited when `None`.
    pub fn per_exchange(per_second: Option<NonZeroU32>) -> Self {
        match per_second {
            Some(rate) => Self::keyed(Quota::per_second(rate)),
            None => Self::unlimited(),
        }
    }

    /// Wait until a single call against `exchange` is permitted.
    pub async fn until_ready(&self, exchange: &ExchangeId) {
        if let Some(inner) = &self.inner {
            inner.until_key_ready(exchange).await;
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::unlimited()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nonzero_ext::nonzero;
    use std::time::{Duration, Instant};

    #[tokio::test]
    async fn keyed_limiter_tracks_exchanges_independently() {
        let limiter =
            RateLimiter::keyed(Quota::per_second(nonzero!(10u32)).allow_burst(nonzero!(1u32)));
        let binance = ExchangeId::from("binance");
        let bybit = ExchangeId::from("bybit");

        let started = Instant::now();
        limiter.until_ready(&binance).await;
        limiter.until_ready(&bybit).await;
        assert!(started.elapsed() < Duration::from_millis(50));

        limiter.until_ready(&binance).await;
        assert!(started.elapsed() >= Duration::from_millis(80));
    }

    #[tokio::test]
    async fn unlimited_limiter_never_waits() {
        let limiter = RateLimiter::per_exchange(None);
        let exchange = ExchangeId::from("paper");
        let started = Instant::now();
        for _ in 0..100 {
            limiter.until_ready(&exchange).await;
        }
        assert!(started.elapsed() < Duration::from_millis(50));
    }
}
