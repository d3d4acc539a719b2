use std::time::Duration;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::{ReconcileError, ReconcileResult, Severity};

/// Comparison tolerances and severity cut-points.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tolerances {
    /// Absolute slack applied to every comparison.
    pub absolute: Decimal,
    /// Slack proportional to the expected magnitude.
    pub relative: Decimal,
    /// Relative divergence at or above which a mismatch is critical.
    pub critical_ratio: Decimal,
}

impl Default for Tolerances {
    fn default() -> Self {
        Self {
            absolute: Decimal::new(1, 6),
            relative: Decimal::new(1, 6),
            critical_ratio: Decimal::new(1, 2),
        }
    }
}

impl Tolerances {
    /// Largest divergence from `expected` that still counts as equal.
    pub fn allowance(&self, expected: Decimal) -> Decimal {
        self.absolute.max(self.relative * expected.abs())
    }

    pub fn within(&self, expected: Decimal, actual: Decimal) -> bool {
        (actual - expected).abs() <= self.allowance(expected)
    }

    /// Severity of a divergence of `delta` from `expected`.
    ///
    /// Anything diverging from an expected zero has unbounded relative
    /// magnitude and is therefore critical.
    pub fn severity_for(&self, expected: Decimal, delta: Decimal) -> Severity {
        if expected.is_zero() {
            return Severity::Critical;
        }
        if delta.abs() / expected.abs() < self.critical_ratio {
            Severity::Warning
        } else {
            Severity::Critical
        }
    }

    pub fn validate(&self) -> ReconcileResult<()> {
        if self.absolute.is_sign_negative() || self.relative.is_sign_negative() {
            return Err(ReconcileError::Configuration(
                "tolerances must not be negative".into(),
            ));
        }
        if self.critical_ratio <= Decimal::ZERO {
            return Err(ReconcileError::Configuration(
                "critical ratio must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Bounded retry with exponential backoff for transient failures.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt` (zero based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// Static configuration shared by every session of an engine.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Default overall deadline for one session.
    pub session_timeout: Duration,
    /// Deadline for a single connector call.
    pub call_timeout: Duration,
    /// Deadline for a single ledger read.
    pub ledger_timeout: Duration,
    /// Deadline for each health probe.
    pub health_timeout: Duration,
    pub retry: RetryPolicy,
    /// Upper bound on exchanges collected at the same time.
    pub max_concurrent_collections: usize,
    pub tolerances: Tolerances,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            session_timeout: Duration::from_secs(30),
            call_timeout: Duration::from_secs(5),
            ledger_timeout: Duration::from_secs(5),
            health_timeout: Duration::from_secs(2),
            retry: RetryPolicy::default(),
            max_concurrent_collections: 8,
            tolerances: Tolerances::default(),
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> ReconcileResult<()> {
        let timeouts = [
            ("session_timeout", self.session_timeout),
            ("call_timeout", self.call_timeout),
            ("ledger_timeout", self.ledger_timeout),
            ("health_timeout", self.health_timeout),
        ];
        for (name, value) in timeouts {
            if value.is_zero() {
                return Err(ReconcileError::Configuration(format!(
                    "{name} must be greater than zero"
                )));
            }
        }
        if self.max_concurrent_collections == 0 {
            return Err(ReconcileError::Configuration(
                "max_concurrent_collections must be at least 1".into(),
            ));
        }
        if self.retry.initial_backoff > self.retry.max_backoff {
            return Err(ReconcileError::Configuration(
                "initial backoff exceeds max backoff".into(),
            ));
        }
        self.tolerances.validate()
    }
}
