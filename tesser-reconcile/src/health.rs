use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tesser_core::ExchangeId;

/// Result of probing one capability.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "detail", rename_all = "snake_case")]
pub enum ProbeOutcome {
    Ready,
    /// The probe answered but reported the capability unavailable.
    NotReady(String),
    /// The probe itself failed.
    Unreachable(String),
    TimedOut,
}

impl ProbeOutcome {
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready)
    }
}

/// Outcome of [`StateReconciliationEngine::health_check`](crate::StateReconciliationEngine::health_check).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthStatus {
    pub engine_ready: bool,
    pub ledger_ready: bool,
    pub exchange_connected: BTreeMap<ExchangeId, bool>,
    /// Raw probe outcomes for diagnostics.
    pub probes: HealthProbes,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthProbes {
    pub config: ProbeOutcome,
    pub ledger: ProbeOutcome,
    pub exchanges: BTreeMap<ExchangeId, ProbeOutcome>,
}

/// Combine individual probes into the engine's readiness verdict.
///
/// The engine is ready when its configuration is valid, the ledger is ready
/// and at least one exchange is connected.
pub fn aggregate_health(probes: HealthProbes) -> HealthStatus {
    let exchange_connected: BTreeMap<ExchangeId, bool> = probes
        .exchanges
        .iter()
        .map(|(exchange, outcome)| (exchange.clone(), outcome.is_ready()))
        .collect();
    let ledger_ready = probes.ledger.is_ready();
    let engine_ready = probes.config.is_ready()
        && ledger_ready
        && exchange_connected.values().any(|connected| *connected);
    HealthStatus {
        engine_ready,
        ledger_ready,
        exchange_connected,
        probes,
    }
}
