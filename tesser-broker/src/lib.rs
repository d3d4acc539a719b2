//! Exchange-agnostic traits used by the rest of the framework.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tesser_core::{AssetId, Balance, ExchangeId, Order, Position};
use thiserror::Error;

pub mod limiter;

pub use governor::Quota;
pub use limiter::RateLimiter;

/// Convenience alias for broker results.
pub type BrokerResult<T> = Result<T, BrokerError>;

/// Common error type returned by connector implementations.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum BrokerError {
    /// Represents transport-level failures (network, connection resets, etc.).
    #[error("transport error: {0}")]
    Transport(String),
    /// The exchange did not answer within the allotted time.
    #[error("request timed out: {0}")]
    Timeout(String),
    /// The exchange throttled the request.
    #[error("rate limited: {0}")]
    RateLimited(String),
    /// Returned when authentication fails or credentials are missing.
    #[error("authentication failed: {0}")]
    Authentication(String),
    /// Wraps serialization or parsing errors.
    #[error("serialization error: {0}")]
    Serialization(String),
    /// Exchange responded with a business error.
    #[error("exchange error: {0}")]
    Exchange(String),
    /// A catch-all branch for other issues.
    #[error("unexpected error: {0}")]
    Other(String),
}

impl BrokerError {
    /// Transient failures are worth retrying; everything else degrades immediately.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Transport(_) | Self::Timeout(_) | Self::RateLimited(_)
        )
    }
}

/// Represents metadata describing the capabilities of a connector.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BrokerInfo {
    pub name: String,
    pub exchange: ExchangeId,
    /// Spot-only venues have no position endpoint.
    pub supports_positions: bool,
}

/// Liveness report returned by [`ExchangeConnector::health_check`].
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectorHealth {
    pub healthy: bool,
    pub connected: bool,
    pub last_heartbeat: Option<DateTime<Utc>>,
}

/// Read-only account interface the reconciliation engine consumes.
#[async_trait]
pub trait ExchangeConnector: Send + Sync {
    /// Return metadata about the connector for telemetry.
    fn info(&self) -> BrokerInfo;

    /// Venue this connector talks to.
    fn exchange(&self) -> ExchangeId {
        self.info().exchange
    }

    /// Retrieve the latest balances keyed by asset.
    async fn account_balances(&self) -> BrokerResult<BTreeMap<AssetId, Balance>>;

    /// Retrieve every order the exchange still considers open.
    async fn open_orders(&self) -> BrokerResult<Vec<Order>>;

    /// Retrieve the current open positions.
    async fn positions(&self) -> BrokerResult<Vec<Position>>;

    /// Probe connectivity without touching account state.
    async fn health_check(&self) -> BrokerResult<ConnectorHealth>;
}

mod connector;
pub use connector::{
    get_connector_factory, register_connector_factory, registered_connectors, ConnectorFactory,
};
