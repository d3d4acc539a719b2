//! In-memory exchange connector used for dry runs and tests.
//!
//! Account state is set directly or loaded from a JSON [`PaperFixture`]; calls
//! can be slowed down, failed per category or cut off entirely to exercise
//! degraded collection paths.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tesser_broker::{
    register_connector_factory, BrokerError, BrokerInfo, BrokerResult, ConnectorFactory,
    ConnectorHealth, ExchangeConnector,
};
use tesser_core::{AssetId, Balance, ExchangeId, Order, OrderId, Position, StateCategory, Symbol};
use tokio::time::{sleep, Instant};
use tracing::debug;

/// Account state loadable from disk.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct PaperFixture {
    #[serde(default)]
    pub balances: BTreeMap<AssetId, Balance>,
    #[serde(default)]
    pub orders: Vec<Order>,
    #[serde(default)]
    pub positions: Vec<Position>,
}

impl PaperFixture {
    pub fn load(path: impl AsRef<Path>) -> BrokerResult<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|err| {
            BrokerError::Other(format!("failed to read fixture {}: {err}", path.display()))
        })?;
        serde_json::from_str(&raw).map_err(|err| {
            BrokerError::Serialization(format!("invalid fixture {}: {err}", path.display()))
        })
    }
}

/// Driver parameters accepted by [`PaperFactory`].
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct PaperConnectorConfig {
    #[serde(default)]
    pub fixture: Option<PathBuf>,
    #[serde(default)]
    pub latency_ms: u64,
    #[serde(default = "default_supports_positions")]
    pub supports_positions: bool,
}

impl Default for PaperConnectorConfig {
    fn default() -> Self {
        Self {
            fixture: None,
            latency_ms: 0,
            supports_positions: default_supports_positions(),
        }
    }
}

fn default_supports_positions() -> bool {
    true
}

#[derive(Default)]
struct PaperAccount {
    balances: BTreeMap<AssetId, Balance>,
    orders: BTreeMap<OrderId, Order>,
    positions: BTreeMap<Symbol, Position>,
}

/// Injected failure for one category.
#[derive(Clone, Debug)]
struct PaperFault {
    error: BrokerError,
    /// `None` fails forever.
    remaining: Option<u32>,
}

#[derive(Default)]
struct FaultPlan {
    latency: Duration,
    category_latency: HashMap<StateCategory, Duration>,
    failures: HashMap<StateCategory, PaperFault>,
}

/// In-memory [`ExchangeConnector`].
pub struct PaperConnector {
    exchange: ExchangeId,
    supports_positions: bool,
    account: RwLock<PaperAccount>,
    faults: Mutex<FaultPlan>,
    connected: AtomicBool,
    calls: Mutex<Vec<(StateCategory, Instant)>>,
}

impl PaperConnector {
    pub fn new(exchange: impl Into<ExchangeId>) -> Self {
        Self {
            exchange: exchange.into(),
            supports_positions: true,
            account: RwLock::new(PaperAccount::default()),
            faults: Mutex::new(FaultPlan::default()),
            connected: AtomicBool::new(true),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn from_config(exchange: ExchangeId, config: &PaperConnectorConfig) -> BrokerResult<Self> {
        let mut connector = Self::new(exchange);
        connector.supports_positions = config.supports_positions;
        if let Some(path) = &config.fixture {
            connector.load_fixture(PaperFixture::load(path)?);
        }
        connector.set_latency(Duration::from_millis(config.latency_ms));
        Ok(connector)
    }

    /// Spot-style venue without a position endpoint.
    pub fn without_positions(mut self) -> Self {
        self.supports_positions = false;
        self
    }

    pub fn load_fixture(&self, fixture: PaperFixture) {
        let mut account = self.account.write();
        account.balances = fixture.balances;
        account.orders = fixture
            .orders
            .into_iter()
            .map(|order| (order.id.clone(), order))
            .collect();
        account.positions = fixture
            .positions
            .into_iter()
            .map(|position| (position.symbol.clone(), position))
            .collect();
    }

    pub fn set_balance(&self, asset: impl Into<AssetId>, balance: Balance) {
        self.account.write().balances.insert(asset.into(), balance);
    }

    pub fn upsert_order(&self, order: Order) {
        self.account.write().orders.insert(order.id.clone(), order);
    }

    pub fn remove_order(&self, order_id: &str) -> Option<Order> {
        self.account.write().orders.remove(order_id)
    }

    pub fn set_position(&self, position: Position) {
        self.account
            .write()
            .positions
            .insert(position.symbol.clone(), position);
    }

    /// Delay applied to every call.
    pub fn set_latency(&self, latency: Duration) {
        self.faults.lock().latency = latency;
    }

    /// Extra delay for one category, on top of the base latency.
    pub fn set_category_latency(&self, category: StateCategory, latency: Duration) {
        self.faults.lock().category_latency.insert(category, latency);
    }

    /// Fail every call for `category` with `error`.
    pub fn fail_category(&self, category: StateCategory, error: BrokerError) {
        self.faults.lock().failures.insert(
            category,
            PaperFault {
                error,
                remaining: None,
            },
        );
    }

    /// Fail the next `times` calls for `category`, then recover.
    pub fn fail_category_times(&self, category: StateCategory, error: BrokerError, times: u32) {
        self.faults.lock().failures.insert(
            category,
            PaperFault {
                error,
                remaining: Some(times),
            },
        );
    }

    pub fn clear_faults(&self) {
        let mut faults = self.faults.lock();
        faults.failures.clear();
        faults.category_latency.clear();
        faults.latency = Duration::ZERO;
    }

    /// Simulate a dropped connection; every call fails with a transport error.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub fn call_count(&self, category: StateCategory) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|(called, _)| *called == category)
            .count()
    }

    /// Instants at which calls for `category` reached the connector.
    pub fn call_times(&self, category: StateCategory) -> Vec<Instant> {
        self.calls
            .lock()
            .iter()
            .filter(|(called, _)| *called == category)
            .map(|(_, at)| *at)
            .collect()
    }

    async fn enter(&self, category: StateCategory) -> BrokerResult<()> {
        self.calls.lock().push((category, Instant::now()));
        let (delay, fault) = {
            let mut faults = self.faults.lock();
            let delay = faults.latency
                + faults
                    .category_latency
                    .get(&category)
                    .copied()
                    .unwrap_or_default();
            let fault = match faults.failures.get_mut(&category) {
                Some(fault) => match fault.remaining {
                    None => Some(fault.error.clone()),
                    Some(0) => None,
                    Some(ref mut remaining) => {
                        *remaining -= 1;
                        Some(fault.error.clone())
                    }
                },
                None => None,
            };
            (delay, fault)
        };
        if !delay.is_zero() {
            sleep(delay).await;
        }
        if !self.connected.load(Ordering::SeqCst) {
            return Err(BrokerError::Transport(format!(
                "{} paper exchange disconnected",
                self.exchange
            )));
        }
        match fault {
            Some(error) => {
                debug!(exchange = %self.exchange, %category, error = %error, "injected failure");
                Err(error)
            }
            None => Ok(()),
        }
    }
}

#[async_trait]
impl ExchangeConnector for PaperConnector {
    fn info(&self) -> BrokerInfo {
        BrokerInfo {
            name: "paper".into(),
            exchange: self.exchange.clone(),
            supports_positions: self.supports_positions,
        }
    }

    async fn account_balances(&self) -> BrokerResult<BTreeMap<AssetId, Balance>> {
        self.enter(StateCategory::Balances).await?;
        Ok(self.account.read().balances.clone())
    }

    async fn open_orders(&self) -> BrokerResult<Vec<Order>> {
        self.enter(StateCategory::Orders).await?;
        Ok(self
            .account
            .read()
            .orders
            .values()
            .filter(|order| order.status.is_open())
            .cloned()
            .collect())
    }

    async fn positions(&self) -> BrokerResult<Vec<Position>> {
        self.enter(StateCategory::Positions).await?;
        Ok(self.account.read().positions.values().cloned().collect())
    }

    async fn health_check(&self) -> BrokerResult<ConnectorHealth> {
        let connected = self.connected.load(Ordering::SeqCst);
        Ok(ConnectorHealth {
            healthy: connected,
            connected,
            last_heartbeat: connected.then(Utc::now),
        })
    }
}

/// Factory for the `paper` driver.
#[derive(Default)]
pub struct PaperFactory;

impl ConnectorFactory for PaperFactory {
    fn name(&self) -> &str {
        "paper"
    }

    fn build(
        &self,
        exchange: ExchangeId,
        params: &Value,
    ) -> BrokerResult<Arc<dyn ExchangeConnector>> {
        let config: PaperConnectorConfig = if params.is_null() {
            PaperConnectorConfig::default()
        } else {
            serde_json::from_value(params.clone()).map_err(|err| {
                BrokerError::Serialization(format!("invalid paper connector config: {err}"))
            })?
        };
        Ok(Arc::new(PaperConnector::from_config(exchange, &config)?))
    }
}

pub fn register_factory() {
    register_connector_factory(Arc::new(PaperFactory));
}
