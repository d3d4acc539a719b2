use std::collections::HashMap;
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use serde_json::Value;
use tesser_core::ExchangeId;

use crate::{BrokerResult, ExchangeConnector};

static FACTORIES: Lazy<RwLock<HashMap<String, Arc<dyn ConnectorFactory>>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

/// Builds connectors for a named driver (`paper`, `bybit`, ...).
pub trait ConnectorFactory: Send + Sync {
    /// Driver name matched against the `driver` key in configuration.
    fn name(&self) -> &str;

    /// Create a connector for `exchange` from driver specific parameters.
    fn build(&self, exchange: ExchangeId, params: &Value)
        -> BrokerResult<Arc<dyn ExchangeConnector>>;
}

/// Register a factory, replacing any previous factory with the same name.
pub fn register_connector_factory(factory: Arc<dyn ConnectorFactory>) {
    let name = factory.name().to_ascii_lowercase();
    FACTORIES.write().insert(name, factory);
}

/// Look up a previously registered factory.
pub fn get_connector_factory(name: &str) -> Option<Arc<dyn ConnectorFactory>> {
    FACTORIES.read().get(&name.to_ascii_lowercase()).cloned()
}

/// Names of every registered driver, sorted.
pub fn registered_connectors() -> Vec<String> {
    let mut names: Vec<String> = FACTORIES.read().keys().cloned().collect();
    names.sort();
    names
}
