use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tesser_core::{AssetId, Balance, ExchangeId, Order, Position, StateCategory};
use tesser_ledger::LedgerState;

/// Point-in-time state reported by one exchange.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExchangeSnapshot {
    pub exchange_id: ExchangeId,
    pub captured_at: DateTime<Utc>,
    pub balances: BTreeMap<AssetId, Balance>,
    pub open_orders: Vec<Order>,
    pub positions: Vec<Position>,
    /// Categories that could not be collected.
    pub degraded_categories: BTreeSet<StateCategory>,
    pub collection_error: Option<String>,
}

impl ExchangeSnapshot {
    pub fn new(exchange_id: ExchangeId, captured_at: DateTime<Utc>) -> Self {
        Self {
            exchange_id,
            captured_at,
            balances: BTreeMap::new(),
            open_orders: Vec::new(),
            positions: Vec::new(),
            degraded_categories: BTreeSet::new(),
            collection_error: None,
        }
    }

    /// Snapshot for an exchange that produced nothing at all.
    pub fn unavailable(
        exchange_id: ExchangeId,
        captured_at: DateTime<Utc>,
        error: impl Into<String>,
    ) -> Self {
        let mut snapshot = Self::new(exchange_id, captured_at);
        snapshot.degraded_categories.extend(StateCategory::ALL);
        snapshot.collection_error = Some(error.into());
        snapshot
    }

    /// Flag `category` as missing and fold `error` into the collection error.
    pub fn mark_degraded(&mut self, category: StateCategory, error: &str) {
        self.degraded_categories.insert(category);
        let message = format!("{category}: {error}");
        self.collection_error = Some(match self.collection_error.take() {
            Some(existing) => format!("{existing}; {message}"),
            None => message,
        });
    }

    pub fn is_degraded(&self, category: StateCategory) -> bool {
        self.degraded_categories.contains(&category)
    }

    /// Every category collected without error.
    pub fn is_complete(&self) -> bool {
        self.degraded_categories.is_empty() && self.collection_error.is_none()
    }

    /// At least one category is available for comparison.
    pub fn is_usable(&self) -> bool {
        StateCategory::ALL
            .iter()
            .any(|category| !self.is_degraded(*category))
    }
}

/// Expected state of one exchange as recorded by the ledger.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ExpectedState {
    pub expected_balances: BTreeMap<AssetId, Balance>,
    /// Every order the ledger tracks. Orders in a terminal status are
    /// expected to be absent from the exchange's open orders.
    pub expected_open_orders: Vec<Order>,
    pub expected_positions: Vec<Position>,
}

/// Read-only view of the ledger at a single instant.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    pub captured_at: DateTime<Utc>,
    /// Ledger version the view was taken from.
    pub version: u64,
    /// Commit time of `version`; later than `captured_at` only when older
    /// history was no longer retained.
    pub committed_at: DateTime<Utc>,
    pub exchanges: BTreeMap<ExchangeId, ExpectedState>,
}

impl LedgerSnapshot {
    pub fn new(captured_at: DateTime<Utc>, version: u64) -> Self {
        Self {
            captured_at,
            version,
            committed_at: captured_at,
            exchanges: BTreeMap::new(),
        }
    }

    pub fn from_state(state: &LedgerState, captured_at: DateTime<Utc>) -> Self {
        let exchanges = state
            .books
            .iter()
            .map(|(exchange, book)| {
                let expected = ExpectedState {
                    expected_balances: book.balances.clone(),
                    expected_open_orders: book.orders.values().cloned().collect(),
                    expected_positions: book.positions.values().cloned().collect(),
                };
                (exchange.clone(), expected)
            })
            .collect();
        Self {
            captured_at,
            version: state.version,
            committed_at: state.committed_at,
            exchanges,
        }
    }

    /// The view is newer than the instant it was requested for.
    pub fn is_later_than_requested(&self) -> bool {
        self.committed_at > self.captured_at
    }

    pub fn exchange(&self, exchange: &ExchangeId) -> Option<&ExpectedState> {
        self.exchanges.get(exchange)
    }

    pub fn exchange_mut(&mut self, exchange: &ExchangeId) -> &mut ExpectedState {
        self.exchanges.entry(exchange.clone()).or_default()
    }
}
