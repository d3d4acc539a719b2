use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use tesser_core::{AssetId, Balance, ExchangeId, Order, OrderId, Position, Symbol};
use uuid::Uuid;

/// A single change to the expected account state.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LedgerMutation {
    /// Overwrite the expected balance of an asset.
    SetBalance {
        exchange: ExchangeId,
        asset: AssetId,
        balance: Balance,
    },
    /// Move the free and locked components by the given deltas.
    AdjustBalance {
        exchange: ExchangeId,
        asset: AssetId,
        free_delta: Decimal,
        #[serde(default)]
        locked_delta: Decimal,
    },
    /// Track a new order or refresh an existing one.
    UpsertOrder { order: Order },
    /// Stop tracking an order.
    RemoveOrder {
        exchange: ExchangeId,
        order_id: OrderId,
    },
    /// Overwrite the expected position for a symbol.
    SetPosition { position: Position },
    /// Flatten a position.
    ClosePosition {
        exchange: ExchangeId,
        symbol: Symbol,
    },
}

impl LedgerMutation {
    /// Venue the mutation applies to.
    pub fn exchange(&self) -> &ExchangeId {
        match self {
            Self::SetBalance { exchange, .. }
            | Self::AdjustBalance { exchange, .. }
            | Self::RemoveOrder { exchange, .. }
            | Self::ClosePosition { exchange, .. } => exchange,
            Self::UpsertOrder { order } => &order.exchange,
            Self::SetPosition { position } => &position.exchange,
        }
    }

    pub fn kind(&self) -> MutationKind {
        match self {
            Self::SetBalance { .. } => MutationKind::SetBalance,
            Self::AdjustBalance { .. } => MutationKind::AdjustBalance,
            Self::UpsertOrder { .. } => MutationKind::UpsertOrder,
            Self::RemoveOrder { .. } => MutationKind::RemoveOrder,
            Self::SetPosition { .. } => MutationKind::SetPosition,
            Self::ClosePosition { .. } => MutationKind::ClosePosition,
        }
    }
}

/// Discriminant of [`LedgerMutation`], stored alongside journal rows for filtering.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum MutationKind {
    SetBalance,
    AdjustBalance,
    UpsertOrder,
    RemoveOrder,
    SetPosition,
    ClosePosition,
}

impl MutationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MutationKind::SetBalance => "set_balance",
            MutationKind::AdjustBalance => "adjust_balance",
            MutationKind::UpsertOrder => "upsert_order",
            MutationKind::RemoveOrder => "remove_order",
            MutationKind::SetPosition => "set_position",
            MutationKind::ClosePosition => "close_position",
        }
    }
}

impl fmt::Display for MutationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Durable record of a committed mutation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JournalRecord {
    pub id: Uuid,
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub reference_id: String,
    pub mutation: LedgerMutation,
}

impl JournalRecord {
    /// Creates a new record with a zero sequence number.
    pub fn new(mutation: LedgerMutation, reference_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            sequence: 0,
            timestamp: Utc::now(),
            reference_id: reference_id.into(),
            mutation,
        }
    }

    /// Assign the monotonic sequence number used for replay.
    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = sequence;
        self
    }
}
