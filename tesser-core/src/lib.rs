//! Fundamental data types shared across the entire Tesser workspace.

mod identifiers;

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

pub use identifiers::{AssetId, ExchangeId, IdentifierParseError, Symbol};

/// Alias for price precision.
pub type Price = Decimal;
/// Alias for quantity precision.
pub type Quantity = Decimal;
/// Exchange-assigned order identifier.
pub type OrderId = String;

/// The side of an order or position.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum Side {
    /// Buy the instrument.
    Buy,
    /// Sell the instrument.
    Sell,
}

impl Side {
    /// Returns the opposite side (buy <-> sell).
    #[must_use]
    pub fn inverse(self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }

    /// Convert to `i8` representation used by certain exchanges.
    #[must_use]
    pub fn as_i8(self) -> i8 {
        match self {
            Self::Buy => 1,
            Self::Sell => -1,
        }
    }
}

/// High-level order status maintained inside the framework.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum OrderStatus {
    PendingNew,
    Accepted,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
}

impl OrderStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PendingNew => "pending_new",
            Self::Accepted => "accepted",
            Self::PartiallyFilled => "partially_filled",
            Self::Filled => "filled",
            Self::Canceled => "canceled",
            Self::Rejected => "rejected",
        }
    }

    /// Whether the order can still receive fills.
    #[must_use]
    pub fn is_open(self) -> bool {
        matches!(
            self,
            Self::PendingNew | Self::Accepted | Self::PartiallyFilled
        )
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Balance of a single asset split into its free and locked components.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct Balance {
    pub total: Decimal,
    pub free: Decimal,
    pub locked: Decimal,
}

impl Balance {
    pub fn new(total: Decimal, free: Decimal, locked: Decimal) -> Self {
        Self {
            total,
            free,
            locked,
        }
    }

    /// Fully available balance with nothing reserved by open orders.
    pub fn free(amount: Decimal) -> Self {
        Self::new(amount, amount, Decimal::ZERO)
    }

    /// Build a balance from its components, deriving the total.
    pub fn from_parts(free: Decimal, locked: Decimal) -> Self {
        Self::new(free + locked, free, locked)
    }
}

/// Exchange-side view of an order.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Order {
    pub id: OrderId,
    pub exchange: ExchangeId,
    pub symbol: Symbol,
    pub side: Side,
    pub quantity: Quantity,
    pub price: Option<Price>,
    pub filled_quantity: Quantity,
    pub avg_fill_price: Option<Price>,
    pub status: OrderStatus,
    #[serde(default)]
    pub client_order_id: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    /// Price used to value the order, preferring the realized fill price.
    #[must_use]
    pub fn reference_price(&self) -> Option<Price> {
        self.avg_fill_price.or(self.price)
    }

    /// Quantity still working on the book.
    #[must_use]
    pub fn remaining_quantity(&self) -> Quantity {
        (self.quantity - self.filled_quantity).max(Decimal::ZERO)
    }
}

/// Snapshot of a derivatives or margin position.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Position {
    pub exchange: ExchangeId,
    pub symbol: Symbol,
    pub side: Option<Side>,
    pub quantity: Quantity,
    pub entry_price: Option<Price>,
    #[serde(default)]
    pub mark_price: Option<Price>,
    pub updated_at: DateTime<Utc>,
}

impl Position {
    /// Quantity signed by direction; flat positions report zero.
    #[must_use]
    pub fn signed_quantity(&self) -> Quantity {
        match self.side {
            Some(side) => self.quantity * Decimal::from(side.as_i8()),
            None => Decimal::ZERO,
        }
    }

    /// Price used to value the position, preferring the mark price.
    #[must_use]
    pub fn reference_price(&self) -> Option<Price> {
        self.mark_price.or(self.entry_price)
    }
}

/// The independently collected categories of account state.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize,
)]
#[serde(rename_all = "snake_case")]
pub enum StateCategory {
    Balances,
    Orders,
    Positions,
}

impl StateCategory {
    pub const ALL: [StateCategory; 3] = [Self::Balances, Self::Orders, Self::Positions];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Balances => "balances",
            Self::Orders => "orders",
            Self::Positions => "positions",
        }
    }
}

impl fmt::Display for StateCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StateCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "balances" => Ok(Self::Balances),
            "orders" => Ok(Self::Orders),
            "positions" => Ok(Self::Positions),
            other => Err(format!("unknown state category: {other}")),
        }
    }
}
