use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tesser_core::{AssetId, Balance, ExchangeId, Order, OrderId, Position, Symbol};

use crate::{LedgerError, LedgerMutation, LedgerResult};

/// Expected state for a single venue.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ExchangeBook {
    pub balances: BTreeMap<AssetId, Balance>,
    /// Every order the ledger still tracks, keyed by exchange order id.
    pub orders: BTreeMap<OrderId, Order>,
    pub positions: BTreeMap<Symbol, Position>,
}

/// Immutable version of the whole ledger.
///
/// Versions are never mutated once published; writers build the next version
/// from a clone of the previous one.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LedgerState {
    pub version: u64,
    /// Last journal sequence folded into this version.
    pub sequence: u64,
    pub committed_at: DateTime<Utc>,
    pub books: BTreeMap<ExchangeId, ExchangeBook>,
}

impl LedgerState {
    pub fn genesis(at: DateTime<Utc>) -> Self {
        Self {
            version: 0,
            sequence: 0,
            committed_at: at,
            books: BTreeMap::new(),
        }
    }

    pub fn book(&self, exchange: &ExchangeId) -> Option<&ExchangeBook> {
        self.books.get(exchange)
    }

    /// Free balance of `asset` summed over every venue.
    pub fn free_balance(&self, asset: &AssetId) -> Decimal {
        self.books
            .values()
            .filter_map(|book| book.balances.get(asset))
            .map(|balance| balance.free)
            .sum()
    }

    pub(crate) fn apply(&mut self, mutation: &LedgerMutation) -> LedgerResult<()> {
        match mutation {
            LedgerMutation::SetBalance {
                exchange,
                asset,
                balance,
            } => {
                validate_balance(asset, balance)?;
                self.book_mut(exchange)
                    .balances
                    .insert(asset.clone(), *balance);
            }
            LedgerMutation::AdjustBalance {
                exchange,
                asset,
                free_delta,
                locked_delta,
            } => {
                let book = self.book_mut(exchange);
                let current = book.balances.get(asset).copied().unwrap_or_default();
                let next = Balance::from_parts(
                    current.free + free_delta,
                    current.locked + locked_delta,
                );
                validate_balance(asset, &next)?;
                book.balances.insert(asset.clone(), next);
            }
            LedgerMutation::UpsertOrder { order } => {
                if order.quantity < Decimal::ZERO || order.filled_quantity > order.quantity {
                    return Err(LedgerError::InvalidState(format!(
                        "order {} has inconsistent quantities (qty={}, filled={})",
                        order.id, order.quantity, order.filled_quantity
                    )));
                }
                self.book_mut(&order.exchange)
                    .orders
                    .insert(order.id.clone(), order.clone());
            }
            LedgerMutation::RemoveOrder { exchange, order_id } => {
                let removed = self
                    .books
                    .get_mut(exchange)
                    .and_then(|book| book.orders.remove(order_id));
                if removed.is_none() {
                    return Err(LedgerError::InvalidState(format!(
                        "order {order_id} is not tracked on {exchange}"
                    )));
                }
            }
            LedgerMutation::SetPosition { position } => {
                if position.quantity < Decimal::ZERO {
                    return Err(LedgerError::InvalidState(format!(
                        "position {} has negative quantity {}",
                        position.symbol, position.quantity
                    )));
                }
                let book = self.book_mut(&position.exchange);
                if position.quantity.is_zero() || position.side.is_none() {
                    book.positions.remove(&position.symbol);
                } else {
                    book.positions
                        .insert(position.symbol.clone(), position.clone());
                }
            }
            LedgerMutation::ClosePosition { exchange, symbol } => {
                if let Some(book) = self.books.get_mut(exchange) {
                    book.positions.remove(symbol);
                }
            }
        }
        Ok(())
    }

    fn book_mut(&mut self, exchange: &ExchangeId) -> &mut ExchangeBook {
        self.books.entry(exchange.clone()).or_default()
    }
}

fn validate_balance(asset: &AssetId, balance: &Balance) -> LedgerResult<()> {
    if balance.free < Decimal::ZERO || balance.locked < Decimal::ZERO {
        return Err(LedgerError::InvalidState(format!(
            "{asset} balance would become negative (free={}, locked={})",
            balance.free, balance.locked
        )));
    }
    if balance.total != balance.free + balance.locked {
        return Err(LedgerError::InvalidState(format!(
            "{asset} total {} does not equal free {} + locked {}",
            balance.total, balance.free, balance.locked
        )));
    }
    Ok(())
}
