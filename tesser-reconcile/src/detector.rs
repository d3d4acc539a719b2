use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tesser_core::{
    AssetId, Balance, ExchangeId, Order, OrderId, Position, Side, StateCategory, Symbol,
};

use crate::{
    sort_discrepancies, Discrepancy, DiscrepancyType, ExchangeSnapshot, ExpectedState,
    LedgerSnapshot, Severity, Tolerances,
};

/// Pure comparison of one exchange snapshot against the ledger.
#[derive(Clone, Debug, Default)]
pub struct DiscrepancyDetector {
    tolerances: Tolerances,
}

impl DiscrepancyDetector {
    pub fn new(tolerances: Tolerances) -> Self {
        Self { tolerances }
    }

    pub fn tolerances(&self) -> &Tolerances {
        &self.tolerances
    }

    /// Compare `actual` against the ledger's expectation for the same exchange.
    ///
    /// The result is sorted by exchange, type and entity key. Identifiers and
    /// timestamps are derived from the inputs, so identical snapshots always
    /// yield identical lists.
    pub fn compare(&self, actual: &ExchangeSnapshot, ledger: &LedgerSnapshot) -> Vec<Discrepancy> {
        let mut findings = Findings::new(&actual.exchange_id, actual.captured_at);
        findings.items.extend(self.connectivity(actual));
        if !actual.is_usable() {
            return findings.finish();
        }

        let empty = ExpectedState::default();
        let expected = ledger.exchange(&actual.exchange_id).unwrap_or(&empty);
        for category in StateCategory::ALL {
            if actual.is_degraded(category) {
                findings.push(
                    DiscrepancyType::DetectionSkipped,
                    Severity::Info,
                    category.as_str(),
                    None,
                    None,
                    format!("{category} comparison skipped: exchange data unavailable"),
                );
                continue;
            }
            match category {
                StateCategory::Balances => self.compare_balances(
                    &expected.expected_balances,
                    &actual.balances,
                    &mut findings,
                ),
                StateCategory::Orders => self.compare_orders(
                    &expected.expected_open_orders,
                    &actual.open_orders,
                    &mut findings,
                ),
                StateCategory::Positions => self.compare_positions(
                    &expected.expected_positions,
                    &actual.positions,
                    &mut findings,
                ),
            }
        }
        findings.finish()
    }

    /// CONNECTIVITY finding for a snapshot that carries a collection error.
    ///
    /// Needs no ledger view, so it also applies when the ledger could not be read.
    pub fn connectivity(&self, actual: &ExchangeSnapshot) -> Option<Discrepancy> {
        let error = actual.collection_error.as_ref()?;
        Some(Discrepancy::new(
            actual.exchange_id.clone(),
            DiscrepancyType::Connectivity,
            Severity::Critical,
            actual.exchange_id.as_str(),
            None,
            Some(error.clone()),
            format!("collection from {} failed: {error}", actual.exchange_id),
            actual.captured_at,
        ))
    }

    fn compare_balances(
        &self,
        expected: &BTreeMap<AssetId, Balance>,
        actual: &BTreeMap<AssetId, Balance>,
        findings: &mut Findings,
    ) {
        let mut malformed = BTreeSet::new();
        for (source, balances) in [(Source::Ledger, expected), (Source::Exchange, actual)] {
            for (asset, balance) in balances {
                if let Some(problem) = self.balance_problem(balance) {
                    findings.integrity(source, StateCategory::Balances, asset.as_str(), problem);
                    malformed.insert(asset.clone());
                }
            }
        }

        let assets: BTreeSet<&AssetId> = expected.keys().chain(actual.keys()).collect();
        for asset in assets {
            if malformed.contains(asset) {
                continue;
            }
            match (expected.get(asset), actual.get(asset)) {
                (Some(expected), Some(actual)) => {
                    if self.tolerances.within(expected.total, actual.total) {
                        continue;
                    }
                    let delta = actual.total - expected.total;
                    findings.push(
                        DiscrepancyType::BalanceMismatch,
                        self.tolerances.severity_for(expected.total, delta),
                        asset.as_str(),
                        Some(expected.total.to_string()),
                        Some(actual.total.to_string()),
                        format!(
                            "{asset} balance differs by {delta} (expected {}, exchange {})",
                            expected.total, actual.total
                        ),
                    );
                }
                (None, Some(actual)) if !actual.total.is_zero() => findings.push(
                    DiscrepancyType::UnexpectedAsset,
                    Severity::Warning,
                    asset.as_str(),
                    None,
                    Some(actual.total.to_string()),
                    format!("exchange holds {} {asset} unknown to the ledger", actual.total),
                ),
                (Some(expected), None) if !expected.total.is_zero() => findings.push(
                    DiscrepancyType::MissingAsset,
                    Severity::Critical,
                    asset.as_str(),
                    Some(expected.total.to_string()),
                    None,
                    format!(
                        "ledger expects {} {asset} but the exchange reports none",
                        expected.total
                    ),
                ),
                _ => {}
            }
        }
    }

    fn balance_problem(&self, balance: &Balance) -> Option<String> {
        if [balance.total, balance.free, balance.locked]
            .iter()
            .any(|value| *value < Decimal::ZERO)
        {
            return Some(format!(
                "negative balance component (total={}, free={}, locked={})",
                balance.total, balance.free, balance.locked
            ));
        }
        let parts = balance.free + balance.locked;
        if !self.tolerances.within(balance.total, parts) {
            return Some(format!(
                "total {} does not equal free {} + locked {}",
                balance.total, balance.free, balance.locked
            ));
        }
        None
    }

    fn compare_orders(&self, expected: &[Order], actual: &[Order], findings: &mut Findings) {
        let expected = index_orders(expected, Source::Ledger, findings);
        let actual = index_orders(actual, Source::Exchange, findings);

        let ids: BTreeSet<&OrderId> = expected.keys().chain(actual.keys()).collect();
        for id in ids {
            match (expected.get(id), actual.get(id)) {
                (Some(IndexedOrder::Malformed), _) | (_, Some(IndexedOrder::Malformed)) => {}
                (Some(IndexedOrder::Valid(expected)), None) => {
                    if !expected.status.is_open() {
                        continue;
                    }
                    findings.push(
                        DiscrepancyType::OrderMissing,
                        Severity::Critical,
                        id.as_str(),
                        Some(expected.status.to_string()),
                        None,
                        format!(
                            "order {id} ({} {} {}) is open in the ledger but not on the exchange",
                            expected.symbol,
                            side_label(expected),
                            expected.quantity
                        ),
                    );
                }
                (None, Some(IndexedOrder::Valid(actual))) => findings.push(
                    DiscrepancyType::OrderUntracked,
                    Severity::Critical,
                    id.as_str(),
                    None,
                    Some(actual.status.to_string()),
                    format!(
                        "order {id} ({} {} {}) is open on the exchange but unknown to the ledger",
                        actual.symbol,
                        side_label(actual),
                        actual.quantity
                    ),
                ),
                (Some(IndexedOrder::Valid(expected)), Some(IndexedOrder::Valid(actual))) => {
                    if expected.status == actual.status {
                        continue;
                    }
                    let price = actual
                        .reference_price()
                        .or_else(|| expected.reference_price())
                        .unwrap_or(Decimal::ONE);
                    let expected_notional = expected.filled_quantity * price;
                    let actual_notional = actual.filled_quantity * price;
                    let severity = if self.tolerances.within(expected_notional, actual_notional) {
                        Severity::Warning
                    } else {
                        Severity::Critical
                    };
                    findings.push(
                        DiscrepancyType::OrderStatusMismatch,
                        severity,
                        id.as_str(),
                        Some(expected.status.to_string()),
                        Some(actual.status.to_string()),
                        format!(
                            "order {id} is {} in the ledger but {} on the exchange (filled {} vs {})",
                            expected.status,
                            actual.status,
                            expected.filled_quantity,
                            actual.filled_quantity
                        ),
                    );
                }
                (None, None) => {}
            }
        }
    }

    fn compare_positions(
        &self,
        expected: &[Position],
        actual: &[Position],
        findings: &mut Findings,
    ) {
        let expected = index_positions(expected, Source::Ledger, findings);
        let actual = index_positions(actual, Source::Exchange, findings);

        let symbols: BTreeSet<&Symbol> = expected.keys().chain(actual.keys()).collect();
        for symbol in symbols {
            let (expected_position, actual_position) =
                match (expected.get(symbol).copied(), actual.get(symbol).copied()) {
                    (Some(None), _) | (_, Some(None)) => continue,
                    (expected, actual) => (expected.flatten(), actual.flatten()),
                };
            // absent positions are flat
            let expected_qty = expected_position
                .map(Position::signed_quantity)
                .unwrap_or(Decimal::ZERO);
            let actual_qty = actual_position
                .map(Position::signed_quantity)
                .unwrap_or(Decimal::ZERO);
            let price = actual_position
                .and_then(Position::reference_price)
                .or_else(|| expected_position.and_then(Position::reference_price))
                .unwrap_or(Decimal::ONE);
            let expected_notional = expected_qty * price;
            let actual_notional = actual_qty * price;
            if self.tolerances.within(expected_notional, actual_notional) {
                continue;
            }
            let description = match (expected_position, actual_position) {
                (Some(_), None) => format!(
                    "ledger holds {expected_qty} {symbol} but the exchange position is flat"
                ),
                (None, Some(_)) => format!(
                    "exchange holds {actual_qty} {symbol} the ledger does not track"
                ),
                _ => format!(
                    "{symbol} position differs (expected {expected_qty}, exchange {actual_qty})"
                ),
            };
            findings.push(
                DiscrepancyType::PositionMismatch,
                self.tolerances
                    .severity_for(expected_notional, actual_notional - expected_notional),
                symbol.as_str(),
                Some(expected_qty.to_string()),
                Some(actual_qty.to_string()),
                description,
            );
        }
    }
}

#[derive(Clone, Copy)]
enum Source {
    Ledger,
    Exchange,
}

impl Source {
    fn as_str(self) -> &'static str {
        match self {
            Self::Ledger => "ledger",
            Self::Exchange => "exchange",
        }
    }
}

enum IndexedOrder<'a> {
    Valid(&'a Order),
    Malformed,
}

fn index_orders<'a>(
    orders: &'a [Order],
    source: Source,
    findings: &mut Findings,
) -> BTreeMap<OrderId, IndexedOrder<'a>> {
    let mut index = BTreeMap::new();
    for order in orders {
        let problem = if order.quantity < Decimal::ZERO {
            Some(format!("negative order quantity {}", order.quantity))
        } else if order.filled_quantity > order.quantity {
            Some(format!(
                "filled quantity {} exceeds order quantity {}",
                order.filled_quantity, order.quantity
            ))
        } else if index.contains_key(&order.id) {
            Some("order id reported more than once".to_string())
        } else {
            None
        };
        match problem {
            Some(problem) => {
                findings.integrity(source, StateCategory::Orders, &order.id, problem);
                index.insert(order.id.clone(), IndexedOrder::Malformed);
            }
            None => {
                index.insert(order.id.clone(), IndexedOrder::Valid(order));
            }
        }
    }
    index
}

/// `None` values mark symbols excluded by an integrity failure.
fn index_positions<'a>(
    positions: &'a [Position],
    source: Source,
    findings: &mut Findings,
) -> BTreeMap<Symbol, Option<&'a Position>> {
    let mut index = BTreeMap::new();
    for position in positions {
        let problem = if position.quantity < Decimal::ZERO {
            Some(format!("negative position quantity {}", position.quantity))
        } else if position.side.is_none() && !position.quantity.is_zero() {
            Some(format!(
                "position quantity {} has no side",
                position.quantity
            ))
        } else if index.contains_key(&position.symbol) {
            Some("symbol reported more than once".to_string())
        } else {
            None
        };
        match problem {
            Some(problem) => {
                findings.integrity(
                    source,
                    StateCategory::Positions,
                    position.symbol.as_str(),
                    problem,
                );
                index.insert(position.symbol.clone(), None);
            }
            None => {
                index.insert(position.symbol.clone(), Some(position));
            }
        }
    }
    index
}

fn side_label(order: &Order) -> &'static str {
    match order.side {
        Side::Buy => "buy",
        Side::Sell => "sell",
    }
}

/// Accumulates discrepancies for one exchange.
struct Findings {
    exchange: ExchangeId,
    detected_at: DateTime<Utc>,
    items: Vec<Discrepancy>,
}

impl Findings {
    fn new(exchange: &ExchangeId, detected_at: DateTime<Utc>) -> Self {
        Self {
            exchange: exchange.clone(),
            detected_at,
            items: Vec::new(),
        }
    }

    fn push(
        &mut self,
        kind: DiscrepancyType,
        severity: Severity,
        entity_key: &str,
        expected: Option<String>,
        actual: Option<String>,
        description: String,
    ) {
        debug_assert!(kind.fixed_severity().map_or(true, |fixed| fixed == severity));
        self.items.push(Discrepancy::new(
            self.exchange.clone(),
            kind,
            severity,
            entity_key,
            expected,
            actual,
            description,
            self.detected_at,
        ));
    }

    fn integrity(&mut self, source: Source, category: StateCategory, key: &str, problem: String) {
        let entity_key = format!("{}:{category}:{key}", source.as_str());
        let description = format!("malformed {} record {key}: {problem}", source.as_str());
        self.push(
            DiscrepancyType::DataIntegrity,
            Severity::Critical,
            &entity_key,
            None,
            None,
            description,
        );
    }

    fn finish(mut self) -> Vec<Discrepancy> {
        sort_discrepancies(&mut self.items);
        self.items
    }
}
