use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tesser_core::ExchangeId;
use uuid::Uuid;

/// Namespace for content-derived discrepancy identifiers.
const DISCREPANCY_NAMESPACE: Uuid = Uuid::from_u128(0x5f1c_7a2e_8d44_4b9a_b1e3_0c6f_2a9d_7e51);

/// Ordinal risk classification.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Info => "INFO",
            Self::Warning => "WARNING",
            Self::Critical => "CRITICAL",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Every kind of divergence the detector reports.
///
/// Declaration order is the secondary sort key of a report.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DiscrepancyType {
    BalanceMismatch,
    UnexpectedAsset,
    MissingAsset,
    OrderMissing,
    OrderUntracked,
    OrderStatusMismatch,
    PositionMismatch,
    Connectivity,
    DetectionSkipped,
    DataIntegrity,
}

impl DiscrepancyType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::BalanceMismatch => "BALANCE_MISMATCH",
            Self::UnexpectedAsset => "UNEXPECTED_ASSET",
            Self::MissingAsset => "MISSING_ASSET",
            Self::OrderMissing => "ORDER_MISSING",
            Self::OrderUntracked => "ORDER_UNTRACKED",
            Self::OrderStatusMismatch => "ORDER_STATUS_MISMATCH",
            Self::PositionMismatch => "POSITION_MISMATCH",
            Self::Connectivity => "CONNECTIVITY",
            Self::DetectionSkipped => "DETECTION_SKIPPED",
            Self::DataIntegrity => "DATA_INTEGRITY",
        }
    }

    /// Severity for types whose risk does not depend on magnitude.
    ///
    /// Returns `None` for types graded by the size of the divergence.
    pub fn fixed_severity(self) -> Option<Severity> {
        match self {
            Self::UnexpectedAsset => Some(Severity::Warning),
            Self::MissingAsset
            | Self::OrderMissing
            | Self::OrderUntracked
            | Self::Connectivity
            | Self::DataIntegrity => Some(Severity::Critical),
            Self::DetectionSkipped => Some(Severity::Info),
            Self::BalanceMismatch | Self::OrderStatusMismatch | Self::PositionMismatch => None,
        }
    }
}

impl fmt::Display for DiscrepancyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single divergence between ledger-expected and exchange-reported state.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Discrepancy {
    pub id: Uuid,
    pub exchange_id: ExchangeId,
    #[serde(rename = "type")]
    pub discrepancy_type: DiscrepancyType,
    pub severity: Severity,
    /// Asset, order id, symbol or category the divergence concerns.
    pub entity_key: String,
    pub expected_value: Option<String>,
    pub actual_value: Option<String>,
    pub description: String,
    pub detected_at: DateTime<Utc>,
}

impl Discrepancy {
    /// Build a discrepancy whose id is derived from its content.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        exchange_id: ExchangeId,
        discrepancy_type: DiscrepancyType,
        severity: Severity,
        entity_key: impl Into<String>,
        expected_value: Option<String>,
        actual_value: Option<String>,
        description: impl Into<String>,
        detected_at: DateTime<Utc>,
    ) -> Self {
        let entity_key = entity_key.into();
        let fingerprint = format!(
            "{}|{}|{}|{}|{}|{}",
            exchange_id,
            discrepancy_type,
            entity_key,
            expected_value.as_deref().unwrap_or("-"),
            actual_value.as_deref().unwrap_or("-"),
            detected_at.to_rfc3339(),
        );
        Self {
            id: Uuid::new_v5(&DISCREPANCY_NAMESPACE, fingerprint.as_bytes()),
            exchange_id,
            discrepancy_type,
            severity,
            entity_key,
            expected_value,
            actual_value,
            description: description.into(),
            detected_at,
        }
    }

    pub fn is_critical(&self) -> bool {
        self.severity == Severity::Critical
    }

    /// Report ordering: exchange, then type, then entity.
    pub fn sort_key(&self) -> (&ExchangeId, DiscrepancyType, &str, Uuid) {
        (
            &self.exchange_id,
            self.discrepancy_type,
            self.entity_key.as_str(),
            self.id,
        )
    }
}

/// Sort discrepancies into report order.
pub fn sort_discrepancies(discrepancies: &mut [Discrepancy]) {
    discrepancies.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
}
