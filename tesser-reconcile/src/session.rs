use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tesser_core::ExchangeId;
use uuid::Uuid;

use crate::{sort_discrepancies, Discrepancy, ExchangeSnapshot};

/// Lifecycle state of a reconciliation session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    InProgress,
    Completed,
    Partial,
    Failed,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InProgress => "IN_PROGRESS",
            Self::Completed => "COMPLETED",
            Self::Partial => "PARTIAL",
            Self::Failed => "FAILED",
        }
    }

    pub fn is_final(self) -> bool {
        !matches!(self, Self::InProgress)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How collection went for one configured exchange.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExchangeOutcome {
    Complete,
    Degraded,
    Failed,
}

impl ExchangeOutcome {
    pub fn from_snapshot(snapshot: &ExchangeSnapshot) -> Self {
        if snapshot.is_complete() {
            Self::Complete
        } else if snapshot.is_usable() {
            Self::Degraded
        } else {
            Self::Failed
        }
    }
}

/// One execution of full reconciliation.
///
/// Mutated by the engine while in progress and frozen once wrapped in a
/// [`ReconciliationReport`](crate::ReconciliationReport).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReconciliationSession {
    pub id: Uuid,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub status: SessionStatus,
    /// Exchanges that produced a usable snapshot.
    pub exchanges_checked: BTreeSet<ExchangeId>,
    pub exchange_outcomes: BTreeMap<ExchangeId, ExchangeOutcome>,
    pub discrepancies: Vec<Discrepancy>,
    /// Ledger version compared against, when the ledger could be read.
    pub ledger_version: Option<u64>,
    pub cancelled: bool,
    pub notes: Vec<String>,
}

impl ReconciliationSession {
    pub fn start() -> Self {
        Self::start_at(Utc::now())
    }

    pub fn start_at(start_time: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            start_time,
            end_time: None,
            status: SessionStatus::InProgress,
            exchanges_checked: BTreeSet::new(),
            exchange_outcomes: BTreeMap::new(),
            discrepancies: Vec::new(),
            ledger_version: None,
            cancelled: false,
            notes: Vec::new(),
        }
    }

    /// Record a snapshot's outcome together with the discrepancies found in it.
    pub fn record_exchange(&mut self, snapshot: &ExchangeSnapshot, findings: Vec<Discrepancy>) {
        let outcome = ExchangeOutcome::from_snapshot(snapshot);
        if outcome != ExchangeOutcome::Failed {
            self.exchanges_checked.insert(snapshot.exchange_id.clone());
        }
        self.exchange_outcomes
            .insert(snapshot.exchange_id.clone(), outcome);
        if !findings.is_empty() {
            self.discrepancies.extend(findings);
            sort_discrepancies(&mut self.discrepancies);
        }
    }

    /// Mark an exchange that produced nothing usable.
    pub fn record_failure(&mut self, exchange: &ExchangeId) {
        self.exchanges_checked.remove(exchange);
        self.exchange_outcomes
            .insert(exchange.clone(), ExchangeOutcome::Failed);
    }

    pub fn add_note(&mut self, note: impl Into<String>) {
        self.notes.push(note.into());
    }

    pub fn mark_cancelled(&mut self) {
        if !self.cancelled {
            self.cancelled = true;
            self.add_note("session cancelled before completion");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DiscrepancyType, Severity};
    use tesser_core::StateCategory;

    #[test]
    fn record_exchange_tracks_usable_snapshots() {
        let mut session = ReconciliationSession::start();
        let ok = ExchangeSnapshot::new(ExchangeId::from("a"), Utc::now());
        let mut degraded = ExchangeSnapshot::new(ExchangeId::from("b"), Utc::now());
        degraded.mark_degraded(StateCategory::Positions, "503");
        let down = ExchangeSnapshot::unavailable(ExchangeId::from("c"), Utc::now(), "refused");

        session.record_exchange(&ok, Vec::new());
        session.record_exchange(&degraded, Vec::new());
        session.record_exchange(&down, Vec::new());

        let checked: Vec<_> = session.exchanges_checked.iter().map(|e| e.as_str()).collect();
        assert_eq!(checked, vec!["a", "b"]);
        assert_eq!(
            session.exchange_outcomes[&ExchangeId::from("b")],
            ExchangeOutcome::Degraded
        );
        assert_eq!(
            session.exchange_outcomes[&ExchangeId::from("c")],
            ExchangeOutcome::Failed
        );
    }

    #[test]
    fn discrepancies_stay_sorted_regardless_of_arrival() {
        let mut session = ReconciliationSession::start();
        let at = Utc::now();
        let make = |exchange: &str| {
            Discrepancy::new(
                ExchangeId::from(exchange),
                DiscrepancyType::Connectivity,
                Severity::Critical,
                exchange,
                None,
                None,
                "down",
                at,
            )
        };
        let zeta = ExchangeSnapshot::unavailable(ExchangeId::from("zeta"), at, "down");
        let alpha = ExchangeSnapshot::unavailable(ExchangeId::from("alpha"), at, "down");
        session.record_exchange(&zeta, vec![make("zeta")]);
        session.record_exchange(&alpha, vec![make("alpha")]);
        let order: Vec<_> = session
            .discrepancies
            .iter()
            .map(|d| d.exchange_id.as_str())
            .collect();
        assert_eq!(order, vec!["alpha", "zeta"]);
    }

    #[test]
    fn cancellation_note_is_added_once() {
        let mut session = ReconciliationSession::start();
        session.mark_cancelled();
        session.mark_cancelled();
        assert!(session.cancelled);
        assert_eq!(session.notes.len(), 1);
    }
}
