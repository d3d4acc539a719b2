use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use tesser_core::AssetId;

use crate::{
    JournalQuery, JournalRecord, JournalRepository, LedgerError, LedgerHealth, LedgerMutation,
    LedgerResult, LedgerSource, LedgerState,
};

const DEFAULT_HISTORY_LIMIT: usize = 256;

/// Tuning knobs for [`LedgerBook`].
#[derive(Clone, Debug)]
pub struct LedgerBookConfig {
    /// Asset whose free balance is reported as available capital.
    pub capital_asset: AssetId,
    /// Number of published versions retained for point-in-time reads.
    ///
    /// Once older versions are dropped, a read for an instant before the
    /// oldest retained version gets that oldest version instead.
    pub history_limit: usize,
}

impl Default for LedgerBookConfig {
    fn default() -> Self {
        Self {
            capital_asset: AssetId::from("USDT"),
            history_limit: DEFAULT_HISTORY_LIMIT,
        }
    }
}

/// Versioned, in-process ledger of expected balances, orders and positions.
///
/// Writers serialize on an internal mutex, build the next version off to the
/// side and publish it with a pointer push. Readers only clone an `Arc`, so a
/// reconciliation read never waits on bookkeeping work and never sees a
/// half-applied batch.
pub struct LedgerBook {
    config: LedgerBookConfig,
    versions: RwLock<VecDeque<Arc<LedgerState>>>,
    /// Last assigned journal sequence; held for the whole commit.
    writer: Mutex<u64>,
    journal: Option<Arc<dyn JournalRepository>>,
    running: AtomicBool,
    /// Set once a version has been dropped from history.
    pruned: AtomicBool,
}

impl LedgerBook {
    pub fn new(config: LedgerBookConfig) -> Self {
        Self::from_state(config, LedgerState::genesis(Utc::now()), None)
    }

    /// Rebuild the ledger from a durable journal and keep appending to it.
    pub fn replay(
        config: LedgerBookConfig,
        journal: Arc<dyn JournalRepository>,
    ) -> LedgerResult<Self> {
        let records = journal.query(JournalQuery::default())?;
        let mut state = LedgerState::genesis(Utc::now());
        if let Some(last) = records.last() {
            for record in &records {
                state.apply(&record.mutation).map_err(|err| {
                    LedgerError::InvalidState(format!(
                        "journal record {} failed to replay: {err}",
                        record.sequence
                    ))
                })?;
            }
            state.version = 1;
            state.sequence = last.sequence;
            state.committed_at = last.timestamp;
        }
        let last_sequence = journal.latest_sequence()?.unwrap_or(0);
        let book = Self::from_state(config, state, Some(journal));
        *book.writer.lock() = last_sequence;
        Ok(book)
    }

    fn from_state(
        config: LedgerBookConfig,
        state: LedgerState,
        journal: Option<Arc<dyn JournalRepository>>,
    ) -> Self {
        let mut versions = VecDeque::new();
        versions.push_back(Arc::new(state));
        Self {
            config,
            versions: RwLock::new(versions),
            writer: Mutex::new(0),
            journal,
            running: AtomicBool::new(true),
            pruned: AtomicBool::new(false),
        }
    }

    /// Most recently published version.
    pub fn latest(&self) -> Arc<LedgerState> {
        self.versions
            .read()
            .back()
            .cloned()
            .expect("ledger always retains at least one version")
    }

    /// Newest retained version committed at or before `as_of`.
    ///
    /// When history has been pruned past `as_of`, the oldest retained version
    /// is returned; its `committed_at` is then later than `as_of`.
    pub fn view_at(&self, as_of: DateTime<Utc>) -> LedgerResult<Arc<LedgerState>> {
        let versions = self.versions.read();
        if let Some(state) = versions
            .iter()
            .rev()
            .find(|state| state.committed_at <= as_of)
        {
            return Ok(state.clone());
        }
        match versions.front() {
            Some(oldest) if self.pruned.load(Ordering::SeqCst) => Ok(oldest.clone()),
            _ => Err(LedgerError::VersionUnavailable(as_of.to_rfc3339())),
        }
    }

    /// Apply a batch atomically and publish it as a new version.
    ///
    /// Either every mutation applies and the batch is journaled, or nothing
    /// changes.
    pub fn commit(
        &self,
        mutations: Vec<LedgerMutation>,
        reference_id: &str,
    ) -> LedgerResult<Arc<LedgerState>> {
        if !self.is_running() {
            return Err(LedgerError::NotRunning);
        }
        if mutations.is_empty() {
            return Ok(self.latest());
        }
        let mut sequence = self.writer.lock();
        let base = self.latest();
        let mut next = LedgerState::clone(&base);
        for mutation in &mutations {
            next.apply(mutation)?;
        }

        let committed_at = Utc::now().max(base.committed_at);
        let first = *sequence + 1;
        let records: Vec<JournalRecord> = mutations
            .into_iter()
            .enumerate()
            .map(|(offset, mutation)| {
                let mut record =
                    JournalRecord::new(mutation, reference_id).with_sequence(first + offset as u64);
                record.timestamp = committed_at;
                record
            })
            .collect();
        if let Some(journal) = &self.journal {
            journal.append_batch(&records)?;
        }
        *sequence += records.len() as u64;

        next.version = base.version + 1;
        next.sequence = *sequence;
        next.committed_at = committed_at;
        let next = Arc::new(next);
        let mut versions = self.versions.write();
        versions.push_back(next.clone());
        let limit = self.config.history_limit.max(1);
        while versions.len() > limit {
            versions.pop_front();
            self.pruned.store(true, Ordering::SeqCst);
        }
        Ok(next)
    }

    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Free balance of the configured capital asset across venues.
    pub fn available_capital(&self) -> Decimal {
        self.latest().free_balance(&self.config.capital_asset)
    }
}

#[async_trait]
impl LedgerSource for LedgerBook {
    async fn health_check(&self) -> LedgerResult<LedgerHealth> {
        let healthy = match &self.journal {
            Some(journal) => journal.latest_sequence().is_ok(),
            None => true,
        };
        Ok(LedgerHealth {
            healthy,
            running: self.is_running(),
            available_capital: self.available_capital(),
        })
    }

    async fn view_as_of(&self, as_of: DateTime<Utc>) -> LedgerResult<Arc<LedgerState>> {
        self.view_at(as_of)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SqliteJournal;
    use rust_decimal_macros::dec;
    use std::thread;
    use tempfile::tempdir;
    use tesser_core::{Balance, ExchangeId};

    fn set_balance(asset: &str, amount: Decimal) -> LedgerMutation {
        LedgerMutation::SetBalance {
            exchange: ExchangeId::from("paper"),
            asset: AssetId::from(asset),
            balance: Balance::free(amount),
        }
    }

    fn adjust(asset: &str, delta: Decimal) -> LedgerMutation {
        LedgerMutation::AdjustBalance {
            exchange: ExchangeId::from("paper"),
            asset: AssetId::from(asset),
            free_delta: delta,
            locked_delta: Decimal::ZERO,
        }
    }

    fn free_of(state: &LedgerState, asset: &str) -> Decimal {
        state.free_balance(&AssetId::from(asset))
    }

    #[test]
    fn published_versions_are_immutable() {
        let book = LedgerBook::new(LedgerBookConfig::default());
        let first = book.commit(vec![set_balance("USDT", dec!(100))], "seed").unwrap();
        let second = book.commit(vec![adjust("USDT", dec!(-40))], "trade").unwrap();
        assert_eq!(free_of(&first, "USDT"), dec!(100));
        assert_eq!(free_of(&second, "USDT"), dec!(60));
        assert_eq!(second.version, first.version + 1);
        assert!(second.committed_at >= first.committed_at);
    }

    #[test]
    fn invalid_batch_leaves_ledger_untouched() {
        let book = LedgerBook::new(LedgerBookConfig::default());
        book.commit(vec![set_balance("USDT", dec!(10))], "seed")
            .unwrap();
        let err = book
            .commit(
                vec![adjust("BTC", dec!(1)), adjust("USDT", dec!(-11))],
                "overdraw",
            )
            .unwrap_err();
        assert!(matches!(err, LedgerError::InvalidState(_)));
        let latest = book.latest();
        assert_eq!(free_of(&latest, "USDT"), dec!(10));
        assert_eq!(free_of(&latest, "BTC"), Decimal::ZERO);
    }

    #[test]
    fn view_at_rejects_instants_before_history() {
        let book = LedgerBook::new(LedgerBookConfig::default());
        let before = book.latest().committed_at - chrono::Duration::seconds(5);
        assert!(matches!(
            book.view_at(before),
            Err(LedgerError::VersionUnavailable(_))
        ));
    }

    #[test]
    fn history_is_bounded() {
        let book = LedgerBook::new(LedgerBookConfig {
            history_limit: 3,
            ..LedgerBookConfig::default()
        });
        for _ in 0..10 {
            book.commit(vec![adjust("USDT", dec!(1))], "deposit").unwrap();
        }
        assert_eq!(book.versions.read().len(), 3);
        assert_eq!(book.latest().version, 10);
    }

    #[test]
    fn pruned_history_serves_oldest_retained_version() {
        let book = LedgerBook::new(LedgerBookConfig {
            history_limit: 2,
            ..LedgerBookConfig::default()
        });
        let session_start = book.latest().committed_at;
        thread::sleep(std::time::Duration::from_millis(5));
        for _ in 0..4 {
            book.commit(vec![adjust("USDT", dec!(1))], "deposit").unwrap();
        }

        let view = book.view_at(session_start).unwrap();
        assert_eq!(view.version, 3);
        assert!(view.committed_at > session_start);
        assert_eq!(free_of(&view, "USDT"), dec!(3));
    }

    #[test]
    fn stopped_ledger_rejects_writes() {
        let book = LedgerBook::new(LedgerBookConfig::default());
        book.set_running(false);
        assert!(matches!(
            book.commit(vec![set_balance("USDT", dec!(1))], "seed"),
            Err(LedgerError::NotRunning)
        ));
    }

    #[test]
    fn readers_never_observe_torn_batches() {
        let book = Arc::new(LedgerBook::new(LedgerBookConfig::default()));
        book.commit(
            vec![set_balance("USDT", dec!(1000)), set_balance("USDC", dec!(0))],
            "seed",
        )
        .unwrap();
        let writer = {
            let book = book.clone();
            thread::spawn(move || {
                for _ in 0..500 {
                    book.commit(
                        vec![adjust("USDT", dec!(-1)), adjust("USDC", dec!(1))],
                        "transfer",
                    )
                    .unwrap();
                }
            })
        };
        for _ in 0..2_000 {
            let view = book.latest();
            assert_eq!(free_of(&view, "USDT") + free_of(&view, "USDC"), dec!(1000));
        }
        writer.join().unwrap();
        assert_eq!(free_of(&book.latest(), "USDC"), dec!(500));
    }

    #[test]
    fn replay_restores_state_and_sequence() {
        let dir = tempdir().unwrap();
        let journal: Arc<dyn JournalRepository> =
            Arc::new(SqliteJournal::new(dir.path().join("ledger.db")).unwrap());
        {
            let book = LedgerBook::replay(LedgerBookConfig::default(), journal.clone()).unwrap();
            book.commit(vec![set_balance("USDT", dec!(250))], "seed")
                .unwrap();
            book.commit(vec![adjust("USDT", dec!(-50))], "fee").unwrap();
        }
        let restored = LedgerBook::replay(LedgerBookConfig::default(), journal.clone()).unwrap();
        assert_eq!(restored.available_capital(), dec!(200));
        let next = restored
            .commit(vec![adjust("USDT", dec!(5))], "rebate")
            .unwrap();
        assert_eq!(next.sequence, 3);
        assert_eq!(journal.latest_sequence().unwrap(), Some(3));
    }

    #[tokio::test]
    async fn health_reports_capital_and_running_flag() {
        let book = LedgerBook::new(LedgerBookConfig::default());
        book.commit(vec![set_balance("USDT", dec!(42))], "seed")
            .unwrap();
        book.set_running(false);
        let health = book.health_check().await.unwrap();
        assert!(health.healthy);
        assert!(!health.running);
        assert_eq!(health.available_capital, dec!(42));
    }
}
