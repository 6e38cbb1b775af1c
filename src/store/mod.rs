//! Operational store for bills of lading and their outbox.
//!
//! The store owns the compare-and-increment write: a transition is committed
//! only if the stored version still equals the version the caller read, and
//! the outbox intents for the asynchronous side effects are written in the
//! same atomic step. Callers never coordinate concurrency themselves.

pub mod memory;
pub mod sled;

use chrono::Utc;

use crate::bol::{BillOfLading, LedgerCommit, TimeStamp};
use crate::status::BolStatus;
use crate::utils::CodecError;

pub use self::memory::MemoryBolStore;
pub use self::sled::SledBolStore;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("bill of lading {0} not found")]
    NotFound(String),
    #[error("bill of lading {0} already exists")]
    AlreadyExists(String),
    #[error("version conflict on {bol_number}: expected {expected}, found {actual}")]
    VersionConflict {
        bol_number: String,
        expected: u64,
        actual: u64,
    },
    #[error("outbox intent {0} not found")]
    UnknownIntent(u64),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("storage backend: {0}")]
    Backend(String),
}

impl From<::sled::Error> for StoreError {
    fn from(err: ::sled::Error) -> Self {
        StoreError::Backend(err.to_string())
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IntentKind {
    #[n(0)]
    LedgerSync,
    #[n(1)]
    Notify,
}

impl IntentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntentKind::LedgerSync => "ledger_sync",
            IntentKind::Notify => "notify",
        }
    }
}

/// A side effect promised by a committed write, delivered at least once by
/// the outbox worker.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct OutboxIntent {
    #[n(0)]
    pub seq: u64, // assigned by the store, delivery order
    #[n(1)]
    pub kind: IntentKind,
    #[n(2)]
    pub bol_number: String,
    #[n(3)]
    pub status: BolStatus,
    #[n(4)]
    pub actor: String,
    #[n(5)]
    pub note: Option<String>,
    #[n(6)]
    pub created_at: TimeStamp<Utc>,
    #[n(7)]
    pub attempts: u32,
    #[n(8)]
    pub last_error: Option<String>,
    #[n(9)]
    pub dead: bool,
}

impl OutboxIntent {
    pub fn new(
        kind: IntentKind,
        bol_number: impl Into<String>,
        status: BolStatus,
        actor: impl Into<String>,
        note: Option<String>,
    ) -> Self {
        Self {
            seq: 0,
            kind,
            bol_number: bol_number.into(),
            status,
            actor: actor.into(),
            note,
            created_at: TimeStamp::new(),
            attempts: 0,
            last_error: None,
            dead: false,
        }
    }
}

pub trait BolStore: Send + Sync {
    /// Next value for the `BOL-<year>-<sequence>` counter, starts at 1.
    fn next_sequence(&self) -> Result<u64, StoreError>;

    /// Store a new record. Fails with `AlreadyExists` on a duplicate number.
    fn insert(&self, bol: &BillOfLading) -> Result<(), StoreError>;

    fn get(&self, bol_number: &str) -> Result<Option<BillOfLading>, StoreError>;

    fn list(&self) -> Result<Vec<BillOfLading>, StoreError>;

    /// Replace the record with `next` if the stored version is still
    /// `expected_version`, and persist `intents` in the same atomic step.
    /// Returns the intents with their assigned sequence numbers.
    fn commit_transition(
        &self,
        expected_version: u64,
        next: &BillOfLading,
        intents: Vec<OutboxIntent>,
    ) -> Result<Vec<OutboxIntent>, StoreError>;

    /// Note what the ledger holds for this record. Leaves `version` alone and
    /// ignores commits older than the one already recorded.
    fn record_ledger_commit(
        &self,
        bol_number: &str,
        commit: LedgerCommit,
    ) -> Result<BillOfLading, StoreError>;

    fn enqueue(&self, intents: Vec<OutboxIntent>) -> Result<Vec<OutboxIntent>, StoreError>;

    /// Live intents in delivery order.
    fn pending_intents(&self, limit: usize) -> Result<Vec<OutboxIntent>, StoreError>;

    fn complete_intent(&self, seq: u64) -> Result<(), StoreError>;

    /// Record a failed delivery. A dead intent is kept for inspection but no
    /// longer delivered.
    fn fail_intent(&self, seq: u64, error: &str, dead: bool) -> Result<(), StoreError>;

    fn dead_intents(&self) -> Result<Vec<OutboxIntent>, StoreError>;
}

/// Shared rule for both backends: only move the ledger marker forward, and
/// stamp the transaction id on the history entry it confirms.
pub(crate) fn apply_ledger_commit(bol: &mut BillOfLading, commit: LedgerCommit) -> bool {
    let newer = bol
        .ledger
        .as_ref()
        .is_none_or(|current| commit.ledger_version > current.ledger_version);
    if newer {
        if let Some(entry) = bol
            .history
            .iter_mut()
            .rev()
            .find(|entry| entry.status == commit.ledger_status)
        {
            entry.ledger_tx_id = Some(commit.transaction_id.clone());
        }
        bol.ledger = Some(commit);
    }
    newer
}

pub(crate) fn check_version(
    current: &BillOfLading,
    expected_version: u64,
) -> Result<(), StoreError> {
    if current.version != expected_version {
        return Err(StoreError::VersionConflict {
            bol_number: current.number.clone(),
            expected: expected_version,
            actual: current.version,
        });
    }
    Ok(())
}
