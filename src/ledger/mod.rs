//! Permissioned ledger twin of a bill of lading.
//!
//! The ledger only ever sees approved and later versions. It keeps its own
//! `version` counter and its own copy of the lifecycle rules over plain status
//! strings, so a record can never be moved illegally even by a caller that
//! bypasses the operational checks.

pub mod contract;
pub mod gateway;

use chrono::Utc;

use crate::bol::{BillOfLading, CargoItem, FreightCharges, Party, TimeStamp};
use crate::utils::CodecError;

pub use self::contract::LedgerContract;
pub use self::gateway::{InProcessLedger, LedgerGateway};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("invalid bill of lading number {0:?}, expected BOL-YYYY-NNNNNN")]
    InvalidBolNumber(String),
    #[error("a ledger record needs at least one cargo item")]
    MissingCargo,
    #[error("ledger record {0} already exists")]
    AlreadyExists(String),
    #[error("ledger record {0} not found")]
    NotFound(String),
    #[error("unknown status {0:?}")]
    InvalidStatus(String),
    #[error("ledger refuses {from} -> {to}")]
    InvalidTransition { from: String, to: String },
    #[error("ledger call timed out")]
    Timeout,
    #[error("ledger unavailable: {0}")]
    Unavailable(String),
    #[error(transparent)]
    Codec(#[from] CodecError),
}

impl LedgerError {
    /// The contract looked at the request and said no. Retrying the same
    /// request cannot succeed.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            LedgerError::InvalidBolNumber(_)
                | LedgerError::MissingCargo
                | LedgerError::InvalidStatus(_)
                | LedgerError::InvalidTransition { .. }
        )
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct LedgerStatusChange {
    #[n(0)]
    pub status: String,
    #[n(1)]
    pub changed_by: String,
    #[n(2)]
    pub timestamp: TimeStamp<Utc>,
    #[n(3)]
    pub note: Option<String>,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct LedgerRecord {
    #[n(0)]
    pub bol_number: String,
    #[n(1)]
    pub status: String,
    #[n(2)]
    pub shipper: Party,
    #[n(3)]
    pub consignee: Party,
    #[n(4)]
    pub carrier: Party,
    #[n(5)]
    pub broker: Option<Party>,
    #[n(6)]
    pub cargo: Vec<CargoItem>,
    #[n(7)]
    pub total_weight_kg: u64,
    #[n(8)]
    pub total_value_cents: u64,
    #[n(9)]
    pub charges: FreightCharges,
    #[n(10)]
    pub pickup_date: Option<TimeStamp<Utc>>,
    #[n(11)]
    pub delivery_date: Option<TimeStamp<Utc>>,
    #[n(12)]
    pub notes: Option<String>,
    #[n(13)]
    pub created_by: String,
    #[n(14)]
    pub version: u64,
    #[n(15)]
    pub doc_ref: String, // content hash of the document snapshot
    #[n(16)]
    pub approved_at: TimeStamp<Utc>,
    #[n(17)]
    pub updated_at: TimeStamp<Utc>,
    #[n(18)]
    pub status_history: Vec<LedgerStatusChange>,
}

/// One committed write for a key, as returned by `get_history`.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct LedgerHistoryEntry {
    #[n(0)]
    pub tx_id: String,
    #[n(1)]
    pub timestamp: TimeStamp<Utc>,
    #[n(2)]
    pub is_delete: bool,
    #[n(3)]
    pub record: LedgerRecord,
}

/// Receipt for a committed ledger write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerReceipt {
    pub tx_id: String,
    pub version: u64,
    pub status: String,
    pub timestamp: TimeStamp<Utc>,
}

/// Document fields handed to the ledger on first approval.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerBolInput {
    pub bol_number: String,
    pub shipper: Party,
    pub consignee: Party,
    pub carrier: Party,
    pub broker: Option<Party>,
    pub cargo: Vec<CargoItem>,
    pub total_weight_kg: u64,
    pub total_value_cents: u64,
    pub charges: FreightCharges,
    pub pickup_date: Option<TimeStamp<Utc>>,
    pub delivery_date: Option<TimeStamp<Utc>>,
    pub notes: Option<String>,
    pub created_by: String,
}

impl From<&BillOfLading> for LedgerBolInput {
    fn from(bol: &BillOfLading) -> Self {
        Self {
            bol_number: bol.number.clone(),
            shipper: bol.shipper.clone(),
            consignee: bol.consignee.clone(),
            carrier: bol.carrier.clone(),
            broker: bol.broker.clone(),
            cargo: bol.cargo.clone(),
            total_weight_kg: bol.total_weight_kg,
            total_value_cents: bol.total_value_cents,
            charges: bol.charges.clone(),
            pickup_date: bol.pickup_date.clone(),
            delivery_date: bol.delivery_date.clone(),
            notes: bol.notes.clone(),
            created_by: bol.created_by.clone(),
        }
    }
}

/// One page of `list_all`. Pass `bookmark` back to continue.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LedgerPage {
    pub records: Vec<LedgerRecord>,
    pub bookmark: Option<String>,
}
