use super::status::{BolStatus, DenialReason};
use super::store::StoreError;
use super::audit::AuditError;
use super::ledger::LedgerError;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("{0} party is missing")]
    MissingParty(&'static str),
    #[error("{0} party has no contact id")]
    InvalidParty(&'static str),
    #[error("at least one cargo line item is required")]
    NoCargo,
    #[error("cargo line {0} has a zero quantity or weight")]
    InvalidCargo(usize),
    #[error("{0} total does not fit in 64 bits")]
    AmountOverflow(&'static str),
    #[error("Pickup Date <= Delivery Date failed")]
    InvalidDates,
    #[error("unknown status {0:?}")]
    UnknownStatus(String),
    #[error("unknown role {0:?}")]
    UnknownRole(String),
    #[error("role table has no roles for {0}")]
    IncompleteRoleTable(BolStatus),
    #[error("transition {from} -> {to} is not a single forward step")]
    NonLinearEdge { from: BolStatus, to: BolStatus },
    #[error("malformed bill of lading number {0:?}")]
    MalformedNumber(String),
}

#[derive(thiserror::Error, Debug)]
pub enum WorkflowError {
    #[error("bill of lading {0} not found")]
    NotFound(String),
    #[error("invalid transition: {0}")]
    InvalidTransition(DenialReason),
    #[error("insufficient permission: {0}")]
    InsufficientPermission(String),
    #[error("version conflict on {bol_number}: expected {expected}, found {actual}")]
    VersionConflict {
        bol_number: String,
        expected: u64,
        actual: u64,
    },
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("batch of {size} exceeds the limit of {max}")]
    BatchTooLarge { size: usize, max: usize },
    #[error("update of {0} did not finish within the per-item timeout")]
    ItemTimeout(String),
    /// The operational write at `version` is committed; only the audit append failed.
    #[error("audit trail unavailable after committing {bol_number} v{version}: {source}")]
    AuditTrail {
        bol_number: String,
        version: u64,
        #[source]
        source: AuditError,
    },
    #[error(transparent)]
    Audit(#[from] AuditError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Store(StoreError),
}

impl WorkflowError {
    /// Only a lost compare-and-increment race is worth resubmitting.
    pub fn is_retryable(&self) -> bool {
        matches!(self, WorkflowError::VersionConflict { .. })
    }

    /// Short machine-readable tag, used in batch summaries and audit metadata.
    pub fn kind(&self) -> &'static str {
        match self {
            WorkflowError::NotFound(_) => "not_found",
            WorkflowError::InvalidTransition(_) => "invalid_transition",
            WorkflowError::InsufficientPermission(_) => "insufficient_permission",
            WorkflowError::VersionConflict { .. } => "version_conflict",
            WorkflowError::Validation(_) => "validation",
            WorkflowError::BatchTooLarge { .. } => "batch_too_large",
            WorkflowError::ItemTimeout(_) => "timeout",
            WorkflowError::AuditTrail { .. } | WorkflowError::Audit(_) => "audit_failure",
            WorkflowError::Ledger(_) => "ledger",
            WorkflowError::Store(_) => "store",
        }
    }
}

impl From<StoreError> for WorkflowError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::VersionConflict {
                bol_number,
                expected,
                actual,
            } => WorkflowError::VersionConflict {
                bol_number,
                expected,
                actual,
            },
            StoreError::NotFound(number) => WorkflowError::NotFound(number),
            other => WorkflowError::Store(other),
        }
    }
}
