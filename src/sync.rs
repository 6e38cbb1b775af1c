//! Pushes committed status changes to the ledger.
//!
//! The adapter decides between create and update from what the operational
//! record knows, and falls back in either direction when the ledger disagrees.
//! Delivery is at least once, so a change the ledger already holds counts as
//! success, and a ledger that is several steps behind is walked forward one
//! legal step at a time.
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tracing::{info, instrument, warn};

use crate::bol::{BillOfLading, LedgerCommit, TimeStamp};
use crate::ledger::{LedgerBolInput, LedgerError, LedgerGateway, LedgerReceipt};
use crate::status::{BolStatus, TransitionTable};
use crate::store::{BolStore, StoreError};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    #[error("ledger call exceeded {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("{0} is not kept on the ledger")]
    NotOnLedger(BolStatus),
}

impl SyncError {
    /// Retrying cannot help, the intent should be parked.
    pub fn is_rejection(&self) -> bool {
        match self {
            SyncError::Ledger(err) => err.is_rejection(),
            SyncError::Store(StoreError::NotFound(_)) | SyncError::NotOnLedger(_) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOperation {
    Create,
    Update,
    /// The ledger already held the requested status.
    AlreadyApplied,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncReceipt {
    pub transaction_id: String,
    pub ledger_version: u64,
    pub ledger_status: BolStatus,
    pub operation: SyncOperation,
}

#[derive(Debug, Default)]
pub struct SyncMetrics {
    attempts: AtomicU64,
    creates: AtomicU64,
    updates: AtomicU64,
    already_applied: AtomicU64,
    fallbacks: AtomicU64,
    catch_up_steps: AtomicU64,
    timeouts: AtomicU64,
    failures: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncMetricsSnapshot {
    pub attempts: u64,
    pub creates: u64,
    pub updates: u64,
    pub already_applied: u64,
    pub fallbacks: u64,
    pub catch_up_steps: u64,
    pub timeouts: u64,
    pub failures: u64,
}

impl SyncMetrics {
    pub fn snapshot(&self) -> SyncMetricsSnapshot {
        SyncMetricsSnapshot {
            attempts: self.attempts.load(Ordering::Relaxed),
            creates: self.creates.load(Ordering::Relaxed),
            updates: self.updates.load(Ordering::Relaxed),
            already_applied: self.already_applied.load(Ordering::Relaxed),
            fallbacks: self.fallbacks.load(Ordering::Relaxed),
            catch_up_steps: self.catch_up_steps.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

pub struct LedgerSyncAdapter {
    gateway: Arc<dyn LedgerGateway>,
    store: Arc<dyn BolStore>,
    table: TransitionTable,
    timeout: Duration,
    metrics: SyncMetrics,
}

fn ledger_status(raw: &str) -> Result<BolStatus, SyncError> {
    BolStatus::from_str(raw).map_err(|_| LedgerError::InvalidStatus(raw.to_string()).into())
}

impl LedgerSyncAdapter {
    pub fn new(
        gateway: Arc<dyn LedgerGateway>,
        store: Arc<dyn BolStore>,
        table: TransitionTable,
        timeout: Duration,
    ) -> Self {
        Self {
            gateway,
            store,
            table,
            timeout,
            metrics: SyncMetrics::default(),
        }
    }

    pub fn metrics(&self) -> SyncMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Bring the ledger twin of `bol_number` to `status` and note the result
    /// on the operational record. The operational `version` is never touched.
    #[instrument(skip(self, note))]
    pub async fn sync_status(
        &self,
        bol_number: &str,
        status: BolStatus,
        actor: &str,
        note: Option<&str>,
    ) -> Result<SyncReceipt, SyncError> {
        SyncMetrics::bump(&self.metrics.attempts);
        if !status.is_on_ledger() {
            return Err(SyncError::NotOnLedger(status));
        }
        let bol = self
            .store
            .get(bol_number)?
            .ok_or_else(|| StoreError::NotFound(bol_number.to_string()))?;

        let result = match bol.ledger_transaction_id() {
            None => self.create_first(&bol, status, actor, note).await,
            Some(_) => self.update_existing(&bol, status, actor, note).await,
        };

        let receipt = match result {
            Ok(receipt) => receipt,
            Err(err) => {
                match &err {
                    SyncError::Timeout(_) => SyncMetrics::bump(&self.metrics.timeouts),
                    _ => SyncMetrics::bump(&self.metrics.failures),
                }
                warn!(bol_number, actor, error = %err, "ledger sync failed");
                return Err(err);
            }
        };

        match receipt.operation {
            SyncOperation::Create => SyncMetrics::bump(&self.metrics.creates),
            SyncOperation::Update => SyncMetrics::bump(&self.metrics.updates),
            SyncOperation::AlreadyApplied => SyncMetrics::bump(&self.metrics.already_applied),
        }

        self.store.record_ledger_commit(
            bol_number,
            LedgerCommit {
                transaction_id: receipt.transaction_id.clone(),
                ledger_version: receipt.ledger_version,
                ledger_status: receipt.ledger_status,
                committed_at: TimeStamp::new(),
            },
        )?;
        info!(
            bol_number,
            ledger_version = receipt.ledger_version,
            tx_id = %receipt.transaction_id,
            operation = ?receipt.operation,
            "ledger synced"
        );
        Ok(receipt)
    }

    async fn create_first(
        &self,
        bol: &BillOfLading,
        status: BolStatus,
        actor: &str,
        note: Option<&str>,
    ) -> Result<SyncReceipt, SyncError> {
        let doc_ref = bol.document_hash().map_err(LedgerError::from)?;
        let created = self
            .bounded(self.gateway.create_approved_bol(
                LedgerBolInput::from(bol),
                doc_ref,
                actor,
                note,
            ))
            .await;

        match created {
            Ok(receipt) => {
                let receipt = self
                    .walk(bol, BolStatus::Approved, status, receipt, actor, note)
                    .await?;
                self.finish(receipt, SyncOperation::Create)
            }
            Err(SyncError::Ledger(LedgerError::AlreadyExists(_))) => {
                SyncMetrics::bump(&self.metrics.fallbacks);
                info!(bol_number = %bol.number, "ledger record already exists, updating instead");
                self.update_existing(bol, status, actor, note).await
            }
            Err(err) => Err(err),
        }
    }

    async fn update_existing(
        &self,
        bol: &BillOfLading,
        status: BolStatus,
        actor: &str,
        note: Option<&str>,
    ) -> Result<SyncReceipt, SyncError> {
        let updated = self
            .bounded(
                self.gateway
                    .update_status(&bol.number, status.as_str(), actor, note, None),
            )
            .await;

        match updated {
            Ok(receipt) => self.finish(receipt, SyncOperation::Update),
            Err(SyncError::Ledger(LedgerError::NotFound(_))) => {
                SyncMetrics::bump(&self.metrics.fallbacks);
                info!(bol_number = %bol.number, "ledger record missing, creating instead");
                let doc_ref = bol.document_hash().map_err(LedgerError::from)?;
                let receipt = self
                    .bounded(self.gateway.create_approved_bol(
                        LedgerBolInput::from(bol),
                        doc_ref,
                        actor,
                        note,
                    ))
                    .await?;
                let receipt = self
                    .walk(bol, BolStatus::Approved, status, receipt, actor, note)
                    .await?;
                self.finish(receipt, SyncOperation::Create)
            }
            Err(SyncError::Ledger(LedgerError::InvalidTransition { from, to })) => {
                let held = ledger_status(&from)?;
                if held.ordinal() >= status.ordinal() {
                    return self.already_applied(&bol.number).await;
                }
                // behind by more than one step, earlier intents were lost
                warn!(
                    bol_number = %bol.number,
                    held = %from,
                    wanted = %to,
                    "ledger behind, catching up"
                );
                let current = self.bounded(self.gateway.get(&bol.number)).await?;
                let seed = LedgerReceipt {
                    tx_id: String::new(),
                    version: current.version,
                    status: current.status,
                    timestamp: current.updated_at,
                };
                let receipt = self.walk(bol, held, status, seed, actor, note).await?;
                self.finish(receipt, SyncOperation::Update)
            }
            Err(err) => Err(err),
        }
    }

    async fn walk(
        &self,
        bol: &BillOfLading,
        from: BolStatus,
        to: BolStatus,
        mut last: LedgerReceipt,
        actor: &str,
        note: Option<&str>,
    ) -> Result<LedgerReceipt, SyncError> {
        for step in self.table.path(from, to) {
            last = self
                .bounded(
                    self.gateway
                        .update_status(&bol.number, step.as_str(), actor, note, None),
                )
                .await?;
            SyncMetrics::bump(&self.metrics.catch_up_steps);
        }
        Ok(last)
    }

    async fn already_applied(&self, bol_number: &str) -> Result<SyncReceipt, SyncError> {
        let history = self.bounded(self.gateway.get_history(bol_number)).await?;
        let last = history
            .last()
            .ok_or_else(|| LedgerError::NotFound(bol_number.to_string()))?;
        Ok(SyncReceipt {
            transaction_id: last.tx_id.clone(),
            ledger_version: last.record.version,
            ledger_status: ledger_status(&last.record.status)?,
            operation: SyncOperation::AlreadyApplied,
        })
    }

    fn finish(
        &self,
        receipt: LedgerReceipt,
        operation: SyncOperation,
    ) -> Result<SyncReceipt, SyncError> {
        Ok(SyncReceipt {
            ledger_status: ledger_status(&receipt.status)?,
            transaction_id: receipt.tx_id,
            ledger_version: receipt.version,
            operation,
        })
    }

    async fn bounded<T>(
        &self,
        call: impl Future<Output = Result<T, LedgerError>>,
    ) -> Result<T, SyncError> {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(SyncError::Timeout(self.timeout)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bol::{BolDraft, CargoItem, Party, TransitionDetails};
    use crate::ledger::InProcessLedger;
    use crate::store::MemoryBolStore;

    struct Fixture {
        ledger: Arc<InProcessLedger>,
        store: Arc<MemoryBolStore>,
        adapter: LedgerSyncAdapter,
    }

    fn fixture() -> Fixture {
        let ledger = Arc::new(InProcessLedger::new());
        let store = Arc::new(MemoryBolStore::new());
        let adapter = LedgerSyncAdapter::new(
            ledger.clone(),
            store.clone(),
            TransitionTable::standard(),
            Duration::from_millis(200),
        );
        Fixture {
            ledger,
            store,
            adapter,
        }
    }

    // stores a record already advanced to `status` on the operational side
    fn seed(store: &MemoryBolStore, status: BolStatus) -> BillOfLading {
        let seq = store.next_sequence().unwrap();
        let mut bol = BolDraft::new()
            .set_shipper(Party::new("contact_s", "Shipper"))
            .set_consignee(Party::new("contact_c", "Consignee"))
            .set_carrier(Party::new("contact_k", "Carrier"))
            .add_cargo(CargoItem::new("Steel coils", 2, 9_000, 2_500_000))
            .finalise(seq, "user_s", TimeStamp::new())
            .unwrap();
        store.insert(&bol).unwrap();
        for step in TransitionTable::standard().path(BolStatus::Pending, status) {
            let next = bol.advanced(step, "user_s", TransitionDetails::default(), TimeStamp::new());
            store.commit_transition(bol.version, &next, vec![]).unwrap();
            bol = next;
        }
        bol
    }

    #[tokio::test]
    async fn first_sync_creates() {
        let f = fixture();
        let bol = seed(&f.store, BolStatus::Approved);

        let receipt = f
            .adapter
            .sync_status(&bol.number, BolStatus::Approved, "user_s", None)
            .await
            .unwrap();
        assert_eq!(receipt.operation, SyncOperation::Create);
        assert_eq!(receipt.ledger_version, 1);

        let stored = f.store.get(&bol.number).unwrap().unwrap();
        assert_eq!(stored.version, 2);
        assert!(stored.is_ledger_synced());
        assert_eq!(
            stored.history.last().and_then(|h| h.ledger_tx_id.clone()),
            Some(receipt.transaction_id)
        );
    }

    #[tokio::test]
    async fn redelivery_is_already_applied() {
        let f = fixture();
        let bol = seed(&f.store, BolStatus::Assigned);
        f.adapter
            .sync_status(&bol.number, BolStatus::Assigned, "u", None)
            .await
            .unwrap();

        let again = f
            .adapter
            .sync_status(&bol.number, BolStatus::Assigned, "u", None)
            .await
            .unwrap();
        assert_eq!(again.operation, SyncOperation::AlreadyApplied);
        assert_eq!(again.ledger_version, 2);
        assert_eq!(f.adapter.metrics().already_applied, 1);
    }

    #[tokio::test]
    async fn lagging_ledger_is_walked_forward() {
        let f = fixture();
        let bol = seed(&f.store, BolStatus::Approved);
        f.adapter
            .sync_status(&bol.number, BolStatus::Approved, "u", None)
            .await
            .unwrap();

        // operational side moves three steps while the ledger hears nothing
        let mut current = f.store.get(&bol.number).unwrap().unwrap();
        for step in [BolStatus::Assigned, BolStatus::Accepted, BolStatus::PickedUp] {
            let next = current.advanced(step, "u", TransitionDetails::default(), TimeStamp::new());
            f.store.commit_transition(current.version, &next, vec![]).unwrap();
            current = next;
        }

        let receipt = f
            .adapter
            .sync_status(&bol.number, BolStatus::PickedUp, "u", None)
            .await
            .unwrap();
        assert_eq!(receipt.ledger_version, 4);
        assert_eq!(receipt.ledger_status, BolStatus::PickedUp);
        assert!(f.ledger.verify_chain().unwrap());
    }

    #[tokio::test]
    async fn slow_ledger_times_out_and_is_counted() {
        let f = fixture();
        let bol = seed(&f.store, BolStatus::Approved);
        f.ledger.set_latency(Duration::from_secs(5));

        let err = f
            .adapter
            .sync_status(&bol.number, BolStatus::Approved, "u", None)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Timeout(_)));
        assert!(!err.is_rejection());
        assert_eq!(f.adapter.metrics().timeouts, 1);
        assert!(f.store.get(&bol.number).unwrap().unwrap().ledger.is_none());
    }

    #[tokio::test]
    async fn pending_is_never_synced() {
        let f = fixture();
        let bol = seed(&f.store, BolStatus::Pending);
        let err = f
            .adapter
            .sync_status(&bol.number, BolStatus::Pending, "u", None)
            .await
            .unwrap_err();
        assert!(err.is_rejection());
        assert_eq!(f.ledger.write_count(), 0);
    }
}
