//! Sled backed store. Records and outbox live in separate trees and a
//! transition touches both inside one sled transaction.

use std::sync::Arc;

use sled::transaction::{
    ConflictableTransactionError, ConflictableTransactionResult, TransactionError,
    TransactionalTree,
};
use sled::{Batch, Db, Transactional, Tree};

use super::{BolStore, OutboxIntent, StoreError, apply_ledger_commit, check_version};
use crate::bol::{BillOfLading, LedgerCommit};
use crate::utils;

const BOLS_TREE: &str = "bols";
const OUTBOX_TREE: &str = "outbox";

#[derive(Debug, Clone)]
pub struct SledBolStore {
    instance: Arc<Db>,
    bols: Tree,
    outbox: Tree,
}

fn abort(err: StoreError) -> ConflictableTransactionError<StoreError> {
    ConflictableTransactionError::Abort(err)
}

fn unwrap_tx<T>(result: Result<T, TransactionError<StoreError>>) -> Result<T, StoreError> {
    match result {
        Ok(value) => Ok(value),
        Err(TransactionError::Abort(err)) => Err(err),
        Err(TransactionError::Storage(err)) => Err(err.into()),
    }
}

impl SledBolStore {
    pub fn new(instance: Arc<Db>) -> Result<Self, StoreError> {
        let bols = instance.open_tree(BOLS_TREE)?;
        let outbox = instance.open_tree(OUTBOX_TREE)?;
        Ok(Self {
            instance,
            bols,
            outbox,
        })
    }

    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self, StoreError> {
        Self::new(Arc::new(sled::open(path)?))
    }

    pub fn flush(&self) -> Result<(), StoreError> {
        self.instance.flush()?;
        Ok(())
    }

    // keys are big endian so tree order is delivery order
    fn intent_key(seq: u64) -> [u8; 8] {
        seq.to_be_bytes()
    }

    fn assign(
        &self,
        intents: Vec<OutboxIntent>,
    ) -> Result<Vec<(OutboxIntent, Vec<u8>)>, StoreError> {
        intents
            .into_iter()
            .map(|mut intent| -> Result<(OutboxIntent, Vec<u8>), StoreError> {
                intent.seq = self.instance.generate_id()? + 1;
                let cbor = utils::to_cbor(&intent)?;
                Ok((intent, cbor))
            })
            .collect()
    }

    fn load_intent(&self, seq: u64) -> Result<OutboxIntent, StoreError> {
        let raw = self
            .outbox
            .get(Self::intent_key(seq))?
            .ok_or(StoreError::UnknownIntent(seq))?;
        Ok(utils::from_cbor(&raw)?)
    }

    fn scan_intents(&self) -> impl Iterator<Item = Result<OutboxIntent, StoreError>> + '_ {
        self.outbox.iter().map(|entry| -> Result<OutboxIntent, StoreError> {
            let (_, raw) = entry?;
            Ok(utils::from_cbor::<OutboxIntent>(&raw)?)
        })
    }
}

impl BolStore for SledBolStore {
    fn next_sequence(&self) -> Result<u64, StoreError> {
        Ok(self.instance.generate_id()? + 1)
    }

    fn insert(&self, bol: &BillOfLading) -> Result<(), StoreError> {
        let cbor = utils::to_cbor(bol)?;
        self.bols
            .compare_and_swap(bol.number.as_bytes(), None::<&[u8]>, Some(cbor))?
            .map_err(|_| StoreError::AlreadyExists(bol.number.clone()))
    }

    fn get(&self, bol_number: &str) -> Result<Option<BillOfLading>, StoreError> {
        match self.bols.get(bol_number.as_bytes())? {
            Some(raw) => Ok(Some(utils::from_cbor(&raw)?)),
            None => Ok(None),
        }
    }

    fn list(&self) -> Result<Vec<BillOfLading>, StoreError> {
        self.bols
            .iter()
            .values()
            .map(|raw| -> Result<BillOfLading, StoreError> { Ok(utils::from_cbor(&raw?)?) })
            .collect()
    }

    fn commit_transition(
        &self,
        expected_version: u64,
        next: &BillOfLading,
        intents: Vec<OutboxIntent>,
    ) -> Result<Vec<OutboxIntent>, StoreError> {
        let key = next.number.as_bytes();
        let record = utils::to_cbor(next)?;
        let staged = self.assign(intents)?;

        let result = (&self.bols, &self.outbox).transaction(
            |(bols, outbox): &(TransactionalTree, TransactionalTree)|
             -> ConflictableTransactionResult<(), StoreError> {
                let raw = bols
                    .get(key)?
                    .ok_or_else(|| abort(StoreError::NotFound(next.number.clone())))?;
                let current: BillOfLading =
                    utils::from_cbor(&raw).map_err(|e| abort(e.into()))?;
                check_version(&current, expected_version).map_err(abort)?;

                bols.insert(key, record.as_slice())?;
                for (intent, cbor) in &staged {
                    outbox.insert(&Self::intent_key(intent.seq)[..], cbor.as_slice())?;
                }
                Ok(())
            },
        );
        unwrap_tx(result)?;

        Ok(staged.into_iter().map(|(intent, _)| intent).collect())
    }

    fn record_ledger_commit(
        &self,
        bol_number: &str,
        commit: LedgerCommit,
    ) -> Result<BillOfLading, StoreError> {
        let key = bol_number.as_bytes();
        let result = self.bols.transaction(
            |bols: &TransactionalTree| -> ConflictableTransactionResult<BillOfLading, StoreError> {
                let raw = bols
                    .get(key)?
                    .ok_or_else(|| abort(StoreError::NotFound(bol_number.to_string())))?;
                let mut bol: BillOfLading = utils::from_cbor(&raw).map_err(|e| abort(e.into()))?;
                if apply_ledger_commit(&mut bol, commit.clone()) {
                    let cbor = utils::to_cbor(&bol).map_err(|e| abort(e.into()))?;
                    bols.insert(key, cbor)?;
                }
                Ok(bol)
            },
        );
        unwrap_tx(result)
    }

    fn enqueue(&self, intents: Vec<OutboxIntent>) -> Result<Vec<OutboxIntent>, StoreError> {
        let staged = self.assign(intents)?;
        let mut batch = Batch::default();
        for (intent, cbor) in &staged {
            batch.insert(&Self::intent_key(intent.seq)[..], cbor.as_slice());
        }
        self.outbox.apply_batch(batch)?;
        Ok(staged.into_iter().map(|(intent, _)| intent).collect())
    }

    fn pending_intents(&self, limit: usize) -> Result<Vec<OutboxIntent>, StoreError> {
        let mut pending = Vec::new();
        for intent in self.scan_intents() {
            let intent = intent?;
            if intent.dead {
                continue;
            }
            pending.push(intent);
            if pending.len() == limit {
                break;
            }
        }
        Ok(pending)
    }

    fn complete_intent(&self, seq: u64) -> Result<(), StoreError> {
        self.outbox
            .remove(Self::intent_key(seq))?
            .map(|_| ())
            .ok_or(StoreError::UnknownIntent(seq))
    }

    fn fail_intent(&self, seq: u64, error: &str, dead: bool) -> Result<(), StoreError> {
        let mut intent = self.load_intent(seq)?;
        intent.attempts += 1;
        intent.last_error = Some(error.to_string());
        intent.dead = dead;
        self.outbox
            .insert(Self::intent_key(seq), utils::to_cbor(&intent)?)?;
        Ok(())
    }

    fn dead_intents(&self) -> Result<Vec<OutboxIntent>, StoreError> {
        self.scan_intents()
            .filter(|intent| intent.as_ref().map_or(true, |i| i.dead))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bol::{BolDraft, CargoItem, Party, TimeStamp, TransitionDetails};
    use crate::status::BolStatus;
    use crate::store::IntentKind;
    use tempfile::tempdir;

    fn sample(store: &SledBolStore) -> BillOfLading {
        let seq = store.next_sequence().unwrap();
        BolDraft::new()
            .set_shipper(Party::new("contact_s", "Shipper"))
            .set_consignee(Party::new("contact_c", "Consignee"))
            .set_carrier(Party::new("contact_k", "Carrier"))
            .add_cargo(CargoItem::new("Pallets", 10, 500, 100_000))
            .finalise(seq, "user_s", TimeStamp::new())
            .unwrap()
    }

    #[test]
    fn transition_and_intent_commit_together() {
        let dir = tempdir().unwrap();
        let store = SledBolStore::open(dir.path().join("store.db")).unwrap();
        let bol = sample(&store);
        store.insert(&bol).unwrap();

        let next = bol.advanced(
            BolStatus::Approved,
            "user_s",
            TransitionDetails::default(),
            TimeStamp::new(),
        );
        let intents = vec![OutboxIntent::new(
            IntentKind::LedgerSync,
            &bol.number,
            BolStatus::Approved,
            "user_s",
            None,
        )];
        let staged = store.commit_transition(1, &next, intents).unwrap();
        assert!(staged[0].seq > 0);

        let stored = store.get(&bol.number).unwrap().unwrap();
        assert_eq!(stored.version, 2);
        assert_eq!(store.pending_intents(10).unwrap().len(), 1);

        // same starting version again loses the race and writes nothing
        let err = store.commit_transition(1, &next, vec![]).unwrap_err();
        assert!(matches!(err, StoreError::VersionConflict { expected: 1, actual: 2, .. }));
        assert_eq!(store.pending_intents(10).unwrap().len(), 1);
    }

    #[test]
    fn duplicate_insert_is_rejected() {
        let dir = tempdir().unwrap();
        let store = SledBolStore::open(dir.path().join("store.db")).unwrap();
        let bol = sample(&store);
        store.insert(&bol).unwrap();
        assert_eq!(
            store.insert(&bol).unwrap_err(),
            StoreError::AlreadyExists(bol.number.clone())
        );
    }

    #[test]
    fn failed_intents_can_be_buried() {
        let dir = tempdir().unwrap();
        let store = SledBolStore::open(dir.path().join("store.db")).unwrap();
        let staged = store
            .enqueue(vec![OutboxIntent::new(
                IntentKind::Notify,
                "BOL-2026-000001",
                BolStatus::Approved,
                "user_s",
                None,
            )])
            .unwrap();
        let seq = staged[0].seq;

        store.fail_intent(seq, "smtp down", false).unwrap();
        assert_eq!(store.pending_intents(10).unwrap()[0].attempts, 1);

        store.fail_intent(seq, "rejected", true).unwrap();
        assert!(store.pending_intents(10).unwrap().is_empty());
        assert_eq!(store.dead_intents().unwrap().len(), 1);
    }
}
