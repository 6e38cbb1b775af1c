//! In-memory store, one mutex guards records and outbox together so the
//! compare-and-increment and the intent insert are a single critical section.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use super::{BolStore, OutboxIntent, StoreError, apply_ledger_commit, check_version};
use crate::bol::{BillOfLading, LedgerCommit};

#[derive(Debug, Default)]
struct Inner {
    bols: BTreeMap<String, BillOfLading>,
    outbox: BTreeMap<u64, OutboxIntent>,
    sequence: u64,
    intent_seq: u64,
}

impl Inner {
    fn stage(&mut self, intents: Vec<OutboxIntent>) -> Vec<OutboxIntent> {
        intents
            .into_iter()
            .map(|mut intent| {
                self.intent_seq += 1;
                intent.seq = self.intent_seq;
                self.outbox.insert(intent.seq, intent.clone());
                intent
            })
            .collect()
    }
}

#[derive(Debug, Default)]
pub struct MemoryBolStore {
    inner: Mutex<Inner>,
}

impl MemoryBolStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, StoreError> {
        self.inner
            .lock()
            .map_err(|_| StoreError::Backend("memory store lock poisoned".into()))
    }
}

impl BolStore for MemoryBolStore {
    fn next_sequence(&self) -> Result<u64, StoreError> {
        let mut inner = self.lock()?;
        inner.sequence += 1;
        Ok(inner.sequence)
    }

    fn insert(&self, bol: &BillOfLading) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        if inner.bols.contains_key(&bol.number) {
            return Err(StoreError::AlreadyExists(bol.number.clone()));
        }
        inner.bols.insert(bol.number.clone(), bol.clone());
        Ok(())
    }

    fn get(&self, bol_number: &str) -> Result<Option<BillOfLading>, StoreError> {
        Ok(self.lock()?.bols.get(bol_number).cloned())
    }

    fn list(&self) -> Result<Vec<BillOfLading>, StoreError> {
        Ok(self.lock()?.bols.values().cloned().collect())
    }

    fn commit_transition(
        &self,
        expected_version: u64,
        next: &BillOfLading,
        intents: Vec<OutboxIntent>,
    ) -> Result<Vec<OutboxIntent>, StoreError> {
        let mut inner = self.lock()?;
        let current = inner
            .bols
            .get(&next.number)
            .ok_or_else(|| StoreError::NotFound(next.number.clone()))?;
        check_version(current, expected_version)?;

        inner.bols.insert(next.number.clone(), next.clone());
        Ok(inner.stage(intents))
    }

    fn record_ledger_commit(
        &self,
        bol_number: &str,
        commit: LedgerCommit,
    ) -> Result<BillOfLading, StoreError> {
        let mut inner = self.lock()?;
        let bol = inner
            .bols
            .get_mut(bol_number)
            .ok_or_else(|| StoreError::NotFound(bol_number.to_string()))?;
        apply_ledger_commit(bol, commit);
        Ok(bol.clone())
    }

    fn enqueue(&self, intents: Vec<OutboxIntent>) -> Result<Vec<OutboxIntent>, StoreError> {
        Ok(self.lock()?.stage(intents))
    }

    fn pending_intents(&self, limit: usize) -> Result<Vec<OutboxIntent>, StoreError> {
        Ok(self
            .lock()?
            .outbox
            .values()
            .filter(|intent| !intent.dead)
            .take(limit)
            .cloned()
            .collect())
    }

    fn complete_intent(&self, seq: u64) -> Result<(), StoreError> {
        self.lock()?
            .outbox
            .remove(&seq)
            .map(|_| ())
            .ok_or(StoreError::UnknownIntent(seq))
    }

    fn fail_intent(&self, seq: u64, error: &str, dead: bool) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        let intent = inner
            .outbox
            .get_mut(&seq)
            .ok_or(StoreError::UnknownIntent(seq))?;
        intent.attempts += 1;
        intent.last_error = Some(error.to_string());
        intent.dead = dead;
        Ok(())
    }

    fn dead_intents(&self) -> Result<Vec<OutboxIntent>, StoreError> {
        Ok(self
            .lock()?
            .outbox
            .values()
            .filter(|intent| intent.dead)
            .cloned()
            .collect())
    }
}
