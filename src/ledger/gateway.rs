//! Async boundary to the ledger.
//!
//! Everything outside the ledger talks to it through [`LedgerGateway`]. The
//! in-process implementation wraps a [`LedgerContract`] and can be slowed
//! down or taken offline to exercise the timeout and retry paths.
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use super::{
    LedgerBolInput, LedgerContract, LedgerError, LedgerHistoryEntry, LedgerPage, LedgerReceipt,
    LedgerRecord,
};
use crate::bol::TimeStamp;

#[async_trait]
pub trait LedgerGateway: Send + Sync {
    async fn create_approved_bol(
        &self,
        input: LedgerBolInput,
        doc_ref: String,
        actor: &str,
        note: Option<&str>,
    ) -> Result<LedgerReceipt, LedgerError>;

    async fn update_status(
        &self,
        bol_number: &str,
        status: &str,
        actor: &str,
        note: Option<&str>,
        doc_ref: Option<String>,
    ) -> Result<LedgerReceipt, LedgerError>;

    async fn get(&self, bol_number: &str) -> Result<LedgerRecord, LedgerError>;

    async fn get_history(&self, bol_number: &str) -> Result<Vec<LedgerHistoryEntry>, LedgerError>;

    async fn query_by_status(&self, status: &str) -> Result<Vec<LedgerRecord>, LedgerError>;

    async fn query_by_carrier(&self, carrier_id: &str) -> Result<Vec<LedgerRecord>, LedgerError>;

    async fn query_by_date_range(
        &self,
        start: &TimeStamp<Utc>,
        end: &TimeStamp<Utc>,
    ) -> Result<Vec<LedgerRecord>, LedgerError>;

    async fn list_all(
        &self,
        page_size: usize,
        bookmark: Option<&str>,
    ) -> Result<LedgerPage, LedgerError>;
}

#[derive(Debug, Default)]
pub struct InProcessLedger {
    contract: Mutex<LedgerContract>,
    latency_ms: AtomicU64,
    offline: AtomicBool,
    writes: AtomicU64,
}

impl InProcessLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every call, used to trip caller timeouts.
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::Relaxed);
    }

    /// Write calls that reached the contract, accepted or not.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    pub fn verify_chain(&self) -> Result<bool, LedgerError> {
        self.contract()?.verify_chain()
    }

    async fn enter(&self) -> Result<(), LedgerError> {
        let latency = self.latency_ms.load(Ordering::Relaxed);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if self.offline.load(Ordering::Relaxed) {
            return Err(LedgerError::Unavailable("peer unreachable".into()));
        }
        Ok(())
    }

    fn contract(&self) -> Result<MutexGuard<'_, LedgerContract>, LedgerError> {
        self.contract
            .lock()
            .map_err(|_| LedgerError::Unavailable("ledger state poisoned".into()))
    }
}

#[async_trait]
impl LedgerGateway for InProcessLedger {
    async fn create_approved_bol(
        &self,
        input: LedgerBolInput,
        doc_ref: String,
        actor: &str,
        note: Option<&str>,
    ) -> Result<LedgerReceipt, LedgerError> {
        self.enter().await?;
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.contract()?.create_approved_bol(input, doc_ref, actor, note)
    }

    async fn update_status(
        &self,
        bol_number: &str,
        status: &str,
        actor: &str,
        note: Option<&str>,
        doc_ref: Option<String>,
    ) -> Result<LedgerReceipt, LedgerError> {
        self.enter().await?;
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.contract()?
            .update_status(bol_number, status, actor, note, doc_ref)
    }

    async fn get(&self, bol_number: &str) -> Result<LedgerRecord, LedgerError> {
        self.enter().await?;
        self.contract()?.get(bol_number)
    }

    async fn get_history(&self, bol_number: &str) -> Result<Vec<LedgerHistoryEntry>, LedgerError> {
        self.enter().await?;
        self.contract()?.get_history(bol_number)
    }

    async fn query_by_status(&self, status: &str) -> Result<Vec<LedgerRecord>, LedgerError> {
        self.enter().await?;
        self.contract()?.query_by_status(status)
    }

    async fn query_by_carrier(&self, carrier_id: &str) -> Result<Vec<LedgerRecord>, LedgerError> {
        self.enter().await?;
        Ok(self.contract()?.query_by_carrier(carrier_id))
    }

    async fn query_by_date_range(
        &self,
        start: &TimeStamp<Utc>,
        end: &TimeStamp<Utc>,
    ) -> Result<Vec<LedgerRecord>, LedgerError> {
        self.enter().await?;
        Ok(self.contract()?.query_by_date_range(start, end))
    }

    async fn list_all(
        &self,
        page_size: usize,
        bookmark: Option<&str>,
    ) -> Result<LedgerPage, LedgerError> {
        self.enter().await?;
        Ok(self.contract()?.list_all(page_size, bookmark))
    }
}
