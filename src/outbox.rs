//! Delivers the side effects promised by committed writes.
//!
//! Intents are drained in store order. A transient failure leaves the intent
//! in place and holds back later intents of the same kind for the same bill,
//! so the ledger never sees statuses out of order. Rejections and intents
//! that ran out of attempts are parked as dead for inspection.
//!
//! The reconciliation sweep is the safety net for anything the outbox lost:
//! it re-enqueues a ledger sync for every approved record whose ledger
//! status lags and that has nothing pending.
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Notify, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::cache::{self, BOL_ENTITY, Cache};
use crate::notify::{Notification, Notifier, recipients_for};
use crate::store::{BolStore, IntentKind, OutboxIntent, StoreError};
use crate::sync::LedgerSyncAdapter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutboxSettings {
    pub batch_size: usize,
    pub max_attempts: u32,
    pub poll_interval: Duration,
    pub reconcile_interval: Duration,
}

impl Default for OutboxSettings {
    fn default() -> Self {
        Self {
            batch_size: 100,
            max_attempts: 10,
            poll_interval: Duration::from_millis(500),
            reconcile_interval: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub delivered: usize,
    pub failed: usize,
    pub dead: usize,
    /// Held back behind an earlier failure for the same bill.
    pub deferred: usize,
}

impl DrainReport {
    pub fn is_idle(&self) -> bool {
        *self == DrainReport::default()
    }
}

enum Delivery {
    Retry(String),
    Reject(String),
}

pub struct OutboxWorker {
    store: Arc<dyn BolStore>,
    sync: Arc<LedgerSyncAdapter>,
    notifier: Arc<dyn Notifier>,
    cache: Arc<dyn Cache>,
    wake: Arc<Notify>,
    settings: OutboxSettings,
}

impl OutboxWorker {
    pub fn new(
        store: Arc<dyn BolStore>,
        sync: Arc<LedgerSyncAdapter>,
        notifier: Arc<dyn Notifier>,
        cache: Arc<dyn Cache>,
        wake: Arc<Notify>,
        settings: OutboxSettings,
    ) -> Self {
        Self {
            store,
            sync,
            notifier,
            cache,
            wake,
            settings,
        }
    }

    /// One pass over the pending intents.
    pub async fn drain_once(&self) -> Result<DrainReport, StoreError> {
        let mut report = DrainReport::default();
        let mut blocked: HashSet<(String, IntentKind)> = HashSet::new();

        for intent in self.store.pending_intents(self.settings.batch_size)? {
            let lane = (intent.bol_number.clone(), intent.kind);
            if blocked.contains(&lane) {
                report.deferred += 1;
                continue;
            }

            match self.deliver(&intent).await {
                Ok(()) => {
                    self.store.complete_intent(intent.seq)?;
                    report.delivered += 1;
                }
                Err(Delivery::Reject(reason)) => {
                    error!(
                        seq = intent.seq,
                        kind = intent.kind.as_str(),
                        bol_number = %intent.bol_number,
                        reason = %reason,
                        "outbox intent rejected, parking"
                    );
                    self.store.fail_intent(intent.seq, &reason, true)?;
                    report.dead += 1;
                }
                Err(Delivery::Retry(reason)) => {
                    let exhausted = intent.attempts + 1 >= self.settings.max_attempts;
                    warn!(
                        seq = intent.seq,
                        kind = intent.kind.as_str(),
                        bol_number = %intent.bol_number,
                        attempts = intent.attempts + 1,
                        exhausted,
                        reason = %reason,
                        "outbox delivery failed"
                    );
                    self.store.fail_intent(intent.seq, &reason, exhausted)?;
                    if exhausted {
                        report.dead += 1;
                    } else {
                        report.failed += 1;
                        blocked.insert(lane);
                    }
                }
            }
        }

        if !report.is_idle() {
            debug!(?report, "outbox drained");
        }
        Ok(report)
    }

    /// Enqueue a ledger sync for every record the ledger has fallen behind on.
    /// Returns how many intents were added.
    pub fn reconcile_once(&self) -> Result<usize, StoreError> {
        let in_flight: HashSet<String> = self
            .store
            .pending_intents(usize::MAX)?
            .into_iter()
            .filter(|intent| intent.kind == IntentKind::LedgerSync)
            .map(|intent| intent.bol_number)
            .collect();

        let repairs: Vec<OutboxIntent> = self
            .store
            .list()?
            .into_iter()
            .filter(|bol| bol.status.is_on_ledger() && !bol.is_ledger_synced())
            .filter(|bol| !in_flight.contains(&bol.number))
            .map(|bol| {
                OutboxIntent::new(
                    IntentKind::LedgerSync,
                    bol.number,
                    bol.status,
                    "reconciler",
                    Some("reconciliation".to_string()),
                )
            })
            .collect();

        let added = repairs.len();
        if added > 0 {
            self.store.enqueue(repairs)?;
            info!(added, "reconciliation enqueued ledger syncs");
        }
        Ok(added)
    }

    /// Drain on every wake-up or poll tick until `shutdown` flips to true.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut next_reconcile = Instant::now() + self.settings.reconcile_interval;
        info!("outbox worker started");

        loop {
            tokio::select! {
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep(self.settings.poll_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }

            if Instant::now() >= next_reconcile {
                if let Err(err) = self.reconcile_once() {
                    error!(error = %err, "reconciliation sweep failed");
                }
                next_reconcile = Instant::now() + self.settings.reconcile_interval;
            }
            if let Err(err) = self.drain_once().await {
                error!(error = %err, "outbox drain failed");
            }
        }

        info!("outbox worker stopped");
    }

    async fn deliver(&self, intent: &OutboxIntent) -> Result<(), Delivery> {
        match intent.kind {
            IntentKind::LedgerSync => self
                .sync
                .sync_status(
                    &intent.bol_number,
                    intent.status,
                    &intent.actor,
                    intent.note.as_deref(),
                )
                .await
                .map(|_| {
                    // the ledger marker on the record changed
                    self.cache
                        .invalidate_pattern(&cache::entity_prefix(BOL_ENTITY, &intent.bol_number));
                    self.cache.invalidate_pattern(&cache::list_prefix(BOL_ENTITY));
                })
                .map_err(|err| match err.is_rejection() {
                    true => Delivery::Reject(err.to_string()),
                    false => Delivery::Retry(err.to_string()),
                }),
            IntentKind::Notify => {
                let bol = match self.store.get(&intent.bol_number) {
                    Ok(Some(bol)) => bol,
                    Ok(None) => return Err(Delivery::Reject("bill of lading vanished".into())),
                    Err(err) => return Err(Delivery::Retry(err.to_string())),
                };
                let recipients = recipients_for(&bol, intent.status, &intent.actor);
                if recipients.is_empty() {
                    return Ok(());
                }
                let notification = Notification {
                    bol_number: intent.bol_number.clone(),
                    status: intent.status,
                    actor: intent.actor.clone(),
                    note: intent.note.clone(),
                    recipients,
                };
                self.notifier
                    .notify(&notification)
                    .await
                    .map_err(|err| Delivery::Retry(err.to_string()))
            }
        }
    }
}
