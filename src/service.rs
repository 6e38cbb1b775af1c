//! Service layer API for the bill of lading workflow
//!
//! [`BolService`] is the status orchestrator. A status change is authorised,
//! committed together with its outbox intents, then the cache is purged and
//! the audit trail appended before returning. Ledger sync and notifications
//! are left to the [`OutboxWorker`] and never undo a committed write.
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::Notify;
use tracing::{debug, error, info, instrument, warn};

use super::audit::{
    AuditError, AuditEvent, AuditLog, ComplianceReport, MemoryAuditStore, NewAuditEvent, Page,
    SearchFilter, Severity, SledAuditStore,
};
use super::bol::{BillOfLading, BolDraft, StatusChange, TimeStamp, TransitionDetails};
use super::cache::{self, BOL_ENTITY, Cache, MemoryCache};
use super::config::Config;
use super::error::{ValidationError, WorkflowError};
use super::ledger::{InProcessLedger, LedgerGateway, LedgerHistoryEntry};
use super::notify::{LogNotifier, Notifier};
use super::outbox::{OutboxSettings, OutboxWorker};
use super::status::{BolStatus, DenialReason, Role, TransitionTable};
use super::store::{BolStore, IntentKind, MemoryBolStore, OutboxIntent, SledBolStore, StoreError};
use super::sync::{LedgerSyncAdapter, SyncMetricsSnapshot};
use super::utils;

/// Who is asking. `id` is the actor's contact id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    pub id: String,
    pub roles: BTreeSet<Role>,
}

impl Actor {
    pub fn new(id: impl Into<String>, roles: impl IntoIterator<Item = Role>) -> Self {
        Self {
            id: id.into(),
            roles: roles.into_iter().collect(),
        }
    }

    pub fn is_admin(&self) -> bool {
        self.roles.contains(&Role::Admin)
    }
}

#[derive(Debug, Clone)]
pub struct StatusUpdate {
    pub bol_number: String,
    pub status: BolStatus,
    pub actor: Actor,
    pub note: Option<String>,
    pub location: Option<String>,
    pub signature: Option<String>,
    pub metadata: BTreeMap<String, String>,
    /// Fail with `VersionConflict` unless the record is still at this version.
    pub expected_version: Option<u64>,
}

impl StatusUpdate {
    pub fn new(bol_number: impl Into<String>, status: BolStatus, actor: Actor) -> Self {
        Self {
            bol_number: bol_number.into(),
            status,
            actor,
            note: None,
            location: None,
            signature: None,
            metadata: BTreeMap::new(),
            expected_version: None,
        }
    }
    pub fn note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }
    pub fn location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }
    pub fn signature(mut self, signature: impl Into<String>) -> Self {
        self.signature = Some(signature.into());
        self
    }
    pub fn meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
    pub fn expect_version(mut self, version: u64) -> Self {
        self.expected_version = Some(version);
        self
    }
}

/// Wall time spent in each phase of an update.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Performance {
    pub load: Duration,
    pub authorize: Duration,
    pub commit: Duration,
    pub side_effects: Duration,
    pub total: Duration,
}

#[derive(Debug, Clone)]
pub struct StatusUpdateOutcome {
    pub bol: BillOfLading,
    pub performance: Performance,
}

#[derive(Debug)]
pub struct BatchItemResult {
    pub bol_number: String,
    pub result: Result<StatusUpdateOutcome, WorkflowError>,
}

#[derive(Debug, Default)]
pub struct BatchOutcome {
    pub results: Vec<BatchItemResult>,
    pub succeeded: usize,
    pub failed: usize,
}

/// Dry-run answer for a proposed transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionCheck {
    pub allowed: bool,
    pub reason: Option<DenialReason>,
    pub required_roles: BTreeSet<Role>,
    pub valid_next: Vec<BolStatus>,
    /// Things that would not block the move but look wrong.
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListFilter {
    pub status: Option<BolStatus>,
    pub carrier_id: Option<String>,
    pub limit: Option<usize>,
}

impl ListFilter {
    fn cache_fields(&self) -> BTreeMap<String, String> {
        let mut fields = BTreeMap::new();
        if let Some(status) = self.status {
            fields.insert("status".to_string(), status.to_string());
        }
        if let Some(carrier) = &self.carrier_id {
            fields.insert("carrier".to_string(), carrier.clone());
        }
        if let Some(limit) = self.limit {
            fields.insert("limit".to_string(), limit.to_string());
        }
        fields
    }

    fn accepts(&self, bol: &BillOfLading) -> bool {
        self.status.is_none_or(|status| bol.status == status)
            && self
                .carrier_id
                .as_ref()
                .is_none_or(|carrier| bol.carrier.contact_id == *carrier)
    }
}

#[derive(Debug, Clone, Copy)]
struct Settings {
    cache_ttl: Duration,
    batch_max_items: usize,
    batch_item_timeout: Duration,
    outbox: OutboxSettings,
}

impl From<&Config> for Settings {
    fn from(config: &Config) -> Self {
        Self {
            cache_ttl: config.cache_ttl(),
            batch_max_items: config.batch_max_items,
            batch_item_timeout: config.batch_item_timeout(),
            outbox: config.outbox(),
        }
    }
}

#[derive(Default)]
pub struct BolServiceBuilder {
    config: Config,
    store: Option<Arc<dyn BolStore>>,
    cache: Option<Arc<dyn Cache>>,
    audit: Option<Arc<AuditLog>>,
    ledger: Option<Arc<dyn LedgerGateway>>,
    notifier: Option<Arc<dyn Notifier>>,
    table: Option<TransitionTable>,
}

impl BolServiceBuilder {
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }
    pub fn store(mut self, store: Arc<dyn BolStore>) -> Self {
        self.store = Some(store);
        self
    }
    pub fn cache(mut self, cache: Arc<dyn Cache>) -> Self {
        self.cache = Some(cache);
        self
    }
    pub fn audit(mut self, audit: Arc<AuditLog>) -> Self {
        self.audit = Some(audit);
        self
    }
    pub fn ledger(mut self, ledger: Arc<dyn LedgerGateway>) -> Self {
        self.ledger = Some(ledger);
        self
    }
    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }
    pub fn table(mut self, table: TransitionTable) -> Self {
        self.table = Some(table);
        self
    }

    /// Fill anything not given explicitly. With `data_dir` set, the record
    /// store and audit trail share one sled database there, otherwise both
    /// stay in memory.
    pub fn build(self) -> Result<BolService, WorkflowError> {
        let table = self.table.unwrap_or_default();
        table.validate()?;

        let (store, audit) = match (self.store, self.audit, &self.config.data_dir) {
            (Some(store), Some(audit), _) => (store, audit),
            (store, audit, Some(dir)) => {
                let db = Arc::new(sled::open(dir).map_err(StoreError::from)?);
                let store = match store {
                    Some(store) => store,
                    None => Arc::new(SledBolStore::new(db.clone())?) as Arc<dyn BolStore>,
                };
                let audit = match audit {
                    Some(audit) => audit,
                    None => Arc::new(AuditLog::new(Arc::new(SledAuditStore::new(&db)?))?),
                };
                (store, audit)
            }
            (store, audit, None) => (
                store.unwrap_or_else(|| Arc::new(MemoryBolStore::new()) as Arc<dyn BolStore>),
                match audit {
                    Some(audit) => audit,
                    None => Arc::new(AuditLog::new(Arc::new(MemoryAuditStore::new()))?),
                },
            ),
        };

        let cache = self
            .cache
            .unwrap_or_else(|| Arc::new(MemoryCache::new()) as Arc<dyn Cache>);
        let ledger = self
            .ledger
            .unwrap_or_else(|| Arc::new(InProcessLedger::new()) as Arc<dyn LedgerGateway>);
        let notifier = self
            .notifier
            .unwrap_or_else(|| Arc::new(LogNotifier) as Arc<dyn Notifier>);
        let sync = Arc::new(LedgerSyncAdapter::new(
            ledger.clone(),
            store.clone(),
            table.clone(),
            self.config.ledger_timeout(),
        ));

        Ok(BolService {
            store,
            cache,
            audit,
            ledger,
            sync,
            notifier,
            table: Arc::new(table),
            wake: Arc::new(Notify::new()),
            settings: Settings::from(&self.config),
        })
    }
}

/// Cheap to clone, every collaborator is shared.
#[derive(Clone)]
pub struct BolService {
    store: Arc<dyn BolStore>,
    cache: Arc<dyn Cache>,
    audit: Arc<AuditLog>,
    ledger: Arc<dyn LedgerGateway>,
    sync: Arc<LedgerSyncAdapter>,
    notifier: Arc<dyn Notifier>,
    table: Arc<TransitionTable>,
    wake: Arc<Notify>,
    settings: Settings,
}

impl BolService {
    pub fn builder() -> BolServiceBuilder {
        BolServiceBuilder::default()
    }

    /// Worker that delivers this service's outbox. Woken after every commit.
    pub fn outbox_worker(&self) -> OutboxWorker {
        OutboxWorker::new(
            self.store.clone(),
            self.sync.clone(),
            self.notifier.clone(),
            self.cache.clone(),
            self.wake.clone(),
            self.settings.outbox,
        )
    }

    pub fn transition_table(&self) -> &TransitionTable {
        &self.table
    }

    /// Draft a new bill. It starts `pending` at version 1.
    #[instrument(skip(self, draft, actor), fields(actor = %actor.id))]
    pub fn create_bol(
        &self,
        draft: BolDraft,
        actor: &Actor,
    ) -> Result<BillOfLading, WorkflowError> {
        if !self.table.has_authority(&actor.roles, BolStatus::Pending) {
            return Err(WorkflowError::InsufficientPermission(format!(
                "creating a bill of lading needs one of {:?}",
                self.table.required_roles(BolStatus::Pending)
            )));
        }

        let sequence = self.store.next_sequence()?;
        let bol = draft.finalise(sequence, &actor.id, TimeStamp::new())?;
        self.store.insert(&bol)?;
        self.cache.invalidate_pattern(&cache::list_prefix(BOL_ENTITY));

        self.audit
            .log_event(
                NewAuditEvent::new("bol_created", BOL_ENTITY, &bol.number, &actor.id)
                    .description(format!("{} drafted", bol.number))
                    .meta("version", bol.version)
                    .meta("total_value_cents", bol.total_value_cents),
            )
            .map_err(|source| self.audit_failed(&bol, source))?;

        info!(bol_number = %bol.number, version = bol.version, "bill of lading created");
        Ok(bol)
    }

    /// Cache-through read of the detail view.
    pub fn get_bol(&self, bol_number: &str) -> Result<BillOfLading, WorkflowError> {
        let key = cache::detail_key(BOL_ENTITY, bol_number, "detail");
        if let Some(raw) = self.cache.get(&key) {
            match utils::from_cbor::<BillOfLading>(&raw) {
                Ok(bol) => return Ok(bol),
                Err(err) => debug!(key, error = %err, "discarding undecodable cache entry"),
            }
        }

        let bol = self
            .store
            .get(bol_number)?
            .ok_or_else(|| WorkflowError::NotFound(bol_number.to_string()))?;
        if let Ok(raw) = utils::to_cbor(&bol) {
            self.cache.set(&key, raw, self.settings.cache_ttl);
        }
        Ok(bol)
    }

    /// Bills visible to `actor`, admins see everything, everyone else only
    /// the bills they are a party to.
    pub fn list_bols(
        &self,
        actor: &Actor,
        filter: &ListFilter,
    ) -> Result<Vec<BillOfLading>, WorkflowError> {
        let key = cache::list_key(BOL_ENTITY, &actor.id, &filter.cache_fields());
        if let Some(raw) = self.cache.get(&key) {
            if let Ok(bols) = utils::from_cbor::<Vec<BillOfLading>>(&raw) {
                return Ok(bols);
            }
        }

        let bols: Vec<BillOfLading> = self
            .store
            .list()?
            .into_iter()
            .filter(|bol| actor.is_admin() || bol.is_party(&actor.id))
            .filter(|bol| filter.accepts(bol))
            .take(filter.limit.unwrap_or(usize::MAX))
            .collect();
        if let Ok(raw) = utils::to_cbor(&bols) {
            self.cache.set(&key, raw, self.settings.cache_ttl);
        }
        Ok(bols)
    }

    #[instrument(
        skip(self, update),
        fields(
            bol_number = %update.bol_number,
            status = %update.status,
            actor = %update.actor.id
        )
    )]
    pub fn update_status(
        &self,
        update: StatusUpdate,
    ) -> Result<StatusUpdateOutcome, WorkflowError> {
        let started = Instant::now();
        let mut performance = Performance::default();

        if !BillOfLading::is_valid_number(&update.bol_number) {
            return Err(ValidationError::MalformedNumber(update.bol_number).into());
        }
        let mut current = self.get_bol(&update.bol_number)?;
        if let Some(expected) = update.expected_version {
            if expected != current.version {
                // the cached copy may lag another writer, only the store decides
                self.purge(&update.bol_number);
                current = self.get_bol(&update.bol_number)?;
            }
            if expected != current.version {
                return Err(WorkflowError::VersionConflict {
                    bol_number: current.number,
                    expected,
                    actual: current.version,
                });
            }
        }
        performance.load = started.elapsed();

        let phase = Instant::now();
        let decision = self
            .table
            .authorize(&update.actor.roles, current.status, update.status);
        performance.authorize = phase.elapsed();
        if let Some(reason) = decision.reason {
            return Err(self.deny(&current, &update, reason));
        }

        let phase = Instant::now();
        let next = current.advanced(
            update.status,
            &update.actor.id,
            TransitionDetails {
                note: update.note.clone(),
                location: update.location.clone(),
                signature: update.signature.clone(),
            },
            TimeStamp::new(),
        );
        let mut intents = Vec::with_capacity(2);
        if update.status.is_on_ledger() {
            intents.push(OutboxIntent::new(
                IntentKind::LedgerSync,
                &next.number,
                update.status,
                &update.actor.id,
                update.note.clone(),
            ));
        }
        intents.push(OutboxIntent::new(
            IntentKind::Notify,
            &next.number,
            update.status,
            &update.actor.id,
            update.note.clone(),
        ));

        if let Err(err) = self.store.commit_transition(current.version, &next, intents) {
            // whatever we read is stale now
            self.purge(&current.number);
            return Err(err.into());
        }
        performance.commit = phase.elapsed();

        let phase = Instant::now();
        let purged = self.purge(&next.number);

        let override_used = update.actor.is_admin()
            && !self
                .table
                .has_authority(&without_admin(&update.actor.roles), update.status);
        let mut event =
            NewAuditEvent::new("status_changed", BOL_ENTITY, &next.number, &update.actor.id)
                .description(format!("{} -> {}", current.status, next.status))
                .severity(if override_used { Severity::Medium } else { Severity::Low })
                .metadata(update.metadata.clone())
                .meta("from", current.status)
                .meta("to", next.status)
                .meta("version", next.version);
        if let Some(location) = &update.location {
            event = event.meta("location", location);
        }
        if override_used {
            event = event.meta("admin_override", true);
        }
        self.audit
            .log_event(event)
            .map_err(|source| self.audit_failed(&next, source))?;

        self.wake.notify_one();
        performance.side_effects = phase.elapsed();
        performance.total = started.elapsed();

        info!(
            version = next.version,
            purged,
            elapsed_ms = performance.total.as_millis() as u64,
            "status updated"
        );
        Ok(StatusUpdateOutcome {
            bol: next,
            performance,
        })
    }

    /// Apply `updates` in order, each on its own and each bounded by the
    /// per-item timeout. One failing item never stops the rest. An item that
    /// times out may still commit in the background.
    #[instrument(skip(self, updates), fields(items = updates.len()))]
    pub async fn batch_update_status(
        &self,
        updates: Vec<StatusUpdate>,
    ) -> Result<BatchOutcome, WorkflowError> {
        if updates.len() > self.settings.batch_max_items {
            return Err(WorkflowError::BatchTooLarge {
                size: updates.len(),
                max: self.settings.batch_max_items,
            });
        }

        let mut outcome = BatchOutcome::default();
        for update in updates {
            let bol_number = update.bol_number.clone();
            let service = self.clone();
            let task = tokio::task::spawn_blocking(move || service.update_status(update));

            let result = match tokio::time::timeout(self.settings.batch_item_timeout, task).await {
                Ok(Ok(result)) => result,
                Ok(Err(join)) => Err(WorkflowError::Store(StoreError::Backend(format!(
                    "update task failed: {join}"
                )))),
                Err(_) => {
                    warn!(bol_number = %bol_number, "batch item timed out");
                    Err(WorkflowError::ItemTimeout(bol_number.clone()))
                }
            };

            match &result {
                Ok(_) => outcome.succeeded += 1,
                Err(err) => {
                    debug!(bol_number = %bol_number, kind = err.kind(), "batch item failed");
                    outcome.failed += 1;
                }
            }
            outcome.results.push(BatchItemResult { bol_number, result });
        }

        info!(
            succeeded = outcome.succeeded,
            failed = outcome.failed,
            "batch status update finished"
        );
        Ok(outcome)
    }

    pub fn valid_next_statuses(
        &self,
        current: BolStatus,
        roles: &BTreeSet<Role>,
    ) -> Vec<BolStatus> {
        self.table.valid_next(current, roles)
    }

    /// What `update_status` would decide, without touching anything.
    pub fn validate_status_transition(
        &self,
        current: BolStatus,
        requested: BolStatus,
        roles: &BTreeSet<Role>,
        metadata: &BTreeMap<String, String>,
    ) -> TransitionCheck {
        let decision = self.table.authorize(roles, current, requested);

        let mut warnings = Vec::new();
        if requested == BolStatus::Delivered && !metadata.contains_key("signature") {
            warnings.push("delivery without a consignee signature".to_string());
        }
        if matches!(requested, BolStatus::PickedUp | BolStatus::EnRoute)
            && !metadata.contains_key("location")
        {
            warnings.push(format!("{requested} without a location"));
        }

        TransitionCheck {
            allowed: decision.allowed,
            reason: decision.reason,
            required_roles: self.table.required_roles(requested),
            valid_next: self.table.valid_next(current, roles),
            warnings,
        }
    }

    pub fn status_history(&self, bol_number: &str) -> Result<Vec<StatusChange>, WorkflowError> {
        Ok(self.get_bol(bol_number)?.history)
    }

    /// Every version the ledger holds for this bill, oldest first.
    pub async fn ledger_history(
        &self,
        bol_number: &str,
    ) -> Result<Vec<LedgerHistoryEntry>, WorkflowError> {
        Ok(self.ledger.get_history(bol_number).await?)
    }

    pub fn audit_history(
        &self,
        actor: &Actor,
        bol_number: &str,
        page: Page,
    ) -> Result<Vec<AuditEvent>, WorkflowError> {
        self.require_admin(actor, "audit history")?;
        Ok(self.audit.history(BOL_ENTITY, bol_number, page)?)
    }

    pub fn audit_search(
        &self,
        actor: &Actor,
        term: &str,
        filter: &SearchFilter,
    ) -> Result<Vec<AuditEvent>, WorkflowError> {
        self.require_admin(actor, "audit search")?;
        Ok(self.audit.search(term, filter)?)
    }

    pub fn compliance_report(
        &self,
        actor: &Actor,
        start: TimeStamp<Utc>,
        end: TimeStamp<Utc>,
        bol_number: Option<&str>,
    ) -> Result<ComplianceReport, WorkflowError> {
        self.require_admin(actor, "compliance reports")?;
        Ok(self.audit.compliance_report(start, end, bol_number, &actor.id)?)
    }

    pub fn sync_metrics(&self) -> SyncMetricsSnapshot {
        self.sync.metrics()
    }

    fn purge(&self, bol_number: &str) -> usize {
        self.cache
            .invalidate_pattern(&cache::entity_prefix(BOL_ENTITY, bol_number))
            + self.cache.invalidate_pattern(&cache::list_prefix(BOL_ENTITY))
    }

    fn require_admin(&self, actor: &Actor, what: &str) -> Result<(), WorkflowError> {
        if actor.is_admin() {
            return Ok(());
        }
        Err(WorkflowError::InsufficientPermission(format!(
            "{what} is restricted to admin"
        )))
    }

    // record the refusal, nothing else is written
    fn deny(
        &self,
        current: &BillOfLading,
        update: &StatusUpdate,
        reason: DenialReason,
    ) -> WorkflowError {
        warn!(from = %current.status, reason = %reason, "status transition denied");

        let logged = self.audit.log_event(
            NewAuditEvent::new(
                "status_transition_denied",
                BOL_ENTITY,
                &current.number,
                &update.actor.id,
            )
            .description(reason.to_string())
            .severity(Severity::Medium)
            .meta("from", current.status)
            .meta("requested", update.status)
            .meta("version", current.version),
        );
        if let Err(err) = logged {
            error!(error = %err, "could not audit a denied transition");
        }

        match reason {
            DenialReason::MissingRole { .. } => {
                WorkflowError::InsufficientPermission(reason.to_string())
            }
            other => WorkflowError::InvalidTransition(other),
        }
    }

    fn audit_failed(&self, committed: &BillOfLading, source: AuditError) -> WorkflowError {
        error!(
            bol_number = %committed.number,
            version = committed.version,
            error = %source,
            "write committed but audit trail append failed"
        );
        WorkflowError::AuditTrail {
            bol_number: committed.number.clone(),
            version: committed.version,
            source,
        }
    }
}

fn without_admin(roles: &BTreeSet<Role>) -> BTreeSet<Role> {
    roles.iter().copied().filter(|role| *role != Role::Admin).collect()
}
