//! Append-only audit trail of application events.
//!
//! Independent of the ledger: this records what the application did (who
//! created, moved, was refused, asked for a report), not ledger transactions.
//! Events are hash chained, `hash_self = sha256(hash_prev || cbor(event))`
//! with `hash_self` blanked while hashing, so an edited or dropped event is
//! detected by [`AuditLog::verify_chain`]. There is no update or delete.
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, RwLock};

use chrono::Utc;
use tracing::{debug, error};
use uuid7::uuid7;

use super::bol::TimeStamp;
use super::utils::{self, CodecError};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum AuditError {
    #[error("audit store: {0}")]
    Backend(String),
    #[error(transparent)]
    Codec(#[from] CodecError),
}

impl From<sled::Error> for AuditError {
    fn from(err: sled::Error) -> Self {
        AuditError::Backend(err.to_string())
    }
}

#[derive(
    minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
pub enum Severity {
    #[n(0)]
    Low,
    #[n(1)]
    Medium,
    #[n(2)]
    High,
    #[n(3)]
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        })
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct AuditEvent {
    #[n(0)]
    pub seq: u64,
    #[n(1)]
    pub id: String, // uuid7
    #[n(2)]
    pub event_type: String,
    #[n(3)]
    pub entity_type: String,
    #[n(4)]
    pub entity_id: String,
    #[n(5)]
    pub actor: String,
    #[n(6)]
    pub description: String,
    #[n(7)]
    pub severity: Severity,
    #[n(8)]
    pub metadata: BTreeMap<String, String>,
    #[n(9)]
    pub timestamp: TimeStamp<Utc>,
    #[n(10)]
    pub hash_prev: Option<String>,
    #[n(11)]
    pub hash_self: String,
}

impl AuditEvent {
    fn compute_hash(&self) -> Result<String, CodecError> {
        let mut unsealed = self.clone();
        unsealed.hash_self = String::new();
        let cbor = utils::to_cbor(&unsealed)?;
        Ok(utils::chain_hash(self.hash_prev.as_deref(), &cbor))
    }

    fn matches(&self, needle: &str) -> bool {
        [
            &self.event_type,
            &self.entity_id,
            &self.actor,
            &self.description,
        ]
        .into_iter()
        .chain(self.metadata.values())
        .any(|field| field.to_lowercase().contains(needle))
    }
}

/// Event as the caller describes it, the log fills in id, sequence and hashes.
#[derive(Debug, Clone)]
pub struct NewAuditEvent {
    event_type: String,
    entity_type: String,
    entity_id: String,
    actor: String,
    description: String,
    severity: Severity,
    metadata: BTreeMap<String, String>,
    timestamp: Option<TimeStamp<Utc>>,
}

impl NewAuditEvent {
    pub fn new(
        event_type: impl Into<String>,
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        actor: impl Into<String>,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
            actor: actor.into(),
            description: String::new(),
            severity: Severity::Low,
            metadata: BTreeMap::new(),
            timestamp: None,
        }
    }
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
    pub fn severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }
    pub fn meta(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.metadata.insert(key.into(), value.to_string());
        self
    }
    pub fn metadata(mut self, metadata: BTreeMap<String, String>) -> Self {
        self.metadata.extend(metadata);
        self
    }
    #[cfg(test)]
    pub(crate) fn at(mut self, timestamp: TimeStamp<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }
}

pub trait AuditStore: Send + Sync {
    fn append(&self, event: &AuditEvent) -> Result<(), AuditError>;
    /// All events in append order.
    fn events(&self) -> Result<Vec<AuditEvent>, AuditError>;
    fn last(&self) -> Result<Option<AuditEvent>, AuditError>;
}

#[derive(Debug, Default)]
pub struct MemoryAuditStore {
    events: RwLock<Vec<AuditEvent>>,
}

impl MemoryAuditStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AuditStore for MemoryAuditStore {
    fn append(&self, event: &AuditEvent) -> Result<(), AuditError> {
        self.events
            .write()
            .map_err(|_| AuditError::Backend("audit store lock poisoned".into()))?
            .push(event.clone());
        Ok(())
    }

    fn events(&self) -> Result<Vec<AuditEvent>, AuditError> {
        Ok(self
            .events
            .read()
            .map_err(|_| AuditError::Backend("audit store lock poisoned".into()))?
            .clone())
    }

    fn last(&self) -> Result<Option<AuditEvent>, AuditError> {
        Ok(self
            .events
            .read()
            .map_err(|_| AuditError::Backend("audit store lock poisoned".into()))?
            .last()
            .cloned())
    }
}

/// Audit events in their own sled tree keyed by big endian sequence.
#[derive(Debug, Clone)]
pub struct SledAuditStore {
    tree: sled::Tree,
}

impl SledAuditStore {
    pub fn new(instance: &sled::Db) -> Result<Self, AuditError> {
        Ok(Self {
            tree: instance.open_tree("audit")?,
        })
    }
}

impl AuditStore for SledAuditStore {
    fn append(&self, event: &AuditEvent) -> Result<(), AuditError> {
        let cbor = utils::to_cbor(event)?;
        self.tree
            .compare_and_swap(event.seq.to_be_bytes(), None::<&[u8]>, Some(cbor))?
            .map_err(|_| AuditError::Backend(format!("audit sequence {} already used", event.seq)))
    }

    fn events(&self) -> Result<Vec<AuditEvent>, AuditError> {
        self.tree
            .iter()
            .values()
            .map(|raw| -> Result<AuditEvent, AuditError> { Ok(utils::from_cbor(&raw?)?) })
            .collect()
    }

    fn last(&self) -> Result<Option<AuditEvent>, AuditError> {
        match self.tree.last()? {
            Some((_, raw)) => Ok(Some(utils::from_cbor(&raw)?)),
            None => Ok(None),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub limit: usize,
    pub offset: usize,
}

impl Default for Page {
    fn default() -> Self {
        Self {
            limit: 50,
            offset: 0,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SearchFilter {
    pub event_type: Option<String>,
    pub entity_type: Option<String>,
    pub actor: Option<String>,
    pub min_severity: Option<Severity>,
    pub from: Option<TimeStamp<Utc>>,
    pub to: Option<TimeStamp<Utc>>,
    pub limit: Option<usize>,
}

impl SearchFilter {
    fn accepts(&self, event: &AuditEvent) -> bool {
        self.event_type.as_ref().is_none_or(|t| *t == event.event_type)
            && self.entity_type.as_ref().is_none_or(|t| *t == event.entity_type)
            && self.actor.as_ref().is_none_or(|a| *a == event.actor)
            && self.min_severity.is_none_or(|s| event.severity >= s)
            && self.from.as_ref().is_none_or(|from| event.timestamp >= *from)
            && self.to.as_ref().is_none_or(|to| event.timestamp < *to)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainVerdict {
    Intact { events: usize },
    Broken { seq: u64, reason: String },
}

impl ChainVerdict {
    pub fn is_intact(&self) -> bool {
        matches!(self, ChainVerdict::Intact { .. })
    }
}

#[derive(Debug, Clone)]
pub struct ComplianceReport {
    pub start: TimeStamp<Utc>,
    pub end: TimeStamp<Utc>,
    pub entity_id: Option<String>,
    pub total_events: usize,
    pub by_severity: BTreeMap<Severity, usize>,
    pub by_event_type: BTreeMap<String, usize>,
    pub by_actor: BTreeMap<String, usize>,
    /// High and critical events in the window, oldest first.
    pub flagged: Vec<AuditEvent>,
    pub chain: ChainVerdict,
    pub generated_at: TimeStamp<Utc>,
}

#[derive(Debug, Default)]
struct ChainHead {
    seq: u64,
    last_hash: Option<String>,
    last_at: Option<TimeStamp<Utc>>,
}

pub struct AuditLog {
    store: Arc<dyn AuditStore>,
    head: Mutex<ChainHead>,
}

impl AuditLog {
    /// Resume the chain from whatever the store already holds.
    pub fn new(store: Arc<dyn AuditStore>) -> Result<Self, AuditError> {
        let head = match store.last()? {
            Some(last) => ChainHead {
                seq: last.seq,
                last_hash: Some(last.hash_self),
                last_at: Some(last.timestamp),
            },
            None => ChainHead::default(),
        };
        Ok(Self {
            store,
            head: Mutex::new(head),
        })
    }

    pub fn in_memory() -> Self {
        Self {
            store: Arc::new(MemoryAuditStore::new()),
            head: Mutex::new(ChainHead::default()),
        }
    }

    pub fn log_event(&self, new: NewAuditEvent) -> Result<AuditEvent, AuditError> {
        let mut head = self
            .head
            .lock()
            .map_err(|_| AuditError::Backend("audit chain lock poisoned".into()))?;

        // timestamps never run backwards along the chain
        let stamped = new.timestamp.unwrap_or_default();
        let timestamp = match &head.last_at {
            Some(last) if stamped < *last => last.clone(),
            _ => stamped,
        };

        let mut event = AuditEvent {
            seq: head.seq + 1,
            id: uuid7().to_string(),
            event_type: new.event_type,
            entity_type: new.entity_type,
            entity_id: new.entity_id,
            actor: new.actor,
            description: new.description,
            severity: new.severity,
            metadata: new.metadata,
            timestamp,
            hash_prev: head.last_hash.clone(),
            hash_self: String::new(),
        };
        event.hash_self = event.compute_hash()?;

        if let Err(err) = self.store.append(&event) {
            error!(
                event_type = %event.event_type,
                entity_id = %event.entity_id,
                error = %err,
                "audit append failed, compliance trail is broken"
            );
            return Err(err);
        }

        head.seq = event.seq;
        head.last_hash = Some(event.hash_self.clone());
        head.last_at = Some(event.timestamp.clone());
        debug!(seq = event.seq, event_type = %event.event_type, "audit event appended");
        Ok(event)
    }

    /// Events for one entity, newest first.
    pub fn history(
        &self,
        entity_type: &str,
        entity_id: &str,
        page: Page,
    ) -> Result<Vec<AuditEvent>, AuditError> {
        Ok(self
            .store
            .events()?
            .into_iter()
            .rev()
            .filter(|event| event.entity_type == entity_type && event.entity_id == entity_id)
            .skip(page.offset)
            .take(page.limit)
            .collect())
    }

    /// Case-insensitive match over type, entity, actor, description and
    /// metadata values, newest first. An empty term matches everything.
    pub fn search(&self, term: &str, filter: &SearchFilter) -> Result<Vec<AuditEvent>, AuditError> {
        let needle = term.trim().to_lowercase();
        Ok(self
            .store
            .events()?
            .into_iter()
            .rev()
            .filter(|event| filter.accepts(event))
            .filter(|event| needle.is_empty() || event.matches(&needle))
            .take(filter.limit.unwrap_or(usize::MAX))
            .collect())
    }

    pub fn verify_chain(&self) -> Result<ChainVerdict, AuditError> {
        let events = self.store.events()?;
        let mut prev: Option<String> = None;
        for event in &events {
            if event.hash_prev != prev {
                return Ok(ChainVerdict::Broken {
                    seq: event.seq,
                    reason: format!(
                        "hash_prev mismatch: expected {:?}, got {:?}",
                        prev, event.hash_prev
                    ),
                });
            }
            let recomputed = event.compute_hash()?;
            if recomputed != event.hash_self {
                return Ok(ChainVerdict::Broken {
                    seq: event.seq,
                    reason: "hash_self does not match event contents".into(),
                });
            }
            prev = Some(event.hash_self.clone());
        }
        Ok(ChainVerdict::Intact {
            events: events.len(),
        })
    }

    /// Aggregate events committed in `[start, end)`, optionally for one
    /// entity. Producing the report is itself logged.
    pub fn compliance_report(
        &self,
        start: TimeStamp<Utc>,
        end: TimeStamp<Utc>,
        entity_id: Option<&str>,
        requested_by: &str,
    ) -> Result<ComplianceReport, AuditError> {
        let in_window: Vec<AuditEvent> = self
            .store
            .events()?
            .into_iter()
            .filter(|event| event.timestamp >= start && event.timestamp < end)
            .filter(|event| entity_id.is_none_or(|id| event.entity_id == id))
            .collect();

        let mut by_severity = BTreeMap::new();
        let mut by_event_type = BTreeMap::new();
        let mut by_actor = BTreeMap::new();
        for event in &in_window {
            *by_severity.entry(event.severity).or_insert(0) += 1;
            *by_event_type.entry(event.event_type.clone()).or_insert(0) += 1;
            *by_actor.entry(event.actor.clone()).or_insert(0) += 1;
        }
        let flagged = in_window
            .iter()
            .filter(|event| event.severity >= Severity::High)
            .cloned()
            .collect();

        let report = ComplianceReport {
            start,
            end,
            entity_id: entity_id.map(str::to_string),
            total_events: in_window.len(),
            by_severity,
            by_event_type,
            by_actor,
            flagged,
            chain: self.verify_chain()?,
            generated_at: TimeStamp::new(),
        };

        self.log_event(
            NewAuditEvent::new(
                "compliance_report_generated",
                "audit",
                entity_id.unwrap_or("*"),
                requested_by,
            )
            .description(format!(
                "compliance report over {} events",
                report.total_events
            ))
            .severity(Severity::Medium)
            .meta("start", report.start.to_datetime_utc().to_rfc3339())
            .meta("end", report.end.to_datetime_utc().to_rfc3339())
            .meta("total_events", report.total_events)
            .meta("chain_intact", report.chain.is_intact()),
        )?;

        Ok(report)
    }
}
