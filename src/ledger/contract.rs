//! Ledger contract: the authoritative store for approved bills.
//!
//! The contract validates everything it is given on its own terms. It knows
//! the lifecycle only as a literal table over status strings and never asks
//! the operational side whether a move is legal.
use std::collections::BTreeMap;

use chrono::Utc;
use tracing::{debug, warn};

use super::{
    LedgerBolInput, LedgerError, LedgerHistoryEntry, LedgerPage, LedgerReceipt, LedgerRecord,
    LedgerStatusChange,
};
use crate::bol::TimeStamp;
use crate::utils;

const STATUSES: [&str; 9] = [
    "pending",
    "approved",
    "assigned",
    "accepted",
    "picked_up",
    "en_route",
    "delivered",
    "unpaid",
    "paid",
];

/// The one status a record in `current` may move to.
pub fn allowed_next(current: &str) -> Option<&'static str> {
    match current {
        "pending" => Some("approved"),
        "approved" => Some("assigned"),
        "assigned" => Some("accepted"),
        "accepted" => Some("picked_up"),
        "picked_up" => Some("en_route"),
        "en_route" => Some("delivered"),
        "delivered" => Some("unpaid"),
        "unpaid" => Some("paid"),
        _ => None,
    }
}

pub fn is_known_status(status: &str) -> bool {
    STATUSES.contains(&status)
}

// BOL-YYYY-NNNNNN, the sequence may grow past six digits
fn valid_bol_number(number: &str) -> bool {
    let Some(rest) = number.strip_prefix("BOL-") else {
        return false;
    };
    let Some((year, sequence)) = rest.split_once('-') else {
        return false;
    };
    year.len() == 4
        && sequence.len() >= 6
        && year.bytes().all(|b| b.is_ascii_digit())
        && sequence.bytes().all(|b| b.is_ascii_digit())
}

#[derive(Debug, Default)]
pub struct LedgerContract {
    world: BTreeMap<String, LedgerRecord>,
    history: BTreeMap<String, Vec<LedgerHistoryEntry>>,
    // commit order across all keys: (key, index into its history)
    log: Vec<(String, usize)>,
    last_tx: Option<String>,
}

impl LedgerContract {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_approved_bol(
        &mut self,
        input: LedgerBolInput,
        doc_ref: String,
        actor: &str,
        note: Option<&str>,
    ) -> Result<LedgerReceipt, LedgerError> {
        if !valid_bol_number(&input.bol_number) {
            return Err(LedgerError::InvalidBolNumber(input.bol_number));
        }
        if input.cargo.is_empty() {
            return Err(LedgerError::MissingCargo);
        }
        if self.world.contains_key(&input.bol_number) {
            return Err(LedgerError::AlreadyExists(input.bol_number));
        }

        let now = TimeStamp::new();
        let record = LedgerRecord {
            bol_number: input.bol_number,
            status: "approved".to_string(),
            shipper: input.shipper,
            consignee: input.consignee,
            carrier: input.carrier,
            broker: input.broker,
            cargo: input.cargo,
            total_weight_kg: input.total_weight_kg,
            total_value_cents: input.total_value_cents,
            charges: input.charges,
            pickup_date: input.pickup_date,
            delivery_date: input.delivery_date,
            notes: input.notes,
            created_by: input.created_by,
            version: 1,
            doc_ref,
            approved_at: now.clone(),
            updated_at: now.clone(),
            status_history: vec![LedgerStatusChange {
                status: "approved".to_string(),
                changed_by: actor.to_string(),
                timestamp: now,
                note: note.map(str::to_string),
            }],
        };
        self.commit(record)
    }

    pub fn update_status(
        &mut self,
        bol_number: &str,
        status: &str,
        actor: &str,
        note: Option<&str>,
        doc_ref: Option<String>,
    ) -> Result<LedgerReceipt, LedgerError> {
        if !is_known_status(status) {
            return Err(LedgerError::InvalidStatus(status.to_string()));
        }
        let current = self
            .world
            .get(bol_number)
            .ok_or_else(|| LedgerError::NotFound(bol_number.to_string()))?;
        if allowed_next(&current.status) != Some(status) {
            warn!(bol_number, from = %current.status, to = status, "ledger refused transition");
            return Err(LedgerError::InvalidTransition {
                from: current.status.clone(),
                to: status.to_string(),
            });
        }

        let now = TimeStamp::new();
        let mut next = current.clone();
        next.status = status.to_string();
        next.version += 1;
        next.updated_at = now.clone();
        if let Some(doc_ref) = doc_ref {
            next.doc_ref = doc_ref;
        }
        next.status_history.push(LedgerStatusChange {
            status: status.to_string(),
            changed_by: actor.to_string(),
            timestamp: now,
            note: note.map(str::to_string),
        });
        self.commit(next)
    }

    pub fn get(&self, bol_number: &str) -> Result<LedgerRecord, LedgerError> {
        self.world
            .get(bol_number)
            .cloned()
            .ok_or_else(|| LedgerError::NotFound(bol_number.to_string()))
    }

    /// Every committed version of a key, oldest first.
    pub fn get_history(&self, bol_number: &str) -> Result<Vec<LedgerHistoryEntry>, LedgerError> {
        self.history
            .get(bol_number)
            .cloned()
            .ok_or_else(|| LedgerError::NotFound(bol_number.to_string()))
    }

    pub fn query_by_status(&self, status: &str) -> Result<Vec<LedgerRecord>, LedgerError> {
        if !is_known_status(status) {
            return Err(LedgerError::InvalidStatus(status.to_string()));
        }
        Ok(self.select(|record| record.status == status))
    }

    pub fn query_by_carrier(&self, carrier_id: &str) -> Vec<LedgerRecord> {
        self.select(|record| record.carrier.contact_id == carrier_id)
    }

    /// Records approved in `[start, end)`.
    pub fn query_by_date_range(
        &self,
        start: &TimeStamp<Utc>,
        end: &TimeStamp<Utc>,
    ) -> Vec<LedgerRecord> {
        self.select(|record| record.approved_at >= *start && record.approved_at < *end)
    }

    /// Key ordered pages. `bookmark` is the last key of the previous page.
    pub fn list_all(&self, page_size: usize, bookmark: Option<&str>) -> LedgerPage {
        use std::ops::Bound;

        let lower = match bookmark {
            Some(key) => Bound::Excluded(key.to_string()),
            None => Bound::Unbounded,
        };
        let mut remaining = self.world.range((lower, Bound::Unbounded));
        let records: Vec<LedgerRecord> = remaining
            .by_ref()
            .take(page_size.max(1))
            .map(|(_, record)| record.clone())
            .collect();
        let bookmark = match remaining.next() {
            Some(_) => records.last().map(|record| record.bol_number.clone()),
            None => None,
        };
        LedgerPage { records, bookmark }
    }

    /// Recompute every transaction id from the stored records.
    pub fn verify_chain(&self) -> Result<bool, LedgerError> {
        let mut prev: Option<&str> = None;
        for (key, index) in &self.log {
            let Some(entry) = self.history.get(key).and_then(|entries| entries.get(*index)) else {
                return Ok(false);
            };
            let payload = utils::to_cbor(&entry.record)?;
            if utils::chain_hash(prev, &payload) != entry.tx_id {
                warn!(bol_number = %key, tx_id = %entry.tx_id, "ledger chain mismatch");
                return Ok(false);
            }
            prev = Some(entry.tx_id.as_str());
        }
        Ok(true)
    }

    fn select(&self, keep: impl Fn(&LedgerRecord) -> bool) -> Vec<LedgerRecord> {
        self.world.values().filter(|record| keep(record)).cloned().collect()
    }

    fn commit(&mut self, record: LedgerRecord) -> Result<LedgerReceipt, LedgerError> {
        let payload = utils::to_cbor(&record)?;
        let tx_id = utils::chain_hash(self.last_tx.as_deref(), &payload);
        let receipt = LedgerReceipt {
            tx_id: tx_id.clone(),
            version: record.version,
            status: record.status.clone(),
            timestamp: record.updated_at.clone(),
        };

        let key = record.bol_number.clone();
        let entries = self.history.entry(key.clone()).or_default();
        entries.push(LedgerHistoryEntry {
            tx_id: tx_id.clone(),
            timestamp: record.updated_at.clone(),
            is_delete: false,
            record: record.clone(),
        });
        self.log.push((key.clone(), entries.len() - 1));
        self.world.insert(key.clone(), record);
        self.last_tx = Some(tx_id);

        debug!(
            bol_number = %key,
            version = receipt.version,
            status = %receipt.status,
            "ledger commit"
        );
        Ok(receipt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bol::{CargoItem, Party};

    fn input(number: &str) -> LedgerBolInput {
        LedgerBolInput {
            bol_number: number.to_string(),
            shipper: Party::new("contact_s", "Shipper"),
            consignee: Party::new("contact_c", "Consignee"),
            carrier: Party::new("contact_k", "Carrier"),
            broker: None,
            cargo: vec![CargoItem::new("Crates", 3, 90, 45_000)],
            total_weight_kg: 90,
            total_value_cents: 45_000,
            charges: Default::default(),
            pickup_date: None,
            delivery_date: None,
            notes: None,
            created_by: "user_s".to_string(),
        }
    }

    #[test]
    fn create_then_get_is_version_one() {
        let mut ledger = LedgerContract::new();
        ledger
            .create_approved_bol(input("BOL-2026-000001"), "doc".into(), "user_s", None)
            .unwrap();

        let record = ledger.get("BOL-2026-000001").unwrap();
        assert_eq!(record.version, 1);
        assert_eq!(record.status, "approved");
        assert_eq!(record.status_history.len(), 1);
        assert_eq!(ledger.get_history("BOL-2026-000001").unwrap().len(), 1);
    }

    #[test]
    fn create_validates_input() {
        let mut ledger = LedgerContract::new();
        assert_eq!(
            ledger.create_approved_bol(input("BOL-26-1"), "doc".into(), "u", None),
            Err(LedgerError::InvalidBolNumber("BOL-26-1".into()))
        );

        let mut empty = input("BOL-2026-000002");
        empty.cargo.clear();
        assert_eq!(
            ledger.create_approved_bol(empty, "doc".into(), "u", None),
            Err(LedgerError::MissingCargo)
        );

        ledger
            .create_approved_bol(input("BOL-2026-000003"), "doc".into(), "u", None)
            .unwrap();
        assert!(matches!(
            ledger.create_approved_bol(input("BOL-2026-000003"), "doc".into(), "u", None),
            Err(LedgerError::AlreadyExists(_))
        ));
    }

    #[test]
    fn update_follows_the_local_table() {
        let mut ledger = LedgerContract::new();
        ledger
            .create_approved_bol(input("BOL-2026-000001"), "doc".into(), "u", None)
            .unwrap();

        let skip = ledger.update_status("BOL-2026-000001", "accepted", "u", None, None);
        assert!(matches!(skip, Err(LedgerError::InvalidTransition { .. })));

        let unknown = ledger.update_status("BOL-2026-000001", "lost", "u", None, None);
        assert_eq!(unknown, Err(LedgerError::InvalidStatus("lost".into())));

        let receipt = ledger
            .update_status("BOL-2026-000001", "assigned", "u", Some("truck 7"), None)
            .unwrap();
        assert_eq!(receipt.version, 2);

        let versions: Vec<u64> = ledger
            .get_history("BOL-2026-000001")
            .unwrap()
            .iter()
            .map(|entry| entry.record.version)
            .collect();
        assert_eq!(versions, vec![1, 2]);
    }

    #[test]
    fn list_all_pages_by_key() {
        let mut ledger = LedgerContract::new();
        for seq in 1..=5 {
            let number = format!("BOL-2026-{seq:06}");
            ledger.create_approved_bol(input(&number), "doc".into(), "u", None).unwrap();
        }

        let first = ledger.list_all(2, None);
        assert_eq!(first.records.len(), 2);
        let second = ledger.list_all(2, first.bookmark.as_deref());
        assert_eq!(second.records[0].bol_number, "BOL-2026-000003");
        let last = ledger.list_all(2, second.bookmark.as_deref());
        assert_eq!(last.records.len(), 1);
        assert_eq!(last.bookmark, None);
    }

    #[test]
    fn tampering_breaks_the_chain() {
        let mut ledger = LedgerContract::new();
        ledger
            .create_approved_bol(input("BOL-2026-000001"), "doc".into(), "u", None)
            .unwrap();
        ledger
            .update_status("BOL-2026-000001", "assigned", "u", None, None)
            .unwrap();
        assert!(ledger.verify_chain().unwrap());

        if let Some(entries) = ledger.history.get_mut("BOL-2026-000001") {
            entries[0].record.total_value_cents = 1;
        }
        assert!(!ledger.verify_chain().unwrap());
    }
}
