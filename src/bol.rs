//! Core bill of lading record, its parties, cargo and status history
use super::error::ValidationError;
use super::status::BolStatus;
use super::utils::{self, CodecError};
use std::cmp::Ordering;

use chrono::{DateTime, Datelike, TimeZone, Utc};

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct TimeStamp<T: TimeZone>(DateTime<T>);

impl TimeStamp<Utc> {
    pub fn new() -> Self {
        Self(Utc::now())
    }
    pub fn new_with(year: i32, month: u32, day: u32, hour: u32, min: u32, sec: u32) -> Self {
        Utc.with_ymd_and_hms(year, month, day, hour, min, sec)
            .single()
            .unwrap_or_default()
            .into()
    }
    pub fn to_datetime_utc(&self) -> DateTime<Utc> {
        self.0
    }
}

// chrono's `Utc` is not itself ordered, so a derive would never apply
impl PartialOrd for TimeStamp<Utc> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimeStamp<Utc> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}

impl Default for TimeStamp<Utc> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: TimeZone> From<DateTime<T>> for TimeStamp<T> {
    fn from(value: DateTime<T>) -> Self {
        TimeStamp(value)
    }
}

impl<C> minicbor::Encode<C> for TimeStamp<Utc> {
    fn encode<W: minicbor::encode::Write>(
        &self,
        e: &mut minicbor::Encoder<W>,
        _: &mut C,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        if let Some(nsec) = self.0.timestamp_nanos_opt() {
            return e.i64(nsec)?.ok();
        }

        Err(minicbor::encode::Error::message(
            "failed to encode timestamp. timestamp_nanos_opt returned None",
        ))
    }
}

impl<'b, C> minicbor::Decode<'b, C> for TimeStamp<Utc> {
    fn decode(d: &mut minicbor::Decoder<'b>, _: &mut C) -> Result<Self, minicbor::decode::Error> {
        let nsecs = d.i64()?;

        Ok(TimeStamp(DateTime::from_timestamp_nanos(nsecs)))
    }
}

/// Contact snapshot taken when the bill is drafted. Later edits to the
/// contact do not flow into issued bills.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Default, PartialEq, Eq)]
pub struct Party {
    #[n(0)]
    pub contact_id: String, // bech32 encoded uuid7
    #[n(1)]
    pub name: String,
    #[n(2)]
    pub company: Option<String>,
    #[n(3)]
    pub address: Option<String>,
    #[n(4)]
    pub phone: Option<String>,
    #[n(5)]
    pub email: Option<String>,
}

impl Party {
    pub fn new(contact_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            contact_id: contact_id.into(),
            name: name.into(),
            ..Self::default()
        }
    }
    /// Snapshot with a freshly generated contact id.
    pub fn generate(name: impl Into<String>) -> anyhow::Result<Self> {
        Ok(Self::new(utils::new_uuid_to_bech32("contact_")?, name))
    }
    pub fn with_company(mut self, company: impl Into<String>) -> Self {
        self.company = Some(company.into());
        self
    }
    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }
    pub fn with_phone(mut self, phone: impl Into<String>) -> Self {
        self.phone = Some(phone.into());
        self
    }
    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Dimensions {
    #[n(0)]
    pub length_cm: u32,
    #[n(1)]
    pub width_cm: u32,
    #[n(2)]
    pub height_cm: u32,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Default, PartialEq, Eq)]
pub struct CargoItem {
    #[n(0)]
    pub description: String,
    #[n(1)]
    pub quantity: u32,
    #[n(2)]
    pub weight_kg: u64, // line total
    #[n(3)]
    pub declared_value_cents: u64, // line total, integers for currency
    #[n(4)]
    pub dimensions: Option<Dimensions>,
}

impl CargoItem {
    pub fn new(
        description: impl Into<String>,
        quantity: u32,
        weight_kg: u64,
        value_cents: u64,
    ) -> Self {
        Self {
            description: description.into(),
            quantity,
            weight_kg,
            declared_value_cents: value_cents,
            dimensions: None,
        }
    }
    pub fn with_dimensions(mut self, length_cm: u32, width_cm: u32, height_cm: u32) -> Self {
        self.dimensions = Some(Dimensions {
            length_cm,
            width_cm,
            height_cm,
        });
        self
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Default, PartialEq, Eq)]
pub struct FreightCharges {
    #[n(0)]
    pub base_cents: u64,
    #[n(1)]
    pub fuel_surcharge_cents: u64,
    #[n(2)]
    pub accessorial_cents: u64,
    #[n(3)]
    pub insurance_cents: u64,
}

impl FreightCharges {
    pub fn checked_total_cents(&self) -> Option<u64> {
        checked_sum([
            self.base_cents,
            self.fuel_surcharge_cents,
            self.accessorial_cents,
            self.insurance_cents,
        ])
    }

    /// Saturates at `u64::MAX`. Validated drafts never get there.
    pub fn total_cents(&self) -> u64 {
        self.checked_total_cents().unwrap_or(u64::MAX)
    }
}

fn checked_sum(values: impl IntoIterator<Item = u64>) -> Option<u64> {
    values.into_iter().try_fold(0u64, u64::checked_add)
}

/// One accepted transition. Appended, never rewritten.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct StatusChange {
    #[n(0)]
    pub status: BolStatus,
    #[n(1)]
    pub changed_by: String,
    #[n(2)]
    pub timestamp: TimeStamp<Utc>,
    #[n(3)]
    pub ledger_tx_id: Option<String>,
    #[n(4)]
    pub note: Option<String>,
    #[n(5)]
    pub location: Option<String>,
    #[n(6)]
    pub signature: Option<String>,
}

/// What the operational copy knows about its ledger twin.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct LedgerCommit {
    #[n(0)]
    pub transaction_id: String,
    #[n(1)]
    pub ledger_version: u64,
    #[n(2)]
    pub ledger_status: BolStatus,
    #[n(3)]
    pub committed_at: TimeStamp<Utc>,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct BillOfLading {
    #[n(0)]
    pub number: String, // BOL-<year>-<sequence>
    #[n(1)]
    pub status: BolStatus,
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
    pub version: u64,
    #[n(14)]
    pub ledger: Option<LedgerCommit>,
    #[n(15)]
    pub history: Vec<StatusChange>,
    #[n(16)]
    pub created_by: String,
    #[n(17)]
    pub created_at: TimeStamp<Utc>,
    #[n(18)]
    pub updated_at: TimeStamp<Utc>,
}

/// Optional fields that ride along with a status change.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransitionDetails {
    pub note: Option<String>,
    pub location: Option<String>,
    pub signature: Option<String>,
}

impl BillOfLading {
    /// Human readable number, the sequence is zero padded to six digits.
    pub fn format_number(year: i32, sequence: u64) -> String {
        format!("BOL-{year:04}-{sequence:06}")
    }

    pub fn is_valid_number(number: &str) -> bool {
        let mut parts = number.split('-');
        match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some("BOL"), Some(year), Some(seq), None) => {
                year.len() == 4
                    && seq.len() >= 6
                    && year.bytes().all(|b| b.is_ascii_digit())
                    && seq.bytes().all(|b| b.is_ascii_digit())
            }
            _ => false,
        }
    }

    pub fn ledger_transaction_id(&self) -> Option<&str> {
        self.ledger.as_ref().map(|commit| commit.transaction_id.as_str())
    }

    /// The ledger has caught up with the operational copy.
    pub fn is_ledger_synced(&self) -> bool {
        match &self.ledger {
            Some(commit) => commit.ledger_status == self.status,
            None => !self.status.is_on_ledger(),
        }
    }

    pub fn parties(&self) -> impl Iterator<Item = &Party> {
        [&self.shipper, &self.consignee, &self.carrier]
            .into_iter()
            .chain(self.broker.as_ref())
    }

    pub fn is_party(&self, contact_id: &str) -> bool {
        self.parties().any(|party| party.contact_id == contact_id)
    }

    /// The successor record for an accepted transition. `self` is left as is,
    /// the caller commits the returned value with compare-and-increment.
    pub fn advanced(
        &self,
        status: BolStatus,
        changed_by: &str,
        details: TransitionDetails,
        at: TimeStamp<Utc>,
    ) -> BillOfLading {
        let mut next = self.clone();
        next.status = status;
        next.version = self.version + 1;
        next.updated_at = at.clone();
        next.history.push(StatusChange {
            status,
            changed_by: changed_by.to_string(),
            timestamp: at,
            ledger_tx_id: None,
            note: details.note,
            location: details.location,
            signature: details.signature,
        });
        next
    }

    /// Content hash of the document, used as the external document reference.
    pub fn document_hash(&self) -> Result<String, CodecError> {
        let document = BolDocument {
            number: &self.number,
            parties: self.parties().cloned().collect(),
            cargo: &self.cargo,
            charges: &self.charges,
            pickup_date: self.pickup_date.clone(),
            delivery_date: self.delivery_date.clone(),
            notes: self.notes.as_deref(),
        };
        Ok(utils::cbor_with_hash(&document)?.0)
    }
}

// the hashed portion of a bill, independent of workflow state
#[derive(minicbor::Encode)]
struct BolDocument<'a> {
    #[n(0)]
    number: &'a str,
    #[n(1)]
    parties: Vec<Party>,
    #[n(2)]
    cargo: &'a [CargoItem],
    #[n(3)]
    charges: &'a FreightCharges,
    #[n(4)]
    pickup_date: Option<TimeStamp<Utc>>,
    #[n(5)]
    delivery_date: Option<TimeStamp<Utc>>,
    #[n(6)]
    notes: Option<&'a str>,
}

/// Builder for a new bill, this becomes the basis for a `pending` record.
#[derive(Debug, Default, Clone)]
pub struct BolDraft {
    shipper: Option<Party>,
    consignee: Option<Party>,
    carrier: Option<Party>,
    broker: Option<Party>,
    cargo: Vec<CargoItem>,
    charges: FreightCharges,
    pickup_date: Option<TimeStamp<Utc>>,
    delivery_date: Option<TimeStamp<Utc>>,
    notes: Option<String>,
}

impl BolDraft {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn set_shipper(mut self, party: Party) -> Self {
        self.shipper = Some(party);
        self
    }
    pub fn set_consignee(mut self, party: Party) -> Self {
        self.consignee = Some(party);
        self
    }
    pub fn set_carrier(mut self, party: Party) -> Self {
        self.carrier = Some(party);
        self
    }
    pub fn set_broker(mut self, party: Party) -> Self {
        self.broker = Some(party);
        self
    }
    pub fn add_cargo(mut self, item: CargoItem) -> Self {
        self.cargo.push(item);
        self
    }
    pub fn set_charges(mut self, charges: FreightCharges) -> Self {
        self.charges = charges;
        self
    }
    pub fn set_pickup_date(mut self, date: TimeStamp<Utc>) -> Self {
        self.pickup_date = Some(date);
        self
    }
    pub fn set_delivery_date(mut self, date: TimeStamp<Utc>) -> Self {
        self.delivery_date = Some(date);
        self
    }
    pub fn set_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }

    /// `pickup <= delivery` when both are present.
    pub fn validate_dates(&self) -> bool {
        match (self.pickup_date.as_ref(), self.delivery_date.as_ref()) {
            (Some(pickup), Some(delivery)) => {
                pickup.to_datetime_utc() <= delivery.to_datetime_utc()
            }
            _ => true,
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        for (role, party) in [
            ("shipper", &self.shipper),
            ("consignee", &self.consignee),
            ("carrier", &self.carrier),
        ] {
            match party {
                None => return Err(ValidationError::MissingParty(role)),
                Some(p) if p.contact_id.trim().is_empty() => {
                    return Err(ValidationError::InvalidParty(role));
                }
                Some(_) => {}
            }
        }
        if let Some(broker) = &self.broker {
            if broker.contact_id.trim().is_empty() {
                return Err(ValidationError::InvalidParty("broker"));
            }
        }
        if self.cargo.is_empty() {
            return Err(ValidationError::NoCargo);
        }
        if let Some(index) = self
            .cargo
            .iter()
            .position(|item| item.quantity == 0 || item.weight_kg == 0)
        {
            return Err(ValidationError::InvalidCargo(index));
        }
        self.cargo_totals()?;
        if self.charges.checked_total_cents().is_none() {
            return Err(ValidationError::AmountOverflow("freight charges"));
        }
        if !self.validate_dates() {
            return Err(ValidationError::InvalidDates);
        }
        Ok(())
    }

    // (weight, declared value) over every cargo line
    fn cargo_totals(&self) -> Result<(u64, u64), ValidationError> {
        let weight = checked_sum(self.cargo.iter().map(|item| item.weight_kg))
            .ok_or(ValidationError::AmountOverflow("cargo weight"))?;
        let value = checked_sum(self.cargo.iter().map(|item| item.declared_value_cents))
            .ok_or(ValidationError::AmountOverflow("cargo value"))?;
        Ok((weight, value))
    }

    /// Validate and turn the draft into a `pending` bill at version 1.
    pub fn finalise(
        self,
        sequence: u64,
        created_by: &str,
        at: TimeStamp<Utc>,
    ) -> Result<BillOfLading, ValidationError> {
        self.validate()?;

        let number = BillOfLading::format_number(at.to_datetime_utc().year(), sequence);
        let (total_weight_kg, total_value_cents) = self.cargo_totals()?;

        // validate() guarantees the three mandatory parties
        let (Some(shipper), Some(consignee), Some(carrier)) =
            (self.shipper, self.consignee, self.carrier)
        else {
            return Err(ValidationError::MissingParty("shipper"));
        };

        Ok(BillOfLading {
            number,
            status: BolStatus::Pending,
            shipper,
            consignee,
            carrier,
            broker: self.broker,
            cargo: self.cargo,
            total_weight_kg,
            total_value_cents,
            charges: self.charges,
            pickup_date: self.pickup_date,
            delivery_date: self.delivery_date,
            notes: self.notes,
            version: 1,
            ledger: None,
            history: vec![StatusChange {
                status: BolStatus::Pending,
                changed_by: created_by.to_string(),
                timestamp: at.clone(),
                ledger_tx_id: None,
                note: None,
                location: None,
                signature: None,
            }],
            created_by: created_by.to_string(),
            created_at: at.clone(),
            updated_at: at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn draft() -> BolDraft {
        BolDraft::new()
            .set_shipper(Party::new("contact_shipper", "Acme Mills"))
            .set_consignee(Party::new("contact_consignee", "Harbor Retail"))
            .set_carrier(Party::new("contact_carrier", "Blue Line Freight"))
            .add_cargo(CargoItem::new("Cotton bales", 12, 2_400, 1_800_000))
            .add_cargo(CargoItem::new("Dye drums", 4, 800, 320_000).with_dimensions(60, 60, 90))
    }

    #[test]
    fn timestamp_encoding() {
        let original = TimeStamp::new();

        let encoding = minicbor::to_vec(original.clone()).unwrap();
        let decode: TimeStamp<Utc> = minicbor::decode(&encoding).unwrap();

        assert_eq!(original, decode);
    }

    #[test]
    fn finalise_computes_totals_and_pending_history() {
        let at = TimeStamp::new_with(2026, 3, 1, 9, 0, 0);
        let bol = draft().finalise(7, "user_1", at).unwrap();

        assert_eq!(bol.number, "BOL-2026-000007");
        assert_eq!(bol.status, BolStatus::Pending);
        assert_eq!(bol.version, 1);
        assert_eq!(bol.total_weight_kg, 3_200);
        assert_eq!(bol.total_value_cents, 2_120_000);
        assert_eq!(bol.history.len(), 1);
        assert_eq!(bol.history[0].status, BolStatus::Pending);
    }

    #[test]
    fn draft_without_cargo_is_rejected() {
        let draft = BolDraft::new()
            .set_shipper(Party::new("a", "A"))
            .set_consignee(Party::new("b", "B"))
            .set_carrier(Party::new("c", "C"));
        assert_eq!(draft.validate(), Err(ValidationError::NoCargo));
    }

    #[test]
    fn draft_with_reversed_dates_is_rejected() {
        let draft = draft()
            .set_pickup_date(TimeStamp::new_with(2026, 3, 10, 0, 0, 0))
            .set_delivery_date(TimeStamp::new_with(2026, 3, 1, 0, 0, 0));
        assert_eq!(draft.validate(), Err(ValidationError::InvalidDates));
    }

    #[test]
    fn number_format_is_checked() {
        assert!(BillOfLading::is_valid_number("BOL-2026-000001"));
        assert!(BillOfLading::is_valid_number("BOL-2026-1000001"));
        assert!(!BillOfLading::is_valid_number("BOL-26-000001"));
        assert!(!BillOfLading::is_valid_number("BOL-2026-0001"));
        assert!(!BillOfLading::is_valid_number("INV-2026-000001"));
        assert!(!BillOfLading::is_valid_number("BOL-2026-000001-x"));
    }

    #[test]
    fn advanced_leaves_the_original_untouched() {
        let bol = draft().finalise(1, "user_1", TimeStamp::new()).unwrap();
        let next = bol.advanced(
            BolStatus::Approved,
            "user_1",
            TransitionDetails::default(),
            TimeStamp::new(),
        );

        assert_eq!(bol.version, 1);
        assert_eq!(bol.history.len(), 1);
        assert_eq!(next.version, 2);
        assert_eq!(next.history.last().map(|h| h.status), Some(BolStatus::Approved));
    }

    #[test]
    fn document_hash_ignores_workflow_state() {
        let bol = draft().finalise(1, "user_1", TimeStamp::new()).unwrap();
        let next = bol.advanced(
            BolStatus::Approved,
            "user_2",
            TransitionDetails::default(),
            TimeStamp::new(),
        );
        assert_eq!(bol.document_hash().unwrap(), next.document_hash().unwrap());
    }
}
