//! Property-based tests for BolDraft validation and the figures derived from it
//!
//! This module uses the proptest crate to check that draft validation and
//! finalisation hold across a wide range of randomly generated bills, not
//! just the handful of fixtures used in the scenario tests.

use chrono::Datelike;
use proptest::prelude::*;
use bol_ledger::bol::{BillOfLading, BolDraft, CargoItem, FreightCharges, Party, TimeStamp};
use bol_ledger::error::ValidationError;
use bol_ledger::status::BolStatus;

// PROPERTY TEST STRATEGIES

/// Strategy to generate a cargo line with a non-zero quantity and weight
fn cargo_strategy() -> impl Strategy<Value = CargoItem> {
    ("[a-z]{3,12}", 1u32..=500, 1u64..=40_000, 0u64..=10_000_000)
        .prop_map(|(description, quantity, weight, value)| {
            CargoItem::new(description, quantity, weight, value)
        })
}

/// Strategy to generate pickup and delivery dates in order (pickup <= delivery)
fn sorted_dates_strategy() -> impl Strategy<Value = (TimeStamp<chrono::Utc>, TimeStamp<chrono::Utc>)> {
    (2020i32..=2030, 1u32..=12).prop_flat_map(|(year, month)| {
        (1u32..=14, 14u32..=28).prop_map(move |(pickup, delivery)| {
            (
                TimeStamp::new_with(year, month, pickup, 0, 0, 0),
                TimeStamp::new_with(year, month, delivery, 0, 0, 0),
            )
        })
    })
}

/// Strategy to generate pickup and delivery dates out of order
fn unsorted_dates_strategy() -> impl Strategy<Value = (TimeStamp<chrono::Utc>, TimeStamp<chrono::Utc>)> {
    (2020i32..=2030, 1u32..=12).prop_flat_map(|(year, month)| {
        (15u32..=28, 1u32..=14).prop_map(move |(pickup, delivery)| {
            (
                TimeStamp::new_with(year, month, pickup, 0, 0, 0),
                TimeStamp::new_with(year, month, delivery, 0, 0, 0),
            )
        })
    })
}

fn parties(draft: BolDraft) -> BolDraft {
    draft
        .set_shipper(Party::new("contact_shipper", "Shipper"))
        .set_consignee(Party::new("contact_consignee", "Consignee"))
        .set_carrier(Party::new("contact_carrier", "Carrier"))
}

fn with_cargo(cargo: &[CargoItem]) -> BolDraft {
    cargo
        .iter()
        .cloned()
        .fold(parties(BolDraft::new()), |draft, item| draft.add_cargo(item))
}

// PROPERTY TESTS
proptest! {
    /// Property: ordered dates always pass date validation
    #[test]
    fn prop_sorted_dates_always_validate(
        (pickup, delivery) in sorted_dates_strategy(),
        cargo in prop::collection::vec(cargo_strategy(), 1..5)
    ) {
        let draft = with_cargo(&cargo)
            .set_pickup_date(pickup)
            .set_delivery_date(delivery);

        prop_assert!(draft.validate_dates());
        prop_assert!(draft.validate().is_ok());
    }

    /// Property: delivery before pickup is always rejected
    #[test]
    fn prop_unsorted_dates_never_validate(
        (pickup, delivery) in unsorted_dates_strategy(),
        cargo in prop::collection::vec(cargo_strategy(), 1..5)
    ) {
        let draft = with_cargo(&cargo)
            .set_pickup_date(pickup)
            .set_delivery_date(delivery);

        prop_assert!(!draft.validate_dates());
        prop_assert_eq!(draft.validate(), Err(ValidationError::InvalidDates));
    }

    /// Property: a single missing date never fails date validation
    #[test]
    fn prop_partial_dates_validate(
        (pickup, delivery) in unsorted_dates_strategy(),
        keep_pickup in any::<bool>()
    ) {
        let draft = with_cargo(&[CargoItem::new("box", 1, 1, 1)]);
        let draft = if keep_pickup {
            draft.set_pickup_date(pickup)
        } else {
            draft.set_delivery_date(delivery)
        };
        prop_assert!(draft.validate_dates());
    }

    /// Property: finalised totals are the sums over the cargo lines
    #[test]
    fn prop_totals_sum_cargo(
        cargo in prop::collection::vec(cargo_strategy(), 1..10),
        sequence in 1u64..=999_999
    ) {
        let bol = with_cargo(&cargo)
            .finalise(sequence, "contact_shipper", TimeStamp::new())
            .unwrap();

        prop_assert_eq!(bol.total_weight_kg, cargo.iter().map(|c| c.weight_kg).sum::<u64>());
        prop_assert_eq!(
            bol.total_value_cents,
            cargo.iter().map(|c| c.declared_value_cents).sum::<u64>()
        );
        prop_assert_eq!(bol.cargo.len(), cargo.len());
    }

    /// Property: every finalised bill starts pending at version 1 with a
    /// well formed number carrying the creation year
    #[test]
    fn prop_finalised_bill_starts_pending(
        sequence in 1u64..=9_999_999,
        year in 2020i32..=2099
    ) {
        let at = TimeStamp::new_with(year, 1, 1, 0, 0, 0);
        let bol = with_cargo(&[CargoItem::new("box", 1, 1, 1)])
            .finalise(sequence, "contact_shipper", at)
            .unwrap();

        prop_assert_eq!(bol.status, BolStatus::Pending);
        prop_assert_eq!(bol.version, 1);
        prop_assert_eq!(bol.history.len(), 1);
        prop_assert!(BillOfLading::is_valid_number(&bol.number));
        let prefix = format!("BOL-{year}-");
        prop_assert!(bol.number.starts_with(&prefix));
        prop_assert_eq!(bol.created_at.to_datetime_utc().year(), year);
    }

    /// Property: a zero quantity or weight anywhere is reported at its index
    #[test]
    fn prop_zero_line_is_reported(
        mut cargo in prop::collection::vec(cargo_strategy(), 1..8),
        pick in any::<prop::sample::Index>(),
        zero_weight in any::<bool>()
    ) {
        let index = pick.index(cargo.len());
        if zero_weight {
            cargo[index].weight_kg = 0;
        } else {
            cargo[index].quantity = 0;
        }
        prop_assert_eq!(with_cargo(&cargo).validate(), Err(ValidationError::InvalidCargo(index)));
    }

    /// Property: freight total is the sum of its parts
    #[test]
    fn prop_freight_total(
        base in 0u64..=1_000_000_000,
        fuel in 0u64..=1_000_000_000,
        accessorial in 0u64..=1_000_000_000,
        insurance in 0u64..=1_000_000_000
    ) {
        let charges = FreightCharges {
            base_cents: base,
            fuel_surcharge_cents: fuel,
            accessorial_cents: accessorial,
            insurance_cents: insurance,
        };
        prop_assert_eq!(charges.total_cents(), base + fuel + accessorial + insurance);
    }

    /// Property: the document hash is a function of the document alone
    #[test]
    fn prop_document_hash_is_deterministic(
        cargo in prop::collection::vec(cargo_strategy(), 1..5),
        notes in "[a-z ]{0,40}"
    ) {
        let draft = with_cargo(&cargo).set_notes(notes.clone());
        let at = TimeStamp::new_with(2026, 2, 2, 0, 0, 0);
        let first = draft.clone().finalise(1, "contact_a", at.clone()).unwrap();
        let second = draft.finalise(1, "contact_b", TimeStamp::new_with(2026, 2, 3, 12, 0, 0)).unwrap();

        prop_assert_eq!(first.document_hash().unwrap(), second.document_hash().unwrap());

        let changed = with_cargo(&cargo)
            .set_notes(format!("{notes}!"))
            .finalise(1, "contact_a", at)
            .unwrap();
        prop_assert_ne!(first.document_hash().unwrap(), changed.document_hash().unwrap());
    }
}
