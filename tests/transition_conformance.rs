//! The operational transition table and the ledger contract each carry their
//! own copy of the lifecycle. Both are checked here against one fixture so
//! they cannot drift apart.

use bol_ledger::bol::{CargoItem, Party, TimeStamp};
use bol_ledger::ledger::contract::{allowed_next, is_known_status};
use bol_ledger::ledger::{LedgerBolInput, LedgerContract, LedgerError};
use bol_ledger::status::{BolStatus, TransitionTable};

// (from, to) for every legal move, by wire name
const LEGAL: [(&str, &str); 8] = [
    ("pending", "approved"),
    ("approved", "assigned"),
    ("assigned", "accepted"),
    ("accepted", "picked_up"),
    ("picked_up", "en_route"),
    ("en_route", "delivered"),
    ("delivered", "unpaid"),
    ("unpaid", "paid"),
];

fn is_legal(from: &str, to: &str) -> bool {
    LEGAL.contains(&(from, to))
}

#[test]
fn operational_table_matches_fixture() {
    let table = TransitionTable::standard();
    for from in BolStatus::ALL {
        for to in BolStatus::ALL {
            let expected = is_legal(from.as_str(), to.as_str());
            assert_eq!(
                table.can_transition(from, to).allowed,
                expected,
                "operational table disagrees on {from} -> {to}"
            );
        }
    }
}

#[test]
fn ledger_table_matches_fixture() {
    for from in BolStatus::ALL {
        for to in BolStatus::ALL {
            let expected = is_legal(from.as_str(), to.as_str());
            assert_eq!(
                allowed_next(from.as_str()) == Some(to.as_str()),
                expected,
                "ledger table disagrees on {from} -> {to}"
            );
        }
    }
}

#[test]
fn ledger_refuses_unknown_statuses() {
    for name in ["", "PAID", "shipped", "picked-up", "cancelled"] {
        assert!(!is_known_status(name));
        assert_eq!(allowed_next(name), None);
    }
    for status in BolStatus::ALL {
        assert!(is_known_status(status.as_str()));
    }
    assert_eq!(allowed_next("paid"), None);
}

fn input(bol_number: &str) -> LedgerBolInput {
    LedgerBolInput {
        bol_number: bol_number.to_string(),
        shipper: Party::new("contact_shipper", "Shipper"),
        consignee: Party::new("contact_consignee", "Consignee"),
        carrier: Party::new("contact_carrier", "Carrier"),
        broker: None,
        cargo: vec![CargoItem::new("Steel coils", 2, 18_000, 2_400_000)],
        total_weight_kg: 18_000,
        total_value_cents: 2_400_000,
        charges: Default::default(),
        pickup_date: None,
        delivery_date: None,
        notes: None,
        created_by: "contact_shipper".to_string(),
    }
}

#[test]
fn ledger_walks_the_fixture() -> anyhow::Result<()> {
    let mut ledger = LedgerContract::new();
    let receipt =
        ledger.create_approved_bol(input("BOL-2026-000001"), "doc".into(), "contact_shipper", None)?;
    assert_eq!(receipt.version, 1);
    assert_eq!(ledger.get("BOL-2026-000001")?.version, 1);

    // every legal move after approval lands, one version at a time
    for (version, (from, to)) in LEGAL.iter().skip(1).enumerate() {
        assert_eq!(ledger.get("BOL-2026-000001")?.status, *from);
        let receipt = ledger.update_status("BOL-2026-000001", to, "contact_carrier", None, None)?;
        assert_eq!(receipt.version, version as u64 + 2);
    }

    let err = ledger
        .update_status("BOL-2026-000001", "approved", "contact_shipper", None, None)
        .unwrap_err();
    assert!(matches!(err, LedgerError::InvalidTransition { .. }));
    assert!(ledger.verify_chain()?);
    Ok(())
}

#[test]
fn ledger_date_range_is_half_open() -> anyhow::Result<()> {
    let mut ledger = LedgerContract::new();
    let before = TimeStamp::new();
    let number = "BOL-2026-000001";
    ledger.create_approved_bol(input(number), "doc".into(), "contact_shipper", None)?;
    let approved_at = ledger.get(number)?.approved_at;
    let hour = chrono::Duration::hours(1);
    let after = TimeStamp::from(approved_at.to_datetime_utc() + hour);
    let much_later = TimeStamp::from(approved_at.to_datetime_utc() + hour * 2);

    assert!(before <= approved_at);
    assert_eq!(ledger.query_by_date_range(&before, &after).len(), 1);
    assert_eq!(ledger.query_by_date_range(&approved_at, &after).len(), 1);
    assert!(ledger.query_by_date_range(&before, &approved_at).is_empty());
    assert!(ledger.query_by_date_range(&after, &much_later).is_empty());
    Ok(())
}
