//! Walk one bill of lading from draft to paid against a sled-backed store,
//! with the outbox worker running in the background.
//!
//! `RUST_LOG=debug cargo run --example lifecycle`
use std::time::Duration;

use bol_ledger::config::Config;
use bol_ledger::service::{Actor, BolService, StatusUpdate};
use bol_ledger::telemetry::init_tracing;
use bol_ledger::{BolDraft, BolStatus, CargoItem, FreightCharges, Party, Role, TimeStamp};
use tokio::sync::watch;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let config = Config {
        data_dir: Some(dir.path().join("bol-ledger")),
        reconcile_interval_secs: 5,
        ..Config::default()
    };
    config.validate()?;
    init_tracing(&config)?;

    let service = BolService::builder().config(config).build()?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker = service.outbox_worker();
    let worker = tokio::spawn(async move { worker.run(shutdown_rx).await });

    let shipper = Party::generate("Acme Mills")?.with_email("dispatch@acme.test");
    let consignee = Party::generate("Harbor Retail")?;
    let carrier = Party::generate("Blue Line Freight")?;

    let as_shipper = Actor::new(&shipper.contact_id, [Role::Shipper]);
    let as_consignee = Actor::new(&consignee.contact_id, [Role::Consignee]);
    let as_carrier = Actor::new(&carrier.contact_id, [Role::Carrier]);

    let draft = BolDraft::new()
        .set_shipper(shipper)
        .set_consignee(consignee)
        .set_carrier(carrier)
        .add_cargo(CargoItem::new("Cotton bales", 12, 2_400, 1_800_000).with_dimensions(120, 100, 150))
        .set_charges(FreightCharges {
            base_cents: 145_000,
            fuel_surcharge_cents: 18_500,
            ..Default::default()
        })
        .set_pickup_date(TimeStamp::new_with(2026, 11, 2, 8, 0, 0))
        .set_delivery_date(TimeStamp::new_with(2026, 11, 6, 17, 0, 0));

    let bol = service.create_bol(draft, &as_shipper)?;
    println!("created {} ({})", bol.number, bol.status);

    let steps = [
        (BolStatus::Approved, &as_shipper),
        (BolStatus::Assigned, &as_shipper),
        (BolStatus::Accepted, &as_carrier),
        (BolStatus::PickedUp, &as_carrier),
        (BolStatus::EnRoute, &as_carrier),
        (BolStatus::Delivered, &as_consignee),
        (BolStatus::Unpaid, &as_carrier),
        (BolStatus::Paid, &as_consignee),
    ];
    for (status, actor) in steps {
        let mut update = StatusUpdate::new(&bol.number, status, actor.clone());
        if matches!(status, BolStatus::PickedUp | BolStatus::EnRoute) {
            update = update.location("Savannah, GA");
        }
        if status == BolStatus::Delivered {
            update = update.signature("R. Alvarez");
        }
        let outcome = service.update_status(update)?;
        println!(
            "{:>10} v{} in {:?}",
            outcome.bol.status, outcome.bol.version, outcome.performance.total
        );
    }

    // give the worker time to catch the ledger up
    for _ in 0..50 {
        if service.get_bol(&bol.number)?.is_ledger_synced() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    let bol = service.get_bol(&bol.number)?;
    println!("operational v{} synced={}", bol.version, bol.is_ledger_synced());
    for entry in service.ledger_history(&bol.number).await? {
        println!(
            "ledger v{} {:<10} {}",
            entry.record.version, entry.record.status, entry.tx_id
        );
    }
    println!("{:#?}", service.sync_metrics());

    let _ = shutdown_tx.send(true);
    worker.await?;
    Ok(())
}
