//! Property-based tests for the status lifecycle as driven through the service
//!
//! Random sequences of status requests from random actors are thrown at a
//! single bill. Whatever the sequence, the record may only ever take single
//! forward steps, each accepted step bumps the version by exactly one,
//! `paid` never moves again and the audit chain stays intact.
//!
// These property tests cover:
//
// 1. Linearity - accepted requests are always the one forward step
// 2. Versioning - version == accepted steps + 1, history grows in lockstep
// 3. Terminal stability - nothing leaves paid, not even an admin
// 4. Audit integrity - the hash chain verifies after any sequence
// 5. Ledger convergence - after draining the outbox the ledger matches
//
// What these tests DON'T cover (deliberately):
//
// - Concurrency between writers (see the scenario tests)
// - Cache behaviour, the harness runs with a cold cache

use std::sync::Arc;

use proptest::prelude::*;
use bol_ledger::audit::AuditLog;
use bol_ledger::bol::{BolDraft, CargoItem, Party};
use bol_ledger::cache::NoopCache;
use bol_ledger::ledger::{InProcessLedger, LedgerGateway};
use bol_ledger::notify::MemoryNotifier;
use bol_ledger::service::{Actor, BolService, StatusUpdate};
use bol_ledger::status::{BolStatus, Role};
use bol_ledger::store::MemoryBolStore;
use bol_ledger::WorkflowError;

/// Strategy to generate any status
fn status_strategy() -> impl Strategy<Value = BolStatus> {
    prop::sample::select(BolStatus::ALL.to_vec())
}

/// Strategy to generate an actor holding one role, admin included
fn actor_strategy() -> impl Strategy<Value = Actor> {
    prop_oneof![
        Just(Actor::new("contact_shipper", [Role::Shipper])),
        Just(Actor::new("contact_consignee", [Role::Consignee])),
        Just(Actor::new("contact_carrier", [Role::Carrier])),
        Just(Actor::new("contact_broker", [Role::Broker])),
        Just(Actor::new("user_admin", [Role::Admin])),
    ]
}

fn request_strategy() -> impl Strategy<Value = Vec<(BolStatus, Actor)>> {
    prop::collection::vec((status_strategy(), actor_strategy()), 0..40)
}

fn service(ledger: Arc<InProcessLedger>) -> BolService {
    BolService::builder()
        .store(Arc::new(MemoryBolStore::new()))
        .cache(Arc::new(NoopCache))
        .audit(Arc::new(AuditLog::in_memory()))
        .ledger(ledger)
        .notifier(Arc::new(MemoryNotifier::new()))
        .build()
        .unwrap()
}

fn draft() -> BolDraft {
    BolDraft::new()
        .set_shipper(Party::new("contact_shipper", "Shipper"))
        .set_consignee(Party::new("contact_consignee", "Consignee"))
        .set_carrier(Party::new("contact_carrier", "Carrier"))
        .set_broker(Party::new("contact_broker", "Broker"))
        .add_cargo(CargoItem::new("Drums", 8, 1_600, 320_000))
}

/// Drive every request through the service, return (accepted, rejected).
fn drive(service: &BolService, number: &str, requests: &[(BolStatus, Actor)]) -> (usize, usize) {
    let mut accepted = 0;
    let mut rejected = 0;
    for (status, actor) in requests {
        let before = service.get_bol(number).unwrap();
        match service.update_status(StatusUpdate::new(number, *status, actor.clone())) {
            Ok(outcome) => {
                assert_eq!(Some(*status), service.transition_table().next_status(before.status));
                assert_eq!(outcome.bol.version, before.version + 1);
                accepted += 1;
            }
            Err(WorkflowError::InvalidTransition(_) | WorkflowError::InsufficientPermission(_)) => {
                let after = service.get_bol(number).unwrap();
                assert_eq!(after, before);
                rejected += 1;
            }
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    (accepted, rejected)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Property: only single forward steps are ever accepted and each one
    /// bumps the version by exactly one
    #[test]
    fn prop_only_linear_steps_are_accepted(requests in request_strategy()) {
        let service = service(Arc::new(InProcessLedger::new()));
        let bol = service.create_bol(draft(), &Actor::new("contact_shipper", [Role::Shipper])).unwrap();

        let (accepted, rejected) = drive(&service, &bol.number, &requests);
        let after = service.get_bol(&bol.number).unwrap();

        prop_assert_eq!(accepted + rejected, requests.len());
        prop_assert_eq!(after.version as usize, accepted + 1);
        prop_assert_eq!(after.history.len(), accepted + 1);
        prop_assert_eq!(after.status.ordinal(), accepted);

        // history is the pipeline prefix, in order
        let statuses: Vec<BolStatus> = after.history.iter().map(|entry| entry.status).collect();
        prop_assert_eq!(statuses, BolStatus::ALL[..=accepted].to_vec());
    }

    /// Property: once paid, every request is refused as terminal
    #[test]
    fn prop_paid_is_terminal(requests in request_strategy()) {
        let service = service(Arc::new(InProcessLedger::new()));
        let admin = Actor::new("user_admin", [Role::Admin]);
        let bol = service.create_bol(draft(), &admin).unwrap();
        for step in service.transition_table().path(BolStatus::Pending, BolStatus::Paid) {
            service.update_status(StatusUpdate::new(&bol.number, step, admin.clone())).unwrap();
        }

        let (accepted, _) = drive(&service, &bol.number, &requests);
        prop_assert_eq!(accepted, 0);
        prop_assert_eq!(service.get_bol(&bol.number).unwrap().status, BolStatus::Paid);
    }

    /// Property: the audit chain verifies whatever was accepted or denied
    #[test]
    fn prop_audit_chain_stays_intact(requests in request_strategy()) {
        let audit = Arc::new(AuditLog::in_memory());
        let service = BolService::builder()
            .store(Arc::new(MemoryBolStore::new()))
            .audit(audit.clone())
            .build()
            .unwrap();
        let bol = service.create_bol(draft(), &Actor::new("contact_broker", [Role::Broker])).unwrap();

        drive(&service, &bol.number, &requests);
        prop_assert!(audit.verify_chain().unwrap().is_intact());
    }

    /// Property: after the outbox drains, the ledger holds the operational
    /// status one version behind the operational record
    #[test]
    fn prop_ledger_converges(requests in request_strategy()) {
        let ledger = Arc::new(InProcessLedger::new());
        let service = service(ledger.clone());
        let bol = service.create_bol(draft(), &Actor::new("contact_shipper", [Role::Shipper])).unwrap();
        drive(&service, &bol.number, &requests);

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async {
            let worker = service.outbox_worker();
            while !worker.drain_once().await.unwrap().is_idle() {}
        });

        let after = service.get_bol(&bol.number).unwrap();
        prop_assert!(after.is_ledger_synced());
        if after.status.is_on_ledger() {
            let record = runtime.block_on(ledger.get(&bol.number)).unwrap();
            prop_assert_eq!(record.status, after.status.as_str());
            prop_assert_eq!(record.version, after.version - 1);
        } else {
            prop_assert_eq!(ledger.write_count(), 0);
        }
        prop_assert!(ledger.verify_chain().unwrap());
    }
}
