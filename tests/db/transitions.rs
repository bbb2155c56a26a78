//! Ledger transitions: state machine, compare-and-set races, savepoint grants

#[path = "../common/mod.rs"]
mod common;

use std::sync::{Arc, Barrier};
use std::thread;

use common::*;

#[test]
fn test_forward_path_grants_enrollment() {
    let app = test_app();
    let mut conn = app.conn();
    let order = create_test_order(&conn, TEST_USER, PAID_COURSE, Gateway::Stripe);

    let processing =
        ledger::apply_transition(&mut conn, &order.id, PaymentStatus::Processing, None).unwrap();
    assert!(processing.is_applied());
    assert_eq!(
        queries::count_enrollments(&conn, TEST_USER, PAID_COURSE).unwrap(),
        0,
        "processing grants nothing"
    );

    let outcome =
        ledger::apply_transition(&mut conn, &order.id, PaymentStatus::Succeeded, None).unwrap();
    let TransitionOutcome::Applied(updated) = outcome else {
        panic!("expected applied, got {:?}", outcome);
    };
    assert_eq!(updated.status, PaymentStatus::Succeeded);
    assert!(!updated.enrollment_pending, "grant landed in the same transaction");

    let enrollment = queries::get_enrollment(&conn, TEST_USER, PAID_COURSE)
        .unwrap()
        .expect("enrollment should exist");
    assert_eq!(enrollment.order_id.as_deref(), Some(order.id.as_str()));
    assert_eq!(enrollment.progress, 0);
}

#[test]
fn test_pending_may_skip_processing() {
    let app = test_app();
    let mut conn = app.conn();
    let order = create_test_order(&conn, TEST_USER, PAID_COURSE, Gateway::Hotmart);

    let outcome =
        ledger::apply_transition(&mut conn, &order.id, PaymentStatus::Succeeded, None).unwrap();
    assert!(outcome.is_applied());
    assert_eq!(get_order(&conn, &order.id).status, PaymentStatus::Succeeded);
}

#[test]
fn test_terminal_status_is_final() {
    let app = test_app();
    let mut conn = app.conn();
    let order = create_test_order(&conn, TEST_USER, PAID_COURSE, Gateway::Stripe);
    ledger::apply_transition(&mut conn, &order.id, PaymentStatus::Failed, None).unwrap();
    let version = get_order(&conn, &order.id).version;

    for next in [
        PaymentStatus::Succeeded,
        PaymentStatus::Processing,
        PaymentStatus::Expired,
        PaymentStatus::Failed,
    ] {
        let outcome = ledger::apply_transition(&mut conn, &order.id, next, None).unwrap();
        let TransitionOutcome::Stale(current) = outcome else {
            panic!("{} after failed should be stale, got {:?}", next, outcome);
        };
        assert_eq!(current.status, PaymentStatus::Failed);
    }

    let stored = get_order(&conn, &order.id);
    assert_eq!(stored.version, version, "stale transitions write nothing");
    assert_eq!(queries::count_enrollments(&conn, TEST_USER, PAID_COURSE).unwrap(), 0);
}

#[test]
fn test_backward_transition_is_stale() {
    let app = test_app();
    let mut conn = app.conn();
    let order = create_processing_order(&mut conn, TEST_USER, PAID_COURSE, Gateway::Stripe, "ref-1");

    let outcome =
        ledger::apply_transition(&mut conn, &order.id, PaymentStatus::Pending, None).unwrap();
    assert!(matches!(outcome, TransitionOutcome::Stale(ref o) if o.status == PaymentStatus::Processing));

    let repeat =
        ledger::apply_transition(&mut conn, &order.id, PaymentStatus::Processing, None).unwrap();
    assert!(!repeat.is_applied(), "a repeated status is not a forward move");
}

#[test]
fn test_transition_on_missing_order_errors() {
    let app = test_app();
    let mut conn = app.conn();

    let result = ledger::apply_transition(
        &mut conn,
        "cp_ord_00000000000000000000000000000000",
        PaymentStatus::Succeeded,
        None,
    );
    assert!(result.is_err());
}

#[test]
fn test_failed_grant_keeps_transition_and_flags_pending() {
    let app = test_app();
    let mut conn = app.conn();
    let order = create_processing_order(&mut conn, TEST_USER, PAID_COURSE, Gateway::Stripe, "ref-1");

    block_enrollments(&conn);
    let outcome =
        ledger::apply_transition(&mut conn, &order.id, PaymentStatus::Succeeded, None).unwrap();
    let TransitionOutcome::Applied(updated) = outcome else {
        panic!("transition must commit even when the grant fails");
    };
    assert_eq!(updated.status, PaymentStatus::Succeeded);
    assert!(updated.enrollment_pending);
    assert_eq!(queries::count_enrollments(&conn, TEST_USER, PAID_COURSE).unwrap(), 0);

    // Still blocked: the retry reports the failure and leaves the flag up
    assert!(ledger::retry_pending_grant(&app.state.db, &order.id).is_err());
    assert!(get_order(&conn, &order.id).enrollment_pending);

    allow_enrollments(&conn);
    let retried = ledger::retry_pending_grant(&app.state.db, &order.id).unwrap();
    assert!(matches!(retried, Some(GrantOutcome::Created(_))));
    assert!(!get_order(&conn, &order.id).enrollment_pending);
    assert_eq!(queries::count_enrollments(&conn, TEST_USER, PAID_COURSE).unwrap(), 1);

    let again = ledger::retry_pending_grant(&app.state.db, &order.id).unwrap();
    assert!(again.is_none(), "nothing left to grant");
}

#[test]
fn test_retry_pending_grant_ignores_unpaid_orders() {
    let app = test_app();
    let mut conn = app.conn();
    let order = create_processing_order(&mut conn, TEST_USER, PAID_COURSE, Gateway::Stripe, "ref-1");

    assert!(ledger::retry_pending_grant(&app.state.db, &order.id)
        .unwrap()
        .is_none());
    assert_eq!(queries::count_enrollments(&conn, TEST_USER, PAID_COURSE).unwrap(), 0);
}

#[test]
fn test_concurrent_success_applies_once() {
    let app = test_app();
    let order = {
        let mut conn = app.conn();
        create_processing_order(&mut conn, TEST_USER, PAID_COURSE, Gateway::Stripe, "ref-1")
    };

    let writers = 8;
    let barrier = Arc::new(Barrier::new(writers));
    let handles: Vec<_> = (0..writers)
        .map(|_| {
            let pool = app.state.db.clone();
            let barrier = barrier.clone();
            let order_id = order.id.clone();
            thread::spawn(move || {
                let mut conn = pool.get().unwrap();
                barrier.wait();
                ledger::apply_transition(&mut conn, &order_id, PaymentStatus::Succeeded, None)
                    .unwrap()
            })
        })
        .collect();

    let outcomes: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    let applied = outcomes.iter().filter(|o| o.is_applied()).count();
    assert_eq!(applied, 1, "exactly one writer wins");
    assert!(outcomes
        .iter()
        .filter(|o| !o.is_applied())
        .all(|o| matches!(o, TransitionOutcome::Stale(_))));

    let conn = app.conn();
    assert_eq!(queries::count_enrollments(&conn, TEST_USER, PAID_COURSE).unwrap(), 1);
}

#[test]
fn test_concurrent_contradicting_outcomes_first_wins() {
    let app = test_app();
    let order = {
        let mut conn = app.conn();
        create_processing_order(&mut conn, TEST_USER, PAID_COURSE, Gateway::Stripe, "ref-1")
    };

    let targets = [
        PaymentStatus::Succeeded,
        PaymentStatus::Failed,
        PaymentStatus::Expired,
        PaymentStatus::Succeeded,
        PaymentStatus::Cancelled,
        PaymentStatus::Failed,
    ];
    let barrier = Arc::new(Barrier::new(targets.len()));
    let handles: Vec<_> = targets
        .into_iter()
        .map(|target| {
            let pool = app.state.db.clone();
            let barrier = barrier.clone();
            let order_id = order.id.clone();
            thread::spawn(move || {
                let mut conn = pool.get().unwrap();
                barrier.wait();
                (
                    target,
                    ledger::apply_transition(&mut conn, &order_id, target, None).unwrap(),
                )
            })
        })
        .collect();

    let outcomes: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    let winners: Vec<_> = outcomes
        .iter()
        .filter(|(_, o)| o.is_applied())
        .map(|(target, _)| *target)
        .collect();
    assert_eq!(winners.len(), 1);

    let conn = app.conn();
    let stored = get_order(&conn, &order.id);
    assert_eq!(stored.status, winners[0], "the committed status is the winner's");

    let enrolled = queries::count_enrollments(&conn, TEST_USER, PAID_COURSE).unwrap();
    let expected = if winners[0] == PaymentStatus::Succeeded { 1 } else { 0 };
    assert_eq!(enrolled, expected);
}

#[test]
fn test_mercadopago_decline_then_approval_enrolls() {
    use coursepay::payments::map_payment_status;

    let app = test_app();
    let mut conn = app.conn();
    let order = create_test_order(&conn, TEST_USER, PAID_COURSE, Gateway::MercadoPago);

    // First card declined on the open preference
    let declined = map_payment_status("rejected").unwrap();
    let outcome = ledger::apply_transition(&mut conn, &order.id, declined, None).unwrap();
    assert!(outcome.is_applied());
    let stored = get_order(&conn, &order.id);
    assert_eq!(stored.status, PaymentStatus::Processing);
    assert!(!stored.status.is_terminal(), "a decline leaves the preference payable");

    // A second decline is a no-op
    let again = ledger::apply_transition(&mut conn, &order.id, declined, None).unwrap();
    assert!(matches!(again, TransitionOutcome::Stale(_)));

    let approved = map_payment_status("approved").unwrap();
    let outcome = ledger::apply_transition(&mut conn, &order.id, approved, None).unwrap();
    assert!(outcome.is_applied());
    assert_eq!(get_order(&conn, &order.id).status, PaymentStatus::Succeeded);
    assert_eq!(queries::count_enrollments(&conn, TEST_USER, PAID_COURSE).unwrap(), 1);
}
