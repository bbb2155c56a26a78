//! Reconciler passes: ceiling sweep, deferred-event drain, orphaning, grant retries

#[path = "../common/mod.rs"]
mod common;

use axum::http::StatusCode;
use common::*;
use serde_json::json;

async fn deliver(app: &TestApp, body: serde_json::Value) -> String {
    let response = send(app.router(), mock_webhook_request("/webhooks/stripe", body, true)).await;
    assert_eq!(response.status(), StatusCode::OK);
    body_text(response).await
}

#[test]
fn test_empty_pass_reports_nothing() {
    let app = test_app();
    let report = sweeper::run_once(&app.state).unwrap();
    assert_eq!(report, sweeper::ReconcileReport::default());
}

#[test]
fn test_sweep_only_touches_stale_processing() {
    let app = test_app();
    let mut conn = app.conn();
    create_test_course(&conn, "course-b", 5000);
    create_test_course(&conn, "course-c", 5000);

    let stale = create_processing_order(&mut conn, TEST_USER, PAID_COURSE, Gateway::Stripe, "cs_stale");
    let fresh = create_processing_order(&mut conn, TEST_USER, "course-b", Gateway::Stripe, "cs_fresh");
    let pending = create_test_order(&conn, TEST_USER, "course-c", Gateway::Kiwify);
    backdate_order(&conn, &stale.id, 7200);
    backdate_order(&conn, &pending.id, 7200);

    let expired = sweeper::sweep_stale_processing(&app.state).unwrap();
    assert_eq!(expired, 1);

    assert_eq!(get_order(&conn, &stale.id).status, PaymentStatus::Failed);
    assert_eq!(get_order(&conn, &fresh.id).status, PaymentStatus::Processing);
    assert_eq!(get_order(&conn, &pending.id).status, PaymentStatus::Pending);

    assert_eq!(sweeper::sweep_stale_processing(&app.state).unwrap(), 0, "sweeps are idempotent");
}

#[tokio::test]
async fn test_webhook_after_sweep_is_stale() {
    let app = test_app();
    let order = create_processing_order(&mut app.conn(), TEST_USER, PAID_COURSE, Gateway::Stripe, "cs_1");
    backdate_order(&app.conn(), &order.id, 7200);
    sweeper::run_once(&app.state).unwrap();

    let reply = deliver(&app, json!({ "reference": "cs_1", "status": "succeeded" })).await;
    assert_eq!(reply, "Stale status ignored");

    let conn = app.conn();
    assert_eq!(get_order(&conn, &order.id).status, PaymentStatus::Failed);
    assert_eq!(queries::count_enrollments(&conn, TEST_USER, PAID_COURSE).unwrap(), 0);
}

#[tokio::test]
async fn test_drain_applies_event_once_order_appears() {
    let app = test_app();
    let reply = deliver(&app, json!({ "reference": "cs_late", "status": "succeeded" })).await;
    assert_eq!(reply, "Recorded, processing deferred");

    // Order mapped to the reference outside the checkout handler
    let order = create_processing_order(&mut app.conn(), TEST_USER, PAID_COURSE, Gateway::Stripe, "cs_late");

    let report = sweeper::run_once(&app.state).unwrap();
    assert_eq!(report.drained_events, 1);
    assert_eq!(report.orphaned_events, 0);

    let conn = app.conn();
    assert_eq!(get_order(&conn, &order.id).status, PaymentStatus::Succeeded);
    assert_eq!(queries::count_enrollments(&conn, TEST_USER, PAID_COURSE).unwrap(), 1);
    let events = queries::list_webhook_events_for_reference(&conn, Gateway::Stripe, "cs_late").unwrap();
    assert_eq!(events[0].outcome, Some(WebhookOutcome::Applied));
    drop(conn);

    let again = sweeper::run_once(&app.state).unwrap();
    assert_eq!(again.drained_events, 0);
}

#[tokio::test]
async fn test_unmatched_events_are_orphaned_after_window() {
    let app = test_app();
    deliver(&app, json!({ "reference": "cs_ghost", "status": "succeeded" })).await;
    deliver(&app, json!({ "lookup": "fail" })).await;
    deliver(&app, json!({ "reference": "cs_recent", "status": "succeeded" })).await;

    let conn = app.conn();
    let deferred = queries::list_deferred_webhook_events(&conn).unwrap();
    assert_eq!(deferred.len(), 3);
    let window = app.state.reconcile.webhook_orphan_secs + 60;
    for event in deferred.iter().filter(|e| e.external_reference.as_deref() != Some("cs_recent")) {
        backdate_webhook_event(&conn, &event.id, window);
    }
    drop(conn);

    let report = sweeper::run_once(&app.state).unwrap();
    assert_eq!(report.orphaned_events, 2);
    assert_eq!(report.drained_events, 0);

    let conn = app.conn();
    let remaining = queries::list_deferred_webhook_events(&conn).unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].external_reference.as_deref(), Some("cs_recent"));

    let ghost = queries::list_webhook_events_for_reference(&conn, Gateway::Stripe, "cs_ghost").unwrap();
    assert!(ghost[0].processed);
    assert_eq!(ghost[0].outcome, Some(WebhookOutcome::Orphaned));
}

#[tokio::test]
async fn test_deferred_grant_is_completed_by_reconciler() {
    let app = test_app();
    let order = create_processing_order(&mut app.conn(), TEST_USER, PAID_COURSE, Gateway::Stripe, "cs_1");
    block_enrollments(&app.conn());

    let reply = deliver(&app, json!({ "reference": "cs_1", "status": "succeeded" })).await;
    assert_eq!(reply, "OK", "the webhook is acknowledged even when the grant fails");

    {
        let conn = app.conn();
        let stored = get_order(&conn, &order.id);
        assert_eq!(stored.status, PaymentStatus::Succeeded);
        assert!(stored.enrollment_pending);
        assert_eq!(queries::count_enrollments(&conn, TEST_USER, PAID_COURSE).unwrap(), 0);
    }

    allow_enrollments(&app.conn());
    let report = sweeper::run_once(&app.state).unwrap();
    assert_eq!(report.granted_enrollments, 1);

    let conn = app.conn();
    assert!(!get_order(&conn, &order.id).enrollment_pending);
    assert_eq!(queries::count_enrollments(&conn, TEST_USER, PAID_COURSE).unwrap(), 1);
    drop(conn);

    let again = sweeper::run_once(&app.state).unwrap();
    assert_eq!(again.granted_enrollments, 0);
}

#[tokio::test]
async fn test_background_retry_grants_after_transient_failure() {
    let app = test_app();
    let order = create_processing_order(&mut app.conn(), TEST_USER, PAID_COURSE, Gateway::Stripe, "cs_1");
    block_enrollments(&app.conn());

    let outcome =
        ledger::transition(&app.state, &order.id, PaymentStatus::Succeeded, None).unwrap();
    assert!(outcome.is_applied());
    allow_enrollments(&app.conn());

    // The spawned retry backs off from 200ms, so it lands well within this window
    let mut granted = false;
    for _ in 0..50 {
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        if !get_order(&app.conn(), &order.id).enrollment_pending {
            granted = true;
            break;
        }
    }
    assert!(granted, "background retry should grant the enrollment");
    assert_eq!(
        queries::count_enrollments(&app.conn(), TEST_USER, PAID_COURSE).unwrap(),
        1
    );
}
