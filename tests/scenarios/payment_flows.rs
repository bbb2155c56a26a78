//! Checkout-to-enrollment flows across webhooks, polls and manual confirmation

#[path = "../common/mod.rs"]
mod common;

use axum::http::StatusCode;
use common::*;
use serde_json::json;

async fn start_checkout(app: &TestApp, gateway: &str) -> String {
    let response = send(
        app.router(),
        json_request(
            "POST",
            "/payments/checkout",
            Some(TEST_USER),
            json!({ "course_id": PAID_COURSE, "gateway": gateway }),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    body_json(response).await["order_id"]
        .as_str()
        .unwrap()
        .to_string()
}

async fn poll_status(app: &TestApp) -> String {
    let response = send(
        app.router(),
        get_request(&format!("/payments/status/{}", PAID_COURSE), Some(TEST_USER)),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    body_json(response).await["status"]
        .as_str()
        .unwrap()
        .to_string()
}

async fn deliver(app: &TestApp, reference: &str, status: &str) -> String {
    let response = send(
        app.router(),
        mock_webhook_request(
            "/webhooks/stripe",
            json!({ "reference": reference, "status": status }),
            true,
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    body_text(response).await
}

fn enrollment_count(app: &TestApp) -> i64 {
    queries::count_enrollments(&app.conn(), TEST_USER, PAID_COURSE).unwrap()
}

#[tokio::test]
async fn test_free_course_enrolls_without_order() {
    let app = test_app();

    let response = send(
        app.router(),
        json_request("POST", "/enrollments", Some(TEST_USER), json!({ "course_id": FREE_COURSE })),
    )
    .await;
    assert_eq!(response.status(), StatusCode::CREATED);

    let conn = app.conn();
    assert!(queries::get_enrollment(&conn, TEST_USER, FREE_COURSE)
        .unwrap()
        .is_some());
    assert!(queries::get_latest_payment_order(&conn, TEST_USER, FREE_COURSE)
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_webhook_first_then_poll() {
    let app = test_app();
    let order_id = start_checkout(&app, "stripe").await;
    assert_eq!(poll_status(&app).await, "pending");

    assert_eq!(deliver(&app, &mock_reference(&order_id), "succeeded").await, "OK");

    let queries_before = app.stripe.query_count();
    assert_eq!(poll_status(&app).await, "succeeded");
    assert_eq!(
        app.stripe.query_count(),
        queries_before,
        "an enrolled user is answered from the ledger"
    );
    assert_eq!(enrollment_count(&app), 1);
}

#[tokio::test]
async fn test_poll_first_then_webhook() {
    let app = test_app();
    let order_id = start_checkout(&app, "stripe").await;

    app.stripe.set_query(MockQuery::Status(PaymentStatus::Succeeded));
    assert_eq!(poll_status(&app).await, "succeeded");
    assert_eq!(enrollment_count(&app), 1);

    // The provider's webhook lands after the poll already settled the order
    assert_eq!(
        deliver(&app, &mock_reference(&order_id), "succeeded").await,
        "Stale status ignored"
    );
    assert_eq!(enrollment_count(&app), 1);
    assert_eq!(get_order(&app.conn(), &order_id).status, PaymentStatus::Succeeded);
}

#[tokio::test]
async fn test_webhook_and_poll_order_does_not_change_outcome() {
    let webhook_first = test_app();
    let order_a = start_checkout(&webhook_first, "stripe").await;
    webhook_first.stripe.set_query(MockQuery::Status(PaymentStatus::Succeeded));
    deliver(&webhook_first, &mock_reference(&order_a), "succeeded").await;
    poll_status(&webhook_first).await;

    let poll_first = test_app();
    let order_b = start_checkout(&poll_first, "stripe").await;
    poll_first.stripe.set_query(MockQuery::Status(PaymentStatus::Succeeded));
    poll_status(&poll_first).await;
    deliver(&poll_first, &mock_reference(&order_b), "succeeded").await;

    let a = get_order(&webhook_first.conn(), &order_a);
    let b = get_order(&poll_first.conn(), &order_b);
    assert_eq!(a.status, b.status);
    assert_eq!(a.status, PaymentStatus::Succeeded);
    assert_eq!(enrollment_count(&webhook_first), 1);
    assert_eq!(enrollment_count(&poll_first), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_webhook_and_poll_enroll_once() {
    let app = test_app();
    let order_id = start_checkout(&app, "stripe").await;
    app.stripe.set_query(MockQuery::Status(PaymentStatus::Succeeded));
    let reference = mock_reference(&order_id);

    let mut tasks = Vec::new();
    for i in 0..6 {
        let router = app.router();
        let request = if i % 2 == 0 {
            mock_webhook_request(
                "/webhooks/stripe",
                json!({ "reference": reference, "status": "succeeded" }),
                true,
            )
        } else {
            get_request(&format!("/payments/status/{}", PAID_COURSE), Some(TEST_USER))
        };
        tasks.push(tokio::spawn(async move { send(router, request).await.status() }));
    }
    for task in tasks {
        assert_eq!(task.await.unwrap(), StatusCode::OK);
    }

    assert_eq!(get_order(&app.conn(), &order_id).status, PaymentStatus::Succeeded);
    assert_eq!(enrollment_count(&app), 1);

    let applied: i64 = app
        .conn()
        .query_row(
            "SELECT COUNT(*) FROM webhook_events WHERE outcome = 'applied'",
            [],
            |row| row.get(0),
        )
        .unwrap();
    assert!(applied <= 1, "at most one delivery moves the order");
}

#[tokio::test]
async fn test_failed_payment_then_retry_with_new_order() {
    let app = test_app();
    let first = start_checkout(&app, "stripe").await;
    deliver(&app, &mock_reference(&first), "failed").await;
    assert_eq!(poll_status(&app).await, "failed");

    let second = start_checkout(&app, "stripe").await;
    assert_ne!(first, second);
    assert_eq!(poll_status(&app).await, "pending", "the newest order is reported");

    deliver(&app, &mock_reference(&second), "succeeded").await;
    assert_eq!(poll_status(&app).await, "succeeded");
    assert_eq!(enrollment_count(&app), 1);
}

#[tokio::test]
async fn test_redirect_checkout_stays_pending_until_confirmed() {
    let app = test_app();
    let response = send(
        app.router(),
        json_request(
            "POST",
            "/external/save-cpf",
            Some(TEST_USER),
            json!({ "course_id": PAID_COURSE, "cpf": "529.982.247-25" }),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);

    let order_id = start_checkout(&app, "hotmart").await;

    for _ in 0..3 {
        assert_eq!(poll_status(&app).await, "pending");
    }
    let report = sweeper::run_once(&app.state).unwrap();
    assert_eq!(report.expired_processing, 0, "pending redirect orders are never swept");
    assert_eq!(poll_status(&app).await, "pending");
    assert_eq!(enrollment_count(&app), 0);

    let response = send(
        app.router(),
        admin_request(
            "POST",
            &format!("/admin/payments/{}/confirm", order_id),
            Some(ADMIN_TOKEN),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);

    assert_eq!(poll_status(&app).await, "succeeded");
    assert_eq!(enrollment_count(&app), 1);
}

#[tokio::test]
async fn test_stuck_processing_order_is_swept_to_failed() {
    let app = test_app();
    let order_id = start_checkout(&app, "stripe").await;
    backdate_order(&app.conn(), &order_id, app.state.reconcile.processing_ceiling_secs + 60);

    let report = sweeper::run_once(&app.state).unwrap();
    assert_eq!(report.expired_processing, 1);

    let queries_before = app.stripe.query_count();
    assert_eq!(poll_status(&app).await, "failed");
    assert_eq!(
        app.stripe.query_count(),
        queries_before,
        "terminal orders are answered without the provider"
    );
}
