//! Payment order queries: creation, references, compare-and-set, listings

#[path = "../common/mod.rs"]
mod common;

use common::*;

#[test]
fn test_create_order_starts_pending() {
    let app = test_app();
    let conn = app.conn();

    let order = create_test_order(&conn, TEST_USER, PAID_COURSE, Gateway::Stripe);

    assert!(order.id.starts_with("cp_ord_"), "order id should carry its prefix");
    assert_eq!(order.status, PaymentStatus::Pending);
    assert_eq!(order.version, 0);
    assert!(order.external_reference.is_none());
    assert!(!order.enrollment_pending);

    let stored = get_order(&conn, &order.id);
    assert_eq!(stored.status, PaymentStatus::Pending);
    assert_eq!(stored.gateway, Gateway::Stripe);
    assert_eq!(stored.amount_cents, 19900);
}

#[test]
fn test_one_active_order_per_user_course() {
    let app = test_app();
    let mut conn = app.conn();

    let first = create_test_order(&conn, TEST_USER, PAID_COURSE, Gateway::Stripe);

    let second = queries::create_payment_order(
        &conn,
        &CreatePaymentOrder {
            user_id: TEST_USER.to_string(),
            course_id: PAID_COURSE.to_string(),
            gateway: Gateway::Hotmart,
            amount_cents: 19900,
            currency: "brl".to_string(),
        },
    );
    assert!(second.is_err(), "second in-flight order must violate the active index");

    // Another user is unaffected
    create_test_order(&conn, OTHER_USER, PAID_COURSE, Gateway::Stripe);

    // Once the first order is terminal a new one may open
    ledger::apply_transition(&mut conn, &first.id, PaymentStatus::Cancelled, None).unwrap();
    let third = create_test_order(&conn, TEST_USER, PAID_COURSE, Gateway::Hotmart);
    assert_eq!(third.status, PaymentStatus::Pending);
}

#[test]
fn test_external_reference_assigned_once() {
    let app = test_app();
    let conn = app.conn();
    let order = create_test_order(&conn, TEST_USER, PAID_COURSE, Gateway::Stripe);
    assert!(order.saved_checkout().is_none());

    let first = CheckoutTarget::Url("https://checkout.stripe.com/c/cs_test_1".to_string());
    let second = CheckoutTarget::Url("https://checkout.stripe.com/c/cs_test_2".to_string());
    assert!(queries::attach_checkout(&conn, &order.id, "cs_test_1", &first).unwrap());
    assert!(
        !queries::attach_checkout(&conn, &order.id, "cs_test_2", &second).unwrap(),
        "a reference must never be replaced"
    );

    let stored = get_order(&conn, &order.id);
    assert_eq!(stored.external_reference.as_deref(), Some("cs_test_1"));
    assert_eq!(stored.saved_checkout(), Some(first), "the first session is kept");
    assert_eq!(stored.version, 1, "attaching the reference bumps the version");

    let found = queries::get_payment_order_by_reference(&conn, Gateway::Stripe, "cs_test_1")
        .unwrap()
        .expect("order should be found by reference");
    assert_eq!(found.id, order.id);

    assert!(
        queries::get_payment_order_by_reference(&conn, Gateway::MercadoPago, "cs_test_1")
            .unwrap()
            .is_none(),
        "references are scoped per gateway"
    );
}

#[test]
fn test_reference_unique_per_gateway() {
    let app = test_app();
    let conn = app.conn();
    let first = create_test_order(&conn, TEST_USER, PAID_COURSE, Gateway::Stripe);
    let second = create_test_order(&conn, OTHER_USER, PAID_COURSE, Gateway::Stripe);

    let target = CheckoutTarget::ClientSecret("cs_secret".to_string());
    queries::attach_checkout(&conn, &first.id, "shared-ref", &target).unwrap();
    let result = queries::attach_checkout(&conn, &second.id, "shared-ref", &target);
    assert!(result.is_err(), "same reference on the same gateway must be rejected");
}

#[test]
fn test_compare_and_set_rejects_stale_snapshot() {
    let app = test_app();
    let conn = app.conn();
    let snapshot = create_test_order(&conn, TEST_USER, PAID_COURSE, Gateway::Stripe);

    assert!(
        queries::compare_and_set_status(&conn, &snapshot, PaymentStatus::Processing, None).unwrap()
    );
    assert!(
        !queries::compare_and_set_status(&conn, &snapshot, PaymentStatus::Failed, None).unwrap(),
        "a write against an outdated version must not land"
    );

    let stored = get_order(&conn, &snapshot.id);
    assert_eq!(stored.status, PaymentStatus::Processing);
    assert_eq!(stored.version, 1);
}

#[test]
fn test_compare_and_set_to_succeeded_raises_enrollment_pending() {
    let app = test_app();
    let conn = app.conn();
    let order = create_test_order(&conn, TEST_USER, PAID_COURSE, Gateway::Stripe);

    assert!(queries::compare_and_set_status(
        &conn,
        &order,
        PaymentStatus::Succeeded,
        Some(r#"{"source":"test"}"#)
    )
    .unwrap());

    let stored = get_order(&conn, &order.id);
    assert_eq!(stored.status, PaymentStatus::Succeeded);
    assert!(stored.enrollment_pending);
    assert_eq!(stored.raw_last_event.as_deref(), Some(r#"{"source":"test"}"#));

    assert!(queries::clear_enrollment_pending(&conn, &order.id).unwrap());
    assert!(!queries::clear_enrollment_pending(&conn, &order.id).unwrap());
    assert!(!get_order(&conn, &order.id).enrollment_pending);
}

#[test]
fn test_latest_order_and_history() {
    let app = test_app();
    let mut conn = app.conn();

    let first = create_test_order(&conn, TEST_USER, PAID_COURSE, Gateway::Stripe);
    ledger::apply_transition(&mut conn, &first.id, PaymentStatus::Failed, None).unwrap();
    let second = create_test_order(&conn, TEST_USER, PAID_COURSE, Gateway::Kiwify);

    let latest = queries::get_latest_payment_order(&conn, TEST_USER, PAID_COURSE)
        .unwrap()
        .unwrap();
    assert_eq!(latest.id, second.id);

    let active = queries::get_active_payment_order(&conn, TEST_USER, PAID_COURSE)
        .unwrap()
        .unwrap();
    assert_eq!(active.id, second.id);

    let history =
        queries::list_payment_orders_for_user_course(&conn, TEST_USER, PAID_COURSE).unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].id, first.id);
    assert_eq!(history[0].status, PaymentStatus::Failed);

    assert!(queries::get_latest_payment_order(&conn, OTHER_USER, PAID_COURSE)
        .unwrap()
        .is_none());
}

#[test]
fn test_list_stale_processing_orders() {
    let app = test_app();
    let mut conn = app.conn();

    let stale = create_processing_order(&mut conn, TEST_USER, PAID_COURSE, Gateway::Stripe, "ref-a");
    let fresh = create_processing_order(&mut conn, OTHER_USER, PAID_COURSE, Gateway::Stripe, "ref-b");
    backdate_order(&conn, &stale.id, 7200);

    let cutoff = coursepay::util::now() - 3600;
    let listed = queries::list_stale_processing_orders(&conn, cutoff).unwrap();
    let ids: Vec<_> = listed.iter().map(|o| o.id.as_str()).collect();

    assert_eq!(ids, vec![stale.id.as_str()]);
    assert!(!ids.contains(&fresh.id.as_str()));
}

#[test]
fn test_list_pending_external_orders_joins_tax_id() {
    let app = test_app();
    let conn = app.conn();

    let hotmart = create_test_order(&conn, TEST_USER, PAID_COURSE, Gateway::Hotmart);
    queries::upsert_external_checkout_record(&conn, TEST_USER, PAID_COURSE, "52998224725").unwrap();
    let kiwify = create_test_order(&conn, OTHER_USER, PAID_COURSE, Gateway::Kiwify);
    create_test_course(&conn, "course-other", 5000);
    create_test_order(&conn, TEST_USER, "course-other", Gateway::Stripe);

    let pending = queries::list_pending_external_orders(&conn).unwrap();
    assert_eq!(pending.len(), 2, "integrated orders are not listed");

    let with_tax = pending.iter().find(|p| p.order_id == hotmart.id).unwrap();
    assert_eq!(with_tax.tax_id.as_deref(), Some("52998224725"));
    assert_eq!(with_tax.gateway, Gateway::Hotmart);

    let without_tax = pending.iter().find(|p| p.order_id == kiwify.id).unwrap();
    assert!(without_tax.tax_id.is_none());
}

#[test]
fn test_upsert_course_updates_in_place() {
    let app = test_app();
    let conn = app.conn();

    let course = create_test_course(&conn, "course-x", 1000);
    assert_eq!(course.price_cents, 1000);
    create_test_course(&conn, "course-x", 0);

    let stored = queries::get_course_by_id(&conn, "course-x").unwrap().unwrap();
    assert!(stored.is_free());
    assert_eq!(queries::count_courses(&conn).unwrap(), 3);
}

#[test]
fn test_external_checkout_record_latest_write_wins() {
    let app = test_app();
    let conn = app.conn();

    queries::upsert_external_checkout_record(&conn, TEST_USER, PAID_COURSE, "52998224725").unwrap();
    queries::upsert_external_checkout_record(&conn, TEST_USER, PAID_COURSE, "11144477735").unwrap();

    let record = queries::get_external_checkout_record(&conn, TEST_USER, PAID_COURSE)
        .unwrap()
        .unwrap();
    assert_eq!(record.tax_id, "11144477735");
}
