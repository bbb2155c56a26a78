use rusqlite::{Connection, params};

use crate::error::Result;
use crate::id::EntityType;
use crate::models::*;
use crate::payments::{CheckoutTarget, Gateway};
use crate::util::now;

use super::from_row::{
    COURSE_COLS, ENROLLMENT_COLS, EXTERNAL_CHECKOUT_COLS, PAYMENT_ORDER_COLS, WEBHOOK_EVENT_COLS,
    query_all, query_one,
};

// ============ Courses ============

/// Insert or refresh a course projection row.
pub fn upsert_course(conn: &Connection, input: &UpsertCourse) -> Result<Course> {
    let now = now();
    conn.execute(
        "INSERT INTO courses (id, title, price_cents, currency, hotmart_url, kiwify_url, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
         ON CONFLICT(id) DO UPDATE SET
            title = excluded.title,
            price_cents = excluded.price_cents,
            currency = excluded.currency,
            hotmart_url = excluded.hotmart_url,
            kiwify_url = excluded.kiwify_url,
            updated_at = excluded.updated_at",
        params![
            &input.id,
            &input.title,
            input.price_cents,
            &input.currency.to_lowercase(),
            &input.hotmart_url,
            &input.kiwify_url,
            now
        ],
    )?;

    Ok(Course {
        id: input.id.clone(),
        title: input.title.clone(),
        price_cents: input.price_cents,
        currency: input.currency.to_lowercase(),
        hotmart_url: input.hotmart_url.clone(),
        kiwify_url: input.kiwify_url.clone(),
    })
}

pub fn get_course_by_id(conn: &Connection, id: &str) -> Result<Option<Course>> {
    query_one(
        conn,
        &format!("SELECT {} FROM courses WHERE id = ?1", COURSE_COLS),
        &[&id],
    )
}

pub fn count_courses(conn: &Connection) -> Result<i64> {
    conn.query_row("SELECT COUNT(*) FROM courses", [], |row| row.get(0))
        .map_err(Into::into)
}

// ============ Payment Orders ============

/// Create a new order in `pending`. Fails with a constraint error if the user
/// already has a non-terminal order for the course.
pub fn create_payment_order(conn: &Connection, input: &CreatePaymentOrder) -> Result<PaymentOrder> {
    let id = EntityType::PaymentOrder.gen_id();
    let now = now();
    conn.execute(
        "INSERT INTO payment_orders (id, user_id, course_id, gateway, amount_cents, currency, status, version, enrollment_pending, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, 0, ?8, ?8)",
        params![
            &id,
            &input.user_id,
            &input.course_id,
            input.gateway.as_ref(),
            input.amount_cents,
            &input.currency,
            PaymentStatus::Pending.as_ref(),
            now
        ],
    )?;

    Ok(PaymentOrder {
        id,
        user_id: input.user_id.clone(),
        course_id: input.course_id.clone(),
        gateway: input.gateway,
        external_reference: None,
        amount_cents: input.amount_cents,
        currency: input.currency.clone(),
        status: PaymentStatus::Pending,
        version: 0,
        enrollment_pending: false,
        created_at: now,
        updated_at: now,
        raw_last_event: None,
        checkout_url: None,
        client_secret: None,
    })
}

pub fn get_payment_order_by_id(conn: &Connection, id: &str) -> Result<Option<PaymentOrder>> {
    query_one(
        conn,
        &format!("SELECT {} FROM payment_orders WHERE id = ?1", PAYMENT_ORDER_COLS),
        &[&id],
    )
}

pub fn get_payment_order_by_reference(
    conn: &Connection,
    gateway: Gateway,
    external_reference: &str,
) -> Result<Option<PaymentOrder>> {
    query_one(
        conn,
        &format!(
            "SELECT {} FROM payment_orders WHERE gateway = ?1 AND external_reference = ?2",
            PAYMENT_ORDER_COLS
        ),
        &[&gateway.as_ref(), &external_reference],
    )
}

/// The one in-flight (pending or processing) order for a user and course, if any.
pub fn get_active_payment_order(
    conn: &Connection,
    user_id: &str,
    course_id: &str,
) -> Result<Option<PaymentOrder>> {
    query_one(
        conn,
        &format!(
            "SELECT {} FROM payment_orders
             WHERE user_id = ?1 AND course_id = ?2 AND status IN ('pending', 'processing')",
            PAYMENT_ORDER_COLS
        ),
        &[&user_id, &course_id],
    )
}

/// Most recent order for a user and course, in any status.
pub fn get_latest_payment_order(
    conn: &Connection,
    user_id: &str,
    course_id: &str,
) -> Result<Option<PaymentOrder>> {
    query_one(
        conn,
        &format!(
            "SELECT {} FROM payment_orders
             WHERE user_id = ?1 AND course_id = ?2
             ORDER BY created_at DESC, rowid DESC LIMIT 1",
            PAYMENT_ORDER_COLS
        ),
        &[&user_id, &course_id],
    )
}

pub fn list_payment_orders_for_user_course(
    conn: &Connection,
    user_id: &str,
    course_id: &str,
) -> Result<Vec<PaymentOrder>> {
    query_all(
        conn,
        &format!(
            "SELECT {} FROM payment_orders
             WHERE user_id = ?1 AND course_id = ?2
             ORDER BY created_at, rowid",
            PAYMENT_ORDER_COLS
        ),
        &[&user_id, &course_id],
    )
}

/// Compare-and-set a status change against the snapshot the caller validated.
///
/// Returns false if another writer bumped the version or moved the status in
/// between; the caller must re-read and re-validate. Moving to `succeeded`
/// also raises `enrollment_pending` in the same statement.
pub fn compare_and_set_status(
    conn: &Connection,
    expected: &PaymentOrder,
    next: PaymentStatus,
    raw_event: Option<&str>,
) -> Result<bool> {
    let mark_pending = next == PaymentStatus::Succeeded;
    let affected = conn.execute(
        "UPDATE payment_orders SET
            status = ?1,
            version = version + 1,
            updated_at = ?2,
            enrollment_pending = CASE WHEN ?3 THEN 1 ELSE enrollment_pending END,
            raw_last_event = COALESCE(?4, raw_last_event)
         WHERE id = ?5 AND version = ?6 AND status = ?7",
        params![
            next.as_ref(),
            now(),
            mark_pending,
            raw_event,
            &expected.id,
            expected.version,
            expected.status.as_ref()
        ],
    )?;
    Ok(affected > 0)
}

/// Attach the provider reference and session returned by create-checkout.
///
/// Returns false when the order already carries a session, e.g. another tab's
/// checkout attached first. The existing session is kept.
pub fn attach_checkout(
    conn: &Connection,
    order_id: &str,
    external_reference: &str,
    target: &CheckoutTarget,
) -> Result<bool> {
    let (checkout_url, client_secret) = match target {
        CheckoutTarget::Url(url) => (Some(url.as_str()), None),
        CheckoutTarget::ClientSecret(secret) => (None, Some(secret.as_str())),
    };
    let affected = conn.execute(
        "UPDATE payment_orders SET external_reference = ?1, checkout_url = ?2, client_secret = ?3,
            version = version + 1, updated_at = ?4
         WHERE id = ?5 AND external_reference IS NULL",
        params![external_reference, checkout_url, client_secret, now(), order_id],
    )?;
    Ok(affected > 0)
}

/// Clear the grant-pending flag once an enrollment exists for the order's user and course.
pub fn clear_enrollment_pending(conn: &Connection, order_id: &str) -> Result<bool> {
    let affected = conn.execute(
        "UPDATE payment_orders SET enrollment_pending = 0, version = version + 1, updated_at = ?1
         WHERE id = ?2 AND enrollment_pending = 1",
        params![now(), order_id],
    )?;
    Ok(affected > 0)
}

/// `processing` orders not touched since `cutoff`.
pub fn list_stale_processing_orders(conn: &Connection, cutoff: i64) -> Result<Vec<PaymentOrder>> {
    query_all(
        conn,
        &format!(
            "SELECT {} FROM payment_orders
             WHERE status = 'processing' AND updated_at < ?1
             ORDER BY updated_at",
            PAYMENT_ORDER_COLS
        ),
        &[&cutoff],
    )
}

/// Succeeded orders whose enrollment grant has not been confirmed.
pub fn list_enrollment_pending_orders(conn: &Connection) -> Result<Vec<PaymentOrder>> {
    query_all(
        conn,
        &format!(
            "SELECT {} FROM payment_orders
             WHERE enrollment_pending = 1 AND status = 'succeeded'
             ORDER BY updated_at",
            PAYMENT_ORDER_COLS
        ),
        &[],
    )
}

/// Redirect-gateway orders awaiting manual confirmation, with the captured tax id.
pub fn list_pending_external_orders(conn: &Connection) -> Result<Vec<PendingExternalOrder>> {
    query_all(
        conn,
        "SELECT o.id, o.user_id, o.course_id, o.gateway, o.amount_cents, o.currency, o.created_at, r.tax_id
         FROM payment_orders o
         LEFT JOIN external_checkout_records r
            ON r.user_id = o.user_id AND r.course_id = o.course_id
         WHERE o.gateway IN ('hotmart', 'kiwify') AND o.status = 'pending'
         ORDER BY o.created_at",
        &[],
    )
}

// ============ Enrollments ============

/// Conditionally insert an enrollment. Returns None when one already exists
/// for the user and course.
pub fn insert_enrollment_if_absent(
    conn: &Connection,
    user_id: &str,
    course_id: &str,
    order_id: Option<&str>,
) -> Result<Option<Enrollment>> {
    let id = EntityType::Enrollment.gen_id();
    let now = now();
    let affected = conn.execute(
        "INSERT INTO enrollments (id, user_id, course_id, order_id, enrolled_at, progress)
         VALUES (?1, ?2, ?3, ?4, ?5, 0)
         ON CONFLICT(user_id, course_id) DO NOTHING",
        params![&id, user_id, course_id, order_id, now],
    )?;

    if affected == 0 {
        return Ok(None);
    }

    Ok(Some(Enrollment {
        id,
        user_id: user_id.to_string(),
        course_id: course_id.to_string(),
        order_id: order_id.map(String::from),
        enrolled_at: now,
        progress: 0,
    }))
}

pub fn get_enrollment(
    conn: &Connection,
    user_id: &str,
    course_id: &str,
) -> Result<Option<Enrollment>> {
    query_one(
        conn,
        &format!(
            "SELECT {} FROM enrollments WHERE user_id = ?1 AND course_id = ?2",
            ENROLLMENT_COLS
        ),
        &[&user_id, &course_id],
    )
}

pub fn count_enrollments(conn: &Connection, user_id: &str, course_id: &str) -> Result<i64> {
    conn.query_row(
        "SELECT COUNT(*) FROM enrollments WHERE user_id = ?1 AND course_id = ?2",
        params![user_id, course_id],
        |row| row.get(0),
    )
    .map_err(Into::into)
}

// ============ Webhook Events ============

/// Append a webhook delivery to the audit log.
pub fn insert_webhook_event(conn: &Connection, input: &CreateWebhookEvent) -> Result<WebhookEvent> {
    let id = EntityType::WebhookEvent.gen_id();
    let now = now();
    let dedup = dedup_key(
        input.gateway,
        input.external_reference.as_deref(),
        input.declared_status,
    );
    conn.execute(
        "INSERT INTO webhook_events (id, gateway, external_reference, declared_status, dedup_key, received_at, signature_valid, processed, outcome, payload)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, ?8, ?9)",
        params![
            &id,
            input.gateway.as_ref(),
            &input.external_reference,
            input.declared_status.map(|s| s.as_ref().to_string()),
            &dedup,
            now,
            input.signature_valid,
            input.outcome.map(|o| o.as_ref().to_string()),
            &input.payload
        ],
    )?;

    Ok(WebhookEvent {
        id,
        gateway: input.gateway,
        external_reference: input.external_reference.clone(),
        declared_status: input.declared_status,
        dedup_key: dedup,
        received_at: now,
        signature_valid: input.signature_valid,
        processed: false,
        outcome: input.outcome,
        payload: input.payload.clone(),
    })
}

pub fn get_webhook_event_by_id(conn: &Connection, id: &str) -> Result<Option<WebhookEvent>> {
    query_one(
        conn,
        &format!("SELECT {} FROM webhook_events WHERE id = ?1", WEBHOOK_EVENT_COLS),
        &[&id],
    )
}

pub fn list_webhook_events_for_reference(
    conn: &Connection,
    gateway: Gateway,
    external_reference: &str,
) -> Result<Vec<WebhookEvent>> {
    query_all(
        conn,
        &format!(
            "SELECT {} FROM webhook_events
             WHERE gateway = ?1 AND external_reference = ?2
             ORDER BY received_at, rowid",
            WEBHOOK_EVENT_COLS
        ),
        &[&gateway.as_ref(), &external_reference],
    )
}

/// Close out an event. An event is processed at most once.
pub fn mark_webhook_event_processed(
    conn: &Connection,
    id: &str,
    outcome: WebhookOutcome,
) -> Result<bool> {
    let affected = conn.execute(
        "UPDATE webhook_events SET processed = 1, outcome = ?1 WHERE id = ?2 AND processed = 0",
        params![outcome.as_ref(), id],
    )?;
    Ok(affected > 0)
}

/// True if another event with the same dedup key was already processed.
pub fn is_dedup_key_processed(conn: &Connection, dedup_key: &str, exclude_id: &str) -> Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM webhook_events WHERE dedup_key = ?1 AND processed = 1 AND id != ?2",
        params![dedup_key, exclude_id],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

/// Verified events still waiting for processing, oldest first.
pub fn list_deferred_webhook_events(conn: &Connection) -> Result<Vec<WebhookEvent>> {
    query_all(
        conn,
        &format!(
            "SELECT {} FROM webhook_events
             WHERE processed = 0 AND signature_valid = 1
             ORDER BY received_at, rowid",
            WEBHOOK_EVENT_COLS
        ),
        &[],
    )
}

// ============ External Checkout Records ============

/// Save the tax id for a redirect checkout. Latest write wins.
pub fn upsert_external_checkout_record(
    conn: &Connection,
    user_id: &str,
    course_id: &str,
    tax_id: &str,
) -> Result<ExternalCheckoutRecord> {
    let now = now();
    conn.execute(
        "INSERT INTO external_checkout_records (user_id, course_id, tax_id, captured_at)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(user_id, course_id) DO UPDATE SET
            tax_id = excluded.tax_id,
            captured_at = excluded.captured_at",
        params![user_id, course_id, tax_id, now],
    )?;

    Ok(ExternalCheckoutRecord {
        user_id: user_id.to_string(),
        course_id: course_id.to_string(),
        tax_id: tax_id.to_string(),
        captured_at: now,
    })
}

pub fn get_external_checkout_record(
    conn: &Connection,
    user_id: &str,
    course_id: &str,
) -> Result<Option<ExternalCheckoutRecord>> {
    query_one(
        conn,
        &format!(
            "SELECT {} FROM external_checkout_records WHERE user_id = ?1 AND course_id = ?2",
            EXTERNAL_CHECKOUT_COLS
        ),
        &[&user_id, &course_id],
    )
}
