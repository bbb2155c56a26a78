//! Order ledger transitions.
//!
//! Every status change, whether it comes from a webhook, a poll, a manual
//! confirmation or the reconciler, goes through [`advance`]: read the order,
//! validate the move against the state machine, then compare-and-set on
//! `(version, status)`. A lost race re-reads and re-validates, so the first
//! valid forward transition wins and everything after it is stale.
//!
//! A move to `succeeded` also attempts the enrollment grant inside a savepoint
//! of the same transaction. If the grant fails the transition still commits
//! with `enrollment_pending` set, and a background retry picks it up.

use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use rusqlite::{Connection, Transaction, TransactionBehavior};

use crate::db::{queries, AppState, DbPool};
use crate::enrollment::{self, GrantOutcome};
use crate::error::{msg, OptionExt, Result};
use crate::models::{PaymentOrder, PaymentStatus, WebhookEvent, WebhookOutcome};

/// Re-read attempts after a lost compare-and-set before giving up.
const MAX_CAS_ATTEMPTS: usize = 3;

#[derive(Debug, Clone)]
pub enum TransitionOutcome {
    /// The order moved; carries the row as committed.
    Applied(PaymentOrder),
    /// Not a forward move from the current status; carries the current row.
    Stale(PaymentOrder),
    /// Kept losing the compare-and-set race.
    Conflict,
}

impl TransitionOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied(_))
    }

    /// Applied to `succeeded` but the grant did not land.
    fn needs_grant_retry(&self) -> Option<&PaymentOrder> {
        match self {
            Self::Applied(order) if order.enrollment_pending => Some(order),
            _ => None,
        }
    }
}

/// Attempt a forward transition inside an open transaction.
pub fn advance(
    tx: &mut Transaction<'_>,
    order_id: &str,
    next: PaymentStatus,
    raw_event: Option<&str>,
) -> Result<TransitionOutcome> {
    for attempt in 1..=MAX_CAS_ATTEMPTS {
        let order =
            queries::get_payment_order_by_id(tx, order_id)?.or_not_found(msg::ORDER_NOT_FOUND)?;

        if !order.status.can_transition_to(next) {
            tracing::debug!(
                "Stale transition for order {}: {} -> {} discarded",
                order_id,
                order.status,
                next
            );
            return Ok(TransitionOutcome::Stale(order));
        }

        if !queries::compare_and_set_status(tx, &order, next, raw_event)? {
            tracing::debug!(
                "Compare-and-set lost for order {} (attempt {}), re-reading",
                order_id,
                attempt
            );
            continue;
        }

        tracing::info!("Order {}: {} -> {}", order_id, order.status, next);

        if next == PaymentStatus::Succeeded {
            grant_in_savepoint(tx, &order);
        }

        let updated =
            queries::get_payment_order_by_id(tx, order_id)?.or_not_found(msg::ORDER_NOT_FOUND)?;
        return Ok(TransitionOutcome::Applied(updated));
    }

    tracing::warn!(
        "Order {}: gave up on {} after {} compare-and-set attempts",
        order_id,
        next,
        MAX_CAS_ATTEMPTS
    );
    Ok(TransitionOutcome::Conflict)
}

/// First grant attempt for a freshly succeeded order. A failure rolls back
/// only the savepoint; the transition itself stays.
fn grant_in_savepoint(tx: &mut Transaction<'_>, order: &PaymentOrder) {
    let sp = match tx.savepoint() {
        Ok(sp) => sp,
        Err(e) => {
            tracing::warn!("Could not open grant savepoint for order {}: {}", order.id, e);
            return;
        }
    };

    match enrollment::grant(&sp, &order.user_id, &order.course_id, Some(&order.id)) {
        Ok(_) => {
            if let Err(e) = sp.commit() {
                tracing::warn!("Grant savepoint release failed for order {}: {}", order.id, e);
            }
        }
        Err(e) => {
            // Dropping the savepoint rolls it back
            tracing::warn!(
                "Enrollment grant failed for order {}, deferring: {}",
                order.id,
                e
            );
        }
    }
}

/// Apply a transition in its own immediate transaction.
pub fn apply_transition(
    conn: &mut Connection,
    order_id: &str,
    next: PaymentStatus,
    raw_event: Option<&str>,
) -> Result<TransitionOutcome> {
    let mut tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let outcome = advance(&mut tx, order_id, next, raw_event)?;
    tx.commit()?;
    Ok(outcome)
}

/// [`apply_transition`] against the pool, scheduling a grant retry when the
/// order succeeded without its enrollment.
pub fn transition(
    state: &AppState,
    order_id: &str,
    next: PaymentStatus,
    raw_event: Option<&str>,
) -> Result<TransitionOutcome> {
    let mut conn = state.db.get()?;
    let outcome = apply_transition(&mut conn, order_id, next, raw_event)?;
    schedule_grant_retry(state, &outcome);
    Ok(outcome)
}

pub fn schedule_grant_retry(state: &AppState, outcome: &TransitionOutcome) {
    if let Some(order) = outcome.needs_grant_retry() {
        spawn_grant_retry(state, &order.id);
    }
}

// ============ Enrollment Retries ============

/// Grant the enrollment for a succeeded order that is still flagged pending.
/// Returns None when there is nothing left to do.
pub fn retry_pending_grant(pool: &DbPool, order_id: &str) -> Result<Option<GrantOutcome>> {
    let mut conn = pool.get()?;
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let order = match queries::get_payment_order_by_id(&tx, order_id)? {
        Some(order) if order.status == PaymentStatus::Succeeded && order.enrollment_pending => {
            order
        }
        _ => return Ok(None),
    };

    let outcome = enrollment::grant(&tx, &order.user_id, &order.course_id, Some(&order.id))?;
    tx.commit()?;
    Ok(Some(outcome))
}

fn grant_backoff(max_attempts: usize) -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(200))
        .with_max_delay(Duration::from_secs(30))
        .with_max_times(max_attempts)
        .with_jitter()
}

/// Retry a deferred grant in the background with exponential backoff. The
/// caller never waits on it; once attempts run out the reconciler takes over.
pub fn spawn_grant_retry(state: &AppState, order_id: &str) {
    let pool = state.db.clone();
    let max_attempts = state.reconcile.grant_max_attempts;
    let order_id = order_id.to_string();

    tokio::spawn(async move {
        let result = (|| async { retry_pending_grant(&pool, &order_id) })
            .retry(grant_backoff(max_attempts))
            .notify(|err, delay| {
                tracing::warn!(
                    "Enrollment grant for order {} failed, retrying in {:?}: {}",
                    order_id,
                    delay,
                    err
                );
            })
            .await;

        match result {
            Ok(Some(_)) => tracing::info!("Deferred enrollment granted for order {}", order_id),
            Ok(None) => tracing::debug!("Order {} needed no deferred grant", order_id),
            Err(e) => tracing::error!(
                "Enrollment grant for order {} still failing after {} attempts, leaving to reconciler: {}",
                order_id,
                max_attempts,
                e
            ),
        }
    });
}

// ============ Webhook Event Processing ============

#[derive(Debug, Clone)]
pub enum EventDisposition {
    /// No order for the reference yet; left unprocessed for the drain.
    Deferred,
    Processed {
        outcome: WebhookOutcome,
        order: Option<PaymentOrder>,
    },
}

impl EventDisposition {
    pub fn outcome(&self) -> Option<WebhookOutcome> {
        match self {
            Self::Deferred => None,
            Self::Processed { outcome, .. } => Some(*outcome),
        }
    }
}

/// Reconcile a recorded, verified webhook event against the ledger.
///
/// Marking the event processed shares the transaction with the transition,
/// so an event is applied at most once even under redelivery.
pub fn process_webhook_event(state: &AppState, event: &WebhookEvent) -> Result<EventDisposition> {
    let mut conn = state.db.get()?;
    let disposition = process_event_on(&mut conn, event)?;

    if let EventDisposition::Processed {
        outcome: WebhookOutcome::Applied,
        order: Some(order),
    } = &disposition
    {
        if order.enrollment_pending {
            spawn_grant_retry(state, &order.id);
        }
    }

    Ok(disposition)
}

fn process_event_on(conn: &mut Connection, event: &WebhookEvent) -> Result<EventDisposition> {
    let Some(declared) = event.declared_status else {
        queries::mark_webhook_event_processed(conn, &event.id, WebhookOutcome::Ignored)?;
        return Ok(EventDisposition::Processed {
            outcome: WebhookOutcome::Ignored,
            order: None,
        });
    };
    let Some(reference) = event.external_reference.as_deref() else {
        return Ok(EventDisposition::Deferred);
    };

    let mut tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let Some(order) = queries::get_payment_order_by_reference(&tx, event.gateway, reference)? else {
        tracing::info!(
            "No order yet for {} reference {}, deferring event {}",
            event.gateway,
            reference,
            event.id
        );
        return Ok(EventDisposition::Deferred);
    };

    if let Some(ref key) = event.dedup_key {
        if queries::is_dedup_key_processed(&tx, key, &event.id)? {
            tracing::debug!("Duplicate webhook {} ({}), no-op", event.id, key);
            queries::mark_webhook_event_processed(&tx, &event.id, WebhookOutcome::Duplicate)?;
            tx.commit()?;
            return Ok(EventDisposition::Processed {
                outcome: WebhookOutcome::Duplicate,
                order: Some(order),
            });
        }
    }

    let (outcome, order) = match advance(&mut tx, &order.id, declared, Some(&event.payload))? {
        TransitionOutcome::Applied(order) => (WebhookOutcome::Applied, order),
        TransitionOutcome::Stale(order) => (WebhookOutcome::Stale, order),
        // Left unprocessed; the drain retries it
        TransitionOutcome::Conflict => return Ok(EventDisposition::Deferred),
    };

    queries::mark_webhook_event_processed(&tx, &event.id, outcome)?;
    tx.commit()?;

    Ok(EventDisposition::Processed {
        outcome,
        order: Some(order),
    })
}
