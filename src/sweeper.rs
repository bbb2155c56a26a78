//! Background reconciler.
//!
//! Each pass sweeps `processing` orders past the ceiling to `failed`, drains
//! webhook events whose order has since appeared, and retries enrollment
//! grants that were deferred. All writes go through the ledger, so a pass
//! racing live webhooks or polls is harmless.

use crate::db::{queries, AppState};
use crate::error::Result;
use crate::ledger::{self, EventDisposition, TransitionOutcome};
use crate::models::{PaymentStatus, WebhookOutcome};
use crate::util::now;

/// Counts from one reconciler pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub expired_processing: usize,
    pub drained_events: usize,
    pub orphaned_events: usize,
    pub granted_enrollments: usize,
}

/// Fail `processing` orders that have not moved within the ceiling. No gateway call.
pub fn sweep_stale_processing(state: &AppState) -> Result<usize> {
    let cutoff = now() - state.reconcile.processing_ceiling_secs;
    let stale = {
        let conn = state.db.get()?;
        queries::list_stale_processing_orders(&conn, cutoff)?
    };

    let mut count = 0;
    for order in stale {
        let mut conn = state.db.get()?;
        // Raced a late webhook or poll if this comes back stale
        if let TransitionOutcome::Applied(_) =
            ledger::apply_transition(&mut conn, &order.id, PaymentStatus::Failed, None)?
        {
            tracing::info!(
                "Order {} stuck in processing since {}, marked failed",
                order.id,
                order.updated_at
            );
            count += 1;
        }
    }
    Ok(count)
}

/// Process verified events left unprocessed, orphaning the ones whose order
/// never appeared. Returns (drained, orphaned).
pub fn drain_deferred_events(state: &AppState) -> Result<(usize, usize)> {
    let orphan_cutoff = now() - state.reconcile.webhook_orphan_secs;
    let deferred = {
        let conn = state.db.get()?;
        queries::list_deferred_webhook_events(&conn)?
    };

    let mut drained = 0;
    let mut orphaned = 0;
    for event in deferred {
        let still_deferred = if event.external_reference.is_some() {
            match ledger::process_webhook_event(state, &event)? {
                EventDisposition::Deferred => true,
                EventDisposition::Processed { outcome, .. } => {
                    tracing::debug!("Drained webhook event {}: {}", event.id, outcome.as_ref());
                    drained += 1;
                    false
                }
            }
        } else {
            true
        };

        if still_deferred && event.received_at < orphan_cutoff {
            let conn = state.db.get()?;
            if queries::mark_webhook_event_processed(&conn, &event.id, WebhookOutcome::Orphaned)? {
                tracing::warn!(
                    "Webhook event {} ({} {:?}) orphaned: no matching order",
                    event.id,
                    event.gateway,
                    event.external_reference
                );
                orphaned += 1;
            }
        }
    }
    Ok((drained, orphaned))
}

/// Grant enrollments for succeeded orders still flagged pending.
pub fn retry_pending_enrollments(state: &AppState) -> Result<usize> {
    let pending = {
        let conn = state.db.get()?;
        queries::list_enrollment_pending_orders(&conn)?
    };

    let mut count = 0;
    for order in pending {
        match ledger::retry_pending_grant(&state.db, &order.id) {
            Ok(Some(_)) => count += 1,
            Ok(None) => {}
            Err(e) => tracing::warn!("Enrollment retry for order {} failed: {}", order.id, e),
        }
    }
    Ok(count)
}

/// Run every reconciliation step once.
pub fn run_once(state: &AppState) -> Result<ReconcileReport> {
    let expired_processing = sweep_stale_processing(state)?;
    let (drained_events, orphaned_events) = drain_deferred_events(state)?;
    let granted_enrollments = retry_pending_enrollments(state)?;

    let report = ReconcileReport {
        expired_processing,
        drained_events,
        orphaned_events,
        granted_enrollments,
    };
    tracing::debug!("Reconcile pass: {:?}", report);
    Ok(report)
}

/// Spawns the periodic reconciler.
pub fn spawn_reconciler(state: AppState) {
    let interval = state.reconcile.interval;

    tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;

            if let Err(e) = run_once(&state) {
                tracing::warn!("Reconcile pass failed: {}", e);
            }
        }
    });

    tracing::info!("Background reconciler started (runs every {:?})", interval);
}
