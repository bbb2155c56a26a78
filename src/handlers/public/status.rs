use axum::extract::State;
use serde::Serialize;

use crate::db::{AppState, queries};
use crate::error::{OptionExt, Result, msg};
use crate::extractors::{CurrentUser, Json, Path};
use crate::ledger::{self, TransitionOutcome};
use crate::models::{ClientStatus, PaymentOrder, PaymentStatus};

#[derive(Debug, Serialize)]
pub struct PaymentStatusResponse {
    pub status: ClientStatus,
}

/// Ask the provider for the order's status and merge the answer through the
/// ledger. Any failure or timeout falls back to the local status.
pub(crate) async fn refresh_from_gateway(
    state: &AppState,
    order: PaymentOrder,
) -> Result<PaymentOrder> {
    let Some(reference) = order.external_reference.clone() else {
        return Ok(order);
    };
    let Some(adapter) = state.gateways.get(order.gateway) else {
        tracing::warn!("Gateway {} not configured, reporting local status", order.gateway);
        return Ok(order);
    };

    let queried =
        tokio::time::timeout(state.reconcile.query_timeout, adapter.query_status(&reference)).await;

    let remote = match queried {
        Ok(Ok(status)) => status,
        Ok(Err(e)) => {
            tracing::warn!("Status query for order {} failed: {}", order.id, e);
            return Ok(order);
        }
        Err(_) => {
            tracing::warn!(
                "Status query for order {} timed out after {:?}",
                order.id,
                state.reconcile.query_timeout
            );
            return Ok(order);
        }
    };

    // An open session reports the status the order already has
    if !order.status.can_transition_to(remote) {
        return Ok(order);
    }

    match ledger::transition(state, &order.id, remote, None)? {
        TransitionOutcome::Applied(updated) | TransitionOutcome::Stale(updated) => Ok(updated),
        TransitionOutcome::Conflict => Ok(order),
    }
}

/// Resolve the user's payment status for a course.
pub async fn get_payment_status(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(course_id): Path<String>,
) -> Result<Json<PaymentStatusResponse>> {
    let order = {
        let conn = state.db.get()?;

        // Enrollment is the source of truth, and covers free courses
        if queries::get_enrollment(&conn, &user.user_id, &course_id)?.is_some() {
            return Ok(Json(PaymentStatusResponse {
                status: ClientStatus::Succeeded,
            }));
        }

        queries::get_latest_payment_order(&conn, &user.user_id, &course_id)?
            .or_not_found(msg::NO_PAYMENT_FOR_COURSE)?
    };

    let order = if order.gateway.is_integrated() && !order.status.is_terminal() {
        refresh_from_gateway(&state, order).await?
    } else {
        order
    };

    if order.status == PaymentStatus::Succeeded && order.enrollment_pending {
        match ledger::retry_pending_grant(&state.db, &order.id) {
            Ok(_) => tracing::debug!("Retried pending enrollment for order {}", order.id),
            Err(e) => tracing::warn!("Pending enrollment retry for order {} failed: {}", order.id, e),
        }
    }

    Ok(Json(PaymentStatusResponse {
        status: order.status.client_status(),
    }))
}
