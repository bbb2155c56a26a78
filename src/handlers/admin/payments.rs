use axum::extract::State;
use serde::Serialize;

use crate::db::{AppState, queries};
use crate::error::{AppError, OptionExt, Result, msg};
use crate::extractors::{Json, Path};
use crate::id::is_valid_prefixed_id;
use crate::ledger::{self, TransitionOutcome};
use crate::models::{PaymentOrder, PaymentStatus, PendingExternalOrder};

const MANUAL_CONFIRMATION: &str = r#"{"source":"manual_confirmation"}"#;
const MANUAL_REJECTION: &str = r#"{"source":"manual_rejection"}"#;

#[derive(Debug, Serialize)]
pub struct AdminOrderResponse {
    pub order: PaymentOrder,
    /// Whether the enrollment exists (false while a deferred grant is pending)
    pub enrolled: bool,
}

pub async fn list_pending_external(
    State(state): State<AppState>,
) -> Result<Json<Vec<PendingExternalOrder>>> {
    let conn = state.db.get()?;
    let orders = queries::list_pending_external_orders(&conn)?;
    Ok(Json(orders))
}

/// Settle a redirect-gateway order by hand. Repeating the same decision is a
/// no-op; contradicting a final state is a conflict.
fn settle_external(
    state: &AppState,
    order_id: &str,
    target: PaymentStatus,
    raw_event: &str,
) -> Result<AdminOrderResponse> {
    if !is_valid_prefixed_id(order_id) {
        return Err(AppError::NotFound(msg::ORDER_NOT_FOUND.into()));
    }

    let order = {
        let conn = state.db.get()?;
        queries::get_payment_order_by_id(&conn, order_id)?.or_not_found(msg::ORDER_NOT_FOUND)?
    };

    if order.gateway.is_integrated() {
        return Err(AppError::BadRequest(msg::NOT_REDIRECT_ORDER.into()));
    }

    let order = match ledger::transition(state, &order.id, target, Some(raw_event))? {
        TransitionOutcome::Applied(order) => {
            tracing::info!("Order {} manually marked {}", order.id, target);
            order
        }
        TransitionOutcome::Stale(order) if order.status == target => order,
        TransitionOutcome::Stale(_) => {
            return Err(AppError::Conflict(msg::ORDER_ALREADY_FINAL.into()));
        }
        TransitionOutcome::Conflict => {
            return Err(AppError::Conflict("Order is being updated, retry".into()));
        }
    };

    let conn = state.db.get()?;
    let enrolled = queries::get_enrollment(&conn, &order.user_id, &order.course_id)?.is_some();

    Ok(AdminOrderResponse { order, enrolled })
}

pub async fn confirm_external_payment(
    State(state): State<AppState>,
    Path(order_id): Path<String>,
) -> Result<Json<AdminOrderResponse>> {
    settle_external(&state, &order_id, PaymentStatus::Succeeded, MANUAL_CONFIRMATION).map(Json)
}

pub async fn reject_external_payment(
    State(state): State<AppState>,
    Path(order_id): Path<String>,
) -> Result<Json<AdminOrderResponse>> {
    settle_external(&state, &order_id, PaymentStatus::Failed, MANUAL_REJECTION).map(Json)
}
