use std::time::Duration;

use axum::extract::State;
use backon::{ExponentialBuilder, Retryable};
use rusqlite::{Connection, TransactionBehavior};
use serde::{Deserialize, Serialize};

use crate::db::{AppState, queries};
use crate::error::{AppError, OptionExt, Result, msg};
use crate::extractors::{CurrentUser, Json};
use crate::ledger::{self, TransitionOutcome};
use crate::models::{Course, CreatePaymentOrder, PaymentOrder, PaymentStatus, WebhookOutcome};
use crate::payments::{CheckoutHandle, CheckoutRequest, CheckoutTarget, Gateway, GatewayError};
use crate::util::with_query;

use super::status::refresh_from_gateway;

#[derive(Debug, Deserialize)]
pub struct StartCheckoutRequest {
    pub course_id: String,
    /// stripe, mercadopago, hotmart or kiwify
    pub gateway: String,
}

#[derive(Debug, Serialize)]
pub struct StartCheckoutResponse {
    pub order_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkout_url: Option<String>,
    /// Embedded Stripe checkout mounts with this instead of redirecting
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    pub status: PaymentStatus,
}

fn checkout_backoff(max_attempts: usize) -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_secs(2))
        .with_max_times(max_attempts.saturating_sub(1))
        .with_jitter()
}

impl StartCheckoutResponse {
    fn new(order_id: String, status: PaymentStatus, target: CheckoutTarget) -> Self {
        let (checkout_url, client_secret) = match target {
            CheckoutTarget::Url(url) => (Some(url), None),
            CheckoutTarget::ClientSecret(secret) => (None, Some(secret)),
        };
        Self {
            order_id,
            checkout_url,
            client_secret,
            status,
        }
    }
}

/// Reuse the user's in-flight order for this gateway, including a provider
/// session it already holds. An order on another gateway is cancelled and a
/// fresh one opened.
fn open_order(
    conn: &mut Connection,
    user_id: &str,
    course: &Course,
    gateway: Gateway,
) -> Result<PaymentOrder> {
    let mut tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    if let Some(active) = queries::get_active_payment_order(&tx, user_id, &course.id)? {
        if active.gateway == gateway {
            if active.external_reference.is_some() && active.saved_checkout().is_none() {
                return Err(AppError::Conflict(msg::CHECKOUT_IN_PROGRESS.into()));
            }
            tracing::debug!("Resuming order {} for user {}", active.id, user_id);
            tx.commit()?;
            return Ok(active);
        }

        if let TransitionOutcome::Applied(_) =
            ledger::advance(&mut tx, &active.id, PaymentStatus::Cancelled, None)?
        {
            tracing::info!(
                "Cancelled order {} ({}) superseded by new {} checkout",
                active.id,
                active.gateway,
                gateway
            );
        }
    }

    let order = queries::create_payment_order(
        &tx,
        &CreatePaymentOrder {
            user_id: user_id.to_string(),
            course_id: course.id.clone(),
            gateway,
            amount_cents: course.price_cents,
            currency: course.currency.clone(),
        },
    )?;
    tx.commit()?;

    tracing::info!(
        "Created order {} for user {} course {} via {}",
        order.id,
        user_id,
        course.id,
        gateway
    );
    Ok(order)
}

/// Before another gateway supersedes an order whose provider session is open,
/// ask that provider whether it was already paid.
async fn settle_before_switch(
    state: &AppState,
    user_id: &str,
    course_id: &str,
    gateway: Gateway,
) -> Result<()> {
    let active = {
        let conn = state.db.get()?;
        queries::get_active_payment_order(&conn, user_id, course_id)?
    };
    let Some(active) = active else {
        return Ok(());
    };
    if active.gateway == gateway || active.external_reference.is_none() {
        return Ok(());
    }

    let settled = refresh_from_gateway(state, active).await?;
    if settled.status == PaymentStatus::Succeeded {
        tracing::info!(
            "Order {} was paid on {} before switching to {}",
            settled.id,
            settled.gateway,
            gateway
        );
        return Err(AppError::Conflict(msg::ALREADY_ENROLLED.into()));
    }
    Ok(())
}

/// Process webhook events that arrived before the reference was attached.
fn drain_early_events(state: &AppState, gateway: Gateway, reference: &str) -> Result<()> {
    let events = {
        let conn = state.db.get()?;
        queries::list_webhook_events_for_reference(&conn, gateway, reference)?
    };

    for event in events.iter().filter(|e| e.signature_valid && !e.processed) {
        let disposition = ledger::process_webhook_event(state, event)?;
        if let Some(outcome) = disposition.outcome() {
            if outcome == WebhookOutcome::Applied {
                tracing::info!("Applied early webhook event {} for {}", event.id, reference);
            }
        }
    }
    Ok(())
}

/// Start (or resume) a paid checkout for the authenticated user.
pub async fn start_checkout(
    State(state): State<AppState>,
    user: CurrentUser,
    Json(request): Json<StartCheckoutRequest>,
) -> Result<Json<StartCheckoutResponse>> {
    let gateway: Gateway = request
        .gateway
        .parse()
        .map_err(|_| AppError::BadRequest(msg::INVALID_GATEWAY.into()))?;

    let adapter = state
        .gateways
        .get(gateway)
        .ok_or_else(|| AppError::BadRequest(msg::GATEWAY_NOT_CONFIGURED.into()))?;

    let course = {
        let conn = state.db.get()?;

        let course = queries::get_course_by_id(&conn, &request.course_id)?
            .or_not_found(msg::COURSE_NOT_FOUND)?;

        if course.is_free() {
            return Err(AppError::BadRequest(msg::COURSE_IS_FREE.into()));
        }

        if queries::get_enrollment(&conn, &user.user_id, &course.id)?.is_some() {
            return Err(AppError::Conflict(msg::ALREADY_ENROLLED.into()));
        }

        if !gateway.is_integrated() {
            if course.external_checkout_url(gateway).is_none() {
                return Err(AppError::BadRequest(msg::EXTERNAL_CHECKOUT_NOT_AVAILABLE.into()));
            }
            if queries::get_external_checkout_record(&conn, &user.user_id, &course.id)?.is_none()
            {
                return Err(AppError::BadRequest(msg::TAX_ID_REQUIRED.into()));
            }
        }

        course
    };

    settle_before_switch(&state, &user.user_id, &course.id, gateway).await?;

    let order = {
        let mut conn = state.db.get()?;
        open_order(&mut conn, &user.user_id, &course, gateway)?
    };

    // Another tab already opened a provider session for this order
    if let Some(target) = order.saved_checkout() {
        tracing::debug!("Handing out the existing session of order {}", order.id);
        return Ok(Json(StartCheckoutResponse::new(order.id, order.status, target)));
    }

    // Integrated orders are processing from the moment the provider is involved,
    // so the ceiling sweep can close them if nothing ever comes back
    let order = if gateway.is_integrated() && order.status == PaymentStatus::Pending {
        match ledger::transition(&state, &order.id, PaymentStatus::Processing, None)? {
            TransitionOutcome::Applied(order) | TransitionOutcome::Stale(order) => order,
            TransitionOutcome::Conflict => {
                return Err(AppError::Conflict("Order is being updated, retry".into()));
            }
        }
    } else {
        order
    };

    let checkout_request = CheckoutRequest {
        order: &order,
        course: &course,
        success_url: with_query(&state.success_url, &[("course_id", &course.id)]),
        cancel_url: with_query(&state.cancel_url, &[("course_id", &course.id)]),
        notification_url: format!("{}/webhooks/{}", state.base_url, gateway),
    };

    let result = (|| async { adapter.create_checkout(&checkout_request).await })
        .retry(checkout_backoff(state.reconcile.checkout_max_attempts))
        .when(GatewayError::is_retryable)
        .notify(|err, delay| {
            tracing::warn!(
                "Checkout for order {} failed, retrying in {:?}: {}",
                order.id,
                delay,
                err
            );
        })
        .await;

    let CheckoutHandle {
        target,
        external_reference,
    } = match result {
        Ok(handle) => handle,
        Err(err @ GatewayError::Rejected(_)) => {
            ledger::transition(&state, &order.id, PaymentStatus::Failed, None)?;
            return Err(err.into());
        }
        // Unavailable leaves the order processing for a retry or the sweep
        Err(err) => return Err(err.into()),
    };

    let target = match external_reference {
        Some(ref reference) => {
            let attached = {
                let conn = state.db.get()?;
                queries::attach_checkout(&conn, &order.id, reference, &target)?
            };
            if attached {
                tracing::debug!("Order {} mapped to {} reference {}", order.id, gateway, reference);
                // Anything left here is picked up by the reconciler drain
                if let Err(e) = drain_early_events(&state, gateway, reference) {
                    tracing::warn!("Early webhook drain for order {} failed: {}", order.id, e);
                }
                target
            } else {
                // A concurrent checkout attached its session first; ours is never shown
                let conn = state.db.get()?;
                queries::get_payment_order_by_id(&conn, &order.id)?
                    .and_then(|o| o.saved_checkout())
                    .ok_or_else(|| AppError::Conflict(msg::CHECKOUT_IN_PROGRESS.into()))?
            }
        }
        None => target,
    };

    let status = {
        let conn = state.db.get()?;
        queries::get_payment_order_by_id(&conn, &order.id)?
            .map(|o| o.status)
            .unwrap_or(order.status)
    };

    Ok(Json(StartCheckoutResponse::new(order.id, status, target)))
}
