//! Shared webhook ingestion for integrated gateways.
//!
//! Verify, record, then reconcile. The response depends only on whether the
//! event was durably recorded: providers get a 200 even when processing is
//! deferred, and a 500 (so they redeliver) only when recording failed.

use axum::http::{HeaderMap, StatusCode};

use crate::db::{AppState, queries};
use crate::ledger::{self, EventDisposition};
use crate::models::{CreateWebhookEvent, WebhookOutcome};
use crate::payments::{Gateway, GatewayError};

/// Result type for webhook operations.
pub type WebhookResult = (StatusCode, &'static str);

fn record(state: &AppState, input: &CreateWebhookEvent) -> Option<crate::models::WebhookEvent> {
    let conn = match state.db.get() {
        Ok(conn) => conn,
        Err(e) => {
            tracing::error!("DB connection error: {}", e);
            return None;
        }
    };
    match queries::insert_webhook_event(&conn, input) {
        Ok(event) => Some(event),
        Err(e) => {
            tracing::error!("Failed to record {} webhook: {}", input.gateway, e);
            None
        }
    }
}

pub async fn handle_webhook(
    state: &AppState,
    gateway: Gateway,
    headers: &HeaderMap,
    body: &[u8],
) -> WebhookResult {
    let Some(adapter) = state.gateways.get(gateway) else {
        tracing::warn!("Webhook for unconfigured gateway {}", gateway);
        return (StatusCode::NOT_FOUND, "Gateway not configured");
    };

    let payload = String::from_utf8_lossy(body).into_owned();

    let parsed = match adapter.verify_webhook(body, headers).await {
        Ok(parsed) => parsed,
        Err(GatewayError::SignatureInvalid(reason)) => {
            tracing::warn!("Rejected {} webhook: {}", gateway, reason);
            let input = CreateWebhookEvent {
                gateway,
                external_reference: None,
                declared_status: None,
                signature_valid: false,
                outcome: Some(WebhookOutcome::SignatureInvalid),
                payload,
            };
            return match record(state, &input) {
                Some(_) => (StatusCode::UNAUTHORIZED, "Invalid signature"),
                None => (StatusCode::INTERNAL_SERVER_ERROR, "Database error"),
            };
        }
        Err(GatewayError::Misconfigured(reason)) => {
            tracing::error!("{} webhook verification misconfigured: {}", gateway, reason);
            return (StatusCode::INTERNAL_SERVER_ERROR, "Webhook verification unavailable");
        }
        Err(e) => {
            // Authenticated but unresolved (provider lookup failed or body unusable).
            // Kept for audit; the status poll still resolves the order.
            tracing::warn!("{} webhook verified but not resolved: {}", gateway, e);
            let input = CreateWebhookEvent {
                gateway,
                external_reference: None,
                declared_status: None,
                signature_valid: true,
                outcome: None,
                payload,
            };
            return match record(state, &input) {
                Some(_) => (StatusCode::OK, "Recorded, processing deferred"),
                None => (StatusCode::INTERNAL_SERVER_ERROR, "Database error"),
            };
        }
    };

    tracing::debug!(
        "{} webhook {}: reference={:?} status={:?}",
        gateway,
        parsed.event_type,
        parsed.external_reference,
        parsed.declared_status
    );

    let input = CreateWebhookEvent {
        gateway,
        external_reference: parsed.external_reference,
        declared_status: parsed.declared_status,
        signature_valid: true,
        outcome: None,
        payload,
    };
    let Some(event) = record(state, &input) else {
        return (StatusCode::INTERNAL_SERVER_ERROR, "Database error");
    };

    match ledger::process_webhook_event(state, &event) {
        Ok(EventDisposition::Deferred) => (StatusCode::OK, "Recorded, processing deferred"),
        Ok(EventDisposition::Processed { outcome, .. }) => match outcome {
            WebhookOutcome::Applied => (StatusCode::OK, "OK"),
            WebhookOutcome::Duplicate => (StatusCode::OK, "Already processed"),
            WebhookOutcome::Stale => (StatusCode::OK, "Stale status ignored"),
            _ => (StatusCode::OK, "Event ignored"),
        },
        Err(e) => {
            // Event stays unprocessed; the reconciler drain retries it
            tracing::error!("Processing {} webhook {} failed: {}", gateway, event.id, e);
            (StatusCode::OK, "Recorded, processing deferred")
        }
    }
}
