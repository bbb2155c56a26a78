use async_trait::async_trait;
use axum::http::HeaderMap;
use hmac::{Hmac, Mac};
use reqwest::Client;
use serde::Deserialize;
use sha2::Sha256;
use strum::EnumString;
use subtle::ConstantTimeEq;

use super::{
    CheckoutHandle, CheckoutRequest, CheckoutTarget, Gateway, GatewayError, NormalizedStatus,
    ParsedEvent, PaymentGateway,
};
use crate::error::msg;

type HmacSha256 = Hmac<Sha256>;

const STRIPE_API_BASE: &str = "https://api.stripe.com/v1";

/// Hosted checkout redirects the browser to Stripe; embedded checkout mounts
/// in the course page with a client secret.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum StripeUiMode {
    Hosted,
    Embedded,
}

#[derive(Debug, Clone)]
pub struct StripeConfig {
    pub secret_key: String,
    pub webhook_secret: String,
    pub ui_mode: StripeUiMode,
}

#[derive(Debug, Deserialize)]
struct CreateCheckoutSessionResponse {
    id: String,
    url: Option<String>,
    client_secret: Option<String>,
}

#[derive(Debug, Clone)]
pub struct StripeClient {
    client: Client,
    secret_key: String,
    webhook_secret: String,
    ui_mode: StripeUiMode,
}

impl StripeClient {
    pub fn new(config: &StripeConfig) -> Self {
        Self {
            client: Client::new(),
            secret_key: config.secret_key.clone(),
            webhook_secret: config.webhook_secret.clone(),
            ui_mode: config.ui_mode,
        }
    }

    /// Maximum age of a webhook timestamp before it's rejected (in seconds).
    /// Stripe recommends 300 seconds (5 minutes).
    const WEBHOOK_TIMESTAMP_TOLERANCE_SECS: i64 = 300;

    pub fn verify_webhook_signature(
        &self,
        payload: &[u8],
        signature: &str,
    ) -> Result<bool, GatewayError> {
        // Stripe signature format: t=timestamp,v1=signature
        let mut timestamp = None;
        let mut sig_v1 = None;

        for part in signature.split(',') {
            if let Some(t) = part.strip_prefix("t=") {
                timestamp = Some(t);
            } else if let Some(s) = part.strip_prefix("v1=") {
                sig_v1 = Some(s);
            }
        }

        let timestamp_str = timestamp
            .ok_or_else(|| GatewayError::SignatureInvalid(msg::INVALID_SIGNATURE_FORMAT.into()))?;
        let sig_v1 = sig_v1
            .ok_or_else(|| GatewayError::SignatureInvalid(msg::INVALID_SIGNATURE_FORMAT.into()))?;

        let timestamp: i64 = timestamp_str.parse().map_err(|_| {
            GatewayError::SignatureInvalid(msg::INVALID_TIMESTAMP_IN_SIGNATURE.into())
        })?;

        let age = chrono::Utc::now().timestamp() - timestamp;

        if age > Self::WEBHOOK_TIMESTAMP_TOLERANCE_SECS {
            tracing::warn!(
                "Stripe webhook rejected: timestamp too old (age={}s, max={}s)",
                age,
                Self::WEBHOOK_TIMESTAMP_TOLERANCE_SECS
            );
            return Ok(false);
        }

        // Clock skew tolerance: 60 seconds
        if age < -60 {
            tracing::warn!("Stripe webhook rejected: timestamp in the future (age={}s)", age);
            return Ok(false);
        }

        let signed_payload = format!("{}.{}", timestamp_str, String::from_utf8_lossy(payload));

        let mut mac = HmacSha256::new_from_slice(self.webhook_secret.as_bytes())
            .map_err(|_| GatewayError::Misconfigured(msg::INVALID_WEBHOOK_SECRET.into()))?;
        mac.update(signed_payload.as_bytes());
        let expected = hex::encode(mac.finalize().into_bytes());

        // Signature length is not secret (always 64 hex chars for SHA-256)
        let expected_bytes = expected.as_bytes();
        let provided_bytes = sig_v1.as_bytes();
        if expected_bytes.len() != provided_bytes.len() {
            return Ok(false);
        }

        Ok(expected_bytes.ct_eq(provided_bytes).into())
    }
}

#[async_trait]
impl PaymentGateway for StripeClient {
    fn gateway(&self) -> Gateway {
        Gateway::Stripe
    }

    async fn create_checkout(
        &self,
        request: &CheckoutRequest<'_>,
    ) -> Result<CheckoutHandle, GatewayError> {
        let order = request.order;
        let amount = order.amount_cents.to_string();

        let mut form: Vec<(&str, &str)> = vec![
            ("mode", "payment"),
            ("client_reference_id", &order.id),
            ("line_items[0][quantity]", "1"),
            ("line_items[0][price_data][currency]", &order.currency),
            ("line_items[0][price_data][unit_amount]", &amount),
            ("line_items[0][price_data][product_data][name]", &request.course.title),
            ("metadata[order_id]", &order.id),
            ("metadata[course_id]", &order.course_id),
            ("metadata[user_id]", &order.user_id),
        ];
        match self.ui_mode {
            StripeUiMode::Hosted => {
                form.push(("success_url", &request.success_url));
                form.push(("cancel_url", &request.cancel_url));
            }
            StripeUiMode::Embedded => {
                form.push(("ui_mode", "embedded"));
                form.push(("return_url", &request.success_url));
            }
        }

        let response = self
            .client
            .post(format!("{}/checkout/sessions", STRIPE_API_BASE))
            .basic_auth(&self.secret_key, None::<&str>)
            .form(&form)
            .send()
            .await
            .map_err(|e| GatewayError::from_transport("Stripe", e))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(GatewayError::from_status("Stripe", status, &error_text));
        }

        let session: CreateCheckoutSessionResponse = response.json().await.map_err(|e| {
            GatewayError::Unavailable(format!("Failed to parse Stripe response: {}", e))
        })?;

        let target = match (self.ui_mode, session.url, session.client_secret) {
            (StripeUiMode::Embedded, _, Some(secret)) => CheckoutTarget::ClientSecret(secret),
            (_, Some(url), _) => CheckoutTarget::Url(url),
            _ => {
                return Err(GatewayError::Rejected(
                    "Stripe session has neither url nor client_secret".into(),
                ));
            }
        };

        Ok(CheckoutHandle {
            target,
            external_reference: Some(session.id),
        })
    }

    async fn verify_webhook(
        &self,
        raw_body: &[u8],
        headers: &HeaderMap,
    ) -> Result<ParsedEvent, GatewayError> {
        let signature = headers
            .get("stripe-signature")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| GatewayError::SignatureInvalid("Missing stripe-signature header".into()))?;

        if !self.verify_webhook_signature(raw_body, signature)? {
            return Err(GatewayError::SignatureInvalid("Signature mismatch".into()));
        }

        parse_stripe_event(raw_body)
    }

    async fn query_status(
        &self,
        external_reference: &str,
    ) -> Result<NormalizedStatus, GatewayError> {
        let response = self
            .client
            .get(format!("{}/checkout/sessions/{}", STRIPE_API_BASE, external_reference))
            .basic_auth(&self.secret_key, None::<&str>)
            .send()
            .await
            .map_err(|e| GatewayError::from_transport("Stripe", e))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(GatewayError::from_status("Stripe", status, &error_text));
        }

        let session: StripeCheckoutSession = response.json().await.map_err(|e| {
            GatewayError::Unavailable(format!("Failed to parse Stripe session: {}", e))
        })?;

        Ok(session_status(session.status.as_deref(), &session.payment_status))
    }
}

/// Generic Stripe webhook event - object is parsed based on event_type
#[derive(Debug, Deserialize)]
pub struct StripeWebhookEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: StripeEventData,
}

#[derive(Debug, Deserialize)]
pub struct StripeEventData {
    pub object: serde_json::Value,
}

#[derive(Debug, Deserialize)]
pub struct StripeCheckoutSession {
    pub id: String,
    /// "open", "complete" or "expired"
    pub status: Option<String>,
    /// "paid", "unpaid" or "no_payment_required"
    pub payment_status: String,
}

/// Map a checkout session onto the ledger status.
pub fn session_status(status: Option<&str>, payment_status: &str) -> NormalizedStatus {
    match (status, payment_status) {
        (_, "paid") | (_, "no_payment_required") => NormalizedStatus::Succeeded,
        (Some("expired"), _) => NormalizedStatus::Expired,
        // Completed but unpaid: delayed method (boleto, bank debit) still settling
        (Some("complete"), _) => NormalizedStatus::Processing,
        _ => NormalizedStatus::Pending,
    }
}

/// Parse an already-authenticated Stripe webhook body.
pub fn parse_stripe_event(body: &[u8]) -> Result<ParsedEvent, GatewayError> {
    let event: StripeWebhookEvent = serde_json::from_slice(body)
        .map_err(|e| GatewayError::Rejected(format!("Invalid Stripe webhook JSON: {}", e)))?;

    let declared = match event.event_type.as_str() {
        "checkout.session.completed" => None,
        "checkout.session.async_payment_succeeded" => Some(NormalizedStatus::Succeeded),
        "checkout.session.async_payment_failed" => Some(NormalizedStatus::Failed),
        "checkout.session.expired" => Some(NormalizedStatus::Expired),
        _ => return Ok(ParsedEvent::ignored(event.event_type)),
    };

    let session: StripeCheckoutSession = serde_json::from_value(event.data.object)
        .map_err(|e| GatewayError::Rejected(format!("Invalid checkout session: {}", e)))?;

    let declared_status = declared
        .unwrap_or_else(|| session_status(session.status.as_deref(), &session.payment_status));

    Ok(ParsedEvent {
        event_type: event.event_type,
        external_reference: Some(session.id),
        declared_status: Some(declared_status),
    })
}
