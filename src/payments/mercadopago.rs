use std::time::Duration;

use async_trait::async_trait;
use axum::http::HeaderMap;
use hmac::{Hmac, Mac};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use super::{
    CheckoutHandle, CheckoutRequest, CheckoutTarget, Gateway, GatewayError, NormalizedStatus,
    ParsedEvent, PaymentGateway,
};
use crate::error::msg;

type HmacSha256 = Hmac<Sha256>;

const MERCADOPAGO_API_BASE: &str = "https://api.mercadopago.com";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct MercadoPagoConfig {
    pub access_token: String,
    pub webhook_secret: String,
}

#[derive(Debug, Serialize)]
struct PreferenceItem<'a> {
    id: &'a str,
    title: &'a str,
    quantity: u32,
    unit_price: f64,
    /// ISO 4217, uppercase
    currency_id: String,
}

#[derive(Debug, Serialize)]
struct BackUrls<'a> {
    success: &'a str,
    failure: &'a str,
    pending: &'a str,
}

#[derive(Debug, Serialize)]
struct CreatePreference<'a> {
    items: Vec<PreferenceItem<'a>>,
    external_reference: &'a str,
    back_urls: BackUrls<'a>,
    auto_return: &'a str,
    notification_url: &'a str,
}

#[derive(Debug, Deserialize)]
struct PreferenceResponse {
    init_point: String,
}

#[derive(Debug, Deserialize)]
struct MercadoPagoPayment {
    status: String,
    external_reference: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PaymentSearchResponse {
    results: Vec<MercadoPagoPayment>,
}

#[derive(Debug, Deserialize)]
struct MercadoPagoNotification {
    #[serde(rename = "type")]
    notification_type: Option<String>,
    action: Option<String>,
    data: Option<NotificationData>,
}

#[derive(Debug, Deserialize)]
struct NotificationData {
    id: serde_json::Value,
}

impl NotificationData {
    /// Payment ids arrive as strings or numbers depending on the topic.
    fn id_string(&self) -> Option<String> {
        match &self.id {
            serde_json::Value::String(s) => Some(s.clone()),
            serde_json::Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MercadoPagoClient {
    client: Client,
    access_token: String,
    webhook_secret: String,
}

impl MercadoPagoClient {
    pub fn new(config: &MercadoPagoConfig) -> Self {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            client,
            access_token: config.access_token.clone(),
            webhook_secret: config.webhook_secret.clone(),
        }
    }

    async fn fetch_payment(&self, payment_id: &str) -> Result<MercadoPagoPayment, GatewayError> {
        let response = self
            .client
            .get(format!("{}/v1/payments/{}", MERCADOPAGO_API_BASE, payment_id))
            .bearer_auth(&self.access_token)
            .send()
            .await
            .map_err(|e| GatewayError::from_transport("Mercado Pago", e))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(GatewayError::from_status("Mercado Pago", status, &error_text));
        }

        response.json().await.map_err(|e| {
            GatewayError::Unavailable(format!("Failed to parse Mercado Pago payment: {}", e))
        })
    }
}

/// Verify an `x-signature` header (`ts=...,v1=...`) against the manifest
/// `id:{data.id};request-id:{x-request-id};ts:{ts};`. Parts whose value is
/// absent from the notification are left out of the manifest.
pub fn verify_mercadopago_signature(
    secret: &str,
    signature: &str,
    request_id: Option<&str>,
    data_id: Option<&str>,
) -> Result<bool, GatewayError> {
    let mut ts = None;
    let mut v1 = None;

    for part in signature.split(',') {
        let part = part.trim();
        if let Some(t) = part.strip_prefix("ts=") {
            ts = Some(t);
        } else if let Some(s) = part.strip_prefix("v1=") {
            v1 = Some(s);
        }
    }

    let ts = ts.ok_or_else(|| GatewayError::SignatureInvalid(msg::INVALID_SIGNATURE_FORMAT.into()))?;
    let v1 = v1.ok_or_else(|| GatewayError::SignatureInvalid(msg::INVALID_SIGNATURE_FORMAT.into()))?;

    let mut manifest = String::new();
    if let Some(id) = data_id {
        // Alphanumeric ids must be lowercased before signing
        manifest.push_str(&format!("id:{};", id.to_lowercase()));
    }
    if let Some(rid) = request_id {
        manifest.push_str(&format!("request-id:{};", rid));
    }
    manifest.push_str(&format!("ts:{};", ts));

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| GatewayError::Misconfigured(msg::INVALID_WEBHOOK_SECRET.into()))?;
    mac.update(manifest.as_bytes());
    let expected = hex::encode(mac.finalize().into_bytes());

    let expected_bytes = expected.as_bytes();
    let provided_bytes = v1.as_bytes();
    if expected_bytes.len() != provided_bytes.len() {
        return Ok(false);
    }

    Ok(expected_bytes.ct_eq(provided_bytes).into())
}

/// Map a Mercado Pago payment status. Refunds, chargebacks and mediation have
/// no bearing on enrollment and map to None.
///
/// A rejected payment is one declined attempt; the preference stays open and
/// the buyer can pay again on it, so the order only stays `processing`.
pub fn map_payment_status(status: &str) -> Option<NormalizedStatus> {
    match status {
        "approved" => Some(NormalizedStatus::Succeeded),
        "pending" | "in_process" | "authorized" | "rejected" => {
            Some(NormalizedStatus::Processing)
        }
        "cancelled" => Some(NormalizedStatus::Cancelled),
        _ => None,
    }
}

#[async_trait]
impl PaymentGateway for MercadoPagoClient {
    fn gateway(&self) -> Gateway {
        Gateway::MercadoPago
    }

    async fn create_checkout(
        &self,
        request: &CheckoutRequest<'_>,
    ) -> Result<CheckoutHandle, GatewayError> {
        let order = request.order;
        let body = CreatePreference {
            items: vec![PreferenceItem {
                id: &order.course_id,
                title: &request.course.title,
                quantity: 1,
                unit_price: order.amount_cents as f64 / 100.0,
                currency_id: order.currency.to_uppercase(),
            }],
            external_reference: &order.id,
            back_urls: BackUrls {
                success: &request.success_url,
                failure: &request.cancel_url,
                pending: &request.success_url,
            },
            auto_return: "approved",
            notification_url: &request.notification_url,
        };

        let response = self
            .client
            .post(format!("{}/checkout/preferences", MERCADOPAGO_API_BASE))
            .bearer_auth(&self.access_token)
            .header("X-Idempotency-Key", &order.id)
            .json(&body)
            .send()
            .await
            .map_err(|e| GatewayError::from_transport("Mercado Pago", e))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(GatewayError::from_status("Mercado Pago", status, &error_text));
        }

        let preference: PreferenceResponse = response.json().await.map_err(|e| {
            GatewayError::Unavailable(format!("Failed to parse Mercado Pago response: {}", e))
        })?;

        Ok(CheckoutHandle {
            target: CheckoutTarget::Url(preference.init_point),
            external_reference: Some(order.id.clone()),
        })
    }

    async fn verify_webhook(
        &self,
        raw_body: &[u8],
        headers: &HeaderMap,
    ) -> Result<ParsedEvent, GatewayError> {
        let signature = headers
            .get("x-signature")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| GatewayError::SignatureInvalid("Missing x-signature header".into()))?;
        let request_id = headers.get("x-request-id").and_then(|v| v.to_str().ok());

        // The signed manifest needs data.id, so an unparseable body cannot be authenticated
        let notification: MercadoPagoNotification = serde_json::from_slice(raw_body).map_err(|e| {
            GatewayError::SignatureInvalid(format!("Unparseable Mercado Pago notification: {}", e))
        })?;
        let payment_id = notification.data.as_ref().and_then(NotificationData::id_string);

        if !verify_mercadopago_signature(
            &self.webhook_secret,
            signature,
            request_id,
            payment_id.as_deref(),
        )? {
            return Err(GatewayError::SignatureInvalid("Signature mismatch".into()));
        }

        let event_type = notification
            .action
            .or(notification.notification_type.clone())
            .unwrap_or_else(|| "unknown".into());

        let payment_id = match (notification.notification_type.as_deref(), payment_id) {
            (Some("payment"), Some(id)) => id,
            _ => return Ok(ParsedEvent::ignored(event_type)),
        };

        // Notifications only carry the payment id; reference and status come from the API
        let payment = self.fetch_payment(&payment_id).await?;

        Ok(ParsedEvent {
            event_type,
            external_reference: payment.external_reference,
            declared_status: map_payment_status(&payment.status),
        })
    }

    async fn query_status(
        &self,
        external_reference: &str,
    ) -> Result<NormalizedStatus, GatewayError> {
        let response = self
            .client
            .get(format!("{}/v1/payments/search", MERCADOPAGO_API_BASE))
            .bearer_auth(&self.access_token)
            .query(&[
                ("external_reference", external_reference),
                ("sort", "date_created"),
                ("criteria", "desc"),
            ])
            .send()
            .await
            .map_err(|e| GatewayError::from_transport("Mercado Pago", e))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(GatewayError::from_status("Mercado Pago", status, &error_text));
        }

        let search: PaymentSearchResponse = response.json().await.map_err(|e| {
            GatewayError::Unavailable(format!("Failed to parse Mercado Pago search: {}", e))
        })?;

        // No payment attempt yet means the buyer has not finished the preference
        Ok(search
            .results
            .first()
            .and_then(|p| map_payment_status(&p.status))
            .unwrap_or(NormalizedStatus::Pending))
    }
}
