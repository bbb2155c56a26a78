use serde::{Deserialize, Serialize};
use strum::{AsRefStr, EnumString};

use crate::payments::{Gateway, NormalizedStatus};

/// How an ingested webhook event was disposed of.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, AsRefStr, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum WebhookOutcome {
    /// Moved the order forward
    Applied,
    /// Same (gateway, reference, status) was already processed
    Duplicate,
    /// Backward move or the order is already terminal
    Stale,
    /// Event type carries no status relevant to enrollment
    Ignored,
    /// Authentication failed; never processed
    SignatureInvalid,
    /// No order ever appeared for the reference
    Orphaned,
}

/// Append-only audit row for every webhook delivery.
#[derive(Debug, Clone, Serialize)]
pub struct WebhookEvent {
    pub id: String,
    pub gateway: Gateway,
    pub external_reference: Option<String>,
    pub declared_status: Option<NormalizedStatus>,
    pub dedup_key: Option<String>,
    pub received_at: i64,
    pub signature_valid: bool,
    pub processed: bool,
    pub outcome: Option<WebhookOutcome>,
    pub payload: String,
}

#[derive(Debug, Clone)]
pub struct CreateWebhookEvent {
    pub gateway: Gateway,
    pub external_reference: Option<String>,
    pub declared_status: Option<NormalizedStatus>,
    pub signature_valid: bool,
    /// Set at insert time only for events that are never processed
    pub outcome: Option<WebhookOutcome>,
    pub payload: String,
}

/// Replay key for webhook deliveries: `(gateway, external_reference, declared_status)`.
pub fn dedup_key(
    gateway: Gateway,
    external_reference: Option<&str>,
    declared_status: Option<NormalizedStatus>,
) -> Option<String> {
    match (external_reference, declared_status) {
        (Some(reference), Some(status)) => Some(format!(
            "{}:{}:{}",
            gateway.as_ref(),
            reference,
            status.as_ref()
        )),
        _ => None,
    }
}
