use serde::{Deserialize, Serialize};
use strum::{AsRefStr, EnumString};

use crate::payments::{CheckoutTarget, Gateway};

/// Lifecycle of a single checkout attempt.
///
/// `pending -> processing -> {succeeded | failed | cancelled | expired}`.
/// A transition is allowed only when it moves strictly forward in rank and
/// starts from a non-terminal state. Skipping `processing` is a forward move.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, AsRefStr, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum PaymentStatus {
    Pending,
    Processing,
    Succeeded,
    Failed,
    Cancelled,
    Expired,
}

impl PaymentStatus {
    fn rank(&self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Processing => 1,
            Self::Succeeded | Self::Failed | Self::Cancelled | Self::Expired => 2,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.rank() == 2
    }

    pub fn can_transition_to(&self, next: PaymentStatus) -> bool {
        !self.is_terminal() && next.rank() > self.rank()
    }

    /// Coarse status exposed to the browser.
    pub fn client_status(&self) -> ClientStatus {
        match self {
            Self::Pending | Self::Processing => ClientStatus::Pending,
            Self::Succeeded => ClientStatus::Succeeded,
            Self::Failed | Self::Cancelled | Self::Expired => ClientStatus::Failed,
        }
    }
}

impl std::fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_ref())
    }
}

/// Tri-state answer of the status endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientStatus {
    Pending,
    Succeeded,
    Failed,
}

/// One row of the order ledger.
#[derive(Debug, Clone, Serialize)]
pub struct PaymentOrder {
    pub id: String,
    pub user_id: String,
    pub course_id: String,
    pub gateway: Gateway,
    /// Provider-side handle (Stripe session id, Mercado Pago external reference).
    /// None until the adapter assigns one; always None for redirect gateways.
    pub external_reference: Option<String>,
    pub amount_cents: i64,
    pub currency: String,
    pub status: PaymentStatus,
    /// Optimistic concurrency counter, bumped on every write.
    pub version: i64,
    /// Succeeded but the enrollment grant has not been confirmed yet.
    pub enrollment_pending: bool,
    pub created_at: i64,
    pub updated_at: i64,
    #[serde(skip_serializing)]
    pub raw_last_event: Option<String>,
    /// Hosted checkout URL of the provider session, set with the reference.
    pub checkout_url: Option<String>,
    /// Embedded checkout secret of the provider session, set with the reference.
    #[serde(skip_serializing)]
    pub client_secret: Option<String>,
}

impl PaymentOrder {
    /// The provider session this order was handed to, if any.
    pub fn saved_checkout(&self) -> Option<CheckoutTarget> {
        self.external_reference.as_ref()?;
        self.checkout_url
            .clone()
            .map(CheckoutTarget::Url)
            .or_else(|| self.client_secret.clone().map(CheckoutTarget::ClientSecret))
    }
}

#[derive(Debug, Clone)]
pub struct CreatePaymentOrder {
    pub user_id: String,
    pub course_id: String,
    pub gateway: Gateway,
    pub amount_cents: i64,
    pub currency: String,
}

/// Redirect-gateway order waiting for out-of-band confirmation, joined with the
/// tax id the buyer captured before leaving the site.
#[derive(Debug, Clone, Serialize)]
pub struct PendingExternalOrder {
    pub order_id: String,
    pub user_id: String,
    pub course_id: String,
    pub gateway: Gateway,
    pub amount_cents: i64,
    pub currency: String,
    pub created_at: i64,
    pub tax_id: Option<String>,
}
