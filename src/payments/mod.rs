//! Gateway adapters.
//!
//! Every provider is reached through [`PaymentGateway`], selected by the
//! [`Gateway`] tag stored on the order. Integrated gateways (Stripe, Mercado
//! Pago) implement checkout creation, webhook verification and status queries.
//! Redirect gateways (Hotmart, Kiwify) only hand out a static checkout URL and
//! leave the other two operations at their `Unsupported` defaults.

mod mercadopago;
mod redirect;
mod stripe;

pub use mercadopago::*;
pub use redirect::*;
pub use stripe::*;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use axum::http::HeaderMap;
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, EnumString};
use thiserror::Error;

use crate::models::{Course, PaymentOrder, PaymentStatus};

/// Provider status already mapped onto the ledger's vocabulary.
pub type NormalizedStatus = PaymentStatus;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, AsRefStr, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Gateway {
    Stripe,
    #[strum(to_string = "mercadopago", serialize = "mp")]
    MercadoPago,
    Hotmart,
    Kiwify,
}

impl Gateway {
    /// Integrated gateways offer webhooks and a status-query API.
    pub fn is_integrated(&self) -> bool {
        matches!(self, Self::Stripe | Self::MercadoPago)
    }
}

impl std::fmt::Display for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_ref())
    }
}

#[derive(Error, Debug)]
pub enum GatewayError {
    /// Transient (network, timeout, 429, 5xx). Safe to retry.
    #[error("gateway unavailable: {0}")]
    Unavailable(String),

    /// The provider refused the request. Terminal for the order.
    #[error("gateway rejected request: {0}")]
    Rejected(String),

    #[error("webhook signature invalid: {0}")]
    SignatureInvalid(String),

    #[error("operation not supported by this gateway: {0}")]
    Unsupported(&'static str),

    #[error("gateway misconfigured: {0}")]
    Misconfigured(String),
}

impl GatewayError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }

    pub(crate) fn from_transport(provider: &str, err: reqwest::Error) -> Self {
        GatewayError::Unavailable(format!("{} request failed: {}", provider, err))
    }

    /// Classify a non-success HTTP response from a provider API.
    pub(crate) fn from_status(provider: &str, status: reqwest::StatusCode, body: &str) -> Self {
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            GatewayError::Unavailable(format!("{} returned {}: {}", provider, status, body))
        } else {
            GatewayError::Rejected(format!("{} returned {}: {}", provider, status, body))
        }
    }
}

/// Everything an adapter needs to open a checkout for an order.
#[derive(Debug, Clone)]
pub struct CheckoutRequest<'a> {
    pub order: &'a PaymentOrder,
    pub course: &'a Course,
    pub success_url: String,
    pub cancel_url: String,
    /// Where integrated gateways should deliver their webhooks
    pub notification_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckoutTarget {
    /// Browser navigates here (hosted checkout or external redirect)
    Url(String),
    /// Browser mounts an embedded checkout with this secret
    ClientSecret(String),
}

#[derive(Debug, Clone)]
pub struct CheckoutHandle {
    pub target: CheckoutTarget,
    /// Reference mapped back to the order. Always None for redirect gateways.
    pub external_reference: Option<String>,
}

/// Authenticated webhook, reduced to what the ledger needs.
#[derive(Debug, Clone)]
pub struct ParsedEvent {
    pub event_type: String,
    pub external_reference: Option<String>,
    /// None when the event type carries nothing relevant to enrollment
    pub declared_status: Option<NormalizedStatus>,
}

impl ParsedEvent {
    pub fn ignored(event_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            external_reference: None,
            declared_status: None,
        }
    }
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    fn gateway(&self) -> Gateway;

    async fn create_checkout(
        &self,
        request: &CheckoutRequest<'_>,
    ) -> Result<CheckoutHandle, GatewayError>;

    /// Authenticate and parse a webhook delivery.
    async fn verify_webhook(
        &self,
        _raw_body: &[u8],
        _headers: &HeaderMap,
    ) -> Result<ParsedEvent, GatewayError> {
        Err(GatewayError::Unsupported("verify_webhook"))
    }

    async fn query_status(
        &self,
        _external_reference: &str,
    ) -> Result<NormalizedStatus, GatewayError> {
        Err(GatewayError::Unsupported("query_status"))
    }
}

/// Adapters keyed by gateway tag. Gateways without credentials are absent.
#[derive(Clone, Default)]
pub struct GatewayRegistry {
    gateways: HashMap<Gateway, Arc<dyn PaymentGateway>>,
}

impl GatewayRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the registry from configured credentials. Redirect gateways need
    /// none and are always present.
    pub fn from_config(config: &crate::config::Config) -> Self {
        let mut registry = Self::new()
            .with(RedirectGateway::new(Gateway::Hotmart))
            .with(RedirectGateway::new(Gateway::Kiwify));

        if let Some(ref stripe) = config.stripe {
            registry = registry.with(StripeClient::new(stripe));
        } else {
            tracing::info!("Stripe not configured, gateway disabled");
        }

        if let Some(ref mp) = config.mercadopago {
            registry = registry.with(MercadoPagoClient::new(mp));
        } else {
            tracing::info!("Mercado Pago not configured, gateway disabled");
        }

        registry
    }

    pub fn with<G: PaymentGateway + 'static>(mut self, gateway: G) -> Self {
        self.gateways.insert(gateway.gateway(), Arc::new(gateway));
        self
    }

    pub fn with_arc(mut self, gateway: Arc<dyn PaymentGateway>) -> Self {
        self.gateways.insert(gateway.gateway(), gateway);
        self
    }

    pub fn get(&self, gateway: Gateway) -> Option<Arc<dyn PaymentGateway>> {
        self.gateways.get(&gateway).cloned()
    }
}
