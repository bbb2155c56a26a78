use serde::{Deserialize, Serialize};

use crate::payments::Gateway;

/// Read-only projection of the course catalog. The catalog itself is owned by
/// another service; only pricing and external checkout links are needed here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Course {
    pub id: String,
    pub title: String,
    pub price_cents: i64,
    /// ISO 4217, lowercase (e.g. "brl")
    pub currency: String,
    pub hotmart_url: Option<String>,
    pub kiwify_url: Option<String>,
}

impl Course {
    pub fn is_free(&self) -> bool {
        self.price_cents == 0
    }

    /// Static external checkout URL for a redirect gateway.
    pub fn external_checkout_url(&self, gateway: Gateway) -> Option<&str> {
        match gateway {
            Gateway::Hotmart => self.hotmart_url.as_deref(),
            Gateway::Kiwify => self.kiwify_url.as_deref(),
            Gateway::Stripe | Gateway::MercadoPago => None,
        }
    }
}

/// Upsert payload used by the catalog sync and dev seeding.
#[derive(Debug, Clone, Deserialize)]
pub struct UpsertCourse {
    pub id: String,
    pub title: String,
    pub price_cents: i64,
    pub currency: String,
    #[serde(default)]
    pub hotmart_url: Option<String>,
    #[serde(default)]
    pub kiwify_url: Option<String>,
}
