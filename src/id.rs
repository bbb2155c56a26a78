//! Prefixed ID generation for coursepay entities.
//!
//! All IDs use a `cp_` brand prefix so they never collide with payment
//! provider IDs (Stripe's `cs_`, `pi_`, Mercado Pago's numeric payment IDs).
//!
//! Format: `cp_{entity}_{uuid_simple}` (32 hex chars, no hyphens)

use uuid::Uuid;

const ALL_PREFIXES: &[&str] = &["cp_ord_", "cp_enr_", "cp_whe_"];

/// Cheap format check used to reject garbage path parameters before hitting the database.
pub fn is_valid_prefixed_id(s: &str) -> bool {
    let Some(prefix) = ALL_PREFIXES.iter().find(|p| s.starts_with(*p)) else {
        return false;
    };

    let hex_part = &s[prefix.len()..];
    hex_part.len() == 32 && hex_part.chars().all(|c| c.is_ascii_hexdigit())
}

#[derive(Debug, Clone, Copy)]
pub enum EntityType {
    PaymentOrder,
    Enrollment,
    WebhookEvent,
}

impl EntityType {
    pub fn prefix(&self) -> &'static str {
        match self {
            Self::PaymentOrder => "cp_ord",
            Self::Enrollment => "cp_enr",
            Self::WebhookEvent => "cp_whe",
        }
    }

    pub fn gen_id(&self) -> String {
        format!("{}_{}", self.prefix(), Uuid::new_v4().as_simple())
    }
}
