use std::env;
use std::time::Duration;

use crate::payments::{MercadoPagoConfig, StripeConfig, StripeUiMode};

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub database_path: String,
    pub base_url: String,
    pub dev_mode: bool,
    /// Bearer token for the manual-confirmation admin API (None = admin API disabled)
    pub admin_api_token: Option<String>,
    /// Landing page the browser returns to after an integrated checkout
    pub success_url: String,
    pub cancel_url: String,
    pub stripe: Option<StripeConfig>,
    pub mercadopago: Option<MercadoPagoConfig>,
    pub reconcile: ReconcileConfig,
}

/// Timing knobs shared by the poll path, the webhook path and the reconciler.
#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    /// Upper bound on a single `query_status` call made while answering a poll.
    pub query_timeout: Duration,
    /// `processing` orders untouched for longer than this are swept to `failed`.
    pub processing_ceiling_secs: i64,
    /// How often the background reconciler runs.
    pub interval: Duration,
    /// Verified webhook events with no matching order after this long are marked orphaned.
    pub webhook_orphan_secs: i64,
    /// Attempts for the backoff-driven enrollment retry spawned after a failed grant.
    pub grant_max_attempts: usize,
    /// Attempts for create-checkout calls that fail with a retryable error.
    pub checkout_max_attempts: usize,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            query_timeout: Duration::from_millis(5000),
            processing_ceiling_secs: 24 * 60 * 60,
            interval: Duration::from_secs(60),
            webhook_orphan_secs: 7 * 24 * 60 * 60,
            grant_max_attempts: 5,
            checkout_max_attempts: 3,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    parse_or_default(key, env::var(key).ok().as_deref(), default)
}

/// A present but malformed value falls back to the default with a warning.
fn parse_or_default<T: std::str::FromStr>(key: &str, raw: Option<&str>, default: T) -> T {
    let Some(raw) = raw else {
        return default;
    };
    match raw.trim().parse() {
        Ok(value) => value,
        Err(_) => {
            tracing::warn!("Ignoring malformed {}={:?}, using default", key, raw);
            default
        }
    }
}

fn env_non_empty(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

impl Config {
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();

        let dev_mode = env::var("COURSEPAY_ENV")
            .map(|v| v == "dev" || v == "development")
            .unwrap_or(false);

        let host = env::var("HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let port: u16 = env_parse("PORT", 3000);

        let base_url = env::var("BASE_URL")
            .unwrap_or_else(|_| format!("http://{}:{}", host, port));

        let stripe = match (
            env_non_empty("STRIPE_SECRET_KEY"),
            env_non_empty("STRIPE_WEBHOOK_SECRET"),
        ) {
            (Some(secret_key), Some(webhook_secret)) => Some(StripeConfig {
                secret_key,
                webhook_secret,
                ui_mode: env::var("STRIPE_UI_MODE")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(StripeUiMode::Hosted),
            }),
            (Some(_), None) | (None, Some(_)) => {
                tracing::warn!(
                    "Stripe disabled: both STRIPE_SECRET_KEY and STRIPE_WEBHOOK_SECRET are required"
                );
                None
            }
            (None, None) => None,
        };

        let mercadopago = match (
            env_non_empty("MERCADOPAGO_ACCESS_TOKEN"),
            env_non_empty("MERCADOPAGO_WEBHOOK_SECRET"),
        ) {
            (Some(access_token), Some(webhook_secret)) => Some(MercadoPagoConfig {
                access_token,
                webhook_secret,
            }),
            (Some(_), None) | (None, Some(_)) => {
                tracing::warn!(
                    "Mercado Pago disabled: both MERCADOPAGO_ACCESS_TOKEN and MERCADOPAGO_WEBHOOK_SECRET are required"
                );
                None
            }
            (None, None) => None,
        };

        let defaults = ReconcileConfig::default();
        let reconcile = ReconcileConfig {
            query_timeout: Duration::from_millis(env_parse(
                "QUERY_TIMEOUT_MS",
                defaults.query_timeout.as_millis() as u64,
            )),
            processing_ceiling_secs: env_parse(
                "PROCESSING_CEILING_SECS",
                defaults.processing_ceiling_secs,
            ),
            interval: Duration::from_secs(env_parse(
                "RECONCILE_INTERVAL_SECS",
                defaults.interval.as_secs(),
            )),
            webhook_orphan_secs: env_parse("WEBHOOK_ORPHAN_SECS", defaults.webhook_orphan_secs),
            grant_max_attempts: env_parse("GRANT_MAX_ATTEMPTS", defaults.grant_max_attempts),
            checkout_max_attempts: env_parse(
                "CHECKOUT_MAX_ATTEMPTS",
                defaults.checkout_max_attempts,
            ),
        };

        Self {
            host,
            port,
            database_path: env::var("DATABASE_PATH")
                .unwrap_or_else(|_| "coursepay.db".to_string()),
            success_url: env::var("SUCCESS_URL")
                .unwrap_or_else(|_| format!("{}/checkout/success", base_url)),
            cancel_url: env::var("CANCEL_URL")
                .unwrap_or_else(|_| format!("{}/checkout/cancel", base_url)),
            base_url,
            dev_mode,
            admin_api_token: env_non_empty("ADMIN_API_TOKEN"),
            stripe,
            mercadopago,
            reconcile,
        }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
