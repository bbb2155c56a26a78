pub mod common;

use axum::{
    Router,
    body::Bytes,
    extract::State,
    http::HeaderMap,
    response::IntoResponse,
    routing::post,
};

use crate::db::AppState;
use crate::payments::Gateway;

use common::handle_webhook;

pub async fn handle_stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    handle_webhook(&state, Gateway::Stripe, &headers, &body).await
}

pub async fn handle_mercadopago_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    handle_webhook(&state, Gateway::MercadoPago, &headers, &body).await
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/webhooks/stripe", post(handle_stripe_webhook))
        .route("/webhooks/mercadopago", post(handle_mercadopago_webhook))
}
