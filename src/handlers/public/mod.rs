mod checkout;
mod enrollments;
mod external;
mod status;

pub use checkout::*;
pub use enrollments::*;
pub use external::*;
pub use status::*;

use axum::{routing::{get, post}, Json, Router};
use serde::Serialize;

use crate::db::AppState;

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        // Free-course enrollment
        .route("/enrollments", post(enroll_free_course))
        .route("/payments/checkout", post(start_checkout))
        // Polled by the browser while a payment settles
        .route("/payments/status/{course_id}", get(get_payment_status))
        // Tax id capture before leaving for Hotmart/Kiwify
        .route("/external/save-cpf", post(save_cpf))
}
