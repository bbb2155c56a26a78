mod payments;

pub use payments::*;

use axum::{
    Router, middleware,
    routing::{get, post},
};

use crate::db::AppState;
use crate::middleware::require_admin_token;

/// Out-of-band settlement of redirect-gateway orders.
pub fn router(state: AppState) -> Router<AppState> {
    Router::new()
        .route("/admin/payments/pending-external", get(list_pending_external))
        .route("/admin/payments/{order_id}/confirm", post(confirm_external_payment))
        .route("/admin/payments/{order_id}/reject", post(reject_external_payment))
        .layer(middleware::from_fn_with_state(state, require_admin_token))
}
