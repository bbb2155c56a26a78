use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::Response,
};
use subtle::ConstantTimeEq;

use crate::db::AppState;
use crate::util::extract_bearer_token;

/// Constant-time token comparison. Length is not secret.
fn token_matches(expected: &str, provided: &str) -> bool {
    let expected = expected.as_bytes();
    let provided = provided.as_bytes();
    expected.len() == provided.len() && bool::from(expected.ct_eq(provided))
}

/// Guard for the manual-confirmation API. With no `ADMIN_API_TOKEN`
/// configured every request is rejected.
pub async fn require_admin_token(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let Some(ref expected) = state.admin_api_token else {
        tracing::debug!("Admin request rejected: ADMIN_API_TOKEN not configured");
        return Err(StatusCode::UNAUTHORIZED);
    };

    let token = extract_bearer_token(request.headers()).ok_or(StatusCode::UNAUTHORIZED)?;
    if !token_matches(expected, token) {
        tracing::warn!("Admin request rejected: invalid token");
        return Err(StatusCode::UNAUTHORIZED);
    }

    Ok(next.run(request).await)
}
