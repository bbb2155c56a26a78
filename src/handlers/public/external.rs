use axum::extract::State;
use serde::Serialize;

use crate::db::{AppState, queries};
use crate::error::{AppError, OptionExt, Result, msg};
use crate::extractors::{CurrentUser, Json};
use crate::models::{SaveCpfRequest, normalize_cpf};

#[derive(Debug, Serialize)]
pub struct SaveCpfResponse {
    pub course_id: String,
    pub saved: bool,
}

/// Capture the buyer's CPF before redirecting to an external checkout.
pub async fn save_cpf(
    State(state): State<AppState>,
    user: CurrentUser,
    Json(request): Json<SaveCpfRequest>,
) -> Result<Json<SaveCpfResponse>> {
    let tax_id =
        normalize_cpf(&request.cpf).ok_or_else(|| AppError::BadRequest(msg::INVALID_CPF.into()))?;

    let conn = state.db.get()?;
    let course = queries::get_course_by_id(&conn, &request.course_id)?
        .or_not_found(msg::COURSE_NOT_FOUND)?;

    queries::upsert_external_checkout_record(&conn, &user.user_id, &course.id, &tax_id)?;
    tracing::info!(
        "Saved external checkout tax id for user {} course {}",
        user.user_id,
        course.id
    );

    Ok(Json(SaveCpfResponse {
        course_id: course.id,
        saved: true,
    }))
}
