use axum::{extract::State, http::StatusCode};
use serde::Deserialize;

use crate::db::{AppState, queries};
use crate::enrollment::{self, GrantOutcome};
use crate::error::{AppError, OptionExt, Result, msg};
use crate::extractors::{CurrentUser, Json};
use crate::models::Enrollment;

#[derive(Debug, Deserialize)]
pub struct EnrollRequest {
    pub course_id: String,
}

/// Enroll directly in a free course. 201 on first enrollment, 200 if the
/// user was already enrolled.
pub async fn enroll_free_course(
    State(state): State<AppState>,
    user: CurrentUser,
    Json(request): Json<EnrollRequest>,
) -> Result<(StatusCode, Json<Enrollment>)> {
    let conn = state.db.get()?;

    let course = queries::get_course_by_id(&conn, &request.course_id)?
        .or_not_found(msg::COURSE_NOT_FOUND)?;

    if !course.is_free() {
        return Err(AppError::PaymentRequired(msg::COURSE_NOT_FREE.into()));
    }

    match enrollment::grant(&conn, &user.user_id, &course.id, None)? {
        GrantOutcome::Created(enrollment) => Ok((StatusCode::CREATED, Json(enrollment))),
        GrantOutcome::AlreadyEnrolled => {
            let existing = queries::get_enrollment(&conn, &user.user_id, &course.id)?
                .ok_or_else(|| AppError::Internal("Enrollment vanished after conflict".into()))?;
            Ok((StatusCode::OK, Json(existing)))
        }
    }
}
