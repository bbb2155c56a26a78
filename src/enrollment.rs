//! Enrollment granter: the only code path that creates enrollments.

use rusqlite::Connection;

use crate::db::queries;
use crate::error::Result;
use crate::models::Enrollment;

#[derive(Debug, Clone)]
pub enum GrantOutcome {
    Created(Enrollment),
    /// The (user, course) uniqueness constraint already held. Success.
    AlreadyEnrolled,
}

impl GrantOutcome {
    pub fn is_created(&self) -> bool {
        matches!(self, Self::Created(_))
    }
}

/// Grant access to a course. Idempotent: concurrent or repeated calls for the
/// same user and course leave exactly one enrollment.
///
/// When `order_id` is given, the order's `enrollment_pending` flag is cleared
/// as well. Callers wrap this in a transaction or savepoint so both writes
/// land together.
pub fn grant(
    conn: &Connection,
    user_id: &str,
    course_id: &str,
    order_id: Option<&str>,
) -> Result<GrantOutcome> {
    let outcome = match queries::insert_enrollment_if_absent(conn, user_id, course_id, order_id)? {
        Some(enrollment) => {
            tracing::info!(
                "Enrolled user {} in course {} (order: {:?})",
                user_id,
                course_id,
                order_id
            );
            GrantOutcome::Created(enrollment)
        }
        None => {
            tracing::debug!("User {} already enrolled in course {}", user_id, course_id);
            GrantOutcome::AlreadyEnrolled
        }
    };

    if let Some(order_id) = order_id {
        queries::clear_enrollment_pending(conn, order_id)?;
    }

    Ok(outcome)
}
