use serde::{Deserialize, Serialize};

/// Course access record. Only `enrollment::grant` creates these.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Enrollment {
    pub id: String,
    pub user_id: String,
    pub course_id: String,
    /// Order that paid for this enrollment (None for free courses)
    pub order_id: Option<String>,
    pub enrolled_at: i64,
    /// Completion percentage, 0-100
    pub progress: i64,
}
