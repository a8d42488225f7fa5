//! Small helpers shared between endpoint modules.

use serde::Deserialize;

use crate::db::Database;
use crate::error::Error;
use crate::models::{overall_status, ClearanceDetail, ClearanceItem, Student};

/// `skip`/`limit` query parameters for the list endpoints.
#[derive(Debug, Deserialize)]
pub struct Pagination {
    #[serde(default)]
    pub skip: i64,
    #[serde(default = "default_limit")]
    pub limit: i64,
}

fn default_limit() -> i64 {
    100
}

impl Pagination {
    /// Clamp both values to non-negative before they reach the store;
    /// sqlite treats a negative limit as unbounded.
    pub fn clamped(&self) -> (i64, i64) {
        (self.skip.max(0), self.limit.max(0))
    }
}

/// Assemble the full clearance detail for one student.
pub async fn student_clearance_detail(
    db: &Database,
    student: Student,
) -> Result<ClearanceDetail, Error> {
    let records = db.clearance_for_student(&student.student_id).await?;
    let overall = overall_status(&records);
    Ok(ClearanceDetail {
        student_id: student.student_id,
        name: student.name,
        department: student.department,
        overall_status: overall,
        clearance_items: records.into_iter().map(ClearanceItem::from).collect(),
    })
}
