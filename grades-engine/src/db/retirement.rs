//! Removal of every grading row of a retired learner

use crate::error::Result;
use grades_common::{CourseId, UserId};
use serde::Serialize;
use sqlx::SqlitePool;

/// Rows removed per table
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RetirementSummary {
    pub problem_scores: u64,
    pub subsection_grades: u64,
    pub subsection_grade_overrides: u64,
    pub subsection_grade_override_history: u64,
    pub course_grades: u64,
}

impl RetirementSummary {
    pub fn total(&self) -> u64 {
        self.problem_scores
            + self.subsection_grades
            + self.subsection_grade_overrides
            + self.subsection_grade_override_history
            + self.course_grades
    }
}

/// Delete the learner's scores, grades, overrides and override history in one transaction
pub async fn delete_user_rows(db: &SqlitePool, user_id: UserId) -> Result<RetirementSummary> {
    let mut tx = db.begin().await?;

    let problem_scores = sqlx::query("DELETE FROM problem_scores WHERE user_id = ?")
        .bind(user_id.0)
        .execute(&mut *tx)
        .await?
        .rows_affected();
    let subsection_grades = sqlx::query("DELETE FROM subsection_grades WHERE user_id = ?")
        .bind(user_id.0)
        .execute(&mut *tx)
        .await?
        .rows_affected();
    let subsection_grade_overrides = sqlx::query("DELETE FROM subsection_grade_overrides WHERE user_id = ?")
        .bind(user_id.0)
        .execute(&mut *tx)
        .await?
        .rows_affected();
    let subsection_grade_override_history =
        sqlx::query("DELETE FROM subsection_grade_override_history WHERE user_id = ?")
            .bind(user_id.0)
            .execute(&mut *tx)
            .await?
            .rows_affected();
    let course_grades = sqlx::query("DELETE FROM course_grades WHERE user_id = ?")
        .bind(user_id.0)
        .execute(&mut *tx)
        .await?
        .rows_affected();

    tx.commit().await?;

    Ok(RetirementSummary {
        problem_scores,
        subsection_grades,
        subsection_grade_overrides,
        subsection_grade_override_history,
        course_grades,
    })
}

/// Whether the learner has any grading row in the course
///
/// A retired learner has none, so tasks for them have nothing to work from.
pub async fn learner_has_rows(db: &SqlitePool, user_id: UserId, course_id: &CourseId) -> Result<bool> {
    let found: bool = sqlx::query_scalar(
        r#"
        SELECT EXISTS (SELECT 1 FROM problem_scores WHERE user_id = ?1 AND course_id = ?2)
            OR EXISTS (SELECT 1 FROM subsection_grade_overrides WHERE user_id = ?1 AND course_id = ?2)
            OR EXISTS (SELECT 1 FROM subsection_grades WHERE user_id = ?1 AND course_id = ?2)
            OR EXISTS (SELECT 1 FROM course_grades WHERE user_id = ?1 AND course_id = ?2)
        "#,
    )
    .bind(user_id.0)
    .bind(course_id.as_str())
    .fetch_one(db)
    .await?;
    Ok(found)
}
