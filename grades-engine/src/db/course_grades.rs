//! Persistent course grade rows
//!
//! Same conditional-upsert scheme as subsection grades, with the grading
//! policy hash as an extra tie-breaker at equal version. `passed_at` is
//! never overwritten once set.

use crate::error::{GradesError, Result};
use crate::models::CourseGrade;
use grades_common::time::{from_db, opt_from_db, opt_to_db, to_db};
use grades_common::{CourseId, UserId};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};

const SELECT_COLUMNS: &str = r#"
    SELECT user_id, course_id, percent_grade, letter_grade, passed_at, course_version,
           version_published_at, course_edited_at, grading_policy_hash, max_modified_at, modified_at
    FROM course_grades
"#;

fn grade_from_row(row: &SqliteRow) -> Result<CourseGrade> {
    let passed_at: Option<String> = row.get("passed_at");
    let version_published_at: String = row.get("version_published_at");
    let course_edited_at: Option<String> = row.get("course_edited_at");
    let max_modified_at: String = row.get("max_modified_at");
    let modified_at: String = row.get("modified_at");

    Ok(CourseGrade {
        user_id: UserId(row.get("user_id")),
        course_id: CourseId(row.get("course_id")),
        percent_grade: row.get("percent_grade"),
        letter_grade: row.get("letter_grade"),
        passed_at: opt_from_db(passed_at.as_deref())?,
        course_version: row.get("course_version"),
        version_published_at: from_db(&version_published_at)?,
        course_edited_at: opt_from_db(course_edited_at.as_deref())?,
        grading_policy_hash: row.get("grading_policy_hash"),
        max_modified_at: opt_from_db(Some(max_modified_at.as_str()))?,
        modified_at: from_db(&modified_at)?,
    })
}

/// Write `grade` unless the stored row is at least as fresh
///
/// Returns `StaleWrite` when the stored row wins.
pub async fn upsert_course_grade(conn: &mut SqliteConnection, grade: &CourseGrade) -> Result<()> {
    let modified_at = to_db(&grade.modified_at);

    let result = sqlx::query(
        r#"
        INSERT INTO course_grades
            (user_id, course_id, percent_grade, letter_grade, passed_at, course_version,
             version_published_at, course_edited_at, grading_policy_hash, max_modified_at,
             created_at, modified_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(user_id, course_id) DO UPDATE SET
            percent_grade = excluded.percent_grade,
            letter_grade = excluded.letter_grade,
            passed_at = COALESCE(course_grades.passed_at, excluded.passed_at),
            course_version = excluded.course_version,
            version_published_at = excluded.version_published_at,
            course_edited_at = excluded.course_edited_at,
            grading_policy_hash = excluded.grading_policy_hash,
            max_modified_at = excluded.max_modified_at,
            modified_at = excluded.modified_at
        WHERE excluded.version_published_at > course_grades.version_published_at
           OR (excluded.version_published_at = course_grades.version_published_at
               AND (excluded.grading_policy_hash != course_grades.grading_policy_hash
                    OR excluded.max_modified_at > course_grades.max_modified_at))
        "#,
    )
    .bind(grade.user_id.0)
    .bind(grade.course_id.as_str())
    .bind(grade.percent_grade)
    .bind(&grade.letter_grade)
    .bind(opt_to_db(grade.passed_at.as_ref()))
    .bind(&grade.course_version)
    .bind(to_db(&grade.version_published_at))
    .bind(opt_to_db(grade.course_edited_at.as_ref()))
    .bind(&grade.grading_policy_hash)
    .bind(opt_to_db(grade.max_modified_at.as_ref()).unwrap_or_default())
    .bind(&modified_at)
    .bind(&modified_at)
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 0 {
        return Err(GradesError::StaleWrite(format!(
            "course grade of user {} in {} already at least as fresh",
            grade.user_id, grade.course_id
        )));
    }
    Ok(())
}

pub async fn load_course_grade(
    db: &SqlitePool,
    user_id: UserId,
    course_id: &CourseId,
) -> Result<Option<CourseGrade>> {
    let sql = format!("{} WHERE user_id = ? AND course_id = ?", SELECT_COLUMNS);
    let row = sqlx::query(&sql)
        .bind(user_id.0)
        .bind(course_id.as_str())
        .fetch_optional(db)
        .await?;

    row.as_ref().map(grade_from_row).transpose()
}

/// Same as [`load_course_grade`] on a connection already held by the caller
pub async fn load_course_grade_with(
    conn: &mut SqliteConnection,
    user_id: UserId,
    course_id: &CourseId,
) -> Result<Option<CourseGrade>> {
    let sql = format!("{} WHERE user_id = ? AND course_id = ?", SELECT_COLUMNS);
    let row = sqlx::query(&sql)
        .bind(user_id.0)
        .bind(course_id.as_str())
        .fetch_optional(&mut *conn)
        .await?;

    row.as_ref().map(grade_from_row).transpose()
}
