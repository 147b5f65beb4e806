//! Persistent subsection grade rows
//!
//! Writes are conditional upserts: a row is replaced only when the incoming
//! freshness vector `(version_published_at, max_modified_at)` is strictly
//! newer. Timestamps are stored fixed-width, so the comparison is plain text
//! ordering; an absent `max_modified_at` is stored as '' and sorts first.

use crate::error::{GradesError, Result};
use crate::models::SubsectionGrade;
use grades_common::time::{from_db, opt_from_db, opt_to_db, to_db};
use grades_common::{CourseId, UsageKey, UserId};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};

const SELECT_COLUMNS: &str = r#"
    SELECT user_id, course_id, usage_key, earned_all, possible_all, earned_graded, possible_graded,
           first_attempted_at, course_version, version_published_at, subtree_edited_at,
           visible_blocks_hash, max_modified_at, modified_at
    FROM subsection_grades
"#;

fn grade_from_row(row: &SqliteRow) -> Result<SubsectionGrade> {
    let first_attempted_at: Option<String> = row.get("first_attempted_at");
    let version_published_at: String = row.get("version_published_at");
    let subtree_edited_at: Option<String> = row.get("subtree_edited_at");
    let max_modified_at: String = row.get("max_modified_at");
    let modified_at: String = row.get("modified_at");

    Ok(SubsectionGrade {
        user_id: UserId(row.get("user_id")),
        course_id: CourseId(row.get("course_id")),
        subsection_key: UsageKey(row.get("usage_key")),
        earned_all: row.get("earned_all"),
        possible_all: row.get("possible_all"),
        earned_graded: row.get("earned_graded"),
        possible_graded: row.get("possible_graded"),
        first_attempted_at: opt_from_db(first_attempted_at.as_deref())?,
        course_version: row.get("course_version"),
        version_published_at: from_db(&version_published_at)?,
        subtree_edited_at: opt_from_db(subtree_edited_at.as_deref())?,
        visible_blocks_hash: row.get("visible_blocks_hash"),
        max_modified_at: opt_from_db(Some(max_modified_at.as_str()))?,
        modified_at: from_db(&modified_at)?,
    })
}

/// Write `grade` unless the stored row is at least as fresh
///
/// Returns `StaleWrite` when the stored row wins.
pub async fn upsert_subsection_grade(conn: &mut SqliteConnection, grade: &SubsectionGrade) -> Result<()> {
    let modified_at = to_db(&grade.modified_at);

    let result = sqlx::query(
        r#"
        INSERT INTO subsection_grades
            (user_id, course_id, usage_key, earned_all, possible_all, earned_graded, possible_graded,
             first_attempted_at, course_version, version_published_at, subtree_edited_at,
             visible_blocks_hash, max_modified_at, created_at, modified_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(user_id, course_id, usage_key) DO UPDATE SET
            earned_all = excluded.earned_all,
            possible_all = excluded.possible_all,
            earned_graded = excluded.earned_graded,
            possible_graded = excluded.possible_graded,
            first_attempted_at = excluded.first_attempted_at,
            course_version = excluded.course_version,
            version_published_at = excluded.version_published_at,
            subtree_edited_at = excluded.subtree_edited_at,
            visible_blocks_hash = excluded.visible_blocks_hash,
            max_modified_at = excluded.max_modified_at,
            modified_at = excluded.modified_at
        WHERE excluded.version_published_at > subsection_grades.version_published_at
           OR (excluded.version_published_at = subsection_grades.version_published_at
               AND excluded.max_modified_at > subsection_grades.max_modified_at)
        "#,
    )
    .bind(grade.user_id.0)
    .bind(grade.course_id.as_str())
    .bind(grade.subsection_key.as_str())
    .bind(grade.earned_all)
    .bind(grade.possible_all)
    .bind(grade.earned_graded)
    .bind(grade.possible_graded)
    .bind(opt_to_db(grade.first_attempted_at.as_ref()))
    .bind(&grade.course_version)
    .bind(to_db(&grade.version_published_at))
    .bind(opt_to_db(grade.subtree_edited_at.as_ref()))
    .bind(&grade.visible_blocks_hash)
    .bind(opt_to_db(grade.max_modified_at.as_ref()).unwrap_or_default())
    .bind(&modified_at)
    .bind(&modified_at)
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 0 {
        return Err(GradesError::StaleWrite(format!(
            "subsection {} for user {} already at least as fresh",
            grade.subsection_key, grade.user_id
        )));
    }
    Ok(())
}

pub async fn load_subsection_grade(
    db: &SqlitePool,
    user_id: UserId,
    course_id: &CourseId,
    subsection_key: &UsageKey,
) -> Result<Option<SubsectionGrade>> {
    let sql = format!(
        "{} WHERE user_id = ? AND course_id = ? AND usage_key = ?",
        SELECT_COLUMNS
    );
    let row = sqlx::query(&sql)
        .bind(user_id.0)
        .bind(course_id.as_str())
        .bind(subsection_key.as_str())
        .fetch_optional(db)
        .await?;

    row.as_ref().map(grade_from_row).transpose()
}

pub async fn load_subsection_grades_for_course(
    db: &SqlitePool,
    user_id: UserId,
    course_id: &CourseId,
) -> Result<Vec<SubsectionGrade>> {
    let sql = format!("{} WHERE user_id = ? AND course_id = ?", SELECT_COLUMNS);
    let rows = sqlx::query(&sql)
        .bind(user_id.0)
        .bind(course_id.as_str())
        .fetch_all(db)
        .await?;

    rows.iter().map(grade_from_row).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::visible_blocks::insert_visible_blocks;
    use crate::models::BlockRecordList;
    use chrono::{DateTime, TimeZone, Utc};
    use grades_common::db::init_memory_database;

    fn at(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 0, minute, 0).unwrap()
    }

    fn grade(hash: &str, published: u32, max_modified: Option<u32>, earned: f64) -> SubsectionGrade {
        SubsectionGrade {
            user_id: UserId(1),
            course_id: CourseId::new("course"),
            subsection_key: UsageKey::new("seq1"),
            earned_all: earned,
            possible_all: 2.0,
            earned_graded: earned,
            possible_graded: 2.0,
            first_attempted_at: Some(at(0)),
            course_version: format!("v{}", published),
            version_published_at: at(published),
            subtree_edited_at: None,
            visible_blocks_hash: hash.to_string(),
            max_modified_at: max_modified.map(at),
            modified_at: at(59),
        }
    }

    async fn setup() -> (SqlitePool, String) {
        let pool = init_memory_database().await.unwrap();
        let mut conn = pool.acquire().await.unwrap();
        let hash = insert_visible_blocks(&mut conn, &BlockRecordList::new(CourseId::new("course"), vec![]), "v1")
            .await
            .unwrap();
        drop(conn);
        (pool, hash)
    }

    async fn write(pool: &SqlitePool, g: &SubsectionGrade) -> Result<()> {
        let mut conn = pool.acquire().await.unwrap();
        upsert_subsection_grade(&mut conn, g).await
    }

    #[tokio::test]
    async fn test_older_write_after_newer_is_rejected() {
        let (pool, hash) = setup().await;
        write(&pool, &grade(&hash, 1, Some(20), 2.0)).await.unwrap();

        let result = write(&pool, &grade(&hash, 1, Some(10), 1.0)).await;
        assert!(matches!(result, Err(GradesError::StaleWrite(_))));

        let stored = load_subsection_grade(&pool, UserId(1), &CourseId::new("course"), &UsageKey::new("seq1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.earned_graded, 2.0);
        assert_eq!(stored.max_modified_at, Some(at(20)));
    }

    #[tokio::test]
    async fn test_equal_freshness_is_rejected() {
        let (pool, hash) = setup().await;
        write(&pool, &grade(&hash, 1, None, 0.0)).await.unwrap();
        assert!(write(&pool, &grade(&hash, 1, None, 0.0)).await.unwrap_err().is_benign());
    }

    #[tokio::test]
    async fn test_newer_version_wins_over_newer_scores() {
        let (pool, hash) = setup().await;
        write(&pool, &grade(&hash, 1, Some(30), 2.0)).await.unwrap();
        write(&pool, &grade(&hash, 2, Some(5), 1.0)).await.unwrap();

        let rows = load_subsection_grades_for_course(&pool, UserId(1), &CourseId::new("course"))
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].course_version, "v2");
        assert_eq!(rows[0].earned_graded, 1.0);
    }
}
