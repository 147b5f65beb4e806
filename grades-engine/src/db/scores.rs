//! Problem score persistence

use crate::error::Result;
use crate::models::ProblemScore;
use grades_common::time::{from_db, opt_from_db, opt_to_db, to_db};
use grades_common::{CourseId, UsageKey, UserId};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;

fn score_from_row(row: &SqliteRow) -> Result<ProblemScore> {
    let first_attempted_at: Option<String> = row.get("first_attempted_at");
    let modified_at: String = row.get("modified_at");
    let is_override: i64 = row.get("is_override");

    Ok(ProblemScore {
        user_id: UserId(row.get("user_id")),
        course_id: CourseId(row.get("course_id")),
        problem_key: UsageKey(row.get("problem_key")),
        earned: row.get("earned"),
        possible: row.get("possible"),
        first_attempted_at: opt_from_db(first_attempted_at.as_deref())?,
        modified_at: from_db(&modified_at)?,
        is_override: is_override != 0,
    })
}

/// Insert or replace a score row
pub async fn save_score(db: &SqlitePool, score: &ProblemScore) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO problem_scores
            (user_id, course_id, problem_key, earned, possible, first_attempted_at, modified_at, is_override)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(user_id, course_id, problem_key) DO UPDATE SET
            earned = excluded.earned,
            possible = excluded.possible,
            first_attempted_at = excluded.first_attempted_at,
            modified_at = excluded.modified_at,
            is_override = excluded.is_override
        "#,
    )
    .bind(score.user_id.0)
    .bind(score.course_id.as_str())
    .bind(score.problem_key.as_str())
    .bind(score.earned)
    .bind(score.possible)
    .bind(opt_to_db(score.first_attempted_at.as_ref()))
    .bind(to_db(&score.modified_at))
    .bind(score.is_override as i64)
    .execute(db)
    .await?;

    Ok(())
}

pub async fn load_score(
    db: &SqlitePool,
    user_id: UserId,
    course_id: &CourseId,
    problem_key: &UsageKey,
) -> Result<Option<ProblemScore>> {
    let row = sqlx::query(
        r#"
        SELECT user_id, course_id, problem_key, earned, possible, first_attempted_at, modified_at, is_override
        FROM problem_scores
        WHERE user_id = ? AND course_id = ? AND problem_key = ?
        "#,
    )
    .bind(user_id.0)
    .bind(course_id.as_str())
    .bind(problem_key.as_str())
    .fetch_optional(db)
    .await?;

    row.as_ref().map(score_from_row).transpose()
}

/// All scores of a learner in a course, keyed by problem
pub async fn load_scores_for_course(
    db: &SqlitePool,
    user_id: UserId,
    course_id: &CourseId,
) -> Result<HashMap<UsageKey, ProblemScore>> {
    let rows = sqlx::query(
        r#"
        SELECT user_id, course_id, problem_key, earned, possible, first_attempted_at, modified_at, is_override
        FROM problem_scores
        WHERE user_id = ? AND course_id = ?
        "#,
    )
    .bind(user_id.0)
    .bind(course_id.as_str())
    .fetch_all(db)
    .await?;

    let mut scores = HashMap::with_capacity(rows.len());
    for row in &rows {
        let score = score_from_row(row)?;
        scores.insert(score.problem_key.clone(), score);
    }
    Ok(scores)
}

/// Learners with any score or course grade in a course, ordered by id
///
/// Keyset pagination: pass the last id of the previous page as `after`.
pub async fn users_for_course(
    db: &SqlitePool,
    course_id: &CourseId,
    after: Option<UserId>,
    limit: usize,
) -> Result<Vec<UserId>> {
    let ids: Vec<i64> = sqlx::query_scalar(
        r#"
        SELECT user_id FROM (
            SELECT user_id FROM problem_scores WHERE course_id = ?
            UNION
            SELECT user_id FROM course_grades WHERE course_id = ?
        )
        WHERE user_id > ?
        ORDER BY user_id
        LIMIT ?
        "#,
    )
    .bind(course_id.as_str())
    .bind(course_id.as_str())
    .bind(after.map_or(i64::MIN, |u| u.0))
    .bind(limit as i64)
    .fetch_all(db)
    .await?;

    Ok(ids.into_iter().map(UserId).collect())
}

/// Remove every score of a learner; returns the number of rows deleted
pub async fn delete_scores_for_user(db: &SqlitePool, user_id: UserId) -> Result<u64> {
    let result = sqlx::query("DELETE FROM problem_scores WHERE user_id = ?")
        .bind(user_id.0)
        .execute(db)
        .await?;
    Ok(result.rows_affected())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use grades_common::db::init_memory_database;

    fn score(user: i64, problem: &str, minute: u32) -> ProblemScore {
        let t = Utc.with_ymd_and_hms(2026, 1, 1, 0, minute, 0).unwrap();
        ProblemScore {
            user_id: UserId(user),
            course_id: CourseId::new("course"),
            problem_key: UsageKey::new(problem),
            earned: 1.0,
            possible: 2.0,
            first_attempted_at: Some(t),
            modified_at: t,
            is_override: false,
        }
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let pool = init_memory_database().await.unwrap();
        let s = score(1, "p1", 5);
        save_score(&pool, &s).await.unwrap();

        let loaded = load_score(&pool, UserId(1), &s.course_id, &s.problem_key)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded, s);
    }

    #[tokio::test]
    async fn test_users_for_course_pages() {
        let pool = init_memory_database().await.unwrap();
        let course = CourseId::new("course");
        for user in [3, 1, 2] {
            save_score(&pool, &score(user, "p1", 1)).await.unwrap();
        }
        save_score(&pool, &score(1, "p2", 1)).await.unwrap();

        let first = users_for_course(&pool, &course, None, 2).await.unwrap();
        assert_eq!(first, vec![UserId(1), UserId(2)]);
        let second = users_for_course(&pool, &course, Some(UserId(2)), 2).await.unwrap();
        assert_eq!(second, vec![UserId(3)]);
    }
}
