//! Subsection grade override rows
//!
//! The current override lives in `subsection_grade_overrides`; every change
//! is also appended to `subsection_grade_override_history` in the same
//! transaction.

use crate::error::Result;
use crate::models::{OverrideAction, OverrideHistoryEntry, SubsectionGradeOverride};
use grades_common::time::{from_db, to_db};
use grades_common::{CourseId, UsageKey, UserId};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};

fn override_from_row(row: &SqliteRow) -> Result<SubsectionGradeOverride> {
    let modified_at: String = row.get("modified_at");
    Ok(SubsectionGradeOverride {
        user_id: UserId(row.get("user_id")),
        course_id: CourseId(row.get("course_id")),
        subsection_key: UsageKey(row.get("usage_key")),
        earned_all: row.get("earned_all_override"),
        possible_all: row.get("possible_all_override"),
        earned_graded: row.get("earned_graded_override"),
        possible_graded: row.get("possible_graded_override"),
        reason: row.get("reason"),
        system: row.get("system"),
        modified_at: from_db(&modified_at)?,
    })
}

/// Store the override and log the change
pub async fn save_override(
    db: &SqlitePool,
    o: &SubsectionGradeOverride,
    requested_by: Option<UserId>,
) -> Result<()> {
    let mut tx = db.begin().await?;
    upsert_override(&mut *tx, o).await?;
    append_history(&mut *tx, o, requested_by).await?;
    tx.commit().await?;
    Ok(())
}

async fn upsert_override(conn: &mut SqliteConnection, o: &SubsectionGradeOverride) -> Result<()> {
    let modified_at = to_db(&o.modified_at);
    sqlx::query(
        r#"
        INSERT INTO subsection_grade_overrides
            (user_id, course_id, usage_key, earned_all_override, possible_all_override,
             earned_graded_override, possible_graded_override, reason, system, created_at, modified_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(user_id, course_id, usage_key) DO UPDATE SET
            earned_all_override = excluded.earned_all_override,
            possible_all_override = excluded.possible_all_override,
            earned_graded_override = excluded.earned_graded_override,
            possible_graded_override = excluded.possible_graded_override,
            reason = excluded.reason,
            system = excluded.system,
            modified_at = excluded.modified_at
        "#,
    )
    .bind(o.user_id.0)
    .bind(o.course_id.as_str())
    .bind(o.subsection_key.as_str())
    .bind(o.earned_all)
    .bind(o.possible_all)
    .bind(o.earned_graded)
    .bind(o.possible_graded)
    .bind(&o.reason)
    .bind(&o.system)
    .bind(&modified_at)
    .bind(&modified_at)
    .execute(conn)
    .await?;

    Ok(())
}

async fn append_history(
    conn: &mut SqliteConnection,
    o: &SubsectionGradeOverride,
    requested_by: Option<UserId>,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO subsection_grade_override_history
            (user_id, course_id, usage_key, action, earned_all_override, possible_all_override,
             earned_graded_override, possible_graded_override, reason, system, requested_by, recorded_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(o.user_id.0)
    .bind(o.course_id.as_str())
    .bind(o.subsection_key.as_str())
    .bind(OverrideAction::for_override(o).as_str())
    .bind(o.earned_all)
    .bind(o.possible_all)
    .bind(o.earned_graded)
    .bind(o.possible_graded)
    .bind(&o.reason)
    .bind(&o.system)
    .bind(requested_by.map(|u| u.0))
    .bind(to_db(&o.modified_at))
    .execute(conn)
    .await?;

    Ok(())
}

pub async fn load_override(
    db: &SqlitePool,
    user_id: UserId,
    course_id: &CourseId,
    subsection_key: &UsageKey,
) -> Result<Option<SubsectionGradeOverride>> {
    let row = sqlx::query(
        r#"
        SELECT user_id, course_id, usage_key, earned_all_override, possible_all_override,
               earned_graded_override, possible_graded_override, reason, system, modified_at
        FROM subsection_grade_overrides
        WHERE user_id = ? AND course_id = ? AND usage_key = ?
        "#,
    )
    .bind(user_id.0)
    .bind(course_id.as_str())
    .bind(subsection_key.as_str())
    .fetch_optional(db)
    .await?;

    row.as_ref().map(override_from_row).transpose()
}

/// Every logged change of one override, oldest first
pub async fn load_override_history(
    db: &SqlitePool,
    user_id: UserId,
    course_id: &CourseId,
    subsection_key: &UsageKey,
) -> Result<Vec<OverrideHistoryEntry>> {
    let rows = sqlx::query(
        r#"
        SELECT history_id, user_id, course_id, usage_key, action, earned_all_override,
               possible_all_override, earned_graded_override, possible_graded_override,
               reason, system, requested_by, recorded_at AS modified_at
        FROM subsection_grade_override_history
        WHERE user_id = ? AND course_id = ? AND usage_key = ?
        ORDER BY history_id
        "#,
    )
    .bind(user_id.0)
    .bind(course_id.as_str())
    .bind(subsection_key.as_str())
    .fetch_all(db)
    .await?;

    rows.iter()
        .map(|row| {
            let action: String = row.get("action");
            let requested_by: Option<i64> = row.get("requested_by");
            Ok(OverrideHistoryEntry {
                history_id: row.get("history_id"),
                action: OverrideAction::parse(&action)?,
                values: override_from_row(row)?,
                requested_by: requested_by.map(UserId),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use grades_common::db::init_memory_database;

    #[tokio::test]
    async fn test_save_replaces_existing() {
        let pool = init_memory_database().await.unwrap();
        let mut o = SubsectionGradeOverride {
            user_id: UserId(1),
            course_id: CourseId::new("course"),
            subsection_key: UsageKey::new("seq1"),
            earned_all: None,
            possible_all: None,
            earned_graded: Some(3.0),
            possible_graded: Some(4.0),
            reason: Some("regrade".to_string()),
            system: Some("gradebook".to_string()),
            modified_at: Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
        };
        save_override(&pool, &o, None).await.unwrap();

        o.earned_graded = None;
        o.possible_graded = None;
        o.modified_at = Utc.with_ymd_and_hms(2026, 1, 2, 0, 0, 0).unwrap();
        save_override(&pool, &o, None).await.unwrap();

        let loaded = load_override(&pool, UserId(1), &o.course_id, &o.subsection_key)
            .await
            .unwrap()
            .unwrap();
        assert!(loaded.is_cleared());
        assert_eq!(loaded, o);
    }

    #[tokio::test]
    async fn test_every_save_is_logged() {
        let pool = init_memory_database().await.unwrap();
        let mut o = SubsectionGradeOverride {
            user_id: UserId(1),
            course_id: CourseId::new("course"),
            subsection_key: UsageKey::new("seq1"),
            earned_all: None,
            possible_all: None,
            earned_graded: Some(3.0),
            possible_graded: None,
            reason: Some("regrade".to_string()),
            system: None,
            modified_at: Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
        };
        save_override(&pool, &o, Some(UserId(90))).await.unwrap();

        o.earned_graded = None;
        o.modified_at = Utc.with_ymd_and_hms(2026, 1, 2, 0, 0, 0).unwrap();
        save_override(&pool, &o, None).await.unwrap();

        let history = load_override_history(&pool, UserId(1), &o.course_id, &o.subsection_key)
            .await
            .unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].action, OverrideAction::Set);
        assert_eq!(history[0].values.earned_graded, Some(3.0));
        assert_eq!(history[0].requested_by, Some(UserId(90)));
        assert_eq!(history[1].action, OverrideAction::Cleared);
        assert_eq!(history[1].values, o);
    }
}
