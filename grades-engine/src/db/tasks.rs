//! Recompute task state persistence

use crate::error::{GradesError, Result};
use chrono::{DateTime, Utc};
use grades_common::time::{from_db, opt_from_db, opt_to_db, to_db};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

/// Stored form of a recompute task
#[derive(Debug, Clone, PartialEq)]
pub struct TaskRow {
    pub task_id: Uuid,
    pub task_key: String,
    /// Serialized task kind (JSON)
    pub kind: String,
    pub state: String,
    pub attempts: u32,
    pub not_before: DateTime<Utc>,
    pub trigger_modified_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub enqueued_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn task_from_row(row: &SqliteRow) -> Result<TaskRow> {
    let task_id: String = row.get("task_id");
    let attempts: i64 = row.get("attempts");
    let not_before: String = row.get("not_before");
    let trigger_modified_at: Option<String> = row.get("trigger_modified_at");
    let enqueued_at: String = row.get("enqueued_at");
    let updated_at: String = row.get("updated_at");

    Ok(TaskRow {
        task_id: Uuid::parse_str(&task_id).map_err(|e| {
            GradesError::InvalidInput(format!("stored task id '{}': {}", task_id, e))
        })?,
        task_key: row.get("task_key"),
        kind: row.get("kind"),
        state: row.get("state"),
        attempts: attempts.max(0) as u32,
        not_before: from_db(&not_before)?,
        trigger_modified_at: opt_from_db(trigger_modified_at.as_deref())?,
        last_error: row.get("last_error"),
        enqueued_at: from_db(&enqueued_at)?,
        updated_at: from_db(&updated_at)?,
    })
}

/// Insert or update a task row
pub async fn save_task(db: &SqlitePool, task: &TaskRow) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO recompute_tasks
            (task_id, task_key, kind, state, attempts, not_before, trigger_modified_at,
             last_error, enqueued_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(task_id) DO UPDATE SET
            kind = excluded.kind,
            state = excluded.state,
            attempts = excluded.attempts,
            not_before = excluded.not_before,
            trigger_modified_at = excluded.trigger_modified_at,
            last_error = excluded.last_error,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(task.task_id.to_string())
    .bind(&task.task_key)
    .bind(&task.kind)
    .bind(&task.state)
    .bind(task.attempts as i64)
    .bind(to_db(&task.not_before))
    .bind(opt_to_db(task.trigger_modified_at.as_ref()))
    .bind(&task.last_error)
    .bind(to_db(&task.enqueued_at))
    .bind(to_db(&task.updated_at))
    .execute(db)
    .await?;

    Ok(())
}

pub async fn delete_task(db: &SqlitePool, task_id: Uuid) -> Result<()> {
    sqlx::query("DELETE FROM recompute_tasks WHERE task_id = ?")
        .bind(task_id.to_string())
        .execute(db)
        .await?;
    Ok(())
}

/// Tasks in any state other than `failed`, oldest first
pub async fn load_unfinished_tasks(db: &SqlitePool) -> Result<Vec<TaskRow>> {
    let rows = sqlx::query(
        r#"
        SELECT task_id, task_key, kind, state, attempts, not_before, trigger_modified_at,
               last_error, enqueued_at, updated_at
        FROM recompute_tasks
        WHERE state != 'failed'
        ORDER BY enqueued_at
        "#,
    )
    .fetch_all(db)
    .await?;

    rows.iter().map(task_from_row).collect()
}

/// Failed tasks, newest first
pub async fn load_failed_tasks(db: &SqlitePool, limit: usize) -> Result<Vec<TaskRow>> {
    let rows = sqlx::query(
        r#"
        SELECT task_id, task_key, kind, state, attempts, not_before, trigger_modified_at,
               last_error, enqueued_at, updated_at
        FROM recompute_tasks
        WHERE state = 'failed'
        ORDER BY updated_at DESC
        LIMIT ?
        "#,
    )
    .bind(limit as i64)
    .fetch_all(db)
    .await?;

    rows.iter().map(task_from_row).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use grades_common::db::init_memory_database;

    fn row(state: &str, minute: u32) -> TaskRow {
        let t = Utc.with_ymd_and_hms(2026, 1, 1, 0, minute, 0).unwrap();
        TaskRow {
            task_id: Uuid::new_v4(),
            task_key: format!("course:1:c:{}", minute),
            kind: "{}".to_string(),
            state: state.to_string(),
            attempts: 1,
            not_before: t,
            trigger_modified_at: None,
            last_error: None,
            enqueued_at: t,
            updated_at: t,
        }
    }

    #[tokio::test]
    async fn test_unfinished_excludes_failed() {
        let pool = init_memory_database().await.unwrap();
        let queued = row("queued", 2);
        let in_flight = row("in_flight", 1);
        let failed = row("failed", 3);
        for r in [&queued, &in_flight, &failed] {
            save_task(&pool, r).await.unwrap();
        }

        let unfinished = load_unfinished_tasks(&pool).await.unwrap();
        assert_eq!(unfinished, vec![in_flight.clone(), queued.clone()]);

        let failed_rows = load_failed_tasks(&pool, 10).await.unwrap();
        assert_eq!(failed_rows, vec![failed]);

        delete_task(&pool, queued.task_id).await.unwrap();
        assert_eq!(load_unfinished_tasks(&pool).await.unwrap(), vec![in_flight]);
    }
}
