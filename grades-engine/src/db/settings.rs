//! Settings database access
//!
//! Read/write runtime settings from the `settings` key-value table.

use crate::error::{GradesError, Result};
use sqlx::SqlitePool;
use std::str::FromStr;

/// Generic setting getter
///
/// Returns `None` when the key is missing or NULL; a value that does not
/// parse is an `InvalidInput` error naming the key.
pub async fn get_setting<T: FromStr>(db: &SqlitePool, key: &str) -> Result<Option<T>> {
    let value: Option<Option<String>> = sqlx::query_scalar("SELECT value FROM settings WHERE key = ?")
        .bind(key)
        .fetch_optional(db)
        .await?;

    match value.flatten() {
        Some(s) => match s.trim().parse::<T>() {
            Ok(parsed) => Ok(Some(parsed)),
            Err(_) => Err(GradesError::InvalidInput(format!(
                "Failed to parse setting '{}' value: {}",
                key, s
            ))),
        },
        None => Ok(None),
    }
}

/// Generic setting setter (insert or update)
pub async fn set_setting<T: ToString>(db: &SqlitePool, key: &str, value: T) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO settings (key, value, updated_at)
        VALUES (?, ?, CURRENT_TIMESTAMP)
        ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = CURRENT_TIMESTAMP
        "#,
    )
    .bind(key)
    .bind(value.to_string())
    .execute(db)
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use grades_common::db::init_memory_database;

    #[tokio::test]
    async fn test_get_missing_setting_is_none() {
        let pool = init_memory_database().await.unwrap();
        let value: Option<u32> = get_setting(&pool, "no_such_key").await.unwrap();
        assert!(value.is_none());
    }

    #[tokio::test]
    async fn test_set_then_get_round_trip() {
        let pool = init_memory_database().await.unwrap();
        set_setting(&pool, "worker_count", 12).await.unwrap();
        let value: Option<usize> = get_setting(&pool, "worker_count").await.unwrap();
        assert_eq!(value, Some(12));
    }

    #[tokio::test]
    async fn test_unparseable_setting_is_error() {
        let pool = init_memory_database().await.unwrap();
        set_setting(&pool, "worker_count", "lots").await.unwrap();
        let result: Result<Option<usize>> = get_setting(&pool, "worker_count").await;
        assert!(matches!(result, Err(GradesError::InvalidInput(_))));
    }
}
