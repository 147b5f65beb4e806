//! Visible blocks persistence (write-once, content addressed)

use crate::error::Result;
use crate::models::BlockRecordList;
use grades_common::time::{now, to_db};
use sqlx::{SqliteConnection, SqlitePool};

/// Store a block list under its hash and return the hash
///
/// Rows are immutable; inserting an existing hash is a no-op, so concurrent
/// writers of the same list race harmlessly.
pub async fn insert_visible_blocks(
    conn: &mut SqliteConnection,
    blocks: &BlockRecordList,
    course_version: &str,
) -> Result<String> {
    let hashed = blocks.hash_value()?;

    sqlx::query(
        r#"
        INSERT OR IGNORE INTO visible_blocks (hashed, blocks_json, course_id, course_version, created_at)
        VALUES (?, ?, ?, ?, ?)
        "#,
    )
    .bind(&hashed)
    .bind(blocks.to_json()?)
    .bind(blocks.course_id.as_str())
    .bind(course_version)
    .bind(to_db(&now()))
    .execute(&mut *conn)
    .await?;

    Ok(hashed)
}

pub async fn load_visible_blocks(db: &SqlitePool, hashed: &str) -> Result<Option<BlockRecordList>> {
    let json: Option<String> = sqlx::query_scalar("SELECT blocks_json FROM visible_blocks WHERE hashed = ?")
        .bind(hashed)
        .fetch_optional(db)
        .await?;

    json.as_deref().map(BlockRecordList::from_json).transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::BlockRecord;
    use grades_common::db::init_memory_database;
    use grades_common::{CourseId, UsageKey};

    #[tokio::test]
    async fn test_insert_is_idempotent() {
        let pool = init_memory_database().await.unwrap();
        let list = BlockRecordList::new(
            CourseId::new("course"),
            vec![BlockRecord {
                locator: UsageKey::new("p1"),
                weight: None,
                raw_possible: 1.0,
                graded: true,
            }],
        );

        let mut conn = pool.acquire().await.unwrap();
        let first = insert_visible_blocks(&mut conn, &list, "v1").await.unwrap();
        let second = insert_visible_blocks(&mut conn, &list, "v2").await.unwrap();
        drop(conn);
        assert_eq!(first, second);

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM visible_blocks")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 1);

        let loaded = load_visible_blocks(&pool, &first).await.unwrap().unwrap();
        assert_eq!(loaded, list);
    }
}
