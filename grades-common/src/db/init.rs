//! Database initialization
//!
//! Creates the grades schema on first run and fills in default runtime
//! settings. Every statement is idempotent, so opening an existing database
//! runs the same sequence safely.

use crate::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, warn};

/// Current schema version recorded in `schema_version`
pub const SCHEMA_VERSION: i64 = 1;

/// Default runtime settings written on first run
pub const DEFAULT_SETTINGS: &[(&str, &str)] = &[
    ("worker_count", "4"),
    ("max_attempts", "5"),
    ("retry_base_ms", "100"),
    ("retry_max_ms", "30000"),
    ("queue_depth_threshold", "10000"),
    ("fanout_batch_size", "100"),
    ("fanout_throttle_ms", "1000"),
    ("publish_recompute_policy", "eager"),
    ("event_bus_capacity", "1000"),
    ("database_max_lock_wait_ms", "5000"),
    ("database_busy_timeout_ms", "250"),
];

/// Initialize database connection and create tables if needed
pub async fn init_database(db_path: &Path) -> Result<SqlitePool> {
    let newly_created = !db_path.exists();

    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", db_path.display()))?
        .create_if_missing(true)
        .foreign_keys(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_millis(5000));

    // Aggregation workers write concurrently; WAL gives one writer plus readers
    let pool = SqlitePoolOptions::new()
        .max_connections(16)
        .min_connections(2)
        .connect_with(options)
        .await?;

    if newly_created {
        info!("Initialized new database: {}", db_path.display());
    } else {
        info!("Opened existing database: {}", db_path.display());
    }

    init_schema(&pool).await?;

    // Apply configurable busy timeout from settings
    let timeout_ms: i64 = sqlx::query_scalar(
        "SELECT CAST(value AS INTEGER) FROM settings WHERE key = 'database_busy_timeout_ms'",
    )
    .fetch_optional(&pool)
    .await?
    .unwrap_or(250);

    sqlx::query(&format!("PRAGMA busy_timeout = {}", timeout_ms))
        .execute(&pool)
        .await?;
    info!("Database busy timeout set to {} ms", timeout_ms);

    Ok(pool)
}

/// Create an in-memory database with the full schema
///
/// SQLite memory databases are per connection, so the pool holds exactly one
/// connection that is never recycled.
pub async fn init_memory_database() -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .min_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await?;

    init_schema(&pool).await?;
    Ok(pool)
}

/// Create every table and default setting (idempotent)
pub async fn init_schema(pool: &SqlitePool) -> Result<()> {
    create_schema_version_table(pool).await?;
    create_settings_table(pool).await?;
    create_problem_scores_table(pool).await?;
    create_visible_blocks_table(pool).await?;
    create_subsection_grades_table(pool).await?;
    create_subsection_grade_overrides_table(pool).await?;
    create_subsection_grade_override_history_table(pool).await?;
    create_course_grades_table(pool).await?;
    create_recompute_tasks_table(pool).await?;

    sqlx::query("INSERT OR IGNORE INTO schema_version (version) VALUES (?)")
        .bind(SCHEMA_VERSION)
        .execute(pool)
        .await?;

    init_default_settings(pool).await?;
    Ok(())
}

async fn create_schema_version_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Create the settings table
///
/// Stores runtime configuration key-value pairs.
pub async fn create_settings_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS settings (
            key TEXT PRIMARY KEY,
            value TEXT,
            updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_problem_scores_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS problem_scores (
            user_id INTEGER NOT NULL,
            course_id TEXT NOT NULL,
            problem_key TEXT NOT NULL,
            earned REAL NOT NULL,
            possible REAL NOT NULL,
            first_attempted_at TEXT,
            modified_at TEXT NOT NULL,
            is_override INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (user_id, course_id, problem_key)
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Content-addressed block lists, shared by many subsection grade rows
async fn create_visible_blocks_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS visible_blocks (
            hashed TEXT PRIMARY KEY,
            blocks_json TEXT NOT NULL,
            course_id TEXT NOT NULL,
            course_version TEXT NOT NULL,
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_visible_blocks_course ON visible_blocks(course_id)")
        .execute(pool)
        .await?;

    Ok(())
}

async fn create_subsection_grades_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS subsection_grades (
            user_id INTEGER NOT NULL,
            course_id TEXT NOT NULL,
            usage_key TEXT NOT NULL,
            earned_all REAL NOT NULL,
            possible_all REAL NOT NULL,
            earned_graded REAL NOT NULL,
            possible_graded REAL NOT NULL,
            first_attempted_at TEXT,
            course_version TEXT NOT NULL,
            version_published_at TEXT NOT NULL,
            subtree_edited_at TEXT,
            visible_blocks_hash TEXT NOT NULL REFERENCES visible_blocks(hashed),
            max_modified_at TEXT NOT NULL DEFAULT '',
            created_at TEXT NOT NULL,
            modified_at TEXT NOT NULL,
            UNIQUE (user_id, course_id, usage_key)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_subsection_grades_course ON subsection_grades(course_id, usage_key)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_subsection_grade_overrides_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS subsection_grade_overrides (
            user_id INTEGER NOT NULL,
            course_id TEXT NOT NULL,
            usage_key TEXT NOT NULL,
            earned_all_override REAL,
            possible_all_override REAL,
            earned_graded_override REAL,
            possible_graded_override REAL,
            reason TEXT,
            system TEXT,
            created_at TEXT NOT NULL,
            modified_at TEXT NOT NULL,
            PRIMARY KEY (user_id, course_id, usage_key)
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Append-only log of override changes
async fn create_subsection_grade_override_history_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS subsection_grade_override_history (
            history_id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id INTEGER NOT NULL,
            course_id TEXT NOT NULL,
            usage_key TEXT NOT NULL,
            action TEXT NOT NULL,
            earned_all_override REAL,
            possible_all_override REAL,
            earned_graded_override REAL,
            possible_graded_override REAL,
            reason TEXT,
            system TEXT,
            requested_by INTEGER,
            recorded_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_override_history_key ON subsection_grade_override_history(user_id, course_id, usage_key)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_course_grades_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS course_grades (
            user_id INTEGER NOT NULL,
            course_id TEXT NOT NULL,
            percent_grade REAL NOT NULL,
            letter_grade TEXT NOT NULL DEFAULT '',
            passed_at TEXT,
            course_version TEXT NOT NULL,
            version_published_at TEXT NOT NULL,
            course_edited_at TEXT,
            grading_policy_hash TEXT NOT NULL,
            max_modified_at TEXT NOT NULL DEFAULT '',
            created_at TEXT NOT NULL,
            modified_at TEXT NOT NULL,
            UNIQUE (user_id, course_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_course_grades_course ON course_grades(course_id)")
        .execute(pool)
        .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_course_grades_passed ON course_grades(passed_at, course_id)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Coordinator task state (at-least-once recompute queue)
async fn create_recompute_tasks_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS recompute_tasks (
            task_id TEXT PRIMARY KEY,
            task_key TEXT NOT NULL,
            kind TEXT NOT NULL,
            state TEXT NOT NULL,
            attempts INTEGER NOT NULL DEFAULT 0,
            not_before TEXT NOT NULL,
            trigger_modified_at TEXT,
            last_error TEXT,
            enqueued_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_recompute_tasks_state ON recompute_tasks(state)")
        .execute(pool)
        .await?;

    Ok(())
}

/// Initialize or repair default settings
///
/// Missing keys are created; NULL values are reset to the default.
async fn init_default_settings(pool: &SqlitePool) -> Result<()> {
    for (key, default_value) in DEFAULT_SETTINGS {
        ensure_setting(pool, key, default_value).await?;
    }
    Ok(())
}

async fn ensure_setting(pool: &SqlitePool, key: &str, default_value: &str) -> Result<()> {
    // INSERT OR IGNORE handles concurrent initialization races
    let inserted = sqlx::query("INSERT OR IGNORE INTO settings (key, value) VALUES (?, ?)")
        .bind(key)
        .bind(default_value)
        .execute(pool)
        .await?
        .rows_affected();

    if inserted > 0 {
        info!("Initialized setting '{}' with default value: {}", key, default_value);
        return Ok(());
    }

    let reset = sqlx::query(
        "UPDATE settings SET value = ?, updated_at = CURRENT_TIMESTAMP WHERE key = ? AND value IS NULL",
    )
    .bind(default_value)
    .bind(key)
    .execute(pool)
    .await?
    .rows_affected();

    if reset > 0 {
        warn!("Setting '{}' was NULL, reset to default: {}", key, default_value);
    }

    Ok(())
}
