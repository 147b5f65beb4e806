//! Runtime configuration for the grades engine
//!
//! Two tiers, as for every service in this workspace:
//! 1. **TOML bootstrap** (`grades_common::config::TomlConfig`): root folder,
//!    database file, outline directory, logging. Read once at startup.
//! 2. **Database runtime** (`settings` table): worker pool size, retry
//!    policy, backpressure thresholds, recompute policy.
//!
//! Missing or NULL runtime settings fall back to the built-in defaults below.

use crate::db::settings::get_setting;
use crate::error::{GradesError, Result};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

/// What the coordinator does when new content is published
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PublishRecomputePolicy {
    /// Fan out course recomputes for every graded learner
    Eager,
    /// Do nothing; lazy readers recompute on demand
    Lazy,
}

impl FromStr for PublishRecomputePolicy {
    type Err = GradesError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "eager" => Ok(PublishRecomputePolicy::Eager),
            "lazy" => Ok(PublishRecomputePolicy::Lazy),
            other => Err(GradesError::InvalidInput(format!(
                "Unknown publish recompute policy: {}",
                other
            ))),
        }
    }
}

impl fmt::Display for PublishRecomputePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PublishRecomputePolicy::Eager => f.write_str("eager"),
            PublishRecomputePolicy::Lazy => f.write_str("lazy"),
        }
    }
}

/// Runtime settings loaded from the database
#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    // === Worker pool ===
    pub worker_count: usize,

    // === Retry policy ===
    pub max_attempts: u32,
    pub retry_base_ms: u64,
    pub retry_max_ms: u64,

    // === Backpressure ===
    pub queue_depth_threshold: usize,
    pub fanout_batch_size: usize,
    pub fanout_throttle_ms: u64,

    // === Recompute policy ===
    pub publish_recompute_policy: PublishRecomputePolicy,

    // === Events ===
    pub event_bus_capacity: usize,

    // === Database ===
    pub database_max_lock_wait_ms: u64,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            worker_count: 4,
            max_attempts: 5,
            retry_base_ms: 100,
            retry_max_ms: 30_000,
            queue_depth_threshold: 10_000,
            fanout_batch_size: 100,
            fanout_throttle_ms: 1000,
            publish_recompute_policy: PublishRecomputePolicy::Eager,
            event_bus_capacity: 1000,
            database_max_lock_wait_ms: 5000,
        }
    }
}

impl RuntimeSettings {
    /// Load settings from the database, using defaults for missing values
    pub async fn load(db: &SqlitePool) -> Result<Self> {
        let defaults = Self::default();

        let settings = Self {
            worker_count: get_setting(db, "worker_count")
                .await?
                .unwrap_or(defaults.worker_count)
                .max(1),
            max_attempts: get_setting(db, "max_attempts")
                .await?
                .unwrap_or(defaults.max_attempts)
                .max(1),
            retry_base_ms: get_setting(db, "retry_base_ms")
                .await?
                .unwrap_or(defaults.retry_base_ms),
            retry_max_ms: get_setting(db, "retry_max_ms")
                .await?
                .unwrap_or(defaults.retry_max_ms),
            queue_depth_threshold: get_setting(db, "queue_depth_threshold")
                .await?
                .unwrap_or(defaults.queue_depth_threshold),
            fanout_batch_size: get_setting(db, "fanout_batch_size")
                .await?
                .unwrap_or(defaults.fanout_batch_size)
                .max(1),
            fanout_throttle_ms: get_setting(db, "fanout_throttle_ms")
                .await?
                .unwrap_or(defaults.fanout_throttle_ms),
            publish_recompute_policy: get_setting(db, "publish_recompute_policy")
                .await?
                .unwrap_or(defaults.publish_recompute_policy),
            event_bus_capacity: get_setting(db, "event_bus_capacity")
                .await?
                .unwrap_or(defaults.event_bus_capacity)
                .max(1),
            database_max_lock_wait_ms: get_setting(db, "database_max_lock_wait_ms")
                .await?
                .unwrap_or(defaults.database_max_lock_wait_ms),
        };

        info!(
            workers = settings.worker_count,
            max_attempts = settings.max_attempts,
            policy = %settings.publish_recompute_policy,
            "Runtime settings loaded"
        );

        Ok(settings)
    }

    pub fn retry_base(&self) -> Duration {
        Duration::from_millis(self.retry_base_ms)
    }

    pub fn retry_max(&self) -> Duration {
        Duration::from_millis(self.retry_max_ms.max(self.retry_base_ms))
    }

    pub fn fanout_throttle(&self) -> Duration {
        Duration::from_millis(self.fanout_throttle_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::settings::set_setting;
    use grades_common::db::init_memory_database;

    #[tokio::test]
    async fn test_load_defaults_from_fresh_database() {
        let pool = init_memory_database().await.unwrap();
        let settings = RuntimeSettings::load(&pool).await.unwrap();

        assert_eq!(settings.worker_count, 4);
        assert_eq!(settings.max_attempts, 5);
        assert_eq!(settings.publish_recompute_policy, PublishRecomputePolicy::Eager);
    }

    #[tokio::test]
    async fn test_load_overridden_values() {
        let pool = init_memory_database().await.unwrap();
        set_setting(&pool, "publish_recompute_policy", "lazy").await.unwrap();
        set_setting(&pool, "worker_count", 0).await.unwrap();

        let settings = RuntimeSettings::load(&pool).await.unwrap();
        assert_eq!(settings.publish_recompute_policy, PublishRecomputePolicy::Lazy);
        assert_eq!(settings.worker_count, 1, "worker_count is clamped to at least one");
    }

    #[test]
    fn test_policy_parse_rejects_unknown() {
        assert!("sometimes".parse::<PublishRecomputePolicy>().is_err());
        assert_eq!("EAGER".parse::<PublishRecomputePolicy>().unwrap(), PublishRecomputePolicy::Eager);
    }
}
