//! Staff overrides of subsection grades
//!
//! An override is stored per (user, course, subsection) and applied by the
//! subsection aggregator after aggregation. Clearing keeps the row with every
//! value unset, so its newer `modified_at` still invalidates the overridden
//! grade. Every set and clear is appended to the override history.

use crate::db::overrides;
use crate::error::Result;
use crate::models::{OverrideHistoryEntry, SubsectionGradeOverride};
use crate::services::locks::GradeLocks;
use crate::utils::retry_on_lock;
use chrono::Duration;
use grades_common::{time, CourseId, UsageKey, UserId};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::sync::Arc;
use tracing::info;

/// Override values requested by staff; unset fields keep the computed value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverrideRequest {
    pub user_id: UserId,
    pub course_id: CourseId,
    pub subsection_key: UsageKey,
    #[serde(default)]
    pub earned_all: Option<f64>,
    #[serde(default)]
    pub possible_all: Option<f64>,
    #[serde(default)]
    pub earned_graded: Option<f64>,
    #[serde(default)]
    pub possible_graded: Option<f64>,
    #[serde(default)]
    pub reason: Option<String>,
    /// Originating tool, e.g. "gradebook"
    #[serde(default)]
    pub system: Option<String>,
    /// Staff member asking for the change
    #[serde(default)]
    pub requested_by: Option<UserId>,
}

#[derive(Clone)]
pub struct OverrideService {
    db: SqlitePool,
    locks: Arc<GradeLocks>,
    max_lock_wait_ms: u64,
}

impl OverrideService {
    pub fn new(db: SqlitePool, locks: Arc<GradeLocks>, max_lock_wait_ms: u64) -> Self {
        Self {
            db,
            locks,
            max_lock_wait_ms,
        }
    }

    /// Validate and store an override
    pub async fn set_override(&self, request: OverrideRequest) -> Result<SubsectionGradeOverride> {
        let mut o = SubsectionGradeOverride {
            user_id: request.user_id,
            course_id: request.course_id,
            subsection_key: request.subsection_key,
            earned_all: request.earned_all,
            possible_all: request.possible_all,
            earned_graded: request.earned_graded,
            possible_graded: request.possible_graded,
            reason: request.reason,
            system: request.system,
            modified_at: time::now(),
        };
        o.validate()?;
        self.save(&mut o, request.requested_by).await?;

        info!(
            user_id = %o.user_id,
            course_id = %o.course_id,
            subsection_key = %o.subsection_key,
            reason = ?o.reason,
            requested_by = ?request.requested_by,
            "Subsection grade override set"
        );
        Ok(o)
    }

    /// Unset every override value of a subsection
    pub async fn clear_override(
        &self,
        user_id: UserId,
        course_id: CourseId,
        subsection_key: UsageKey,
        requested_by: Option<UserId>,
    ) -> Result<SubsectionGradeOverride> {
        let mut o = SubsectionGradeOverride {
            user_id,
            course_id,
            subsection_key,
            earned_all: None,
            possible_all: None,
            earned_graded: None,
            possible_graded: None,
            reason: None,
            system: None,
            modified_at: time::now(),
        };
        self.save(&mut o, requested_by).await?;

        info!(
            user_id = %o.user_id,
            course_id = %o.course_id,
            subsection_key = %o.subsection_key,
            requested_by = ?requested_by,
            "Subsection grade override cleared"
        );
        Ok(o)
    }

    pub async fn load_override(
        &self,
        user_id: UserId,
        course_id: &CourseId,
        subsection_key: &UsageKey,
    ) -> Result<Option<SubsectionGradeOverride>> {
        retry_on_lock("load_override", self.max_lock_wait_ms, || {
            overrides::load_override(&self.db, user_id, course_id, subsection_key)
        })
        .await
    }

    pub async fn override_history(
        &self,
        user_id: UserId,
        course_id: &CourseId,
        subsection_key: &UsageKey,
    ) -> Result<Vec<OverrideHistoryEntry>> {
        retry_on_lock("load_override_history", self.max_lock_wait_ms, || {
            overrides::load_override_history(&self.db, user_id, course_id, subsection_key)
        })
        .await
    }

    /// Store under the subsection lock with a strictly newer `modified_at`
    async fn save(&self, o: &mut SubsectionGradeOverride, requested_by: Option<UserId>) -> Result<()> {
        let _guard = self
            .locks
            .subsections
            .lock(&(o.user_id, o.course_id.clone(), o.subsection_key.clone()))
            .await;

        if let Some(previous) = self.load_override(o.user_id, &o.course_id, &o.subsection_key).await? {
            if previous.modified_at >= o.modified_at {
                o.modified_at = previous.modified_at + Duration::microseconds(1);
            }
        }

        let o = &*o;
        retry_on_lock("save_override", self.max_lock_wait_ms, || {
            overrides::save_override(&self.db, o, requested_by)
        })
        .await
    }
}
