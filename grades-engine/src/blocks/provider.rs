//! Block-structure providers
//!
//! The engine only ever asks for a snapshot of a course version. Where the
//! snapshot comes from (a content store, a directory of outlines, tests) is
//! behind [`BlockStructureProvider`].

use super::outline::CourseOutline;
use super::structure::BlockStructure;
use crate::error::{GradesError, Result};
use crate::models::GradingPolicy;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use grades_common::events::GradesEvent;
use grades_common::{CourseId, CourseVersion};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

/// Source of course snapshots
#[async_trait]
pub trait BlockStructureProvider: Send + Sync {
    /// Snapshot of `version` (fingerprint), or of the latest version
    ///
    /// Fails with `SnapshotUnavailable` while the course is mid-publish or
    /// when the course or version is unknown.
    async fn get_snapshot(
        &self,
        course_id: &CourseId,
        version: Option<&str>,
    ) -> Result<Arc<BlockStructure>>;
}

#[derive(Default)]
struct CourseVersions {
    /// Ordered by publish time, oldest first
    versions: Vec<Arc<BlockStructure>>,
    publishing: bool,
}

/// Provider holding every published version in memory
#[derive(Default, Clone)]
pub struct InMemoryBlockProvider {
    courses: Arc<RwLock<HashMap<CourseId, CourseVersions>>>,
}

impl InMemoryBlockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a course as mid-publish; snapshots are unavailable until
    /// [`publish`](Self::publish) or [`abort_publish`](Self::abort_publish)
    pub async fn begin_publish(&self, course_id: &CourseId) {
        let mut courses = self.courses.write().await;
        courses.entry(course_id.clone()).or_default().publishing = true;
        info!(course_id = %course_id, "Publish started");
    }

    pub async fn abort_publish(&self, course_id: &CourseId) {
        let mut courses = self.courses.write().await;
        if let Some(entry) = courses.get_mut(course_id) {
            entry.publishing = false;
        }
        warn!(course_id = %course_id, "Publish aborted");
    }

    /// Publish a new version and return the `ContentPublished` event for it
    ///
    /// The version must be newer than every version already published.
    pub async fn publish(&self, outline: CourseOutline) -> Result<GradesEvent> {
        let structure = BlockStructure::from_outline(&outline)?;
        let mut courses = self.courses.write().await;
        let entry = courses.entry(outline.course_id.clone()).or_default();

        if let Some(latest) = entry.versions.last() {
            if !outline.version.is_newer_than(latest.version()) {
                entry.publishing = false;
                return Err(GradesError::InvalidInput(format!(
                    "version {} of {} is not newer than published {}",
                    outline.version,
                    outline.course_id,
                    latest.version()
                )));
            }
        }

        entry.versions.push(Arc::new(structure));
        entry.publishing = false;

        info!(
            course_id = %outline.course_id,
            version = %outline.version,
            blocks = outline.blocks.len(),
            "Course version published"
        );

        Ok(GradesEvent::ContentPublished {
            course_id: outline.course_id,
            version: outline.version,
            edited_at: outline.edited_at,
        })
    }

    /// Publish a grading policy change on top of the latest content
    ///
    /// Produces a new version with identical blocks and returns the
    /// `GradingPolicyChanged` event for it.
    pub async fn update_grading_policy(
        &self,
        course_id: &CourseId,
        policy: GradingPolicy,
        fingerprint: impl Into<String>,
        published_at: DateTime<Utc>,
    ) -> Result<GradesEvent> {
        let version = CourseVersion::new(fingerprint, published_at);
        let mut courses = self.courses.write().await;
        let entry = courses
            .get_mut(course_id)
            .ok_or_else(|| unavailable(course_id, "course has no published version"))?;
        let latest = entry
            .versions
            .last()
            .ok_or_else(|| unavailable(course_id, "course has no published version"))?;

        if !version.is_newer_than(latest.version()) {
            return Err(GradesError::InvalidInput(format!(
                "policy version {} of {} is not newer than {}",
                version,
                course_id,
                latest.version()
            )));
        }

        let updated = latest.with_grading_policy(policy, version.clone())?;
        entry.versions.push(Arc::new(updated));

        info!(course_id = %course_id, version = %version, "Grading policy updated");

        Ok(GradesEvent::GradingPolicyChanged {
            course_id: course_id.clone(),
            version,
        })
    }

    pub async fn courses(&self) -> Vec<CourseId> {
        let mut ids: Vec<CourseId> = self.courses.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }
}

#[async_trait]
impl BlockStructureProvider for InMemoryBlockProvider {
    async fn get_snapshot(
        &self,
        course_id: &CourseId,
        version: Option<&str>,
    ) -> Result<Arc<BlockStructure>> {
        let courses = self.courses.read().await;
        let entry = courses
            .get(course_id)
            .ok_or_else(|| unavailable(course_id, "unknown course"))?;

        if entry.publishing {
            return Err(unavailable(course_id, "publish in progress"));
        }

        let found = match version {
            None => entry.versions.last(),
            Some(fingerprint) => entry
                .versions
                .iter()
                .rev()
                .find(|s| s.fingerprint() == fingerprint),
        };

        found
            .cloned()
            .ok_or_else(|| unavailable(course_id, "version not published"))
    }
}

fn unavailable(course_id: &CourseId, reason: &str) -> GradesError {
    GradesError::SnapshotUnavailable {
        course_id: course_id.clone(),
        reason: reason.to_string(),
    }
}

/// Load every `*.json` outline in `dir` into a new provider
///
/// Files are published in name order; each course's outlines must therefore
/// sort in publish order.
pub async fn load_outlines_from_dir(dir: &Path) -> Result<InMemoryBlockProvider> {
    let provider = InMemoryBlockProvider::new();

    let mut paths = Vec::new();
    let entries = std::fs::read_dir(dir).map_err(|e| {
        GradesError::InvalidInput(format!("read outline dir {}: {}", dir.display(), e))
    })?;
    for entry in entries {
        let path = entry
            .map_err(|e| GradesError::InvalidInput(format!("read outline dir entry: {}", e)))?
            .path();
        if path.extension().is_some_and(|ext| ext == "json") {
            paths.push(path);
        }
    }
    paths.sort();

    for path in paths {
        let json = tokio::fs::read_to_string(&path).await.map_err(|e| {
            GradesError::InvalidInput(format!("read outline {}: {}", path.display(), e))
        })?;
        let outline = CourseOutline::from_json(&json)?;
        provider.publish(outline).await?;
    }

    info!(
        dir = %dir.display(),
        courses = provider.courses().await.len(),
        "Course outlines loaded"
    );
    Ok(provider)
}
