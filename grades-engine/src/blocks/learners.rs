//! Learner directory: group memberships and access levels per course

use crate::error::{GradesError, Result};
use crate::models::{AccessLevel, LearnerContext};
use async_trait::async_trait;
use grades_common::{CourseId, UserId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Resolves who a learner is within a course
#[async_trait]
pub trait LearnerDirectory: Send + Sync {
    async fn learner_context(&self, user_id: UserId, course_id: &CourseId) -> Result<LearnerContext>;
}

/// Membership entry as stored in a learners JSON file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearnerEntry {
    pub user_id: UserId,
    pub course_id: CourseId,
    #[serde(default)]
    pub groups: BTreeSet<i64>,
    #[serde(default)]
    pub access: AccessLevel,
}

/// In-memory directory; unknown users are plain learners without groups
#[derive(Default, Clone)]
pub struct InMemoryLearnerDirectory {
    entries: Arc<RwLock<HashMap<(UserId, CourseId), LearnerContext>>>,
}

impl InMemoryLearnerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read a JSON array of [`LearnerEntry`]
    pub async fn load_from_file(path: &Path) -> Result<Self> {
        let json = tokio::fs::read_to_string(path).await.map_err(|e| {
            GradesError::InvalidInput(format!("read learners {}: {}", path.display(), e))
        })?;
        let entries: Vec<LearnerEntry> = serde_json::from_str(&json)?;

        let directory = Self::new();
        for entry in entries {
            let context = LearnerContext {
                user_id: entry.user_id,
                groups: entry.groups,
                access: entry.access,
            };
            directory.set(entry.course_id, context).await;
        }
        Ok(directory)
    }

    pub async fn set(&self, course_id: CourseId, context: LearnerContext) {
        self.entries
            .write()
            .await
            .insert((context.user_id, course_id), context);
    }

    pub async fn set_groups(&self, user_id: UserId, course_id: &CourseId, groups: impl IntoIterator<Item = i64>) {
        let mut entries = self.entries.write().await;
        let context = entries
            .entry((user_id, course_id.clone()))
            .or_insert_with(|| LearnerContext::learner(user_id));
        context.groups = groups.into_iter().collect();
    }

    pub async fn remove_user(&self, user_id: UserId) {
        self.entries.write().await.retain(|(user, _), _| *user != user_id);
    }
}

#[async_trait]
impl LearnerDirectory for InMemoryLearnerDirectory {
    async fn learner_context(&self, user_id: UserId, course_id: &CourseId) -> Result<LearnerContext> {
        let entries = self.entries.read().await;
        Ok(entries
            .get(&(user_id, course_id.clone()))
            .cloned()
            .unwrap_or_else(|| LearnerContext::learner(user_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unknown_user_is_plain_learner() {
        let directory = InMemoryLearnerDirectory::new();
        let context = directory
            .learner_context(UserId(1), &CourseId::new("course"))
            .await
            .unwrap();
        assert!(context.groups.is_empty());
        assert!(!context.is_staff());
    }

    #[tokio::test]
    async fn test_groups_are_per_course() {
        let directory = InMemoryLearnerDirectory::new();
        let course_a = CourseId::new("a");
        directory.set_groups(UserId(1), &course_a, [3, 4]).await;

        let in_a = directory.learner_context(UserId(1), &course_a).await.unwrap();
        assert!(in_a.groups.contains(&3));
        let in_b = directory
            .learner_context(UserId(1), &CourseId::new("b"))
            .await
            .unwrap();
        assert!(in_b.groups.is_empty());
    }

    #[tokio::test]
    async fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("learners.json");
        std::fs::write(
            &path,
            r#"[{"user_id": 5, "course_id": "c", "groups": [1], "access": "staff"}]"#,
        )
        .unwrap();

        let directory = InMemoryLearnerDirectory::load_from_file(&path).await.unwrap();
        let context = directory.learner_context(UserId(5), &CourseId::new("c")).await.unwrap();
        assert!(context.is_staff());
        assert!(context.groups.contains(&1));
    }
}
