//! Learner context used for visibility filtering

use grades_common::UserId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Access level of a user within a course
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessLevel {
    #[default]
    Learner,
    /// Course staff see staff-only and group-gated content
    Staff,
}

/// Who a grade is computed for
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LearnerContext {
    pub user_id: UserId,
    /// Content groups the user belongs to in the course
    #[serde(default)]
    pub groups: BTreeSet<i64>,
    #[serde(default)]
    pub access: AccessLevel,
}

impl LearnerContext {
    /// Plain learner with no group memberships
    pub fn learner(user_id: UserId) -> Self {
        Self {
            user_id,
            groups: BTreeSet::new(),
            access: AccessLevel::Learner,
        }
    }

    pub fn with_groups(mut self, groups: impl IntoIterator<Item = i64>) -> Self {
        self.groups = groups.into_iter().collect();
        self
    }

    pub fn with_access(mut self, access: AccessLevel) -> Self {
        self.access = access;
        self
    }

    pub fn is_staff(&self) -> bool {
        self.access == AccessLevel::Staff
    }

    /// True if the user belongs to at least one of `groups`
    pub fn in_any_group(&self, groups: &BTreeSet<i64>) -> bool {
        groups.iter().any(|g| self.groups.contains(g))
    }
}
