//! Identifier newtypes shared across the grades crates
//!
//! All identifiers are opaque to the engine. They are kept as distinct types
//! so a course id can never be passed where a usage key is expected.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Learner identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub i64);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Course identifier (e.g. `course-v1:Org+Num+Run`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CourseId(pub String);

impl CourseId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CourseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Content path of a block inside a course (problem, subsection, section)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UsageKey(pub String);

impl UsageKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UsageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Immutable course content version
///
/// The fingerprint identifies a snapshot; `published_at` orders snapshots of
/// the same course. A later publish always carries a later timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CourseVersion {
    pub fingerprint: String,
    pub published_at: DateTime<Utc>,
}

impl CourseVersion {
    pub fn new(fingerprint: impl Into<String>, published_at: DateTime<Utc>) -> Self {
        Self {
            fingerprint: fingerprint.into(),
            published_at,
        }
    }

    /// True when `self` is strictly newer than `other`
    pub fn is_newer_than(&self, other: &CourseVersion) -> bool {
        self.published_at > other.published_at
    }
}

impl fmt::Display for CourseVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.fingerprint, self.published_at.to_rfc3339())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_ids_serialize_transparently() {
        let user = UserId(42);
        let course = CourseId::new("course-v1:Org+CS101+2026");
        assert_eq!(serde_json::to_string(&user).unwrap(), "42");
        assert_eq!(
            serde_json::to_string(&course).unwrap(),
            "\"course-v1:Org+CS101+2026\""
        );
    }

    #[test]
    fn test_course_version_ordering_uses_publish_time() {
        let earlier = CourseVersion::new("v1", Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap());
        let later = CourseVersion::new("v0", Utc.with_ymd_and_hms(2026, 2, 1, 0, 0, 0).unwrap());
        assert!(later.is_newer_than(&earlier));
        assert!(!earlier.is_newer_than(&later));
        assert!(!earlier.is_newer_than(&earlier));
    }
}
