//! Grade readers
//!
//! Eager reads return what is stored. Lazy reads first bring a stale course
//! grade up to date with the current snapshot and the learner's scores. Only
//! scores that feed a visible subsection count toward staleness.
//! Readers never fabricate grades: without a stored row and without a
//! successful recompute the answer is `Unavailable` with a reason code.

use crate::blocks::{BlockStructureProvider, LearnerDirectory};
use crate::error::Result;
use crate::models::{CourseGrade, SubsectionGrade};
use crate::services::course_aggregator::{CourseAggregator, CourseComputeOptions};
use crate::services::score_store::ProblemScoreStore;
use crate::services::subsection_aggregator::SubsectionAggregator;
use grades_common::{CourseId, UsageKey, UserId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, warn};

/// How `read_course_grade` treats a stored row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadPolicy {
    /// Return the stored row as-is
    #[default]
    Eager,
    /// Recompute synchronously when the stored row is stale
    Lazy,
}

impl FromStr for ReadPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "eager" => Ok(ReadPolicy::Eager),
            "lazy" => Ok(ReadPolicy::Lazy),
            other => Err(format!("unknown read policy '{}'", other)),
        }
    }
}

impl fmt::Display for ReadPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReadPolicy::Eager => write!(f, "eager"),
            ReadPolicy::Lazy => write!(f, "lazy"),
        }
    }
}

/// Result of a course grade read
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CourseGradeLookup {
    Found(CourseGrade),
    Unavailable { reason: String },
}

impl CourseGradeLookup {
    pub fn grade(&self) -> Option<&CourseGrade> {
        match self {
            CourseGradeLookup::Found(grade) => Some(grade),
            CourseGradeLookup::Unavailable { .. } => None,
        }
    }

    pub fn into_grade(self) -> Option<CourseGrade> {
        match self {
            CourseGradeLookup::Found(grade) => Some(grade),
            CourseGradeLookup::Unavailable { .. } => None,
        }
    }
}

/// Reason code when nothing was ever computed for the learner
pub const NOT_COMPUTED: &str = "not_computed";

#[derive(Clone)]
pub struct GradeReader {
    provider: Arc<dyn BlockStructureProvider>,
    learners: Arc<dyn LearnerDirectory>,
    scores: ProblemScoreStore,
    subsections: SubsectionAggregator,
    courses: CourseAggregator,
}

impl GradeReader {
    pub fn new(
        provider: Arc<dyn BlockStructureProvider>,
        learners: Arc<dyn LearnerDirectory>,
        scores: ProblemScoreStore,
        subsections: SubsectionAggregator,
        courses: CourseAggregator,
    ) -> Self {
        Self {
            provider,
            learners,
            scores,
            subsections,
            courses,
        }
    }

    pub async fn read_subsection_grade(
        &self,
        user_id: UserId,
        course_id: &CourseId,
        subsection_key: &UsageKey,
    ) -> Result<Option<SubsectionGrade>> {
        self.subsections.load_stored(user_id, course_id, subsection_key).await
    }

    pub async fn read_course_grade(
        &self,
        user_id: UserId,
        course_id: &CourseId,
        policy: ReadPolicy,
    ) -> Result<CourseGradeLookup> {
        let stored = self.courses.load_stored(user_id, course_id).await?;
        match policy {
            ReadPolicy::Eager => Ok(match stored {
                Some(grade) => CourseGradeLookup::Found(grade),
                None => CourseGradeLookup::Unavailable {
                    reason: NOT_COMPUTED.to_string(),
                },
            }),
            ReadPolicy::Lazy => self.read_lazy(user_id, course_id, stored).await,
        }
    }

    async fn read_lazy(
        &self,
        user_id: UserId,
        course_id: &CourseId,
        stored: Option<CourseGrade>,
    ) -> Result<CourseGradeLookup> {
        let snapshot = match self.provider.get_snapshot(course_id, None).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(course_id = %course_id, error = %e, "Lazy read without snapshot");
                return Ok(fallback(stored, e.reason_code()));
            }
        };

        let learner = self.learners.learner_context(user_id, course_id).await?;
        let scores = self.scores.fetch_course_scores(user_id, course_id).await?;
        let mut latest_score = None;
        for info in snapshot.visible_subsections(&learner) {
            let latest = SubsectionAggregator::latest_contributing_score(&snapshot, &learner, &info.key, &scores)?;
            latest_score = latest_score.max(latest);
        }

        let stale = match &stored {
            None => true,
            Some(grade) => {
                grade.course_version != snapshot.fingerprint()
                    || grade.grading_policy_hash != snapshot.grading_policy_hash()
                    || latest_score > grade.max_modified_at
            }
        };
        if !stale {
            return Ok(fallback(stored, NOT_COMPUTED));
        }

        debug!(user_id = %user_id, course_id = %course_id, "Lazy read recomputes course grade");
        match self
            .courses
            .compute_course(&learner, &snapshot, CourseComputeOptions::default())
            .await
        {
            Ok(outcome) => Ok(CourseGradeLookup::Found(outcome.grade)),
            Err(e) => {
                warn!(
                    user_id = %user_id,
                    course_id = %course_id,
                    error = %e,
                    "Lazy recompute failed"
                );
                Ok(fallback(stored, e.reason_code()))
            }
        }
    }
}

fn fallback(stored: Option<CourseGrade>, reason: &str) -> CourseGradeLookup {
    match stored {
        Some(grade) => CourseGradeLookup::Found(grade),
        None => CourseGradeLookup::Unavailable {
            reason: reason.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_policy_parses_case_insensitively() {
        assert_eq!("LAZY".parse::<ReadPolicy>().unwrap(), ReadPolicy::Lazy);
        assert_eq!("eager".parse::<ReadPolicy>().unwrap(), ReadPolicy::Eager);
        assert!("sometimes".parse::<ReadPolicy>().is_err());
        assert_eq!(ReadPolicy::Lazy.to_string(), "lazy");
    }

    #[test]
    fn test_fallback_prefers_stored_row() {
        assert_eq!(
            fallback(None, "snapshot_unavailable"),
            CourseGradeLookup::Unavailable {
                reason: "snapshot_unavailable".to_string()
            }
        );
    }
}
