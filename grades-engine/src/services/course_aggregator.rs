//! Course Aggregator
//!
//! Rolls a learner's subsection grades up into a persistent [`CourseGrade`]
//! using the snapshot's grading policy. Missing subsection grades are
//! computed first; grades from another course version are recomputed unless
//! the run only re-applies the policy.
//!
//! `passed_at` is sticky: once stored it is never cleared, and
//! `LearnerPassed` is emitted only by the write that first sets it.

use crate::blocks::BlockStructure;
use crate::db::{course_grades, subsection_grades};
use crate::error::Result;
use crate::models::policy::GradeBreakdown;
use crate::models::{CourseGrade, LearnerContext, SubsectionGrade};
use crate::services::locks::GradeLocks;
use crate::services::subsection_aggregator::SubsectionAggregator;
use crate::utils::retry_on_lock;
use chrono::{DateTime, Utc};
use grades_common::events::{EventBus, GradesEvent};
use grades_common::{time, CourseId, UserId};
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CourseComputeOptions {
    /// Recompute subsection grades stored under another course version
    pub recompute_stale_subsections: bool,
}

impl Default for CourseComputeOptions {
    fn default() -> Self {
        Self {
            recompute_stale_subsections: true,
        }
    }
}

impl CourseComputeOptions {
    /// Re-apply the grading policy to the stored subsection grades
    pub fn policy_only() -> Self {
        Self {
            recompute_stale_subsections: false,
        }
    }
}

/// Result of one course aggregation run
#[derive(Debug, Clone, PartialEq)]
pub struct CourseOutcome {
    /// The persisted row (the stored one when the write lost)
    pub grade: CourseGrade,
    pub written: bool,
    /// Per-category detail of this computation
    pub breakdown: GradeBreakdown,
    /// Subsection grades the computation used, in course order
    pub subsections: Vec<SubsectionGrade>,
}

#[derive(Clone)]
pub struct CourseAggregator {
    db: SqlitePool,
    event_bus: EventBus,
    locks: Arc<GradeLocks>,
    subsections: SubsectionAggregator,
    max_lock_wait_ms: u64,
}

impl CourseAggregator {
    pub fn new(
        db: SqlitePool,
        event_bus: EventBus,
        locks: Arc<GradeLocks>,
        subsections: SubsectionAggregator,
        max_lock_wait_ms: u64,
    ) -> Self {
        Self {
            db,
            event_bus,
            locks,
            subsections,
            max_lock_wait_ms,
        }
    }

    /// Compute and persist the learner's course grade under `snapshot`
    ///
    /// An invalid grading policy emits `PolicyInconsistency` and fails
    /// without touching the stored grade.
    pub async fn compute_course(
        &self,
        learner: &LearnerContext,
        snapshot: &BlockStructure,
        options: CourseComputeOptions,
    ) -> Result<CourseOutcome> {
        let user_id = learner.user_id;
        let course_id = snapshot.course_id().clone();

        let policy = match snapshot.grading_policy().validate() {
            Ok(policy) => policy,
            Err(e) => {
                warn!(
                    course_id = %course_id,
                    course_version = %snapshot.fingerprint(),
                    error = %e,
                    "Grading policy rejected; keeping last course grade"
                );
                self.event_bus.emit_lossy(GradesEvent::PolicyInconsistency {
                    course_id: course_id.clone(),
                    course_version: snapshot.fingerprint().to_string(),
                    message: e.to_string(),
                    timestamp: time::now(),
                });
                return Err(e);
            }
        };

        let _course_guard = self.locks.courses.lock(&(user_id, course_id.clone())).await;

        let stored: HashMap<_, _> = retry_on_lock("load_subsection_grades", self.max_lock_wait_ms, || {
            subsection_grades::load_subsection_grades_for_course(&self.db, user_id, &course_id)
        })
        .await?
        .into_iter()
        .map(|g| (g.subsection_key.clone(), g))
        .collect();

        let scores = self.subsections.scores().fetch_course_scores(user_id, &course_id).await?;

        let visible = snapshot.visible_subsections(learner);
        let mut grades = Vec::with_capacity(visible.len());
        for info in &visible {
            let latest = SubsectionAggregator::latest_contributing_score(snapshot, learner, &info.key, &scores)?;
            let current = match stored.get(&info.key) {
                // A score written after the row was built is missing from it
                Some(g) if latest > g.max_modified_at => None,
                Some(g) if g.course_version == snapshot.fingerprint() => Some(g.clone()),
                Some(g) if !options.recompute_stale_subsections => Some(g.clone()),
                _ => None,
            };
            let grade = match current {
                Some(g) => g,
                None => {
                    self.subsections
                        .compute_subsection(learner, &info.key, snapshot)
                        .await?
                        .grade
                }
            };
            grades.push(grade);
        }

        let entries = visible
            .iter()
            .zip(&grades)
            .filter(|(info, _)| info.graded)
            .filter_map(|(info, grade)| info.format.as_deref().map(|f| (f, grade.graded_ratio())));
        let breakdown = policy.grade(entries);

        let max_modified_at = grades.iter().filter_map(|g| g.max_modified_at).max();
        let now = time::now();
        let candidate = CourseGrade {
            user_id,
            course_id: course_id.clone(),
            percent_grade: breakdown.percent_grade,
            letter_grade: breakdown.letter_grade.clone(),
            passed_at: None,
            course_version: snapshot.fingerprint().to_string(),
            version_published_at: snapshot.version().published_at,
            course_edited_at: snapshot.course_edited_at(),
            grading_policy_hash: snapshot.grading_policy_hash().to_string(),
            max_modified_at,
            modified_at: now,
        };
        let passing = policy.is_passing(breakdown.percent_grade);

        let committed = {
            let _gate = self.locks.course_gates.write(&(user_id, course_id.clone())).await;
            retry_on_lock("save_course_grade", self.max_lock_wait_ms, || {
                commit_grade(&self.db, &candidate, passing, now)
            })
            .await
        };

        let (grade, written) = match committed {
            Ok((grade, previously_passed)) => {
                debug!(
                    user_id = %user_id,
                    course_id = %course_id,
                    percent_grade = grade.percent_grade,
                    letter_grade = %grade.letter_grade,
                    course_version = %grade.course_version,
                    "Course grade written"
                );
                self.event_bus.emit_lossy(GradesEvent::CourseGradeUpdated {
                    user_id,
                    course_id: course_id.clone(),
                    percent_grade: grade.percent_grade,
                    letter_grade: grade.letter_grade.clone(),
                    passed_at: grade.passed_at,
                });
                if let (None, Some(passed_at)) = (previously_passed, grade.passed_at) {
                    info!(user_id = %user_id, course_id = %course_id, "Learner passed");
                    self.event_bus.emit_lossy(GradesEvent::LearnerPassed {
                        user_id,
                        course_id: course_id.clone(),
                        passed_at,
                    });
                }
                (grade, true)
            }
            Err(e) if e.is_benign() => {
                debug!(user_id = %user_id, course_id = %course_id, "Course grade already as fresh");
                let stored = self.load_stored(user_id, &course_id).await?;
                (stored.unwrap_or(candidate), false)
            }
            Err(e) => return Err(e),
        };

        Ok(CourseOutcome {
            grade,
            written,
            breakdown,
            subsections: grades,
        })
    }

    pub async fn load_stored(&self, user_id: UserId, course_id: &CourseId) -> Result<Option<CourseGrade>> {
        retry_on_lock("load_course_grade", self.max_lock_wait_ms, || {
            course_grades::load_course_grade(&self.db, user_id, course_id)
        })
        .await
    }
}

/// Write the course grade, carrying a stored `passed_at` forward
///
/// Returns the written row and the `passed_at` stored before the write.
async fn commit_grade(
    db: &SqlitePool,
    candidate: &CourseGrade,
    passing: bool,
    now: DateTime<Utc>,
) -> Result<(CourseGrade, Option<DateTime<Utc>>)> {
    let mut tx = db.begin().await?;
    let previous = course_grades::load_course_grade_with(&mut *tx, candidate.user_id, &candidate.course_id)
        .await?
        .and_then(|g| g.passed_at);

    let mut grade = candidate.clone();
    grade.passed_at = previous.or(passing.then_some(now));

    course_grades::upsert_course_grade(&mut *tx, &grade).await?;
    tx.commit().await?;
    Ok((grade, previous))
}
