//! Subsection Aggregator
//!
//! Rolls the scores of the problems a learner can see under one subsection
//! into a persistent [`SubsectionGrade`].
//!
//! **Contribution of one visible problem:**
//! - Score present: its `earned`/`possible`; otherwise `0` of the declared
//!   `raw_possible`
//! - Weighted: `earned / possible * weight` of `weight`
//! - Unweighted: raw `earned` of raw `possible`
//! - `possible <= 0`: nothing, whatever the weight
//!
//! Graded sums only count graded problems inside a graded subsection.
//!
//! Runs for one (user, course, subsection) are serialized and hold the shared
//! side of the course gate, so a course commit never interleaves with them.

use crate::blocks::{BlockKind, BlockStructure};
use crate::db::{overrides, subsection_grades, visible_blocks};
use crate::error::{GradesError, Result};
use crate::models::{BlockRecord, BlockRecordList, LearnerContext, ProblemScore, SubsectionGrade};
use crate::services::locks::GradeLocks;
use crate::services::score_store::ProblemScoreStore;
use crate::utils::retry_on_lock;
use chrono::{DateTime, Utc};
use grades_common::events::{EventBus, GradesEvent};
use grades_common::{time, CourseId, UsageKey, UserId};
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Result of one aggregation run
#[derive(Debug, Clone, PartialEq)]
pub struct SubsectionOutcome {
    /// The persisted row (the stored one when the write lost)
    pub grade: SubsectionGrade,
    /// False when the stored row was already as fresh
    pub written: bool,
    /// Newest score modification of the learner in the course, as read
    pub observed_latest: Option<DateTime<Utc>>,
}

#[derive(Clone)]
pub struct SubsectionAggregator {
    db: SqlitePool,
    event_bus: EventBus,
    locks: Arc<GradeLocks>,
    scores: ProblemScoreStore,
    max_lock_wait_ms: u64,
}

#[derive(Debug, Default)]
struct Totals {
    earned_all: f64,
    possible_all: f64,
    earned_graded: f64,
    possible_graded: f64,
    first_attempted_at: Option<DateTime<Utc>>,
    max_modified_at: Option<DateTime<Utc>>,
}

impl SubsectionAggregator {
    pub fn new(
        db: SqlitePool,
        event_bus: EventBus,
        locks: Arc<GradeLocks>,
        scores: ProblemScoreStore,
        max_lock_wait_ms: u64,
    ) -> Self {
        Self {
            db,
            event_bus,
            locks,
            scores,
            max_lock_wait_ms,
        }
    }

    /// Compute and persist the learner's grade for `subsection_key`
    ///
    /// A subsection without visible problems still gets a zero row. Losing
    /// the freshness race is not an error: the stored row is returned with
    /// `written == false`.
    pub async fn compute_subsection(
        &self,
        learner: &LearnerContext,
        subsection_key: &UsageKey,
        snapshot: &BlockStructure,
    ) -> Result<SubsectionOutcome> {
        let user_id = learner.user_id;
        let course_id = snapshot.course_id().clone();

        let _subsection_guard = self
            .locks
            .subsections
            .lock(&(user_id, course_id.clone(), subsection_key.clone()))
            .await;
        let _gate = self.locks.course_gates.read(&(user_id, course_id.clone())).await;

        let info = snapshot.subsection(subsection_key).ok_or_else(|| {
            GradesError::NotFound(format!(
                "subsection {} in {}@{}",
                subsection_key,
                course_id,
                snapshot.fingerprint()
            ))
        })?;
        let problems = snapshot.visible_problems(subsection_key, learner)?;
        let scores = self.scores.fetch_course_scores(user_id, &course_id).await?;
        let observed_latest = scores.values().map(|s| s.modified_at).max();

        let mut totals = Totals::default();
        let mut records = Vec::with_capacity(problems.len());
        for node in problems {
            let BlockKind::Problem {
                weight,
                raw_possible,
                graded,
            } = &node.kind
            else {
                continue;
            };
            records.push(BlockRecord {
                locator: node.key.clone(),
                weight: *weight,
                raw_possible: *raw_possible,
                graded: *graded,
            });

            let score = scores.get(&node.key);
            if let Some(s) = score {
                totals.first_attempted_at = min_opt(totals.first_attempted_at, s.first_attempted_at);
                totals.max_modified_at = max_opt(totals.max_modified_at, Some(s.modified_at));
            }
            let (raw_earned, raw_possible) = match score {
                Some(s) => (s.earned, s.possible),
                None => (0.0, *raw_possible),
            };
            if raw_possible <= 0.0 {
                continue;
            }
            let (earned, possible) = match weight {
                Some(w) => {
                    let w = w.max(0.0);
                    (raw_earned / raw_possible * w, w)
                }
                None => (raw_earned, raw_possible),
            };

            totals.possible_all += possible;
            if *graded && info.graded {
                totals.possible_graded += possible;
            }
            if score.is_some() {
                totals.earned_all += earned;
                if *graded && info.graded {
                    totals.earned_graded += earned;
                }
            }
        }

        let block_list = BlockRecordList::new(course_id.clone(), records);
        let mut grade = SubsectionGrade {
            user_id,
            course_id: course_id.clone(),
            subsection_key: subsection_key.clone(),
            earned_all: totals.earned_all,
            possible_all: totals.possible_all,
            earned_graded: totals.earned_graded,
            possible_graded: totals.possible_graded,
            first_attempted_at: totals.first_attempted_at,
            course_version: snapshot.fingerprint().to_string(),
            version_published_at: snapshot.version().published_at,
            subtree_edited_at: info.subtree_edited_at,
            visible_blocks_hash: block_list.hash_value()?,
            max_modified_at: totals.max_modified_at,
            modified_at: time::now(),
        };

        let stored_override = retry_on_lock("load_override", self.max_lock_wait_ms, || {
            overrides::load_override(&self.db, user_id, &course_id, subsection_key)
        })
        .await?;
        if let Some(o) = &stored_override {
            o.apply(&mut grade);
        }
        grade.check_invariants()?;

        let committed = retry_on_lock("save_subsection_grade", self.max_lock_wait_ms, || {
            commit_grade(&self.db, &block_list, &grade)
        })
        .await;

        match committed {
            Ok(()) => {
                debug!(
                    user_id = %user_id,
                    course_id = %course_id,
                    subsection_key = %subsection_key,
                    earned_graded = grade.earned_graded,
                    possible_graded = grade.possible_graded,
                    course_version = %grade.course_version,
                    "Subsection grade written"
                );
                self.event_bus.emit_lossy(GradesEvent::SubsectionGradeCalculated {
                    user_id,
                    course_id: course_id.clone(),
                    subsection_key: subsection_key.clone(),
                    earned_graded: grade.earned_graded,
                    possible_graded: grade.possible_graded,
                    course_version: grade.course_version.clone(),
                    timestamp: grade.modified_at,
                });
                Ok(SubsectionOutcome {
                    grade,
                    written: true,
                    observed_latest,
                })
            }
            Err(e) if e.is_benign() => {
                debug!(
                    user_id = %user_id,
                    course_id = %course_id,
                    subsection_key = %subsection_key,
                    "Subsection grade already as fresh"
                );
                let stored = self.load_stored(user_id, &course_id, subsection_key).await?;
                Ok(SubsectionOutcome {
                    grade: stored.unwrap_or(grade),
                    written: false,
                    observed_latest,
                })
            }
            Err(e) => Err(e),
        }
    }

    pub fn scores(&self) -> &ProblemScoreStore {
        &self.scores
    }

    /// Newest `modified_at` among the scores a subsection grade is built from
    ///
    /// Matches the `max_modified_at` a fresh run would store, so a stored row
    /// older than this misses a score.
    pub fn latest_contributing_score(
        snapshot: &BlockStructure,
        learner: &LearnerContext,
        subsection_key: &UsageKey,
        scores: &HashMap<UsageKey, ProblemScore>,
    ) -> Result<Option<DateTime<Utc>>> {
        Ok(snapshot
            .visible_problems(subsection_key, learner)?
            .into_iter()
            .filter_map(|node| scores.get(&node.key))
            .map(|s| s.modified_at)
            .max())
    }

    /// Stored grade row, if any
    pub async fn load_stored(
        &self,
        user_id: UserId,
        course_id: &CourseId,
        subsection_key: &UsageKey,
    ) -> Result<Option<SubsectionGrade>> {
        retry_on_lock("load_subsection_grade", self.max_lock_wait_ms, || {
            subsection_grades::load_subsection_grade(&self.db, user_id, course_id, subsection_key)
        })
        .await
    }
}

/// Visible blocks and the grade row commit together
async fn commit_grade(db: &SqlitePool, blocks: &BlockRecordList, grade: &SubsectionGrade) -> Result<()> {
    let mut tx = db.begin().await?;
    visible_blocks::insert_visible_blocks(&mut *tx, blocks, &grade.course_version).await?;
    subsection_grades::upsert_subsection_grade(&mut *tx, grade).await?;
    tx.commit().await?;
    Ok(())
}

fn min_opt(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

fn max_opt(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, b) => a.or(b),
    }
}
