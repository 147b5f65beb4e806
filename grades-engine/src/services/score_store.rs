//! Problem Score Store
//!
//! Durable record of learner scores per problem. Writes for one
//! (user, course, problem) are serialized, so `modified_at` is strictly
//! increasing per row and `ScoreChanged` events leave in that order.
//!
//! With a task queue attached, every write also queues the problem for
//! resolution before it returns, so a recompute never depends on someone
//! reading the event.

use crate::coordinator::{TaskKind, TaskQueue};
use crate::db::scores;
use crate::error::Result;
use crate::models::{ProblemScore, ScoreSubmission};
use crate::services::locks::GradeLocks;
use crate::utils::retry_on_lock;
use chrono::Duration;
use grades_common::events::{EventBus, GradesEvent};
use grades_common::{time, CourseId, UsageKey, UserId};
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

#[derive(Clone)]
pub struct ProblemScoreStore {
    db: SqlitePool,
    event_bus: EventBus,
    locks: Arc<GradeLocks>,
    tasks: Option<Arc<TaskQueue>>,
    max_lock_wait_ms: u64,
}

impl ProblemScoreStore {
    pub fn new(db: SqlitePool, event_bus: EventBus, locks: Arc<GradeLocks>, max_lock_wait_ms: u64) -> Self {
        Self {
            db,
            event_bus,
            locks,
            tasks: None,
            max_lock_wait_ms,
        }
    }

    /// Queue a `ResolveProblem` task on every write
    pub fn with_task_queue(mut self, tasks: Arc<TaskQueue>) -> Self {
        self.tasks = Some(tasks);
        self
    }

    /// Record a learner submission (upsert)
    ///
    /// `first_attempted_at` keeps the earliest attempt seen for the problem.
    pub async fn record_score(&self, submission: ScoreSubmission) -> Result<ProblemScore> {
        self.write(submission, false).await
    }

    /// Staff replacement of a learner's score; flagged as an override
    pub async fn replace_score(&self, submission: ScoreSubmission) -> Result<ProblemScore> {
        self.write(submission, true).await
    }

    /// Scores for `problem_keys`; problems without an attempt are absent
    pub async fn fetch_scores(
        &self,
        user_id: UserId,
        course_id: &CourseId,
        problem_keys: &[UsageKey],
    ) -> Result<HashMap<UsageKey, ProblemScore>> {
        let mut all = self.fetch_course_scores(user_id, course_id).await?;
        Ok(problem_keys
            .iter()
            .filter_map(|key| all.remove_entry(key))
            .collect())
    }

    /// Every score of the learner in the course
    pub async fn fetch_course_scores(
        &self,
        user_id: UserId,
        course_id: &CourseId,
    ) -> Result<HashMap<UsageKey, ProblemScore>> {
        retry_on_lock("fetch_scores", self.max_lock_wait_ms, || {
            scores::load_scores_for_course(&self.db, user_id, course_id)
        })
        .await
    }

    /// Drop every score of a retired learner
    pub async fn delete_scores_for_user(&self, user_id: UserId) -> Result<u64> {
        let deleted = retry_on_lock("delete_scores_for_user", self.max_lock_wait_ms, || {
            scores::delete_scores_for_user(&self.db, user_id)
        })
        .await?;
        debug!(user_id = %user_id, deleted, "Scores deleted");
        Ok(deleted)
    }

    async fn write(&self, submission: ScoreSubmission, is_override: bool) -> Result<ProblemScore> {
        submission.validate()?;

        let key = (
            submission.user_id,
            submission.course_id.clone(),
            submission.problem_key.clone(),
        );
        let _guard = self.locks.scores.lock(&key).await;

        let existing = retry_on_lock("load_score", self.max_lock_wait_ms, || {
            scores::load_score(
                &self.db,
                submission.user_id,
                &submission.course_id,
                &submission.problem_key,
            )
        })
        .await?;

        let now = time::now();
        let modified_at = match &existing {
            Some(prev) if prev.modified_at >= now => prev.modified_at + Duration::microseconds(1),
            _ => now,
        };

        let attempted_at = submission
            .attempted_at
            .map(time::truncate_micros)
            .or((!is_override).then_some(now));
        let first_attempted_at = match (existing.as_ref().and_then(|p| p.first_attempted_at), attempted_at) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };

        let score = ProblemScore {
            user_id: submission.user_id,
            course_id: submission.course_id,
            problem_key: submission.problem_key,
            earned: submission.earned,
            possible: submission.possible,
            first_attempted_at,
            modified_at,
            is_override,
        };

        retry_on_lock("save_score", self.max_lock_wait_ms, || {
            scores::save_score(&self.db, &score)
        })
        .await?;

        debug!(
            user_id = %score.user_id,
            course_id = %score.course_id,
            problem_key = %score.problem_key,
            earned = score.earned,
            possible = score.possible,
            is_override,
            "Score recorded"
        );

        if let Some(tasks) = &self.tasks {
            tasks
                .enqueue(
                    TaskKind::ResolveProblem {
                        user_id: score.user_id,
                        course_id: score.course_id.clone(),
                        problem_key: score.problem_key.clone(),
                    },
                    Some(score.modified_at),
                )
                .await?;
        }

        self.event_bus.emit_lossy(GradesEvent::ScoreChanged {
            user_id: score.user_id,
            course_id: score.course_id.clone(),
            problem_key: score.problem_key.clone(),
            modified_at: score.modified_at,
        });

        Ok(score)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GradesError;
    use chrono::{TimeZone, Utc};
    use grades_common::db::init_memory_database;

    async fn store() -> (ProblemScoreStore, EventBus) {
        let pool = init_memory_database().await.unwrap();
        let bus = EventBus::new(100);
        (ProblemScoreStore::new(pool, bus.clone(), GradeLocks::new(), 1000), bus)
    }

    fn submission(earned: f64) -> ScoreSubmission {
        ScoreSubmission::new(UserId(1), CourseId::new("course"), UsageKey::new("p1"), earned, 2.0)
    }

    #[tokio::test]
    async fn test_record_emits_score_changed() {
        let (store, bus) = store().await;
        let mut rx = bus.subscribe();

        let score = store.record_score(submission(1.0)).await.unwrap();
        assert!(score.first_attempted_at.is_some());
        assert!(!score.is_override);

        match rx.recv().await.unwrap() {
            GradesEvent::ScoreChanged { problem_key, modified_at, .. } => {
                assert_eq!(problem_key, UsageKey::new("p1"));
                assert_eq!(modified_at, score.modified_at);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_invalid_score_is_not_stored() {
        let (store, _bus) = store().await;
        let result = store.record_score(submission(3.0)).await;
        assert!(matches!(result, Err(GradesError::InvalidScore(_))));

        let fetched = store
            .fetch_scores(UserId(1), &CourseId::new("course"), &[UsageKey::new("p1")])
            .await
            .unwrap();
        assert!(fetched.is_empty());
    }

    #[tokio::test]
    async fn test_modified_at_strictly_increases_and_first_attempt_kept() {
        let (store, _bus) = store().await;
        let early = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();

        let first = store.record_score(submission(1.0).attempted_at(early)).await.unwrap();
        let second = store.record_score(submission(2.0)).await.unwrap();

        assert!(second.modified_at > first.modified_at);
        assert_eq!(second.first_attempted_at, Some(early));
        assert_eq!(second.earned, 2.0);
    }

    #[tokio::test]
    async fn test_replace_score_sets_override_flag() {
        let (store, _bus) = store().await;
        store.record_score(submission(0.0)).await.unwrap();
        let replaced = store.replace_score(submission(2.0)).await.unwrap();
        assert!(replaced.is_override);

        let fetched = store
            .fetch_scores(UserId(1), &CourseId::new("course"), &[UsageKey::new("p1"), UsageKey::new("p9")])
            .await
            .unwrap();
        assert_eq!(fetched.len(), 1);
        assert!(fetched[&UsageKey::new("p1")].is_override);
    }

    #[tokio::test]
    async fn test_delete_scores_for_user() {
        let (store, _bus) = store().await;
        store.record_score(submission(1.0)).await.unwrap();
        assert_eq!(store.delete_scores_for_user(UserId(1)).await.unwrap(), 1);
        assert!(store
            .fetch_course_scores(UserId(1), &CourseId::new("course"))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_write_queues_problem_without_listener() {
        let pool = init_memory_database().await.unwrap();
        let queue = Arc::new(TaskQueue::new(pool.clone(), 1000));
        // Capacity 1 and no subscriber: every event is dropped
        let store = ProblemScoreStore::new(pool.clone(), EventBus::new(1), GradeLocks::new(), 1000)
            .with_task_queue(Arc::clone(&queue));

        store.record_score(submission(1.0)).await.unwrap();
        let latest = store.record_score(submission(2.0)).await.unwrap();

        assert_eq!(queue.depth().await, 1);
        let task = queue.next_ready().await.unwrap().unwrap();
        assert_eq!(
            task.kind,
            TaskKind::ResolveProblem {
                user_id: UserId(1),
                course_id: CourseId::new("course"),
                problem_key: UsageKey::new("p1"),
            }
        );
        assert_eq!(task.trigger_modified_at, Some(latest.modified_at));

        let rows = crate::db::tasks::load_unfinished_tasks(&pool).await.unwrap();
        assert_eq!(rows.len(), 1);
    }
}
