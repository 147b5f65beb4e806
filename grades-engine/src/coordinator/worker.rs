//! Recompute workers
//!
//! Each worker takes one ready task at a time from the [`TaskQueue`], runs it,
//! and reports the outcome back. Errors are classified here: transient ones
//! are retried with jittered backoff until `max_attempts`, everything else
//! fails the task and emits `RecomputeFailed`.

use super::backoff::full_jitter;
use super::queue::{Completion, Dequeued, TaskQueue};
use super::task::{FanoutMode, TaskKind};
use crate::blocks::{BlockStructureProvider, LearnerDirectory};
use crate::config::RuntimeSettings;
use crate::db::{retirement, scores};
use crate::error::{GradesError, Result};
use crate::services::{CourseAggregator, CourseComputeOptions, SubsectionAggregator};
use crate::utils::retry_on_lock;
use grades_common::events::{EventBus, GradesEvent};
use grades_common::time;
use sqlx::SqlitePool;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Everything a worker needs to run tasks
pub struct TaskRunner {
    pub(crate) db: SqlitePool,
    pub(crate) event_bus: EventBus,
    pub(crate) provider: Arc<dyn BlockStructureProvider>,
    pub(crate) learners: Arc<dyn LearnerDirectory>,
    pub(crate) subsections: SubsectionAggregator,
    pub(crate) courses: CourseAggregator,
    pub(crate) queue: Arc<TaskQueue>,
    pub(crate) settings: RuntimeSettings,
}

impl TaskRunner {
    /// Worker loop; returns when `cancel` fires
    pub async fn run_worker(self: Arc<Self>, worker_id: usize, cancel: CancellationToken) {
        info!(worker_id, "Recompute worker started");

        loop {
            if cancel.is_cancelled() {
                break;
            }

            let task = match self.queue.next_ready().await {
                Ok(Some(task)) => task,
                Ok(None) => {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = self.queue.wait_for_work() => continue,
                    }
                }
                Err(e) => {
                    error!(worker_id, error = %e, "Failed to dequeue task");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.settings.retry_base()) => continue,
                    }
                }
            };

            self.process(worker_id, task).await;
        }

        info!(worker_id, "Recompute worker stopped");
    }

    async fn process(&self, worker_id: usize, task: Dequeued) {
        debug!(worker_id, task = %task.kind, attempts = task.attempts, "Running task");

        let (completion, failure) = match self.execute(&task).await {
            Ok(completion) => (completion, None),
            Err(e) => (self.classify(&task, &e), Some(e)),
        };

        let failed = match self.queue.complete(&task.key, completion).await {
            Ok(failed) => failed,
            Err(e) => {
                // The queue put the task back as ready
                error!(worker_id, task = %task.kind, error = %e, "Failed to record task outcome");
                return;
            }
        };

        if let (Some(failed), Some(e)) = (failed, failure) {
            error!(
                task_id = %failed.task_id,
                task = %failed.kind,
                attempts = failed.attempts,
                reason_code = e.reason_code(),
                error = %e,
                "Recompute task failed permanently"
            );
            self.event_bus.emit_lossy(GradesEvent::RecomputeFailed {
                task_id: failed.task_id,
                user_id: failed.kind.user_id(),
                course_id: failed.kind.course_id().clone(),
                task: failed.kind.name().to_string(),
                reason_code: e.reason_code().to_string(),
                message: e.to_string(),
                attempts: failed.attempts,
                timestamp: time::now(),
            });
        }
    }

    fn classify(&self, task: &Dequeued, e: &GradesError) -> Completion {
        let attempt = task.attempts + 1;
        let error = encode_error(e);

        if e.is_transient() && attempt < self.settings.max_attempts {
            let delay = full_jitter(attempt, self.settings.retry_base(), self.settings.retry_max());
            warn!(
                task = %task.kind,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %e,
                "Transient failure; retry scheduled"
            );
            Completion::Retry { delay, error }
        } else {
            Completion::Failed { error }
        }
    }

    async fn execute(&self, task: &Dequeued) -> Result<Completion> {
        if let Some(user_id) = task.kind.user_id() {
            let course_id = task.kind.course_id();
            let has_rows = retry_on_lock("learner_has_rows", self.settings.database_max_lock_wait_ms, || {
                retirement::learner_has_rows(&self.db, user_id, course_id)
            })
            .await?;
            if !has_rows {
                debug!(user_id = %user_id, course_id = %course_id, task = %task.kind, "Learner has no grading rows; task skipped");
                return Ok(Completion::Done);
            }
        }

        match &task.kind {
            TaskKind::ResolveProblem {
                user_id,
                course_id,
                problem_key,
            } => {
                let snapshot = self.provider.get_snapshot(course_id, None).await?;
                let containing = snapshot.subsections_containing(problem_key);
                if containing.is_empty() {
                    debug!(
                        user_id = %user_id,
                        course_id = %course_id,
                        problem_key = %problem_key,
                        "Changed problem is not in the latest content"
                    );
                }
                for subsection_key in containing {
                    self.queue
                        .enqueue(
                            TaskKind::RecomputeSubsection {
                                user_id: *user_id,
                                course_id: course_id.clone(),
                                subsection_key,
                            },
                            task.trigger_modified_at,
                        )
                        .await?;
                }
                Ok(Completion::Done)
            }

            TaskKind::RecomputeSubsection {
                user_id,
                course_id,
                subsection_key,
            } => {
                let snapshot = self.provider.get_snapshot(course_id, None).await?;
                let learner = self.learners.learner_context(*user_id, course_id).await?;

                match self
                    .subsections
                    .compute_subsection(&learner, subsection_key, &snapshot)
                    .await
                {
                    Ok(outcome) => {
                        if let Some(trigger) = task.trigger_modified_at {
                            if outcome.observed_latest.map_or(true, |seen| seen < trigger) {
                                return Err(GradesError::StoreConflict(format!(
                                    "score modified at {} not yet visible",
                                    time::to_db(&trigger)
                                )));
                            }
                        }
                    }
                    Err(GradesError::NotFound(what)) => {
                        debug!(user_id = %user_id, course_id = %course_id, missing = %what, "Subsection gone from latest content");
                    }
                    Err(e) => return Err(e),
                }

                self.queue
                    .enqueue(
                        TaskKind::RecomputeCourse {
                            user_id: *user_id,
                            course_id: course_id.clone(),
                            rederive: true,
                        },
                        None,
                    )
                    .await?;
                Ok(Completion::Done)
            }

            TaskKind::RecomputeCourse {
                user_id,
                course_id,
                rederive,
            } => {
                let snapshot = self.provider.get_snapshot(course_id, None).await?;
                let learner = self.learners.learner_context(*user_id, course_id).await?;
                let options = if *rederive {
                    CourseComputeOptions::default()
                } else {
                    CourseComputeOptions::policy_only()
                };
                self.courses.compute_course(&learner, &snapshot, options).await?;
                Ok(Completion::Done)
            }

            TaskKind::CourseFanout {
                course_id,
                mode,
                cursor,
            } => {
                let depth = self.queue.depth().await;
                if depth > self.settings.queue_depth_threshold {
                    info!(
                        course_id = %course_id,
                        depth,
                        threshold = self.settings.queue_depth_threshold,
                        "Queue deep; fan-out deferred"
                    );
                    return Ok(Completion::Deferred(self.settings.fanout_throttle()));
                }

                let batch_size = self.settings.fanout_batch_size.max(1);
                let users = retry_on_lock("users_for_course", self.settings.database_max_lock_wait_ms, || {
                    scores::users_for_course(&self.db, course_id, *cursor, batch_size)
                })
                .await?;

                for &user_id in &users {
                    self.queue
                        .enqueue(
                            TaskKind::RecomputeCourse {
                                user_id,
                                course_id: course_id.clone(),
                                rederive: *mode == FanoutMode::Rederive,
                            },
                            None,
                        )
                        .await?;
                }
                debug!(course_id = %course_id, batch = users.len(), ?mode, "Fan-out batch enqueued");

                match users.last() {
                    Some(&last) if users.len() == batch_size => Ok(Completion::Continue(TaskKind::CourseFanout {
                        course_id: course_id.clone(),
                        mode: *mode,
                        cursor: Some(last),
                    })),
                    _ => {
                        info!(course_id = %course_id, ?mode, "Fan-out complete");
                        Ok(Completion::Done)
                    }
                }
            }
        }
    }
}

/// `reason_code: message`, stored as the task's last error
fn encode_error(e: &GradesError) -> String {
    format!("{}: {}", e.reason_code(), e)
}
