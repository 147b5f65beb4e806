//! Invalidation & Recompute Coordinator
//!
//! Turns trigger events into persisted recompute tasks and runs them on a
//! pool of workers. Triggers arrive through [`RecomputeCoordinator::handle_event`]
//! or straight from the score store; the event bus only carries outcomes.
//!
//! - `ScoreChanged`: resolve the subsections containing the problem, recompute
//!   each, then the course
//! - `ContentPublished`: fan out re-deriving course recomputes (eager policy)
//! - `GradingPolicyChanged`: fan out policy-only course recomputes
//! - `UserRetired`: cancel the learner's tasks and delete every row
//!
//! **Lifecycle:** `new` → `recover` → `start` → … → `shutdown`

pub mod backoff;
pub mod queue;
pub mod task;
pub mod worker;

pub use queue::{Completion, EnqueueOutcome, TaskQueue};
pub use task::{FanoutMode, TaskKind, TaskState};

use crate::blocks::{BlockStructureProvider, LearnerDirectory};
use crate::config::{PublishRecomputePolicy, RuntimeSettings};
use crate::db::retirement::{self, RetirementSummary};
use crate::db::tasks::{self, TaskRow};
use crate::error::Result;
use crate::services::{CourseAggregator, SubsectionAggregator};
use crate::utils::retry_on_lock;
use futures::future::join_all;
use grades_common::events::{EventBus, GradesEvent};
use grades_common::UserId;
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use worker::TaskRunner;

const IDLE_POLL: Duration = Duration::from_millis(5);

struct Inner {
    runner: Arc<TaskRunner>,
    settings: RuntimeSettings,
    cancel: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

/// Queue-backed recompute pipeline
#[derive(Clone)]
pub struct RecomputeCoordinator {
    inner: Arc<Inner>,
}

impl RecomputeCoordinator {
    /// Create the coordinator around a shared task queue
    ///
    /// Tasks queued before `start` run once the workers are up.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: SqlitePool,
        queue: Arc<TaskQueue>,
        event_bus: EventBus,
        provider: Arc<dyn BlockStructureProvider>,
        learners: Arc<dyn LearnerDirectory>,
        subsections: SubsectionAggregator,
        courses: CourseAggregator,
        settings: RuntimeSettings,
    ) -> Self {
        let runner = Arc::new(TaskRunner {
            db,
            event_bus,
            provider,
            learners,
            subsections,
            courses,
            queue,
            settings: settings.clone(),
        });

        Self {
            inner: Arc::new(Inner {
                runner,
                settings,
                cancel: CancellationToken::new(),
                handles: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn queue(&self) -> &Arc<TaskQueue> {
        &self.inner.runner.queue
    }

    /// Requeue tasks left unfinished by a previous run
    pub async fn recover(&self) -> Result<usize> {
        let recovered = self.queue().recover().await?;
        if recovered > 0 {
            info!(recovered, "Recovered unfinished recompute tasks");
        }
        Ok(recovered)
    }

    /// Spawn the worker pool
    pub async fn start(&self) {
        let mut handles = self.inner.handles.lock().await;
        if !handles.is_empty() {
            warn!("Recompute coordinator already started");
            return;
        }

        let worker_count = self.inner.settings.worker_count.max(1);
        for worker_id in 0..worker_count {
            let runner = Arc::clone(&self.inner.runner);
            let cancel = self.inner.cancel.clone();
            handles.push(tokio::spawn(runner.run_worker(worker_id, cancel)));
        }

        info!(
            worker_count,
            publish_policy = %self.inner.settings.publish_recompute_policy,
            "Recompute coordinator started"
        );
    }

    /// Turn one trigger event into queued work
    ///
    /// The task is persisted before this returns. Outcome events are not
    /// triggers and are ignored.
    pub async fn handle_event(&self, event: &GradesEvent) -> Result<()> {
        let queue = self.queue();
        match event {
            GradesEvent::ScoreChanged {
                user_id,
                course_id,
                problem_key,
                modified_at,
            } => {
                let outcome = queue
                    .enqueue(
                        TaskKind::ResolveProblem {
                            user_id: *user_id,
                            course_id: course_id.clone(),
                            problem_key: problem_key.clone(),
                        },
                        Some(*modified_at),
                    )
                    .await?;
                debug!(user_id = %user_id, course_id = %course_id, problem_key = %problem_key, ?outcome, "Score change queued");
            }

            GradesEvent::ContentPublished { course_id, version, .. } => {
                self.publish_fanout(course_id, &version.fingerprint, FanoutMode::Rederive)
                    .await?;
            }

            GradesEvent::GradingPolicyChanged { course_id, version } => {
                self.publish_fanout(course_id, &version.fingerprint, FanoutMode::PolicyOnly)
                    .await?;
            }

            GradesEvent::UserRetired { user_id } => {
                self.retire_user(*user_id).await?;
            }

            other => {
                debug!(event = other.event_type(), "Not a trigger event");
            }
        }
        Ok(())
    }

    async fn publish_fanout(
        &self,
        course_id: &grades_common::CourseId,
        fingerprint: &str,
        mode: FanoutMode,
    ) -> Result<()> {
        match self.inner.settings.publish_recompute_policy {
            PublishRecomputePolicy::Eager => {
                self.queue()
                    .enqueue(
                        TaskKind::CourseFanout {
                            course_id: course_id.clone(),
                            mode,
                            cursor: None,
                        },
                        None,
                    )
                    .await?;
                info!(course_id = %course_id, version = %fingerprint, ?mode, "Course fan-out queued");
            }
            PublishRecomputePolicy::Lazy => {
                info!(
                    course_id = %course_id,
                    version = %fingerprint,
                    ?mode,
                    "Lazy publish policy; grades refresh on read"
                );
            }
        }
        Ok(())
    }

    /// Delete every score and grade row of a learner
    ///
    /// Queued tasks are dropped and new ones ignored until the rows are gone;
    /// deletion waits for the learner's in-flight tasks so none of them can
    /// write after it. Tasks that slip in later find no rows and are skipped
    /// by the workers.
    pub async fn retire_user(&self, user_id: UserId) -> Result<RetirementSummary> {
        let queue = self.queue();
        let cancelled = queue.cancel_user(user_id).await?;
        while queue.user_in_flight(user_id).await {
            tokio::time::sleep(IDLE_POLL).await;
        }

        let db = &self.inner.runner.db;
        let summary = retry_on_lock(
            "delete_user_rows",
            self.inner.settings.database_max_lock_wait_ms,
            || retirement::delete_user_rows(db, user_id),
        )
        .await;
        queue.finish_retirement(user_id).await;
        let summary = summary?;

        info!(
            user_id = %user_id,
            cancelled_tasks = cancelled,
            problem_scores = summary.problem_scores,
            subsection_grades = summary.subsection_grades,
            subsection_grade_overrides = summary.subsection_grade_overrides,
            subsection_grade_override_history = summary.subsection_grade_override_history,
            course_grades = summary.course_grades,
            "Learner retired"
        );
        Ok(summary)
    }

    /// Resolves once the queue is empty
    pub async fn wait_idle(&self) {
        while !self.queue().is_idle().await {
            tokio::time::sleep(IDLE_POLL).await;
        }
    }

    /// Tasks waiting, scheduled or running
    pub async fn depth(&self) -> usize {
        self.queue().depth().await
    }

    /// Most recent permanently failed tasks
    pub async fn failed_tasks(&self, limit: usize) -> Result<Vec<TaskRow>> {
        let db = &self.inner.runner.db;
        retry_on_lock("load_failed_tasks", self.inner.settings.database_max_lock_wait_ms, || {
            tasks::load_failed_tasks(db, limit)
        })
        .await
    }

    /// Stop the workers
    ///
    /// Workers finish their current task first. Unfinished tasks stay in the
    /// database for the next `recover`.
    pub async fn shutdown(&self) {
        info!("Shutting down recompute coordinator");
        self.inner.cancel.cancel();

        let handles: Vec<JoinHandle<()>> = self.inner.handles.lock().await.drain(..).collect();
        for result in join_all(handles).await {
            if let Err(e) = result {
                error!(error = %e, "Coordinator task panicked");
            }
        }
        info!("Recompute coordinator stopped");
    }
}
