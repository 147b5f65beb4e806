//! grades-engine library interface
//!
//! Persistent grades engine: problem scores roll up into subsection grades,
//! subsection grades into course grades, and a task-queue-driven coordinator
//! keeps both fresh as scores, content and grading policies change.
//!
//! [`GradesEngine`] wires the services together; integration tests and the
//! binary drive everything through it.

pub mod blocks;
pub mod config;
pub mod coordinator;
pub mod db;
pub mod error;
pub mod models;
pub mod services;
pub mod utils;

pub use crate::error::{GradesError, Result};

use crate::blocks::{BlockStructureProvider, LearnerDirectory};
use crate::config::RuntimeSettings;
use crate::coordinator::{RecomputeCoordinator, TaskKind, TaskQueue};
use crate::db::retirement::RetirementSummary;
use crate::db::tasks::TaskRow;
use crate::models::{OverrideHistoryEntry, ProblemScore, ScoreSubmission, SubsectionGrade, SubsectionGradeOverride};
use crate::services::{
    CourseAggregator, CourseGradeLookup, CourseReport, GradeLocks, GradeReader, GradeReportGenerator,
    OverrideRequest, OverrideService, ProblemScoreStore, ReadPolicy, SubsectionAggregator,
};
use grades_common::events::{EventBus, GradesEvent};
use grades_common::{CourseId, UsageKey, UserId};
use sqlx::SqlitePool;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::info;

/// The assembled engine
#[derive(Clone)]
pub struct GradesEngine {
    db: SqlitePool,
    event_bus: EventBus,
    settings: RuntimeSettings,
    scores: ProblemScoreStore,
    overrides: OverrideService,
    reader: GradeReader,
    reports: GradeReportGenerator,
    coordinator: RecomputeCoordinator,
}

impl GradesEngine {
    /// Build the engine with runtime settings read from the database
    pub async fn new(
        db: SqlitePool,
        provider: Arc<dyn BlockStructureProvider>,
        learners: Arc<dyn LearnerDirectory>,
    ) -> Result<Self> {
        let settings = RuntimeSettings::load(&db).await?;
        Ok(Self::with_settings(db, provider, learners, settings))
    }

    pub fn with_settings(
        db: SqlitePool,
        provider: Arc<dyn BlockStructureProvider>,
        learners: Arc<dyn LearnerDirectory>,
        settings: RuntimeSettings,
    ) -> Self {
        let event_bus = EventBus::new(settings.event_bus_capacity);
        let locks = GradeLocks::new();
        let lock_wait = settings.database_max_lock_wait_ms;
        let queue = Arc::new(TaskQueue::new(db.clone(), lock_wait));

        let scores = ProblemScoreStore::new(db.clone(), event_bus.clone(), Arc::clone(&locks), lock_wait)
            .with_task_queue(Arc::clone(&queue));
        let subsections = SubsectionAggregator::new(
            db.clone(),
            event_bus.clone(),
            Arc::clone(&locks),
            scores.clone(),
            lock_wait,
        );
        let courses = CourseAggregator::new(
            db.clone(),
            event_bus.clone(),
            Arc::clone(&locks),
            subsections.clone(),
            lock_wait,
        );
        let overrides = OverrideService::new(db.clone(), Arc::clone(&locks), lock_wait);
        let reader = GradeReader::new(
            Arc::clone(&provider),
            Arc::clone(&learners),
            scores.clone(),
            subsections.clone(),
            courses.clone(),
        );
        let reports = GradeReportGenerator::new(
            db.clone(),
            Arc::clone(&provider),
            Arc::clone(&learners),
            courses.clone(),
            lock_wait,
        );
        let coordinator = RecomputeCoordinator::new(
            db.clone(),
            queue,
            event_bus.clone(),
            provider,
            learners,
            subsections,
            courses,
            settings.clone(),
        );

        Self {
            db,
            event_bus,
            settings,
            scores,
            overrides,
            reader,
            reports,
            coordinator,
        }
    }

    /// Recover unfinished tasks and start the recompute workers
    pub async fn start(&self) -> Result<()> {
        self.coordinator.recover().await?;
        self.coordinator.start().await;
        info!("Grades engine started");
        Ok(())
    }

    pub fn db(&self) -> &SqlitePool {
        &self.db
    }

    pub fn settings(&self) -> &RuntimeSettings {
        &self.settings
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    pub fn coordinator(&self) -> &RecomputeCoordinator {
        &self.coordinator
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GradesEvent> {
        self.event_bus.subscribe()
    }

    // ========================================
    // Scores
    // ========================================

    pub async fn record_score(&self, submission: ScoreSubmission) -> Result<ProblemScore> {
        self.scores.record_score(submission).await
    }

    /// Staff correction; keeps the stored `attempted_at` unless one is given
    pub async fn replace_score(&self, submission: ScoreSubmission) -> Result<ProblemScore> {
        self.scores.replace_score(submission).await
    }

    /// Hand an external trigger event to the coordinator
    ///
    /// Returns once the resulting tasks are queued and persisted; the bus
    /// only carries outcomes.
    pub async fn handle_event(&self, event: GradesEvent) -> Result<()> {
        if !event.is_trigger() {
            return Err(GradesError::InvalidInput(format!(
                "{} is not an input event",
                event.event_type()
            )));
        }
        self.coordinator.handle_event(&event).await
    }

    // ========================================
    // Reads
    // ========================================

    pub async fn read_subsection_grade(
        &self,
        user_id: UserId,
        course_id: &CourseId,
        subsection_key: &UsageKey,
    ) -> Result<Option<SubsectionGrade>> {
        self.reader.read_subsection_grade(user_id, course_id, subsection_key).await
    }

    pub async fn read_course_grade(
        &self,
        user_id: UserId,
        course_id: &CourseId,
        policy: ReadPolicy,
    ) -> Result<CourseGradeLookup> {
        self.reader.read_course_grade(user_id, course_id, policy).await
    }

    pub async fn generate_report(&self, course_id: &CourseId) -> Result<CourseReport> {
        self.reports.generate(course_id).await
    }

    // ========================================
    // Overrides and retirement
    // ========================================

    /// Store an override and queue the subsection for recompute
    pub async fn set_override(&self, request: OverrideRequest) -> Result<SubsectionGradeOverride> {
        let o = self.overrides.set_override(request).await?;
        self.queue_subsection(&o).await?;
        Ok(o)
    }

    pub async fn clear_override(
        &self,
        user_id: UserId,
        course_id: CourseId,
        subsection_key: UsageKey,
        requested_by: Option<UserId>,
    ) -> Result<SubsectionGradeOverride> {
        let o = self
            .overrides
            .clear_override(user_id, course_id, subsection_key, requested_by)
            .await?;
        self.queue_subsection(&o).await?;
        Ok(o)
    }

    /// Every set and clear of one override, oldest first
    pub async fn override_history(
        &self,
        user_id: UserId,
        course_id: &CourseId,
        subsection_key: &UsageKey,
    ) -> Result<Vec<OverrideHistoryEntry>> {
        self.overrides.override_history(user_id, course_id, subsection_key).await
    }

    async fn queue_subsection(&self, o: &SubsectionGradeOverride) -> Result<()> {
        self.coordinator
            .queue()
            .enqueue(
                TaskKind::RecomputeSubsection {
                    user_id: o.user_id,
                    course_id: o.course_id.clone(),
                    subsection_key: o.subsection_key.clone(),
                },
                None,
            )
            .await?;
        Ok(())
    }

    /// Delete every row of a learner right away
    pub async fn retire_user(&self, user_id: UserId) -> Result<RetirementSummary> {
        self.coordinator.retire_user(user_id).await
    }

    // ========================================
    // Coordinator
    // ========================================

    /// Resolves once all triggers so far are fully processed
    pub async fn wait_idle(&self) {
        self.coordinator.wait_idle().await
    }

    pub async fn failed_tasks(&self, limit: usize) -> Result<Vec<TaskRow>> {
        self.coordinator.failed_tasks(limit).await
    }

    pub async fn shutdown(&self) {
        self.coordinator.shutdown().await;
        info!("Grades engine stopped");
    }
}
