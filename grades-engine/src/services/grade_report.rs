//! Per-course grade report
//!
//! Walks every learner with scores or a course grade in a course, in chunks
//! of [`REPORT_CHUNK_SIZE`], bringing each course grade up to date with the
//! latest snapshot. Learners whose computation fails are listed separately;
//! one failure never aborts the report.

use crate::blocks::{BlockStructureProvider, LearnerDirectory};
use crate::db::scores;
use crate::error::{GradesError, Result};
use crate::services::course_aggregator::{CourseAggregator, CourseComputeOptions};
use crate::utils::retry_on_lock;
use chrono::{DateTime, Utc};
use grades_common::{time, CourseId, UsageKey, UserId};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::sync::Arc;
use tracing::{info, warn};

pub const REPORT_CHUNK_SIZE: usize = 100;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryAverage {
    pub name: String,
    pub short_label: Option<String>,
    pub score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubsectionPercent {
    pub subsection_key: UsageKey,
    pub display_name: String,
    pub percent: f64,
    pub attempted: bool,
}

/// One learner's line in the report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportRow {
    pub user_id: UserId,
    pub percent_grade: f64,
    pub letter_grade: String,
    pub passed: bool,
    pub passed_at: Option<DateTime<Utc>>,
    pub categories: Vec<CategoryAverage>,
    pub subsections: Vec<SubsectionPercent>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportFailure {
    pub user_id: UserId,
    pub reason_code: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CourseReport {
    pub course_id: CourseId,
    pub course_version: String,
    pub generated_at: DateTime<Utc>,
    pub rows: Vec<ReportRow>,
    pub failures: Vec<ReportFailure>,
}

#[derive(Clone)]
pub struct GradeReportGenerator {
    db: SqlitePool,
    provider: Arc<dyn BlockStructureProvider>,
    learners: Arc<dyn LearnerDirectory>,
    courses: CourseAggregator,
    max_lock_wait_ms: u64,
}

impl GradeReportGenerator {
    pub fn new(
        db: SqlitePool,
        provider: Arc<dyn BlockStructureProvider>,
        learners: Arc<dyn LearnerDirectory>,
        courses: CourseAggregator,
        max_lock_wait_ms: u64,
    ) -> Self {
        Self {
            db,
            provider,
            learners,
            courses,
            max_lock_wait_ms,
        }
    }

    pub async fn generate(&self, course_id: &CourseId) -> Result<CourseReport> {
        let snapshot = self.provider.get_snapshot(course_id, None).await?;
        let mut report = CourseReport {
            course_id: course_id.clone(),
            course_version: snapshot.fingerprint().to_string(),
            generated_at: time::now(),
            rows: Vec::new(),
            failures: Vec::new(),
        };

        let mut after = None;
        loop {
            let users = retry_on_lock("users_for_course", self.max_lock_wait_ms, || {
                scores::users_for_course(&self.db, course_id, after, REPORT_CHUNK_SIZE)
            })
            .await?;
            let Some(&last) = users.last() else {
                break;
            };

            for user_id in users {
                let learner = match self.learners.learner_context(user_id, course_id).await {
                    Ok(learner) => learner,
                    Err(e) => {
                        report.failures.push(failure(user_id, &e));
                        continue;
                    }
                };
                let outcome = match self
                    .courses
                    .compute_course(&learner, &snapshot, CourseComputeOptions::default())
                    .await
                {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        warn!(user_id = %user_id, course_id = %course_id, error = %e, "Report row failed");
                        report.failures.push(failure(user_id, &e));
                        continue;
                    }
                };

                let categories = outcome
                    .breakdown
                    .categories
                    .iter()
                    .map(|c| CategoryAverage {
                        name: c.name.clone(),
                        short_label: c.short_label.clone(),
                        score: c.score,
                    })
                    .collect();
                let subsections = outcome
                    .subsections
                    .iter()
                    .map(|g| SubsectionPercent {
                        display_name: snapshot
                            .subsection(&g.subsection_key)
                            .map(|s| s.display_name)
                            .unwrap_or_default(),
                        subsection_key: g.subsection_key.clone(),
                        percent: g.percent_all(),
                        attempted: g.is_attempted(),
                    })
                    .collect();

                report.rows.push(ReportRow {
                    user_id,
                    percent_grade: outcome.grade.percent_grade,
                    letter_grade: outcome.grade.letter_grade.clone(),
                    passed: outcome.grade.is_passed(),
                    passed_at: outcome.grade.passed_at,
                    categories,
                    subsections,
                });
            }

            after = Some(last);
        }

        info!(
            course_id = %course_id,
            rows = report.rows.len(),
            failures = report.failures.len(),
            "Grade report generated"
        );
        Ok(report)
    }
}

fn failure(user_id: UserId, e: &GradesError) -> ReportFailure {
    ReportFailure {
        user_id,
        reason_code: e.reason_code().to_string(),
        message: e.to_string(),
    }
}
