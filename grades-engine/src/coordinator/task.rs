//! Recompute task kinds and states

use crate::error::{GradesError, Result};
use grades_common::{CourseId, UsageKey, UserId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// What a course fan-out enqueues for each learner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FanoutMode {
    /// Course recompute that re-derives subsection grades
    Rederive,
    /// Course recompute over the stored subsection grades
    PolicyOnly,
}

/// Unit of recompute work
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskKind {
    /// Find the subsections containing a changed problem and enqueue them
    ResolveProblem {
        user_id: UserId,
        course_id: CourseId,
        problem_key: UsageKey,
    },
    RecomputeSubsection {
        user_id: UserId,
        course_id: CourseId,
        subsection_key: UsageKey,
    },
    RecomputeCourse {
        user_id: UserId,
        course_id: CourseId,
        rederive: bool,
    },
    /// Enqueue course recomputes for every learner, one batch per run
    CourseFanout {
        course_id: CourseId,
        mode: FanoutMode,
        /// Last learner already enqueued
        cursor: Option<UserId>,
    },
}

impl TaskKind {
    /// Coalescing key: tasks with equal keys are merged
    pub fn key(&self) -> String {
        match self {
            TaskKind::ResolveProblem {
                user_id,
                course_id,
                problem_key,
            } => format!("problem:{}:{:?}:{:?}", user_id, course_id.as_str(), problem_key.as_str()),
            TaskKind::RecomputeSubsection {
                user_id,
                course_id,
                subsection_key,
            } => format!(
                "subsection:{}:{:?}:{:?}",
                user_id,
                course_id.as_str(),
                subsection_key.as_str()
            ),
            TaskKind::RecomputeCourse { user_id, course_id, .. } => {
                format!("course:{}:{:?}", user_id, course_id.as_str())
            }
            TaskKind::CourseFanout { course_id, .. } => format!("fanout:{:?}", course_id.as_str()),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            TaskKind::ResolveProblem { .. } => "resolve_problem",
            TaskKind::RecomputeSubsection { .. } => "recompute_subsection",
            TaskKind::RecomputeCourse { .. } => "recompute_course",
            TaskKind::CourseFanout { .. } => "course_fanout",
        }
    }

    pub fn user_id(&self) -> Option<UserId> {
        match self {
            TaskKind::ResolveProblem { user_id, .. }
            | TaskKind::RecomputeSubsection { user_id, .. }
            | TaskKind::RecomputeCourse { user_id, .. } => Some(*user_id),
            TaskKind::CourseFanout { .. } => None,
        }
    }

    pub fn course_id(&self) -> &CourseId {
        match self {
            TaskKind::ResolveProblem { course_id, .. }
            | TaskKind::RecomputeSubsection { course_id, .. }
            | TaskKind::RecomputeCourse { course_id, .. }
            | TaskKind::CourseFanout { course_id, .. } => course_id,
        }
    }

    /// Merge a newer request for the same key into this one
    ///
    /// A re-deriving request dominates a policy-only one. A fan-out restarts
    /// from the first learner.
    pub fn absorb(&mut self, newer: TaskKind) {
        match (self, newer) {
            (
                TaskKind::RecomputeCourse { rederive, .. },
                TaskKind::RecomputeCourse {
                    rederive: newer_rederive,
                    ..
                },
            ) => *rederive |= newer_rederive,
            (
                TaskKind::CourseFanout { mode, cursor, .. },
                TaskKind::CourseFanout { mode: newer_mode, .. },
            ) => {
                if newer_mode == FanoutMode::Rederive {
                    *mode = FanoutMode::Rederive;
                }
                *cursor = None;
            }
            _ => {}
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.name(), self.key())
    }
}

/// Task lifecycle: queued -> in_flight -> (done | retry_scheduled | failed)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Queued,
    InFlight,
    RetryScheduled,
    Done,
    Failed,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Queued => "queued",
            TaskState::InFlight => "in_flight",
            TaskState::RetryScheduled => "retry_scheduled",
            TaskState::Done => "done",
            TaskState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Done | TaskState::Failed)
    }
}

impl FromStr for TaskState {
    type Err = GradesError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "queued" => Ok(TaskState::Queued),
            "in_flight" => Ok(TaskState::InFlight),
            "retry_scheduled" => Ok(TaskState::RetryScheduled),
            "done" => Ok(TaskState::Done),
            "failed" => Ok(TaskState::Failed),
            other => Err(GradesError::InvalidInput(format!("unknown task state '{}'", other))),
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
