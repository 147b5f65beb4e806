//! Problem score records

use crate::error::{GradesError, Result};
use chrono::{DateTime, Utc};
use grades_common::{CourseId, UsageKey, UserId};
use serde::{Deserialize, Serialize};

/// Stored score of one learner on one problem
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProblemScore {
    pub user_id: UserId,
    pub course_id: CourseId,
    pub problem_key: UsageKey,
    pub earned: f64,
    pub possible: f64,
    pub first_attempted_at: Option<DateTime<Utc>>,
    /// Strictly increasing per row
    pub modified_at: DateTime<Utc>,
    /// Set when staff replaced the learner's score
    pub is_override: bool,
}

impl ProblemScore {
    pub fn is_attempted(&self) -> bool {
        self.first_attempted_at.is_some()
    }
}

/// A score write request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreSubmission {
    pub user_id: UserId,
    pub course_id: CourseId,
    pub problem_key: UsageKey,
    pub earned: f64,
    pub possible: f64,
    /// Time of the attempt; defaults to the write time for learner submissions
    #[serde(default)]
    pub attempted_at: Option<DateTime<Utc>>,
    /// Whether the problem is declared graded
    #[serde(default = "default_graded")]
    pub graded: bool,
}

fn default_graded() -> bool {
    true
}

impl ScoreSubmission {
    pub fn new(
        user_id: UserId,
        course_id: CourseId,
        problem_key: UsageKey,
        earned: f64,
        possible: f64,
    ) -> Self {
        Self {
            user_id,
            course_id,
            problem_key,
            earned,
            possible,
            attempted_at: None,
            graded: true,
        }
    }

    pub fn attempted_at(mut self, at: DateTime<Utc>) -> Self {
        self.attempted_at = Some(at);
        self
    }

    pub fn ungraded(mut self) -> Self {
        self.graded = false;
        self
    }

    /// Check `0 <= earned <= possible` and `possible > 0` for graded problems
    pub fn validate(&self) -> Result<()> {
        if !self.earned.is_finite() || !self.possible.is_finite() {
            return Err(GradesError::InvalidScore(format!(
                "{}: earned and possible must be finite",
                self.problem_key
            )));
        }
        if self.earned < 0.0 {
            return Err(GradesError::InvalidScore(format!(
                "{}: earned {} is negative",
                self.problem_key, self.earned
            )));
        }
        if self.possible < 0.0 || (self.graded && self.possible <= 0.0) {
            return Err(GradesError::InvalidScore(format!(
                "{}: possible {} must be positive for a graded problem",
                self.problem_key, self.possible
            )));
        }
        if self.earned > self.possible {
            return Err(GradesError::InvalidScore(format!(
                "{}: earned {} exceeds possible {}",
                self.problem_key, self.earned, self.possible
            )));
        }
        Ok(())
    }
}
