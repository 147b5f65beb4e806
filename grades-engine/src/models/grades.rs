//! Persistent subsection and course grades

use crate::error::{GradesError, Result};
use chrono::{DateTime, Utc};
use grades_common::{CourseId, UsageKey, UserId};
use serde::{Deserialize, Serialize};

/// Aggregated grade of one learner on one subsection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubsectionGrade {
    pub user_id: UserId,
    pub course_id: CourseId,
    pub subsection_key: UsageKey,
    pub earned_all: f64,
    pub possible_all: f64,
    pub earned_graded: f64,
    pub possible_graded: f64,
    pub first_attempted_at: Option<DateTime<Utc>>,
    /// Fingerprint of the content version the grade was computed under
    pub course_version: String,
    pub version_published_at: DateTime<Utc>,
    pub subtree_edited_at: Option<DateTime<Utc>>,
    pub visible_blocks_hash: String,
    /// Newest contributing score or override modification
    pub max_modified_at: Option<DateTime<Utc>>,
    pub modified_at: DateTime<Utc>,
}

impl SubsectionGrade {
    pub fn is_attempted(&self) -> bool {
        self.first_attempted_at.is_some()
    }

    /// Graded ratio used by course aggregation
    ///
    /// Unattempted subsections and subsections with nothing graded count as 0.
    pub fn graded_ratio(&self) -> f64 {
        if !self.is_attempted() || self.possible_graded <= 0.0 {
            0.0
        } else {
            self.earned_graded / self.possible_graded
        }
    }

    /// Percent of all points, for reports
    pub fn percent_all(&self) -> f64 {
        if self.possible_all <= 0.0 {
            0.0
        } else {
            self.earned_all / self.possible_all
        }
    }

    /// `0 <= earned_graded <= possible_graded <= possible_all`, `earned_all <= possible_all`
    pub fn check_invariants(&self) -> Result<()> {
        const EPS: f64 = 1e-9;
        let ok = self.earned_graded >= 0.0
            && self.earned_all >= 0.0
            && self.earned_graded <= self.possible_graded + EPS
            && self.possible_graded <= self.possible_all + EPS
            && self.earned_all <= self.possible_all + EPS;
        if ok {
            Ok(())
        } else {
            Err(GradesError::InvalidInput(format!(
                "subsection grade {} violates bounds: graded {}/{}, all {}/{}",
                self.subsection_key,
                self.earned_graded,
                self.possible_graded,
                self.earned_all,
                self.possible_all
            )))
        }
    }
}

/// Staff replacement values for a subsection grade
///
/// `None` fields keep the computed value. A row with every field `None` is a
/// cleared override; it stays so its `modified_at` keeps freshness moving.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubsectionGradeOverride {
    pub user_id: UserId,
    pub course_id: CourseId,
    pub subsection_key: UsageKey,
    pub earned_all: Option<f64>,
    pub possible_all: Option<f64>,
    pub earned_graded: Option<f64>,
    pub possible_graded: Option<f64>,
    pub reason: Option<String>,
    pub system: Option<String>,
    pub modified_at: DateTime<Utc>,
}

impl SubsectionGradeOverride {
    pub fn is_cleared(&self) -> bool {
        self.earned_all.is_none()
            && self.possible_all.is_none()
            && self.earned_graded.is_none()
            && self.possible_graded.is_none()
    }

    /// Reject negative, non-finite and self-contradicting values
    pub fn validate(&self) -> Result<()> {
        for value in [
            self.earned_all,
            self.possible_all,
            self.earned_graded,
            self.possible_graded,
        ]
        .into_iter()
        .flatten()
        {
            if !value.is_finite() || value < 0.0 {
                return Err(GradesError::InvalidInput(format!(
                    "override value {} must be finite and non-negative",
                    value
                )));
            }
        }

        let pairs = [
            (self.earned_all, self.possible_all, "all"),
            (self.earned_graded, self.possible_graded, "graded"),
        ];
        for (earned, possible, label) in pairs {
            if let (Some(earned), Some(possible)) = (earned, possible) {
                if earned > possible {
                    return Err(GradesError::InvalidInput(format!(
                        "override earned_{} {} exceeds possible_{} {}",
                        label, earned, label, possible
                    )));
                }
            }
        }

        if let (Some(graded), Some(all)) = (self.possible_graded, self.possible_all) {
            if graded > all {
                return Err(GradesError::InvalidInput(format!(
                    "override possible_graded {} exceeds possible_all {}",
                    graded, all
                )));
            }
        }

        Ok(())
    }

    /// Replace computed values, then restore the grade bounds
    ///
    /// A lone override value may conflict with a computed one (e.g. an
    /// overridden `possible_graded` above the computed `possible_all`); the
    /// overridden value is kept and the computed side is adjusted.
    pub fn apply(&self, grade: &mut SubsectionGrade) {
        if let Some(v) = self.earned_all {
            grade.earned_all = v;
        }
        if let Some(v) = self.possible_all {
            grade.possible_all = v;
        }
        if let Some(v) = self.earned_graded {
            grade.earned_graded = v;
        }
        if let Some(v) = self.possible_graded {
            grade.possible_graded = v;
        }

        if self.possible_graded.is_some() {
            grade.possible_all = grade.possible_all.max(grade.possible_graded);
        } else {
            grade.possible_graded = grade.possible_graded.min(grade.possible_all);
        }
        if self.earned_graded.is_some() {
            grade.possible_graded = grade.possible_graded.max(grade.earned_graded);
            grade.possible_all = grade.possible_all.max(grade.possible_graded);
        } else {
            grade.earned_graded = grade.earned_graded.min(grade.possible_graded);
        }
        if self.earned_all.is_some() {
            grade.possible_all = grade.possible_all.max(grade.earned_all);
        } else {
            grade.earned_all = grade.earned_all.min(grade.possible_all);
        }

        grade.max_modified_at = match grade.max_modified_at {
            Some(current) if current >= self.modified_at => Some(current),
            _ => Some(self.modified_at),
        };
    }
}

/// One change to a subsection override, as kept in the history log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverrideHistoryEntry {
    pub history_id: i64,
    pub action: OverrideAction,
    /// Override values after the change
    pub values: SubsectionGradeOverride,
    /// Staff member who asked for the change
    pub requested_by: Option<UserId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverrideAction {
    Set,
    Cleared,
}

impl OverrideAction {
    pub fn for_override(o: &SubsectionGradeOverride) -> Self {
        if o.is_cleared() {
            OverrideAction::Cleared
        } else {
            OverrideAction::Set
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OverrideAction::Set => "set",
            OverrideAction::Cleared => "cleared",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "set" => Ok(OverrideAction::Set),
            "cleared" => Ok(OverrideAction::Cleared),
            other => Err(GradesError::InvalidInput(format!("unknown override action '{}'", other))),
        }
    }
}

/// Aggregated course grade of one learner
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CourseGrade {
    pub user_id: UserId,
    pub course_id: CourseId,
    pub percent_grade: f64,
    pub letter_grade: String,
    /// Sticky: never cleared once set
    pub passed_at: Option<DateTime<Utc>>,
    pub course_version: String,
    pub version_published_at: DateTime<Utc>,
    pub course_edited_at: Option<DateTime<Utc>>,
    pub grading_policy_hash: String,
    /// Newest `max_modified_at` of the subsection grades it was built from
    pub max_modified_at: Option<DateTime<Utc>>,
    pub modified_at: DateTime<Utc>,
}

impl CourseGrade {
    pub fn is_passed(&self) -> bool {
        self.passed_at.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn grade(earned_graded: f64, possible_graded: f64, attempted: bool) -> SubsectionGrade {
        let t = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        SubsectionGrade {
            user_id: UserId(1),
            course_id: CourseId::new("course"),
            subsection_key: UsageKey::new("seq1"),
            earned_all: earned_graded,
            possible_all: possible_graded,
            earned_graded,
            possible_graded,
            first_attempted_at: attempted.then_some(t),
            course_version: "v1".to_string(),
            version_published_at: t,
            subtree_edited_at: None,
            visible_blocks_hash: "hash".to_string(),
            max_modified_at: Some(t),
            modified_at: t,
        }
    }

    fn override_with(earned_graded: Option<f64>, possible_graded: Option<f64>) -> SubsectionGradeOverride {
        SubsectionGradeOverride {
            user_id: UserId(1),
            course_id: CourseId::new("course"),
            subsection_key: UsageKey::new("seq1"),
            earned_all: None,
            possible_all: None,
            earned_graded,
            possible_graded,
            reason: Some("regrade".to_string()),
            system: None,
            modified_at: Utc.with_ymd_and_hms(2026, 2, 1, 0, 0, 0).unwrap(),
        }
    }

    #[test]
    fn test_ratio_treats_unattempted_as_zero() {
        assert_eq!(grade(1.0, 2.0, false).graded_ratio(), 0.0);
        assert_eq!(grade(1.0, 2.0, true).graded_ratio(), 0.5);
        assert_eq!(grade(0.0, 0.0, true).graded_ratio(), 0.0);
    }

    #[test]
    fn test_override_replaces_values_and_bumps_freshness() {
        let mut g = grade(1.0, 4.0, true);
        let o = override_with(Some(3.0), None);
        o.apply(&mut g);

        assert_eq!(g.earned_graded, 3.0);
        assert_eq!(g.possible_graded, 4.0);
        assert_eq!(g.max_modified_at, Some(o.modified_at));
        assert!(g.check_invariants().is_ok());
    }

    #[test]
    fn test_override_keeps_bounds() {
        let mut g = grade(1.0, 2.0, true);
        override_with(None, Some(10.0)).apply(&mut g);
        assert_eq!(g.possible_graded, 10.0);
        assert_eq!(g.possible_all, 10.0);
        assert!(g.check_invariants().is_ok());

        let mut g = grade(1.0, 2.0, true);
        override_with(None, Some(0.5)).apply(&mut g);
        assert_eq!(g.earned_graded, 0.5);
        assert!(g.check_invariants().is_ok());
    }

    #[test]
    fn test_override_validation() {
        assert!(override_with(Some(2.0), Some(1.0)).validate().is_err());
        assert!(override_with(Some(-1.0), None).validate().is_err());
        assert!(override_with(Some(1.0), Some(1.0)).validate().is_ok());
        assert!(override_with(None, None).is_cleared());
    }
}
