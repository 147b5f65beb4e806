//! Course grading policy
//!
//! A `GradingPolicy` is what a course declares. It must pass
//! [`GradingPolicy::validate`] before it can grade anything; the result is a
//! [`ValidatedPolicy`] with normalized weights and a resolved pass mark.
//!
//! Category scoring (per category, independent of the others):
//! 1. Sort the real entries ascending by ratio.
//! 2. Drop the lowest `min(drop_count, len)` real entries.
//! 3. Pad with zero ratios until `min_count - drop_count` entries remain.
//! 4. Score is the mean of what remains (zero when nothing remains).

use crate::error::{GradesError, Result};
use crate::utils::hash_json;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// One assignment category (e.g. "Homework")
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssignmentCategory {
    /// Matches the `format` of graded subsections
    pub name: String,
    pub weight: f64,
    #[serde(default)]
    pub min_count: u32,
    #[serde(default)]
    pub drop_count: u32,
    #[serde(default)]
    pub short_label: Option<String>,
}

impl AssignmentCategory {
    pub fn new(name: impl Into<String>, weight: f64, min_count: u32, drop_count: u32) -> Self {
        Self {
            name: name.into(),
            weight,
            min_count,
            drop_count,
            short_label: None,
        }
    }
}

/// Grading policy as declared by the course
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GradingPolicy {
    #[serde(default)]
    pub categories: Vec<AssignmentCategory>,
    /// Letter grade -> minimum percent (0..=1)
    #[serde(default)]
    pub grade_cutoffs: BTreeMap<String, f64>,
    /// Explicit pass mark; defaults to the lowest cutoff
    #[serde(default)]
    pub pass_mark: Option<f64>,
}

impl GradingPolicy {
    pub fn new(categories: Vec<AssignmentCategory>) -> Self {
        Self {
            categories,
            grade_cutoffs: BTreeMap::new(),
            pass_mark: None,
        }
    }

    pub fn with_cutoff(mut self, letter: impl Into<String>, threshold: f64) -> Self {
        self.grade_cutoffs.insert(letter.into(), threshold);
        self
    }

    pub fn with_pass_mark(mut self, pass_mark: f64) -> Self {
        self.pass_mark = Some(pass_mark);
        self
    }

    /// Stable content hash of the declared policy
    pub fn policy_hash(&self) -> Result<String> {
        Ok(hash_json(self)?)
    }

    /// Check invariants and normalize weights
    pub fn validate(&self) -> Result<ValidatedPolicy> {
        if self.categories.is_empty() {
            return Err(inconsistent("policy has no assignment categories"));
        }

        let mut seen = HashSet::new();
        let mut total_weight = 0.0;
        for category in &self.categories {
            if !seen.insert(category.name.as_str()) {
                return Err(inconsistent(format!("duplicate category '{}'", category.name)));
            }
            if !category.weight.is_finite() || category.weight < 0.0 {
                return Err(inconsistent(format!(
                    "category '{}' has invalid weight {}",
                    category.name, category.weight
                )));
            }
            if category.drop_count > 0 && category.drop_count >= category.min_count {
                return Err(inconsistent(format!(
                    "category '{}' drops {} of min_count {}",
                    category.name, category.drop_count, category.min_count
                )));
            }
            total_weight += category.weight;
        }

        if total_weight <= 0.0 {
            return Err(inconsistent("category weights sum to zero"));
        }

        for (letter, threshold) in &self.grade_cutoffs {
            if !threshold.is_finite() || !(0.0..=1.0).contains(threshold) {
                return Err(inconsistent(format!(
                    "cutoff '{}' = {} is outside [0, 1]",
                    letter, threshold
                )));
            }
        }

        let lowest_cutoff = self
            .grade_cutoffs
            .values()
            .copied()
            .fold(None, |low: Option<f64>, t| Some(low.map_or(t, |l| l.min(t))));

        let pass_mark = match (self.pass_mark, lowest_cutoff) {
            (Some(mark), _) if mark.is_finite() && (0.0..=1.0).contains(&mark) => mark,
            (Some(mark), _) => {
                return Err(inconsistent(format!("pass mark {} is outside [0, 1]", mark)))
            }
            (None, Some(low)) => low,
            (None, None) => return Err(inconsistent("no pass mark and no grade cutoffs")),
        };

        let categories = self
            .categories
            .iter()
            .map(|c| AssignmentCategory {
                weight: c.weight / total_weight,
                ..c.clone()
            })
            .collect();

        let mut cutoffs: Vec<(String, f64)> = self
            .grade_cutoffs
            .iter()
            .map(|(letter, threshold)| (letter.clone(), *threshold))
            .collect();
        cutoffs.sort_by(|a, b| b.1.total_cmp(&a.1));

        Ok(ValidatedPolicy {
            categories,
            cutoffs,
            pass_mark,
        })
    }
}

fn inconsistent(message: impl Into<String>) -> GradesError {
    GradesError::PolicyInconsistency(message.into())
}

/// Policy that passed validation; weights sum to 1
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedPolicy {
    categories: Vec<AssignmentCategory>,
    /// Sorted by threshold, highest first
    cutoffs: Vec<(String, f64)>,
    pass_mark: f64,
}

/// Per-category result of a course grade computation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryScore {
    pub name: String,
    pub short_label: Option<String>,
    pub weight: f64,
    pub score: f64,
    /// Ratios that remained after dropping and padding
    pub kept: Vec<f64>,
}

/// Full course grade computation result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradeBreakdown {
    pub percent_grade: f64,
    pub letter_grade: String,
    pub categories: Vec<CategoryScore>,
}

impl ValidatedPolicy {
    pub fn categories(&self) -> &[AssignmentCategory] {
        &self.categories
    }

    pub fn category(&self, name: &str) -> Option<&AssignmentCategory> {
        self.categories.iter().find(|c| c.name == name)
    }

    pub fn pass_mark(&self) -> f64 {
        self.pass_mark
    }

    pub fn is_passing(&self, percent: f64) -> bool {
        percent >= self.pass_mark
    }

    /// Highest letter whose threshold is met; empty if none
    pub fn letter_grade(&self, percent: f64) -> String {
        self.cutoffs
            .iter()
            .find(|(_, threshold)| percent >= *threshold)
            .map(|(letter, _)| letter.clone())
            .unwrap_or_default()
    }

    /// Score one category from the ratios of its subsections
    pub fn category_score(category: &AssignmentCategory, ratios: &[f64]) -> (f64, Vec<f64>) {
        let mut kept: Vec<f64> = ratios.to_vec();
        kept.sort_by(f64::total_cmp);

        let dropped = (category.drop_count as usize).min(kept.len());
        kept.drain(..dropped);

        let slots = category.min_count.saturating_sub(category.drop_count) as usize;
        if kept.len() < slots {
            kept.resize(slots, 0.0);
        }

        let score = if kept.is_empty() {
            0.0
        } else {
            kept.iter().sum::<f64>() / kept.len() as f64
        };
        (score, kept)
    }

    /// Roll subsection ratios up into a course grade
    ///
    /// `entries` are `(category name, ratio)` pairs; entries naming an unknown
    /// category are ignored.
    pub fn grade<'a>(&self, entries: impl IntoIterator<Item = (&'a str, f64)>) -> GradeBreakdown {
        let mut by_category: BTreeMap<&str, Vec<f64>> = BTreeMap::new();
        for (name, ratio) in entries {
            if self.category(name).is_some() {
                by_category.entry(name).or_default().push(ratio);
            }
        }

        let mut percent = 0.0;
        let mut categories = Vec::with_capacity(self.categories.len());
        for category in &self.categories {
            let ratios = by_category
                .get(category.name.as_str())
                .map(Vec::as_slice)
                .unwrap_or(&[]);
            let (score, kept) = Self::category_score(category, ratios);
            percent += category.weight * score;
            categories.push(CategoryScore {
                name: category.name.clone(),
                short_label: category.short_label.clone(),
                weight: category.weight,
                score,
                kept,
            });
        }

        let percent_grade = round_percent(percent);
        GradeBreakdown {
            letter_grade: self.letter_grade(percent_grade),
            percent_grade,
            categories,
        }
    }
}

/// Clamp to [0, 1] and round half away from zero to two decimals
pub fn round_percent(percent: f64) -> f64 {
    let clamped = if percent.is_finite() {
        percent.clamp(0.0, 1.0)
    } else {
        0.0
    };
    (clamped * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPS: f64 = 1e-9;

    fn homework_policy(min_count: u32, drop_count: u32) -> ValidatedPolicy {
        GradingPolicy::new(vec![AssignmentCategory::new("HW", 1.0, min_count, drop_count)])
            .with_cutoff("Pass", 0.5)
            .validate()
            .unwrap()
    }

    #[test]
    fn test_drop_lowest() {
        let policy = homework_policy(3, 1);
        let breakdown = policy.grade([("HW", 0.4), ("HW", 0.8), ("HW", 1.0)]);
        assert!((breakdown.categories[0].score - 0.9).abs() < EPS);
        assert!((breakdown.percent_grade - 0.9).abs() < EPS);
    }

    #[test]
    fn test_missing_subsections_imputed_as_zero() {
        let policy = homework_policy(5, 1);
        let breakdown = policy.grade([("HW", 0.6), ("HW", 0.8), ("HW", 1.0)]);
        assert_eq!(breakdown.categories[0].kept.len(), 4);
        assert!((breakdown.categories[0].score - 0.45).abs() < EPS);
        assert!((breakdown.percent_grade - 0.45).abs() < EPS);
    }

    #[test]
    fn test_never_drops_more_than_available() {
        let category = AssignmentCategory::new("HW", 1.0, 3, 2);
        let (score, kept) = ValidatedPolicy::category_score(&category, &[0.5]);
        assert_eq!(kept, vec![0.0]);
        assert_eq!(score, 0.0);
    }

    #[test]
    fn test_min_count_zero_averages_what_exists() {
        let category = AssignmentCategory::new("Extra", 1.0, 0, 0);
        let (score, _) = ValidatedPolicy::category_score(&category, &[0.5, 1.0]);
        assert!((score - 0.75).abs() < EPS);
        let (empty, _) = ValidatedPolicy::category_score(&category, &[]);
        assert_eq!(empty, 0.0);
    }

    #[test]
    fn test_weights_are_normalized() {
        let policy = GradingPolicy::new(vec![
            AssignmentCategory::new("HW", 2.0, 1, 0),
            AssignmentCategory::new("Exam", 6.0, 1, 0),
        ])
        .with_cutoff("Pass", 0.5)
        .validate()
        .unwrap();

        assert!((policy.category("HW").unwrap().weight - 0.25).abs() < EPS);
        let breakdown = policy.grade([("HW", 1.0), ("Exam", 0.5), ("Unknown", 1.0)]);
        assert!((breakdown.percent_grade - 0.63).abs() < EPS);
    }

    #[test]
    fn test_letter_grade_and_pass_mark() {
        let policy = GradingPolicy::new(vec![AssignmentCategory::new("HW", 1.0, 1, 0)])
            .with_cutoff("A", 0.9)
            .with_cutoff("B", 0.8)
            .with_cutoff("C", 0.6)
            .validate()
            .unwrap();

        assert_eq!(policy.pass_mark(), 0.6);
        assert_eq!(policy.letter_grade(0.95), "A");
        assert_eq!(policy.letter_grade(0.85), "B");
        assert_eq!(policy.letter_grade(0.6), "C");
        assert_eq!(policy.letter_grade(0.59), "");
        assert!(policy.is_passing(0.6));
        assert!(!policy.is_passing(0.59));
    }

    #[test]
    fn test_invalid_policies() {
        let drop_too_many = GradingPolicy::new(vec![AssignmentCategory::new("HW", 1.0, 2, 2)])
            .with_cutoff("Pass", 0.5);
        assert!(matches!(
            drop_too_many.validate(),
            Err(GradesError::PolicyInconsistency(_))
        ));

        let zero_weights = GradingPolicy::new(vec![AssignmentCategory::new("HW", 0.0, 1, 0)])
            .with_cutoff("Pass", 0.5);
        assert!(zero_weights.validate().is_err());

        let no_pass_mark = GradingPolicy::new(vec![AssignmentCategory::new("HW", 1.0, 1, 0)]);
        assert!(no_pass_mark.validate().is_err());

        let negative = GradingPolicy::new(vec![
            AssignmentCategory::new("HW", 2.0, 1, 0),
            AssignmentCategory::new("Lab", -1.0, 1, 0),
        ])
        .with_pass_mark(0.5);
        assert!(negative.validate().is_err());
    }

    #[test]
    fn test_explicit_pass_mark_wins() {
        let policy = GradingPolicy::new(vec![AssignmentCategory::new("HW", 1.0, 1, 0)])
            .with_cutoff("Pass", 0.5)
            .with_pass_mark(0.7)
            .validate()
            .unwrap();
        assert_eq!(policy.pass_mark(), 0.7);
    }

    #[test]
    fn test_round_percent() {
        assert_eq!(round_percent(1.7), 1.0);
        assert_eq!(round_percent(-0.2), 0.0);
        assert_eq!(round_percent(0.125), 0.13);
        assert_eq!(round_percent(f64::NAN), 0.0);
    }

    #[test]
    fn test_policy_hash_tracks_content() {
        let a = GradingPolicy::new(vec![AssignmentCategory::new("HW", 1.0, 1, 0)]);
        let b = GradingPolicy::new(vec![AssignmentCategory::new("HW", 1.0, 2, 0)]);
        assert_eq!(a.policy_hash().unwrap(), a.clone().policy_hash().unwrap());
        assert_ne!(a.policy_hash().unwrap(), b.policy_hash().unwrap());
    }
}
