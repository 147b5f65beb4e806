//! Course outline interchange format
//!
//! A `CourseOutline` is the serialized form of one published course version:
//! a flat list of blocks referencing their children by key, the top-level
//! sections in order, and the grading policy. Outlines are read from JSON
//! files by the binary and built with [`OutlineBuilder`] in code and tests.

use crate::error::{GradesError, Result};
use crate::models::GradingPolicy;
use chrono::{DateTime, Utc};
use grades_common::{CourseId, CourseVersion, UsageKey};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Block type and its grading attributes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BlockKind {
    Section,
    Subsection {
        /// Assignment category name
        #[serde(default)]
        format: Option<String>,
        #[serde(default)]
        graded: bool,
    },
    Problem {
        #[serde(default)]
        weight: Option<f64>,
        raw_possible: f64,
        #[serde(default = "default_true")]
        graded: bool,
    },
    /// Anything else (html, video, verticals); ignored for grading
    #[serde(other)]
    Other,
}

fn default_true() -> bool {
    true
}

/// One block of an outline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutlineBlock {
    pub key: UsageKey,
    pub kind: BlockKind,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub children: Vec<UsageKey>,
    /// Learner must belong to at least one group; empty means unrestricted
    #[serde(default)]
    pub group_access: BTreeSet<i64>,
    #[serde(default)]
    pub visible_to_staff_only: bool,
    #[serde(default)]
    pub edited_at: Option<DateTime<Utc>>,
}

/// Serialized course version
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CourseOutline {
    pub course_id: CourseId,
    pub version: CourseVersion,
    #[serde(default)]
    pub edited_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub grading_policy: GradingPolicy,
    /// Top-level sections, in course order
    pub sections: Vec<UsageKey>,
    pub blocks: Vec<OutlineBlock>,
}

impl CourseOutline {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Programmatic outline construction
///
/// Blocks are added under an existing parent by key. Mistakes (unknown
/// parent, duplicate key) are collected and reported by [`OutlineBuilder::build`].
///
/// ```
/// use chrono::Utc;
/// use grades_engine::blocks::OutlineBuilder;
///
/// let outline = OutlineBuilder::new("course-v1:Org+CS101+2026", "v1", Utc::now())
///     .section("week1")
///     .subsection("week1", "hw1", Some("Homework"), true)
///     .problem("hw1", "p1", Some(1.0), 1.0)
///     .build()
///     .unwrap();
/// assert_eq!(outline.blocks.len(), 3);
/// ```
#[derive(Debug, Clone)]
pub struct OutlineBuilder {
    outline: CourseOutline,
    errors: Vec<String>,
}

impl OutlineBuilder {
    pub fn new(
        course_id: impl Into<String>,
        fingerprint: impl Into<String>,
        published_at: DateTime<Utc>,
    ) -> Self {
        Self {
            outline: CourseOutline {
                course_id: CourseId::new(course_id),
                version: CourseVersion::new(fingerprint, published_at),
                edited_at: None,
                grading_policy: GradingPolicy::default(),
                sections: Vec::new(),
                blocks: Vec::new(),
            },
            errors: Vec::new(),
        }
    }

    /// Start from an existing outline, e.g. to publish an edited version
    pub fn from_outline(outline: CourseOutline) -> Self {
        Self {
            outline,
            errors: Vec::new(),
        }
    }

    pub fn version(mut self, fingerprint: impl Into<String>, published_at: DateTime<Utc>) -> Self {
        self.outline.version = CourseVersion::new(fingerprint, published_at);
        self
    }

    pub fn edited_at(mut self, edited_at: DateTime<Utc>) -> Self {
        self.outline.edited_at = Some(edited_at);
        self
    }

    pub fn grading_policy(mut self, policy: GradingPolicy) -> Self {
        self.outline.grading_policy = policy;
        self
    }

    pub fn section(mut self, key: &str) -> Self {
        if self.push_block(key, BlockKind::Section) {
            self.outline.sections.push(UsageKey::new(key));
        }
        self
    }

    pub fn subsection(mut self, parent: &str, key: &str, format: Option<&str>, graded: bool) -> Self {
        let kind = BlockKind::Subsection {
            format: format.map(str::to_string),
            graded,
        };
        if self.push_block(key, kind) {
            self.add_child(parent, key);
        }
        self
    }

    pub fn problem(mut self, parent: &str, key: &str, weight: Option<f64>, raw_possible: f64) -> Self {
        let kind = BlockKind::Problem {
            weight,
            raw_possible,
            graded: true,
        };
        if self.push_block(key, kind) {
            self.add_child(parent, key);
        }
        self
    }

    pub fn ungraded_problem(mut self, parent: &str, key: &str, raw_possible: f64) -> Self {
        let kind = BlockKind::Problem {
            weight: None,
            raw_possible,
            graded: false,
        };
        if self.push_block(key, kind) {
            self.add_child(parent, key);
        }
        self
    }

    /// Non-gradable container or leaf (unit, html, video)
    pub fn other(mut self, parent: &str, key: &str) -> Self {
        if self.push_block(key, BlockKind::Other) {
            self.add_child(parent, key);
        }
        self
    }

    /// Attach an existing block under a second parent
    pub fn link(mut self, parent: &str, child: &str) -> Self {
        if self.block_mut(child).is_none() {
            self.errors.push(format!("link to unknown block '{}'", child));
        } else {
            self.add_child(parent, child);
        }
        self
    }

    pub fn group_access(mut self, key: &str, groups: impl IntoIterator<Item = i64>) -> Self {
        match self.block_mut(key) {
            Some(block) => block.group_access = groups.into_iter().collect(),
            None => self.errors.push(format!("group_access on unknown block '{}'", key)),
        }
        self
    }

    pub fn staff_only(mut self, key: &str) -> Self {
        match self.block_mut(key) {
            Some(block) => block.visible_to_staff_only = true,
            None => self.errors.push(format!("staff_only on unknown block '{}'", key)),
        }
        self
    }

    pub fn block_edited_at(mut self, key: &str, edited_at: DateTime<Utc>) -> Self {
        match self.block_mut(key) {
            Some(block) => block.edited_at = Some(edited_at),
            None => self.errors.push(format!("edited_at on unknown block '{}'", key)),
        }
        self
    }

    pub fn build(self) -> Result<CourseOutline> {
        if self.errors.is_empty() {
            Ok(self.outline)
        } else {
            Err(GradesError::InvalidInput(format!(
                "outline for {}: {}",
                self.outline.course_id,
                self.errors.join("; ")
            )))
        }
    }

    fn push_block(&mut self, key: &str, kind: BlockKind) -> bool {
        if self.block_mut(key).is_some() {
            self.errors.push(format!("duplicate block '{}'", key));
            return false;
        }
        self.outline.blocks.push(OutlineBlock {
            key: UsageKey::new(key),
            kind,
            display_name: key.to_string(),
            children: Vec::new(),
            group_access: BTreeSet::new(),
            visible_to_staff_only: false,
            edited_at: None,
        });
        true
    }

    fn add_child(&mut self, parent: &str, child: &str) {
        match self.block_mut(parent) {
            Some(block) => block.children.push(UsageKey::new(child)),
            None => self.errors.push(format!("unknown parent '{}' for '{}'", parent, child)),
        }
    }

    fn block_mut(&mut self, key: &str) -> Option<&mut OutlineBlock> {
        self.outline.blocks.iter_mut().find(|b| b.key.as_str() == key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_kinds_parse_as_other() {
        let json = r#"{"key": "v1", "kind": {"type": "video"}}"#;
        let block: OutlineBlock = serde_json::from_str(json).unwrap();
        assert_eq!(block.kind, BlockKind::Other);
    }

    #[test]
    fn test_problem_defaults_to_graded() {
        let json = r#"{"key": "p1", "kind": {"type": "problem", "raw_possible": 2.0}}"#;
        let block: OutlineBlock = serde_json::from_str(json).unwrap();
        assert_eq!(
            block.kind,
            BlockKind::Problem {
                weight: None,
                raw_possible: 2.0,
                graded: true
            }
        );
    }

    #[test]
    fn test_builder_reports_unknown_parent() {
        let result = OutlineBuilder::new("course", "v1", Utc::now())
            .section("s1")
            .subsection("missing", "seq1", None, false)
            .build();
        assert!(matches!(result, Err(GradesError::InvalidInput(_))));
    }

    #[test]
    fn test_builder_rejects_duplicate_keys() {
        let result = OutlineBuilder::new("course", "v1", Utc::now())
            .section("s1")
            .section("s1")
            .build();
        assert!(result.is_err());
    }
}
