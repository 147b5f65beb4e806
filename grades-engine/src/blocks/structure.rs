//! Immutable block-structure snapshot
//!
//! Blocks live in one `Vec`; parent and child links are indices into it, so
//! a block reachable along several paths (DAG) is stored once. Cycles are
//! rejected when the snapshot is built.

use super::outline::{BlockKind, CourseOutline};
use crate::error::{GradesError, Result};
use crate::models::{GradingPolicy, LearnerContext};
use chrono::{DateTime, Utc};
use grades_common::{CourseId, CourseVersion, UsageKey};
use std::collections::{BTreeSet, HashMap, HashSet};

/// One block of the arena
#[derive(Debug, Clone)]
pub struct BlockNode {
    pub key: UsageKey,
    pub kind: BlockKind,
    pub display_name: String,
    pub children: Vec<usize>,
    pub parents: Vec<usize>,
    pub group_access: BTreeSet<i64>,
    pub visible_to_staff_only: bool,
    pub subtree_edited_at: Option<DateTime<Utc>>,
}

impl BlockNode {
    /// Node-level visibility for a learner (ancestors are not consulted)
    pub fn is_visible_to(&self, learner: &LearnerContext) -> bool {
        if learner.is_staff() {
            return true;
        }
        if self.visible_to_staff_only {
            return false;
        }
        self.group_access.is_empty() || learner.in_any_group(&self.group_access)
    }

    pub fn is_problem(&self) -> bool {
        matches!(self.kind, BlockKind::Problem { .. })
    }

    pub fn is_subsection(&self) -> bool {
        matches!(self.kind, BlockKind::Subsection { .. })
    }
}

/// Grading attributes of a subsection
#[derive(Debug, Clone, PartialEq)]
pub struct SubsectionInfo {
    pub key: UsageKey,
    pub display_name: String,
    pub format: Option<String>,
    pub graded: bool,
    pub subtree_edited_at: Option<DateTime<Utc>>,
}

/// Snapshot of one course version
#[derive(Debug, Clone)]
pub struct BlockStructure {
    course_id: CourseId,
    version: CourseVersion,
    course_edited_at: Option<DateTime<Utc>>,
    nodes: Vec<BlockNode>,
    index: HashMap<UsageKey, usize>,
    sections: Vec<usize>,
    grading_policy: GradingPolicy,
    grading_policy_hash: String,
}

impl BlockStructure {
    /// Build the arena from an outline, rejecting dangling links and cycles
    pub fn from_outline(outline: &CourseOutline) -> Result<Self> {
        let mut index = HashMap::with_capacity(outline.blocks.len());
        for (i, block) in outline.blocks.iter().enumerate() {
            if index.insert(block.key.clone(), i).is_some() {
                return Err(invalid(outline, format!("duplicate block '{}'", block.key)));
            }
        }

        let mut nodes: Vec<BlockNode> = outline
            .blocks
            .iter()
            .map(|block| BlockNode {
                key: block.key.clone(),
                kind: block.kind.clone(),
                display_name: block.display_name.clone(),
                children: Vec::with_capacity(block.children.len()),
                parents: Vec::new(),
                group_access: block.group_access.clone(),
                visible_to_staff_only: block.visible_to_staff_only,
                subtree_edited_at: block.edited_at,
            })
            .collect();

        for (parent, block) in outline.blocks.iter().enumerate() {
            for child_key in &block.children {
                let child = *index.get(child_key).ok_or_else(|| {
                    invalid(outline, format!("'{}' references unknown child '{}'", block.key, child_key))
                })?;
                if !nodes[parent].children.contains(&child) {
                    nodes[parent].children.push(child);
                    nodes[child].parents.push(parent);
                }
            }
        }

        let mut sections = Vec::with_capacity(outline.sections.len());
        for key in &outline.sections {
            let i = *index
                .get(key)
                .ok_or_else(|| invalid(outline, format!("unknown section '{}'", key)))?;
            sections.push(i);
        }

        if let Some(key) = find_cycle(&nodes) {
            return Err(invalid(outline, format!("cycle through block '{}'", key)));
        }

        let grading_policy_hash = outline.grading_policy.policy_hash()?;

        Ok(Self {
            course_id: outline.course_id.clone(),
            version: outline.version.clone(),
            course_edited_at: outline.edited_at,
            nodes,
            index,
            sections,
            grading_policy: outline.grading_policy.clone(),
            grading_policy_hash,
        })
    }

    /// Same content under a new version with a different grading policy
    pub fn with_grading_policy(&self, policy: GradingPolicy, version: CourseVersion) -> Result<Self> {
        let grading_policy_hash = policy.policy_hash()?;
        Ok(Self {
            version,
            grading_policy: policy,
            grading_policy_hash,
            ..self.clone()
        })
    }

    pub fn course_id(&self) -> &CourseId {
        &self.course_id
    }

    pub fn version(&self) -> &CourseVersion {
        &self.version
    }

    pub fn fingerprint(&self) -> &str {
        &self.version.fingerprint
    }

    pub fn course_edited_at(&self) -> Option<DateTime<Utc>> {
        self.course_edited_at
    }

    pub fn grading_policy(&self) -> &GradingPolicy {
        &self.grading_policy
    }

    pub fn grading_policy_hash(&self) -> &str {
        &self.grading_policy_hash
    }

    pub fn get(&self, key: &UsageKey) -> Option<&BlockNode> {
        self.index.get(key).map(|&i| &self.nodes[i])
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn sections(&self) -> impl Iterator<Item = &BlockNode> {
        self.sections.iter().map(|&i| &self.nodes[i])
    }

    pub fn subsection(&self, key: &UsageKey) -> Option<SubsectionInfo> {
        let i = *self.index.get(key)?;
        self.subsection_info(i)
    }

    /// Every subsection reachable from the sections, in course order
    pub fn subsections(&self) -> Vec<SubsectionInfo> {
        self.ordered_subsections(None)
    }

    /// Subsections reachable through blocks visible to `learner`
    pub fn visible_subsections(&self, learner: &LearnerContext) -> Vec<SubsectionInfo> {
        self.ordered_subsections(Some(learner))
    }

    /// Problems under a subsection that `learner` may see, in course order
    ///
    /// Hidden blocks hide their whole subtree. A problem reachable along two
    /// paths appears once. An unknown key is `NotFound`.
    pub fn visible_problems(
        &self,
        subsection_key: &UsageKey,
        learner: &LearnerContext,
    ) -> Result<Vec<&BlockNode>> {
        let start = *self.index.get(subsection_key).ok_or_else(|| {
            GradesError::NotFound(format!(
                "block {} in {}@{}",
                subsection_key, self.course_id, self.version.fingerprint
            ))
        })?;

        let mut problems = Vec::new();
        let mut visited = HashSet::new();
        let mut stack = vec![start];
        while let Some(i) = stack.pop() {
            if !visited.insert(i) {
                continue;
            }
            let node = &self.nodes[i];
            if !node.is_visible_to(learner) {
                continue;
            }
            if node.is_problem() {
                problems.push(node);
            }
            stack.extend(node.children.iter().rev());
        }
        Ok(problems)
    }

    /// Subsections having `problem_key` as a descendant
    pub fn subsections_containing(&self, problem_key: &UsageKey) -> Vec<UsageKey> {
        let Some(&start) = self.index.get(problem_key) else {
            return Vec::new();
        };

        let mut found = Vec::new();
        let mut visited = HashSet::new();
        let mut stack = vec![start];
        while let Some(i) = stack.pop() {
            if !visited.insert(i) {
                continue;
            }
            let node = &self.nodes[i];
            if node.is_subsection() {
                found.push(node.key.clone());
            }
            stack.extend(node.parents.iter());
        }
        found.sort();
        found
    }

    fn subsection_info(&self, i: usize) -> Option<SubsectionInfo> {
        let node = &self.nodes[i];
        match &node.kind {
            BlockKind::Subsection { format, graded } => Some(SubsectionInfo {
                key: node.key.clone(),
                display_name: node.display_name.clone(),
                format: format.clone(),
                graded: *graded,
                subtree_edited_at: node.subtree_edited_at,
            }),
            _ => None,
        }
    }

    fn ordered_subsections(&self, learner: Option<&LearnerContext>) -> Vec<SubsectionInfo> {
        let mut out = Vec::new();
        let mut visited = HashSet::new();
        let mut stack: Vec<usize> = self.sections.iter().rev().copied().collect();
        while let Some(i) = stack.pop() {
            if !visited.insert(i) {
                continue;
            }
            let node = &self.nodes[i];
            if let Some(learner) = learner {
                if !node.is_visible_to(learner) {
                    continue;
                }
            }
            if let Some(info) = self.subsection_info(i) {
                out.push(info);
                continue;
            }
            stack.extend(node.children.iter().rev());
        }
        out
    }
}

fn invalid(outline: &CourseOutline, message: String) -> GradesError {
    GradesError::InvalidInput(format!(
        "outline {}@{}: {}",
        outline.course_id, outline.version.fingerprint, message
    ))
}

/// Iterative three-color DFS; returns a key on a cycle if there is one
fn find_cycle(nodes: &[BlockNode]) -> Option<UsageKey> {
    #[derive(Clone, Copy, PartialEq)]
    enum Color {
        White,
        Grey,
        Black,
    }

    let mut color = vec![Color::White; nodes.len()];
    for root in 0..nodes.len() {
        if color[root] != Color::White {
            continue;
        }
        // (node, next child position)
        let mut stack: Vec<(usize, usize)> = vec![(root, 0)];
        color[root] = Color::Grey;
        while let Some(top) = stack.len().checked_sub(1) {
            let (node, pos) = stack[top];
            if let Some(&child) = nodes[node].children.get(pos) {
                stack[top].1 += 1;
                match color[child] {
                    Color::Grey => return Some(nodes[child].key.clone()),
                    Color::White => {
                        color[child] = Color::Grey;
                        stack.push((child, 0));
                    }
                    Color::Black => {}
                }
            } else {
                color[node] = Color::Black;
                stack.pop();
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blocks::outline::OutlineBuilder;
    use grades_common::UserId;

    fn outline() -> CourseOutline {
        OutlineBuilder::new("course", "v1", Utc::now())
            .section("ch1")
            .subsection("ch1", "seq1", Some("HW"), true)
            .other("seq1", "unit1")
            .problem("unit1", "p1", Some(1.0), 1.0)
            .problem("unit1", "p2", Some(1.0), 1.0)
            .group_access("p2", [7])
            .section("ch2")
            .subsection("ch2", "seq2", Some("Exam"), true)
            .problem("seq2", "p3", None, 5.0)
            .link("seq2", "unit1")
            .subsection("ch2", "seq3", None, false)
            .staff_only("seq3")
            .build()
            .unwrap()
    }

    fn keys(nodes: &[&BlockNode]) -> Vec<String> {
        nodes.iter().map(|n| n.key.to_string()).collect()
    }

    #[test]
    fn test_subsections_in_course_order() {
        let structure = BlockStructure::from_outline(&outline()).unwrap();
        let all: Vec<String> = structure.subsections().into_iter().map(|s| s.key.to_string()).collect();
        assert_eq!(all, vec!["seq1", "seq2", "seq3"]);

        let learner = LearnerContext::learner(UserId(1));
        let visible: Vec<String> = structure
            .visible_subsections(&learner)
            .into_iter()
            .map(|s| s.key.to_string())
            .collect();
        assert_eq!(visible, vec!["seq1", "seq2"]);
    }

    #[test]
    fn test_group_gated_problem_hidden() {
        let structure = BlockStructure::from_outline(&outline()).unwrap();
        let seq1 = UsageKey::new("seq1");

        let outsider = LearnerContext::learner(UserId(1));
        assert_eq!(keys(&structure.visible_problems(&seq1, &outsider).unwrap()), vec!["p1"]);

        let member = LearnerContext::learner(UserId(2)).with_groups([7]);
        assert_eq!(keys(&structure.visible_problems(&seq1, &member).unwrap()), vec!["p1", "p2"]);
    }

    #[test]
    fn test_dag_shares_blocks() {
        let structure = BlockStructure::from_outline(&outline()).unwrap();
        let learner = LearnerContext::learner(UserId(1));
        let problems = structure.visible_problems(&UsageKey::new("seq2"), &learner).unwrap();
        assert_eq!(keys(&problems), vec!["p3", "p1"]);

        let containing = structure.subsections_containing(&UsageKey::new("p1"));
        assert_eq!(containing, vec![UsageKey::new("seq1"), UsageKey::new("seq2")]);
        assert!(structure.subsections_containing(&UsageKey::new("nope")).is_empty());
    }

    #[test]
    fn test_cycle_rejected() {
        let mut cyclic = outline();
        let unit = cyclic.blocks.iter_mut().find(|b| b.key.as_str() == "unit1").unwrap();
        unit.children.push(UsageKey::new("seq1"));

        let result = BlockStructure::from_outline(&cyclic);
        assert!(matches!(result, Err(GradesError::InvalidInput(_))));
    }

    #[test]
    fn test_unknown_subsection_is_not_found() {
        let structure = BlockStructure::from_outline(&outline()).unwrap();
        let learner = LearnerContext::learner(UserId(1));
        let result = structure.visible_problems(&UsageKey::new("missing"), &learner);
        assert!(matches!(result, Err(GradesError::NotFound(_))));
    }

    #[test]
    fn test_staff_sees_everything() {
        let structure = BlockStructure::from_outline(&outline()).unwrap();
        let staff = LearnerContext::learner(UserId(9)).with_access(crate::models::AccessLevel::Staff);
        assert_eq!(structure.visible_subsections(&staff).len(), 3);
    }
}
