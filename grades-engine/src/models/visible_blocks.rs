//! Content-addressed list of the problems considered for a subsection grade

use crate::error::Result;
use crate::utils::hash_json;
use grades_common::{CourseId, UsageKey};
use serde::{Deserialize, Serialize};

/// Format version folded into every hash
pub const BLOCK_RECORD_LIST_VERSION: u32 = 1;

/// One problem as seen by the aggregation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockRecord {
    pub locator: UsageKey,
    pub weight: Option<f64>,
    pub raw_possible: f64,
    pub graded: bool,
}

/// Sorted block records plus the course they belong to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockRecordList {
    pub blocks: Vec<BlockRecord>,
    pub course_id: CourseId,
    pub version: u32,
}

impl BlockRecordList {
    /// Build a list; records are sorted by locator and deduplicated
    pub fn new(course_id: CourseId, mut blocks: Vec<BlockRecord>) -> Self {
        blocks.sort_by(|a, b| a.locator.cmp(&b.locator));
        blocks.dedup_by(|a, b| a.locator == b.locator);
        Self {
            blocks,
            course_id,
            version: BLOCK_RECORD_LIST_VERSION,
        }
    }

    /// Canonical compact JSON
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Content hash identifying this exact set of records
    pub fn hash_value(&self) -> Result<String> {
        Ok(hash_json(self)?)
    }

    pub fn locators(&self) -> impl Iterator<Item = &UsageKey> {
        self.blocks.iter().map(|b| &b.locator)
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}
