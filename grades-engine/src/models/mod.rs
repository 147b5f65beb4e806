//! Domain models for grades-engine

pub mod grades;
pub mod learner;
pub mod policy;
pub mod score;
pub mod visible_blocks;

pub use grades::{CourseGrade, OverrideAction, OverrideHistoryEntry, SubsectionGrade, SubsectionGradeOverride};
pub use learner::{AccessLevel, LearnerContext};
pub use policy::{AssignmentCategory, GradingPolicy, ValidatedPolicy};
pub use score::{ProblemScore, ScoreSubmission};
pub use visible_blocks::{BlockRecord, BlockRecordList};
