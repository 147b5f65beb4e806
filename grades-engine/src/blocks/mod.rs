//! Block-structure provider: course snapshots, outlines and learner lookup

pub mod learners;
pub mod outline;
pub mod provider;
pub mod structure;

pub use learners::{InMemoryLearnerDirectory, LearnerDirectory, LearnerEntry};
pub use outline::{BlockKind, CourseOutline, OutlineBlock, OutlineBuilder};
pub use provider::{load_outlines_from_dir, BlockStructureProvider, InMemoryBlockProvider};
pub use structure::{BlockNode, BlockStructure, SubsectionInfo};
