//! Database access for grades-engine
//!
//! One module per table. Schema creation lives in `grades_common::db`.
//! Writes that must be atomic with another write take a `SqliteConnection`
//! (usually a transaction); everything else takes the pool.

pub mod course_grades;
pub mod overrides;
pub mod retirement;
pub mod scores;
pub mod settings;
pub mod subsection_grades;
pub mod tasks;
pub mod visible_blocks;
