//! Grading services
//!
//! Leaves first: the score store feeds the subsection aggregator, which
//! feeds the course aggregator. Readers, overrides and reports sit on top.

pub mod course_aggregator;
pub mod grade_reader;
pub mod grade_report;
pub mod locks;
pub mod overrides;
pub mod score_store;
pub mod subsection_aggregator;

pub use course_aggregator::{CourseAggregator, CourseComputeOptions, CourseOutcome};
pub use grade_reader::{CourseGradeLookup, GradeReader, ReadPolicy};
pub use grade_report::{CourseReport, GradeReportGenerator, ReportFailure, ReportRow};
pub use locks::GradeLocks;
pub use overrides::{OverrideRequest, OverrideService};
pub use score_store::ProblemScoreStore;
pub use subsection_aggregator::{SubsectionAggregator, SubsectionOutcome};
