//! # Grades Common Library
//!
//! Shared code for the persistent grades engine and its tooling:
//! - Identifier newtypes (users, courses, usage keys, course versions)
//! - Event types (GradesEvent enum) and the EventBus
//! - Bootstrap configuration loading
//! - Database initialization
//! - Timestamp utilities

pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod ids;
pub mod time;

pub use error::{Error, Result};
pub use ids::{CourseId, CourseVersion, UsageKey, UserId};
