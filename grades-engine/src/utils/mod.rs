//! Utility modules for grades-engine

pub mod db_retry;
pub mod hashing;

pub use db_retry::retry_on_lock;
pub use hashing::{hash_json, sha256_base64};
