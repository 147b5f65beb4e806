//! Test Helper Utilities
//!
//! Shared setup for grades-engine integration tests

#![allow(dead_code)]

use chrono::{DateTime, TimeZone, Utc};
use grades_common::db::init_memory_database;
use grades_common::events::GradesEvent;
use grades_common::{CourseId, UsageKey, UserId};
use grades_engine::blocks::{InMemoryBlockProvider, InMemoryLearnerDirectory, OutlineBuilder};
use grades_engine::config::RuntimeSettings;
use grades_engine::models::{AssignmentCategory, GradingPolicy, ProblemScore, ScoreSubmission};
use grades_engine::GradesEngine;
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

pub const COURSE: &str = "course-v1:Org+CS101+2026";

pub struct TestEngine {
    pub engine: GradesEngine,
    pub provider: Arc<InMemoryBlockProvider>,
    pub learners: Arc<InMemoryLearnerDirectory>,
    pub db: SqlitePool,
}

/// Settings with short retry and throttle delays
pub fn fast_settings() -> RuntimeSettings {
    RuntimeSettings {
        worker_count: 2,
        max_attempts: 3,
        retry_base_ms: 1,
        retry_max_ms: 5,
        fanout_throttle_ms: 10,
        database_max_lock_wait_ms: 2000,
        ..RuntimeSettings::default()
    }
}

/// Engine over a fresh in-memory database; not started
pub async fn engine_with(settings: RuntimeSettings) -> TestEngine {
    let db = init_memory_database().await.unwrap();
    engine_on(db, settings)
}

pub fn engine_on(db: SqlitePool, settings: RuntimeSettings) -> TestEngine {
    let provider = Arc::new(InMemoryBlockProvider::new());
    let learners = Arc::new(InMemoryLearnerDirectory::new());
    let engine = GradesEngine::with_settings(db.clone(), provider.clone(), learners.clone(), settings);
    TestEngine {
        engine,
        provider,
        learners,
        db,
    }
}

/// Started engine with fast settings
pub async fn started_engine() -> TestEngine {
    let t = engine_with(fast_settings()).await;
    t.engine.start().await.unwrap();
    t
}

pub fn course() -> CourseId {
    CourseId::new(COURSE)
}

pub fn key(key: &str) -> UsageKey {
    UsageKey::new(key)
}

pub fn day(day: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, day, 0, 0, 0).unwrap()
}

pub fn at(day: u32, hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, day, hour, 0, 0).unwrap()
}

pub fn homework_policy(min_count: u32, drop_count: u32) -> GradingPolicy {
    GradingPolicy::new(vec![AssignmentCategory::new("HW", 1.0, min_count, drop_count)])
        .with_cutoff("Pass", 0.5)
}

/// Course with one section and no subsections yet
pub fn outline(fingerprint: &str, published: u32, policy: GradingPolicy) -> OutlineBuilder {
    OutlineBuilder::new(COURSE, fingerprint, day(published))
        .grading_policy(policy)
        .section("ch1")
}

/// Publish an outline and hand its event to the engine
pub async fn publish(t: &TestEngine, builder: OutlineBuilder) {
    let event = t.provider.publish(builder.build().unwrap()).await.unwrap();
    t.engine.handle_event(event).await.unwrap();
}

pub async fn record(t: &TestEngine, user: i64, problem: &str, earned: f64, possible: f64) -> ProblemScore {
    t.engine
        .record_score(ScoreSubmission::new(UserId(user), course(), key(problem), earned, possible))
        .await
        .unwrap()
}

/// Wait for the coordinator to drain, failing the test after a few seconds
pub async fn settle(t: &TestEngine) {
    tokio::time::timeout(Duration::from_secs(10), t.engine.wait_idle())
        .await
        .expect("coordinator did not go idle");
}

pub fn drain(rx: &mut broadcast::Receiver<GradesEvent>) -> Vec<GradesEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

pub fn count<F: Fn(&GradesEvent) -> bool>(events: &[GradesEvent], pred: F) -> usize {
    events.iter().filter(|e| pred(e)).count()
}

pub async fn row_count(db: &SqlitePool, table: &str) -> i64 {
    sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", table))
        .fetch_one(db)
        .await
        .unwrap()
}
