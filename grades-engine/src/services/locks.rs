//! In-process advisory locks keyed by grading identity
//!
//! Lock order, never reversed:
//! course lock -> subsection lock -> course gate (read) for subsection runs,
//! course lock -> course gate (write) for the course commit. A course run
//! must not hold its gate while it calls into subsection aggregation.

use grades_common::{CourseId, UsageKey, UserId};
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

/// Entries are pruned once the map grows past this many keys
const PRUNE_THRESHOLD: usize = 1024;

/// Map of per-key locks created on demand
pub struct LockMap<K, L> {
    entries: Mutex<HashMap<K, Arc<L>>>,
}

impl<K, L> Default for LockMap<K, L> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl<K: Eq + Hash + Clone, L: Default> LockMap<K, L> {
    pub fn new() -> Self {
        Self::default()
    }

    async fn entry(&self, key: &K) -> Arc<L> {
        let mut entries = self.entries.lock().await;
        if entries.len() > PRUNE_THRESHOLD {
            // Only the map holds the Arc: nobody holds or waits for the lock
            entries.retain(|_, lock| Arc::strong_count(lock) > 1);
        }
        entries.entry(key.clone()).or_default().clone()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }
}

/// Exclusive per-key locks
pub type KeyedLocks<K> = LockMap<K, Mutex<()>>;

/// Shared/exclusive per-key gates
pub type KeyedGates<K> = LockMap<K, RwLock<()>>;

impl<K: Eq + Hash + Clone> LockMap<K, Mutex<()>> {
    pub async fn lock(&self, key: &K) -> OwnedMutexGuard<()> {
        self.entry(key).await.lock_owned().await
    }
}

impl<K: Eq + Hash + Clone> LockMap<K, RwLock<()>> {
    pub async fn read(&self, key: &K) -> OwnedRwLockReadGuard<()> {
        self.entry(key).await.read_owned().await
    }

    pub async fn write(&self, key: &K) -> OwnedRwLockWriteGuard<()> {
        self.entry(key).await.write_owned().await
    }
}

pub type ProblemLockKey = (UserId, CourseId, UsageKey);
pub type SubsectionLockKey = (UserId, CourseId, UsageKey);
pub type CourseLockKey = (UserId, CourseId);

/// Every advisory lock the grading services share
#[derive(Default)]
pub struct GradeLocks {
    /// Serializes score writes per (user, course, problem)
    pub scores: KeyedLocks<ProblemLockKey>,
    /// Serializes subsection aggregation per (user, course, subsection)
    pub subsections: KeyedLocks<SubsectionLockKey>,
    /// Serializes course aggregation per (user, course)
    pub courses: KeyedLocks<CourseLockKey>,
    /// Subsection runs hold it shared; course commits hold it exclusively
    pub course_gates: KeyedGates<CourseLockKey>,
}

impl GradeLocks {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}
