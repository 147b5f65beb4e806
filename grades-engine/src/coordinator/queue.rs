//! Persistent, coalescing recompute queue
//!
//! One entry per task key. Every state change is written to
//! `recompute_tasks` before it becomes visible to workers, so [`TaskQueue::recover`]
//! can rebuild the queue after a restart. Finished tasks are deleted; failed
//! ones are kept for inspection.

use super::task::{TaskKind, TaskState};
use crate::db::tasks::{self, TaskRow};
use crate::error::Result;
use crate::utils::retry_on_lock;
use chrono::{DateTime, Utc};
use grades_common::{time, UserId};
use sqlx::SqlitePool;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, warn};
use uuid::Uuid;

/// Workers re-check the delayed set at least this often
const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
struct TaskEntry {
    task_id: Uuid,
    kind: TaskKind,
    state: TaskState,
    /// Failed attempts so far
    attempts: u32,
    not_before: DateTime<Utc>,
    trigger_modified_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    enqueued_at: DateTime<Utc>,
    /// New trigger arrived while in flight
    rerun: bool,
    /// Learner retired while in flight
    cancelled: bool,
}

impl TaskEntry {
    fn new(kind: TaskKind, trigger: Option<DateTime<Utc>>) -> Self {
        let now = time::now();
        Self {
            task_id: Uuid::new_v4(),
            kind,
            state: TaskState::Queued,
            attempts: 0,
            not_before: now,
            trigger_modified_at: trigger,
            last_error: None,
            enqueued_at: now,
            rerun: false,
            cancelled: false,
        }
    }

    fn to_row(&self, key: &str) -> Result<TaskRow> {
        Ok(TaskRow {
            task_id: self.task_id,
            task_key: key.to_string(),
            kind: self.kind.to_json()?,
            state: self.state.as_str().to_string(),
            attempts: self.attempts,
            not_before: self.not_before,
            trigger_modified_at: self.trigger_modified_at,
            last_error: self.last_error.clone(),
            enqueued_at: self.enqueued_at,
            updated_at: time::now(),
        })
    }

    fn absorb(&mut self, kind: TaskKind, trigger: Option<DateTime<Utc>>) {
        self.kind.absorb(kind);
        self.trigger_modified_at = self.trigger_modified_at.max(trigger);
    }

    /// Apply a worker's outcome; says where the entry goes next
    fn finish(&mut self, completion: Completion, now: DateTime<Utc>) -> Placement {
        let rerun = std::mem::take(&mut self.rerun);
        match completion {
            Completion::Done if !rerun => Placement::Delete,
            Completion::Done => self.requeue(now),
            Completion::Continue(kind) => {
                if !rerun {
                    self.kind = kind;
                }
                self.requeue(now)
            }
            Completion::Deferred(delay) => self.schedule(now + chrono_delay(delay)),
            Completion::Retry { delay, error } => {
                self.attempts += 1;
                self.last_error = Some(error);
                self.schedule(now + chrono_delay(delay))
            }
            Completion::Failed { error } if rerun => {
                debug!(task = %self.kind, error = %error, "Failed task has a newer trigger; running again");
                self.last_error = Some(error);
                self.requeue(now)
            }
            Completion::Failed { error } => {
                self.attempts += 1;
                self.last_error = Some(error);
                self.state = TaskState::Failed;
                Placement::Failed
            }
        }
    }

    fn requeue(&mut self, now: DateTime<Utc>) -> Placement {
        self.state = TaskState::Queued;
        self.attempts = 0;
        self.not_before = now;
        Placement::Ready
    }

    fn schedule(&mut self, due: DateTime<Utc>) -> Placement {
        self.state = TaskState::RetryScheduled;
        self.not_before = due;
        Placement::Delayed
    }
}

/// Where a finished entry goes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Placement {
    Delete,
    Ready,
    Delayed,
    Failed,
}

#[derive(Default)]
struct QueueState {
    tasks: HashMap<String, TaskEntry>,
    ready: VecDeque<String>,
    delayed: BinaryHeap<Reverse<(DateTime<Utc>, String)>>,
    in_flight: usize,
    /// Learners whose rows are being deleted
    retiring: HashSet<UserId>,
}

impl QueueState {
    /// Move due retries to the ready list
    fn promote_due(&mut self, now: DateTime<Utc>) {
        while let Some(Reverse((due, _))) = self.delayed.peek() {
            if *due > now {
                break;
            }
            let Some(Reverse((due, key))) = self.delayed.pop() else {
                break;
            };
            if let Some(entry) = self.tasks.get_mut(&key) {
                if entry.state == TaskState::RetryScheduled && entry.not_before == due {
                    entry.state = TaskState::Queued;
                    self.ready.push_back(key);
                }
            }
        }
    }
}

/// What `enqueue` did with a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Inserted,
    /// Merged into a waiting task with the same key
    Coalesced,
    /// Same key in flight; it runs again when done
    RerunFlagged,
    /// Learner is being retired
    Ignored,
}

/// A task handed to a worker
#[derive(Debug, Clone, PartialEq)]
pub struct Dequeued {
    pub task_id: Uuid,
    pub key: String,
    pub kind: TaskKind,
    pub attempts: u32,
    pub trigger_modified_at: Option<DateTime<Utc>>,
}

/// How a worker finished a task
#[derive(Debug, Clone, PartialEq)]
pub enum Completion {
    Done,
    /// Run again right away with an updated kind (fan-out progress)
    Continue(TaskKind),
    /// Run again after a delay without counting an attempt (backpressure)
    Deferred(Duration),
    Retry { delay: Duration, error: String },
    Failed { error: String },
}

/// Final word on a failed task, for the failure event
#[derive(Debug, Clone, PartialEq)]
pub struct FailedTask {
    pub task_id: Uuid,
    pub kind: TaskKind,
    pub attempts: u32,
}

pub struct TaskQueue {
    db: SqlitePool,
    state: Mutex<QueueState>,
    notify: Notify,
    max_lock_wait_ms: u64,
}

impl TaskQueue {
    pub fn new(db: SqlitePool, max_lock_wait_ms: u64) -> Self {
        Self {
            db,
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            max_lock_wait_ms,
        }
    }

    /// Add a task or merge it into the one already holding its key
    ///
    /// The row is written first; on error the queue is unchanged.
    pub async fn enqueue(&self, kind: TaskKind, trigger: Option<DateTime<Utc>>) -> Result<EnqueueOutcome> {
        let key = kind.key();
        let mut state = self.state.lock().await;

        if let Some(user_id) = kind.user_id() {
            if state.retiring.contains(&user_id) {
                debug!(task = %kind, "Task for retiring learner ignored");
                return Ok(EnqueueOutcome::Ignored);
            }
        }

        if let Some(existing) = state.tasks.get(&key) {
            let mut entry = existing.clone();
            let outcome = match entry.state {
                TaskState::InFlight => {
                    entry.rerun = true;
                    EnqueueOutcome::RerunFlagged
                }
                _ => EnqueueOutcome::Coalesced,
            };
            entry.absorb(kind, trigger);
            self.persist(&entry.to_row(&key)?).await?;
            state.tasks.insert(key.clone(), entry);
            debug!(key = %key, ?outcome, "Task coalesced");
            return Ok(outcome);
        }

        let entry = TaskEntry::new(kind, trigger);
        self.persist(&entry.to_row(&key)?).await?;
        state.tasks.insert(key.clone(), entry);
        state.ready.push_back(key);
        drop(state);

        self.notify.notify_one();
        Ok(EnqueueOutcome::Inserted)
    }

    /// Take the next ready task and mark it in flight
    ///
    /// A task whose row cannot be written stays at the head of the queue.
    pub async fn next_ready(&self) -> Result<Option<Dequeued>> {
        let mut state = self.state.lock().await;
        state.promote_due(time::now());

        while let Some(key) = state.ready.pop_front() {
            let Some(entry) = state.tasks.get(&key) else {
                continue;
            };
            if entry.state != TaskState::Queued {
                continue;
            }

            let mut claimed = entry.clone();
            claimed.state = TaskState::InFlight;
            let written = match claimed.to_row(&key) {
                Ok(row) => self.persist(&row).await,
                Err(e) => Err(e),
            };
            if let Err(e) = written {
                state.ready.push_front(key);
                return Err(e);
            }

            let dequeued = Dequeued {
                task_id: claimed.task_id,
                key: key.clone(),
                kind: claimed.kind.clone(),
                attempts: claimed.attempts,
                trigger_modified_at: claimed.trigger_modified_at,
            };
            state.tasks.insert(key, claimed);
            state.in_flight += 1;
            return Ok(Some(dequeued));
        }
        Ok(None)
    }

    /// Record the outcome of an in-flight task
    ///
    /// Returns the task when it is now permanently failed. When the outcome
    /// cannot be written the task goes back to the ready list, so it runs
    /// again instead of staying in flight with no worker.
    pub async fn complete(&self, key: &str, completion: Completion) -> Result<Option<FailedTask>> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        let Some(mut entry) = state.tasks.get(key).cloned() else {
            warn!(key = %key, "Completed task is not in the queue");
            return Ok(None);
        };

        let now = time::now();
        let placement = if entry.cancelled {
            Placement::Delete
        } else {
            entry.finish(completion, now)
        };
        let written = match placement {
            Placement::Delete => self.delete(entry.task_id).await,
            _ => match entry.to_row(key) {
                Ok(row) => self.persist(&row).await,
                Err(e) => Err(e),
            },
        };
        state.in_flight = state.in_flight.saturating_sub(1);

        if let Err(e) = written {
            if entry.cancelled {
                state.tasks.remove(key);
            } else if let Some(stored) = state.tasks.get_mut(key) {
                stored.state = TaskState::Queued;
                stored.rerun = false;
                stored.not_before = now;
                state.ready.push_back(key.to_string());
            }
            drop(guard);
            self.notify.notify_one();
            return Err(e);
        }

        let failed = match placement {
            Placement::Delete => {
                state.tasks.remove(key);
                None
            }
            Placement::Failed => {
                state.tasks.remove(key);
                Some(FailedTask {
                    task_id: entry.task_id,
                    kind: entry.kind,
                    attempts: entry.attempts,
                })
            }
            Placement::Ready => {
                state.tasks.insert(key.to_string(), entry);
                state.ready.push_back(key.to_string());
                None
            }
            Placement::Delayed => {
                state
                    .delayed
                    .push(Reverse((entry.not_before, key.to_string())));
                state.tasks.insert(key.to_string(), entry);
                None
            }
        };
        drop(guard);

        self.notify.notify_one();
        Ok(failed)
    }

    /// Stop all work for a learner being retired
    ///
    /// Waiting tasks are dropped; tasks in flight are flagged and dropped when
    /// they finish. Enqueues for the learner are ignored until
    /// [`TaskQueue::finish_retirement`].
    pub async fn cancel_user(&self, user_id: UserId) -> Result<usize> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        state.retiring.insert(user_id);

        let keys: Vec<String> = state
            .tasks
            .iter()
            .filter(|(_, entry)| entry.kind.user_id() == Some(user_id))
            .map(|(key, _)| key.clone())
            .collect();

        let mut cancelled = 0;
        for key in keys {
            let Some(entry) = state.tasks.get_mut(&key) else {
                continue;
            };
            if entry.state == TaskState::InFlight {
                entry.cancelled = true;
            } else {
                let task_id = entry.task_id;
                self.delete(task_id).await?;
                state.tasks.remove(&key);
            }
            cancelled += 1;
        }
        Ok(cancelled)
    }

    /// Accept tasks for the learner again once their rows are gone
    pub async fn finish_retirement(&self, user_id: UserId) {
        self.state.lock().await.retiring.remove(&user_id);
    }

    pub async fn user_in_flight(&self, user_id: UserId) -> bool {
        let state = self.state.lock().await;
        state
            .tasks
            .values()
            .any(|entry| entry.state == TaskState::InFlight && entry.kind.user_id() == Some(user_id))
    }

    /// Tasks queued, scheduled for retry, or in flight
    pub async fn depth(&self) -> usize {
        self.state.lock().await.tasks.len()
    }

    pub async fn in_flight(&self) -> usize {
        self.state.lock().await.in_flight
    }

    pub async fn is_idle(&self) -> bool {
        self.state.lock().await.tasks.is_empty()
    }

    /// Rebuild the queue from unfinished task rows
    ///
    /// Tasks that were in flight when the process stopped run again.
    pub async fn recover(&self) -> Result<usize> {
        let rows = retry_on_lock("load_unfinished_tasks", self.max_lock_wait_ms, || {
            tasks::load_unfinished_tasks(&self.db)
        })
        .await?;

        let mut state = self.state.lock().await;
        let mut recovered = 0;
        for row in rows {
            let kind = match TaskKind::from_json(&row.kind) {
                Ok(kind) => kind,
                Err(e) => {
                    warn!(task_id = %row.task_id, error = %e, "Dropping unreadable task row");
                    self.delete(row.task_id).await?;
                    continue;
                }
            };
            let key = kind.key();

            if let Some(existing) = state.tasks.get_mut(&key) {
                if existing.task_id == row.task_id {
                    // Queued by this process before recovery ran
                    continue;
                }
                existing.absorb(kind, row.trigger_modified_at);
                self.delete(row.task_id).await?;
                continue;
            }

            let retry_scheduled = row.state == TaskState::RetryScheduled.as_str();
            let entry = TaskEntry {
                task_id: row.task_id,
                kind,
                state: if retry_scheduled {
                    TaskState::RetryScheduled
                } else {
                    TaskState::Queued
                },
                attempts: row.attempts,
                not_before: row.not_before,
                trigger_modified_at: row.trigger_modified_at,
                last_error: row.last_error,
                enqueued_at: row.enqueued_at,
                rerun: false,
                cancelled: false,
            };
            if retry_scheduled {
                state.delayed.push(Reverse((entry.not_before, key.clone())));
            } else {
                state.ready.push_back(key.clone());
            }
            state.tasks.insert(key, entry);
            recovered += 1;
        }
        drop(state);

        if recovered > 0 {
            self.notify.notify_waiters();
        }
        Ok(recovered)
    }

    /// Resolves when work may be available
    pub async fn wait_for_work(&self) {
        let _ = tokio::time::timeout(POLL_INTERVAL, self.notify.notified()).await;
    }

    async fn persist(&self, row: &TaskRow) -> Result<()> {
        retry_on_lock("save_task", self.max_lock_wait_ms, || tasks::save_task(&self.db, row)).await
    }

    async fn delete(&self, task_id: Uuid) -> Result<()> {
        retry_on_lock("delete_task", self.max_lock_wait_ms, || {
            tasks::delete_task(&self.db, task_id)
        })
        .await
    }
}

fn chrono_delay(delay: Duration) -> chrono::Duration {
    chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use grades_common::db::init_memory_database;
    use grades_common::{CourseId, UsageKey};

    async fn queue() -> (TaskQueue, SqlitePool) {
        let pool = init_memory_database().await.unwrap();
        (TaskQueue::new(pool.clone(), 1000), pool)
    }

    fn subsection(user: i64) -> TaskKind {
        TaskKind::RecomputeSubsection {
            user_id: UserId(user),
            course_id: CourseId::new("course"),
            subsection_key: UsageKey::new("seq1"),
        }
    }

    fn course(rederive: bool) -> TaskKind {
        TaskKind::RecomputeCourse {
            user_id: UserId(1),
            course_id: CourseId::new("course"),
            rederive,
        }
    }

    fn at(second: u32) -> Option<DateTime<Utc>> {
        use chrono::TimeZone;
        Some(Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, second).unwrap())
    }

    #[tokio::test]
    async fn test_duplicate_triggers_coalesce() {
        let (queue, pool) = queue().await;
        assert_eq!(queue.enqueue(subsection(1), at(1)).await.unwrap(), EnqueueOutcome::Inserted);
        assert_eq!(queue.enqueue(subsection(1), at(5)).await.unwrap(), EnqueueOutcome::Coalesced);
        assert_eq!(queue.enqueue(subsection(1), at(3)).await.unwrap(), EnqueueOutcome::Coalesced);
        assert_eq!(queue.depth().await, 1);

        let task = queue.next_ready().await.unwrap().unwrap();
        assert_eq!(task.trigger_modified_at, at(5));
        assert!(queue.next_ready().await.unwrap().is_none());

        let rows = tasks::load_unfinished_tasks(&pool).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].state, "in_flight");
    }

    #[tokio::test]
    async fn test_in_flight_task_is_rerun() {
        let (queue, _pool) = queue().await;
        queue.enqueue(course(false), None).await.unwrap();
        let task = queue.next_ready().await.unwrap().unwrap();

        assert_eq!(queue.enqueue(course(true), None).await.unwrap(), EnqueueOutcome::RerunFlagged);
        assert!(queue.next_ready().await.unwrap().is_none());

        queue.complete(&task.key, Completion::Done).await.unwrap();
        let rerun = queue.next_ready().await.unwrap().unwrap();
        assert_eq!(rerun.kind, course(true));

        queue.complete(&rerun.key, Completion::Done).await.unwrap();
        assert!(queue.is_idle().await);
    }

    #[tokio::test]
    async fn test_done_deletes_row() {
        let (queue, pool) = queue().await;
        queue.enqueue(subsection(1), None).await.unwrap();
        let task = queue.next_ready().await.unwrap().unwrap();
        assert!(queue.complete(&task.key, Completion::Done).await.unwrap().is_none());

        assert!(queue.is_idle().await);
        assert!(tasks::load_unfinished_tasks(&pool).await.unwrap().is_empty());
        assert!(tasks::load_failed_tasks(&pool, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_retry_then_failure_keeps_row() {
        let (queue, pool) = queue().await;
        queue.enqueue(subsection(1), None).await.unwrap();

        let task = queue.next_ready().await.unwrap().unwrap();
        let retry = Completion::Retry {
            delay: Duration::ZERO,
            error: "locked".to_string(),
        };
        assert!(queue.complete(&task.key, retry).await.unwrap().is_none());

        let task = queue.next_ready().await.unwrap().unwrap();
        assert_eq!(task.attempts, 1);
        let failed = queue
            .complete(&task.key, Completion::Failed { error: "locked".to_string() })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(failed.attempts, 2);
        assert!(queue.is_idle().await);

        let rows = tasks::load_failed_tasks(&pool, 10).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].last_error.as_deref(), Some("locked"));
    }

    #[tokio::test]
    async fn test_deferred_task_waits() {
        let (queue, _pool) = queue().await;
        queue.enqueue(subsection(1), None).await.unwrap();
        let task = queue.next_ready().await.unwrap().unwrap();
        queue
            .complete(&task.key, Completion::Deferred(Duration::from_secs(3600)))
            .await
            .unwrap();

        assert!(queue.next_ready().await.unwrap().is_none());
        assert_eq!(queue.depth().await, 1);
    }

    #[tokio::test]
    async fn test_cancel_user_drops_waiting_and_ignores_new() {
        let (queue, _pool) = queue().await;
        queue.enqueue(subsection(1), None).await.unwrap();
        queue.enqueue(subsection(2), None).await.unwrap();
        queue.enqueue(course(false), None).await.unwrap();

        let first = queue.next_ready().await.unwrap().unwrap();
        assert_eq!(first.kind, subsection(1));

        assert_eq!(queue.cancel_user(UserId(1)).await.unwrap(), 2);
        assert!(queue.user_in_flight(UserId(1)).await);
        assert_eq!(queue.enqueue(subsection(1), None).await.unwrap(), EnqueueOutcome::Ignored);

        queue.complete(&first.key, Completion::Done).await.unwrap();
        assert!(!queue.user_in_flight(UserId(1)).await);

        let remaining = queue.next_ready().await.unwrap().unwrap();
        assert_eq!(remaining.kind, subsection(2));
    }

    #[tokio::test]
    async fn test_recover_requeues_unfinished() {
        let (queue, pool) = queue().await;
        queue.enqueue(subsection(1), at(2)).await.unwrap();
        queue.enqueue(subsection(2), None).await.unwrap();
        queue.next_ready().await.unwrap().unwrap();

        let restarted = TaskQueue::new(pool, 1000);
        assert_eq!(restarted.recover().await.unwrap(), 2);

        let a = restarted.next_ready().await.unwrap().unwrap();
        let b = restarted.next_ready().await.unwrap().unwrap();
        let mut kinds = vec![a.kind, b.kind];
        kinds.sort_by_key(|k| k.key());
        assert_eq!(kinds, vec![subsection(1), subsection(2)]);
        assert_eq!(a.trigger_modified_at.max(b.trigger_modified_at), at(2));
    }

    #[tokio::test]
    async fn test_finish_retirement_accepts_tasks_again() {
        let (queue, _pool) = queue().await;
        queue.cancel_user(UserId(1)).await.unwrap();
        assert_eq!(queue.enqueue(subsection(1), None).await.unwrap(), EnqueueOutcome::Ignored);

        queue.finish_retirement(UserId(1)).await;
        assert_eq!(queue.enqueue(subsection(1), None).await.unwrap(), EnqueueOutcome::Inserted);
    }

    async fn rename_tasks_table(pool: &SqlitePool, from: &str, to: &str) {
        sqlx::query(&format!("ALTER TABLE {} RENAME TO {}", from, to))
            .execute(pool)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_enqueue_write_failure_leaves_queue_empty() {
        let (queue, pool) = queue().await;
        rename_tasks_table(&pool, "recompute_tasks", "parked_tasks").await;

        assert!(queue.enqueue(subsection(1), None).await.is_err());
        assert_eq!(queue.depth().await, 0);
        assert!(queue.is_idle().await);
    }

    #[tokio::test]
    async fn test_claim_write_failure_keeps_task_ready() {
        let (queue, pool) = queue().await;
        queue.enqueue(subsection(1), None).await.unwrap();
        rename_tasks_table(&pool, "recompute_tasks", "parked_tasks").await;

        assert!(queue.next_ready().await.is_err());
        assert_eq!(queue.in_flight().await, 0);
        assert!(!queue.user_in_flight(UserId(1)).await);
        assert_eq!(queue.depth().await, 1);

        rename_tasks_table(&pool, "parked_tasks", "recompute_tasks").await;
        let task = queue.next_ready().await.unwrap().unwrap();
        assert_eq!(task.kind, subsection(1));
        assert_eq!(queue.in_flight().await, 1);
    }

    #[tokio::test]
    async fn test_outcome_write_failure_requeues_task() {
        let (queue, pool) = queue().await;
        queue.enqueue(subsection(1), None).await.unwrap();
        let task = queue.next_ready().await.unwrap().unwrap();
        rename_tasks_table(&pool, "recompute_tasks", "parked_tasks").await;

        assert!(queue.complete(&task.key, Completion::Done).await.is_err());
        assert_eq!(queue.in_flight().await, 0);
        assert!(!queue.user_in_flight(UserId(1)).await);
        assert!(!queue.is_idle().await);

        rename_tasks_table(&pool, "parked_tasks", "recompute_tasks").await;
        let again = queue.next_ready().await.unwrap().unwrap();
        assert_eq!(again.task_id, task.task_id);
        assert_eq!(again.attempts, 0);

        queue.complete(&again.key, Completion::Done).await.unwrap();
        assert!(queue.is_idle().await);
        assert!(tasks::load_unfinished_tasks(&pool).await.unwrap().is_empty());
    }
}
