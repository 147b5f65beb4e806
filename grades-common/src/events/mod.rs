//! Event types for the grades event system
//!
//! Provides the shared event definitions and the EventBus used by every
//! grades component. Events are serde-tagged so they can be read from and
//! written to newline-delimited JSON streams.

use crate::ids::{CourseId, CourseVersion, UsageKey, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Grades event types
///
/// The first four variants are triggers, handed to the recompute coordinator
/// directly; the bus only broadcasts them as notifications. The rest are
/// emitted by the aggregators and the coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum GradesEvent {
    /// A problem score was recorded or replaced
    ///
    /// Triggers:
    /// - Coordinator: recompute every subsection containing the problem
    ScoreChanged {
        user_id: UserId,
        course_id: CourseId,
        problem_key: UsageKey,
        /// `modified_at` of the score row after the write
        modified_at: DateTime<Utc>,
    },

    /// A new course content version was published
    ///
    /// Triggers:
    /// - Coordinator: re-derive subsection and course grades (eager policy)
    ContentPublished {
        course_id: CourseId,
        version: CourseVersion,
        /// Course-level subtree edit time, if known
        edited_at: Option<DateTime<Utc>>,
    },

    /// The grading policy changed without a content change
    ///
    /// Triggers:
    /// - Coordinator: re-run course aggregation only
    GradingPolicyChanged {
        course_id: CourseId,
        version: CourseVersion,
    },

    /// A learner account was retired
    ///
    /// Triggers:
    /// - Coordinator: delete every score and grade row of the learner
    UserRetired { user_id: UserId },

    /// A subsection grade row was written
    SubsectionGradeCalculated {
        user_id: UserId,
        course_id: CourseId,
        subsection_key: UsageKey,
        earned_graded: f64,
        possible_graded: f64,
        course_version: String,
        timestamp: DateTime<Utc>,
    },

    /// A course grade row was written
    CourseGradeUpdated {
        user_id: UserId,
        course_id: CourseId,
        percent_grade: f64,
        letter_grade: String,
        passed_at: Option<DateTime<Utc>>,
    },

    /// A learner passed a course for the first time
    ///
    /// Emitted exactly once per (user, course).
    LearnerPassed {
        user_id: UserId,
        course_id: CourseId,
        passed_at: DateTime<Utc>,
    },

    /// A recompute task exhausted its attempts or failed terminally
    RecomputeFailed {
        task_id: Uuid,
        user_id: Option<UserId>,
        course_id: CourseId,
        task: String,
        reason_code: String,
        message: String,
        attempts: u32,
        timestamp: DateTime<Utc>,
    },

    /// A course grading policy failed validation
    PolicyInconsistency {
        course_id: CourseId,
        course_version: String,
        message: String,
        timestamp: DateTime<Utc>,
    },
}

impl GradesEvent {
    /// Event type name (matches the serde tag)
    pub fn event_type(&self) -> &'static str {
        match self {
            GradesEvent::ScoreChanged { .. } => "ScoreChanged",
            GradesEvent::ContentPublished { .. } => "ContentPublished",
            GradesEvent::GradingPolicyChanged { .. } => "GradingPolicyChanged",
            GradesEvent::UserRetired { .. } => "UserRetired",
            GradesEvent::SubsectionGradeCalculated { .. } => "SubsectionGradeCalculated",
            GradesEvent::CourseGradeUpdated { .. } => "CourseGradeUpdated",
            GradesEvent::LearnerPassed { .. } => "LearnerPassed",
            GradesEvent::RecomputeFailed { .. } => "RecomputeFailed",
            GradesEvent::PolicyInconsistency { .. } => "PolicyInconsistency",
        }
    }

    /// True for events the recompute coordinator acts on
    pub fn is_trigger(&self) -> bool {
        matches!(
            self,
            GradesEvent::ScoreChanged { .. }
                | GradesEvent::ContentPublished { .. }
                | GradesEvent::GradingPolicyChanged { .. }
                | GradesEvent::UserRetired { .. }
        )
    }
}

// ========================================
// EventBus Implementation
// ========================================

/// Central event distribution bus
///
/// The EventBus uses tokio::broadcast internally, providing:
/// - Non-blocking publish (slow subscribers don't block producers)
/// - Multiple concurrent subscribers
/// - Lagged message detection for slow subscribers
///
/// # Examples
///
/// ```
/// use grades_common::events::{EventBus, GradesEvent};
/// use grades_common::UserId;
///
/// let event_bus = EventBus::new(100);
/// let mut rx = event_bus.subscribe();
///
/// event_bus.emit_lossy(GradesEvent::UserRetired { user_id: UserId(7) });
/// assert!(rx.try_recv().is_ok());
/// ```
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<GradesEvent>,
    capacity: usize,
}

impl EventBus {
    /// Creates a new EventBus with the given channel capacity
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    pub fn subscribe(&self) -> broadcast::Receiver<GradesEvent> {
        self.tx.subscribe()
    }

    /// Emit an event to all subscribers
    ///
    /// Returns `Ok(subscriber_count)` if at least one subscriber exists,
    /// `Err` if nobody is listening.
    #[allow(clippy::result_large_err)]
    pub fn emit(
        &self,
        event: GradesEvent,
    ) -> Result<usize, broadcast::error::SendError<GradesEvent>> {
        self.tx.send(event)
    }

    /// Emit an event, ignoring if no subscribers are listening
    pub fn emit_lossy(&self, event: GradesEvent) {
        let _ = self.emit(event);
    }

    /// Get the current number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Get the configured channel capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_score_changed_json_shape() {
        let event = GradesEvent::ScoreChanged {
            user_id: UserId(5),
            course_id: CourseId::new("course-v1:Org+CS101+2026"),
            problem_key: UsageKey::new("problem-1"),
            modified_at: Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap(),
        };

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "ScoreChanged");
        assert_eq!(json["user_id"], 5);
        assert_eq!(json["problem_key"], "problem-1");

        let parsed: GradesEvent = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, event);
        assert!(parsed.is_trigger());
    }

    #[test]
    fn test_emitted_events_are_not_triggers() {
        let event = GradesEvent::LearnerPassed {
            user_id: UserId(1),
            course_id: CourseId::new("c"),
            passed_at: Utc::now(),
        };
        assert!(!event.is_trigger());
        assert_eq!(event.event_type(), "LearnerPassed");
    }

    #[tokio::test]
    async fn test_event_bus_delivers_to_all_subscribers() {
        let bus = EventBus::new(10);
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);

        let count = bus.emit(GradesEvent::UserRetired { user_id: UserId(3) }).unwrap();
        assert_eq!(count, 2);

        assert_eq!(rx1.recv().await.unwrap().event_type(), "UserRetired");
        assert_eq!(rx2.recv().await.unwrap().event_type(), "UserRetired");
    }

    #[test]
    fn test_emit_without_subscribers_fails_but_lossy_does_not_panic() {
        let bus = EventBus::new(4);
        assert!(bus.emit(GradesEvent::UserRetired { user_id: UserId(1) }).is_err());
        bus.emit_lossy(GradesEvent::UserRetired { user_id: UserId(1) });
        assert_eq!(bus.capacity(), 4);
    }
}
