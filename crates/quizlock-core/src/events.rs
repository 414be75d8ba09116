//! Domain events raised by the gate and the unlock service.
//!
//! Delivery is fire-and-forget: a sink failure is logged by the caller and
//! never changes an access decision or rolls back an unlock.

use crate::error::QuizlockResult;
use crate::types::{AttemptId, QuizId, UserId};
use chrono::{DateTime, Utc};
use log::info;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AccessEvent {
    /// A request for the attempt arrived from a different client.
    AttemptBlocked {
        rule: String,
        attempt_id: AttemptId,
        quiz_id: QuizId,
        /// Owner of the attempt.
        related_user: UserId,
        /// User behind the rejected request.
        requested_by: UserId,
        at: DateTime<Utc>,
    },
    /// A supervisor released the attempt's lock.
    AttemptUnlocked {
        rule: String,
        attempt_id: AttemptId,
        quiz_id: QuizId,
        related_user: UserId,
        unlocked_by: UserId,
        at: DateTime<Utc>,
    },
}

impl AccessEvent {
    pub fn name(&self) -> &'static str {
        match self {
            AccessEvent::AttemptBlocked { .. } => "attempt_blocked",
            AccessEvent::AttemptUnlocked { .. } => "attempt_unlocked",
        }
    }

    pub fn attempt_id(&self) -> AttemptId {
        match self {
            AccessEvent::AttemptBlocked { attempt_id, .. }
            | AccessEvent::AttemptUnlocked { attempt_id, .. } => *attempt_id,
        }
    }
}

/// Receiver for access events (activity log, notifications, ...).
pub trait EventSink {
    fn emit(&self, event: &AccessEvent) -> QuizlockResult<()>;
}

/// Writes each event as a JSON line through the `log` facade.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogEventSink;

impl EventSink for LogEventSink {
    fn emit(&self, event: &AccessEvent) -> QuizlockResult<()> {
        let payload = serde_json::to_string(event)
            .map_err(|err| crate::error::QuizlockError::Storage(format!("encode event: {err}")))?;
        info!(target: "quizlock::events", "{payload}");
        Ok(())
    }
}

impl<T: EventSink + ?Sized> EventSink for std::sync::Arc<T> {
    fn emit(&self, event: &AccessEvent) -> QuizlockResult<()> {
        (**self).emit(event)
    }
}

impl<T: EventSink + ?Sized> EventSink for &T {
    fn emit(&self, event: &AccessEvent) -> QuizlockResult<()> {
        (**self).emit(event)
    }
}
