use crate::error::QuizlockResult;
use crate::types::{AttemptId, AttemptRecord, QuizId, UserId};
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Persisted binding of one attempt to the fingerprint that first opened it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptLock {
    pub attempt_id: AttemptId,
    pub quiz_id: QuizId,
    /// Stored `<hex secret>|<hex mac>` value.
    pub session_hash: String,
}

/// Audit entry describing who released a lock and when.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnlockAuditEntry {
    pub id: i64,
    pub quiz_id: QuizId,
    pub attempt_id: AttemptId,
    pub unlocked_by: UserId,
    pub unlocked_at: DateTime<Utc>,
}

/// Audit entry awaiting insertion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewUnlockAudit {
    pub quiz_id: QuizId,
    pub attempt_id: AttemptId,
    pub unlocked_by: UserId,
    pub unlocked_at: DateTime<Utc>,
}

impl NewUnlockAudit {
    pub fn now(quiz_id: QuizId, attempt_id: AttemptId, unlocked_by: UserId) -> Self {
        Self {
            quiz_id,
            attempt_id,
            unlocked_by,
            unlocked_at: now_seconds(),
        }
    }

    pub fn with_id(self, id: i64) -> UnlockAuditEntry {
        UnlockAuditEntry {
            id,
            quiz_id: self.quiz_id,
            attempt_id: self.attempt_id,
            unlocked_by: self.unlocked_by,
            unlocked_at: self.unlocked_at,
        }
    }
}

/// Current time truncated to whole seconds, the resolution audit rows keep.
pub fn now_seconds() -> DateTime<Utc> {
    let now = Utc::now();
    DateTime::from_timestamp(now.timestamp(), 0).unwrap_or(now)
}

/// What an atomic release did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseOutcome {
    /// A lock row existed and was deleted.
    pub lock_removed: bool,
    /// `None` only when a legacy backend has no audit table.
    pub audit: Option<UnlockAuditEntry>,
}

/// Durable storage for attempt locks and the unlock audit trail.
///
/// Implementations hold no validation logic. `create` must be backed by a
/// uniqueness constraint on the attempt id so concurrent first accesses
/// resolve to a single winner; the loser receives
/// [`QuizlockError::LockExists`](crate::error::QuizlockError::LockExists).
pub trait LockStore {
    fn get(&self, attempt_id: AttemptId) -> QuizlockResult<Option<AttemptLock>>;

    /// Insert a new lock. Never upserts.
    fn create(&self, lock: &AttemptLock) -> QuizlockResult<()>;

    /// Remove the lock for `attempt_id`. Returns whether a row existed.
    fn delete(&self, attempt_id: AttemptId) -> QuizlockResult<bool>;

    /// Remove every lock belonging to `quiz_id`, returning the count.
    fn delete_all_for_quiz(&self, quiz_id: QuizId) -> QuizlockResult<usize>;

    /// Delete the lock and append `audit` as one atomic unit.
    fn release_and_record(
        &self,
        attempt_id: AttemptId,
        audit: &NewUnlockAudit,
    ) -> QuizlockResult<ReleaseOutcome>;

    /// Most recent unlock for the attempt, if any.
    fn latest_unlock(&self, attempt_id: AttemptId) -> QuizlockResult<Option<UnlockAuditEntry>>;

    /// Every unlock recorded for the attempt, oldest first.
    fn unlock_history(&self, attempt_id: AttemptId) -> QuizlockResult<Vec<UnlockAuditEntry>>;

    /// Quizzes in which `user_id` performed at least one unlock.
    fn quizzes_with_audit_by(&self, user_id: UserId) -> QuizlockResult<Vec<QuizId>>;

    /// Privacy erasure of a supervisor's audit entries.
    fn erase_audit_by_user(&self, user_id: UserId) -> QuizlockResult<usize>;

    /// Privacy erasure (or quiz deletion) of a quiz's audit entries.
    fn erase_audit_for_quiz(&self, quiz_id: QuizId) -> QuizlockResult<usize>;
}

/// Per-quiz enable flag storage. `None` means the site default applies.
pub trait QuizSettingsStore {
    fn quiz_enabled(&self, quiz_id: QuizId) -> QuizlockResult<Option<bool>>;

    fn set_quiz_enabled(&self, quiz_id: QuizId, enabled: bool) -> QuizlockResult<()>;

    fn delete_quiz_settings(&self, quiz_id: QuizId) -> QuizlockResult<()>;
}

/// Read-only view of the host's attempts.
pub trait AttemptDirectory {
    fn attempt(&self, attempt_id: AttemptId) -> QuizlockResult<Option<AttemptRecord>>;

    /// Attempts of `quiz_id`, in the order the host reports them.
    fn attempts_for_quiz(&self, quiz_id: QuizId) -> QuizlockResult<Vec<AttemptRecord>>;
}

impl<T: LockStore + ?Sized> LockStore for &T {
    fn get(&self, attempt_id: AttemptId) -> QuizlockResult<Option<AttemptLock>> {
        (**self).get(attempt_id)
    }

    fn create(&self, lock: &AttemptLock) -> QuizlockResult<()> {
        (**self).create(lock)
    }

    fn delete(&self, attempt_id: AttemptId) -> QuizlockResult<bool> {
        (**self).delete(attempt_id)
    }

    fn delete_all_for_quiz(&self, quiz_id: QuizId) -> QuizlockResult<usize> {
        (**self).delete_all_for_quiz(quiz_id)
    }

    fn release_and_record(
        &self,
        attempt_id: AttemptId,
        audit: &NewUnlockAudit,
    ) -> QuizlockResult<ReleaseOutcome> {
        (**self).release_and_record(attempt_id, audit)
    }

    fn latest_unlock(&self, attempt_id: AttemptId) -> QuizlockResult<Option<UnlockAuditEntry>> {
        (**self).latest_unlock(attempt_id)
    }

    fn unlock_history(&self, attempt_id: AttemptId) -> QuizlockResult<Vec<UnlockAuditEntry>> {
        (**self).unlock_history(attempt_id)
    }

    fn quizzes_with_audit_by(&self, user_id: UserId) -> QuizlockResult<Vec<QuizId>> {
        (**self).quizzes_with_audit_by(user_id)
    }

    fn erase_audit_by_user(&self, user_id: UserId) -> QuizlockResult<usize> {
        (**self).erase_audit_by_user(user_id)
    }

    fn erase_audit_for_quiz(&self, quiz_id: QuizId) -> QuizlockResult<usize> {
        (**self).erase_audit_for_quiz(quiz_id)
    }
}

impl<T: LockStore + ?Sized> LockStore for std::sync::Arc<T> {
    fn get(&self, attempt_id: AttemptId) -> QuizlockResult<Option<AttemptLock>> {
        (**self).get(attempt_id)
    }

    fn create(&self, lock: &AttemptLock) -> QuizlockResult<()> {
        (**self).create(lock)
    }

    fn delete(&self, attempt_id: AttemptId) -> QuizlockResult<bool> {
        (**self).delete(attempt_id)
    }

    fn delete_all_for_quiz(&self, quiz_id: QuizId) -> QuizlockResult<usize> {
        (**self).delete_all_for_quiz(quiz_id)
    }

    fn release_and_record(
        &self,
        attempt_id: AttemptId,
        audit: &NewUnlockAudit,
    ) -> QuizlockResult<ReleaseOutcome> {
        (**self).release_and_record(attempt_id, audit)
    }

    fn latest_unlock(&self, attempt_id: AttemptId) -> QuizlockResult<Option<UnlockAuditEntry>> {
        (**self).latest_unlock(attempt_id)
    }

    fn unlock_history(&self, attempt_id: AttemptId) -> QuizlockResult<Vec<UnlockAuditEntry>> {
        (**self).unlock_history(attempt_id)
    }

    fn quizzes_with_audit_by(&self, user_id: UserId) -> QuizlockResult<Vec<QuizId>> {
        (**self).quizzes_with_audit_by(user_id)
    }

    fn erase_audit_by_user(&self, user_id: UserId) -> QuizlockResult<usize> {
        (**self).erase_audit_by_user(user_id)
    }

    fn erase_audit_for_quiz(&self, quiz_id: QuizId) -> QuizlockResult<usize> {
        (**self).erase_audit_for_quiz(quiz_id)
    }
}

impl<T: QuizSettingsStore + ?Sized> QuizSettingsStore for &T {
    fn quiz_enabled(&self, quiz_id: QuizId) -> QuizlockResult<Option<bool>> {
        (**self).quiz_enabled(quiz_id)
    }

    fn set_quiz_enabled(&self, quiz_id: QuizId, enabled: bool) -> QuizlockResult<()> {
        (**self).set_quiz_enabled(quiz_id, enabled)
    }

    fn delete_quiz_settings(&self, quiz_id: QuizId) -> QuizlockResult<()> {
        (**self).delete_quiz_settings(quiz_id)
    }
}

impl<T: QuizSettingsStore + ?Sized> QuizSettingsStore for std::sync::Arc<T> {
    fn quiz_enabled(&self, quiz_id: QuizId) -> QuizlockResult<Option<bool>> {
        (**self).quiz_enabled(quiz_id)
    }

    fn set_quiz_enabled(&self, quiz_id: QuizId, enabled: bool) -> QuizlockResult<()> {
        (**self).set_quiz_enabled(quiz_id, enabled)
    }

    fn delete_quiz_settings(&self, quiz_id: QuizId) -> QuizlockResult<()> {
        (**self).delete_quiz_settings(quiz_id)
    }
}

impl<T: AttemptDirectory + ?Sized> AttemptDirectory for &T {
    fn attempt(&self, attempt_id: AttemptId) -> QuizlockResult<Option<AttemptRecord>> {
        (**self).attempt(attempt_id)
    }

    fn attempts_for_quiz(&self, quiz_id: QuizId) -> QuizlockResult<Vec<AttemptRecord>> {
        (**self).attempts_for_quiz(quiz_id)
    }
}
