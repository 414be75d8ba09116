//! Supervisor-facing unlock service and the read surface used by reports.

use crate::error::{QuizlockError, QuizlockResult};
use crate::events::{AccessEvent, EventSink};
use crate::policy::{AccessPolicy, Capability};
use crate::store::{AttemptDirectory, LockStore, NewUnlockAudit, UnlockAuditEntry};
use crate::types::{AttemptId, AttemptRecord, AttemptStatus, QuizId, UserId};
use log::{info, warn};

/// Why an attempt was left untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    NotFound,
    Ineligible(AttemptStatus),
    /// Bulk mode only; a single unlock reports this as an error.
    Unauthorized,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnlockOutcome {
    Unlocked {
        /// False when the attempt was already unlocked.
        lock_removed: bool,
        audit: Option<UnlockAuditEntry>,
    },
    Skipped(SkipReason),
}

/// Result of one unlock request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnlockReport {
    pub attempt_id: AttemptId,
    pub outcome: UnlockOutcome,
}

impl UnlockReport {
    pub fn succeeded(&self) -> bool {
        matches!(self.outcome, UnlockOutcome::Unlocked { .. })
    }
}

/// Result of a bulk unlock, in request order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkUnlockReport {
    pub succeeded: usize,
    pub reports: Vec<UnlockReport>,
}

impl BulkUnlockReport {
    pub fn skipped(&self) -> impl Iterator<Item = (AttemptId, SkipReason)> + '_ {
        self.reports.iter().filter_map(|report| match report.outcome {
            UnlockOutcome::Skipped(reason) => Some((report.attempt_id, reason)),
            UnlockOutcome::Unlocked { .. } => None,
        })
    }
}

/// Lock state of one attempt as shown to supervisors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptLockSummary {
    pub attempt: AttemptRecord,
    pub locked: bool,
    pub unlockable: bool,
    pub last_unlock: Option<UnlockAuditEntry>,
}

/// Releases locks on behalf of supervisors and keeps the audit trail.
pub struct UnlockService<S, D, P, E>
where
    S: LockStore,
    D: AttemptDirectory,
    P: AccessPolicy,
    E: EventSink,
{
    rule: String,
    store: S,
    attempts: D,
    policy: P,
    events: E,
}

impl<S, D, P, E> UnlockService<S, D, P, E>
where
    S: LockStore,
    D: AttemptDirectory,
    P: AccessPolicy,
    E: EventSink,
{
    pub fn new(rule: impl Into<String>, store: S, attempts: D, policy: P, events: E) -> Self {
        Self {
            rule: rule.into(),
            store,
            attempts,
            policy,
            events,
        }
    }

    /// Release the lock on `attempt_id` for `actor`.
    ///
    /// Unknown and ineligible attempts are skipped, not errors. Releasing an
    /// attempt that holds no lock still succeeds and is audited. The lock
    /// delete and the audit append commit together.
    pub fn unlock(&self, attempt_id: AttemptId, actor: UserId) -> QuizlockResult<UnlockReport> {
        let Some(attempt) = self.attempts.attempt(attempt_id)? else {
            return Ok(skipped(attempt_id, SkipReason::NotFound));
        };

        if !self
            .policy
            .has_capability(actor, attempt.quiz_id, Capability::AllowChange)?
        {
            return Err(QuizlockError::AuthorizationDenied {
                user: actor,
                quiz: attempt.quiz_id,
            });
        }

        if !attempt.status.is_unlockable() {
            info!(
                "skipping unlock of attempt {attempt_id}: status {} cannot be resumed",
                attempt.status
            );
            return Ok(skipped(attempt_id, SkipReason::Ineligible(attempt.status)));
        }

        let audit = NewUnlockAudit::now(attempt.quiz_id, attempt_id, actor);
        let outcome = self.store.release_and_record(attempt_id, &audit)?;
        info!(
            "user {actor} unlocked attempt {attempt_id} in quiz {} (lock removed: {})",
            attempt.quiz_id, outcome.lock_removed
        );

        let event = AccessEvent::AttemptUnlocked {
            rule: self.rule.clone(),
            attempt_id,
            quiz_id: attempt.quiz_id,
            related_user: attempt.user_id,
            unlocked_by: actor,
            at: audit.unlocked_at,
        };
        if let Err(err) = self.events.emit(&event) {
            warn!("failed to emit {} for attempt {attempt_id}: {err}", event.name());
        }

        Ok(UnlockReport {
            attempt_id,
            outcome: UnlockOutcome::Unlocked {
                lock_removed: outcome.lock_removed,
                audit: outcome.audit,
            },
        })
    }

    /// Unlock each attempt in order. Skips never abort the batch; storage
    /// failures do.
    pub fn unlock_many(
        &self,
        attempt_ids: &[AttemptId],
        actor: UserId,
    ) -> QuizlockResult<BulkUnlockReport> {
        let mut bulk = BulkUnlockReport::default();
        for &attempt_id in attempt_ids {
            let report = match self.unlock(attempt_id, actor) {
                Ok(report) => report,
                Err(QuizlockError::AuthorizationDenied { .. }) => {
                    warn!("user {actor} may not unlock attempt {attempt_id}; skipped");
                    skipped(attempt_id, SkipReason::Unauthorized)
                }
                Err(err) => return Err(err),
            };
            if report.succeeded() {
                bulk.succeeded += 1;
            }
            bulk.reports.push(report);
        }
        Ok(bulk)
    }

    /// Lock state and latest unlock for one attempt.
    pub fn status(&self, attempt_id: AttemptId) -> QuizlockResult<AttemptLockSummary> {
        let attempt = self
            .attempts
            .attempt(attempt_id)?
            .ok_or(QuizlockError::AttemptNotFound(attempt_id))?;
        self.summarise(attempt)
    }

    /// Lock state and latest unlock for every attempt of `quiz_id`.
    pub fn report(&self, quiz_id: QuizId) -> QuizlockResult<Vec<AttemptLockSummary>> {
        self.attempts
            .attempts_for_quiz(quiz_id)?
            .into_iter()
            .map(|attempt| self.summarise(attempt))
            .collect()
    }

    pub fn unlock_history(&self, attempt_id: AttemptId) -> QuizlockResult<Vec<UnlockAuditEntry>> {
        self.store.unlock_history(attempt_id)
    }

    pub fn quizzes_with_audit_by(&self, user_id: UserId) -> QuizlockResult<Vec<QuizId>> {
        self.store.quizzes_with_audit_by(user_id)
    }

    /// Privacy erasure of everything recorded about `user_id` as a supervisor.
    pub fn erase_audit_by_user(&self, user_id: UserId) -> QuizlockResult<usize> {
        let erased = self.store.erase_audit_by_user(user_id)?;
        info!("erased {erased} unlock audit entries recorded for user {user_id}");
        Ok(erased)
    }

    pub fn erase_audit_for_quiz(&self, quiz_id: QuizId) -> QuizlockResult<usize> {
        let erased = self.store.erase_audit_for_quiz(quiz_id)?;
        info!("erased {erased} unlock audit entries for quiz {quiz_id}");
        Ok(erased)
    }

    fn summarise(&self, attempt: AttemptRecord) -> QuizlockResult<AttemptLockSummary> {
        let locked = self.store.get(attempt.attempt_id)?.is_some();
        let last_unlock = self.store.latest_unlock(attempt.attempt_id)?;
        Ok(AttemptLockSummary {
            unlockable: attempt.status.is_unlockable(),
            attempt,
            locked,
            last_unlock,
        })
    }
}

fn skipped(attempt_id: AttemptId, reason: SkipReason) -> UnlockReport {
    UnlockReport {
        attempt_id,
        outcome: UnlockOutcome::Skipped(reason),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::FingerprintBuilder;
    use crate::gate::{AccessDecision, AttemptGate};
    use crate::memory::{MemoryAttemptDirectory, MemoryLockStore};
    use crate::store::{AttemptLock, ReleaseOutcome};
    use crate::types::RequestContext;
    use std::sync::Mutex;

    const SUPERVISOR: UserId = UserId(900);
    const STUDENT: UserId = UserId(7);

    #[derive(Default)]
    struct RecordingSink {
        events: Mutex<Vec<AccessEvent>>,
    }

    impl EventSink for RecordingSink {
        fn emit(&self, event: &AccessEvent) -> QuizlockResult<()> {
            self.events.lock().unwrap().push(event.clone());
            Ok(())
        }
    }

    /// Grants AllowChange to SUPERVISOR in quiz 1 only.
    struct QuizOnePolicy;

    impl AccessPolicy for QuizOnePolicy {
        fn has_capability(
            &self,
            user_id: UserId,
            quiz_id: QuizId,
            capability: Capability,
        ) -> QuizlockResult<bool> {
            Ok(user_id == SUPERVISOR && quiz_id == QuizId(1) && capability == Capability::AllowChange)
        }
    }

    fn record(id: i64, quiz: i64, status: AttemptStatus) -> AttemptRecord {
        AttemptRecord {
            attempt_id: AttemptId(id),
            quiz_id: QuizId(quiz),
            user_id: STUDENT,
            status,
            preview: false,
        }
    }

    fn lock(id: i64, quiz: i64) -> AttemptLock {
        AttemptLock {
            attempt_id: AttemptId(id),
            quiz_id: QuizId(quiz),
            session_hash: "00|11".into(),
        }
    }

    struct Fixture {
        store: MemoryLockStore,
        attempts: MemoryAttemptDirectory,
        sink: RecordingSink,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                store: MemoryLockStore::new(),
                attempts: MemoryAttemptDirectory::new(),
                sink: RecordingSink::default(),
            }
        }

        fn service(
            &self,
        ) -> UnlockService<&MemoryLockStore, &MemoryAttemptDirectory, QuizOnePolicy, &RecordingSink>
        {
            UnlockService::new(
                "oneconnection",
                &self.store,
                &self.attempts,
                QuizOnePolicy,
                &self.sink,
            )
        }
    }

    #[test]
    fn unlock_releases_lock_and_appends_audit() {
        let fx = Fixture::new();
        fx.attempts.insert(record(42, 1, AttemptStatus::InProgress)).unwrap();
        fx.store.create(&lock(42, 1)).unwrap();

        let report = fx.service().unlock(AttemptId(42), SUPERVISOR).unwrap();
        match report.outcome {
            UnlockOutcome::Unlocked {
                lock_removed,
                audit: Some(entry),
            } => {
                assert!(lock_removed);
                assert_eq!(entry.attempt_id, AttemptId(42));
                assert_eq!(entry.unlocked_by, SUPERVISOR);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert!(fx.store.get(AttemptId(42)).unwrap().is_none());

        let events = fx.sink.events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].name(), "attempt_unlocked");
    }

    #[test]
    fn unlock_twice_is_idempotent() {
        let fx = Fixture::new();
        fx.attempts.insert(record(42, 1, AttemptStatus::Overdue)).unwrap();
        fx.store.create(&lock(42, 1)).unwrap();
        let service = fx.service();

        let first = service.unlock(AttemptId(42), SUPERVISOR).unwrap();
        let second = service.unlock(AttemptId(42), SUPERVISOR).unwrap();
        assert!(first.succeeded() && second.succeeded());
        assert!(matches!(
            second.outcome,
            UnlockOutcome::Unlocked { lock_removed: false, .. }
        ));
        assert!(fx.store.get(AttemptId(42)).unwrap().is_none());
        assert_eq!(service.unlock_history(AttemptId(42)).unwrap().len(), 2);
    }

    #[test]
    fn unlock_without_capability_is_denied_and_changes_nothing() {
        let fx = Fixture::new();
        fx.attempts.insert(record(42, 1, AttemptStatus::InProgress)).unwrap();
        fx.store.create(&lock(42, 1)).unwrap();

        let err = fx.service().unlock(AttemptId(42), STUDENT).unwrap_err();
        assert!(matches!(err, QuizlockError::AuthorizationDenied { .. }));
        assert!(fx.store.get(AttemptId(42)).unwrap().is_some());
        assert!(fx.store.audit_entries().unwrap().is_empty());
    }

    #[test]
    fn finished_attempts_are_skipped() {
        let fx = Fixture::new();
        fx.attempts.insert(record(99, 1, AttemptStatus::Submitted)).unwrap();
        let report = fx.service().unlock(AttemptId(99), SUPERVISOR).unwrap();
        assert_eq!(
            report.outcome,
            UnlockOutcome::Skipped(SkipReason::Ineligible(AttemptStatus::Submitted))
        );
        assert!(fx.store.audit_entries().unwrap().is_empty());
    }

    #[test]
    fn unlock_many_counts_partial_success() {
        let fx = Fixture::new();
        fx.attempts.insert(record(42, 1, AttemptStatus::InProgress)).unwrap();
        fx.attempts.insert(record(99, 1, AttemptStatus::Submitted)).unwrap();
        fx.attempts.insert(record(50, 2, AttemptStatus::InProgress)).unwrap();
        fx.store.create(&lock(42, 1)).unwrap();
        fx.store.create(&lock(50, 2)).unwrap();

        let bulk = fx
            .service()
            .unlock_many(
                &[AttemptId(42), AttemptId(99), AttemptId(50), AttemptId(404)],
                SUPERVISOR,
            )
            .unwrap();

        assert_eq!(bulk.succeeded, 1);
        let skipped: Vec<_> = bulk.skipped().collect();
        assert_eq!(
            skipped,
            vec![
                (
                    AttemptId(99),
                    SkipReason::Ineligible(AttemptStatus::Submitted)
                ),
                (AttemptId(50), SkipReason::Unauthorized),
                (AttemptId(404), SkipReason::NotFound),
            ]
        );
        assert!(fx.store.get(AttemptId(42)).unwrap().is_none());
        assert!(fx.store.get(AttemptId(50)).unwrap().is_some());
    }

    #[test]
    fn report_lists_lock_state_and_last_unlock() {
        let fx = Fixture::new();
        fx.attempts.insert(record(1, 1, AttemptStatus::InProgress)).unwrap();
        fx.attempts.insert(record(2, 1, AttemptStatus::Finished)).unwrap();
        fx.attempts.insert(record(3, 1, AttemptStatus::InProgress)).unwrap();
        fx.store.create(&lock(1, 1)).unwrap();
        fx.store.create(&lock(3, 1)).unwrap();
        let service = fx.service();
        service.unlock(AttemptId(3), SUPERVISOR).unwrap();

        let rows = service.report(QuizId(1)).unwrap();
        assert_eq!(rows.len(), 3);
        assert!(rows[0].locked && rows[0].unlockable && rows[0].last_unlock.is_none());
        assert!(!rows[1].locked && !rows[1].unlockable);
        assert!(!rows[2].locked);
        assert_eq!(rows[2].last_unlock.as_ref().unwrap().unlocked_by, SUPERVISOR);

        assert!(matches!(
            service.status(AttemptId(404)).unwrap_err(),
            QuizlockError::AttemptNotFound(AttemptId(404))
        ));
    }

    #[test]
    fn erasure_only_touches_audit() {
        let fx = Fixture::new();
        fx.attempts.insert(record(1, 1, AttemptStatus::InProgress)).unwrap();
        let service = fx.service();
        service.unlock(AttemptId(1), SUPERVISOR).unwrap();
        fx.store.create(&lock(1, 1)).unwrap();

        assert_eq!(service.quizzes_with_audit_by(SUPERVISOR).unwrap(), vec![QuizId(1)]);
        assert_eq!(service.erase_audit_by_user(SUPERVISOR).unwrap(), 1);
        assert!(service.quizzes_with_audit_by(SUPERVISOR).unwrap().is_empty());
        assert!(fx.store.get(AttemptId(1)).unwrap().is_some());
    }

    /// Lock store whose release fails for one attempt.
    struct FailingRelease {
        inner: MemoryLockStore,
        broken: AttemptId,
    }

    impl LockStore for FailingRelease {
        fn get(&self, attempt_id: AttemptId) -> QuizlockResult<Option<AttemptLock>> {
            self.inner.get(attempt_id)
        }
        fn create(&self, lock: &AttemptLock) -> QuizlockResult<()> {
            self.inner.create(lock)
        }
        fn delete(&self, attempt_id: AttemptId) -> QuizlockResult<bool> {
            self.inner.delete(attempt_id)
        }
        fn delete_all_for_quiz(&self, quiz_id: QuizId) -> QuizlockResult<usize> {
            self.inner.delete_all_for_quiz(quiz_id)
        }
        fn release_and_record(
            &self,
            attempt_id: AttemptId,
            audit: &NewUnlockAudit,
        ) -> QuizlockResult<ReleaseOutcome> {
            if attempt_id == self.broken {
                return Err(QuizlockError::Storage("database is locked".into()));
            }
            self.inner.release_and_record(attempt_id, audit)
        }
        fn latest_unlock(&self, attempt_id: AttemptId) -> QuizlockResult<Option<UnlockAuditEntry>> {
            self.inner.latest_unlock(attempt_id)
        }
        fn unlock_history(&self, attempt_id: AttemptId) -> QuizlockResult<Vec<UnlockAuditEntry>> {
            self.inner.unlock_history(attempt_id)
        }
        fn quizzes_with_audit_by(&self, user_id: UserId) -> QuizlockResult<Vec<QuizId>> {
            self.inner.quizzes_with_audit_by(user_id)
        }
        fn erase_audit_by_user(&self, user_id: UserId) -> QuizlockResult<usize> {
            self.inner.erase_audit_by_user(user_id)
        }
        fn erase_audit_for_quiz(&self, quiz_id: QuizId) -> QuizlockResult<usize> {
            self.inner.erase_audit_for_quiz(quiz_id)
        }
    }

    #[test]
    fn storage_failure_aborts_unlock_without_event() {
        let attempts = MemoryAttemptDirectory::new();
        let sink = RecordingSink::default();
        let store = FailingRelease {
            inner: MemoryLockStore::new(),
            broken: AttemptId(2),
        };
        for id in 1..=3 {
            attempts.insert(record(id, 1, AttemptStatus::InProgress)).unwrap();
            store.create(&lock(id, 1)).unwrap();
        }
        let service = UnlockService::new("oneconnection", &store, &attempts, QuizOnePolicy, &sink);

        let err = service.unlock(AttemptId(2), SUPERVISOR).unwrap_err();
        assert_eq!(err.code(), "QL2000");
        assert!(store.get(AttemptId(2)).unwrap().is_some());
        assert!(sink.events.lock().unwrap().is_empty());

        let err = service
            .unlock_many(&[AttemptId(1), AttemptId(2), AttemptId(3)], SUPERVISOR)
            .unwrap_err();
        assert!(matches!(err, QuizlockError::Storage(_)));
        assert!(store.get(AttemptId(1)).unwrap().is_none());
        assert!(store.get(AttemptId(3)).unwrap().is_some());
        assert_eq!(sink.events.lock().unwrap().len(), 1);
        assert!(store.inner.unlock_history(AttemptId(3)).unwrap().is_empty());
    }

    #[test]
    fn blocked_learner_rebinds_after_unlock() {
        let fx = Fixture::new();
        let attempt = record(42, 1, AttemptStatus::InProgress);
        fx.attempts.insert(attempt.clone()).unwrap();
        let gate = AttemptGate::new(
            "oneconnection",
            QuizId(1),
            FingerprintBuilder::default(),
            &fx.store,
            &fx.sink,
        );
        let home = RequestContext::new(STUDENT, "S1").with_ip("IP1").with_user_agent("UA1");
        let laptop = RequestContext::new(STUDENT, "S1").with_ip("IP2").with_user_agent("UA1");

        assert_eq!(gate.check_access(&home, &attempt, false).unwrap(), AccessDecision::Pass);
        assert_eq!(
            gate.check_access(&laptop, &attempt, false).unwrap(),
            AccessDecision::RequiresBlockFlow
        );

        fx.service().unlock(AttemptId(42), SUPERVISOR).unwrap();
        assert_eq!(fx.store.unlock_history(AttemptId(42)).unwrap().len(), 1);

        assert_eq!(gate.check_access(&laptop, &attempt, false).unwrap(), AccessDecision::Pass);
        assert_eq!(
            gate.check_access(&home, &attempt, false).unwrap(),
            AccessDecision::RequiresBlockFlow
        );
    }
}
