//! In-process store and attempt directory, for tests and single-process hosts.

use crate::error::{QuizlockError, QuizlockResult};
use crate::store::{
    AttemptDirectory, AttemptLock, LockStore, NewUnlockAudit, QuizSettingsStore, ReleaseOutcome,
    UnlockAuditEntry,
};
use crate::types::{AttemptId, AttemptRecord, QuizId, UserId};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

#[derive(Default)]
struct State {
    locks: HashMap<AttemptId, AttemptLock>,
    audit: Vec<UnlockAuditEntry>,
    next_audit_id: i64,
    settings: HashMap<QuizId, bool>,
}

/// `LockStore` + `QuizSettingsStore` kept behind a single mutex, so every
/// operation (including release-and-record) is atomic.
#[derive(Default)]
pub struct MemoryLockStore {
    state: Mutex<State>,
}

impl MemoryLockStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> QuizlockResult<MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| QuizlockError::Storage("memory store mutex poisoned".into()))
    }

    /// Number of locks currently held.
    pub fn lock_count(&self) -> QuizlockResult<usize> {
        Ok(self.state()?.locks.len())
    }

    /// Every audit entry, oldest first.
    pub fn audit_entries(&self) -> QuizlockResult<Vec<UnlockAuditEntry>> {
        Ok(self.state()?.audit.clone())
    }
}

impl LockStore for MemoryLockStore {
    fn get(&self, attempt_id: AttemptId) -> QuizlockResult<Option<AttemptLock>> {
        Ok(self.state()?.locks.get(&attempt_id).cloned())
    }

    fn create(&self, lock: &AttemptLock) -> QuizlockResult<()> {
        let mut state = self.state()?;
        if state.locks.contains_key(&lock.attempt_id) {
            return Err(QuizlockError::LockExists(lock.attempt_id));
        }
        state.locks.insert(lock.attempt_id, lock.clone());
        Ok(())
    }

    fn delete(&self, attempt_id: AttemptId) -> QuizlockResult<bool> {
        Ok(self.state()?.locks.remove(&attempt_id).is_some())
    }

    fn delete_all_for_quiz(&self, quiz_id: QuizId) -> QuizlockResult<usize> {
        let mut state = self.state()?;
        let before = state.locks.len();
        state.locks.retain(|_, lock| lock.quiz_id != quiz_id);
        Ok(before - state.locks.len())
    }

    fn release_and_record(
        &self,
        attempt_id: AttemptId,
        audit: &NewUnlockAudit,
    ) -> QuizlockResult<ReleaseOutcome> {
        let mut state = self.state()?;
        let lock_removed = state.locks.remove(&attempt_id).is_some();
        state.next_audit_id += 1;
        let entry = audit.clone().with_id(state.next_audit_id);
        state.audit.push(entry.clone());
        Ok(ReleaseOutcome {
            lock_removed,
            audit: Some(entry),
        })
    }

    fn latest_unlock(&self, attempt_id: AttemptId) -> QuizlockResult<Option<UnlockAuditEntry>> {
        Ok(self
            .state()?
            .audit
            .iter()
            .rev()
            .find(|entry| entry.attempt_id == attempt_id)
            .cloned())
    }

    fn unlock_history(&self, attempt_id: AttemptId) -> QuizlockResult<Vec<UnlockAuditEntry>> {
        Ok(self
            .state()?
            .audit
            .iter()
            .filter(|entry| entry.attempt_id == attempt_id)
            .cloned()
            .collect())
    }

    fn quizzes_with_audit_by(&self, user_id: UserId) -> QuizlockResult<Vec<QuizId>> {
        let mut quizzes: Vec<QuizId> = self
            .state()?
            .audit
            .iter()
            .filter(|entry| entry.unlocked_by == user_id)
            .map(|entry| entry.quiz_id)
            .collect();
        quizzes.sort();
        quizzes.dedup();
        Ok(quizzes)
    }

    fn erase_audit_by_user(&self, user_id: UserId) -> QuizlockResult<usize> {
        let mut state = self.state()?;
        let before = state.audit.len();
        state.audit.retain(|entry| entry.unlocked_by != user_id);
        Ok(before - state.audit.len())
    }

    fn erase_audit_for_quiz(&self, quiz_id: QuizId) -> QuizlockResult<usize> {
        let mut state = self.state()?;
        let before = state.audit.len();
        state.audit.retain(|entry| entry.quiz_id != quiz_id);
        Ok(before - state.audit.len())
    }
}

impl QuizSettingsStore for MemoryLockStore {
    fn quiz_enabled(&self, quiz_id: QuizId) -> QuizlockResult<Option<bool>> {
        Ok(self.state()?.settings.get(&quiz_id).copied())
    }

    fn set_quiz_enabled(&self, quiz_id: QuizId, enabled: bool) -> QuizlockResult<()> {
        self.state()?.settings.insert(quiz_id, enabled);
        Ok(())
    }

    fn delete_quiz_settings(&self, quiz_id: QuizId) -> QuizlockResult<()> {
        self.state()?.settings.remove(&quiz_id);
        Ok(())
    }
}

/// Attempt directory backed by a map; hosts push state changes into it.
#[derive(Default)]
pub struct MemoryAttemptDirectory {
    attempts: Mutex<BTreeMap<AttemptId, AttemptRecord>>,
}

impl MemoryAttemptDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    fn attempts(&self) -> QuizlockResult<MutexGuard<'_, BTreeMap<AttemptId, AttemptRecord>>> {
        self.attempts
            .lock()
            .map_err(|_| QuizlockError::Storage("attempt directory mutex poisoned".into()))
    }

    pub fn insert(&self, record: AttemptRecord) -> QuizlockResult<()> {
        self.attempts()?.insert(record.attempt_id, record);
        Ok(())
    }
}

impl AttemptDirectory for MemoryAttemptDirectory {
    fn attempt(&self, attempt_id: AttemptId) -> QuizlockResult<Option<AttemptRecord>> {
        Ok(self.attempts()?.get(&attempt_id).cloned())
    }

    fn attempts_for_quiz(&self, quiz_id: QuizId) -> QuizlockResult<Vec<AttemptRecord>> {
        Ok(self
            .attempts()?
            .values()
            .filter(|record| record.quiz_id == quiz_id)
            .cloned()
            .collect())
    }
}
