//! Attempt gate: binds an attempt to the first client that opens it and
//! routes every later request to pass or to the block flow.

use crate::error::{QuizlockError, QuizlockResult};
use crate::events::{AccessEvent, EventSink};
use crate::fingerprint::{Fingerprint, FingerprintBuilder};
use crate::store::{now_seconds, AttemptLock, LockStore};
use crate::types::{AttemptId, AttemptRecord, QuizId, RequestContext};
use crate::validator::{generate_secret, seal, validate, OsSecretSource, SecretSource};
use log::{debug, info, warn};
use std::sync::Arc;

/// Message shown to a learner whose request was blocked.
pub const BLOCKED_MESSAGE: &str = "You are trying to access this quiz attempt from a different device or browser than the one you started with. If you need to switch devices, please contact the invigilator.";

/// Label of the supervisor entry point for releasing locks.
pub const MANAGE_LABEL: &str = "Allow connection changes";

/// Creation rounds before a request that keeps losing the insert race is
/// treated as a mismatch.
const CREATE_ROUNDS: usize = 2;

/// Outcome of an access check. A mismatch is a decision, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessDecision {
    Pass,
    RequiresBlockFlow,
}

impl AccessDecision {
    pub fn is_pass(&self) -> bool {
        matches!(self, AccessDecision::Pass)
    }
}

/// Where an authorised viewer can release locks for the quiz.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManageTarget {
    pub rule: String,
    pub quiz_id: QuizId,
    pub label: &'static str,
}

/// What the host renders in place of the attempt. Carries no continue or
/// retry action; the host must not offer one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockNotice {
    pub message: &'static str,
    pub manage: Option<ManageTarget>,
}

/// Attempt lifecycle notifications from the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptLifecycleEvent {
    Submitted(AttemptId),
    Abandoned(AttemptId),
    Deleted(AttemptId),
    /// Overdue attempts can still be resumed, so this never releases a lock.
    BecameOverdue(AttemptId),
}

impl AttemptLifecycleEvent {
    pub fn attempt_id(&self) -> AttemptId {
        match self {
            AttemptLifecycleEvent::Submitted(id)
            | AttemptLifecycleEvent::Abandoned(id)
            | AttemptLifecycleEvent::Deleted(id)
            | AttemptLifecycleEvent::BecameOverdue(id) => *id,
        }
    }

    pub fn releases_lock(&self) -> bool {
        !matches!(self, AttemptLifecycleEvent::BecameOverdue(_))
    }
}

/// Per-quiz gate over a lock store.
pub struct AttemptGate<S: LockStore, E: EventSink> {
    rule: String,
    quiz_id: QuizId,
    fingerprints: FingerprintBuilder,
    store: S,
    events: E,
    secrets: Arc<dyn SecretSource + Send + Sync>,
}

impl<S: LockStore, E: EventSink> AttemptGate<S, E> {
    pub fn new(
        rule: impl Into<String>,
        quiz_id: QuizId,
        fingerprints: FingerprintBuilder,
        store: S,
        events: E,
    ) -> Self {
        Self {
            rule: rule.into(),
            quiz_id,
            fingerprints,
            store,
            events,
            secrets: Arc::new(OsSecretSource),
        }
    }

    /// Replace the secret source (hardware RNG, deterministic test source).
    pub fn with_secret_source(mut self, secrets: Arc<dyn SecretSource + Send + Sync>) -> Self {
        self.secrets = secrets;
        self
    }

    /// Decide whether the request may continue `attempt`.
    ///
    /// Previews always pass and never touch the store. The first request
    /// for an unlocked attempt binds it. Later requests pass only when
    /// their fingerprint matches the binding; otherwise a blocked event is
    /// emitted and the caller must run the block flow.
    pub fn check_access(
        &self,
        ctx: &RequestContext,
        attempt: &AttemptRecord,
        is_previewer: bool,
    ) -> QuizlockResult<AccessDecision> {
        if is_previewer {
            debug!(
                "preview of attempt {} in quiz {} bypasses session binding",
                attempt.attempt_id, self.quiz_id
            );
            return Ok(AccessDecision::Pass);
        }

        let fingerprint = self.fingerprints.build(ctx);
        if self.bind_or_validate(attempt.attempt_id, &fingerprint)? {
            return Ok(AccessDecision::Pass);
        }

        warn!(
            "[QL3200] blocked attempt {} in quiz {}: request does not match the bound client",
            attempt.attempt_id, self.quiz_id
        );
        self.emit_blocked(ctx, attempt);
        Ok(AccessDecision::RequiresBlockFlow)
    }

    /// Whether a lock exists for the attempt and the request does not match
    /// it. Never creates a lock.
    pub fn is_blocked(&self, ctx: &RequestContext, attempt_id: AttemptId) -> QuizlockResult<bool> {
        match self.store.get(attempt_id)? {
            Some(lock) => Ok(!validate(&lock, &self.fingerprints.build(ctx))),
            None => Ok(false),
        }
    }

    /// Re-validate when the block screen is submitted. `Some` means the
    /// request is still blocked and the submission must be rejected.
    pub fn confirm_block(
        &self,
        ctx: &RequestContext,
        attempt_id: AttemptId,
        viewer_can_unlock: bool,
    ) -> QuizlockResult<Option<BlockNotice>> {
        if self.is_blocked(ctx, attempt_id)? {
            return Ok(Some(self.block_notice(viewer_can_unlock)));
        }
        Ok(None)
    }

    pub fn block_notice(&self, viewer_can_unlock: bool) -> BlockNotice {
        BlockNotice {
            message: BLOCKED_MESSAGE,
            manage: viewer_can_unlock.then(|| ManageTarget {
                rule: self.rule.clone(),
                quiz_id: self.quiz_id,
                label: MANAGE_LABEL,
            }),
        }
    }

    /// Release the lock when the attempt can no longer be resumed.
    /// Returns whether a lock was removed.
    pub fn on_attempt_event(&self, event: AttemptLifecycleEvent) -> QuizlockResult<bool> {
        if !event.releases_lock() {
            return Ok(false);
        }
        let removed = self.store.delete(event.attempt_id())?;
        if removed {
            info!(
                "released session lock for attempt {} after {:?}",
                event.attempt_id(),
                event
            );
        }
        Ok(removed)
    }

    /// Bind the attempt when unbound, otherwise validate against the
    /// binding. Losing the insert race falls through to validation against
    /// the winner.
    fn bind_or_validate(&self, attempt_id: AttemptId, fingerprint: &Fingerprint) -> QuizlockResult<bool> {
        for _ in 0..CREATE_ROUNDS {
            if let Some(lock) = self.store.get(attempt_id)? {
                return Ok(validate(&lock, fingerprint));
            }

            let secret = generate_secret(self.secrets.as_ref())?;
            let lock = AttemptLock {
                attempt_id,
                quiz_id: self.quiz_id,
                session_hash: seal(&secret, fingerprint)?,
            };

            match self.store.create(&lock) {
                Ok(()) => {
                    info!(
                        "bound attempt {} in quiz {} to its first client",
                        attempt_id, self.quiz_id
                    );
                    return Ok(true);
                }
                Err(QuizlockError::LockExists(_)) => {
                    debug!("attempt {attempt_id} was bound by a concurrent request");
                }
                Err(err) => return Err(err),
            }
        }

        warn!(
            "[QL3201] attempt {attempt_id} lock kept changing during bind; failing closed"
        );
        Ok(false)
    }

    fn emit_blocked(&self, ctx: &RequestContext, attempt: &AttemptRecord) {
        let event = AccessEvent::AttemptBlocked {
            rule: self.rule.clone(),
            attempt_id: attempt.attempt_id,
            quiz_id: self.quiz_id,
            related_user: attempt.user_id,
            requested_by: ctx.user_id,
            at: now_seconds(),
        };
        if let Err(err) = self.events.emit(&event) {
            warn!(
                "failed to emit {} for attempt {}: {err}",
                event.name(),
                attempt.attempt_id
            );
        }
    }
}
