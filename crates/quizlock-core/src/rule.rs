//! Quiz access rule interface and the session-binding rule built on it.
//!
//! Rules are registered explicitly at startup. The session-binding rule is
//! implemented once and deployed per profile (`oneconnection`,
//! `onesession`), each profile owning its own store namespace.

use crate::config::RuleProfileCfg;
use crate::error::{QuizlockError, QuizlockResult};
use crate::events::EventSink;
use crate::fingerprint::{ExemptSubnets, FingerprintBuilder};
use crate::gate::{AccessDecision, AttemptGate, AttemptLifecycleEvent, MANAGE_LABEL};
use crate::policy::{AccessPolicy, Capability};
use crate::store::{LockStore, QuizSettingsStore};
use crate::types::{AttemptRecord, QuizId, RequestContext, UserId};
use crate::validator::{OsSecretSource, SecretSource};
use log::info;
use std::sync::Arc;

/// Notice shown on the quiz page while the rule is active.
pub const STUDENT_INFO: &str = "Attention! It is prohibited to change device while attempting this quiz. Please note that after beginning of quiz attempt any connections to this quiz using other computers, devices and browsers will be blocked. Do not close the browser window until the end of attempt, otherwise you will not be able to complete this quiz.";

/// Runtime form of a configured rule profile.
#[derive(Debug, Clone)]
pub struct RuleProfile {
    pub name: String,
    pub table_prefix: String,
    pub default_enabled: bool,
    pub exempt: ExemptSubnets,
}

impl RuleProfile {
    pub fn from_cfg(cfg: &RuleProfileCfg) -> QuizlockResult<Self> {
        Ok(Self {
            name: cfg.name.clone(),
            table_prefix: cfg.table_prefix(),
            default_enabled: cfg.default_enabled,
            exempt: ExemptSubnets::parse(&cfg.exempt_subnets)?,
        })
    }
}

/// Capability surface every access rule offers the host.
pub trait QuizAccessRule {
    fn name(&self) -> &str;

    /// Whether the rule is active for the quiz.
    fn is_applicable(&self, quiz_id: QuizId) -> QuizlockResult<bool>;

    fn check_access(
        &self,
        ctx: &RequestContext,
        attempt: &AttemptRecord,
    ) -> QuizlockResult<AccessDecision>;

    /// React to an attempt lifecycle event. Returns whether state changed.
    fn on_attempt_terminal(&self, event: AttemptLifecycleEvent) -> QuizlockResult<bool>;

    /// Lines for the quiz description shown before an attempt.
    fn describe(&self, quiz_id: QuizId, viewer_can_unlock: bool) -> Vec<String>;
}

/// Session-binding rule over one profile's store.
pub struct SessionBindingRule<S, E>
where
    S: LockStore + QuizSettingsStore,
    E: EventSink,
{
    profile: RuleProfile,
    store: S,
    events: E,
    secrets: Arc<dyn SecretSource + Send + Sync>,
}

impl<S, E> SessionBindingRule<S, E>
where
    S: LockStore + QuizSettingsStore,
    E: EventSink,
{
    pub fn new(profile: RuleProfile, store: S, events: E) -> Self {
        Self {
            profile,
            store,
            events,
            secrets: Arc::new(OsSecretSource),
        }
    }

    pub fn with_secret_source(mut self, secrets: Arc<dyn SecretSource + Send + Sync>) -> Self {
        self.secrets = secrets;
        self
    }

    pub fn profile(&self) -> &RuleProfile {
        &self.profile
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Gate for one quiz, borrowing this rule's store and sink.
    pub fn gate(&self, quiz_id: QuizId) -> AttemptGate<&S, &E> {
        AttemptGate::new(
            self.profile.name.clone(),
            quiz_id,
            FingerprintBuilder::new(self.profile.exempt.clone()),
            &self.store,
            &self.events,
        )
        .with_secret_source(Arc::clone(&self.secrets))
    }

    /// Persist the quiz's enable flag. Disabling drops every lock the quiz
    /// holds so re-enabling starts from a clean slate.
    pub fn set_quiz_enabled<P: AccessPolicy>(
        &self,
        quiz_id: QuizId,
        enabled: bool,
        actor: UserId,
        policy: &P,
    ) -> QuizlockResult<()> {
        if !policy.has_capability(actor, quiz_id, Capability::EditEnabled)? {
            return Err(QuizlockError::AuthorizationDenied {
                user: actor,
                quiz: quiz_id,
            });
        }

        self.store.set_quiz_enabled(quiz_id, enabled)?;
        if !enabled {
            let dropped = self.store.delete_all_for_quiz(quiz_id)?;
            info!(
                "{} disabled for quiz {quiz_id} by user {actor}; dropped {dropped} locks",
                self.profile.name
            );
        } else {
            info!("{} enabled for quiz {quiz_id} by user {actor}", self.profile.name);
        }
        Ok(())
    }

    /// Seed the settings row of a newly configured quiz with the profile's
    /// `default_enabled`. An existing row is left alone. Returns the flag the
    /// quiz ends up with.
    pub fn init_quiz_settings(&self, quiz_id: QuizId) -> QuizlockResult<bool> {
        if let Some(enabled) = self.store.quiz_enabled(quiz_id)? {
            return Ok(enabled);
        }
        let enabled = self.profile.default_enabled;
        self.store.set_quiz_enabled(quiz_id, enabled)?;
        info!(
            "{} settings created for quiz {quiz_id} (enabled: {enabled})",
            self.profile.name
        );
        Ok(enabled)
    }

    /// Remove everything the rule stored about a deleted quiz.
    pub fn delete_quiz(&self, quiz_id: QuizId) -> QuizlockResult<()> {
        self.store.delete_quiz_settings(quiz_id)?;
        let locks = self.store.delete_all_for_quiz(quiz_id)?;
        let audit = self.store.erase_audit_for_quiz(quiz_id)?;
        info!(
            "{} removed quiz {quiz_id}: {locks} locks, {audit} audit entries",
            self.profile.name
        );
        Ok(())
    }
}

impl<S, E> QuizAccessRule for SessionBindingRule<S, E>
where
    S: LockStore + QuizSettingsStore,
    E: EventSink,
{
    fn name(&self) -> &str {
        &self.profile.name
    }

    /// A quiz without a settings row is not protected.
    fn is_applicable(&self, quiz_id: QuizId) -> QuizlockResult<bool> {
        Ok(self.store.quiz_enabled(quiz_id)?.unwrap_or(false))
    }

    fn check_access(
        &self,
        ctx: &RequestContext,
        attempt: &AttemptRecord,
    ) -> QuizlockResult<AccessDecision> {
        if !self.is_applicable(attempt.quiz_id)? {
            return Ok(AccessDecision::Pass);
        }
        self.gate(attempt.quiz_id)
            .check_access(ctx, attempt, attempt.preview)
    }

    fn on_attempt_terminal(&self, event: AttemptLifecycleEvent) -> QuizlockResult<bool> {
        if !event.releases_lock() {
            return Ok(false);
        }
        let removed = self.store.delete(event.attempt_id())?;
        if removed {
            info!(
                "{} released attempt {} after {:?}",
                self.profile.name,
                event.attempt_id(),
                event
            );
        }
        Ok(removed)
    }

    fn describe(&self, _quiz_id: QuizId, viewer_can_unlock: bool) -> Vec<String> {
        let mut lines = vec![STUDENT_INFO.to_string()];
        if viewer_can_unlock {
            lines.push(MANAGE_LABEL.to_string());
        }
        lines
    }
}

/// Rules registered for the host, consulted in registration order.
#[derive(Default)]
pub struct RuleRegistry {
    rules: Vec<Box<dyn QuizAccessRule>>,
}

impl RuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, rule: Box<dyn QuizAccessRule>) -> QuizlockResult<()> {
        if self.rules.iter().any(|existing| existing.name() == rule.name()) {
            return Err(QuizlockError::InvalidConfig(format!(
                "rule `{}` registered twice",
                rule.name()
            )));
        }
        info!("registered access rule {}", rule.name());
        self.rules.push(rule);
        Ok(())
    }

    pub fn names(&self) -> Vec<&str> {
        self.rules.iter().map(|rule| rule.name()).collect()
    }

    pub fn get(&self, name: &str) -> Option<&dyn QuizAccessRule> {
        self.rules
            .iter()
            .find(|rule| rule.name() == name)
            .map(|rule| rule.as_ref())
    }

    /// Every rule is consulted; any block wins.
    pub fn check_access(
        &self,
        ctx: &RequestContext,
        attempt: &AttemptRecord,
    ) -> QuizlockResult<AccessDecision> {
        let mut decision = AccessDecision::Pass;
        for rule in &self.rules {
            if rule.check_access(ctx, attempt)? == AccessDecision::RequiresBlockFlow {
                decision = AccessDecision::RequiresBlockFlow;
            }
        }
        Ok(decision)
    }

    /// Fan a lifecycle event out to every rule; returns how many changed state.
    pub fn on_attempt_terminal(&self, event: AttemptLifecycleEvent) -> QuizlockResult<usize> {
        let mut changed = 0;
        for rule in &self.rules {
            if rule.on_attempt_terminal(event)? {
                changed += 1;
            }
        }
        Ok(changed)
    }

    pub fn describe(&self, quiz_id: QuizId, viewer_can_unlock: bool) -> QuizlockResult<Vec<String>> {
        let mut lines = Vec::new();
        for rule in &self.rules {
            if rule.is_applicable(quiz_id)? {
                lines.extend(rule.describe(quiz_id, viewer_can_unlock));
            }
        }
        Ok(lines)
    }
}
