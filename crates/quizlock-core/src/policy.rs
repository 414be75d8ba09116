//! Capability checks consumed from the host's identity layer.

use crate::config::AccessCfg;
use crate::error::QuizlockResult;
use crate::types::{QuizId, UserId};

/// Capabilities the lock protocol asks about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    /// Release a learner's session lock.
    AllowChange,
    /// Turn the rule on or off for a quiz.
    EditEnabled,
}

/// Answers capability questions in the scope of a quiz.
pub trait AccessPolicy {
    fn has_capability(
        &self,
        user_id: UserId,
        quiz_id: QuizId,
        capability: Capability,
    ) -> QuizlockResult<bool>;
}

/// Policy driven by the `[access]` configuration section.
#[derive(Debug, Clone, Default)]
pub struct ConfigAccessPolicy {
    supervisors: Vec<UserId>,
    editors: Vec<UserId>,
}

impl ConfigAccessPolicy {
    pub fn new(cfg: &AccessCfg) -> Self {
        Self {
            supervisors: cfg.supervisors.clone(),
            editors: cfg.editors.clone(),
        }
    }
}

impl AccessPolicy for ConfigAccessPolicy {
    fn has_capability(
        &self,
        user_id: UserId,
        _quiz_id: QuizId,
        capability: Capability,
    ) -> QuizlockResult<bool> {
        let holders = match capability {
            Capability::AllowChange => &self.supervisors,
            Capability::EditEnabled => &self.editors,
        };
        Ok(holders.contains(&user_id))
    }
}

impl<T: AccessPolicy + ?Sized> AccessPolicy for &T {
    fn has_capability(
        &self,
        user_id: UserId,
        quiz_id: QuizId,
        capability: Capability,
    ) -> QuizlockResult<bool> {
        (**self).has_capability(user_id, quiz_id, capability)
    }
}
