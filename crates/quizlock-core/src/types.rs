//! Identifiers and records shared across the lock protocol.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema,
        )]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<i64> for $name {
            fn from(value: i64) -> Self {
                Self(value)
            }
        }
    };
}

id_type!(
    /// Identifier of one learner's attempt at a quiz.
    AttemptId
);
id_type!(
    /// Identifier of a quiz.
    QuizId
);
id_type!(
    /// Identifier of a platform user (learner or supervisor).
    UserId
);

/// Lifecycle state of an attempt, as reported by the host platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttemptStatus {
    NotStarted,
    InProgress,
    Overdue,
    Finished,
    Submitted,
    Abandoned,
}

impl AttemptStatus {
    /// Host-side state string.
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptStatus::NotStarted => "notstarted",
            AttemptStatus::InProgress => "inprogress",
            AttemptStatus::Overdue => "overdue",
            AttemptStatus::Finished => "finished",
            AttemptStatus::Submitted => "submitted",
            AttemptStatus::Abandoned => "abandoned",
        }
    }

    /// Only attempts that can still be resumed are worth unlocking.
    pub fn is_unlockable(&self) -> bool {
        matches!(self, AttemptStatus::InProgress | AttemptStatus::Overdue)
    }

    /// Human readable label used in reports.
    pub fn label(&self) -> &'static str {
        match self {
            AttemptStatus::NotStarted => "Not started",
            AttemptStatus::InProgress => "In progress",
            AttemptStatus::Overdue => "Overdue",
            AttemptStatus::Finished => "Finished",
            AttemptStatus::Submitted => "Submitted",
            AttemptStatus::Abandoned => "Never submitted",
        }
    }
}

impl fmt::Display for AttemptStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AttemptStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "notstarted" => Ok(AttemptStatus::NotStarted),
            "inprogress" => Ok(AttemptStatus::InProgress),
            "overdue" => Ok(AttemptStatus::Overdue),
            "finished" => Ok(AttemptStatus::Finished),
            "submitted" => Ok(AttemptStatus::Submitted),
            "abandoned" => Ok(AttemptStatus::Abandoned),
            other => Err(format!("unknown attempt state `{other}`")),
        }
    }
}

/// Attempt metadata supplied by the host's attempt directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptRecord {
    pub attempt_id: AttemptId,
    pub quiz_id: QuizId,
    pub user_id: UserId,
    pub status: AttemptStatus,
    pub preview: bool,
}

/// Per-request client context, passed explicitly into every gate call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    pub session_key: String,
    pub client_ip: Option<String>,
    pub user_agent: Option<String>,
    pub user_id: UserId,
}

impl RequestContext {
    pub fn new(user_id: UserId, session_key: impl Into<String>) -> Self {
        Self {
            session_key: session_key.into(),
            client_ip: None,
            user_agent: None,
            user_id,
        }
    }

    pub fn with_ip(mut self, ip: impl Into<String>) -> Self {
        self.client_ip = Some(ip.into());
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }
}
