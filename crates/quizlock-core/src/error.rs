use crate::types::{AttemptId, QuizId, UserId};
use thiserror::Error;

/// Result alias for core operations.
pub type QuizlockResult<T> = Result<T, QuizlockError>;

#[derive(Error, Debug)]
pub enum QuizlockError {
    #[error("[QL1000] io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("[QL1001] toml config parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("[QL1002] yaml config parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("[QL1100] configuration error: {0}")]
    InvalidConfig(String),

    #[error("[QL1101] invalid subnet entry `{entry}`: {reason}")]
    InvalidSubnet { entry: String, reason: String },

    #[error("[QL2000] storage error: {0}")]
    Storage(String),

    #[error("[QL2001] attempt {0} already holds a session lock")]
    LockExists(AttemptId),

    #[error("[QL2002] unlock audit log unavailable: {0}")]
    AuditUnavailable(String),

    #[error("[QL3000] user {user} may not change session locks in quiz {quiz}")]
    AuthorizationDenied { user: UserId, quiz: QuizId },

    #[error("[QL3100] secure random source failed: {0}")]
    Entropy(String),

    #[error("[QL4000] attempt {0} not found")]
    AttemptNotFound(AttemptId),
}

impl QuizlockError {
    pub fn code(&self) -> &'static str {
        match self {
            QuizlockError::Io(_) => "QL1000",
            QuizlockError::Toml(_) => "QL1001",
            QuizlockError::Yaml(_) => "QL1002",
            QuizlockError::InvalidConfig(_) => "QL1100",
            QuizlockError::InvalidSubnet { .. } => "QL1101",
            QuizlockError::Storage(_) => "QL2000",
            QuizlockError::LockExists(_) => "QL2001",
            QuizlockError::AuditUnavailable(_) => "QL2002",
            QuizlockError::AuthorizationDenied { .. } => "QL3000",
            QuizlockError::Entropy(_) => "QL3100",
            QuizlockError::AttemptNotFound(_) => "QL4000",
        }
    }
}
