pub mod config;
pub mod error;
pub mod events;
pub mod fingerprint;
pub mod gate;
pub mod logging;
pub mod memory;
pub mod policy;
pub mod rule;
pub mod service;
pub mod store;
pub mod types;
pub mod validator;

pub use config::{AccessCfg, QuizlockConfig, RuleProfileCfg, StorageCfg};
pub use error::{QuizlockError, QuizlockResult};
pub use events::{AccessEvent, EventSink, LogEventSink};
pub use fingerprint::{build_fingerprint, ExemptSubnets, Fingerprint, FingerprintBuilder};
pub use gate::{AccessDecision, AttemptGate, AttemptLifecycleEvent, BlockNotice, ManageTarget};
pub use memory::{MemoryAttemptDirectory, MemoryLockStore};
pub use policy::{AccessPolicy, Capability, ConfigAccessPolicy};
pub use rule::{QuizAccessRule, RuleProfile, RuleRegistry, SessionBindingRule};
pub use service::{
    AttemptLockSummary, BulkUnlockReport, SkipReason, UnlockOutcome, UnlockReport, UnlockService,
};
pub use store::{
    AttemptDirectory, AttemptLock, LockStore, NewUnlockAudit, QuizSettingsStore, ReleaseOutcome,
    UnlockAuditEntry,
};
pub use types::{AttemptId, AttemptRecord, AttemptStatus, QuizId, RequestContext, UserId};
pub use validator::{OsSecretSource, SecretSource};
