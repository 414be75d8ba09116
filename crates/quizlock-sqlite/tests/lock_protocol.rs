use quizlock_core::config::AccessCfg;
use quizlock_core::events::{AccessEvent, EventSink};
use quizlock_core::fingerprint::{ExemptSubnets, FingerprintBuilder};
use quizlock_core::gate::{AccessDecision, AttemptGate, AttemptLifecycleEvent};
use quizlock_core::policy::ConfigAccessPolicy;
use quizlock_core::rule::{QuizAccessRule, RuleProfile, SessionBindingRule};
use quizlock_core::service::{SkipReason, UnlockOutcome, UnlockService};
use quizlock_core::store::{LockStore, NewUnlockAudit, QuizSettingsStore};
use quizlock_core::types::{AttemptId, AttemptRecord, AttemptStatus, QuizId, RequestContext, UserId};
use quizlock_core::{QuizlockError, QuizlockResult};
use quizlock_sqlite::{SqliteAttemptDirectory, SqliteLockStore};
use rusqlite::Connection;
use std::path::Path;
use std::sync::{Arc, Barrier, Mutex};
use std::thread;
use tempfile::tempdir;

const PREFIX: &str = "quizaccess_oneconnection";
const SUPERVISOR: UserId = UserId(900);
const LEARNER: UserId = UserId(7);

#[derive(Default)]
struct RecordingSink {
    events: Mutex<Vec<AccessEvent>>,
}

impl RecordingSink {
    fn names(&self) -> Vec<&'static str> {
        self.events.lock().unwrap().iter().map(|e| e.name()).collect()
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: &AccessEvent) -> QuizlockResult<()> {
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}

fn profile() -> RuleProfile {
    RuleProfile {
        name: "oneconnection".into(),
        table_prefix: PREFIX.into(),
        default_enabled: true,
        exempt: ExemptSubnets::default(),
    }
}

fn attempt(id: i64, status: AttemptStatus) -> AttemptRecord {
    AttemptRecord {
        attempt_id: AttemptId(id),
        quiz_id: QuizId(1),
        user_id: LEARNER,
        status,
        preview: false,
    }
}

fn ctx(ip: &str) -> RequestContext {
    RequestContext::new(LEARNER, "S1").with_ip(ip).with_user_agent("UA1")
}

fn policy() -> ConfigAccessPolicy {
    ConfigAccessPolicy::new(&AccessCfg {
        supervisors: vec![SUPERVISOR],
        editors: vec![SUPERVISOR],
    })
}

fn directory(db: &Path, attempts: &[AttemptRecord]) -> SqliteAttemptDirectory {
    let dir = SqliteAttemptDirectory::open(db).unwrap();
    dir.create_table().unwrap();
    for record in attempts {
        dir.record(record).unwrap();
    }
    dir
}

#[test]
fn block_unlock_and_rebind_end_to_end() {
    let tmp = tempdir().unwrap();
    let db = tmp.path().join("quizlock.db");
    let store = SqliteLockStore::open(&db, PREFIX).unwrap();
    let sink = RecordingSink::default();
    let rule = SessionBindingRule::new(profile(), store.clone(), &sink);
    assert!(rule.init_quiz_settings(QuizId(1)).unwrap());
    let running = attempt(42, AttemptStatus::InProgress);

    assert!(rule.check_access(&ctx("IP1"), &running).unwrap().is_pass());
    let bound = store.get(AttemptId(42)).unwrap().unwrap();
    assert!(rule.check_access(&ctx("IP1"), &running).unwrap().is_pass());
    assert_eq!(store.get(AttemptId(42)).unwrap().unwrap(), bound);

    assert_eq!(
        rule.check_access(&ctx("IP2"), &running).unwrap(),
        AccessDecision::RequiresBlockFlow
    );
    assert_eq!(sink.names(), vec!["attempt_blocked"]);

    let attempts = directory(&db, &[running.clone()]);
    let service = UnlockService::new("oneconnection", store.clone(), attempts, policy(), &sink);
    let report = service.unlock(AttemptId(42), SUPERVISOR).unwrap();
    match report.outcome {
        UnlockOutcome::Unlocked { lock_removed, audit } => {
            assert!(lock_removed);
            let audit = audit.unwrap();
            assert_eq!(audit.attempt_id, AttemptId(42));
            assert_eq!(audit.unlocked_by, SUPERVISOR);
        }
        other => panic!("unexpected outcome {other:?}"),
    }

    assert!(rule.check_access(&ctx("IP2"), &running).unwrap().is_pass());
    let rebound = store.get(AttemptId(42)).unwrap().unwrap();
    assert_ne!(rebound.session_hash, bound.session_hash);
    assert_eq!(
        rule.check_access(&ctx("IP1"), &running).unwrap(),
        AccessDecision::RequiresBlockFlow
    );
    assert_eq!(
        sink.names(),
        vec!["attempt_blocked", "attempt_unlocked", "attempt_blocked"]
    );
}

#[test]
fn bulk_unlock_skips_submitted_attempts() {
    let tmp = tempdir().unwrap();
    let db = tmp.path().join("quizlock.db");
    let store = SqliteLockStore::open(&db, PREFIX).unwrap();
    let sink = RecordingSink::default();
    let gate = AttemptGate::new(
        "oneconnection",
        QuizId(1),
        FingerprintBuilder::default(),
        &store,
        &sink,
    );
    gate.check_access(&ctx("IP1"), &attempt(42, AttemptStatus::InProgress), false)
        .unwrap();
    gate.check_access(&ctx("IP1"), &attempt(99, AttemptStatus::InProgress), false)
        .unwrap();

    let attempts = directory(
        &db,
        &[
            attempt(42, AttemptStatus::InProgress),
            attempt(99, AttemptStatus::Submitted),
        ],
    );
    let service = UnlockService::new("oneconnection", &store, attempts, policy(), &sink);
    let bulk = service
        .unlock_many(&[AttemptId(42), AttemptId(99)], SUPERVISOR)
        .unwrap();

    assert_eq!(bulk.succeeded, 1);
    assert!(store.get(AttemptId(42)).unwrap().is_none());
    assert!(store.get(AttemptId(99)).unwrap().is_some());
    assert_eq!(
        bulk.skipped().collect::<Vec<_>>(),
        vec![(AttemptId(99), SkipReason::Ineligible(AttemptStatus::Submitted))]
    );
    assert!(store.unlock_history(AttemptId(99)).unwrap().is_empty());
}

#[test]
fn concurrent_first_access_across_connections_binds_once() {
    for round in 0..8 {
        let tmp = tempdir().unwrap();
        let db = tmp.path().join("quizlock.db");
        SqliteLockStore::open(&db, PREFIX).unwrap();

        let barrier = Arc::new(Barrier::new(2));
        let handles: Vec<_> = ["IP1", "IP2"]
            .into_iter()
            .map(|ip| {
                let db = db.clone();
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    let store = SqliteLockStore::open(&db, PREFIX).unwrap();
                    let sink = RecordingSink::default();
                    let gate = AttemptGate::new(
                        "oneconnection",
                        QuizId(1),
                        FingerprintBuilder::default(),
                        &store,
                        &sink,
                    );
                    barrier.wait();
                    gate.check_access(&ctx(ip), &attempt(42, AttemptStatus::InProgress), false)
                        .unwrap()
                })
            })
            .collect();

        let passes = handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .filter(AccessDecision::is_pass)
            .count();
        assert_eq!(passes, 1, "round {round}");
    }
}

#[test]
fn missing_audit_table_rolls_back_unless_tolerated() {
    let tmp = tempdir().unwrap();
    let db = tmp.path().join("legacy.db");
    let store = SqliteLockStore::open(&db, PREFIX).unwrap();
    store
        .create(&quizlock_core::store::AttemptLock {
            attempt_id: AttemptId(5),
            quiz_id: QuizId(1),
            session_hash: "00|11".into(),
        })
        .unwrap();

    Connection::open(&db)
        .unwrap()
        .execute_batch(&format!("DROP TABLE {PREFIX}_log"))
        .unwrap();

    let audit = NewUnlockAudit::now(QuizId(1), AttemptId(5), SUPERVISOR);
    let err = store.release_and_record(AttemptId(5), &audit).unwrap_err();
    assert!(matches!(err, QuizlockError::AuditUnavailable(_)));
    assert!(store.get(AttemptId(5)).unwrap().is_some());

    let legacy = store.clone().tolerate_missing_audit_table(true);
    let outcome = legacy.release_and_record(AttemptId(5), &audit).unwrap();
    assert!(outcome.lock_removed);
    assert!(outcome.audit.is_none());
    assert!(legacy.get(AttemptId(5)).unwrap().is_none());
    assert!(legacy.latest_unlock(AttemptId(5)).unwrap().is_none());
}

#[test]
fn terminal_events_and_quiz_lifecycle() {
    let store = SqliteLockStore::memory(PREFIX).unwrap();
    let rule = SessionBindingRule::new(profile(), store.clone(), RecordingSink::default());
    assert!(!rule.is_applicable(QuizId(1)).unwrap());
    rule.init_quiz_settings(QuizId(1)).unwrap();
    assert_eq!(store.quiz_enabled(QuizId(1)).unwrap(), Some(true));

    rule.check_access(&ctx("IP1"), &attempt(1, AttemptStatus::InProgress))
        .unwrap();
    rule.check_access(&ctx("IP1"), &attempt(2, AttemptStatus::InProgress))
        .unwrap();

    assert!(!rule
        .on_attempt_terminal(AttemptLifecycleEvent::BecameOverdue(AttemptId(1)))
        .unwrap());
    assert!(rule
        .on_attempt_terminal(AttemptLifecycleEvent::Submitted(AttemptId(1)))
        .unwrap());
    assert!(store.get(AttemptId(1)).unwrap().is_none());

    rule.set_quiz_enabled(QuizId(1), false, SUPERVISOR, &policy()).unwrap();
    assert!(store.get(AttemptId(2)).unwrap().is_none());
    assert!(!rule.is_applicable(QuizId(1)).unwrap());

    rule.delete_quiz(QuizId(1)).unwrap();
    assert_eq!(store.quiz_enabled(QuizId(1)).unwrap(), None);
    assert!(!rule.is_applicable(QuizId(1)).unwrap());
    assert!(rule
        .check_access(&ctx("IP2"), &attempt(3, AttemptStatus::InProgress))
        .unwrap()
        .is_pass());
    assert!(store.get(AttemptId(3)).unwrap().is_none());
}
