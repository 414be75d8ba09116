//! SQLite-backed `LockStore` and `QuizSettingsStore` for one rule profile.

use crate::schema::{init_connection, is_missing_table, is_unique_violation, storage, TableNames};
use chrono::{DateTime, Utc};
use log::{debug, warn};
use quizlock_core::config::QuizlockConfig;
use quizlock_core::error::{QuizlockError, QuizlockResult};
use quizlock_core::rule::RuleProfile;
use quizlock_core::store::{
    AttemptLock, LockStore, NewUnlockAudit, QuizSettingsStore, ReleaseOutcome, UnlockAuditEntry,
};
use quizlock_core::types::{AttemptId, QuizId, UserId};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

/// Lock, audit and settings tables of one profile in a SQLite database.
#[derive(Clone)]
pub struct SqliteLockStore {
    conn: Arc<Mutex<Connection>>,
    tables: TableNames,
    tolerate_missing_audit_table: bool,
}

impl SqliteLockStore {
    /// Open a file-backed store, creating the profile's tables if needed.
    pub fn open(path: &Path, table_prefix: &str) -> QuizlockResult<Self> {
        let conn = Connection::open(path).map_err(storage)?;
        Self::from_connection(conn, table_prefix)
    }

    /// In-memory store, mostly for tests.
    pub fn memory(table_prefix: &str) -> QuizlockResult<Self> {
        let conn = Connection::open_in_memory().map_err(storage)?;
        Self::from_connection(conn, table_prefix)
    }

    pub fn from_connection(conn: Connection, table_prefix: &str) -> QuizlockResult<Self> {
        let tables = TableNames::for_prefix(table_prefix)?;
        init_connection(&conn, &tables)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            tables,
            tolerate_missing_audit_table: false,
        })
    }

    /// Store for `profile` in the configured database.
    pub fn from_config(config: &QuizlockConfig, profile: &RuleProfile) -> QuizlockResult<Self> {
        let store = Self::open(&config.database_path(), &profile.table_prefix)?;
        Ok(store.tolerate_missing_audit_table(config.storage.tolerate_missing_audit_table))
    }

    /// Let unlocks proceed without an audit row when the audit table is gone.
    pub fn tolerate_missing_audit_table(mut self, tolerate: bool) -> Self {
        self.tolerate_missing_audit_table = tolerate;
        self
    }

    /// Nothing to erase when the audit table was never created.
    fn erase_audit(&self, filter: &str, key: i64) -> QuizlockResult<usize> {
        let conn = self.conn()?;
        match conn.execute(
            &format!("DELETE FROM {} WHERE {filter}", self.tables.audit),
            [key],
        ) {
            Ok(erased) => Ok(erased),
            Err(err) if is_missing_table(&err) => Ok(0),
            Err(err) => Err(storage(err)),
        }
    }

    fn conn(&self) -> QuizlockResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| QuizlockError::Storage("sqlite connection mutex poisoned".into()))
    }

    fn release_inner(
        &self,
        conn: &Connection,
        attempt_id: AttemptId,
        audit: &NewUnlockAudit,
    ) -> QuizlockResult<ReleaseOutcome> {
        let removed = conn
            .execute(
                &format!("DELETE FROM {} WHERE attemptid = ?1", self.tables.locks),
                [attempt_id.0],
            )
            .map_err(storage)?;

        let inserted = conn.execute(
            &format!(
                "INSERT INTO {} (quizid, attemptid, unlockedby, timeunlocked) VALUES (?1, ?2, ?3, ?4)",
                self.tables.audit
            ),
            params![
                audit.quiz_id.0,
                audit.attempt_id.0,
                audit.unlocked_by.0,
                audit.unlocked_at.timestamp()
            ],
        );

        let audit = match inserted {
            Ok(_) => Some(audit.clone().with_id(conn.last_insert_rowid())),
            Err(err) if is_missing_table(&err) && self.tolerate_missing_audit_table => {
                warn!(
                    "[QL2002] audit table {} missing; unlock of attempt {attempt_id} not recorded",
                    self.tables.audit
                );
                None
            }
            Err(err) if is_missing_table(&err) => {
                return Err(QuizlockError::AuditUnavailable(err.to_string()));
            }
            Err(err) => return Err(storage(err)),
        };

        Ok(ReleaseOutcome {
            lock_removed: removed > 0,
            audit,
        })
    }

    fn audit_query(&self, filter: &str) -> String {
        format!(
            "SELECT id, quizid, attemptid, unlockedby, timeunlocked FROM {} WHERE {filter} ORDER BY id",
            self.tables.audit
        )
    }
}

fn audit_from_row(row: &Row<'_>) -> rusqlite::Result<(i64, i64, i64, i64, i64)> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
}

fn audit_entry(
    (id, quiz, attempt, user, at): (i64, i64, i64, i64, i64),
) -> QuizlockResult<UnlockAuditEntry> {
    let unlocked_at = DateTime::<Utc>::from_timestamp(at, 0).ok_or_else(|| {
        QuizlockError::Storage(format!("audit row {id} has out-of-range time {at}"))
    })?;
    Ok(UnlockAuditEntry {
        id,
        quiz_id: QuizId(quiz),
        attempt_id: AttemptId(attempt),
        unlocked_by: UserId(user),
        unlocked_at,
    })
}

impl LockStore for SqliteLockStore {
    fn get(&self, attempt_id: AttemptId) -> QuizlockResult<Option<AttemptLock>> {
        let conn = self.conn()?;
        conn.query_row(
            &format!(
                "SELECT quizid, sessionhash FROM {} WHERE attemptid = ?1",
                self.tables.locks
            ),
            [attempt_id.0],
            |row| {
                Ok(AttemptLock {
                    attempt_id,
                    quiz_id: QuizId(row.get(0)?),
                    session_hash: row.get(1)?,
                })
            },
        )
        .optional()
        .map_err(storage)
    }

    fn create(&self, lock: &AttemptLock) -> QuizlockResult<()> {
        let conn = self.conn()?;
        let result = conn.execute(
            &format!(
                "INSERT INTO {} (quizid, attemptid, sessionhash) VALUES (?1, ?2, ?3)",
                self.tables.locks
            ),
            params![lock.quiz_id.0, lock.attempt_id.0, lock.session_hash],
        );
        match result {
            Ok(_) => Ok(()),
            Err(err) if is_unique_violation(&err) => {
                debug!("lock insert for attempt {} lost to an existing row", lock.attempt_id);
                Err(QuizlockError::LockExists(lock.attempt_id))
            }
            Err(err) => Err(storage(err)),
        }
    }

    fn delete(&self, attempt_id: AttemptId) -> QuizlockResult<bool> {
        let conn = self.conn()?;
        let removed = conn
            .execute(
                &format!("DELETE FROM {} WHERE attemptid = ?1", self.tables.locks),
                [attempt_id.0],
            )
            .map_err(storage)?;
        Ok(removed > 0)
    }

    fn delete_all_for_quiz(&self, quiz_id: QuizId) -> QuizlockResult<usize> {
        let conn = self.conn()?;
        conn.execute(
            &format!("DELETE FROM {} WHERE quizid = ?1", self.tables.locks),
            [quiz_id.0],
        )
        .map_err(storage)
    }

    fn release_and_record(
        &self,
        attempt_id: AttemptId,
        audit: &NewUnlockAudit,
    ) -> QuizlockResult<ReleaseOutcome> {
        let conn = self.conn()?;
        conn.execute_batch("BEGIN IMMEDIATE").map_err(storage)?;

        let result = self.release_inner(&conn, attempt_id, audit);
        match &result {
            Ok(_) => {
                if let Err(err) = conn.execute_batch("COMMIT") {
                    let _ = conn.execute_batch("ROLLBACK");
                    return Err(storage(err));
                }
            }
            Err(_) => {
                let _ = conn.execute_batch("ROLLBACK");
            }
        }
        result
    }

    fn latest_unlock(&self, attempt_id: AttemptId) -> QuizlockResult<Option<UnlockAuditEntry>> {
        Ok(self.unlock_history(attempt_id)?.pop())
    }

    fn unlock_history(&self, attempt_id: AttemptId) -> QuizlockResult<Vec<UnlockAuditEntry>> {
        let conn = self.conn()?;
        let mut stmt = match conn.prepare(&self.audit_query("attemptid = ?1")) {
            Ok(stmt) => stmt,
            // Installs without an audit table simply have no history.
            Err(err) if is_missing_table(&err) => return Ok(Vec::new()),
            Err(err) => return Err(storage(err)),
        };
        let rows = stmt
            .query_map([attempt_id.0], audit_from_row)
            .map_err(storage)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(storage)?;
        rows.into_iter().map(audit_entry).collect()
    }

    fn quizzes_with_audit_by(&self, user_id: UserId) -> QuizlockResult<Vec<QuizId>> {
        let conn = self.conn()?;
        let mut stmt = match conn.prepare(&format!(
            "SELECT DISTINCT quizid FROM {} WHERE unlockedby = ?1 ORDER BY quizid",
            self.tables.audit
        )) {
            Ok(stmt) => stmt,
            Err(err) if is_missing_table(&err) => return Ok(Vec::new()),
            Err(err) => return Err(storage(err)),
        };
        let quizzes = stmt
            .query_map([user_id.0], |row| row.get::<_, i64>(0))
            .map_err(storage)?
            .map(|quiz| quiz.map(QuizId))
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(storage)?;
        Ok(quizzes)
    }

    fn erase_audit_by_user(&self, user_id: UserId) -> QuizlockResult<usize> {
        self.erase_audit("unlockedby = ?1", user_id.0)
    }

    fn erase_audit_for_quiz(&self, quiz_id: QuizId) -> QuizlockResult<usize> {
        self.erase_audit("quizid = ?1", quiz_id.0)
    }
}

impl QuizSettingsStore for SqliteLockStore {
    fn quiz_enabled(&self, quiz_id: QuizId) -> QuizlockResult<Option<bool>> {
        let conn = self.conn()?;
        conn.query_row(
            &format!(
                "SELECT enabled FROM {} WHERE quizid = ?1",
                self.tables.settings
            ),
            [quiz_id.0],
            |row| row.get::<_, i64>(0),
        )
        .optional()
        .map(|enabled| enabled.map(|flag| flag != 0))
        .map_err(storage)
    }

    fn set_quiz_enabled(&self, quiz_id: QuizId, enabled: bool) -> QuizlockResult<()> {
        let conn = self.conn()?;
        conn.execute(
            &format!(
                "INSERT INTO {} (quizid, enabled) VALUES (?1, ?2)
                 ON CONFLICT(quizid) DO UPDATE SET enabled = excluded.enabled",
                self.tables.settings
            ),
            params![quiz_id.0, enabled as i64],
        )
        .map_err(storage)?;
        Ok(())
    }

    fn delete_quiz_settings(&self, quiz_id: QuizId) -> QuizlockResult<()> {
        let conn = self.conn()?;
        conn.execute(
            &format!("DELETE FROM {} WHERE quizid = ?1", self.tables.settings),
            [quiz_id.0],
        )
        .map_err(storage)?;
        Ok(())
    }
}
