//! Attempt directory over the host's attempt table.

use crate::schema::storage;
use quizlock_core::error::{QuizlockError, QuizlockResult};
use quizlock_core::store::AttemptDirectory;
use quizlock_core::types::{AttemptId, AttemptRecord, AttemptStatus, QuizId, UserId};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

const SELECT_ATTEMPT: &str = "SELECT id, quiz, userid, state, preview FROM quiz_attempts";

/// Read access to `quiz_attempts(id, quiz, userid, state, preview)`.
#[derive(Clone)]
pub struct SqliteAttemptDirectory {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteAttemptDirectory {
    pub fn open(path: &Path) -> QuizlockResult<Self> {
        let conn = Connection::open(path).map_err(storage)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))
            .map_err(storage)?;
        Ok(Self::from_connection(conn))
    }

    pub fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    fn conn(&self) -> QuizlockResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| QuizlockError::Storage("sqlite connection mutex poisoned".into()))
    }

    /// Create the attempt table for standalone deployments without a host.
    pub fn create_table(&self) -> QuizlockResult<()> {
        self.conn()?
            .execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS quiz_attempts (
                    id INTEGER PRIMARY KEY,
                    quiz INTEGER NOT NULL,
                    userid INTEGER NOT NULL,
                    state TEXT NOT NULL,
                    preview INTEGER NOT NULL DEFAULT 0
                );
                CREATE INDEX IF NOT EXISTS quiz_attempts_quiz ON quiz_attempts (quiz);
                "#,
            )
            .map_err(storage)
    }

    /// Insert or replace an attempt row.
    pub fn record(&self, attempt: &AttemptRecord) -> QuizlockResult<()> {
        self.conn()?
            .execute(
                "INSERT OR REPLACE INTO quiz_attempts (id, quiz, userid, state, preview)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    attempt.attempt_id.0,
                    attempt.quiz_id.0,
                    attempt.user_id.0,
                    attempt.status.as_str(),
                    attempt.preview as i64
                ],
            )
            .map_err(storage)?;
        Ok(())
    }
}

fn raw_attempt(row: &Row<'_>) -> rusqlite::Result<(i64, i64, i64, String, i64)> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
}

fn attempt_record(
    (id, quiz, user, state, preview): (i64, i64, i64, String, i64),
) -> QuizlockResult<AttemptRecord> {
    let status = state
        .parse::<AttemptStatus>()
        .map_err(|reason| QuizlockError::Storage(format!("attempt {id}: {reason}")))?;
    Ok(AttemptRecord {
        attempt_id: AttemptId(id),
        quiz_id: QuizId(quiz),
        user_id: UserId(user),
        status,
        preview: preview != 0,
    })
}

impl AttemptDirectory for SqliteAttemptDirectory {
    fn attempt(&self, attempt_id: AttemptId) -> QuizlockResult<Option<AttemptRecord>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                &format!("{SELECT_ATTEMPT} WHERE id = ?1"),
                [attempt_id.0],
                raw_attempt,
            )
            .optional()
            .map_err(storage)?;
        row.map(attempt_record).transpose()
    }

    fn attempts_for_quiz(&self, quiz_id: QuizId) -> QuizlockResult<Vec<AttemptRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!("{SELECT_ATTEMPT} WHERE quiz = ?1 ORDER BY id"))
            .map_err(storage)?;
        let rows = stmt
            .query_map([quiz_id.0], raw_attempt)
            .map_err(storage)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(storage)?;
        rows.into_iter().map(attempt_record).collect()
    }
}
