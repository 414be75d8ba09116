//! Table layout for one rule profile and the helpers that classify SQLite
//! failures into quizlock errors.

use quizlock_core::error::{QuizlockError, QuizlockResult};
use rusqlite::{ffi, Connection, OptionalExtension};

/// Table names derived from a profile's prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableNames {
    /// Per-quiz enable flag.
    pub settings: String,
    /// Attempt locks, one row per attempt.
    pub locks: String,
    /// Unlock audit trail.
    pub audit: String,
}

impl TableNames {
    pub fn for_prefix(prefix: &str) -> QuizlockResult<Self> {
        let well_formed = !prefix.is_empty()
            && prefix
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
        if !well_formed {
            return Err(QuizlockError::InvalidConfig(format!(
                "table prefix `{prefix}` must match [a-z0-9_]+"
            )));
        }

        Ok(Self {
            settings: prefix.to_string(),
            locks: format!("{prefix}_sess"),
            audit: format!("{prefix}_log"),
        })
    }

    pub(crate) fn create_sql(&self) -> String {
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS {settings} (
                id INTEGER PRIMARY KEY,
                quizid INTEGER NOT NULL UNIQUE,
                enabled INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS {locks} (
                id INTEGER PRIMARY KEY,
                quizid INTEGER NOT NULL,
                attemptid INTEGER NOT NULL UNIQUE,
                sessionhash TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS {locks}_quizid ON {locks} (quizid);

            CREATE TABLE IF NOT EXISTS {audit} (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                quizid INTEGER NOT NULL,
                attemptid INTEGER NOT NULL,
                unlockedby INTEGER NOT NULL,
                timeunlocked INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS {audit}_attemptid ON {audit} (attemptid);
            CREATE INDEX IF NOT EXISTS {audit}_unlockedby ON {audit} (unlockedby);
            "#,
            settings = self.settings,
            locks = self.locks,
            audit = self.audit,
        )
    }
}

pub(crate) fn init_connection(conn: &Connection, tables: &TableNames) -> QuizlockResult<()> {
    conn.busy_timeout(std::time::Duration::from_secs(5))
        .map_err(storage)?;
    // WAL is refused for in-memory databases; the default journal is fine there.
    let _ = conn.pragma_update(None, "journal_mode", "WAL");
    conn.execute_batch(&tables.create_sql()).map_err(storage)
}

pub(crate) fn table_exists(conn: &Connection, name: &str) -> QuizlockResult<bool> {
    conn.query_row(
        "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
        [name],
        |_| Ok(()),
    )
    .optional()
    .map(|row| row.is_some())
    .map_err(storage)
}

pub(crate) fn storage(err: rusqlite::Error) -> QuizlockError {
    QuizlockError::Storage(err.to_string())
}

/// Only UNIQUE and PRIMARY KEY conflicts count; NOT NULL, CHECK and foreign
/// key failures stay storage errors.
pub(crate) fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(failure, _)
            if failure.extended_code == ffi::SQLITE_CONSTRAINT_UNIQUE
                || failure.extended_code == ffi::SQLITE_CONSTRAINT_PRIMARYKEY
    )
}

pub(crate) fn is_missing_table(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(_, Some(message)) if message.starts_with("no such table")
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_follow_prefix() {
        let names = TableNames::for_prefix("quizaccess_onesession").unwrap();
        assert_eq!(names.settings, "quizaccess_onesession");
        assert_eq!(names.locks, "quizaccess_onesession_sess");
        assert_eq!(names.audit, "quizaccess_onesession_log");
    }

    #[test]
    fn rejects_prefix_that_could_inject_sql() {
        let err = TableNames::for_prefix("x; DROP TABLE users").unwrap_err();
        assert_eq!(err.code(), "QL1100");
        assert!(TableNames::for_prefix("").is_err());
    }

    #[test]
    fn schema_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        let names = TableNames::for_prefix("quizaccess_oneconnection").unwrap();
        init_connection(&conn, &names).unwrap();
        init_connection(&conn, &names).unwrap();
        assert!(table_exists(&conn, &names.locks).unwrap());
        assert!(!table_exists(&conn, "quizaccess_other_sess").unwrap());
    }

    #[test]
    fn classifies_unique_violations() {
        let conn = Connection::open_in_memory().unwrap();
        let names = TableNames::for_prefix("qa").unwrap();
        init_connection(&conn, &names).unwrap();
        conn.execute(
            "INSERT INTO qa_sess (quizid, attemptid, sessionhash) VALUES (1, 1, 'x')",
            [],
        )
        .unwrap();
        let err = conn
            .execute(
                "INSERT INTO qa_sess (quizid, attemptid, sessionhash) VALUES (1, 1, 'y')",
                [],
            )
            .unwrap_err();
        assert!(is_unique_violation(&err));

        let err = conn
            .execute("INSERT INTO qa_sess (id, quizid, attemptid, sessionhash) VALUES (1, 1, 2, 'z')", [])
            .unwrap_err();
        assert!(is_unique_violation(&err));

        let err = conn
            .execute("INSERT INTO qa_sess (quizid, attemptid) VALUES (1, 3)", [])
            .unwrap_err();
        assert!(!is_unique_violation(&err));

        let err = conn.execute("DELETE FROM qa_missing", []).unwrap_err();
        assert!(is_missing_table(&err));
    }
}
