//! SQLite backend for the quizlock stores. `store` holds the lock, audit and
//! settings tables of one rule profile, `attempts` reads the host's attempt
//! table, and `schema` owns the table layout for a given prefix.

mod attempts;
mod schema;
mod store;

pub use attempts::SqliteAttemptDirectory;
pub use store::SqliteLockStore;
