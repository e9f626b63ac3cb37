//! SQLite store handle
//!
//! [`Db`] is a cheap, cloneable handle. Every unit of work opens its own
//! connection, so any number of handles, threads or processes may share one
//! database file. Writers that read before they insert use an IMMEDIATE
//! transaction, which holds the reserved lock from the first read until
//! commit: a concurrent deleter blocks until the reader resolves.

pub mod schema;

use crate::config::schema::DatabaseConfig;
use crate::error::{StoreError, StoreResult};
use chrono::{DateTime, Utc};
use rusqlite::{ffi, Connection, OptionalExtension, Transaction, TransactionBehavior};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

/// Handle to the resgraph database
#[derive(Debug, Clone)]
pub struct Db {
    path: PathBuf,
    busy_timeout: Duration,
    max_retries: u32,
}

impl Db {
    /// Open the database at `path`, applying pending migrations
    pub fn open(path: impl Into<PathBuf>, settings: &DatabaseConfig) -> StoreResult<Self> {
        let db = Self {
            path: path.into(),
            busy_timeout: settings.busy_timeout(),
            max_retries: settings.max_retries.max(1),
        };

        let mut conn = db.connection()?;
        let applied = schema::migrate(&mut conn)?;
        if applied > 0 {
            debug!("Migrated {} to version {}", db.path.display(), schema::latest_version());
        }

        Ok(db)
    }

    /// Path of the database file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Attempts allowed by [`Db::with_retry`]
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Open a fresh connection with WAL, foreign keys and the busy timeout set
    pub fn connection(&self) -> StoreResult<Connection> {
        let conn = Connection::open(&self.path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.busy_timeout(self.busy_timeout)?;
        Ok(conn)
    }

    /// Run `f` inside an IMMEDIATE transaction and commit on success
    ///
    /// Any error rolls the transaction back when it is dropped.
    pub fn transaction<T, F>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&Transaction<'_>) -> StoreResult<T>,
    {
        let mut conn = self.connection()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let result = f(&tx)?;
        tx.commit()?;
        Ok(result)
    }

    /// Run a read-only `f` inside a deferred transaction
    pub fn read<T, F>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&Connection) -> StoreResult<T>,
    {
        let mut conn = self.connection()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Deferred)?;
        let result = f(&tx)?;
        tx.finish()?;
        Ok(result)
    }

    /// Restart `f` from scratch while it fails with a retryable conflict
    ///
    /// `f` must open its own transaction: a parent that disappeared
    /// invalidates every decision the failed attempt made.
    pub fn with_retry<T, F>(&self, f: F) -> StoreResult<T>
    where
        F: FnMut() -> StoreResult<T>,
    {
        retry(self.max_retries, f)
    }
}

/// Bounded restart loop behind [`Db::with_retry`]
pub fn retry<T, F>(max_attempts: u32, mut f: F) -> StoreResult<T>
where
    F: FnMut() -> StoreResult<T>,
{
    let max_attempts = max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match f() {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < max_attempts => {
                warn!("Attempt {}/{} lost a race: {}", attempt, max_attempts, e);
                attempt += 1;
            }
            Err(e) if e.is_retryable() => {
                return Err(StoreError::RetriesExhausted {
                    attempts: attempt,
                    last: Box::new(e),
                });
            }
            Err(e) => return Err(e),
        }
    }
}

/// Constraint family a failed statement tripped over
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Constraint {
    Unique,
    ForeignKey,
    Check,
}

/// Classify a driver error by its extended result code
pub(crate) fn constraint(err: &rusqlite::Error) -> Option<Constraint> {
    match err {
        rusqlite::Error::SqliteFailure(e, _) if e.code == ffi::ErrorCode::ConstraintViolation => {
            match e.extended_code {
                ffi::SQLITE_CONSTRAINT_UNIQUE | ffi::SQLITE_CONSTRAINT_PRIMARYKEY => {
                    Some(Constraint::Unique)
                }
                ffi::SQLITE_CONSTRAINT_FOREIGNKEY => Some(Constraint::ForeignKey),
                ffi::SQLITE_CONSTRAINT_CHECK => Some(Constraint::Check),
                _ => None,
            }
        }
        _ => None,
    }
}

/// Map unique and foreign-key violations of an insert onto the caller's
/// "already exists" and "disappeared" errors
pub(crate) fn classify(
    err: rusqlite::Error,
    already_exists: StoreError,
    disappeared: StoreError,
) -> StoreError {
    match constraint(&err) {
        Some(Constraint::Unique) => already_exists,
        Some(Constraint::ForeignKey) => disappeared,
        _ => StoreError::Sqlite(err),
    }
}

/// Move a `table` row from one of `from` to `to`, scoped by its current state
///
/// Zero matched rows means another actor got there first: the error names
/// the state the row is actually in, or reports it missing.
pub(crate) fn transition(
    conn: &Connection,
    table: &'static str,
    entity: &'static str,
    id: i64,
    handle: &str,
    from: &[&str],
    to: &str,
) -> StoreResult<()> {
    let marks = vec!["?"; from.len()].join(", ");
    let sql = format!("UPDATE {table} SET state = ? WHERE id = ? AND state IN ({marks})");

    let mut values: Vec<&dyn rusqlite::ToSql> = vec![&to, &id];
    values.extend(from.iter().map(|s| s as &dyn rusqlite::ToSql));

    let updated = conn.execute(&sql, values.as_slice())?;
    if updated == 0 {
        return Err(transition_error(conn, table, entity, id, handle, to));
    }
    Ok(())
}

/// Explain why a state-scoped statement matched nothing
pub(crate) fn transition_error(
    conn: &Connection,
    table: &'static str,
    entity: &'static str,
    id: i64,
    handle: &str,
    to: &str,
) -> StoreError {
    let current = conn
        .query_row(
            &format!("SELECT state FROM {table} WHERE id = ?1"),
            [id],
            |row| row.get::<_, String>(0),
        )
        .optional();

    match current {
        Ok(Some(from)) => StoreError::InvalidTransition {
            entity,
            handle: handle.to_string(),
            from,
            to: to.to_string(),
        },
        Ok(None) => StoreError::missing(entity, handle),
        Err(e) => e.into(),
    }
}

/// Current time as stored in the database
pub(crate) fn now() -> i64 {
    Utc::now().timestamp()
}

/// `now` plus `span` in whole seconds, saturating at the end of time
pub(crate) fn secs_after(now: i64, span: Duration) -> i64 {
    i64::try_from(span.as_secs())
        .ok()
        .and_then(|secs| now.checked_add(secs))
        .unwrap_or(i64::MAX)
}

/// Convert a stored unix timestamp
pub(crate) fn timestamp(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or_default()
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use tempfile::TempDir;

    /// Fresh, migrated database in a temporary directory
    pub fn temp_db() -> (TempDir, Db) {
        let dir = TempDir::new().unwrap();
        let db = Db::open(dir.path().join("test.db"), &DatabaseConfig::default()).unwrap();
        (dir, db)
    }

    /// Insert a bare worker row
    pub fn insert_worker(db: &Db, name: &str, state: &str) {
        db.connection()
            .unwrap()
            .execute(
                "INSERT INTO workers (name, state, start_time) VALUES (?1, ?2, ?3)",
                rusqlite::params![name, state, now()],
            )
            .unwrap();
    }

    /// Count rows in `table`
    pub fn count(db: &Db, table: &str) -> i64 {
        db.connection()
            .unwrap()
            .query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| {
                row.get(0)
            })
            .unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use std::cell::Cell;

    #[test]
    fn open_applies_migrations() {
        let (_dir, db) = temp_db();
        let conn = db.connection().unwrap();
        assert_eq!(
            schema::current_version(&conn).unwrap(),
            schema::latest_version()
        );
    }

    #[test]
    fn secs_after_saturates() {
        assert_eq!(secs_after(100, Duration::from_secs(20)), 120);
        assert_eq!(secs_after(100, Duration::MAX), i64::MAX);
        assert_eq!(secs_after(i64::MAX - 1, Duration::from_secs(5)), i64::MAX);
    }

    #[test]
    fn transaction_rolls_back_on_error() {
        let (_dir, db) = temp_db();
        let result: StoreResult<()> = db.transaction(|tx| {
            tx.execute("INSERT INTO base_resource_types (name) VALUES ('git')", [])?;
            Err(StoreError::Internal("boom".into()))
        });
        assert!(result.is_err());
        assert_eq!(count(&db, "base_resource_types"), 0);
    }

    #[test]
    fn classify_unique_and_foreign_key() {
        let (_dir, db) = temp_db();
        let conn = db.connection().unwrap();
        conn.execute("INSERT INTO base_resource_types (name) VALUES ('git')", [])
            .unwrap();

        let dup = conn
            .execute("INSERT INTO base_resource_types (name) VALUES ('git')", [])
            .unwrap_err();
        assert_eq!(constraint(&dup), Some(Constraint::Unique));

        let orphan = conn
            .execute(
                "INSERT INTO resource_configs (base_resource_type_id, source_hash) VALUES (99, 'h')",
                [],
            )
            .unwrap_err();
        let err = classify(
            orphan,
            StoreError::ResourceConfigAlreadyExists,
            StoreError::ResourceConfigParentDisappeared,
        );
        assert!(matches!(err, StoreError::ResourceConfigParentDisappeared));
    }

    #[test]
    fn retry_restarts_until_success() {
        let calls = Cell::new(0);
        let result = retry(5, || {
            calls.set(calls.get() + 1);
            if calls.get() < 3 {
                Err(StoreError::ResourceCacheAlreadyExists)
            } else {
                Ok(calls.get())
            }
        });
        assert_eq!(result.unwrap(), 3);
    }

    #[test]
    fn retry_gives_up_after_max_attempts() {
        let calls = Cell::new(0);
        let result: StoreResult<()> = retry(2, || {
            calls.set(calls.get() + 1);
            Err(StoreError::ResourceConfigDisappeared)
        });
        assert!(matches!(
            result,
            Err(StoreError::RetriesExhausted { attempts: 2, .. })
        ));
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn retry_does_not_restart_fatal_errors() {
        let calls = Cell::new(0);
        let result: StoreResult<()> = retry(5, || {
            calls.set(calls.get() + 1);
            Err(StoreError::BaseResourceTypeNotFound("git".into()))
        });
        assert!(matches!(result, Err(StoreError::BaseResourceTypeNotFound(_))));
        assert_eq!(calls.get(), 1);
    }
}
