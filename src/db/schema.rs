//! Versioned schema migrations
//!
//! The applied version lives in `PRAGMA user_version`. Each entry in
//! [`MIGRATIONS`] runs once, in order, inside its own immediate transaction.

use crate::error::StoreResult;
use rusqlite::{Connection, TransactionBehavior};
use tracing::{debug, info};

/// Ordered migrations. Index `n` moves the schema from version `n` to `n + 1`.
const MIGRATIONS: &[&str] = &[
    // 1: collaborator stand-ins and the identity graph
    r#"
    CREATE TABLE workers (
        name TEXT PRIMARY KEY,
        state TEXT NOT NULL DEFAULT 'running'
            CHECK (state IN ('running', 'landing', 'landed', 'retiring', 'stalled')),
        team_id INTEGER,
        start_time INTEGER NOT NULL
    );

    CREATE TABLE builds (
        id INTEGER PRIMARY KEY,
        status TEXT NOT NULL DEFAULT 'pending'
    );

    CREATE TABLE base_resource_types (
        id INTEGER PRIMARY KEY,
        name TEXT NOT NULL UNIQUE
    );

    CREATE TABLE resource_configs (
        id INTEGER PRIMARY KEY,
        base_resource_type_id INTEGER
            REFERENCES base_resource_types(id) ON DELETE RESTRICT,
        resource_cache_id INTEGER
            REFERENCES resource_caches(id) ON DELETE RESTRICT,
        source_hash TEXT NOT NULL,
        check_error TEXT,
        last_checked INTEGER NOT NULL DEFAULT 0,
        CHECK ((base_resource_type_id IS NULL) <> (resource_cache_id IS NULL))
    );

    CREATE UNIQUE INDEX resource_configs_base_source_uniq
        ON resource_configs (base_resource_type_id, source_hash)
        WHERE base_resource_type_id IS NOT NULL;

    CREATE UNIQUE INDEX resource_configs_cache_source_uniq
        ON resource_configs (resource_cache_id, source_hash)
        WHERE resource_cache_id IS NOT NULL;

    CREATE TABLE resource_caches (
        id INTEGER PRIMARY KEY,
        resource_config_id INTEGER NOT NULL
            REFERENCES resource_configs(id) ON DELETE RESTRICT,
        version TEXT NOT NULL,
        params_hash TEXT NOT NULL,
        UNIQUE (resource_config_id, version, params_hash)
    );

    CREATE TABLE resource_cache_uses (
        resource_cache_id INTEGER NOT NULL
            REFERENCES resource_caches(id) ON DELETE RESTRICT,
        build_id INTEGER REFERENCES builds(id) ON DELETE CASCADE,
        resource_id INTEGER,
        resource_type_id INTEGER,
        container_id INTEGER REFERENCES containers(id) ON DELETE CASCADE,
        CHECK ((build_id IS NOT NULL) + (resource_id IS NOT NULL)
            + (resource_type_id IS NOT NULL) + (container_id IS NOT NULL) = 1)
    );

    CREATE INDEX resource_cache_uses_cache_idx ON resource_cache_uses (resource_cache_id);

    CREATE TABLE resource_config_uses (
        resource_config_id INTEGER NOT NULL
            REFERENCES resource_configs(id) ON DELETE RESTRICT,
        build_id INTEGER REFERENCES builds(id) ON DELETE CASCADE,
        resource_id INTEGER,
        resource_type_id INTEGER,
        container_id INTEGER REFERENCES containers(id) ON DELETE CASCADE,
        CHECK ((build_id IS NOT NULL) + (resource_id IS NOT NULL)
            + (resource_type_id IS NOT NULL) + (container_id IS NOT NULL) = 1)
    );

    CREATE INDEX resource_config_uses_config_idx ON resource_config_uses (resource_config_id);
    "#,
    // 2: worker projections and check sessions
    r#"
    CREATE TABLE worker_base_resource_types (
        id INTEGER PRIMARY KEY,
        worker_name TEXT NOT NULL REFERENCES workers(name) ON DELETE CASCADE,
        base_resource_type_id INTEGER NOT NULL
            REFERENCES base_resource_types(id) ON DELETE RESTRICT,
        image TEXT NOT NULL,
        version TEXT NOT NULL,
        UNIQUE (worker_name, base_resource_type_id)
    );

    CREATE TABLE worker_resource_caches (
        id INTEGER PRIMARY KEY,
        worker_base_resource_type_id INTEGER NOT NULL
            REFERENCES worker_base_resource_types(id) ON DELETE CASCADE,
        resource_cache_id INTEGER NOT NULL
            REFERENCES resource_caches(id) ON DELETE RESTRICT,
        UNIQUE (worker_base_resource_type_id, resource_cache_id)
    );

    CREATE TABLE resource_config_check_sessions (
        id INTEGER PRIMARY KEY,
        resource_config_id INTEGER NOT NULL
            REFERENCES resource_configs(id) ON DELETE RESTRICT,
        expires_at INTEGER NOT NULL
    );

    CREATE INDEX resource_config_check_sessions_config_idx
        ON resource_config_check_sessions (resource_config_id);

    CREATE TABLE worker_resource_config_check_sessions (
        id INTEGER PRIMARY KEY,
        resource_config_check_session_id INTEGER NOT NULL
            REFERENCES resource_config_check_sessions(id) ON DELETE CASCADE,
        worker_base_resource_type_id INTEGER NOT NULL
            REFERENCES worker_base_resource_types(id) ON DELETE CASCADE,
        team_id INTEGER
    );

    CREATE TABLE task_caches (
        id INTEGER PRIMARY KEY,
        job_id INTEGER NOT NULL,
        step_name TEXT NOT NULL,
        path TEXT NOT NULL,
        UNIQUE (job_id, step_name, path)
    );

    CREATE TABLE worker_task_caches (
        id INTEGER PRIMARY KEY,
        worker_name TEXT NOT NULL REFERENCES workers(name) ON DELETE CASCADE,
        task_cache_id INTEGER NOT NULL REFERENCES task_caches(id) ON DELETE CASCADE,
        UNIQUE (worker_name, task_cache_id)
    );

    CREATE TABLE worker_resource_certs (
        id INTEGER PRIMARY KEY,
        worker_name TEXT NOT NULL REFERENCES workers(name) ON DELETE CASCADE,
        certs_path TEXT NOT NULL,
        UNIQUE (worker_name, certs_path)
    );
    "#,
    // 3: physical artifacts
    r#"
    CREATE TABLE containers (
        id INTEGER PRIMARY KEY,
        handle TEXT NOT NULL UNIQUE,
        worker_name TEXT NOT NULL REFERENCES workers(name) ON DELETE CASCADE,
        state TEXT NOT NULL DEFAULT 'creating'
            CHECK (state IN ('creating', 'created', 'destroying', 'failed')),
        team_id INTEGER,
        discontinued INTEGER NOT NULL DEFAULT 0,
        metadata TEXT NOT NULL DEFAULT '{}',
        build_id INTEGER REFERENCES builds(id) ON DELETE SET NULL,
        plan_id TEXT,
        image_check_container_id INTEGER REFERENCES containers(id) ON DELETE SET NULL,
        image_get_container_id INTEGER REFERENCES containers(id) ON DELETE SET NULL,
        worker_resource_config_check_session_id INTEGER
            REFERENCES worker_resource_config_check_sessions(id) ON DELETE SET NULL,
        CHECK ((build_id IS NOT NULL) + (image_check_container_id IS NOT NULL)
            + (image_get_container_id IS NOT NULL)
            + (worker_resource_config_check_session_id IS NOT NULL) <= 1)
    );

    CREATE INDEX containers_worker_idx ON containers (worker_name);

    CREATE TABLE volumes (
        id INTEGER PRIMARY KEY,
        handle TEXT NOT NULL UNIQUE,
        worker_name TEXT NOT NULL REFERENCES workers(name) ON DELETE CASCADE,
        state TEXT NOT NULL DEFAULT 'creating'
            CHECK (state IN ('creating', 'created', 'destroying', 'failed')),
        path TEXT,
        team_id INTEGER,
        container_id INTEGER REFERENCES containers(id) ON DELETE SET NULL,
        parent_id INTEGER,
        parent_state TEXT,
        worker_resource_cache_id INTEGER
            REFERENCES worker_resource_caches(id) ON DELETE SET NULL,
        worker_base_resource_type_id INTEGER
            REFERENCES worker_base_resource_types(id) ON DELETE SET NULL,
        worker_task_cache_id INTEGER
            REFERENCES worker_task_caches(id) ON DELETE SET NULL,
        worker_resource_certs_id INTEGER
            REFERENCES worker_resource_certs(id) ON DELETE SET NULL,
        UNIQUE (id, state),
        FOREIGN KEY (parent_id, parent_state) REFERENCES volumes(id, state),
        CHECK ((container_id IS NOT NULL) + (worker_resource_cache_id IS NOT NULL)
            + (worker_base_resource_type_id IS NOT NULL)
            + (worker_task_cache_id IS NOT NULL)
            + (worker_resource_certs_id IS NOT NULL) <= 1)
    );

    CREATE INDEX volumes_worker_idx ON volumes (worker_name);
    CREATE INDEX volumes_parent_idx ON volumes (parent_id, parent_state);

    CREATE UNIQUE INDEX volumes_worker_resource_cache_uniq
        ON volumes (worker_resource_cache_id)
        WHERE worker_resource_cache_id IS NOT NULL;

    CREATE UNIQUE INDEX volumes_worker_task_cache_uniq
        ON volumes (worker_task_cache_id)
        WHERE worker_task_cache_id IS NOT NULL;
    "#,
];

/// Latest schema version this build knows about
pub fn latest_version() -> u32 {
    MIGRATIONS.len() as u32
}

/// Read the schema version recorded in the database
pub fn current_version(conn: &Connection) -> StoreResult<u32> {
    let version: u32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    Ok(version)
}

/// Apply every pending migration, returning how many ran
pub fn migrate(conn: &mut Connection) -> StoreResult<usize> {
    let current = current_version(conn)? as usize;
    if current >= MIGRATIONS.len() {
        debug!("Schema up to date at version {}", current);
        return Ok(0);
    }

    for (index, sql) in MIGRATIONS.iter().enumerate().skip(current) {
        let version = index + 1;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        // Another process may have migrated while we waited for the lock
        let applied: u32 = tx.pragma_query_value(None, "user_version", |row| row.get(0))?;
        if applied as usize >= version {
            continue;
        }

        tx.execute_batch(sql)?;
        tx.pragma_update(None, "user_version", version as i64)?;
        tx.commit()?;
        info!("Applied schema migration {}", version);
    }

    Ok(MIGRATIONS.len() - current)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.pragma_update(None, "foreign_keys", "ON").unwrap();
        conn
    }

    #[test]
    fn migrate_from_empty() {
        let mut conn = open();
        assert_eq!(current_version(&conn).unwrap(), 0);

        let applied = migrate(&mut conn).unwrap();
        assert_eq!(applied, MIGRATIONS.len());
        assert_eq!(current_version(&conn).unwrap(), latest_version());
    }

    #[test]
    fn migrate_is_idempotent() {
        let mut conn = open();
        migrate(&mut conn).unwrap();
        assert_eq!(migrate(&mut conn).unwrap(), 0);
    }

    #[test]
    fn config_parent_must_be_exactly_one() {
        let mut conn = open();
        migrate(&mut conn).unwrap();

        let err = conn
            .execute(
                "INSERT INTO resource_configs (source_hash) VALUES ('abc')",
                [],
            )
            .unwrap_err();
        assert!(err.to_string().contains("CHECK"));
    }

    #[test]
    fn volume_payload_columns_are_exclusive() {
        let mut conn = open();
        migrate(&mut conn).unwrap();
        conn.execute_batch(
            "INSERT INTO workers (name, start_time) VALUES ('w', 0);
             INSERT INTO worker_resource_certs (worker_name, certs_path) VALUES ('w', '/certs');
             INSERT INTO containers (handle, worker_name) VALUES ('c', 'w');",
        )
        .unwrap();

        let err = conn
            .execute(
                "INSERT INTO volumes (handle, worker_name, container_id, worker_resource_certs_id)
                 VALUES ('v', 'w', 1, 1)",
                [],
            )
            .unwrap_err();
        assert!(err.to_string().contains("CHECK"));
    }
}
