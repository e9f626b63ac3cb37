//! Resource config check sessions
//!
//! A session groups check requests for one config within a time box so
//! they can share one check container. New sessions live for as long as the
//! fleet has been stable, clamped to a configured window: right after a
//! worker starts, sessions are short and containers move to new workers
//! sooner.

use crate::config::schema::CheckSessionConfig;
use crate::db::{self, classify, Db};
use crate::error::{StoreError, StoreResult};
use crate::ids::CheckSessionId;
use crate::resource::config::{self, ResourceConfigDescriptor, UsedResourceConfig};
use crate::resource::{ResourceTypes, Source};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, info};

/// Bounds on a new session's lifetime
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContainerExpiries {
    pub min: Duration,
    pub max: Duration,
}

impl ContainerExpiries {
    /// Lifetime for a session given how long the newest worker has been up
    pub fn lifetime(&self, uptime: Duration) -> Duration {
        uptime.clamp(self.min, self.max.max(self.min))
    }
}

impl From<&CheckSessionConfig> for ContainerExpiries {
    fn from(config: &CheckSessionConfig) -> Self {
        Self {
            min: Duration::from_secs(config.min_expiry_secs),
            max: Duration::from_secs(config.max_expiry_secs),
        }
    }
}

/// A session for a resource config
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckSession {
    pub id: CheckSessionId,
    pub resource_config: UsedResourceConfig,
    pub expires_at: DateTime<Utc>,
}

/// Service over check sessions
#[derive(Debug, Clone)]
pub struct CheckSessionFactory {
    db: Db,
    expiries: ContainerExpiries,
    grace: Duration,
}

impl CheckSessionFactory {
    pub fn new(db: Db, config: &CheckSessionConfig) -> Self {
        Self {
            db,
            expiries: config.into(),
            grace: Duration::from_secs(config.grace_secs),
        }
    }

    /// Find a session that outlives the grace window, or start a new one
    pub fn find_or_create_resource_config_check_session(
        &self,
        type_name: &str,
        source: &Source,
        types: &ResourceTypes,
    ) -> StoreResult<CheckSession> {
        let descriptor = ResourceConfigDescriptor::resolve(type_name, source, types)?;
        let now = db::now();

        self.db.transaction(|tx| {
            let resource_config = config::find_or_create_in(tx, &descriptor)?;
            let reuse_after = db::secs_after(now, self.grace);

            let existing: Option<(CheckSessionId, i64)> = tx
                .query_row(
                    "SELECT id, expires_at FROM resource_config_check_sessions
                     WHERE resource_config_id = ?1 AND expires_at > ?2
                     ORDER BY expires_at DESC
                     LIMIT 1",
                    params![resource_config.id, reuse_after],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;

            if let Some((id, expires_at)) = existing {
                debug!("Reusing check session {} for config {}", id, resource_config.id);
                return Ok(CheckSession {
                    id,
                    resource_config,
                    expires_at: db::timestamp(expires_at),
                });
            }

            let expires_at = db::secs_after(now, self.lifetime(tx, now)?);
            let id = tx
                .query_row(
                    "INSERT INTO resource_config_check_sessions (resource_config_id, expires_at)
                     VALUES (?1, ?2) RETURNING id",
                    params![resource_config.id, expires_at],
                    |row| row.get(0),
                )
                .map_err(|e| {
                    classify(
                        e,
                        StoreError::SafeRetry("resource_config_check_sessions"),
                        StoreError::ResourceConfigDisappeared,
                    )
                })?;

            debug!("Created check session {} for config {}", id, resource_config.id);
            Ok(CheckSession {
                id,
                resource_config,
                expires_at: db::timestamp(expires_at),
            })
        })
    }

    /// Delete sessions past their expiry
    ///
    /// Their worker sessions cascade away, which orphans the check
    /// containers they owned.
    pub fn clean_expired(&self) -> StoreResult<usize> {
        let deleted = self.db.connection()?.execute(
            "DELETE FROM resource_config_check_sessions WHERE expires_at <= ?1",
            params![db::now()],
        )?;
        if deleted > 0 {
            info!("Removed {} expired check sessions", deleted);
        }
        Ok(deleted)
    }

    fn lifetime(&self, conn: &Connection, now: i64) -> StoreResult<Duration> {
        let newest_start: Option<i64> =
            conn.query_row("SELECT MAX(start_time) FROM workers", [], |row| row.get(0))?;
        let uptime = newest_start
            .map(|start| Duration::from_secs(now.saturating_sub(start).max(0) as u64))
            .unwrap_or_default();
        Ok(self.expiries.lifetime(uptime))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::testing::*;
    use crate::worker::testing::register;

    fn factory(db: &Db) -> CheckSessionFactory {
        CheckSessionFactory::new(db.clone(), &CheckSessionConfig::default())
    }

    #[test]
    fn lifetime_is_clamped() {
        let expiries = ContainerExpiries {
            min: Duration::from_secs(300),
            max: Duration::from_secs(3600),
        };
        assert_eq!(expiries.lifetime(Duration::ZERO), Duration::from_secs(300));
        assert_eq!(expiries.lifetime(Duration::from_secs(900)), Duration::from_secs(900));
        assert_eq!(expiries.lifetime(Duration::from_secs(86_400)), Duration::from_secs(3600));
    }

    #[test]
    fn sessions_are_reused_within_window() {
        let (_dir, db) = temp_db();
        register(&db, "w1");
        let sessions = factory(&db);

        let a = sessions
            .find_or_create_resource_config_check_session("git", &Source::new(), &ResourceTypes::default())
            .unwrap();
        let b = sessions
            .find_or_create_resource_config_check_session("git", &Source::new(), &ResourceTypes::default())
            .unwrap();

        assert_eq!(a.id, b.id);
        assert_eq!(count(&db, "resource_config_check_sessions"), 1);
    }

    #[test]
    fn freshly_started_fleet_gets_minimum_expiry() {
        let (_dir, db) = temp_db();
        register(&db, "w1");
        let before = Utc::now();

        let session = factory(&db)
            .find_or_create_resource_config_check_session("git", &Source::new(), &ResourceTypes::default())
            .unwrap();

        let lifetime = (session.expires_at - before).num_seconds();
        assert!((299..=301).contains(&lifetime), "lifetime was {lifetime}");
    }

    #[test]
    fn stable_fleet_gets_longer_sessions() {
        let (_dir, db) = temp_db();
        register(&db, "w1");
        db.connection()
            .unwrap()
            .execute(
                "UPDATE workers SET start_time = ?1",
                params![db::now() - 7200],
            )
            .unwrap();

        let session = factory(&db)
            .find_or_create_resource_config_check_session("git", &Source::new(), &ResourceTypes::default())
            .unwrap();
        let lifetime = (session.expires_at - Utc::now()).num_seconds();
        assert!((3598..=3600).contains(&lifetime), "lifetime was {lifetime}");
    }

    #[test]
    fn oversized_grace_never_reuses() {
        let (_dir, db) = temp_db();
        register(&db, "w1");
        let config = CheckSessionConfig {
            grace_secs: u64::MAX,
            ..Default::default()
        };
        let sessions = CheckSessionFactory::new(db.clone(), &config);

        let a = sessions
            .find_or_create_resource_config_check_session("git", &Source::new(), &ResourceTypes::default())
            .unwrap();
        let b = sessions
            .find_or_create_resource_config_check_session("git", &Source::new(), &ResourceTypes::default())
            .unwrap();
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn sessions_inside_grace_are_not_reused() {
        let (_dir, db) = temp_db();
        register(&db, "w1");
        let sessions = factory(&db);
        let first = sessions
            .find_or_create_resource_config_check_session("git", &Source::new(), &ResourceTypes::default())
            .unwrap();

        // Expires within the 60s grace window
        db.connection()
            .unwrap()
            .execute(
                "UPDATE resource_config_check_sessions SET expires_at = ?1",
                params![db::now() + 30],
            )
            .unwrap();

        let second = sessions
            .find_or_create_resource_config_check_session("git", &Source::new(), &ResourceTypes::default())
            .unwrap();
        assert_ne!(first.id, second.id);
    }

    #[test]
    fn clean_expired_removes_only_expired() {
        let (_dir, db) = temp_db();
        register(&db, "w1");
        let sessions = factory(&db);
        sessions
            .find_or_create_resource_config_check_session("git", &Source::new(), &ResourceTypes::default())
            .unwrap();
        assert_eq!(sessions.clean_expired().unwrap(), 0);

        db.connection()
            .unwrap()
            .execute(
                "UPDATE resource_config_check_sessions SET expires_at = ?1",
                params![db::now() - 1],
            )
            .unwrap();
        assert_eq!(sessions.clean_expired().unwrap(), 1);
    }
}
