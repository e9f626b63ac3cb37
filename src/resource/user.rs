//! Use edges: who keeps a config or cache alive
//!
//! A use is a set membership, not a counter. Registering the same owner
//! twice leaves one edge.

use super::config::{self, ResourceConfigDescriptor, UsedResourceConfig};
use super::hash::Source;
use super::types::ResourceTypes;
use crate::db::{classify, Db};
use crate::error::{StoreError, StoreResult};
use crate::ids::{BuildId, ContainerId, ResourceCacheId, ResourceConfigId, ResourceId, ResourceTypeId};
use rusqlite::{params, Connection};
use serde::Serialize;
use std::fmt;
use tracing::debug;

/// The owner a use edge points back to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum ResourceUser {
    ForBuild(BuildId),
    ForResource(ResourceId),
    ForResourceType(ResourceTypeId),
    ForContainer(ContainerId),
}

impl ResourceUser {
    /// Owner column and value in the use tables
    fn column(&self) -> (&'static str, i64) {
        match self {
            Self::ForBuild(id) => ("build_id", id.get()),
            Self::ForResource(id) => ("resource_id", id.get()),
            Self::ForResourceType(id) => ("resource_type_id", id.get()),
            Self::ForContainer(id) => ("container_id", id.get()),
        }
    }

    /// Register a use of `cache`; a no-op when the edge exists
    pub(crate) fn use_cache_in(&self, conn: &Connection, cache: ResourceCacheId) -> StoreResult<()> {
        let (column, owner) = self.column();
        let sql = format!(
            "INSERT INTO resource_cache_uses (resource_cache_id, {column})
             SELECT ?1, ?2
             WHERE NOT EXISTS (
                 SELECT 1 FROM resource_cache_uses WHERE resource_cache_id = ?1 AND {column} = ?2
             )"
        );
        let inserted = conn
            .execute(&sql, params![cache, owner])
            .map_err(|e| classify(e, StoreError::SafeRetry("resource_cache_uses"), StoreError::ResourceCacheDisappeared))?;
        if inserted > 0 {
            debug!("{} now uses resource cache {}", self, cache);
        }
        Ok(())
    }

    /// Register a use of `config`; a no-op when the edge exists
    pub(crate) fn use_config_in(&self, conn: &Connection, config: ResourceConfigId) -> StoreResult<()> {
        let (column, owner) = self.column();
        let sql = format!(
            "INSERT INTO resource_config_uses (resource_config_id, {column})
             SELECT ?1, ?2
             WHERE NOT EXISTS (
                 SELECT 1 FROM resource_config_uses WHERE resource_config_id = ?1 AND {column} = ?2
             )"
        );
        let inserted = conn
            .execute(&sql, params![config, owner])
            .map_err(|e| classify(e, StoreError::SafeRetry("resource_config_uses"), StoreError::ResourceConfigDisappeared))?;
        if inserted > 0 {
            debug!("{} now uses resource config {}", self, config);
        }
        Ok(())
    }

    /// Find or create the config for `type_name` and register this owner on
    /// it and on every cache in its custom-type chain
    pub fn use_resource_config(
        &self,
        db: &Db,
        type_name: &str,
        source: &Source,
        types: &ResourceTypes,
    ) -> StoreResult<UsedResourceConfig> {
        let descriptor = ResourceConfigDescriptor::resolve(type_name, source, types)?;
        db.transaction(|tx| {
            let config = config::find_or_create_in(tx, &descriptor)?;
            self.use_config_in(tx, config.id)?;
            for cache in config.parent_caches() {
                self.use_cache_in(tx, cache.id)?;
            }
            Ok(config)
        })
    }

    /// Drop every edge this owner holds, returning how many went away
    pub fn release_uses(&self, db: &Db) -> StoreResult<usize> {
        let (column, owner) = self.column();
        db.transaction(|tx| {
            let caches = tx.execute(
                &format!("DELETE FROM resource_cache_uses WHERE {column} = ?1"),
                params![owner],
            )?;
            let configs = tx.execute(
                &format!("DELETE FROM resource_config_uses WHERE {column} = ?1"),
                params![owner],
            )?;
            debug!("{} released {} cache and {} config uses", self, caches, configs);
            Ok(caches + configs)
        })
    }
}

impl fmt::Display for ResourceUser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ForBuild(id) => write!(f, "build {}", id),
            Self::ForResource(id) => write!(f, "resource {}", id),
            Self::ForResourceType(id) => write!(f, "resource type {}", id),
            Self::ForContainer(id) => write!(f, "container {}", id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::testing::*;
    use crate::resource::base_type;
    use crate::resource::hash::Version;
    use crate::resource::types::ResourceType;

    fn setup() -> (tempfile::TempDir, Db) {
        let (dir, db) = temp_db();
        base_type::find_or_create(&db.connection().unwrap(), "git").unwrap();
        (dir, db)
    }

    fn custom_types() -> ResourceTypes {
        let mut version = Version::new();
        version.insert("digest".into(), "sha256:1".into());
        ResourceTypes::new(vec![ResourceType {
            name: "pr".into(),
            type_: "git".into(),
            source: Source::new(),
            version: Some(version),
        }])
    }

    #[test]
    fn use_resource_config_is_idempotent() {
        let (_dir, db) = setup();
        let user = ResourceUser::ForResource(ResourceId(7));

        let a = user
            .use_resource_config(&db, "git", &Source::new(), &ResourceTypes::default())
            .unwrap();
        let b = user
            .use_resource_config(&db, "git", &Source::new(), &ResourceTypes::default())
            .unwrap();

        assert_eq!(a.id, b.id);
        assert_eq!(count(&db, "resource_config_uses"), 1);
    }

    #[test]
    fn custom_type_chain_caches_are_used() {
        let (_dir, db) = setup();
        let user = ResourceUser::ForResource(ResourceId(7));

        user.use_resource_config(&db, "pr", &Source::new(), &custom_types())
            .unwrap();
        assert_eq!(count(&db, "resource_config_uses"), 1);
        assert_eq!(count(&db, "resource_cache_uses"), 1);
    }

    #[test]
    fn release_uses_drops_every_edge() {
        let (_dir, db) = setup();
        let user = ResourceUser::ForResourceType(ResourceTypeId(3));
        let other = ResourceUser::ForResource(ResourceId(3));

        user.use_resource_config(&db, "pr", &Source::new(), &custom_types())
            .unwrap();
        other
            .use_resource_config(&db, "git", &Source::new(), &ResourceTypes::default())
            .unwrap();

        assert_eq!(user.release_uses(&db).unwrap(), 2);
        assert_eq!(count(&db, "resource_config_uses"), 1);
        assert_eq!(count(&db, "resource_cache_uses"), 0);
    }

    #[test]
    fn use_of_missing_cache_is_retryable() {
        let (_dir, db) = setup();
        let conn = db.connection().unwrap();
        let err = ResourceUser::ForResource(ResourceId(1))
            .use_cache_in(&conn, ResourceCacheId(404))
            .unwrap_err();
        assert!(matches!(err, StoreError::ResourceCacheDisappeared));
        assert!(err.is_retryable());
    }
}
