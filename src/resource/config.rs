//! Resource config identity graph
//!
//! A resource config is a (type, source) pair. Its parent is either a base
//! resource type or, for a custom type, the resource cache of that type's
//! own image. The chain always ends at a base type.

use super::base_type::{self, UsedBaseResourceType};
use super::cache::{self, ResourceCacheDescriptor, UsedResourceCache};
use super::hash::{map_hash, Params, Source};
use super::types::ResourceTypes;
use crate::check::lock::{LockFactory, LockId, LockGuard};
use crate::db::{self, classify, Constraint, Db};
use crate::error::{StoreError, StoreResult};
use crate::ids::{BaseResourceTypeId, ResourceCacheId, ResourceConfigId};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, info, warn};

/// What a config is parented by, before anything is stored
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigParent {
    Base(String),
    Cache(Box<ResourceCacheDescriptor>),
}

/// A resource config that may or may not exist yet
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceConfigDescriptor {
    pub parent: ConfigParent,
    pub source: Source,
}

impl ResourceConfigDescriptor {
    /// Resolve `type_name` against the custom types in scope
    ///
    /// A custom type becomes a cache parent fetched at the type's current
    /// version, resolved recursively in a scope that excludes the type itself.
    pub fn resolve(type_name: &str, source: &Source, types: &ResourceTypes) -> StoreResult<Self> {
        let parent = match types.lookup(type_name) {
            Some(custom) => {
                let version = custom
                    .version
                    .clone()
                    .ok_or_else(|| StoreError::CustomTypeVersionMissing(custom.name.clone()))?;
                let inner = Self::resolve(&custom.type_, &custom.source, &types.without(type_name))?;
                ConfigParent::Cache(Box::new(ResourceCacheDescriptor {
                    config: inner,
                    version,
                    params: Params::new(),
                }))
            }
            None => ConfigParent::Base(type_name.to_string()),
        };

        Ok(Self {
            parent,
            source: source.clone(),
        })
    }

    fn source_hash(&self) -> String {
        map_hash(Some(&self.source))
    }
}

/// A stored config's parent
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UsedConfigParent {
    Base(UsedBaseResourceType),
    Cache(Box<UsedResourceCache>),
}

/// A resource config row together with its parent chain
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UsedResourceConfig {
    pub id: ResourceConfigId,
    pub parent: UsedConfigParent,
}

impl UsedResourceConfig {
    /// Base type at the end of the parent chain
    pub fn origin_base_resource_type(&self) -> &UsedBaseResourceType {
        match &self.parent {
            UsedConfigParent::Base(base) => base,
            UsedConfigParent::Cache(cache) => cache.config.origin_base_resource_type(),
        }
    }

    /// Caches in the parent chain, nearest first
    pub fn parent_caches(&self) -> Vec<&UsedResourceCache> {
        let mut caches = Vec::new();
        let mut parent = &self.parent;
        while let UsedConfigParent::Cache(cache) = parent {
            caches.push(cache.as_ref());
            parent = &cache.config.parent;
        }
        caches
    }

    fn parent_columns(&self) -> (Option<BaseResourceTypeId>, Option<ResourceCacheId>) {
        match &self.parent {
            UsedConfigParent::Base(base) => (Some(base.id), None),
            UsedConfigParent::Cache(cache) => (None, Some(cache.id)),
        }
    }
}

fn lookup_id(
    conn: &Connection,
    parent: &UsedConfigParent,
    source_hash: &str,
) -> StoreResult<Option<ResourceConfigId>> {
    let id = match parent {
        UsedConfigParent::Base(base) => conn
            .query_row(
                "SELECT id FROM resource_configs
                 WHERE base_resource_type_id = ?1 AND source_hash = ?2",
                params![base.id, source_hash],
                |row| row.get(0),
            )
            .optional()?,
        UsedConfigParent::Cache(cache) => conn
            .query_row(
                "SELECT id FROM resource_configs
                 WHERE resource_cache_id = ?1 AND source_hash = ?2",
                params![cache.id, source_hash],
                |row| row.get(0),
            )
            .optional()?,
    };
    Ok(id)
}

/// Find or create the config and its whole parent chain
///
/// Must run inside an IMMEDIATE transaction. A unique or foreign-key
/// violation on insert surfaces as a retryable error.
pub(crate) fn find_or_create_in(
    conn: &Connection,
    descriptor: &ResourceConfigDescriptor,
) -> StoreResult<UsedResourceConfig> {
    let parent = match &descriptor.parent {
        ConfigParent::Base(name) => UsedConfigParent::Base(
            base_type::find(conn, name)?
                .ok_or_else(|| StoreError::BaseResourceTypeNotFound(name.clone()))?,
        ),
        ConfigParent::Cache(cache) => {
            UsedConfigParent::Cache(Box::new(cache::find_or_create_in(conn, cache)?))
        }
    };

    let source_hash = descriptor.source_hash();
    if let Some(id) = lookup_id(conn, &parent, &source_hash)? {
        return Ok(UsedResourceConfig { id, parent });
    }

    let mut config = UsedResourceConfig {
        id: ResourceConfigId(0),
        parent,
    };
    let (base_id, cache_id) = config.parent_columns();
    config.id = conn
        .query_row(
            "INSERT INTO resource_configs (base_resource_type_id, resource_cache_id, source_hash)
             VALUES (?1, ?2, ?3) RETURNING id",
            params![base_id, cache_id, source_hash],
            |row| row.get(0),
        )
        .map_err(|e| {
            classify(
                e,
                StoreError::ResourceConfigAlreadyExists,
                StoreError::ResourceConfigParentDisappeared,
            )
        })?;

    debug!("Created resource config {}", config.id);
    Ok(config)
}

/// Find the config without creating anything
pub(crate) fn find_in(
    conn: &Connection,
    descriptor: &ResourceConfigDescriptor,
) -> StoreResult<Option<UsedResourceConfig>> {
    let parent = match &descriptor.parent {
        ConfigParent::Base(name) => match base_type::find(conn, name)? {
            Some(base) => UsedConfigParent::Base(base),
            None => return Ok(None),
        },
        ConfigParent::Cache(cache) => match cache::find_in(conn, cache)? {
            Some(cache) => UsedConfigParent::Cache(Box::new(cache)),
            None => return Ok(None),
        },
    };

    let id = lookup_id(conn, &parent, &descriptor.source_hash())?;
    Ok(id.map(|id| UsedResourceConfig { id, parent }))
}

/// Load a stored config and its parent chain by id
pub(crate) fn load(conn: &Connection, id: ResourceConfigId) -> StoreResult<Option<UsedResourceConfig>> {
    let row = conn
        .query_row(
            "SELECT rc.base_resource_type_id, brt.name, rc.resource_cache_id
             FROM resource_configs rc
             LEFT JOIN base_resource_types brt ON brt.id = rc.base_resource_type_id
             WHERE rc.id = ?1",
            params![id],
            |row| {
                Ok((
                    row.get::<_, Option<BaseResourceTypeId>>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, Option<ResourceCacheId>>(2)?,
                ))
            },
        )
        .optional()?;

    let Some(row) = row else {
        return Ok(None);
    };

    let parent = match row {
        (Some(base_id), Some(name), None) => {
            UsedConfigParent::Base(UsedBaseResourceType { id: base_id, name })
        }
        (None, _, Some(cache_id)) => {
            let cache = cache::load(conn, cache_id)?.ok_or_else(|| {
                StoreError::corrupt("resource_configs", id.get(), "parent cache missing")
            })?;
            UsedConfigParent::Cache(Box::new(cache))
        }
        _ => {
            return Err(StoreError::corrupt(
                "resource_configs",
                id.get(),
                "parent must be exactly one of base type or cache",
            ))
        }
    };

    Ok(Some(UsedResourceConfig { id, parent }))
}

/// Service over the resource config graph
#[derive(Debug, Clone)]
pub struct ResourceConfigFactory {
    db: Db,
}

impl ResourceConfigFactory {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Find or create the config for `type_name` with `source`
    pub fn find_or_create_resource_config(
        &self,
        type_name: &str,
        source: &Source,
        types: &ResourceTypes,
    ) -> StoreResult<UsedResourceConfig> {
        let descriptor = ResourceConfigDescriptor::resolve(type_name, source, types)?;
        self.db.transaction(|tx| find_or_create_in(tx, &descriptor))
    }

    /// Find the config for `type_name` with `source` without creating it
    pub fn find_resource_config(
        &self,
        type_name: &str,
        source: &Source,
        types: &ResourceTypes,
    ) -> StoreResult<Option<UsedResourceConfig>> {
        let descriptor = ResourceConfigDescriptor::resolve(type_name, source, types)?;
        self.db.read(|conn| find_in(conn, &descriptor))
    }

    /// Load a config and its parent chain by id
    pub fn find_resource_config_by_id(
        &self,
        id: ResourceConfigId,
    ) -> StoreResult<Option<UsedResourceConfig>> {
        self.db.read(|conn| load(conn, id))
    }

    /// Record or clear the error of the last check
    pub fn set_check_error(&self, id: ResourceConfigId, error: Option<&str>) -> StoreResult<()> {
        let updated = self.db.connection()?.execute(
            "UPDATE resource_configs SET check_error = ?1 WHERE id = ?2",
            params![error, id],
        )?;
        if updated == 0 {
            return Err(StoreError::missing("resource config", id.to_string()));
        }
        Ok(())
    }

    /// Error recorded by the last check, if any
    pub fn check_error(&self, id: ResourceConfigId) -> StoreResult<Option<String>> {
        let error = self
            .db
            .connection()?
            .query_row(
                "SELECT check_error FROM resource_configs WHERE id = ?1",
                params![id],
                |row| row.get::<_, Option<String>>(0),
            )
            .optional()?
            .ok_or_else(|| StoreError::missing("resource config", id.to_string()))?;
        Ok(error)
    }

    /// Take the checking lock for a config if its check interval has elapsed
    ///
    /// Returns `None` when another checker holds the lock or the config was
    /// checked less than `interval` ago. `immediate` skips the interval test.
    /// On success `last_checked` has already been bumped to now.
    pub fn acquire_checking_lock_with_interval_check(
        &self,
        id: ResourceConfigId,
        locks: &dyn LockFactory,
        interval: Duration,
        immediate: bool,
    ) -> StoreResult<Option<LockGuard>> {
        let Some(lock) = locks.acquire(LockId::ResourceConfigChecking(id))? else {
            debug!("Checking lock for resource config {} is held", id);
            return Ok(None);
        };

        let now = db::now();
        let interval = i64::try_from(interval.as_secs()).unwrap_or(i64::MAX);
        let updated = self.db.transaction(|tx| {
            Ok(tx.execute(
                "UPDATE resource_configs SET last_checked = ?1
                 WHERE id = ?2 AND (?3 OR last_checked + ?4 <= ?1)",
                params![now, id, immediate, interval],
            )?)
        })?;

        if updated == 0 {
            debug!("Resource config {} checked within the last {}s", id, interval);
            lock.release();
            return Ok(None);
        }

        Ok(Some(lock))
    }

    /// Delete configs no check session, cache or use refers to
    ///
    /// A foreign-key violation means a reference appeared concurrently; it is
    /// logged and the pass reports zero deletions.
    pub fn clean_unreferenced_configs(&self) -> StoreResult<usize> {
        let conn = self.db.connection()?;
        let result = conn.execute(
            "DELETE FROM resource_configs
             WHERE id NOT IN (SELECT resource_config_id FROM resource_config_check_sessions)
               AND id NOT IN (SELECT resource_config_id FROM resource_caches)
               AND id NOT IN (SELECT resource_config_id FROM resource_config_uses)",
            [],
        );

        match result {
            Ok(deleted) => {
                if deleted > 0 {
                    info!("Removed {} unreferenced resource configs", deleted);
                }
                Ok(deleted)
            }
            Err(e) if db::constraint(&e) == Some(Constraint::ForeignKey) => {
                warn!("Resource config gained a reference during cleanup: {}", e);
                Ok(0)
            }
            Err(e) => Err(e.into()),
        }
    }
}
