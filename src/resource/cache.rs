//! Resource caches: one row per (config, version, params)

use super::base_type::UsedBaseResourceType;
use super::config::{self, ResourceConfigDescriptor, UsedResourceConfig};
use super::hash::{map_hash, version_json, Params, Source, Version};
use super::types::ResourceTypes;
use super::user::ResourceUser;
use crate::db::{classify, Db};
use crate::error::{StoreError, StoreResult};
use crate::ids::{ResourceCacheId, ResourceConfigId};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use tracing::debug;

/// A resource cache that may or may not exist yet
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceCacheDescriptor {
    pub config: ResourceConfigDescriptor,
    pub version: Version,
    pub params: Params,
}

impl ResourceCacheDescriptor {
    pub fn resolve(
        type_name: &str,
        version: &Version,
        source: &Source,
        params: Option<&Params>,
        types: &ResourceTypes,
    ) -> StoreResult<Self> {
        Ok(Self {
            config: ResourceConfigDescriptor::resolve(type_name, source, types)?,
            version: version.clone(),
            params: params.cloned().unwrap_or_default(),
        })
    }

    fn params_hash(&self) -> String {
        map_hash(Some(&self.params))
    }
}

/// A stored resource cache and the config it belongs to
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UsedResourceCache {
    pub id: ResourceCacheId,
    pub config: UsedResourceConfig,
    pub version: Version,
}

impl UsedResourceCache {
    /// Base type at the end of the chain
    pub fn base_resource_type(&self) -> &UsedBaseResourceType {
        self.config.origin_base_resource_type()
    }
}

fn lookup_id(
    conn: &Connection,
    config: ResourceConfigId,
    version: &str,
    params_hash: &str,
) -> StoreResult<Option<ResourceCacheId>> {
    let id = conn
        .query_row(
            "SELECT id FROM resource_caches
             WHERE resource_config_id = ?1 AND version = ?2 AND params_hash = ?3",
            params![config, version, params_hash],
            |row| row.get(0),
        )
        .optional()?;
    Ok(id)
}

pub(crate) fn find_or_create_in(
    conn: &Connection,
    descriptor: &ResourceCacheDescriptor,
) -> StoreResult<UsedResourceCache> {
    let config = config::find_or_create_in(conn, &descriptor.config)?;
    let version = version_json(&descriptor.version);
    let params_hash = descriptor.params_hash();

    let id = match lookup_id(conn, config.id, &version, &params_hash)? {
        Some(id) => id,
        None => {
            let id = conn
                .query_row(
                    "INSERT INTO resource_caches (resource_config_id, version, params_hash)
                     VALUES (?1, ?2, ?3) RETURNING id",
                    params![config.id, version, params_hash],
                    |row| row.get(0),
                )
                .map_err(|e| {
                    classify(
                        e,
                        StoreError::ResourceCacheAlreadyExists,
                        StoreError::ResourceConfigDisappeared,
                    )
                })?;
            debug!("Created resource cache {} for config {}", id, config.id);
            id
        }
    };

    Ok(UsedResourceCache {
        id,
        config,
        version: descriptor.version.clone(),
    })
}

pub(crate) fn find_in(
    conn: &Connection,
    descriptor: &ResourceCacheDescriptor,
) -> StoreResult<Option<UsedResourceCache>> {
    let Some(config) = config::find_in(conn, &descriptor.config)? else {
        return Ok(None);
    };

    let id = lookup_id(
        conn,
        config.id,
        &version_json(&descriptor.version),
        &descriptor.params_hash(),
    )?;

    Ok(id.map(|id| UsedResourceCache {
        id,
        config,
        version: descriptor.version.clone(),
    }))
}

/// Load a stored cache and its config chain by id
pub(crate) fn load(conn: &Connection, id: ResourceCacheId) -> StoreResult<Option<UsedResourceCache>> {
    let row = conn
        .query_row(
            "SELECT resource_config_id, version FROM resource_caches WHERE id = ?1",
            params![id],
            |row| Ok((row.get::<_, ResourceConfigId>(0)?, row.get::<_, String>(1)?)),
        )
        .optional()?;

    let Some((config_id, version)) = row else {
        return Ok(None);
    };

    let config = config::load(conn, config_id)?
        .ok_or_else(|| StoreError::corrupt("resource_caches", id.get(), "config missing"))?;
    let version: Version = serde_json::from_str(&version)?;

    Ok(Some(UsedResourceCache { id, config, version }))
}

/// Summary row for listings
#[derive(Debug, Clone, Serialize)]
pub struct ResourceCacheSummary {
    pub id: ResourceCacheId,
    pub resource_config_id: ResourceConfigId,
    pub base_resource_type: String,
    pub version: Version,
    pub uses: i64,
    pub workers: i64,
}

/// Service over resource caches
#[derive(Debug, Clone)]
pub struct ResourceCacheFactory {
    db: Db,
}

impl ResourceCacheFactory {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Find or create a cache and register `user` as using it
    ///
    /// The config chain, the cache and the use edge are written in one
    /// transaction. Retryable errors mean the whole call should be repeated.
    pub fn find_or_create_resource_cache(
        &self,
        user: &ResourceUser,
        type_name: &str,
        version: &Version,
        source: &Source,
        params: Option<&Params>,
        types: &ResourceTypes,
    ) -> StoreResult<UsedResourceCache> {
        let descriptor = ResourceCacheDescriptor::resolve(type_name, version, source, params, types)?;
        self.db.transaction(|tx| {
            let cache = find_or_create_in(tx, &descriptor)?;
            user.use_cache_in(tx, cache.id)?;
            Ok(cache)
        })
    }

    /// Find an existing cache without creating or using anything
    pub fn find_resource_cache(
        &self,
        type_name: &str,
        version: &Version,
        source: &Source,
        params: Option<&Params>,
        types: &ResourceTypes,
    ) -> StoreResult<Option<UsedResourceCache>> {
        let descriptor = ResourceCacheDescriptor::resolve(type_name, version, source, params, types)?;
        self.db.read(|conn| find_in(conn, &descriptor))
    }

    /// Load a cache and its config chain by id
    pub fn find_resource_cache_by_id(
        &self,
        id: ResourceCacheId,
    ) -> StoreResult<Option<UsedResourceCache>> {
        self.db.read(|conn| load(conn, id))
    }

    /// Every cache with its use and worker counts
    pub fn list(&self) -> StoreResult<Vec<ResourceCacheSummary>> {
        self.db.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT rc.id, rc.resource_config_id, rc.version,
                        (SELECT COUNT(*) FROM resource_cache_uses u WHERE u.resource_cache_id = rc.id),
                        (SELECT COUNT(*) FROM worker_resource_caches w WHERE w.resource_cache_id = rc.id)
                 FROM resource_caches rc
                 ORDER BY rc.id",
            )?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((
                        row.get::<_, ResourceCacheId>(0)?,
                        row.get::<_, ResourceConfigId>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, i64>(4)?,
                    ))
                })?
                .collect::<Result<Vec<_>, _>>()?;

            let mut summaries = Vec::with_capacity(rows.len());
            for (id, config_id, version, uses, workers) in rows {
                let config = config::load(conn, config_id)?.ok_or_else(|| {
                    StoreError::corrupt("resource_caches", id.get(), "config missing")
                })?;
                summaries.push(ResourceCacheSummary {
                    id,
                    resource_config_id: config_id,
                    base_resource_type: config.origin_base_resource_type().name.clone(),
                    version: serde_json::from_str(&version)?,
                    uses,
                    workers,
                });
            }
            Ok(summaries)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::testing::*;
    use crate::ids::ResourceId;
    use crate::resource::base_type;
    use serde_json::json;

    fn setup() -> (tempfile::TempDir, Db, ResourceCacheFactory) {
        let (dir, db) = temp_db();
        base_type::find_or_create(&db.connection().unwrap(), "git").unwrap();
        let factory = ResourceCacheFactory::new(db.clone());
        (dir, db, factory)
    }

    fn version(r: &str) -> Version {
        let mut v = Version::new();
        v.insert("ref".into(), r.into());
        v
    }

    fn uri(u: &str) -> Source {
        let mut s = Source::new();
        s.insert("uri".into(), json!(u));
        s
    }

    #[test]
    fn identical_inputs_converge() {
        let (_dir, db, factory) = setup();
        let user = ResourceUser::ForResource(ResourceId(1));

        let a = factory
            .find_or_create_resource_cache(&user, "git", &version("abc"), &uri("x"), None, &ResourceTypes::default())
            .unwrap();
        let b = factory
            .find_or_create_resource_cache(
                &user,
                "git",
                &version("abc"),
                &uri("x"),
                Some(&Params::new()),
                &ResourceTypes::default(),
            )
            .unwrap();

        assert_eq!(a.id, b.id);
        assert_eq!(count(&db, "resource_caches"), 1);
        assert_eq!(count(&db, "resource_cache_uses"), 1);
    }

    #[test]
    fn different_params_make_different_caches() {
        let (_dir, db, factory) = setup();
        let user = ResourceUser::ForResource(ResourceId(1));
        let mut params = Params::new();
        params.insert("depth".into(), json!(1));

        let a = factory
            .find_or_create_resource_cache(&user, "git", &version("abc"), &uri("x"), None, &ResourceTypes::default())
            .unwrap();
        let b = factory
            .find_or_create_resource_cache(&user, "git", &version("abc"), &uri("x"), Some(&params), &ResourceTypes::default())
            .unwrap();

        assert_ne!(a.id, b.id);
        assert_eq!(a.config.id, b.config.id);
        assert_eq!(count(&db, "resource_caches"), 2);
    }

    #[test]
    fn find_by_id_loads_chain() {
        let (_dir, _db, factory) = setup();
        let user = ResourceUser::ForResource(ResourceId(1));
        let cache = factory
            .find_or_create_resource_cache(&user, "git", &version("abc"), &uri("x"), None, &ResourceTypes::default())
            .unwrap();

        let loaded = factory.find_resource_cache_by_id(cache.id).unwrap().unwrap();
        assert_eq!(loaded, cache);
        assert_eq!(loaded.base_resource_type().name, "git");
    }

    #[test]
    fn list_reports_uses() {
        let (_dir, _db, factory) = setup();
        let cache = factory
            .find_or_create_resource_cache(
                &ResourceUser::ForResource(ResourceId(1)),
                "git",
                &version("abc"),
                &uri("x"),
                None,
                &ResourceTypes::default(),
            )
            .unwrap();
        factory
            .find_or_create_resource_cache(
                &ResourceUser::ForResource(ResourceId(2)),
                "git",
                &version("abc"),
                &uri("x"),
                None,
                &ResourceTypes::default(),
            )
            .unwrap();

        let listed = factory.list().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, cache.id);
        assert_eq!(listed[0].uses, 2);
        assert_eq!(listed[0].workers, 0);
        assert_eq!(listed[0].base_resource_type, "git");
    }
}
