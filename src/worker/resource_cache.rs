//! A worker's materialized copy of a resource cache

use super::base_type;
use crate::db::{classify, Db};
use crate::error::{StoreError, StoreResult};
use crate::ids::{ResourceCacheId, WorkerBaseResourceTypeId, WorkerResourceCacheId};
use crate::resource::UsedResourceCache;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use tracing::debug;

/// Request to materialize `resource_cache` on `worker_name`
#[derive(Debug, Clone)]
pub struct WorkerResourceCache {
    pub worker_name: String,
    pub resource_cache: UsedResourceCache,
}

/// A stored worker resource cache
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UsedWorkerResourceCache {
    pub id: WorkerResourceCacheId,
    pub worker_base_resource_type_id: WorkerBaseResourceTypeId,
    pub resource_cache_id: ResourceCacheId,
}

impl WorkerResourceCache {
    /// Find or create the projection
    ///
    /// Fails with `WorkerBaseResourceTypeDisappeared` when the worker does not
    /// have the cache's base type: it deregistered or changed that type.
    pub(crate) fn find_or_create_in(&self, conn: &Connection) -> StoreResult<UsedWorkerResourceCache> {
        let base_name = &self.resource_cache.base_resource_type().name;
        let wbrt = base_type::find(conn, &self.worker_name, base_name)?.ok_or_else(|| {
            StoreError::WorkerBaseResourceTypeDisappeared {
                worker: self.worker_name.clone(),
                name: base_name.clone(),
            }
        })?;

        if let Some(found) = lookup(conn, wbrt.id, self.resource_cache.id)? {
            return Ok(found);
        }

        let id = conn
            .query_row(
                "INSERT INTO worker_resource_caches (worker_base_resource_type_id, resource_cache_id)
                 VALUES (?1, ?2) RETURNING id",
                params![wbrt.id, self.resource_cache.id],
                |row| row.get(0),
            )
            .map_err(|e| {
                classify(
                    e,
                    StoreError::SafeRetry("worker_resource_caches"),
                    StoreError::ResourceCacheDisappeared,
                )
            })?;

        debug!(
            "Materialized resource cache {} on worker {}",
            self.resource_cache.id, self.worker_name
        );
        Ok(UsedWorkerResourceCache {
            id,
            worker_base_resource_type_id: wbrt.id,
            resource_cache_id: self.resource_cache.id,
        })
    }

    pub(crate) fn find_in(&self, conn: &Connection) -> StoreResult<Option<UsedWorkerResourceCache>> {
        let base_name = &self.resource_cache.base_resource_type().name;
        let Some(wbrt) = base_type::find(conn, &self.worker_name, base_name)? else {
            return Ok(None);
        };
        lookup(conn, wbrt.id, self.resource_cache.id)
    }

    /// Find or create the projection in its own transaction
    pub fn find_or_create(&self, db: &Db) -> StoreResult<UsedWorkerResourceCache> {
        db.transaction(|tx| self.find_or_create_in(tx))
    }

    pub fn find(&self, db: &Db) -> StoreResult<Option<UsedWorkerResourceCache>> {
        db.read(|conn| self.find_in(conn))
    }
}

fn lookup(
    conn: &Connection,
    wbrt: WorkerBaseResourceTypeId,
    cache: ResourceCacheId,
) -> StoreResult<Option<UsedWorkerResourceCache>> {
    let id = conn
        .query_row(
            "SELECT id FROM worker_resource_caches
             WHERE worker_base_resource_type_id = ?1 AND resource_cache_id = ?2",
            params![wbrt, cache],
            |row| row.get(0),
        )
        .optional()?;

    Ok(id.map(|id| UsedWorkerResourceCache {
        id,
        worker_base_resource_type_id: wbrt,
        resource_cache_id: cache,
    }))
}
