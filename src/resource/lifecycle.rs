//! Liveness cleanup for caches, worker projections and base types

use crate::build::BuildStatus;
use crate::db::Db;
use crate::error::StoreResult;
use tracing::info;

/// Collector-facing cleanup queries over the identity graph
#[derive(Debug, Clone)]
pub struct ResourceCacheLifecycle {
    db: Db,
}

impl ResourceCacheLifecycle {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Drop cache and config uses held by builds that have finished
    pub fn clean_uses_for_finished_builds(&self) -> StoreResult<usize> {
        let finished = format!(
            "SELECT id FROM builds WHERE status IN ({})",
            BuildStatus::finished_sql()
        );
        let deleted = self.db.transaction(|tx| {
            let caches = tx.execute(
                &format!("DELETE FROM resource_cache_uses WHERE build_id IN ({finished})"),
                [],
            )?;
            let configs = tx.execute(
                &format!("DELETE FROM resource_config_uses WHERE build_id IN ({finished})"),
                [],
            )?;
            Ok(caches + configs)
        })?;

        if deleted > 0 {
            info!("Released {} uses held by finished builds", deleted);
        }
        Ok(deleted)
    }

    /// Drop worker projections of caches nobody uses any more
    ///
    /// The backing volume loses its payload and becomes an orphan.
    pub fn clean_unused_worker_resource_caches(&self) -> StoreResult<usize> {
        let deleted = self.db.connection()?.execute(
            "DELETE FROM worker_resource_caches
             WHERE resource_cache_id NOT IN (SELECT resource_cache_id FROM resource_cache_uses)",
            [],
        )?;

        if deleted > 0 {
            info!("Removed {} unused worker resource caches", deleted);
        }
        Ok(deleted)
    }

    /// Delete caches with no use, no worker projection and no child config
    pub fn clean_unreferenced_caches(&self) -> StoreResult<usize> {
        let deleted = self.db.connection()?.execute(
            "DELETE FROM resource_caches
             WHERE id NOT IN (SELECT resource_cache_id FROM resource_cache_uses)
               AND id NOT IN (SELECT resource_cache_id FROM worker_resource_caches)
               AND id NOT IN (
                   SELECT resource_cache_id FROM resource_configs
                   WHERE resource_cache_id IS NOT NULL
               )",
            [],
        )?;

        if deleted > 0 {
            info!("Removed {} unreferenced resource caches", deleted);
        }
        Ok(deleted)
    }

    /// Delete base types no worker provides and no config refers to
    pub fn clean_unused_base_resource_types(&self) -> StoreResult<usize> {
        let deleted = self.db.connection()?.execute(
            "DELETE FROM base_resource_types
             WHERE id NOT IN (SELECT base_resource_type_id FROM worker_base_resource_types)
               AND id NOT IN (
                   SELECT base_resource_type_id FROM resource_configs
                   WHERE base_resource_type_id IS NOT NULL
               )",
            [],
        )?;

        if deleted > 0 {
            info!("Removed {} unused base resource types", deleted);
        }
        Ok(deleted)
    }
}
