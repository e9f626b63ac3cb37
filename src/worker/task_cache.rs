//! Task caches and their per-worker projections

use crate::db::classify;
use crate::error::{StoreError, StoreResult};
use crate::ids::{JobId, TaskCacheId, WorkerTaskCacheId};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

/// A cache directory of a task step, shared across builds of one job
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskCache {
    pub job_id: JobId,
    pub step_name: String,
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UsedTaskCache {
    pub id: TaskCacheId,
    pub job_id: JobId,
    pub step_name: String,
    pub path: String,
}

impl TaskCache {
    pub(crate) fn find_in(&self, conn: &Connection) -> StoreResult<Option<UsedTaskCache>> {
        let id = conn
            .query_row(
                "SELECT id FROM task_caches WHERE job_id = ?1 AND step_name = ?2 AND path = ?3",
                params![self.job_id, self.step_name, self.path],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id.map(|id| self.used(id)))
    }

    pub(crate) fn find_or_create_in(&self, conn: &Connection) -> StoreResult<UsedTaskCache> {
        if let Some(found) = self.find_in(conn)? {
            return Ok(found);
        }

        let id = conn
            .query_row(
                "INSERT INTO task_caches (job_id, step_name, path) VALUES (?1, ?2, ?3) RETURNING id",
                params![self.job_id, self.step_name, self.path],
                |row| row.get(0),
            )
            .map_err(|e| classify(e, StoreError::SafeRetry("task_caches"), StoreError::SafeRetry("task_caches")))?;
        Ok(self.used(id))
    }

    fn used(&self, id: TaskCacheId) -> UsedTaskCache {
        UsedTaskCache {
            id,
            job_id: self.job_id,
            step_name: self.step_name.clone(),
            path: self.path.clone(),
        }
    }
}

/// A task cache materialized on one worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerTaskCache {
    pub worker_name: String,
    pub task_cache: UsedTaskCache,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UsedWorkerTaskCache {
    pub id: WorkerTaskCacheId,
    pub worker_name: String,
    pub task_cache_id: TaskCacheId,
}

impl WorkerTaskCache {
    pub(crate) fn find_in(&self, conn: &Connection) -> StoreResult<Option<UsedWorkerTaskCache>> {
        let id = conn
            .query_row(
                "SELECT id FROM worker_task_caches WHERE worker_name = ?1 AND task_cache_id = ?2",
                params![self.worker_name, self.task_cache.id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id.map(|id| self.used(id)))
    }

    pub(crate) fn find_or_create_in(&self, conn: &Connection) -> StoreResult<UsedWorkerTaskCache> {
        if let Some(found) = self.find_in(conn)? {
            return Ok(found);
        }

        let id = conn
            .query_row(
                "INSERT INTO worker_task_caches (worker_name, task_cache_id) VALUES (?1, ?2) RETURNING id",
                params![self.worker_name, self.task_cache.id],
                |row| row.get(0),
            )
            .map_err(|e| {
                classify(
                    e,
                    StoreError::SafeRetry("worker_task_caches"),
                    StoreError::WorkerNotFound(self.worker_name.clone()),
                )
            })?;
        Ok(self.used(id))
    }

    fn used(&self, id: WorkerTaskCacheId) -> UsedWorkerTaskCache {
        UsedWorkerTaskCache {
            id,
            worker_name: self.worker_name.clone(),
            task_cache_id: self.task_cache.id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::testing::*;

    #[test]
    fn find_or_create_task_cache_and_projection() {
        let (_dir, db) = temp_db();
        insert_worker(&db, "w1", "running");
        let conn = db.connection().unwrap();

        let task_cache = TaskCache {
            job_id: JobId(1),
            step_name: "build".into(),
            path: "node_modules".into(),
        };
        let used = task_cache.find_or_create_in(&conn).unwrap();
        assert_eq!(task_cache.find_or_create_in(&conn).unwrap(), used);

        let wtc = WorkerTaskCache {
            worker_name: "w1".into(),
            task_cache: used,
        };
        let first = wtc.find_or_create_in(&conn).unwrap();
        assert_eq!(wtc.find_in(&conn).unwrap(), Some(first));
    }

    #[test]
    fn projection_on_unknown_worker() {
        let (_dir, db) = temp_db();
        let conn = db.connection().unwrap();
        let used = TaskCache {
            job_id: JobId(1),
            step_name: "build".into(),
            path: "cache".into(),
        }
        .find_or_create_in(&conn)
        .unwrap();

        let err = WorkerTaskCache {
            worker_name: "ghost".into(),
            task_cache: used,
        }
        .find_or_create_in(&conn)
        .unwrap_err();
        assert!(matches!(err, StoreError::WorkerNotFound(_)));
    }
}
