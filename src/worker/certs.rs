//! CA certificate bundles provided by a worker

use crate::db::classify;
use crate::error::{StoreError, StoreResult};
use crate::ids::WorkerResourceCertsId;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerResourceCerts {
    pub worker_name: String,
    pub certs_path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UsedWorkerResourceCerts {
    pub id: WorkerResourceCertsId,
}

impl WorkerResourceCerts {
    pub(crate) fn find_in(&self, conn: &Connection) -> StoreResult<Option<UsedWorkerResourceCerts>> {
        let id = conn
            .query_row(
                "SELECT id FROM worker_resource_certs WHERE worker_name = ?1 AND certs_path = ?2",
                params![self.worker_name, self.certs_path],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id.map(|id| UsedWorkerResourceCerts { id }))
    }

    pub(crate) fn find_or_create_in(&self, conn: &Connection) -> StoreResult<UsedWorkerResourceCerts> {
        if let Some(found) = self.find_in(conn)? {
            return Ok(found);
        }

        let id = conn
            .query_row(
                "INSERT INTO worker_resource_certs (worker_name, certs_path) VALUES (?1, ?2) RETURNING id",
                params![self.worker_name, self.certs_path],
                |row| row.get(0),
            )
            .map_err(|e| {
                classify(
                    e,
                    StoreError::SafeRetry("worker_resource_certs"),
                    StoreError::WorkerNotFound(self.worker_name.clone()),
                )
            })?;
        Ok(UsedWorkerResourceCerts { id })
    }
}
