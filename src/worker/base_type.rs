//! Base resource types materialized on a specific worker

use crate::error::StoreResult;
use crate::ids::{BaseResourceTypeId, WorkerBaseResourceTypeId};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;

/// The image a worker provides for a base resource type
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UsedWorkerBaseResourceType {
    pub id: WorkerBaseResourceTypeId,
    pub worker_name: String,
    pub base_resource_type_id: BaseResourceTypeId,
    pub name: String,
    pub image: String,
    pub version: String,
}

const COLUMNS: &str = "wbrt.id, wbrt.worker_name, wbrt.base_resource_type_id, brt.name, wbrt.image, wbrt.version";

fn from_row(row: &Row<'_>) -> rusqlite::Result<UsedWorkerBaseResourceType> {
    Ok(UsedWorkerBaseResourceType {
        id: row.get(0)?,
        worker_name: row.get(1)?,
        base_resource_type_id: row.get(2)?,
        name: row.get(3)?,
        image: row.get(4)?,
        version: row.get(5)?,
    })
}

/// Find what `worker` has for the base type `name`
pub fn find(
    conn: &Connection,
    worker_name: &str,
    name: &str,
) -> StoreResult<Option<UsedWorkerBaseResourceType>> {
    let found = conn
        .query_row(
            &format!(
                "SELECT {COLUMNS}
                 FROM worker_base_resource_types wbrt
                 JOIN base_resource_types brt ON brt.id = wbrt.base_resource_type_id
                 WHERE wbrt.worker_name = ?1 AND brt.name = ?2"
            ),
            params![worker_name, name],
            from_row,
        )
        .optional()?;
    Ok(found)
}

pub fn find_by_id(
    conn: &Connection,
    id: WorkerBaseResourceTypeId,
) -> StoreResult<Option<UsedWorkerBaseResourceType>> {
    let found = conn
        .query_row(
            &format!(
                "SELECT {COLUMNS}
                 FROM worker_base_resource_types wbrt
                 JOIN base_resource_types brt ON brt.id = wbrt.base_resource_type_id
                 WHERE wbrt.id = ?1"
            ),
            params![id],
            from_row,
        )
        .optional()?;
    Ok(found)
}

/// Every base type materialized on `worker`
pub fn for_worker(conn: &Connection, worker_name: &str) -> StoreResult<Vec<UsedWorkerBaseResourceType>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {COLUMNS}
         FROM worker_base_resource_types wbrt
         JOIN base_resource_types brt ON brt.id = wbrt.base_resource_type_id
         WHERE wbrt.worker_name = ?1
         ORDER BY brt.name"
    ))?;
    let rows = stmt
        .query_map(params![worker_name], from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}
