//! Volume rows: creation per payload kind, lookup and orphan discovery

use super::payload::StoredPayload;
use super::state::{CreatedVolume, CreatingVolume, FailedVolume, Volume, VolumeInfo, VolumeState};
use super::VolumePayload;
use crate::container::CreatingContainer;
use crate::db::{classify, Db};
use crate::error::{StoreError, StoreResult};
use crate::ids::{ContainerId, JobId, TeamId, VolumeId};
use crate::resource::UsedResourceCache;
use crate::worker::{
    TaskCache, UsedWorkerBaseResourceType, UsedWorkerResourceCerts, UsedWorkerTaskCache,
    WorkerResourceCache, WorkerTaskCache,
};
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, Row};
use tracing::debug;
use uuid::Uuid;

const SELECT: &str = "SELECT v.id, v.handle, v.worker_name, v.state, v.team_id,
        v.container_id, c.handle, v.path,
        v.worker_resource_cache_id, wrc.resource_cache_id,
        v.worker_base_resource_type_id, v.worker_task_cache_id, v.worker_resource_certs_id,
        p.handle
    FROM volumes v
    LEFT JOIN containers c ON c.id = v.container_id
    LEFT JOIN worker_resource_caches wrc ON wrc.id = v.worker_resource_cache_id
    LEFT JOIN volumes p ON p.id = v.parent_id";

/// Columns that must all be NULL for a volume to be unreferenced
const NO_PAYLOAD: &str = "v.container_id IS NULL
    AND v.worker_resource_cache_id IS NULL
    AND v.worker_base_resource_type_id IS NULL
    AND v.worker_task_cache_id IS NULL
    AND v.worker_resource_certs_id IS NULL";

struct RawVolume {
    id: VolumeId,
    handle: String,
    worker_name: String,
    state: String,
    team_id: Option<TeamId>,
    payload: StoredPayload,
    parent_handle: Option<String>,
}

impl RawVolume {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            handle: row.get(1)?,
            worker_name: row.get(2)?,
            state: row.get(3)?,
            team_id: row.get(4)?,
            payload: StoredPayload {
                container_id: row.get(5)?,
                container_handle: row.get(6)?,
                path: row.get(7)?,
                worker_resource_cache_id: row.get(8)?,
                resource_cache_id: row.get(9)?,
                worker_base_resource_type_id: row.get(10)?,
                worker_task_cache_id: row.get(11)?,
                worker_resource_certs_id: row.get(12)?,
            },
            parent_handle: row.get(13)?,
        })
    }

    fn decode(self) -> StoreResult<VolumeInfo> {
        let state: VolumeState = self.state.parse().map_err(|_| {
            StoreError::corrupt("volumes", self.id.get(), format!("state {:?}", self.state))
        })?;
        Ok(VolumeInfo {
            id: self.id,
            payload: self.payload.decode(self.id)?,
            handle: self.handle,
            worker_name: self.worker_name,
            state,
            team_id: self.team_id,
            parent_handle: self.parent_handle,
        })
    }
}

fn query(conn: &Connection, filter: &str, values: Vec<Value>) -> StoreResult<Vec<VolumeInfo>> {
    let sql = format!("{SELECT} WHERE {filter} ORDER BY v.id");
    let mut stmt = conn.prepare(&sql)?;
    let raws = stmt
        .query_map(params_from_iter(values), RawVolume::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    raws.into_iter().map(RawVolume::decode).collect()
}

/// New volume row with a single payload column
struct NewVolume<'a> {
    worker_name: &'a str,
    team_id: Option<TeamId>,
    column: &'static str,
    value: i64,
    path: Option<&'a str>,
}

/// Service over volume rows
#[derive(Debug, Clone)]
pub struct VolumeRepository {
    db: Db,
}

impl VolumeRepository {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    fn insert(
        &self,
        conn: &Connection,
        new: &NewVolume<'_>,
        disappeared: StoreError,
    ) -> StoreResult<(VolumeId, String)> {
        let handle = Uuid::new_v4().to_string();
        let sql = format!(
            "INSERT INTO volumes (handle, worker_name, team_id, path, {})
             VALUES (?1, ?2, ?3, ?4, ?5) RETURNING id",
            new.column
        );
        let id = conn
            .query_row(
                &sql,
                rusqlite::params![handle, new.worker_name, new.team_id, new.path, new.value],
                |row| row.get(0),
            )
            .map_err(|e| classify(e, StoreError::SafeRetry("volumes"), disappeared))?;
        debug!("Created volume {} on {} for {}", handle, new.worker_name, new.column);
        Ok((id, handle))
    }

    fn creating(&self, id: VolumeId, handle: String, new: &NewVolume<'_>, payload: VolumePayload) -> CreatingVolume {
        CreatingVolume::new(
            self.db.clone(),
            VolumeInfo {
                id,
                handle,
                worker_name: new.worker_name.to_string(),
                state: VolumeState::Creating,
                team_id: new.team_id,
                payload,
                parent_handle: None,
            },
        )
    }

    /// Scratch volume mounted into `container` at `mount_path`
    pub fn create_container_volume(
        &self,
        container: &CreatingContainer,
        mount_path: &str,
    ) -> StoreResult<CreatingVolume> {
        let info = container.info();
        let new = NewVolume {
            worker_name: &info.worker_name,
            team_id: info.team_id,
            column: "container_id",
            value: info.id.get(),
            path: Some(mount_path),
        };
        let (id, handle) = self.db.transaction(|tx| {
            self.insert(tx, &new, StoreError::missing("container", &info.handle))
        })?;
        Ok(self.creating(
            id,
            handle,
            &new,
            VolumePayload::Container {
                container_id: info.id,
                container_handle: info.handle.clone(),
                path: mount_path.to_string(),
            },
        ))
    }

    pub fn find_container_volume(
        &self,
        container_id: ContainerId,
        mount_path: &str,
    ) -> StoreResult<Option<Volume>> {
        self.first(
            "v.container_id = ? AND v.path = ?",
            vec![Value::Integer(container_id.get()), Value::Text(mount_path.to_string())],
        )
    }

    /// Volume holding the image of a base type on its worker
    pub fn create_base_resource_type_volume(
        &self,
        wbrt: &UsedWorkerBaseResourceType,
    ) -> StoreResult<CreatingVolume> {
        let new = NewVolume {
            worker_name: &wbrt.worker_name,
            team_id: None,
            column: "worker_base_resource_type_id",
            value: wbrt.id.get(),
            path: None,
        };
        let (id, handle) = self.db.transaction(|tx| {
            self.insert(
                tx,
                &new,
                StoreError::WorkerBaseResourceTypeDisappeared {
                    worker: wbrt.worker_name.clone(),
                    name: wbrt.name.clone(),
                },
            )
        })?;
        Ok(self.creating(
            id,
            handle,
            &new,
            VolumePayload::BaseResourceType {
                worker_base_resource_type_id: wbrt.id,
            },
        ))
    }

    pub fn find_base_resource_type_volume(
        &self,
        wbrt: &UsedWorkerBaseResourceType,
    ) -> StoreResult<Option<Volume>> {
        self.first(
            "v.worker_base_resource_type_id = ?",
            vec![Value::Integer(wbrt.id.get())],
        )
    }

    /// The created volume holding `resource_cache` on `worker_name`
    pub fn find_resource_cache_volume(
        &self,
        worker_name: &str,
        resource_cache: &UsedResourceCache,
    ) -> StoreResult<Option<CreatedVolume>> {
        let infos = self.db.read(|conn| {
            let worker_cache = WorkerResourceCache {
                worker_name: worker_name.to_string(),
                resource_cache: resource_cache.clone(),
            }
            .find_in(conn)?;
            let Some(worker_cache) = worker_cache else {
                return Ok(Vec::new());
            };
            query(
                conn,
                "v.worker_resource_cache_id = ? AND v.state = 'created'",
                vec![Value::Integer(worker_cache.id.get())],
            )
        })?;
        Ok(self.created(infos).into_iter().next())
    }

    /// Volume that will hold a task cache from the start
    pub fn create_task_cache_volume(
        &self,
        team_id: Option<TeamId>,
        worker_task_cache: &UsedWorkerTaskCache,
    ) -> StoreResult<CreatingVolume> {
        let new = NewVolume {
            worker_name: &worker_task_cache.worker_name,
            team_id,
            column: "worker_task_cache_id",
            value: worker_task_cache.id.get(),
            path: None,
        };
        let (id, handle) = self.db.transaction(|tx| {
            self.insert(
                tx,
                &new,
                StoreError::WorkerNotFound(worker_task_cache.worker_name.clone()),
            )
        })?;
        Ok(self.creating(
            id,
            handle,
            &new,
            VolumePayload::TaskCache {
                worker_task_cache_id: worker_task_cache.id,
            },
        ))
    }

    /// The created volume holding a task cache on `worker_name`
    pub fn find_task_cache_volume(
        &self,
        worker_name: &str,
        job_id: JobId,
        step_name: &str,
        path: &str,
    ) -> StoreResult<Option<CreatedVolume>> {
        let infos = self.db.read(|conn| {
            let task_cache = TaskCache {
                job_id,
                step_name: step_name.to_string(),
                path: path.to_string(),
            }
            .find_in(conn)?;
            let Some(task_cache) = task_cache else {
                return Ok(Vec::new());
            };
            let worker_task_cache = WorkerTaskCache {
                worker_name: worker_name.to_string(),
                task_cache,
            }
            .find_in(conn)?;
            let Some(worker_task_cache) = worker_task_cache else {
                return Ok(Vec::new());
            };
            query(
                conn,
                "v.worker_task_cache_id = ? AND v.state = 'created'",
                vec![Value::Integer(worker_task_cache.id.get())],
            )
        })?;
        Ok(self.created(infos).into_iter().next())
    }

    pub fn create_resource_certs_volume(
        &self,
        worker_name: &str,
        certs: &UsedWorkerResourceCerts,
    ) -> StoreResult<CreatingVolume> {
        let new = NewVolume {
            worker_name,
            team_id: None,
            column: "worker_resource_certs_id",
            value: certs.id.get(),
            path: None,
        };
        let (id, handle) = self.db.transaction(|tx| {
            self.insert(tx, &new, StoreError::WorkerNotFound(worker_name.to_string()))
        })?;
        Ok(self.creating(
            id,
            handle,
            &new,
            VolumePayload::ResourceCerts {
                worker_resource_certs_id: certs.id,
            },
        ))
    }

    /// Created volumes mounted into a container
    pub fn find_volumes_for_container(
        &self,
        container_id: ContainerId,
    ) -> StoreResult<Vec<CreatedVolume>> {
        let infos = self.db.read(|conn| {
            query(
                conn,
                "v.container_id = ? AND v.state = 'created'",
                vec![Value::Integer(container_id.get())],
            )
        })?;
        Ok(self.created(infos))
    }

    pub fn find_created_volume(&self, handle: &str) -> StoreResult<Option<CreatedVolume>> {
        let infos = self.db.read(|conn| {
            query(
                conn,
                "v.handle = ? AND v.state = 'created'",
                vec![Value::Text(handle.to_string())],
            )
        })?;
        Ok(self.created(infos).into_iter().next())
    }

    /// Created volumes nothing references, on workers that can still
    /// destroy them
    pub fn get_orphaned_volumes(&self) -> StoreResult<Vec<CreatedVolume>> {
        let filter = format!(
            "{NO_PAYLOAD} AND v.state = 'created'
             AND v.worker_name IN
                 (SELECT name FROM workers WHERE state IN ('running', 'landing', 'retiring'))"
        );
        let infos = self.db.read(|conn| query(conn, &filter, Vec::new()))?;
        Ok(self.created(infos))
    }

    pub fn get_failed_volumes(&self) -> StoreResult<Vec<FailedVolume>> {
        let infos = self
            .db
            .read(|conn| query(conn, "v.state = 'failed'", Vec::new()))?;
        Ok(infos
            .into_iter()
            .filter_map(|info| match Volume::from_info(self.db.clone(), info) {
                Volume::Failed(v) => Some(v),
                _ => None,
            })
            .collect())
    }

    /// Every volume, optionally limited to one worker
    pub fn list(&self, worker_name: Option<&str>) -> StoreResult<Vec<VolumeInfo>> {
        self.db.read(|conn| match worker_name {
            Some(name) => query(conn, "v.worker_name = ?", vec![Value::Text(name.to_string())]),
            None => query(conn, "1 = 1", Vec::new()),
        })
    }

    fn first(&self, filter: &str, values: Vec<Value>) -> StoreResult<Option<Volume>> {
        let infos = self.db.read(|conn| query(conn, filter, values))?;
        Ok(infos
            .into_iter()
            .next()
            .map(|info| Volume::from_info(self.db.clone(), info)))
    }

    fn created(&self, infos: Vec<VolumeInfo>) -> Vec<CreatedVolume> {
        infos
            .into_iter()
            .filter_map(|info| match Volume::from_info(self.db.clone(), info) {
                Volume::Created(v) => Some(v),
                _ => None,
            })
            .collect()
    }
}
