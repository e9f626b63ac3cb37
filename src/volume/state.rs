//! Volume state handles
//!
//! Same four-state machine as containers. A child volume references its
//! parent through `(parent_id, parent_state = 'created')`, so the parent
//! cannot leave `created` while a child row exists.

use super::payload::VolumePayload;
use crate::container::CreatingContainer;
use crate::db::{self, constraint, Constraint, Db};
use crate::error::{StoreError, StoreResult};
use crate::ids::{JobId, TeamId, VolumeId};
use crate::resource::{cache, UsedConfigParent, UsedResourceCache, Version};
use crate::worker::base_type::{self, UsedWorkerBaseResourceType};
use crate::worker::{TaskCache, UsedWorkerResourceCache, WorkerResourceCache, WorkerTaskCache};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use tracing::{debug, info};

/// Lifecycle state of a volume row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum VolumeState {
    Creating,
    Created,
    Destroying,
    Failed,
}

impl VolumeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Creating => "creating",
            Self::Created => "created",
            Self::Destroying => "destroying",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for VolumeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VolumeState {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "creating" => Ok(Self::Creating),
            "created" => Ok(Self::Created),
            "destroying" => Ok(Self::Destroying),
            "failed" => Ok(Self::Failed),
            other => Err(StoreError::User(format!("Unknown volume state: {}", other))),
        }
    }
}

/// Row data shared by every volume handle
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VolumeInfo {
    pub id: VolumeId,
    pub handle: String,
    pub worker_name: String,
    pub state: VolumeState,
    pub team_id: Option<TeamId>,
    pub payload: VolumePayload,
    pub parent_handle: Option<String>,
}

/// Image chain a resource cache volume was fetched with
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum VolumeResourceType {
    /// Fetched by a base type the worker provides
    Base {
        worker_base_resource_type: UsedWorkerBaseResourceType,
        version: Version,
    },
    /// Fetched by a custom type, itself fetched by `resource_type`
    Custom {
        resource_type: Box<VolumeResourceType>,
        version: Version,
    },
}

const TABLE: &str = "volumes";
const ENTITY: &str = "volume";

/// A volume the worker is still creating
#[derive(Debug, Clone)]
pub struct CreatingVolume {
    db: Db,
    info: VolumeInfo,
}

impl CreatingVolume {
    pub(crate) fn new(db: Db, info: VolumeInfo) -> Self {
        Self { db, info }
    }

    pub fn info(&self) -> &VolumeInfo {
        &self.info
    }

    pub fn handle(&self) -> &str {
        &self.info.handle
    }

    pub fn created(&self) -> StoreResult<CreatedVolume> {
        self.db.transaction(|tx| {
            db::transition(
                tx,
                TABLE,
                ENTITY,
                self.info.id.get(),
                &self.info.handle,
                &["creating"],
                "created",
            )
        })?;
        debug!("Volume {} created", self.info.handle);
        Ok(CreatedVolume {
            db: self.db.clone(),
            info: with_state(&self.info, VolumeState::Created),
        })
    }

    /// Repeating the call on a volume that already failed succeeds
    pub fn failed(&self) -> StoreResult<FailedVolume> {
        self.db.transaction(|tx| {
            db::transition(
                tx,
                TABLE,
                ENTITY,
                self.info.id.get(),
                &self.info.handle,
                &["creating", "failed"],
                "failed",
            )
        })?;
        info!("Volume {} failed to create", self.info.handle);
        Ok(FailedVolume {
            db: self.db.clone(),
            info: with_state(&self.info, VolumeState::Failed),
        })
    }
}

/// A volume present on its worker
#[derive(Debug, Clone)]
pub struct CreatedVolume {
    db: Db,
    info: VolumeInfo,
}

impl CreatedVolume {
    pub fn info(&self) -> &VolumeInfo {
        &self.info
    }

    pub fn id(&self) -> VolumeId {
        self.info.id
    }

    pub fn handle(&self) -> &str {
        &self.info.handle
    }

    /// Create a copy-on-write child of this volume mounted into `container`
    ///
    /// This volume is pinned in `created` for as long as the child exists.
    /// The child belongs to the same team as this volume.
    pub fn create_child_for_container(
        &self,
        container: &CreatingContainer,
        mount_path: &str,
    ) -> StoreResult<CreatingVolume> {
        let handle = uuid::Uuid::new_v4().to_string();
        let id = self.db.transaction(|tx| {
            let state: Option<String> = tx
                .query_row(
                    "SELECT state FROM volumes WHERE id = ?1",
                    params![self.info.id],
                    |row| row.get(0),
                )
                .optional()?;
            match state.as_deref() {
                Some("created") => {}
                Some(other) => {
                    return Err(StoreError::ParentVolumeNotCreated {
                        handle: self.info.handle.clone(),
                        state: other.to_string(),
                    })
                }
                None => return Err(StoreError::missing(ENTITY, &self.info.handle)),
            }

            let id: VolumeId = tx
                .query_row(
                    "INSERT INTO volumes
                         (handle, worker_name, team_id, container_id, path, parent_id, parent_state)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'created')
                     RETURNING id",
                    params![
                        handle,
                        self.info.worker_name,
                        self.info.team_id,
                        container.id(),
                        mount_path,
                        self.info.id
                    ],
                    |row| row.get(0),
                )
                .map_err(|e| match constraint(&e) {
                    Some(Constraint::ForeignKey) => StoreError::missing("container", container.handle()),
                    _ => e.into(),
                })?;
            Ok(id)
        })?;

        debug!("Volume {} created as child of {}", handle, self.info.handle);
        Ok(CreatingVolume::new(
            self.db.clone(),
            VolumeInfo {
                id,
                handle,
                worker_name: self.info.worker_name.clone(),
                state: VolumeState::Creating,
                team_id: self.info.team_id,
                payload: VolumePayload::Container {
                    container_id: container.id(),
                    container_handle: container.handle().to_string(),
                    path: mount_path.to_string(),
                },
                parent_handle: Some(self.info.handle.clone()),
            },
        ))
    }

    /// Start tearing the volume down
    ///
    /// Fails with `VolumeHasChildren` while any child volume exists.
    pub fn destroying(&self) -> StoreResult<DestroyingVolume> {
        self.db.transaction(|tx| {
            let children: i64 = tx.query_row(
                "SELECT COUNT(*) FROM volumes WHERE parent_id = ?1",
                params![self.info.id],
                |row| row.get(0),
            )?;
            if children > 0 {
                return Err(StoreError::VolumeHasChildren(self.info.handle.clone()));
            }

            match db::transition(
                tx,
                TABLE,
                ENTITY,
                self.info.id.get(),
                &self.info.handle,
                &["created"],
                "destroying",
            ) {
                Err(StoreError::Sqlite(e)) if constraint(&e) == Some(Constraint::ForeignKey) => {
                    Err(StoreError::VolumeHasChildren(self.info.handle.clone()))
                }
                other => other,
            }
        })?;
        debug!("Volume {} destroying", self.info.handle);
        Ok(DestroyingVolume {
            db: self.db.clone(),
            info: with_state(&self.info, VolumeState::Destroying),
        })
    }

    /// Make this volume the canonical copy of `resource_cache` on its worker
    ///
    /// Returns `None` when another volume on the worker already holds the
    /// cache; this volume then stays a plain container volume.
    pub fn initialize_resource_cache(
        &self,
        resource_cache: &UsedResourceCache,
    ) -> StoreResult<Option<UsedWorkerResourceCache>> {
        let mut conn = self.db.connection()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let worker_cache = WorkerResourceCache {
            worker_name: self.info.worker_name.clone(),
            resource_cache: resource_cache.clone(),
        }
        .find_or_create_in(&tx)?;

        let updated = tx.execute(
            "UPDATE volumes
             SET worker_resource_cache_id = ?1, container_id = NULL, team_id = NULL
             WHERE id = ?2 AND state = 'created' AND container_id IS NOT NULL",
            params![worker_cache.id, self.info.id],
        );
        if !self.claimed(&tx, updated, "resource cache")? {
            return Ok(None);
        }

        tx.commit()?;
        info!(
            "Volume {} initialized resource cache {}",
            self.info.handle, resource_cache.id
        );
        Ok(Some(worker_cache))
    }

    /// Make this volume the canonical copy of a task cache on its worker
    ///
    /// Returns `false` when another volume already holds it.
    pub fn initialize_task_cache(
        &self,
        job_id: JobId,
        step_name: &str,
        path: &str,
    ) -> StoreResult<bool> {
        let mut conn = self.db.connection()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let task_cache = TaskCache {
            job_id,
            step_name: step_name.to_string(),
            path: path.to_string(),
        }
        .find_or_create_in(&tx)?;
        let worker_task_cache = WorkerTaskCache {
            worker_name: self.info.worker_name.clone(),
            task_cache,
        }
        .find_or_create_in(&tx)?;

        let updated = tx.execute(
            "UPDATE volumes
             SET worker_task_cache_id = ?1, container_id = NULL, team_id = NULL
             WHERE id = ?2 AND state = 'created' AND container_id IS NOT NULL",
            params![worker_task_cache.id, self.info.id],
        );
        if !self.claimed(&tx, updated, "task cache")? {
            return Ok(false);
        }

        tx.commit()?;
        info!(
            "Volume {} initialized task cache {}/{}",
            self.info.handle, step_name, path
        );
        Ok(true)
    }

    /// Whether the payload update took; a unique violation means another
    /// volume got there first
    fn claimed(
        &self,
        conn: &Connection,
        updated: rusqlite::Result<usize>,
        what: &str,
    ) -> StoreResult<bool> {
        match updated {
            Ok(0) => Err(self.not_initializable(conn)),
            Ok(_) => Ok(true),
            Err(e) if constraint(&e) == Some(Constraint::Check) => Err(self.not_initializable(conn)),
            Err(e) if constraint(&e) == Some(Constraint::Unique) => {
                debug!(
                    "Another volume already holds the {} of {}",
                    what, self.info.handle
                );
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Why a cache payload could not be attached to this row
    ///
    /// Only `created` volumes still holding their container payload qualify.
    fn not_initializable(&self, conn: &Connection) -> StoreError {
        let row = conn
            .query_row(
                "SELECT state,
                        CASE
                            WHEN worker_resource_cache_id IS NOT NULL THEN 'resource-cache'
                            WHEN worker_base_resource_type_id IS NOT NULL THEN 'base-resource-type'
                            WHEN worker_task_cache_id IS NOT NULL THEN 'task-cache'
                            WHEN worker_resource_certs_id IS NOT NULL THEN 'resource-certs'
                            WHEN container_id IS NOT NULL THEN 'container'
                            ELSE 'none'
                        END
                 FROM volumes WHERE id = ?1",
                params![self.info.id],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
            )
            .optional();

        match row {
            Ok(Some((state, payload))) if state == "created" && payload != "container" => {
                StoreError::VolumeNotInitializable {
                    handle: self.info.handle.clone(),
                    payload,
                }
            }
            Ok(_) => db::transition_error(
                conn,
                TABLE,
                ENTITY,
                self.info.id.get(),
                &self.info.handle,
                "initialized",
            ),
            Err(e) => e.into(),
        }
    }

    /// Image chain of the resource cache this volume holds, if it holds one
    pub fn resource_type(&self) -> StoreResult<Option<VolumeResourceType>> {
        let VolumePayload::ResourceCache {
            resource_cache_id, ..
        } = self.info.payload
        else {
            return Ok(None);
        };

        self.db.read(|conn| {
            let Some(cache) = cache::load(conn, resource_cache_id)? else {
                return Err(StoreError::ResourceCacheDisappeared);
            };
            resource_type_of(conn, &self.info.worker_name, &cache).map(Some)
        })
    }

    /// Base type image this volume holds, if it holds one
    pub fn base_resource_type(&self) -> StoreResult<Option<UsedWorkerBaseResourceType>> {
        let VolumePayload::BaseResourceType {
            worker_base_resource_type_id,
        } = self.info.payload
        else {
            return Ok(None);
        };
        self.db
            .read(|conn| base_type::find_by_id(conn, worker_base_resource_type_id))
    }
}

fn resource_type_of(
    conn: &Connection,
    worker_name: &str,
    cache: &UsedResourceCache,
) -> StoreResult<VolumeResourceType> {
    match &cache.config.parent {
        UsedConfigParent::Base(base) => {
            let wbrt = base_type::find(conn, worker_name, &base.name)?.ok_or_else(|| {
                StoreError::WorkerBaseResourceTypeDisappeared {
                    worker: worker_name.to_string(),
                    name: base.name.clone(),
                }
            })?;
            Ok(VolumeResourceType::Base {
                worker_base_resource_type: wbrt,
                version: cache.version.clone(),
            })
        }
        UsedConfigParent::Cache(parent) => Ok(VolumeResourceType::Custom {
            resource_type: Box::new(resource_type_of(conn, worker_name, parent)?),
            version: cache.version.clone(),
        }),
    }
}

/// A volume being torn down
#[derive(Debug, Clone)]
pub struct DestroyingVolume {
    db: Db,
    info: VolumeInfo,
}

impl DestroyingVolume {
    pub fn info(&self) -> &VolumeInfo {
        &self.info
    }

    pub fn handle(&self) -> &str {
        &self.info.handle
    }

    /// The volume is gone from its worker; delete the row
    pub fn destroy(self) -> StoreResult<()> {
        remove(&self.db, &self.info, "destroying")
    }
}

/// A volume that never finished creating
#[derive(Debug, Clone)]
pub struct FailedVolume {
    db: Db,
    info: VolumeInfo,
}

impl FailedVolume {
    pub fn info(&self) -> &VolumeInfo {
        &self.info
    }

    pub fn handle(&self) -> &str {
        &self.info.handle
    }

    pub fn destroy(self) -> StoreResult<()> {
        remove(&self.db, &self.info, "failed")
    }
}

/// A volume in whichever state it was read in
#[derive(Debug, Clone)]
pub enum Volume {
    Creating(CreatingVolume),
    Created(CreatedVolume),
    Destroying(DestroyingVolume),
    Failed(FailedVolume),
}

impl Volume {
    pub(crate) fn from_info(db: Db, info: VolumeInfo) -> Self {
        match info.state {
            VolumeState::Creating => Self::Creating(CreatingVolume { db, info }),
            VolumeState::Created => Self::Created(CreatedVolume { db, info }),
            VolumeState::Destroying => Self::Destroying(DestroyingVolume { db, info }),
            VolumeState::Failed => Self::Failed(FailedVolume { db, info }),
        }
    }

    pub fn info(&self) -> &VolumeInfo {
        match self {
            Self::Creating(v) => &v.info,
            Self::Created(v) => &v.info,
            Self::Destroying(v) => &v.info,
            Self::Failed(v) => &v.info,
        }
    }

    pub fn state(&self) -> VolumeState {
        self.info().state
    }
}

fn with_state(info: &VolumeInfo, state: VolumeState) -> VolumeInfo {
    VolumeInfo {
        state,
        ..info.clone()
    }
}

fn remove(db: &Db, info: &VolumeInfo, from: &str) -> StoreResult<()> {
    db.transaction(|tx| {
        let deleted = tx
            .execute(
                "DELETE FROM volumes WHERE id = ?1 AND state = ?2",
                params![info.id, from],
            )
            .map_err(|e| match constraint(&e) {
                Some(Constraint::ForeignKey) => StoreError::VolumeHasChildren(info.handle.clone()),
                _ => e.into(),
            })?;
        if deleted == 0 {
            return Err(db::transition_error(
                tx,
                TABLE,
                ENTITY,
                info.id.get(),
                &info.handle,
                "destroyed",
            ));
        }
        Ok(())
    })?;
    info!("Volume {} destroyed", info.handle);
    Ok(())
}
