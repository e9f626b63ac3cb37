//! Worker registration and worker-scoped projections

pub mod base_type;
pub mod certs;
pub mod resource_cache;
pub mod task_cache;

pub use base_type::UsedWorkerBaseResourceType;
pub use certs::{UsedWorkerResourceCerts, WorkerResourceCerts};
pub use resource_cache::{UsedWorkerResourceCache, WorkerResourceCache};
pub use task_cache::{TaskCache, UsedTaskCache, UsedWorkerTaskCache, WorkerTaskCache};

use crate::db::{self, Db};
use crate::error::{StoreError, StoreResult};
use crate::ids::TeamId;
use crate::resource::base_type as catalogue;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::{debug, info};

/// Worker lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    Running,
    Landing,
    Landed,
    Retiring,
    Stalled,
}

impl WorkerState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Landing => "landing",
            Self::Landed => "landed",
            Self::Retiring => "retiring",
            Self::Stalled => "stalled",
        }
    }

    /// Whether volumes on this worker may be garbage collected
    pub fn is_reachable(self) -> bool {
        matches!(self, Self::Running | Self::Landing | Self::Retiring)
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkerState {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "landing" => Ok(Self::Landing),
            "landed" => Ok(Self::Landed),
            "retiring" => Ok(Self::Retiring),
            "stalled" => Ok(Self::Stalled),
            other => Err(StoreError::User(format!("unknown worker state: {}", other))),
        }
    }
}

/// A base type image a worker advertises
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerResourceType {
    #[serde(rename = "type")]
    pub type_: String,
    pub image: String,
    pub version: String,
}

/// What a worker reports when it registers
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerSpec {
    pub name: String,
    #[serde(default)]
    pub team_id: Option<TeamId>,
    #[serde(default)]
    pub resource_types: Vec<WorkerResourceType>,
    #[serde(default)]
    pub certs_path: Option<String>,
}

/// A registered worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Worker {
    pub name: String,
    pub state: WorkerState,
    pub team_id: Option<TeamId>,
    pub start_time: DateTime<Utc>,
}

fn worker_from_row(row: &Row<'_>) -> rusqlite::Result<(String, String, Option<TeamId>, i64)> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
}

fn into_worker(row: (String, String, Option<TeamId>, i64)) -> StoreResult<Worker> {
    let (name, state, team_id, start_time) = row;
    Ok(Worker {
        name,
        state: state.parse()?,
        team_id,
        start_time: db::timestamp(start_time),
    })
}

pub(crate) fn worker_exists(conn: &Connection, name: &str) -> StoreResult<bool> {
    let found = conn
        .query_row("SELECT 1 FROM workers WHERE name = ?1", params![name], |_| Ok(()))
        .optional()?;
    Ok(found.is_some())
}

/// Service over registered workers
#[derive(Debug, Clone)]
pub struct WorkerFactory {
    db: Db,
}

impl WorkerFactory {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Register or re-register a worker
    ///
    /// Base types keep their projection when image and version are unchanged.
    /// A changed version replaces the projection, which drops that worker's
    /// caches and check-session containers for the type. Types no longer
    /// advertised lose their projection.
    pub fn save_worker(&self, spec: &WorkerSpec) -> StoreResult<Worker> {
        let now = db::now();
        self.db.transaction(|tx| {
            tx.execute(
                "INSERT INTO workers (name, state, team_id, start_time)
                 VALUES (?1, 'running', ?2, ?3)
                 ON CONFLICT (name) DO UPDATE SET
                     state = 'running',
                     team_id = excluded.team_id,
                     start_time = excluded.start_time",
                params![spec.name, spec.team_id, now],
            )?;

            for rt in &spec.resource_types {
                sync_base_type(tx, &spec.name, rt)?;
            }

            for existing in base_type::for_worker(tx, &spec.name)? {
                if !spec.resource_types.iter().any(|rt| rt.type_ == existing.name) {
                    tx.execute(
                        "DELETE FROM worker_base_resource_types WHERE id = ?1",
                        params![existing.id],
                    )?;
                    info!("Worker {} no longer provides {}", spec.name, existing.name);
                }
            }

            if let Some(path) = &spec.certs_path {
                WorkerResourceCerts {
                    worker_name: spec.name.clone(),
                    certs_path: path.clone(),
                }
                .find_or_create_in(tx)?;
            }

            Ok(())
        })?;

        info!(
            "Registered worker {} with {} resource types",
            spec.name,
            spec.resource_types.len()
        );
        self.get_worker(&spec.name)?
            .ok_or_else(|| StoreError::WorkerNotFound(spec.name.clone()))
    }

    pub fn get_worker(&self, name: &str) -> StoreResult<Option<Worker>> {
        let row = self
            .db
            .connection()?
            .query_row(
                "SELECT name, state, team_id, start_time FROM workers WHERE name = ?1",
                params![name],
                worker_from_row,
            )
            .optional()?;
        row.map(into_worker).transpose()
    }

    pub fn workers(&self) -> StoreResult<Vec<Worker>> {
        self.db.read(|conn| {
            let mut stmt =
                conn.prepare("SELECT name, state, team_id, start_time FROM workers ORDER BY name")?;
            let rows = stmt
                .query_map([], worker_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            rows.into_iter().map(into_worker).collect()
        })
    }

    /// Base types materialized on a worker
    pub fn base_resource_types(&self, name: &str) -> StoreResult<Vec<UsedWorkerBaseResourceType>> {
        self.db.read(|conn| base_type::for_worker(conn, name))
    }

    pub fn set_state(&self, name: &str, state: WorkerState) -> StoreResult<()> {
        let updated = self.db.connection()?.execute(
            "UPDATE workers SET state = ?1 WHERE name = ?2",
            params![state.as_str(), name],
        )?;
        if updated == 0 {
            return Err(StoreError::WorkerNotFound(name.to_string()));
        }
        debug!("Worker {} is now {}", name, state);
        Ok(())
    }

    /// Remove a worker and everything materialized on it
    pub fn delete_worker(&self, name: &str) -> StoreResult<bool> {
        let deleted = self
            .db
            .connection()?
            .execute("DELETE FROM workers WHERE name = ?1", params![name])?;
        if deleted > 0 {
            info!("Deleted worker {}", name);
        }
        Ok(deleted > 0)
    }

    /// Remove a worker that has stopped heartbeating
    ///
    /// Only stalled or landed workers may be pruned.
    pub fn prune_worker(&self, name: &str) -> StoreResult<()> {
        let worker = self
            .get_worker(name)?
            .ok_or_else(|| StoreError::WorkerNotFound(name.to_string()))?;

        if !matches!(worker.state, WorkerState::Stalled | WorkerState::Landed) {
            return Err(StoreError::InvalidTransition {
                entity: "worker",
                handle: name.to_string(),
                from: worker.state.to_string(),
                to: "pruned".to_string(),
            });
        }

        self.delete_worker(name)?;
        Ok(())
    }
}

fn sync_base_type(conn: &Connection, worker_name: &str, rt: &WorkerResourceType) -> StoreResult<()> {
    let base = catalogue::find_or_create(conn, &rt.type_)?;

    if let Some(existing) = base_type::find(conn, worker_name, &rt.type_)? {
        if existing.image == rt.image && existing.version == rt.version {
            return Ok(());
        }
        conn.execute(
            "DELETE FROM worker_base_resource_types WHERE id = ?1",
            params![existing.id],
        )?;
        info!(
            "Worker {} changed {} from {} to {}",
            worker_name, rt.type_, existing.version, rt.version
        );
    }

    conn.execute(
        "INSERT INTO worker_base_resource_types
             (worker_name, base_resource_type_id, image, version)
         VALUES (?1, ?2, ?3, ?4)",
        params![worker_name, base.id, rt.image, rt.version],
    )?;
    Ok(())
}
