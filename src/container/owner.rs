//! Why a container exists
//!
//! Each owner variant knows which sparse columns of `containers` identify it
//! and how to fill them in at creation time. Once the owner row goes away
//! the column is nulled and the container becomes an orphan.

use crate::db::classify;
use crate::error::{StoreError, StoreResult};
use crate::ids::{BuildId, CheckSessionId, ContainerId, TeamId, WorkerCheckSessionId};
use crate::resource::config;
use crate::worker::base_type;
use rusqlite::types::Value;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::fmt;

/// The reason a container exists
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ContainerOwner {
    /// Checks the image of a custom type for the given container
    ImageCheck { container_id: ContainerId },
    /// Fetches the image of a custom type for the given container
    ImageGet { container_id: ContainerId },
    /// Runs one step of a build
    BuildStep { build_id: BuildId, plan_id: String },
    /// Runs checks for a check session on behalf of a team
    CheckSession {
        session_id: CheckSessionId,
        team_id: Option<TeamId>,
    },
}

/// One column condition of an owner lookup
#[derive(Debug, Clone, PartialEq)]
pub enum OwnerMatch {
    Eq(&'static str, Value),
    AnyOf(&'static str, Vec<i64>),
}

/// Column conditions identifying an owner's containers
#[derive(Debug, Clone, PartialEq)]
pub struct OwnerFilter(Vec<OwnerMatch>);

impl OwnerFilter {
    /// Render as a `WHERE` fragment against table alias `alias`
    pub fn to_sql(&self, alias: &str) -> (String, Vec<Value>) {
        let mut clauses = Vec::new();
        let mut values = Vec::new();
        for m in &self.0 {
            match m {
                OwnerMatch::Eq(column, value) => {
                    clauses.push(format!("{alias}.{column} = ?"));
                    values.push(value.clone());
                }
                OwnerMatch::AnyOf(column, ids) => {
                    let marks = vec!["?"; ids.len()].join(", ");
                    clauses.push(format!("{alias}.{column} IN ({marks})"));
                    values.extend(ids.iter().map(|id| Value::Integer(*id)));
                }
            }
        }
        (clauses.join(" AND "), values)
    }
}

/// Columns written when a container is created for an owner
pub type OwnerColumns = Vec<(&'static str, Value)>;

impl ContainerOwner {
    /// Conditions matching this owner's containers, or `None` when the owner
    /// cannot have any
    pub fn find(&self, conn: &Connection) -> StoreResult<Option<OwnerFilter>> {
        let filter = match self {
            Self::ImageCheck { container_id } => vec![OwnerMatch::Eq(
                "image_check_container_id",
                Value::Integer(container_id.get()),
            )],
            Self::ImageGet { container_id } => vec![OwnerMatch::Eq(
                "image_get_container_id",
                Value::Integer(container_id.get()),
            )],
            Self::BuildStep { build_id, plan_id } => vec![
                OwnerMatch::Eq("build_id", Value::Integer(build_id.get())),
                OwnerMatch::Eq("plan_id", Value::Text(plan_id.clone())),
            ],
            Self::CheckSession { session_id, team_id } => {
                let mut stmt = conn.prepare(
                    "SELECT id FROM worker_resource_config_check_sessions
                     WHERE resource_config_check_session_id = ?1 AND team_id IS ?2",
                )?;
                let ids = stmt
                    .query_map(params![session_id, team_id], |row| row.get::<_, i64>(0))?
                    .collect::<Result<Vec<_>, _>>()?;
                if ids.is_empty() {
                    return Ok(None);
                }
                vec![OwnerMatch::AnyOf("worker_resource_config_check_session_id", ids)]
            }
        };
        Ok(Some(OwnerFilter(filter)))
    }

    /// Columns to store for a new container on `worker_name`
    ///
    /// A check-session container is pinned to the worker's materialized
    /// image of the config's base type.
    pub fn create(&self, conn: &Connection, worker_name: &str) -> StoreResult<OwnerColumns> {
        let columns = match self {
            Self::ImageCheck { container_id } => vec![(
                "image_check_container_id",
                Value::Integer(container_id.get()),
            )],
            Self::ImageGet { container_id } => vec![(
                "image_get_container_id",
                Value::Integer(container_id.get()),
            )],
            Self::BuildStep { build_id, plan_id } => vec![
                ("build_id", Value::Integer(build_id.get())),
                ("plan_id", Value::Text(plan_id.clone())),
            ],
            Self::CheckSession { session_id, team_id } => {
                let id = self.worker_check_session(conn, *session_id, *team_id, worker_name)?;
                let mut columns = vec![(
                    "worker_resource_config_check_session_id",
                    Value::Integer(id.get()),
                )];
                if let Some(team) = team_id {
                    columns.push(("team_id", Value::Integer(team.get())));
                }
                columns
            }
        };
        Ok(columns)
    }

    fn worker_check_session(
        &self,
        conn: &Connection,
        session_id: CheckSessionId,
        team_id: Option<TeamId>,
        worker_name: &str,
    ) -> StoreResult<WorkerCheckSessionId> {
        let config_id = conn
            .query_row(
                "SELECT resource_config_id FROM resource_config_check_sessions WHERE id = ?1",
                params![session_id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| StoreError::ContainerOwnerDisappeared(self.to_string()))?;
        let config = config::load(conn, config_id)?
            .ok_or_else(|| StoreError::ContainerOwnerDisappeared(self.to_string()))?;

        let base_name = &config.origin_base_resource_type().name;
        let wbrt = base_type::find(conn, worker_name, base_name)?.ok_or_else(|| {
            StoreError::WorkerBaseResourceTypeDisappeared {
                worker: worker_name.to_string(),
                name: base_name.clone(),
            }
        })?;

        let existing = conn
            .query_row(
                "SELECT id FROM worker_resource_config_check_sessions
                 WHERE resource_config_check_session_id = ?1
                   AND worker_base_resource_type_id = ?2
                   AND team_id IS ?3",
                params![session_id, wbrt.id, team_id],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(id) = existing {
            return Ok(id);
        }

        conn.query_row(
            "INSERT INTO worker_resource_config_check_sessions
                 (resource_config_check_session_id, worker_base_resource_type_id, team_id)
             VALUES (?1, ?2, ?3) RETURNING id",
            params![session_id, wbrt.id, team_id],
            |row| row.get(0),
        )
        .map_err(|e| {
            classify(
                e,
                StoreError::SafeRetry("worker_resource_config_check_sessions"),
                StoreError::ContainerOwnerDisappeared(self.to_string()),
            )
        })
    }
}

impl fmt::Display for ContainerOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ImageCheck { container_id } => write!(f, "image check for container {}", container_id),
            Self::ImageGet { container_id } => write!(f, "image get for container {}", container_id),
            Self::BuildStep { build_id, plan_id } => write!(f, "build {} step {}", build_id, plan_id),
            Self::CheckSession { session_id, .. } => write!(f, "check session {}", session_id),
        }
    }
}

/// Stored owner columns, as read back from `containers`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct StoredOwner {
    pub build_id: Option<BuildId>,
    pub plan_id: Option<String>,
    pub image_check_container_id: Option<ContainerId>,
    pub image_get_container_id: Option<ContainerId>,
    pub worker_check_session_id: Option<WorkerCheckSessionId>,
    pub check_session_id: Option<CheckSessionId>,
    pub team_id: Option<TeamId>,
}

impl StoredOwner {
    /// Decode into an owner; `None` means the owner is gone
    ///
    /// More than one populated owner column is a corrupt row.
    pub fn decode(&self, container: ContainerId) -> StoreResult<Option<ContainerOwner>> {
        let populated = [
            self.build_id.is_some(),
            self.image_check_container_id.is_some(),
            self.image_get_container_id.is_some(),
            self.worker_check_session_id.is_some(),
        ]
        .iter()
        .filter(|set| **set)
        .count();

        if populated > 1 {
            return Err(StoreError::corrupt(
                "containers",
                container.get(),
                format!("{} owner columns populated", populated),
            ));
        }

        let owner = if let Some(build_id) = self.build_id {
            Some(ContainerOwner::BuildStep {
                build_id,
                plan_id: self.plan_id.clone().unwrap_or_default(),
            })
        } else if let Some(container_id) = self.image_check_container_id {
            Some(ContainerOwner::ImageCheck { container_id })
        } else if let Some(container_id) = self.image_get_container_id {
            Some(ContainerOwner::ImageGet { container_id })
        } else if self.worker_check_session_id.is_some() {
            let session_id = self.check_session_id.ok_or_else(|| {
                StoreError::corrupt("containers", container.get(), "worker check session missing")
            })?;
            Some(ContainerOwner::CheckSession {
                session_id,
                team_id: self.team_id,
            })
        } else {
            None
        };
        Ok(owner)
    }
}
