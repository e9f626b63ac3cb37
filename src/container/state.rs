//! Container state handles
//!
//! A handle is only ever obtained for the state the row was read in. Every
//! transition is a conditional update scoped by `(id, state)`, so two actors
//! racing on the same row produce one winner and one error.

use super::owner::ContainerOwner;
use crate::db::{self, Db};
use crate::error::{StoreError, StoreResult};
use crate::ids::{ContainerId, TeamId};
use rusqlite::params;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::{debug, info};

/// Lifecycle state of a container row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    Creating,
    Created,
    Destroying,
    Failed,
}

impl ContainerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Creating => "creating",
            Self::Created => "created",
            Self::Destroying => "destroying",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContainerState {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "creating" => Ok(Self::Creating),
            "created" => Ok(Self::Created),
            "destroying" => Ok(Self::Destroying),
            "failed" => Ok(Self::Failed),
            other => Err(StoreError::User(format!("Unknown container state: {}", other))),
        }
    }
}

/// Descriptive metadata recorded with a container
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerMetadata {
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub type_: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pipeline_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub build_name: Option<String>,
}

/// Row data shared by every container handle
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContainerInfo {
    pub id: ContainerId,
    pub handle: String,
    pub worker_name: String,
    pub state: ContainerState,
    pub team_id: Option<TeamId>,
    /// `None` once the owner is gone
    pub owner: Option<ContainerOwner>,
    pub discontinued: bool,
    pub metadata: ContainerMetadata,
}

const TABLE: &str = "containers";
const ENTITY: &str = "container";

/// A container the worker is still creating
#[derive(Debug, Clone)]
pub struct CreatingContainer {
    db: Db,
    info: ContainerInfo,
}

impl CreatingContainer {
    pub(crate) fn new(db: Db, info: ContainerInfo) -> Self {
        Self { db, info }
    }

    pub fn info(&self) -> &ContainerInfo {
        &self.info
    }

    pub fn id(&self) -> ContainerId {
        self.info.id
    }

    pub fn handle(&self) -> &str {
        &self.info.handle
    }

    /// The worker finished creating the container
    pub fn created(&self) -> StoreResult<CreatedContainer> {
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
        debug!("Container {} created", self.info.handle);
        Ok(CreatedContainer {
            db: self.db.clone(),
            info: with_state(&self.info, ContainerState::Created),
        })
    }

    /// The worker failed to create the container
    ///
    /// Repeating the call on a container that already failed succeeds.
    pub fn failed(&self) -> StoreResult<FailedContainer> {
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
        info!("Container {} failed to create", self.info.handle);
        Ok(FailedContainer {
            db: self.db.clone(),
            info: with_state(&self.info, ContainerState::Failed),
        })
    }
}

/// A container running on its worker
#[derive(Debug, Clone)]
pub struct CreatedContainer {
    db: Db,
    info: ContainerInfo,
}

impl CreatedContainer {
    pub fn info(&self) -> &ContainerInfo {
        &self.info
    }

    pub fn id(&self) -> ContainerId {
        self.info.id
    }

    pub fn handle(&self) -> &str {
        &self.info.handle
    }

    /// Start tearing the container down
    pub fn destroying(&self) -> StoreResult<DestroyingContainer> {
        self.db.transaction(|tx| {
            db::transition(
                tx,
                TABLE,
                ENTITY,
                self.info.id.get(),
                &self.info.handle,
                &["created"],
                "destroying",
            )
        })?;
        debug!("Container {} destroying", self.info.handle);
        Ok(DestroyingContainer {
            db: self.db.clone(),
            info: with_state(&self.info, ContainerState::Destroying),
        })
    }

    /// Abandon the container without a remote teardown
    ///
    /// Used when the hosting worker is unreachable. The row still waits in
    /// `destroying` until something confirms it is gone.
    pub fn discontinue(&self) -> StoreResult<DestroyingContainer> {
        self.db.transaction(|tx| {
            let updated = tx.execute(
                "UPDATE containers SET state = 'destroying', discontinued = 1
                 WHERE id = ?1 AND state = 'created'",
                params![self.info.id],
            )?;
            if updated == 0 {
                return Err(db::transition_error(
                    tx,
                    TABLE,
                    ENTITY,
                    self.info.id.get(),
                    &self.info.handle,
                    "destroying",
                ));
            }
            Ok(())
        })?;
        info!("Container {} discontinued", self.info.handle);

        let mut info = with_state(&self.info, ContainerState::Destroying);
        info.discontinued = true;
        Ok(DestroyingContainer {
            db: self.db.clone(),
            info,
        })
    }
}

/// A container being torn down
#[derive(Debug, Clone)]
pub struct DestroyingContainer {
    db: Db,
    info: ContainerInfo,
}

impl DestroyingContainer {
    pub fn info(&self) -> &ContainerInfo {
        &self.info
    }

    pub fn handle(&self) -> &str {
        &self.info.handle
    }

    pub fn is_discontinued(&self) -> bool {
        self.info.discontinued
    }

    /// The container is gone from its worker; delete the row
    pub fn destroy(self) -> StoreResult<()> {
        remove(&self.db, &self.info, "destroying")
    }
}

/// A container that never finished creating
#[derive(Debug, Clone)]
pub struct FailedContainer {
    db: Db,
    info: ContainerInfo,
}

impl FailedContainer {
    pub fn info(&self) -> &ContainerInfo {
        &self.info
    }

    pub fn handle(&self) -> &str {
        &self.info.handle
    }

    pub fn destroy(self) -> StoreResult<()> {
        remove(&self.db, &self.info, "failed")
    }
}

/// A container in whichever state it was read in
#[derive(Debug, Clone)]
pub enum Container {
    Creating(CreatingContainer),
    Created(CreatedContainer),
    Destroying(DestroyingContainer),
    Failed(FailedContainer),
}

impl Container {
    pub(crate) fn from_info(db: Db, info: ContainerInfo) -> Self {
        match info.state {
            ContainerState::Creating => Self::Creating(CreatingContainer { db, info }),
            ContainerState::Created => Self::Created(CreatedContainer { db, info }),
            ContainerState::Destroying => Self::Destroying(DestroyingContainer { db, info }),
            ContainerState::Failed => Self::Failed(FailedContainer { db, info }),
        }
    }

    pub fn info(&self) -> &ContainerInfo {
        match self {
            Self::Creating(c) => &c.info,
            Self::Created(c) => &c.info,
            Self::Destroying(c) => &c.info,
            Self::Failed(c) => &c.info,
        }
    }

    pub fn state(&self) -> ContainerState {
        self.info().state
    }
}

fn with_state(info: &ContainerInfo, state: ContainerState) -> ContainerInfo {
    ContainerInfo {
        state,
        ..info.clone()
    }
}

fn remove(db: &Db, info: &ContainerInfo, from: &str) -> StoreResult<()> {
    db.transaction(|tx| {
        let deleted = tx.execute(
            "DELETE FROM containers WHERE id = ?1 AND state = ?2",
            params![info.id, from],
        )?;
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
    info!("Container {} destroyed", info.handle);
    Ok(())
}
