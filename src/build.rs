//! Build rows as seen by the cache layer
//!
//! Builds are owned by the scheduler. This store only needs to know that a
//! build exists and whether it has finished, so use edges and build-step
//! containers have something to point at.

use crate::db::Db;
use crate::error::{StoreError, StoreResult};
use crate::ids::BuildId;
use rusqlite::params;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle status of a build
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildStatus {
    Pending,
    Started,
    Succeeded,
    Failed,
    Errored,
    Aborted,
}

impl BuildStatus {
    const FINISHED: [BuildStatus; 4] = [
        BuildStatus::Succeeded,
        BuildStatus::Failed,
        BuildStatus::Errored,
        BuildStatus::Aborted,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Started => "started",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Errored => "errored",
            Self::Aborted => "aborted",
        }
    }

    /// Whether the build will never run another step
    pub fn is_finished(self) -> bool {
        Self::FINISHED.contains(&self)
    }

    /// Quoted, comma-separated finished statuses for an `IN (...)` clause
    pub(crate) fn finished_sql() -> String {
        Self::FINISHED
            .iter()
            .map(|s| format!("'{}'", s.as_str()))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BuildStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "started" => Ok(Self::Started),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "errored" => Ok(Self::Errored),
            "aborted" => Ok(Self::Aborted),
            other => Err(StoreError::User(format!("unknown build status: {}", other))),
        }
    }
}

/// Minimal access to the builds table
#[derive(Debug, Clone)]
pub struct Builds {
    db: Db,
}

impl Builds {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Record a new build
    pub fn create(&self, status: BuildStatus) -> StoreResult<BuildId> {
        let id = self.db.connection()?.query_row(
            "INSERT INTO builds (status) VALUES (?1) RETURNING id",
            params![status.as_str()],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    /// Move a build to `status`
    pub fn set_status(&self, id: BuildId, status: BuildStatus) -> StoreResult<()> {
        let updated = self.db.connection()?.execute(
            "UPDATE builds SET status = ?1 WHERE id = ?2",
            params![status.as_str(), id],
        )?;
        if updated == 0 {
            return Err(StoreError::missing("build", id.to_string()));
        }
        Ok(())
    }

    /// Remove a build, cascading its uses and orphaning its containers
    pub fn delete(&self, id: BuildId) -> StoreResult<bool> {
        let deleted = self
            .db
            .connection()?
            .execute("DELETE FROM builds WHERE id = ?1", params![id])?;
        Ok(deleted > 0)
    }
}
