//! Typed row identifiers
//!
//! Every table keys its rows by an SQLite `INTEGER PRIMARY KEY`. Wrapping
//! each in its own newtype keeps a volume id from being passed where a
//! container id is expected.

use rusqlite::types::{FromSql, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! id_type {
    ($($(#[$meta:meta])* $name:ident),+ $(,)?) => {
        $(
            $(#[$meta])*
            #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
            #[serde(transparent)]
            pub struct $name(pub i64);

            impl $name {
                pub fn get(self) -> i64 {
                    self.0
                }
            }

            impl fmt::Display for $name {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    write!(f, "{}", self.0)
                }
            }

            impl From<i64> for $name {
                fn from(id: i64) -> Self {
                    Self(id)
                }
            }

            impl ToSql for $name {
                fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                    Ok(ToSqlOutput::from(self.0))
                }
            }

            impl FromSql for $name {
                fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                    i64::column_result(value).map(Self)
                }
            }
        )+
    };
}

id_type!(
    /// Row id in `base_resource_types`
    BaseResourceTypeId,
    /// Row id in `resource_configs`
    ResourceConfigId,
    /// Row id in `resource_caches`
    ResourceCacheId,
    /// Row id in `worker_base_resource_types`
    WorkerBaseResourceTypeId,
    /// Row id in `worker_resource_caches`
    WorkerResourceCacheId,
    /// Row id in `resource_config_check_sessions`
    CheckSessionId,
    /// Row id in `worker_resource_config_check_sessions`
    WorkerCheckSessionId,
    /// Row id in `containers`
    ContainerId,
    /// Row id in `volumes`
    VolumeId,
    /// Row id in `task_caches`
    TaskCacheId,
    /// Row id in `worker_task_caches`
    WorkerTaskCacheId,
    /// Row id in `worker_resource_certs`
    WorkerResourceCertsId,
    /// Id of a build owned by the scheduler
    BuildId,
    /// Id of a job owned by the scheduler
    JobId,
    /// Id of a pipeline resource owned by the scheduler
    ResourceId,
    /// Id of a pipeline resource type owned by the scheduler
    ResourceTypeId,
    /// Id of a team
    TeamId,
);

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    #[test]
    fn ids_bind_and_read_as_integers() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE t (id INTEGER PRIMARY KEY)")
            .unwrap();
        conn.execute("INSERT INTO t (id) VALUES (?1)", [VolumeId(42)])
            .unwrap();

        let id: VolumeId = conn
            .query_row("SELECT id FROM t", [], |row| row.get(0))
            .unwrap();
        assert_eq!(id, VolumeId(42));
        assert_eq!(id.to_string(), "42");
    }

    #[test]
    fn ids_serialize_transparently() {
        let json = serde_json::to_string(&ContainerId(7)).unwrap();
        assert_eq!(json, "7");
    }
}
