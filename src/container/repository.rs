//! Container rows: creation, lookup by owner and orphan discovery

use super::owner::{ContainerOwner, StoredOwner};
use super::state::{
    Container, ContainerInfo, ContainerMetadata, ContainerState, CreatingContainer, FailedContainer,
};
use crate::build::BuildStatus;
use crate::db::{classify, Db};
use crate::error::{StoreError, StoreResult};
use crate::ids::ContainerId;
use crate::worker::worker_exists;
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, Row};
use tracing::info;
use uuid::Uuid;

const SELECT: &str = "SELECT c.id, c.handle, c.worker_name, c.state, c.team_id,
        c.discontinued, c.metadata, c.build_id, c.plan_id,
        c.image_check_container_id, c.image_get_container_id,
        c.worker_resource_config_check_session_id,
        s.resource_config_check_session_id, s.team_id
    FROM containers c
    LEFT JOIN worker_resource_config_check_sessions s
        ON s.id = c.worker_resource_config_check_session_id";

/// A container row before its text columns are decoded
struct RawContainer {
    id: ContainerId,
    handle: String,
    worker_name: String,
    state: String,
    team_id: Option<i64>,
    discontinued: bool,
    metadata: String,
    owner: StoredOwner,
}

impl RawContainer {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            handle: row.get(1)?,
            worker_name: row.get(2)?,
            state: row.get(3)?,
            team_id: row.get(4)?,
            discontinued: row.get(5)?,
            metadata: row.get(6)?,
            owner: StoredOwner {
                build_id: row.get(7)?,
                plan_id: row.get(8)?,
                image_check_container_id: row.get(9)?,
                image_get_container_id: row.get(10)?,
                worker_check_session_id: row.get(11)?,
                check_session_id: row.get(12)?,
                team_id: row.get(13)?,
            },
        })
    }

    fn decode(self) -> StoreResult<ContainerInfo> {
        let state: ContainerState = self.state.parse().map_err(|_| {
            StoreError::corrupt("containers", self.id.get(), format!("state {:?}", self.state))
        })?;
        let metadata: ContainerMetadata = serde_json::from_str(&self.metadata)?;
        let owner = self.owner.decode(self.id)?;

        Ok(ContainerInfo {
            id: self.id,
            handle: self.handle,
            worker_name: self.worker_name,
            state,
            team_id: self.team_id.map(Into::into),
            owner,
            discontinued: self.discontinued,
            metadata,
        })
    }
}

fn query(conn: &Connection, filter: &str, values: Vec<Value>) -> StoreResult<Vec<ContainerInfo>> {
    let sql = format!("{SELECT} WHERE {filter} ORDER BY c.id");
    let mut stmt = conn.prepare(&sql)?;
    let raws = stmt
        .query_map(params_from_iter(values), RawContainer::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    raws.into_iter().map(RawContainer::decode).collect()
}

/// Service over container rows
#[derive(Debug, Clone)]
pub struct ContainerRepository {
    db: Db,
}

impl ContainerRepository {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Create a container for `owner` on `worker_name` in state `creating`
    pub fn create_container(
        &self,
        worker_name: &str,
        owner: &ContainerOwner,
        metadata: &ContainerMetadata,
    ) -> StoreResult<CreatingContainer> {
        let info = self.db.transaction(|tx| {
            if !worker_exists(tx, worker_name)? {
                return Err(StoreError::WorkerNotFound(worker_name.to_string()));
            }

            let owner_columns = owner.create(tx, worker_name)?;
            let handle = Uuid::new_v4().to_string();

            let mut columns = vec!["handle", "worker_name", "metadata"];
            let mut values = vec![
                Value::Text(handle.clone()),
                Value::Text(worker_name.to_string()),
                Value::Text(serde_json::to_string(metadata)?),
            ];
            let mut team_id = None;
            for (column, value) in owner_columns {
                if column == "team_id" {
                    if let Value::Integer(team) = value {
                        team_id = Some(team.into());
                    }
                }
                columns.push(column);
                values.push(value);
            }

            let sql = format!(
                "INSERT INTO containers ({}) VALUES ({}) RETURNING id",
                columns.join(", "),
                vec!["?"; columns.len()].join(", ")
            );
            let id: ContainerId = tx
                .query_row(&sql, params_from_iter(values), |row| row.get(0))
                .map_err(|e| {
                    classify(
                        e,
                        StoreError::SafeRetry("containers"),
                        StoreError::ContainerOwnerDisappeared(owner.to_string()),
                    )
                })?;

            Ok(ContainerInfo {
                id,
                handle,
                worker_name: worker_name.to_string(),
                state: ContainerState::Creating,
                team_id,
                owner: Some(owner.clone()),
                discontinued: false,
                metadata: metadata.clone(),
            })
        })?;

        info!("Created container {} on {} for {}", info.handle, info.worker_name, owner);
        Ok(CreatingContainer::new(self.db.clone(), info))
    }

    /// The `creating` or `created` container of `owner` on `worker_name`
    pub fn find_container_on_worker(
        &self,
        worker_name: &str,
        owner: &ContainerOwner,
    ) -> StoreResult<Option<Container>> {
        let infos = self.db.read(|conn| {
            let Some(filter) = owner.find(conn)? else {
                return Ok(Vec::new());
            };
            let (clause, mut values) = filter.to_sql("c");
            values.insert(0, Value::Text(worker_name.to_string()));
            query(
                conn,
                &format!("c.worker_name = ? AND c.state IN ('creating', 'created') AND {clause}"),
                values,
            )
        })?;
        Ok(infos
            .into_iter()
            .next()
            .map(|info| Container::from_info(self.db.clone(), info)))
    }

    /// Worker already hosting a live container for `owner`, if any
    pub fn find_worker_for_container_by_owner(
        &self,
        owner: &ContainerOwner,
    ) -> StoreResult<Option<String>> {
        let infos = self.db.read(|conn| {
            let Some(filter) = owner.find(conn)? else {
                return Ok(Vec::new());
            };
            let (clause, values) = filter.to_sql("c");
            query(
                conn,
                &format!("c.state IN ('creating', 'created') AND {clause}"),
                values,
            )
        })?;
        Ok(infos.into_iter().next().map(|info| info.worker_name))
    }

    pub fn find_container_by_handle(&self, handle: &str) -> StoreResult<Option<Container>> {
        let infos = self
            .db
            .read(|conn| query(conn, "c.handle = ?", vec![Value::Text(handle.to_string())]))?;
        Ok(infos
            .into_iter()
            .next()
            .map(|info| Container::from_info(self.db.clone(), info)))
    }

    /// Containers whose reason to exist is gone
    ///
    /// That is: every owner column was nulled, the owning build finished, or
    /// the container an image check/get ran for has left `creating`.
    pub fn find_orphaned_containers(&self) -> StoreResult<Vec<Container>> {
        let filter = format!(
            "c.state IN ('creating', 'created', 'destroying') AND (
                (c.build_id IS NULL
                    AND c.image_check_container_id IS NULL
                    AND c.image_get_container_id IS NULL
                    AND c.worker_resource_config_check_session_id IS NULL)
                OR c.build_id IN (SELECT id FROM builds WHERE status IN ({}))
                OR c.image_check_container_id IN
                    (SELECT id FROM containers WHERE state != 'creating')
                OR c.image_get_container_id IN
                    (SELECT id FROM containers WHERE state != 'creating'))",
            BuildStatus::finished_sql()
        );
        let infos = self.db.read(|conn| query(conn, &filter, Vec::new()))?;
        Ok(infos
            .into_iter()
            .map(|info| Container::from_info(self.db.clone(), info))
            .collect())
    }

    pub fn find_failed_containers(&self) -> StoreResult<Vec<FailedContainer>> {
        let infos = self.db.read(|conn| query(conn, "c.state = 'failed'", Vec::new()))?;
        Ok(infos
            .into_iter()
            .filter_map(|info| match Container::from_info(self.db.clone(), info) {
                Container::Failed(c) => Some(c),
                _ => None,
            })
            .collect())
    }

    /// Every container, optionally limited to one worker
    pub fn list(&self, worker_name: Option<&str>) -> StoreResult<Vec<ContainerInfo>> {
        self.db.read(|conn| match worker_name {
            Some(name) => query(conn, "c.worker_name = ?", vec![Value::Text(name.to_string())]),
            None => query(conn, "1 = 1", Vec::new()),
        })
    }

    /// Number of containers per state
    pub fn count_by_state(&self) -> StoreResult<Vec<(ContainerState, i64)>> {
        self.db.read(|conn| {
            let mut stmt =
                conn.prepare("SELECT state, COUNT(*) FROM containers GROUP BY state ORDER BY state")?;
            let rows = stmt
                .query_map(params![], |row| Ok((row.get::<_, String>(0)?, row.get(1)?)))?
                .collect::<Result<Vec<_>, _>>()?;
            rows.into_iter()
                .map(|(state, n)| Ok((state.parse::<ContainerState>()?, n)))
                .collect()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::Builds;
    use crate::check::CheckSessionFactory;
    use crate::config::schema::CheckSessionConfig;
    use crate::db::testing::*;
    use crate::ids::{BuildId, TeamId};
    use crate::resource::{ResourceTypes, Source};
    use crate::worker::testing::register;

    fn build_step(build_id: BuildId) -> ContainerOwner {
        ContainerOwner::BuildStep {
            build_id,
            plan_id: "p".into(),
        }
    }

    fn setup() -> (tempfile::TempDir, Db, ContainerRepository, BuildId) {
        let (dir, db) = temp_db();
        register(&db, "w1");
        let build = Builds::new(db.clone()).create(BuildStatus::Started).unwrap();
        let repo = ContainerRepository::new(db.clone());
        (dir, db, repo, build)
    }

    #[test]
    fn create_then_find_on_worker() {
        let (_dir, _db, repo, build) = setup();
        let creating = repo
            .create_container("w1", &build_step(build), &ContainerMetadata::default())
            .unwrap();

        let found = repo
            .find_container_on_worker("w1", &build_step(build))
            .unwrap()
            .unwrap();
        assert_eq!(found.info().handle, creating.handle());
        assert_eq!(found.state(), ContainerState::Creating);
        assert_eq!(found.info().owner, Some(build_step(build)));

        assert!(repo
            .find_container_on_worker("w2", &build_step(build))
            .unwrap()
            .is_none());
        assert_eq!(
            repo.find_worker_for_container_by_owner(&build_step(build)).unwrap(),
            Some("w1".to_string())
        );
    }

    #[test]
    fn create_on_unknown_worker_fails() {
        let (_dir, _db, repo, build) = setup();
        let err = repo
            .create_container("nope", &build_step(build), &ContainerMetadata::default())
            .unwrap_err();
        assert!(matches!(err, StoreError::WorkerNotFound(_)));
    }

    #[test]
    fn create_for_vanished_build_reports_owner_gone() {
        let (_dir, _db, repo, _build) = setup();
        let err = repo
            .create_container("w1", &build_step(BuildId(999)), &ContainerMetadata::default())
            .unwrap_err();
        assert!(matches!(err, StoreError::ContainerOwnerDisappeared(_)));
    }

    #[test]
    fn failing_a_created_container_is_invalid() {
        let (_dir, _db, repo, build) = setup();
        let creating = repo
            .create_container("w1", &build_step(build), &ContainerMetadata::default())
            .unwrap();
        creating.created().unwrap();

        let err = creating.failed().unwrap_err();
        assert!(matches!(
            err,
            StoreError::InvalidTransition { ref from, ref to, .. } if from == "created" && to == "failed"
        ));
    }

    #[test]
    fn created_race_has_one_winner() {
        let (_dir, _db, repo, build) = setup();
        let creating = repo
            .create_container("w1", &build_step(build), &ContainerMetadata::default())
            .unwrap();
        let other = creating.clone();

        assert!(creating.created().is_ok());
        assert!(matches!(
            other.created(),
            Err(StoreError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn failed_is_idempotent_and_destroyable() {
        let (_dir, db, repo, build) = setup();
        let creating = repo
            .create_container("w1", &build_step(build), &ContainerMetadata::default())
            .unwrap();
        creating.failed().unwrap();
        creating.failed().unwrap();

        let failed = repo.find_failed_containers().unwrap();
        assert_eq!(failed.len(), 1);
        failed.into_iter().next().unwrap().destroy().unwrap();
        assert_eq!(count(&db, "containers"), 0);
    }

    #[test]
    fn full_lifecycle_removes_row() {
        let (_dir, db, repo, build) = setup();
        let creating = repo
            .create_container("w1", &build_step(build), &ContainerMetadata::default())
            .unwrap();
        let destroying = creating.created().unwrap().destroying().unwrap();
        assert!(!destroying.is_discontinued());
        let handle = destroying.handle().to_string();
        destroying.clone().destroy().unwrap();

        assert!(repo.find_container_by_handle(&handle).unwrap().is_none());
        assert_eq!(count(&db, "containers"), 0);
        assert!(matches!(destroying.destroy(), Err(StoreError::Missing { .. })));
    }

    #[test]
    fn discontinue_marks_destroying() {
        let (_dir, _db, repo, build) = setup();
        let created = repo
            .create_container("w1", &build_step(build), &ContainerMetadata::default())
            .unwrap()
            .created()
            .unwrap();
        let destroying = created.discontinue().unwrap();
        assert!(destroying.is_discontinued());

        match repo.find_container_by_handle(created.handle()).unwrap().unwrap() {
            Container::Destroying(c) => assert!(c.is_discontinued()),
            other => panic!("unexpected state {:?}", other.state()),
        }
        assert!(created.destroying().is_err());
    }

    #[test]
    fn finished_or_deleted_builds_orphan_their_containers() {
        let (_dir, db, repo, build) = setup();
        let builds = Builds::new(db.clone());
        repo.create_container("w1", &build_step(build), &ContainerMetadata::default())
            .unwrap();
        assert!(repo.find_orphaned_containers().unwrap().is_empty());

        builds.set_status(build, BuildStatus::Succeeded).unwrap();
        assert_eq!(repo.find_orphaned_containers().unwrap().len(), 1);

        builds.delete(build).unwrap();
        let orphans = repo.find_orphaned_containers().unwrap();
        assert_eq!(orphans.len(), 1);
        assert_eq!(orphans[0].info().owner, None);
    }

    #[test]
    fn image_containers_are_orphaned_once_parent_is_created() {
        let (_dir, _db, repo, build) = setup();
        let parent = repo
            .create_container("w1", &build_step(build), &ContainerMetadata::default())
            .unwrap();
        let owner = ContainerOwner::ImageCheck {
            container_id: parent.id(),
        };
        repo.create_container("w1", &owner, &ContainerMetadata::default())
            .unwrap();
        assert!(repo.find_orphaned_containers().unwrap().is_empty());

        parent.created().unwrap();
        let orphans = repo.find_orphaned_containers().unwrap();
        assert_eq!(orphans.len(), 1);
        assert_eq!(orphans[0].info().owner, Some(owner));
    }

    #[test]
    fn check_session_container_follows_session() {
        let (_dir, db, repo, _build) = setup();
        let session = CheckSessionFactory::new(db.clone(), &CheckSessionConfig::default())
            .find_or_create_resource_config_check_session(
                "git",
                &Source::new(),
                &ResourceTypes::default(),
            )
            .unwrap();
        let owner = ContainerOwner::CheckSession {
            session_id: session.id,
            team_id: Some(TeamId(7)),
        };

        let creating = repo
            .create_container("w1", &owner, &ContainerMetadata::default())
            .unwrap();
        assert_eq!(creating.info().team_id, Some(TeamId(7)));

        let found = repo.find_container_on_worker("w1", &owner).unwrap().unwrap();
        assert_eq!(found.info().owner, Some(owner.clone()));

        // Another team does not share the container
        let other_team = ContainerOwner::CheckSession {
            session_id: session.id,
            team_id: Some(TeamId(8)),
        };
        assert!(repo.find_container_on_worker("w1", &other_team).unwrap().is_none());

        db.connection()
            .unwrap()
            .execute("UPDATE resource_config_check_sessions SET expires_at = 0", [])
            .unwrap();
        CheckSessionFactory::new(db.clone(), &CheckSessionConfig::default())
            .clean_expired()
            .unwrap();
        assert_eq!(repo.find_orphaned_containers().unwrap().len(), 1);
    }

    #[test]
    fn check_session_needs_worker_base_type() {
        let (_dir, db, repo, _build) = setup();
        insert_worker(&db, "bare", "running");
        let session = CheckSessionFactory::new(db.clone(), &CheckSessionConfig::default())
            .find_or_create_resource_config_check_session(
                "git",
                &Source::new(),
                &ResourceTypes::default(),
            )
            .unwrap();
        let owner = ContainerOwner::CheckSession {
            session_id: session.id,
            team_id: None,
        };

        let err = repo
            .create_container("bare", &owner, &ContainerMetadata::default())
            .unwrap_err();
        assert!(matches!(err, StoreError::WorkerBaseResourceTypeDisappeared { .. }));
    }

    #[test]
    fn count_by_state_groups_rows() {
        let (_dir, _db, repo, build) = setup();
        let a = repo
            .create_container("w1", &build_step(build), &ContainerMetadata::default())
            .unwrap();
        repo.create_container(
            "w1",
            &ContainerOwner::BuildStep {
                build_id: build,
                plan_id: "q".into(),
            },
            &ContainerMetadata::default(),
        )
        .unwrap();
        a.created().unwrap();

        let counts = repo.count_by_state().unwrap();
        assert_eq!(
            counts,
            vec![(ContainerState::Created, 1), (ContainerState::Creating, 1)]
        );
        assert_eq!(repo.list(Some("w1")).unwrap().len(), 2);
        assert!(repo.list(Some("w2")).unwrap().is_empty());
    }
}
