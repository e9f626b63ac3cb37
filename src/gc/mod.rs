//! One garbage-collection pass over the graph
//!
//! Cleanups run in dependency order: use edges first, then what only those
//! edges kept alive. Containers and volumes are only marked `destroying`;
//! removing them from workers happens elsewhere.

use crate::check::CheckSessionFactory;
use crate::config::schema::CheckSessionConfig;
use crate::container::{Container, ContainerRepository};
use crate::db::Db;
use crate::error::{ErrorKind, StoreError, StoreResult};
use crate::resource::{ResourceCacheLifecycle, ResourceConfigFactory};
use crate::volume::VolumeRepository;
use serde::Serialize;
use tracing::{debug, info};

/// What one pass did, or would do on a dry run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GcReport {
    pub dry_run: bool,
    pub build_uses_released: usize,
    pub check_sessions_expired: usize,
    pub worker_resource_caches_removed: usize,
    pub resource_caches_removed: usize,
    pub resource_configs_removed: usize,
    pub base_resource_types_removed: usize,
    pub containers_destroying: usize,
    pub volumes_destroying: usize,
    pub volumes_pinned_by_children: usize,
    pub failed_containers_removed: usize,
    pub failed_volumes_removed: usize,
}

impl GcReport {
    /// Rows touched in total
    pub fn total(&self) -> usize {
        self.build_uses_released
            + self.check_sessions_expired
            + self.worker_resource_caches_removed
            + self.resource_caches_removed
            + self.resource_configs_removed
            + self.base_resource_types_removed
            + self.containers_destroying
            + self.volumes_destroying
            + self.failed_containers_removed
            + self.failed_volumes_removed
    }

    /// Label and count pairs, in pass order
    pub fn entries(&self) -> Vec<(&'static str, usize)> {
        vec![
            ("build uses released", self.build_uses_released),
            ("check sessions expired", self.check_sessions_expired),
            ("worker resource caches removed", self.worker_resource_caches_removed),
            ("resource caches removed", self.resource_caches_removed),
            ("resource configs removed", self.resource_configs_removed),
            ("base resource types removed", self.base_resource_types_removed),
            ("containers marked destroying", self.containers_destroying),
            ("volumes marked destroying", self.volumes_destroying),
            ("volumes pinned by children", self.volumes_pinned_by_children),
            ("failed containers removed", self.failed_containers_removed),
            ("failed volumes removed", self.failed_volumes_removed),
        ]
    }
}

/// Runs collection passes against one database
#[derive(Debug, Clone)]
pub struct Collector {
    lifecycle: ResourceCacheLifecycle,
    configs: ResourceConfigFactory,
    sessions: CheckSessionFactory,
    containers: ContainerRepository,
    volumes: VolumeRepository,
}

impl Collector {
    pub fn new(db: Db, check_sessions: &CheckSessionConfig) -> Self {
        Self {
            lifecycle: ResourceCacheLifecycle::new(db.clone()),
            configs: ResourceConfigFactory::new(db.clone()),
            sessions: CheckSessionFactory::new(db.clone(), check_sessions),
            containers: ContainerRepository::new(db.clone()),
            volumes: VolumeRepository::new(db),
        }
    }

    /// Run one pass
    ///
    /// A dry run changes nothing and reports the orphaned and failed rows a
    /// real pass would act on.
    pub fn run_once(&self, dry_run: bool) -> StoreResult<GcReport> {
        if dry_run {
            return self.survey();
        }

        let mut report = GcReport {
            build_uses_released: self.lifecycle.clean_uses_for_finished_builds()?,
            check_sessions_expired: self.sessions.clean_expired()?,
            worker_resource_caches_removed: self.lifecycle.clean_unused_worker_resource_caches()?,
            ..Default::default()
        };

        // Removing a custom type's config can free the cache it was parented by
        loop {
            let caches = self.lifecycle.clean_unreferenced_caches()?;
            let configs = self.configs.clean_unreferenced_configs()?;
            report.resource_caches_removed += caches;
            report.resource_configs_removed += configs;
            if caches + configs == 0 {
                break;
            }
        }
        report.base_resource_types_removed = self.lifecycle.clean_unused_base_resource_types()?;

        for container in self.containers.find_orphaned_containers()? {
            if let Container::Created(created) = container {
                match created.destroying() {
                    Ok(_) => report.containers_destroying += 1,
                    Err(e) if lost_race(&e) => debug!("Skipping container: {}", e),
                    Err(e) => return Err(e),
                }
            }
        }

        for volume in self.volumes.get_orphaned_volumes()? {
            match volume.destroying() {
                Ok(_) => report.volumes_destroying += 1,
                Err(StoreError::VolumeHasChildren(handle)) => {
                    debug!("Volume {} still has children", handle);
                    report.volumes_pinned_by_children += 1;
                }
                Err(e) if lost_race(&e) => debug!("Skipping volume: {}", e),
                Err(e) => return Err(e),
            }
        }

        for container in self.containers.find_failed_containers()? {
            match container.destroy() {
                Ok(()) => report.failed_containers_removed += 1,
                Err(e) if lost_race(&e) => debug!("Skipping failed container: {}", e),
                Err(e) => return Err(e),
            }
        }

        for volume in self.volumes.get_failed_volumes()? {
            match volume.destroy() {
                Ok(()) => report.failed_volumes_removed += 1,
                Err(e) if lost_race(&e) => debug!("Skipping failed volume: {}", e),
                Err(e) => return Err(e),
            }
        }

        info!("GC pass touched {} rows", report.total());
        Ok(report)
    }

    fn survey(&self) -> StoreResult<GcReport> {
        let containers_destroying = self
            .containers
            .find_orphaned_containers()?
            .iter()
            .filter(|c| matches!(c, Container::Created(_)))
            .count();

        Ok(GcReport {
            dry_run: true,
            containers_destroying,
            volumes_destroying: self.volumes.get_orphaned_volumes()?.len(),
            failed_containers_removed: self.containers.find_failed_containers()?.len(),
            failed_volumes_removed: self.volumes.get_failed_volumes()?.len(),
            ..Default::default()
        })
    }
}

/// Another actor moved or removed the row first
fn lost_race(err: &StoreError) -> bool {
    matches!(err.kind(), ErrorKind::InvalidTransition | ErrorKind::NotFound)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::{BuildStatus, Builds};
    use crate::container::{ContainerMetadata, ContainerOwner};
    use crate::db::testing::*;
    use crate::ids::{BuildId, ResourceId};
    use crate::resource::{ResourceCacheFactory, ResourceTypes, ResourceUser, Source, Version};
    use crate::worker::testing::register;

    fn collector(db: &Db) -> Collector {
        Collector::new(db.clone(), &CheckSessionConfig::default())
    }

    fn version(reference: &str) -> Version {
        let mut v = Version::new();
        v.insert("ref".into(), reference.into());
        v
    }

    fn use_cache(db: &Db, user: &ResourceUser, uri: &str) {
        let mut source = Source::new();
        source.insert("uri".into(), uri.into());
        ResourceCacheFactory::new(db.clone())
            .find_or_create_resource_cache(
                user,
                "git",
                &version("abc"),
                &source,
                None,
                &ResourceTypes::default(),
            )
            .unwrap();
    }

    fn build_step(build_id: BuildId, plan: &str) -> ContainerOwner {
        ContainerOwner::BuildStep {
            build_id,
            plan_id: plan.into(),
        }
    }

    #[test]
    fn empty_database_is_a_no_op() {
        let (_dir, db) = temp_db();
        let report = collector(&db).run_once(false).unwrap();
        assert_eq!(report.total(), 0);
    }

    #[test]
    fn finished_build_caches_are_collected() {
        let (_dir, db) = temp_db();
        register(&db, "w1");
        let builds = Builds::new(db.clone());
        let build = builds.create(BuildStatus::Started).unwrap();

        use_cache(&db, &ResourceUser::ForBuild(build), "x");
        use_cache(&db, &ResourceUser::ForResource(ResourceId(1)), "y");

        let report = collector(&db).run_once(false).unwrap();
        assert_eq!(report.resource_caches_removed, 0);

        builds.set_status(build, BuildStatus::Succeeded).unwrap();
        let report = collector(&db).run_once(false).unwrap();
        assert_eq!(report.build_uses_released, 1);
        assert_eq!(report.resource_caches_removed, 1);
        assert_eq!(report.resource_configs_removed, 1);
        assert_eq!(count(&db, "resource_caches"), 1);
        assert_eq!(count(&db, "resource_configs"), 1);
        // The worker still provides git
        assert_eq!(count(&db, "base_resource_types"), 1);
    }

    #[test]
    fn orphans_are_marked_and_failures_removed() {
        let (_dir, db) = temp_db();
        register(&db, "w1");
        let builds = Builds::new(db.clone());
        let build = builds.create(BuildStatus::Started).unwrap();
        let containers = ContainerRepository::new(db.clone());
        let volumes = VolumeRepository::new(db.clone());

        let running = containers
            .create_container("w1", &build_step(build, "a"), &ContainerMetadata::default())
            .unwrap();
        let volume = volumes
            .create_container_volume(&running, "/src")
            .unwrap()
            .created()
            .unwrap();
        running.created().unwrap();

        containers
            .create_container("w1", &build_step(build, "b"), &ContainerMetadata::default())
            .unwrap()
            .failed()
            .unwrap();

        let dry = collector(&db).run_once(true).unwrap();
        assert!(dry.dry_run);
        assert_eq!(dry.containers_destroying, 0);
        assert_eq!(dry.failed_containers_removed, 1);
        assert_eq!(count(&db, "containers"), 2);

        builds.set_status(build, BuildStatus::Failed).unwrap();
        let report = collector(&db).run_once(false).unwrap();
        assert_eq!(report.containers_destroying, 1);
        assert_eq!(report.failed_containers_removed, 1);
        // The volume is still mounted into the destroying container
        assert_eq!(report.volumes_destroying, 0);

        match containers.find_container_by_handle(running.handle()).unwrap().unwrap() {
            Container::Destroying(c) => c.destroy().unwrap(),
            other => panic!("unexpected state {:?}", other.state()),
        }

        let report = collector(&db).run_once(false).unwrap();
        assert_eq!(report.volumes_destroying, 1);
        assert!(volumes.find_created_volume(volume.handle()).unwrap().is_none());
    }

    #[test]
    fn parent_volumes_wait_for_children() {
        let (_dir, db) = temp_db();
        register(&db, "w1");
        let builds = Builds::new(db.clone());
        let build = builds.create(BuildStatus::Started).unwrap();
        let containers = ContainerRepository::new(db.clone());
        let volumes = VolumeRepository::new(db.clone());

        let first = containers
            .create_container("w1", &build_step(build, "a"), &ContainerMetadata::default())
            .unwrap();
        let second = containers
            .create_container("w1", &build_step(build, "b"), &ContainerMetadata::default())
            .unwrap();
        let parent = volumes
            .create_container_volume(&first, "/src")
            .unwrap()
            .created()
            .unwrap();
        parent
            .create_child_for_container(&second, "/src")
            .unwrap()
            .created()
            .unwrap();

        // Orphan the parent only
        first.failed().unwrap().destroy().unwrap();

        let report = collector(&db).run_once(false).unwrap();
        assert_eq!(report.volumes_pinned_by_children, 1);
        assert_eq!(report.volumes_destroying, 0);
        assert!(volumes.find_created_volume(parent.handle()).unwrap().is_some());
    }
}
