//! Integration tests for resgraph

use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Write a config pointing the database into `dir`
fn write_config(dir: &Path) -> PathBuf {
    let config_path = dir.join("config.toml");
    let db_path = dir.join("state").join("resgraph.db");
    let content = format!(
        "[database]\npath = {:?}\nbusy_timeout_ms = 5000\nmax_retries = 5\n",
        db_path.display().to_string()
    );
    std::fs::write(&config_path, content).unwrap();
    config_path
}

mod cli_tests {
    use super::*;
    use assert_cmd::{cargo::cargo_bin_cmd, Command};
    use predicates::prelude::*;
    use serial_test::serial;

    struct Env {
        dir: TempDir,
        config: PathBuf,
    }

    impl Env {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let config = write_config(dir.path());
            Self { dir, config }
        }

        fn cmd(&self) -> Command {
            let mut cmd = cargo_bin_cmd!("resgraph");
            cmd.env("RESGRAPH_CONFIG", &self.config);
            cmd
        }
    }

    #[test]
    fn help_displays() {
        cargo_bin_cmd!("resgraph")
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("resource identity and cache store"));
    }

    #[test]
    fn version_displays() {
        cargo_bin_cmd!("resgraph")
            .arg("--version")
            .assert()
            .success()
            .stdout(predicate::str::contains("resgraph"));
    }

    #[test]
    #[serial]
    fn migrate_creates_database() {
        let env = Env::new();
        env.cmd()
            .arg("migrate")
            .assert()
            .success()
            .stdout(predicate::str::contains("Schema at version"));
    }

    #[test]
    #[serial]
    fn config_path_uses_override() {
        let env = Env::new();
        env.cmd()
            .args(["config", "path"])
            .assert()
            .success()
            .stdout(predicate::str::contains("config.toml"));
    }

    #[test]
    #[serial]
    fn config_show_prints_sections() {
        let env = Env::new();
        env.cmd()
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("[database]"))
            .stdout(predicate::str::contains("[check_sessions]"));
    }

    #[test]
    #[serial]
    fn config_init_refuses_to_overwrite() {
        let env = Env::new();
        env.cmd()
            .args(["config", "init"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Use --force to overwrite"));
    }

    #[test]
    #[serial]
    fn workers_list_empty() {
        let env = Env::new();
        env.cmd()
            .args(["workers", "list", "--format", "json"])
            .assert()
            .success()
            .stdout(predicate::str::contains("[]"));
    }

    #[test]
    #[serial]
    fn register_then_list_workers() {
        let env = Env::new();
        env.cmd()
            .args(["workers", "register", "w1", "-t", "git=/images/git@1.0"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Registered worker w1"));

        env.cmd()
            .args(["workers", "list", "--format", "plain"])
            .assert()
            .success()
            .stdout(predicate::str::diff("w1\n"));

        env.cmd()
            .args(["workers", "list"])
            .assert()
            .success()
            .stdout(predicate::str::contains("running"))
            .stdout(predicate::str::contains("1 worker(s)"));
    }

    #[test]
    #[serial]
    fn register_from_file() {
        let env = Env::new();
        let spec = env.dir.path().join("worker.json");
        std::fs::write(
            &spec,
            r#"{"name":"w2","team_id":7,"resource_types":[{"type":"git","image":"/img","version":"2"}]}"#,
        )
        .unwrap();

        env.cmd()
            .args(["workers", "register", "--file"])
            .arg(&spec)
            .assert()
            .success();

        env.cmd()
            .args(["workers", "list", "--format", "json"])
            .assert()
            .success()
            .stdout(predicate::str::contains("\"team_id\": 7"));
    }

    #[test]
    #[serial]
    fn prune_requires_stalled_worker() {
        let env = Env::new();
        env.cmd().args(["workers", "register", "w1"]).assert().success();

        env.cmd()
            .args(["workers", "prune", "w1"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("cannot transition from running"));

        env.cmd()
            .args(["workers", "state", "w1", "stalled"])
            .assert()
            .success();
        env.cmd().args(["workers", "prune", "w1"]).assert().success();
    }

    #[test]
    #[serial]
    fn unknown_worker_state_fails() {
        let env = Env::new();
        env.cmd()
            .args(["workers", "state", "w1", "sleeping"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("unknown worker state"));
    }

    #[test]
    #[serial]
    fn empty_listings() {
        let env = Env::new();
        env.cmd()
            .args(["caches", "list"])
            .assert()
            .success()
            .stdout(predicate::str::contains("No resource caches"));
        env.cmd()
            .args(["containers", "list", "--orphaned"])
            .assert()
            .success()
            .stdout(predicate::str::contains("No containers"));
        env.cmd()
            .args(["volumes", "list", "--failed", "--format", "json"])
            .assert()
            .success()
            .stdout(predicate::str::contains("[]"));
    }

    #[test]
    #[serial]
    fn gc_dry_run_reports_json() {
        let env = Env::new();
        env.cmd()
            .args(["gc", "--dry-run", "--format", "json"])
            .assert()
            .success()
            .stdout(predicate::str::contains("\"dry_run\":true"));
    }

    #[test]
    #[serial]
    fn gc_on_empty_database() {
        let env = Env::new();
        env.cmd()
            .arg("gc")
            .assert()
            .success()
            .stdout(predicate::str::contains("Nothing to collect"));
    }
}

mod store_tests {
    use super::*;
    use resgraph::build::{BuildStatus, Builds};
    use resgraph::config::schema::{CheckSessionConfig, DatabaseConfig};
    use resgraph::container::{Container, ContainerMetadata, ContainerOwner, ContainerRepository};
    use resgraph::db::Db;
    use resgraph::error::{ErrorKind, StoreError};
    use resgraph::gc::Collector;
    use resgraph::resource::{ResourceCacheFactory, ResourceTypes, ResourceUser, Source, Version};
    use resgraph::volume::VolumeRepository;
    use resgraph::worker::{WorkerFactory, WorkerResourceType, WorkerSpec};
    use std::thread;

    fn open() -> (TempDir, Db) {
        let dir = TempDir::new().unwrap();
        let db = Db::open(dir.path().join("store.db"), &DatabaseConfig::default()).unwrap();
        (dir, db)
    }

    fn register(db: &Db, name: &str) {
        WorkerFactory::new(db.clone())
            .save_worker(&WorkerSpec {
                name: name.to_string(),
                resource_types: vec![WorkerResourceType {
                    type_: "git".into(),
                    image: "/images/git".into(),
                    version: "1.0".into(),
                }],
                ..Default::default()
            })
            .unwrap();
    }

    fn source(uri: &str) -> Source {
        let mut source = Source::new();
        source.insert("uri".into(), uri.into());
        source
    }

    fn version(reference: &str) -> Version {
        let mut version = Version::new();
        version.insert("ref".into(), reference.into());
        version
    }

    fn step(build_id: resgraph::ids::BuildId, plan: &str) -> ContainerOwner {
        ContainerOwner::BuildStep {
            build_id,
            plan_id: plan.into(),
        }
    }

    #[test]
    fn concurrent_callers_share_one_cache() {
        let (_dir, db) = open();
        register(&db, "w1");
        let builds = Builds::new(db.clone());
        let build_ids: Vec<_> = (0..8)
            .map(|_| builds.create(BuildStatus::Started).unwrap())
            .collect();

        let handles: Vec<_> = build_ids
            .into_iter()
            .map(|build| {
                let db = db.clone();
                thread::spawn(move || {
                    let factory = ResourceCacheFactory::new(db.clone());
                    db.with_retry(|| {
                        factory.find_or_create_resource_cache(
                            &ResourceUser::ForBuild(build),
                            "git",
                            &version("abc"),
                            &source("https://example.com/repo"),
                            None,
                            &ResourceTypes::default(),
                        )
                    })
                    .unwrap()
                    .id
                })
            })
            .collect();

        let ids: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(ids.windows(2).all(|w| w[0] == w[1]));
    }

    #[test]
    fn cache_lives_while_a_build_runs() {
        let (_dir, db) = open();
        register(&db, "w1");
        let builds = Builds::new(db.clone());
        let build = builds.create(BuildStatus::Started).unwrap();
        let factory = ResourceCacheFactory::new(db.clone());

        let cache = factory
            .find_or_create_resource_cache(
                &ResourceUser::ForBuild(build),
                "git",
                &version("abc"),
                &source("x"),
                None,
                &ResourceTypes::default(),
            )
            .unwrap();

        let collector = Collector::new(db.clone(), &CheckSessionConfig::default());
        collector.run_once(false).unwrap();
        assert!(factory.find_resource_cache_by_id(cache.id).unwrap().is_some());

        builds.set_status(build, BuildStatus::Aborted).unwrap();
        let report = collector.run_once(false).unwrap();
        assert_eq!(report.build_uses_released, 1);
        assert!(factory.find_resource_cache_by_id(cache.id).unwrap().is_none());
    }

    #[test]
    fn stale_creating_handle_cannot_fail_a_created_container() {
        let (_dir, db) = open();
        register(&db, "w1");
        let build = Builds::new(db.clone()).create(BuildStatus::Started).unwrap();
        let repo = ContainerRepository::new(db.clone());

        let creating = repo
            .create_container("w1", &step(build, "a"), &ContainerMetadata::default())
            .unwrap();
        creating.created().unwrap();

        let err = creating.failed().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidTransition);

        match repo.find_container_by_handle(creating.handle()).unwrap() {
            Some(Container::Created(_)) => {}
            other => panic!("unexpected {:?}", other.map(|c| c.state())),
        }
    }

    #[test]
    fn child_volume_pins_its_parent() {
        let (_dir, db) = open();
        register(&db, "w1");
        let build = Builds::new(db.clone()).create(BuildStatus::Started).unwrap();
        let containers = ContainerRepository::new(db.clone());
        let volumes = VolumeRepository::new(db.clone());

        let first = containers
            .create_container("w1", &step(build, "a"), &ContainerMetadata::default())
            .unwrap();
        let second = containers
            .create_container("w1", &step(build, "b"), &ContainerMetadata::default())
            .unwrap();

        let parent = volumes
            .create_container_volume(&first, "/src")
            .unwrap()
            .created()
            .unwrap();
        let child = parent
            .create_child_for_container(&second, "/src")
            .unwrap()
            .created()
            .unwrap();
        assert_eq!(child.info().parent_handle.as_deref(), Some(parent.handle()));

        match parent.destroying() {
            Err(StoreError::VolumeHasChildren(handle)) => assert_eq!(handle, parent.handle()),
            other => panic!("unexpected {:?}", other),
        }

        child.destroying().unwrap().destroy().unwrap();
        parent.destroying().unwrap().destroy().unwrap();
        assert!(volumes.list(Some("w1")).unwrap().is_empty());
    }

    #[test]
    fn first_volume_wins_a_resource_cache() {
        let (_dir, db) = open();
        register(&db, "w1");
        let build = Builds::new(db.clone()).create(BuildStatus::Started).unwrap();
        let containers = ContainerRepository::new(db.clone());
        let volumes = VolumeRepository::new(db.clone());
        let cache = ResourceCacheFactory::new(db.clone())
            .find_or_create_resource_cache(
                &ResourceUser::ForBuild(build),
                "git",
                &version("abc"),
                &source("x"),
                None,
                &ResourceTypes::default(),
            )
            .unwrap();

        let mut claimed = Vec::new();
        for plan in ["a", "b"] {
            let container = containers
                .create_container("w1", &step(build, plan), &ContainerMetadata::default())
                .unwrap();
            let volume = volumes
                .create_container_volume(&container, "/out")
                .unwrap()
                .created()
                .unwrap();
            claimed.push(volume.initialize_resource_cache(&cache).unwrap().is_some());
        }

        assert_eq!(claimed, vec![true, false]);
        assert!(volumes
            .find_resource_cache_volume("w1", &cache)
            .unwrap()
            .is_some());
    }

    #[test]
    fn orphaned_containers_follow_finished_builds() {
        let (_dir, db) = open();
        register(&db, "w1");
        let builds = Builds::new(db.clone());
        let build = builds.create(BuildStatus::Started).unwrap();
        let repo = ContainerRepository::new(db.clone());

        repo.create_container("w1", &step(build, "a"), &ContainerMetadata::default())
            .unwrap()
            .created()
            .unwrap();
        assert!(repo.find_orphaned_containers().unwrap().is_empty());

        builds.set_status(build, BuildStatus::Succeeded).unwrap();
        let orphans = repo.find_orphaned_containers().unwrap();
        assert_eq!(orphans.len(), 1);
        assert!(matches!(orphans[0], Container::Created(_)));
    }
}
