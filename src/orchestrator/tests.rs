//! Tests for the run orchestrator.

use std::fs;
use std::time::Duration;

use camino::Utf8Path;
use rstest::{fixture, rstest};
use tempfile::TempDir;

use super::*;
use crate::api::TlsOptions;
use crate::config::Mode;
use crate::test_support::{
    FakeApiConnector, FakeApiRouter, FakeConnector, FakeRouter, RemoteEvent,
};

struct RunFixture {
    _tmp: TempDir,
    dir: Utf8PathBuf,
    date: NaiveDate,
}

#[fixture]
fn run_fixture() -> RunFixture {
    let tmp = TempDir::new().expect("temp dir");
    let dir = Utf8PathBuf::from_path_buf(tmp.path().join("mt-backup")).expect("utf8 path");
    RunFixture {
        _tmp: tmp,
        dir,
        date: NaiveDate::from_ymd_opt(2024, 3, 9).expect("valid date"),
    }
}

fn fast_resolver() -> IdentityResolver {
    IdentityResolver::new()
        .with_poll_interval(Duration::from_millis(5))
        .with_timeout(Duration::from_millis(100))
}

fn orchestrator(
    remote: FakeConnector,
    api: FakeApiConnector,
) -> Orchestrator<FakeConnector, FakeApiConnector> {
    Orchestrator::new(remote, api).with_resolver(fast_resolver())
}

fn static_plan(fixture: &RunFixture, hosts: &[&str]) -> RunPlan {
    RunPlan {
        mode: Mode::Multi,
        targets: TargetPlan::Static(
            hosts
                .iter()
                .map(|host| Target::new(*host, 22, "backup", "s3cret"))
                .collect(),
        ),
        backup_dir: fixture.dir.clone(),
        retention_days: 5,
    }
}

fn downloaded_files(dir: &Utf8Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .expect("backup dir should exist")
        .map(|entry| {
            entry
                .expect("dir entry")
                .file_name()
                .to_string_lossy()
                .into_owned()
        })
        .collect();
    names.sort();
    names
}

#[rstest]
#[tokio::test]
async fn backs_up_every_static_target(run_fixture: RunFixture) {
    let remote = FakeConnector::new()
        .with_router("10.0.0.1", FakeRouter::named("core"))
        .with_router("10.0.0.2", FakeRouter::named("edge"));
    let plan = static_plan(&run_fixture, &["10.0.0.1", "10.0.0.2"]);

    let report = orchestrator(remote, FakeApiConnector::new())
        .execute(&plan, run_fixture.date, SystemTime::now())
        .await
        .expect("run should succeed");

    assert_eq!(
        report,
        RunReport {
            completed: 2,
            skipped: 0,
            failed: 0,
            expired: 0,
        }
    );
    assert_eq!(
        downloaded_files(&run_fixture.dir),
        vec![
            "core-2024-03-09.backup",
            "core-2024-03-09.rsc",
            "edge-2024-03-09.backup",
            "edge-2024-03-09.rsc",
        ]
    );
}

#[rstest]
#[tokio::test]
async fn same_router_behind_two_addresses_is_backed_up_once(run_fixture: RunFixture) {
    let remote = FakeConnector::new()
        .with_router("10.0.0.1", FakeRouter::named("core"))
        .with_router("172.16.0.1", FakeRouter::named("core"));
    let plan = static_plan(&run_fixture, &["10.0.0.1", "172.16.0.1"]);

    let report = orchestrator(remote.clone(), FakeApiConnector::new())
        .execute(&plan, run_fixture.date, SystemTime::now())
        .await
        .expect("run should succeed");

    assert_eq!(report.completed, 1);
    assert_eq!(report.skipped, 1);
    let downloads = remote
        .events()
        .into_iter()
        .filter(|event| matches!(event, RemoteEvent::Downloaded { .. }))
        .count();
    assert_eq!(downloads, 2, "one export and one binary backup");
}

#[rstest]
#[tokio::test]
async fn failing_target_does_not_cancel_siblings(run_fixture: RunFixture) {
    let remote = FakeConnector::new()
        .with_router("10.0.0.1", FakeRouter::named("core"))
        .with_router("10.0.0.2", FakeRouter::named("edge").refusing_connections())
        .with_router(
            "10.0.0.3",
            FakeRouter::named("branch").failing_download(crate::backup::REMOTE_BACKUP),
        );
    let plan = static_plan(&run_fixture, &["10.0.0.1", "10.0.0.2", "10.0.0.3"]);

    let report = orchestrator(remote.clone(), FakeApiConnector::new())
        .execute(&plan, run_fixture.date, SystemTime::now())
        .await
        .expect("per-target failures are not fatal");

    assert_eq!(report.completed, 1);
    assert_eq!(report.failed, 2);
    assert_eq!(report.targets(), 3);
    assert!(
        remote
            .events_for("10.0.0.3")
            .contains(&RemoteEvent::Closed {
                host: String::from("10.0.0.3")
            }),
        "failed job should still close its session"
    );
}

#[rstest]
#[tokio::test]
async fn discovered_addresses_become_targets(run_fixture: RunFixture) {
    let api = FakeApiConnector::new().with_router(
        "198.51.100.1",
        FakeApiRouter::new()
            .client("l2tp-branch")
            .server("<l2tp-shop>")
            .address("l2tp-branch", "10.8.0.2/32")
            .address("<l2tp-shop>", "10.8.0.3"),
    );
    let remote = FakeConnector::new()
        .with_router("10.8.0.2", FakeRouter::named("branch"))
        .with_router("10.8.0.3", FakeRouter::named("shop"));
    let plan = RunPlan {
        mode: Mode::L2tp,
        targets: TargetPlan::Discover {
            hosts: vec![String::from("198.51.100.1")],
            settings: DiscoverySettings {
                api_port: 8728,
                api_ssl_port: 8729,
                tls: TlsOptions::default(),
                username: String::from("api"),
                password: String::from("apipass"),
            },
            ssh_port: 2222,
        },
        backup_dir: run_fixture.dir.clone(),
        retention_days: 5,
    };

    let report = orchestrator(remote.clone(), api)
        .execute(&plan, run_fixture.date, SystemTime::now())
        .await
        .expect("run should succeed");

    assert_eq!(report.completed, 2);
    assert!(
        remote
            .events_for("10.8.0.2")
            .contains(&RemoteEvent::Connected {
                host: String::from("10.8.0.2")
            })
    );
}

#[test]
fn discovered_targets_strip_prefixes_and_reuse_credentials() {
    let settings = DiscoverySettings {
        api_port: 8728,
        api_ssl_port: 8729,
        tls: TlsOptions::default(),
        username: String::from("api"),
        password: String::from("apipass"),
    };
    let found = DiscoveredAddresses::from([
        (String::from("gw--l2tp-a"), String::from("10.8.0.2/32")),
        (String::from("gw--l2tp-b"), String::from("  ")),
    ]);

    let targets = discovered_targets(&found, &settings, 2222);

    assert_eq!(targets, vec![Target::new("10.8.0.2", 2222, "api", "apipass")]);
}

#[rstest]
#[tokio::test]
async fn sweep_runs_after_the_jobs(run_fixture: RunFixture) {
    fs::create_dir_all(&run_fixture.dir).expect("create backup dir");
    let stale = run_fixture.dir.join("old-2023-01-01.rsc");
    fs::write(&stale, "old").expect("write stale file");
    let now = SystemTime::now() + Duration::from_secs(10 * 24 * 60 * 60);
    let remote = FakeConnector::new().with_router("10.0.0.1", FakeRouter::named("core"));
    let plan = static_plan(&run_fixture, &["10.0.0.1"]);

    let report = orchestrator(remote, FakeApiConnector::new())
        .execute(&plan, run_fixture.date, now)
        .await
        .expect("run should succeed");

    assert!(!stale.exists());
    assert_eq!(report.completed, 1);
    assert_eq!(
        report.expired, 3,
        "the stale file and both fresh artifacts are older than the shifted clock"
    );
}

#[tokio::test]
async fn validation_failure_stops_before_remote_work() {
    use crate::config::{
        BackupConfig, DiscoveryConfig, LogConfig, Settings, SingleRouterConfig, SshConfig,
    };

    let settings = Settings {
        backup: BackupConfig {
            mode: String::from("single"),
            backup_dir: String::from("mt-backup"),
            retention_days: 5,
        },
        single: SingleRouterConfig {
            single_host: None,
            single_ssh_port: 22,
            single_username: Some(String::from("backup")),
            single_password: Some(String::from("s3cret")),
        },
        discovery: DiscoveryConfig {
            discovery_hosts: Vec::new(),
            discovery_username: None,
            discovery_password: None,
            discovery_api_port: 8728,
            discovery_api_ssl_port: 8729,
            discovery_ssh_port: 22,
            discovery_use_tls: false,
            discovery_tls_skip_verify: false,
        },
        routers: Vec::new(),
        ssh: SshConfig {
            ssh_bin: String::from("ssh"),
            scp_bin: String::from("scp"),
            sshpass_bin: String::from("sshpass"),
            ssh_ignore_host_key: true,
            ssh_legacy_key_exchange: true,
            ssh_password_auth: true,
            ssh_connect_timeout_secs: 10,
        },
        log: LogConfig {
            log_level: String::from("info"),
            log_json: false,
            log_file: None,
        },
    };
    let remote = FakeConnector::new();

    let err = orchestrator(remote.clone(), FakeApiConnector::new())
        .run(
            &settings,
            NaiveDate::from_ymd_opt(2024, 3, 9).expect("valid date"),
            SystemTime::now(),
        )
        .await
        .expect_err("missing host should fail validation");

    assert!(
        matches!(err, RunError::Validation(ValidationError::SingleHostMissing)),
        "got {err:?}"
    );
    assert!(remote.events().is_empty());
}
