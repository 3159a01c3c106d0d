//! The per-router backup job.
//!
//! A job opens one session, resolves the router identity, claims it in the
//! dedup registry, has the router write an export and a binary backup,
//! downloads both, and removes them from the router again.

use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::NaiveDate;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::identity::{IdentityError, IdentityResolver, RouterIdentity};
use crate::registry::DedupRegistry;
use crate::remote::{RemoteConnector, RemoteError, RemoteSession};
use crate::target::Target;

/// Writes the plain-text configuration export on the router.
pub const EXPORT_COMMAND: &str = "/export file=ssh-backup";
/// Writes the binary system backup on the router.
pub const SAVE_COMMAND: &str = "/system backup save name=ssh-backup";
/// Export file as written by [`EXPORT_COMMAND`].
pub const REMOTE_EXPORT: &str = "/ssh-backup.rsc";
/// Backup file as written by [`SAVE_COMMAND`].
pub const REMOTE_BACKUP: &str = "/ssh-backup.backup";

/// Local paths of the two files a successful job produces.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BackupArtifacts {
    /// `<identity>-<date>.rsc`
    pub export: Utf8PathBuf,
    /// `<identity>-<date>.backup`
    pub backup: Utf8PathBuf,
}

impl BackupArtifacts {
    /// Names the artifacts for `identity` on `date` inside `dir`.
    #[must_use]
    pub fn new(dir: &Utf8Path, identity: &RouterIdentity, date: NaiveDate) -> Self {
        let stem = format!("{identity}-{}", date.format("%Y-%m-%d"));
        Self {
            export: dir.join(format!("{stem}.rsc")),
            backup: dir.join(format!("{stem}.backup")),
        }
    }
}

/// How a job that did not fail ended.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum JobOutcome {
    /// Both artifacts were downloaded.
    Completed {
        /// Router identity.
        identity: RouterIdentity,
        /// Files written.
        artifacts: BackupArtifacts,
    },
    /// Another job in this run already claimed the identity.
    Skipped {
        /// Router identity.
        identity: RouterIdentity,
    },
}

/// Errors that end a job early.
#[derive(Debug, Error)]
pub enum BackupError {
    /// Raised when the session cannot be opened.
    #[error(transparent)]
    Connect(RemoteError),
    /// Raised when the identity cannot be resolved.
    #[error(transparent)]
    Identity(#[from] IdentityError),
    /// Raised when a backup command fails on the router.
    #[error("{step} failed: {source}")]
    Command {
        /// Step that failed.
        step: &'static str,
        /// Transport error.
        source: RemoteError,
    },
    /// Raised when an artifact cannot be downloaded.
    #[error("download of {file} failed: {source}")]
    Download {
        /// Local file that was being written.
        file: Utf8PathBuf,
        /// Transport error.
        source: RemoteError,
    },
}

/// Settings shared by every job of one run.
#[derive(Clone, Debug)]
pub struct BackupJob {
    backup_dir: Utf8PathBuf,
    run_date: NaiveDate,
    resolver: IdentityResolver,
    registry: Arc<DedupRegistry>,
}

impl BackupJob {
    /// Creates a job writing into `backup_dir` with artifacts dated
    /// `run_date`.
    #[must_use]
    pub const fn new(
        backup_dir: Utf8PathBuf,
        run_date: NaiveDate,
        registry: Arc<DedupRegistry>,
    ) -> Self {
        Self {
            backup_dir,
            run_date,
            resolver: IdentityResolver::new(),
            registry,
        }
    }

    /// Replaces the identity resolver.
    #[must_use]
    pub const fn with_resolver(mut self, resolver: IdentityResolver) -> Self {
        self.resolver = resolver;
        self
    }

    /// Backs up `target`. The session is closed on every path once opened.
    ///
    /// # Errors
    ///
    /// Returns [`BackupError`] when any step before the remote cleanup fails.
    pub async fn run<C: RemoteConnector>(
        &self,
        connector: &C,
        target: &Target,
    ) -> Result<JobOutcome, BackupError> {
        let session = connector
            .connect(target)
            .await
            .map_err(BackupError::Connect)?;
        let result = self.run_in_session(&session, target).await;
        if let Err(err) = session.close().await {
            warn!(host = %target.host, err = %err, "could not close session");
        }
        result
    }

    async fn run_in_session<S>(&self, session: &S, target: &Target) -> Result<JobOutcome, BackupError>
    where
        S: RemoteSession + Sync,
    {
        let identity = self.resolver.resolve(session, &target.host).await?;
        if self.registry.check_and_mark(&identity) {
            debug!(host = %target.host, identity = %identity, "router already handled in this run");
            return Ok(JobOutcome::Skipped { identity });
        }

        for (step, command) in [("export", EXPORT_COMMAND), ("backup save", SAVE_COMMAND)] {
            session
                .run(command)
                .await
                .map_err(|source| BackupError::Command { step, source })?;
        }

        let artifacts = BackupArtifacts::new(&self.backup_dir, &identity, self.run_date);
        let mut downloaded: Vec<&Utf8Path> = Vec::with_capacity(2);
        for (remote, local) in [
            (REMOTE_EXPORT, &artifacts.export),
            (REMOTE_BACKUP, &artifacts.backup),
        ] {
            if let Err(source) = session.download(remote, local).await {
                discard(&downloaded).await;
                return Err(BackupError::Download {
                    file: local.clone(),
                    source,
                });
            }
            info!(host = %target.host, identity = %identity, file = %local, "downloaded");
            downloaded.push(local.as_path());
        }

        for remote in [REMOTE_EXPORT, REMOTE_BACKUP] {
            if let Err(err) = session.delete(remote).await {
                warn!(host = %target.host, file = remote, err = %err, "could not remove remote file");
            }
        }

        Ok(JobOutcome::Completed {
            identity,
            artifacts,
        })
    }
}

/// Removes the artifacts of a run that failed partway.
async fn discard(files: &[&Utf8Path]) {
    for file in files {
        match tokio::fs::remove_file(file).await {
            Ok(()) => debug!(file = %file, "removed partial backup"),
            Err(err) => warn!(file = %file, err = %err, "could not remove partial backup"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::IDENTITY_COMMAND;
    use crate::test_support::{FakeConnector, FakeRouter, RemoteEvent};
    use rstest::{fixture, rstest};
    use std::time::Duration;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        backup_dir: Utf8PathBuf,
        registry: Arc<DedupRegistry>,
        job: BackupJob,
    }

    #[fixture]
    fn fixture() -> Fixture {
        let dir = TempDir::new().expect("temp dir");
        let backup_dir =
            Utf8PathBuf::from_path_buf(dir.path().join("mt-backup")).expect("utf8 path");
        let registry = Arc::new(DedupRegistry::new());
        let date = NaiveDate::from_ymd_opt(2024, 5, 6).expect("valid date");
        let job = BackupJob::new(backup_dir.clone(), date, Arc::clone(&registry)).with_resolver(
            IdentityResolver::new()
                .with_poll_interval(Duration::from_millis(1))
                .with_timeout(Duration::from_millis(50)),
        );
        Fixture {
            _dir: dir,
            backup_dir,
            registry,
            job,
        }
    }

    fn target(host: &str) -> Target {
        Target::new(host, 22, "admin", "pw")
    }

    fn ran(host: &str, command: &str) -> RemoteEvent {
        RemoteEvent::Ran {
            host: host.to_owned(),
            command: command.to_owned(),
        }
    }

    #[test]
    fn artifacts_are_named_after_identity_and_date() {
        let identity = RouterIdentity::from_raw("core-rtr").expect("identity");
        let date = NaiveDate::from_ymd_opt(2024, 1, 2).expect("valid date");

        let artifacts = BackupArtifacts::new(Utf8Path::new("mt-backup"), &identity, date);

        assert_eq!(artifacts.export, "mt-backup/core-rtr-2024-01-02.rsc");
        assert_eq!(artifacts.backup, "mt-backup/core-rtr-2024-01-02.backup");
    }

    #[rstest]
    #[tokio::test]
    async fn successful_job_runs_every_step_in_order(fixture: Fixture) {
        let connector = FakeConnector::new().with_router("10.0.0.1", FakeRouter::named("core"));

        let outcome = fixture
            .job
            .run(&connector, &target("10.0.0.1"))
            .await
            .expect("job should succeed");

        let export = fixture.backup_dir.join("core-2024-05-06.rsc");
        let backup = fixture.backup_dir.join("core-2024-05-06.backup");
        assert_eq!(
            connector.events(),
            vec![
                RemoteEvent::Connected {
                    host: String::from("10.0.0.1")
                },
                ran("10.0.0.1", IDENTITY_COMMAND),
                ran("10.0.0.1", EXPORT_COMMAND),
                ran("10.0.0.1", SAVE_COMMAND),
                RemoteEvent::Downloaded {
                    host: String::from("10.0.0.1"),
                    remote_path: String::from(REMOTE_EXPORT),
                    local_path: export.clone(),
                },
                RemoteEvent::Downloaded {
                    host: String::from("10.0.0.1"),
                    remote_path: String::from(REMOTE_BACKUP),
                    local_path: backup.clone(),
                },
                RemoteEvent::Deleted {
                    host: String::from("10.0.0.1"),
                    remote_path: String::from(REMOTE_EXPORT),
                },
                RemoteEvent::Deleted {
                    host: String::from("10.0.0.1"),
                    remote_path: String::from(REMOTE_BACKUP),
                },
                RemoteEvent::Closed {
                    host: String::from("10.0.0.1")
                },
            ]
        );
        assert!(export.is_file());
        assert!(backup.is_file());
        assert!(matches!(outcome, JobOutcome::Completed { .. }));
    }

    #[rstest]
    #[tokio::test]
    async fn claimed_identity_skips_remote_work(fixture: Fixture) {
        let connector = FakeConnector::new().with_router("10.0.0.1", FakeRouter::named("core"));
        let claimed = RouterIdentity::from_raw("core").expect("identity");
        assert!(!fixture.registry.check_and_mark(&claimed));

        let outcome = fixture
            .job
            .run(&connector, &target("10.0.0.1"))
            .await
            .expect("skip is not an error");

        assert_eq!(outcome, JobOutcome::Skipped { identity: claimed });
        assert_eq!(
            connector.events(),
            vec![
                RemoteEvent::Connected {
                    host: String::from("10.0.0.1")
                },
                ran("10.0.0.1", IDENTITY_COMMAND),
                RemoteEvent::Closed {
                    host: String::from("10.0.0.1")
                },
            ]
        );
        assert!(!fixture.backup_dir.exists());
    }

    #[rstest]
    #[tokio::test]
    async fn failed_export_closes_session_without_downloads(fixture: Fixture) {
        let connector = FakeConnector::new().with_router(
            "10.0.0.1",
            FakeRouter::named("core").failing_command(EXPORT_COMMAND),
        );

        let err = fixture
            .job
            .run(&connector, &target("10.0.0.1"))
            .await
            .expect_err("export failure should fail the job");

        assert!(
            matches!(err, BackupError::Command { step: "export", .. }),
            "got {err:?}"
        );
        let events = connector.events();
        assert!(!events
            .iter()
            .any(|event| matches!(event, RemoteEvent::Downloaded { .. })));
        assert!(matches!(events.last(), Some(RemoteEvent::Closed { .. })));
    }

    #[rstest]
    #[tokio::test]
    async fn failed_second_download_keeps_no_artifact(fixture: Fixture) {
        let connector = FakeConnector::new().with_router(
            "10.0.0.1",
            FakeRouter::named("core").failing_download(REMOTE_BACKUP),
        );

        let err = fixture
            .job
            .run(&connector, &target("10.0.0.1"))
            .await
            .expect_err("download failure should fail the job");

        let BackupError::Download { file, .. } = err else {
            panic!("expected Download, got {err:?}");
        };
        assert_eq!(file, fixture.backup_dir.join("core-2024-05-06.backup"));
        assert!(!file.exists());
        assert!(!fixture.backup_dir.join("core-2024-05-06.rsc").exists());
        assert!(matches!(
            connector.events().last(),
            Some(RemoteEvent::Closed { .. })
        ));
    }

    #[rstest]
    #[tokio::test]
    async fn hostile_identity_stays_inside_backup_dir(fixture: Fixture) {
        let connector = FakeConnector::new()
            .with_router("10.0.0.1", FakeRouter::named("../../outside/x"));

        let outcome = fixture
            .job
            .run(&connector, &target("10.0.0.1"))
            .await
            .expect("job should succeed");

        let JobOutcome::Completed { artifacts, .. } = outcome else {
            panic!("expected Completed, got {outcome:?}");
        };
        for file in [&artifacts.export, &artifacts.backup] {
            assert_eq!(file.parent(), Some(fixture.backup_dir.as_path()));
            assert!(file.is_file(), "{file} should exist");
        }
        let root = fixture.backup_dir.parent().expect("temp root");
        assert!(!root.join("outside").exists());
    }

    #[rstest]
    #[tokio::test]
    async fn delete_failures_do_not_fail_the_job(fixture: Fixture) {
        let connector = FakeConnector::new()
            .with_router("10.0.0.1", FakeRouter::named("core").failing_deletes());

        let outcome = fixture
            .job
            .run(&connector, &target("10.0.0.1"))
            .await
            .expect("delete failure is logged only");

        assert!(matches!(outcome, JobOutcome::Completed { .. }));
    }

    #[rstest]
    #[tokio::test]
    async fn connect_failure_is_reported_without_close(fixture: Fixture) {
        let connector = FakeConnector::new()
            .with_router("10.0.0.1", FakeRouter::named("core").refusing_connections());

        let err = fixture
            .job
            .run(&connector, &target("10.0.0.1"))
            .await
            .expect_err("refused connection should fail");

        assert!(matches!(err, BackupError::Connect(_)), "got {err:?}");
        assert!(connector.events().is_empty());
    }

    #[rstest]
    #[tokio::test]
    async fn identity_timeout_fails_the_job(fixture: Fixture) {
        let connector = FakeConnector::new().with_router(
            "10.0.0.1",
            FakeRouter::named("core").with_identity_replies([""]),
        );

        let err = fixture
            .job
            .run(&connector, &target("10.0.0.1"))
            .await
            .expect_err("empty identity should time out");

        assert!(
            matches!(err, BackupError::Identity(IdentityError::Timeout { .. })),
            "got {err:?}"
        );
        assert!(fixture.registry.is_empty());
    }
}
