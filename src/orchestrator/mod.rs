//! Orchestrates one backup run across every target.
//!
//! A run validates the settings, resolves the target list (discovering it
//! over the management API in `l2tp` mode), backs every target up on its own
//! task, waits for all of them and finally sweeps expired artifacts. A
//! failing target is logged and counted; it never cancels its siblings.

use std::sync::Arc;
use std::time::SystemTime;

use camino::Utf8PathBuf;
use chrono::NaiveDate;
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::api::ApiConnector;
use crate::backup::{BackupError, BackupJob, JobOutcome};
use crate::config::{RunPlan, Settings, TargetPlan, ValidationError};
use crate::discovery::{DiscoveredAddresses, DiscoveryEngine, DiscoverySettings};
use crate::identity::IdentityResolver;
use crate::registry::DedupRegistry;
use crate::remote::RemoteConnector;
use crate::retention::{RetentionError, RetentionSweep};
use crate::target::Target;

/// Errors that stop a run. Per-target failures are counted, not raised.
#[derive(Debug, Error)]
pub enum RunError {
    /// Raised before any remote work when the settings are incomplete.
    #[error(transparent)]
    Validation(#[from] ValidationError),
    /// Raised when the retention sweep fails after every job finished.
    #[error("retention sweep failed: {0}")]
    Retention(#[from] RetentionError),
}

/// Tally of one run.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct RunReport {
    /// Targets whose artifacts were downloaded.
    pub completed: usize,
    /// Targets skipped because their router was already handled.
    pub skipped: usize,
    /// Targets that failed at any step.
    pub failed: usize,
    /// Local files removed by the retention sweep.
    pub expired: usize,
}

impl RunReport {
    /// Number of targets the run attempted.
    #[must_use]
    pub const fn targets(&self) -> usize {
        self.completed + self.skipped + self.failed
    }
}

/// Runs backups through a remote connector, discovering targets through an
/// API connector when asked to.
#[derive(Debug)]
pub struct Orchestrator<C, A> {
    remote: Arc<C>,
    api: Arc<A>,
    resolver: IdentityResolver,
}

impl<C, A> Orchestrator<C, A>
where
    C: RemoteConnector + 'static,
    A: ApiConnector + 'static,
{
    /// Creates an orchestrator over the given connectors.
    #[must_use]
    pub fn new(remote: C, api: A) -> Self {
        Self {
            remote: Arc::new(remote),
            api: Arc::new(api),
            resolver: IdentityResolver::new(),
        }
    }

    /// Replaces the identity resolver handed to every job.
    ///
    /// This is primarily used by tests to keep timeout scenarios fast.
    #[must_use]
    pub const fn with_resolver(mut self, resolver: IdentityResolver) -> Self {
        self.resolver = resolver;
        self
    }

    /// Validates `settings` and executes the resulting plan.
    ///
    /// # Errors
    ///
    /// Returns [`RunError::Validation`] before any remote work when the
    /// settings are incomplete, and [`RunError::Retention`] when the final
    /// sweep fails.
    pub async fn run(
        &self,
        settings: &Settings,
        run_date: NaiveDate,
        now: SystemTime,
    ) -> Result<RunReport, RunError> {
        let plan = settings.plan()?;
        self.execute(&plan, run_date, now).await
    }

    /// Executes an already validated plan.
    ///
    /// Artifacts are named after `run_date`; the sweep ages files relative
    /// to `now`.
    ///
    /// # Errors
    ///
    /// Returns [`RunError::Retention`] when the final sweep fails.
    pub async fn execute(
        &self,
        plan: &RunPlan,
        run_date: NaiveDate,
        now: SystemTime,
    ) -> Result<RunReport, RunError> {
        info!(mode = %plan.mode, dir = %plan.backup_dir, "starting backup run");
        let targets = self.targets(&plan.targets).await;
        if targets.is_empty() {
            warn!(mode = %plan.mode, "no targets to back up");
        }

        let mut report = self
            .fan_out(targets, plan.backup_dir.clone(), run_date)
            .await;

        let sweep = RetentionSweep::new(plan.backup_dir.clone(), plan.retention_days);
        report.expired = sweep_blocking(sweep, now).await?;

        info!(
            completed = report.completed,
            skipped = report.skipped,
            failed = report.failed,
            expired = report.expired,
            "backup run finished"
        );
        Ok(report)
    }

    async fn targets(&self, plan: &TargetPlan) -> Vec<Target> {
        match plan {
            TargetPlan::Static(targets) => targets.clone(),
            TargetPlan::Discover {
                hosts,
                settings,
                ssh_port,
            } => {
                let engine = DiscoveryEngine::new(Arc::clone(&self.api), settings.clone());
                let found = engine.discover(hosts).await;
                info!(addresses = found.len(), "discovery finished");
                discovered_targets(&found, settings, *ssh_port)
            }
        }
    }

    async fn fan_out(
        &self,
        targets: Vec<Target>,
        backup_dir: Utf8PathBuf,
        run_date: NaiveDate,
    ) -> RunReport {
        let job = Arc::new(
            BackupJob::new(backup_dir, run_date, Arc::new(DedupRegistry::new()))
                .with_resolver(self.resolver.clone()),
        );

        let mut tasks = JoinSet::new();
        for target in targets {
            let job = Arc::clone(&job);
            let connector = Arc::clone(&self.remote);
            tasks.spawn(async move {
                let result = job.run(connector.as_ref(), &target).await;
                (target.host, result)
            });
        }

        let mut report = RunReport::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((host, result)) => tally(&mut report, &host, &result),
                Err(err) => {
                    error!(err = %err, "backup task aborted");
                    report.failed += 1;
                }
            }
        }
        report
    }
}

fn tally(report: &mut RunReport, host: &str, result: &Result<JobOutcome, BackupError>) {
    match result {
        Ok(JobOutcome::Completed { identity, .. }) => {
            info!(host, identity = %identity, "backup completed");
            report.completed += 1;
        }
        Ok(JobOutcome::Skipped { identity }) => {
            info!(host, identity = %identity, "router already backed up in this run");
            report.skipped += 1;
        }
        Err(err) => {
            error!(host, err = %err, "backup failed");
            report.failed += 1;
        }
    }
}

/// Turns discovery output into targets: one per address, with any `/prefix`
/// suffix dropped and the discovery credentials reused for SSH.
fn discovered_targets(
    found: &DiscoveredAddresses,
    settings: &DiscoverySettings,
    ssh_port: u16,
) -> Vec<Target> {
    found
        .values()
        .map(|network| host_part(network))
        .filter(|host| !host.is_empty())
        .map(|host| Target::new(host, ssh_port, &settings.username, &settings.password))
        .collect()
}

fn host_part(network: &str) -> &str {
    network
        .split_once('/')
        .map_or(network, |(address, _)| address)
        .trim()
}

async fn sweep_blocking(sweep: RetentionSweep, now: SystemTime) -> Result<usize, RetentionError> {
    let directory = sweep.directory().to_path_buf();
    tokio::task::spawn_blocking(move || sweep.run(now))
        .await
        .map_err(|err| RetentionError::Io {
            path: directory,
            message: err.to_string(),
        })?
        .map(|summary| summary.removed.len())
}

#[cfg(test)]
mod tests;
