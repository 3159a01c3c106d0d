//! Binary entry point for the `mtbak` CLI.

use std::io::{self, Write};
use std::process;
use std::time::SystemTime;

use camino::Utf8PathBuf;
use chrono::{Local, NaiveDate};
use clap::Parser;
use thiserror::Error;
use tracing::error;

use mtbak::{
    ConfigError, Orchestrator, ProcessCommandRunner, RouterOsConnector, RunError, RunOverrides,
    Schedule, Settings, SshConnector, TelemetryError, telemetry,
};

mod cli;

use cli::{Cli, RunCommand, ScheduleCommand};

type ProcessOrchestrator = Orchestrator<SshConnector<ProcessCommandRunner>, RouterOsConnector>;

#[derive(Debug, Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("logging setup failed: {0}")]
    Telemetry(#[from] TelemetryError),
    #[error("backup run failed: {0}")]
    Run(#[from] RunError),
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let exit_code = match dispatch(cli).await {
        Ok(()) => 0,
        Err(err) => {
            report_error(&err);
            1
        }
    };

    process::exit(exit_code);
}

async fn dispatch(cli: Cli) -> Result<(), CliError> {
    match cli {
        Cli::Run(command) => run_once(&command).await,
        Cli::Schedule(command) => run_schedule(&command).await,
    }
}

async fn run_once(command: &RunCommand) -> Result<(), CliError> {
    let (settings, orchestrator) = prepare(command)?;
    orchestrator
        .run(&settings, today(), SystemTime::now())
        .await?;
    Ok(())
}

async fn run_schedule(command: &ScheduleCommand) -> Result<(), CliError> {
    let (settings, orchestrator) = prepare(&command.run)?;
    settings.plan().map_err(RunError::from)?;

    let settings = &settings;
    let orchestrator = &orchestrator;
    Schedule::every_days(command.every_days)
        .run(
            move || async move { orchestrator.run(settings, today(), SystemTime::now()).await },
            shutdown_signal(),
        )
        .await;
    Ok(())
}

fn prepare(command: &RunCommand) -> Result<(Settings, ProcessOrchestrator), CliError> {
    let settings = Settings::load(&overrides(command))?;
    telemetry::init(&settings.log)?;
    let orchestrator = Orchestrator::new(
        SshConnector::with_process_runner(settings.ssh.to_options()),
        RouterOsConnector::new(),
    );
    Ok((settings, orchestrator))
}

fn overrides(command: &RunCommand) -> RunOverrides {
    RunOverrides {
        config_path: command.config.as_deref().map(Utf8PathBuf::from),
        mode: command.mode.clone(),
        backup_dir: command.backup_dir.as_deref().map(Utf8PathBuf::from),
        retention_days: command.retention_days,
    }
}

fn today() -> NaiveDate {
    Local::now().date_naive()
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(err = %err, "cannot listen for Ctrl-C, stopping schedule");
    }
}

fn report_error(err: &CliError) {
    write_error(io::stderr(), err);
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "{err}").ok();
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use mtbak::ValidationError;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn run_flags_become_overrides() {
        let Cli::Run(command) = Cli::parse_from([
            "mtbak",
            "run",
            "-c",
            "/etc/mtbak/site.toml",
            "--mode",
            "multi",
            "--backup-dir",
            "/srv/mt",
            "-r",
            "7",
        ]) else {
            panic!("expected run subcommand");
        };

        assert_eq!(
            overrides(&command),
            RunOverrides {
                config_path: Some(Utf8PathBuf::from("/etc/mtbak/site.toml")),
                mode: Some(String::from("multi")),
                backup_dir: Some(Utf8PathBuf::from("/srv/mt")),
                retention_days: Some(7),
            }
        );
    }

    #[test]
    fn schedule_rejects_zero_days() {
        let result = Cli::try_parse_from(["mtbak", "schedule", "--every-days", "0"]);
        assert!(result.is_err());
    }

    #[test]
    fn schedule_defaults_to_daily() {
        let Cli::Schedule(command) = Cli::parse_from(["mtbak", "schedule"]) else {
            panic!("expected schedule subcommand");
        };
        assert_eq!(command.every_days.get(), 1);
        assert_eq!(overrides(&command.run), RunOverrides::default());
    }

    #[test]
    fn write_error_writes_cli_error() {
        let mut buf = Vec::new();
        let err = CliError::Run(RunError::Validation(ValidationError::SingleHostMissing));
        write_error(&mut buf, &err);
        let rendered = String::from_utf8(buf).expect("utf8");
        assert!(
            rendered.contains("single mode router host missing"),
            "rendered: {rendered}"
        );
    }
}
