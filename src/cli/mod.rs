//! Command-line interface definitions for the `mtbak` binary.
//!
//! This module centralises the clap parser structures so both the main binary
//! and the build script can reuse them when generating the manual page.

use std::num::NonZeroU32;

use clap::{Args, Parser};

/// Top-level CLI for the `mtbak` binary.
#[derive(Debug, Parser)]
#[command(
    name = "mtbak",
    version,
    about = "Back up MikroTik routers over SSH",
    arg_required_else_help = true
)]
pub(crate) enum Cli {
    /// Back up every configured router once.
    #[command(name = "run", about = "Back up every configured router once")]
    Run(RunCommand),
    /// Back up immediately and then on a fixed period until interrupted.
    #[command(
        name = "schedule",
        about = "Back up now and then every N days until interrupted"
    )]
    Schedule(ScheduleCommand),
}

/// Overrides shared by every subcommand.
#[derive(Debug, Args)]
pub(crate) struct RunCommand {
    /// Configuration file to read instead of searching the usual locations.
    #[arg(long, short = 'c', value_name = "PATH")]
    pub(crate) config: Option<String>,
    /// Targeting mode: single, multi or l2tp.
    #[arg(long, short = 'm', value_name = "MODE")]
    pub(crate) mode: Option<String>,
    /// Directory receiving the downloaded backups.
    #[arg(long, short = 'b', value_name = "DIR")]
    pub(crate) backup_dir: Option<String>,
    /// Remove local backups older than this many days.
    #[arg(long, short = 'r', value_name = "DAYS")]
    pub(crate) retention_days: Option<u32>,
}

/// Arguments for the `mtbak schedule` subcommand.
#[derive(Debug, Args)]
pub(crate) struct ScheduleCommand {
    /// Days between two runs.
    #[arg(long, value_name = "DAYS", default_value = "1")]
    pub(crate) every_days: NonZeroU32,
    /// Overrides applied to every run.
    #[command(flatten)]
    pub(crate) run: RunCommand,
}
