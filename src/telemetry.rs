//! Tracing subscriber setup driven by [`LogConfig`].

use std::env;
use std::fs::File;
use std::sync::Mutex;

use camino::Utf8Path;
use cap_std::{ambient_authority, fs_utf8::Dir, fs_utf8::OpenOptions};
use thiserror::Error;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::writer::BoxMakeWriter;

use crate::config::LogConfig;

/// Environment variable whose directives replace the configured level.
pub const FILTER_ENV_VAR: &str = "RUST_LOG";

/// Errors raised while installing the subscriber.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum TelemetryError {
    /// Raised when the level or `RUST_LOG` is not a valid filter.
    #[error("invalid log filter {directive:?}: {message}")]
    Filter {
        /// Directive that failed to parse.
        directive: String,
        /// Parser diagnostic.
        message: String,
    },
    /// Raised when the log file cannot be opened for appending.
    #[error("failed to open log file {path}: {message}")]
    File {
        /// Configured log file.
        path: String,
        /// Human-readable error message.
        message: String,
    },
    /// Raised when a global subscriber is already installed.
    #[error("failed to install log subscriber: {0}")]
    Install(String),
}

/// Installs the global subscriber.
///
/// # Errors
///
/// Returns [`TelemetryError`] when the filter is invalid, the log file
/// cannot be opened or a subscriber is already installed.
pub fn init(config: &LogConfig) -> Result<(), TelemetryError> {
    let filter = build_filter(env::var(FILTER_ENV_VAR).ok().as_deref(), &config.log_level)?;
    let (writer, ansi) = match &config.log_file {
        Some(path) => (BoxMakeWriter::new(Mutex::new(open_append(Utf8Path::new(path))?)), false),
        None => (BoxMakeWriter::new(std::io::stdout), true),
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(ansi)
        .with_target(false);
    let installed = if config.log_json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|err| TelemetryError::Install(err.to_string()))
}

/// Builds the filter: non-empty `env_directives` win over `level`.
fn build_filter(env_directives: Option<&str>, level: &str) -> Result<EnvFilter, TelemetryError> {
    let directive = env_directives
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .unwrap_or(level);
    EnvFilter::try_new(directive).map_err(|err| TelemetryError::Filter {
        directive: directive.to_owned(),
        message: err.to_string(),
    })
}

fn open_append(path: &Utf8Path) -> Result<File, TelemetryError> {
    let file_error = |message: String| TelemetryError::File {
        path: path.to_string(),
        message,
    };
    let parent = path
        .parent()
        .filter(|dir| !dir.as_str().is_empty())
        .unwrap_or_else(|| Utf8Path::new("."));
    let file_name = path
        .file_name()
        .ok_or_else(|| file_error(String::from("log file path is missing a filename")))?;

    Dir::create_ambient_dir_all(parent, ambient_authority())
        .map_err(|err| file_error(err.to_string()))?;
    let dir = Dir::open_ambient_dir(parent, ambient_authority())
        .map_err(|err| file_error(err.to_string()))?;
    let file = dir
        .open_with(file_name, OpenOptions::new().create(true).append(true))
        .map_err(|err| file_error(err.to_string()))?;
    Ok(file.into_std())
}
