//! Reader for the static `[[multi_router]]` list.
//!
//! Arrays of tables do not fit the flat derive structs in
//! [`crate::config`], so the list is read straight from the first
//! configuration file that `ortho-config` discovery finds.

use std::fmt;
use std::io;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use ortho_config::{ConfigDiscovery, ConfigDiscoveryBuilder};
use ortho_config::toml;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use crate::config::{APP_NAME, CONFIG_ENV_VAR, CONFIG_FILE_NAME, DOTFILE_NAME};

/// Table array key holding the router list.
pub const MULTI_ROUTER_KEY: &str = "multi_router";
const HYPHENATED_KEY: &str = "multi-router";

/// One `[[multi_router]]` entry as written by the user.
///
/// Every field is optional here; missing values are reported by
/// [`crate::config::Settings::plan`] with the entry index.
#[derive(Clone, Default, Deserialize, PartialEq, Eq)]
pub struct RouterEntry {
    /// Router address.
    pub host: Option<String>,
    /// SSH port, 22 when unset.
    #[serde(alias = "ssh-port")]
    pub ssh_port: Option<u16>,
    /// Login name.
    #[serde(alias = "user")]
    pub username: Option<String>,
    /// Login password.
    #[serde(alias = "pass")]
    pub password: Option<String>,
}

impl fmt::Debug for RouterEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouterEntry")
            .field("host", &self.host)
            .field("ssh_port", &self.ssh_port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Errors raised while reading the router list.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum RouterListError {
    /// Raised when file system operations fail.
    #[error("failed to access {path}: {message}")]
    Io {
        /// Path that could not be accessed.
        path: Utf8PathBuf,
        /// Human-readable error message.
        message: String,
    },
    /// Raised when the file is not valid TOML.
    #[error("failed to parse {path}: {message}")]
    Parse {
        /// Path that could not be parsed.
        path: Utf8PathBuf,
        /// Human-readable error message.
        message: String,
    },
    /// Raised when the router list has an unexpected shape.
    #[error("invalid router list in {path}: {message}")]
    InvalidStructure {
        /// Path that had invalid content.
        path: Utf8PathBuf,
        /// Human-readable error message.
        message: String,
    },
}

/// Reads `[[multi_router]]` using `ortho-config`'s discovery search order.
#[derive(Clone, Debug)]
pub struct RouterListStore {
    discovery: ConfigDiscovery,
    required: Option<Utf8PathBuf>,
}

impl RouterListStore {
    /// Builds a store using the standard `mtbak` discovery settings.
    #[must_use]
    pub fn new() -> Self {
        Self::with_discovery(standard_discovery().build())
    }

    /// Reads `path` only; a missing file is an error rather than an empty
    /// list.
    #[must_use]
    pub fn with_config_path(path: Utf8PathBuf) -> Self {
        Self {
            discovery: standard_discovery()
                .add_required_path(path.clone().into_std_path_buf())
                .build(),
            required: Some(path),
        }
    }

    /// Builds a store using an explicit discovery configuration.
    #[must_use]
    pub const fn with_discovery(discovery: ConfigDiscovery) -> Self {
        Self {
            discovery,
            required: None,
        }
    }

    /// Returns the entries of the first configuration file found, or an
    /// empty list when there is no file or no `[[multi_router]]` key.
    ///
    /// # Errors
    ///
    /// Returns [`RouterListError`] when the file cannot be read or the list
    /// is malformed.
    pub fn load(&self) -> Result<Vec<RouterEntry>, RouterListError> {
        let Some(path) = self.locate()? else {
            debug!("no configuration file found, router list is empty");
            return Ok(Vec::new());
        };
        let contents = read_config(&path)?;
        parse_entries(&path, &contents)
    }

    fn locate(&self) -> Result<Option<Utf8PathBuf>, RouterListError> {
        if let Some(path) = &self.required {
            if !path_exists(path)? {
                return Err(RouterListError::Io {
                    path: path.clone(),
                    message: String::from("configuration file not found"),
                });
            }
            return Ok(Some(path.clone()));
        }
        for candidate in self.discovery.utf8_candidates() {
            if path_exists(&candidate)? {
                return Ok(Some(candidate));
            }
        }
        Ok(None)
    }
}

impl Default for RouterListStore {
    fn default() -> Self {
        Self::new()
    }
}

fn standard_discovery() -> ConfigDiscoveryBuilder {
    ConfigDiscovery::builder(APP_NAME)
        .env_var(CONFIG_ENV_VAR)
        .config_file_name(CONFIG_FILE_NAME)
        .dotfile_name(DOTFILE_NAME)
        .project_file_name(CONFIG_FILE_NAME)
}

fn split(path: &Utf8Path) -> Result<(&Utf8Path, &str), RouterListError> {
    let parent = path.parent().unwrap_or_else(|| Utf8Path::new("."));
    let file_name = path
        .file_name()
        .ok_or_else(|| RouterListError::InvalidStructure {
            path: path.to_path_buf(),
            message: String::from("configuration file path is missing a filename"),
        })?;
    Ok((parent, file_name))
}

fn path_exists(path: &Utf8Path) -> Result<bool, RouterListError> {
    let (parent, file_name) = split(path)?;
    match Dir::open_ambient_dir(parent, ambient_authority()) {
        Ok(dir) => dir.try_exists(file_name).map_err(|err| RouterListError::Io {
            path: path.to_path_buf(),
            message: err.to_string(),
        }),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(RouterListError::Io {
            path: parent.to_path_buf(),
            message: err.to_string(),
        }),
    }
}

fn read_config(path: &Utf8Path) -> Result<String, RouterListError> {
    let (parent, file_name) = split(path)?;
    let dir =
        Dir::open_ambient_dir(parent, ambient_authority()).map_err(|err| RouterListError::Io {
            path: parent.to_path_buf(),
            message: err.to_string(),
        })?;
    dir.read_to_string(file_name)
        .map_err(|err| RouterListError::Io {
            path: path.to_path_buf(),
            message: err.to_string(),
        })
}

fn parse_entries(path: &Utf8Path, contents: &str) -> Result<Vec<RouterEntry>, RouterListError> {
    if contents.trim().is_empty() {
        return Ok(Vec::new());
    }

    let value: toml::Value = toml::from_str(contents).map_err(|err| RouterListError::Parse {
        path: path.to_path_buf(),
        message: err.to_string(),
    })?;
    let table = value
        .as_table()
        .ok_or_else(|| RouterListError::InvalidStructure {
            path: path.to_path_buf(),
            message: String::from("configuration root is not a table"),
        })?;

    let Some(list) = table
        .get(MULTI_ROUTER_KEY)
        .or_else(|| table.get(HYPHENATED_KEY))
    else {
        return Ok(Vec::new());
    };

    let items = list
        .as_array()
        .ok_or_else(|| RouterListError::InvalidStructure {
            path: path.to_path_buf(),
            message: format!("{MULTI_ROUTER_KEY} must be an array of tables"),
        })?;

    items
        .iter()
        .enumerate()
        .map(|(index, item)| {
            item.clone()
                .try_into::<RouterEntry>()
                .map_err(|err| RouterListError::InvalidStructure {
                    path: path.to_path_buf(),
                    message: format!("{MULTI_ROUTER_KEY}[{index}]: {err}"),
                })
        })
        .collect()
}
