//! Layered configuration via `ortho-config`.
//!
//! Every section is its own derive struct sharing the `MTBAK` prefix and the
//! `mtbak.toml` discovery settings. Field names carry their section
//! (`single_host`, `discovery_hosts`, `ssh_bin`) so the flat file and the
//! environment (`MTBAK_SINGLE_HOST`) line up without collisions. The static
//! router list lives in `[[multi_router]]` tables and is read separately by
//! [`crate::router_list::RouterListStore`].

use std::ffi::OsString;
use std::fmt;

use camino::{Utf8Path, Utf8PathBuf};
use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

use crate::remote::SshOptions;
use crate::router_list::{RouterEntry, RouterListError, RouterListStore};

mod plan;

pub use plan::{Mode, RunPlan, TargetPlan, ValidationError};

/// Application name used for configuration discovery.
pub const APP_NAME: &str = "mtbak";
/// Environment variable naming an explicit configuration file.
pub const CONFIG_ENV_VAR: &str = "MTBAK_CONFIG_PATH";
/// Configuration file name searched in the XDG and project locations.
pub const CONFIG_FILE_NAME: &str = "mtbak.toml";
/// Configuration dotfile name searched in the home directory.
pub const DOTFILE_NAME: &str = ".mtbak.toml";

/// Default plain RouterOS API port.
pub const DEFAULT_API_PORT: u16 = 8728;
/// Default RouterOS API-SSL port.
pub const DEFAULT_API_SSL_PORT: u16 = 8729;

/// Run-wide settings.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "MTBAK",
    discovery(
        app_name = "mtbak",
        env_var = "MTBAK_CONFIG_PATH",
        config_file_name = "mtbak.toml",
        dotfile_name = ".mtbak.toml",
        project_file_name = "mtbak.toml"
    )
)]
pub struct BackupConfig {
    /// Targeting mode: `single`, `multi` or `l2tp`.
    #[ortho_config(default = String::from("single"))]
    pub mode: String,
    /// Directory receiving the downloaded artifacts.
    #[ortho_config(default = String::from("mt-backup"))]
    pub backup_dir: String,
    /// Artifacts older than this many days are removed after each run.
    #[ortho_config(default = 5)]
    pub retention_days: u32,
}

/// Connection details for `single` mode.
#[derive(Clone, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "MTBAK",
    discovery(
        app_name = "mtbak",
        env_var = "MTBAK_CONFIG_PATH",
        config_file_name = "mtbak.toml",
        dotfile_name = ".mtbak.toml",
        project_file_name = "mtbak.toml"
    )
)]
pub struct SingleRouterConfig {
    /// Router address.
    pub single_host: Option<String>,
    /// Router SSH port.
    #[ortho_config(default = 22)]
    pub single_ssh_port: u16,
    /// Login name.
    pub single_username: Option<String>,
    /// Login password.
    pub single_password: Option<String>,
}

impl fmt::Debug for SingleRouterConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SingleRouterConfig")
            .field("single_host", &self.single_host)
            .field("single_ssh_port", &self.single_ssh_port)
            .field("single_username", &self.single_username)
            .field("single_password", &redacted(self.single_password.as_ref()))
            .finish()
    }
}

/// Settings for `l2tp` discovery mode.
#[derive(Clone, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "MTBAK",
    discovery(
        app_name = "mtbak",
        env_var = "MTBAK_CONFIG_PATH",
        config_file_name = "mtbak.toml",
        dotfile_name = ".mtbak.toml",
        project_file_name = "mtbak.toml"
    )
)]
#[expect(
    clippy::struct_field_names,
    reason = "the prefix keeps flat file keys and environment names unique"
)]
pub struct DiscoveryConfig {
    /// Concentrator routers to query over the API.
    #[ortho_config(default = Vec::new())]
    pub discovery_hosts: Vec<String>,
    /// API and SSH login name.
    pub discovery_username: Option<String>,
    /// API and SSH password.
    pub discovery_password: Option<String>,
    /// Plain API port.
    #[ortho_config(default = DEFAULT_API_PORT)]
    pub discovery_api_port: u16,
    /// API-SSL port.
    #[ortho_config(default = DEFAULT_API_SSL_PORT)]
    pub discovery_api_ssl_port: u16,
    /// SSH port of the discovered routers.
    #[ortho_config(default = 22)]
    pub discovery_ssh_port: u16,
    /// Talk to the API over TLS.
    #[ortho_config(default = false)]
    pub discovery_use_tls: bool,
    /// Accept any API certificate.
    #[ortho_config(default = false)]
    pub discovery_tls_skip_verify: bool,
}

impl fmt::Debug for DiscoveryConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiscoveryConfig")
            .field("discovery_hosts", &self.discovery_hosts)
            .field("discovery_username", &self.discovery_username)
            .field(
                "discovery_password",
                &redacted(self.discovery_password.as_ref()),
            )
            .field("discovery_api_port", &self.discovery_api_port)
            .field("discovery_api_ssl_port", &self.discovery_api_ssl_port)
            .field("discovery_ssh_port", &self.discovery_ssh_port)
            .field("discovery_use_tls", &self.discovery_use_tls)
            .field("discovery_tls_skip_verify", &self.discovery_tls_skip_verify)
            .finish()
    }
}

/// OpenSSH client settings.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "MTBAK",
    discovery(
        app_name = "mtbak",
        env_var = "MTBAK_CONFIG_PATH",
        config_file_name = "mtbak.toml",
        dotfile_name = ".mtbak.toml",
        project_file_name = "mtbak.toml"
    )
)]
#[expect(
    clippy::struct_excessive_bools,
    reason = "configuration struct with user-facing toggle settings that are naturally expressed as booleans"
)]
pub struct SshConfig {
    /// Path to the `ssh` executable.
    #[ortho_config(default = String::from("ssh"))]
    pub ssh_bin: String,
    /// Path to the `scp` executable.
    #[ortho_config(default = String::from("scp"))]
    pub scp_bin: String,
    /// Path to the `sshpass` executable.
    #[ortho_config(default = String::from("sshpass"))]
    pub sshpass_bin: String,
    /// Skip host key verification.
    #[ortho_config(default = true)]
    pub ssh_ignore_host_key: bool,
    /// Offer `diffie-hellman-group-exchange-sha256` for older RouterOS.
    #[ortho_config(default = true)]
    pub ssh_legacy_key_exchange: bool,
    /// Authenticate with the configured password via `sshpass`.
    #[ortho_config(default = true)]
    pub ssh_password_auth: bool,
    /// TCP connect timeout in seconds.
    #[ortho_config(default = 10)]
    pub ssh_connect_timeout_secs: u32,
}

impl SshConfig {
    /// Converts the layered values into connector options.
    #[must_use]
    pub fn to_options(&self) -> SshOptions {
        SshOptions {
            ssh_bin: self.ssh_bin.clone(),
            scp_bin: self.scp_bin.clone(),
            sshpass_bin: self.sshpass_bin.clone(),
            ignore_host_key: self.ssh_ignore_host_key,
            legacy_key_exchange: self.ssh_legacy_key_exchange,
            password_auth: self.ssh_password_auth,
            connect_timeout_secs: self.ssh_connect_timeout_secs,
            ..SshOptions::default()
        }
    }
}

/// Logging settings consumed by [`crate::telemetry::init`].
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "MTBAK",
    discovery(
        app_name = "mtbak",
        env_var = "MTBAK_CONFIG_PATH",
        config_file_name = "mtbak.toml",
        dotfile_name = ".mtbak.toml",
        project_file_name = "mtbak.toml"
    )
)]
pub struct LogConfig {
    /// Default filter directive; `RUST_LOG` takes precedence.
    #[ortho_config(default = String::from("info"))]
    pub log_level: String,
    /// Emit JSON lines instead of human-readable text.
    #[ortho_config(default = false)]
    pub log_json: bool,
    /// Append to this file instead of writing to stdout.
    pub log_file: Option<String>,
}

/// Command-line values that take precedence over every other layer.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RunOverrides {
    /// Reads this configuration file instead of searching for one.
    pub config_path: Option<Utf8PathBuf>,
    /// Replaces [`BackupConfig::mode`].
    pub mode: Option<String>,
    /// Replaces [`BackupConfig::backup_dir`].
    pub backup_dir: Option<Utf8PathBuf>,
    /// Replaces [`BackupConfig::retention_days`].
    pub retention_days: Option<u32>,
}

impl BackupConfig {
    /// Applies command-line overrides in place.
    pub fn apply(&mut self, overrides: &RunOverrides) {
        if let Some(mode) = &overrides.mode {
            self.mode.clone_from(mode);
        }
        if let Some(dir) = &overrides.backup_dir {
            self.backup_dir = dir.to_string();
        }
        if let Some(days) = overrides.retention_days {
            self.retention_days = days;
        }
    }
}

/// Every configuration layer needed for one run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Settings {
    /// Run-wide settings.
    pub backup: BackupConfig,
    /// `single` mode router.
    pub single: SingleRouterConfig,
    /// `l2tp` discovery settings.
    pub discovery: DiscoveryConfig,
    /// `multi` mode router list.
    pub routers: Vec<RouterEntry>,
    /// OpenSSH client settings.
    pub ssh: SshConfig,
    /// Logging settings.
    pub log: LogConfig,
}

impl Settings {
    /// Loads every section from defaults, configuration files and the
    /// environment without parsing process arguments, then applies
    /// `overrides`. An explicit `config_path` replaces file discovery.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when a layer cannot be merged or the
    /// explicit file is missing, and [`ConfigError::RouterList`] when the
    /// router list is malformed.
    pub fn load(overrides: &RunOverrides) -> Result<Self, ConfigError> {
        let store = overrides
            .config_path
            .clone()
            .map_or_else(RouterListStore::new, RouterListStore::with_config_path);
        Self::load_with_store(overrides, &store)
    }

    /// Same as [`Settings::load`] with an explicit router list store.
    ///
    /// # Errors
    ///
    /// See [`Settings::load`].
    pub fn load_with_store(
        overrides: &RunOverrides,
        store: &RouterListStore,
    ) -> Result<Self, ConfigError> {
        let path = overrides.config_path.as_deref();
        let mut backup: BackupConfig = load_section(path)?;
        backup.apply(overrides);
        Ok(Self {
            backup,
            single: load_section(path)?,
            discovery: load_section(path)?,
            routers: store.load()?,
            ssh: load_section(path)?,
            log: load_section(path)?,
        })
    }
}

impl LogConfig {
    /// Loads logging settings on their own, for use before the rest of the
    /// configuration is read.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when merging sources fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        load_section(None)
    }
}

/// Merges one section without parsing process arguments. An explicit
/// `config_path` is handed to the loader as its required file.
fn load_section<T: OrthoConfig>(config_path: Option<&Utf8Path>) -> Result<T, ConfigError> {
    let mut args = vec![OsString::from(APP_NAME)];
    if let Some(path) = config_path {
        args.push(OsString::from("--config-path"));
        args.push(OsString::from(path.as_str()));
    }
    T::load_from_iter(args).map_err(|err| ConfigError::Parse(err.to_string()))
}

fn redacted(secret: Option<&String>) -> Option<&'static str> {
    secret.map(|_| "<redacted>")
}

/// Errors raised during configuration loading.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
    /// Raised when the `[[multi_router]]` list cannot be read.
    #[error(transparent)]
    RouterList(#[from] RouterListError),
}
