//! Mode selection and validation of the loaded settings.

use std::fmt;
use std::str::FromStr;

use camino::Utf8PathBuf;
use thiserror::Error;

use super::{DiscoveryConfig, Settings, SingleRouterConfig};
use crate::api::TlsOptions;
use crate::discovery::DiscoverySettings;
use crate::router_list::RouterEntry;
use crate::target::{DEFAULT_SSH_PORT, Target};

/// How targets are chosen.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Mode {
    /// One router from the `single_*` settings.
    Single,
    /// Every `[[multi_router]]` entry.
    Multi,
    /// Routers behind running L2TP tunnels on the discovery hosts.
    L2tp,
}

impl Mode {
    /// Name used in configuration.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Single => "single",
            Self::Multi => "multi",
            Self::L2tp => "l2tp",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = ValidationError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "single" => Ok(Self::Single),
            "multi" => Ok(Self::Multi),
            "l2tp" => Ok(Self::L2tp),
            _ => Err(ValidationError::UnknownMode {
                mode: value.to_owned(),
            }),
        }
    }
}

/// Reasons a configuration cannot start a run.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ValidationError {
    /// `single` mode without a host.
    #[error("single mode router host missing: set MTBAK_SINGLE_HOST or add single_host to mtbak.toml")]
    SingleHostMissing,
    /// `single` mode without a username.
    #[error(
        "single mode username missing: set MTBAK_SINGLE_USERNAME or add single_username to mtbak.toml"
    )]
    SingleUsernameMissing,
    /// `single` mode without a password.
    #[error(
        "single mode password missing: set MTBAK_SINGLE_PASSWORD or add single_password to mtbak.toml"
    )]
    SinglePasswordMissing,
    /// `multi` mode with an empty router list.
    #[error("multi mode router list is empty: add [[multi_router]] tables to mtbak.toml")]
    MultiRoutersMissing,
    /// A router list entry lacks a required field.
    #[error("multi_router[{index}] is missing {field}")]
    MultiRouterFieldMissing {
        /// Zero-based position in the list.
        index: usize,
        /// Name of the missing field.
        field: &'static str,
    },
    /// `l2tp` mode without hosts to query.
    #[error(
        "discovery hosts missing: set MTBAK_DISCOVERY_HOSTS or add discovery_hosts to mtbak.toml"
    )]
    DiscoveryHostsMissing,
    /// `l2tp` mode without a username.
    #[error(
        "discovery username missing: set MTBAK_DISCOVERY_USERNAME or add discovery_username to mtbak.toml"
    )]
    DiscoveryUsernameMissing,
    /// `l2tp` mode without a password.
    #[error(
        "discovery password missing: set MTBAK_DISCOVERY_PASSWORD or add discovery_password to mtbak.toml"
    )]
    DiscoveryPasswordMissing,
    /// The mode name is not recognised.
    #[error("unknown mode {mode:?}: expected single, multi or l2tp")]
    UnknownMode {
        /// Value as configured.
        mode: String,
    },
    /// A zero-day window would delete the artifacts just downloaded.
    #[error("retention_days must be greater than zero")]
    RetentionDaysZero,
}

/// Where the targets of a run come from.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum TargetPlan {
    /// Targets known up front.
    Static(Vec<Target>),
    /// Targets found by querying `hosts` over the management API.
    Discover {
        /// Concentrator routers to query.
        hosts: Vec<String>,
        /// API connection settings.
        settings: DiscoverySettings,
        /// SSH port used for every discovered router.
        ssh_port: u16,
    },
}

/// A validated run.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RunPlan {
    /// Selected mode.
    pub mode: Mode,
    /// Target source.
    pub targets: TargetPlan,
    /// Artifact directory.
    pub backup_dir: Utf8PathBuf,
    /// Retention window in days.
    pub retention_days: u32,
}

impl Settings {
    /// Selects the mode and checks that it has everything it needs.
    ///
    /// # Errors
    ///
    /// Returns the [`ValidationError`] for the first missing field.
    pub fn plan(&self) -> Result<RunPlan, ValidationError> {
        let mode: Mode = self.backup.mode.parse()?;
        if self.backup.retention_days == 0 {
            return Err(ValidationError::RetentionDaysZero);
        }

        let targets = match mode {
            Mode::Single => TargetPlan::Static(vec![single_target(&self.single)?]),
            Mode::Multi => TargetPlan::Static(multi_targets(&self.routers)?),
            Mode::L2tp => discovery_plan(&self.discovery)?,
        };

        Ok(RunPlan {
            mode,
            targets,
            backup_dir: Utf8PathBuf::from(&self.backup.backup_dir),
            retention_days: self.backup.retention_days,
        })
    }
}

fn present(value: Option<&String>) -> Option<&str> {
    value.map(|text| text.trim()).filter(|text| !text.is_empty())
}

fn secret(value: Option<&String>) -> Option<&str> {
    value.map(String::as_str).filter(|text| !text.is_empty())
}

fn single_target(config: &SingleRouterConfig) -> Result<Target, ValidationError> {
    let host =
        present(config.single_host.as_ref()).ok_or(ValidationError::SingleHostMissing)?;
    let username = present(config.single_username.as_ref())
        .ok_or(ValidationError::SingleUsernameMissing)?;
    let password = secret(config.single_password.as_ref())
        .ok_or(ValidationError::SinglePasswordMissing)?;
    Ok(Target::new(host, config.single_ssh_port, username, password))
}

fn multi_targets(entries: &[RouterEntry]) -> Result<Vec<Target>, ValidationError> {
    if entries.is_empty() {
        return Err(ValidationError::MultiRoutersMissing);
    }

    entries
        .iter()
        .enumerate()
        .map(|(index, entry)| {
            let missing = |field| ValidationError::MultiRouterFieldMissing { index, field };
            let host = present(entry.host.as_ref()).ok_or_else(|| missing("host"))?;
            let username = present(entry.username.as_ref()).ok_or_else(|| missing("username"))?;
            let password = secret(entry.password.as_ref()).ok_or_else(|| missing("password"))?;
            Ok(Target::new(
                host,
                entry.ssh_port.unwrap_or(DEFAULT_SSH_PORT),
                username,
                password,
            ))
        })
        .collect()
}

fn discovery_plan(config: &DiscoveryConfig) -> Result<TargetPlan, ValidationError> {
    let hosts: Vec<String> = config
        .discovery_hosts
        .iter()
        .map(|host| host.trim())
        .filter(|host| !host.is_empty())
        .map(str::to_owned)
        .collect();
    if hosts.is_empty() {
        return Err(ValidationError::DiscoveryHostsMissing);
    }
    let username = present(config.discovery_username.as_ref())
        .ok_or(ValidationError::DiscoveryUsernameMissing)?;
    let password = secret(config.discovery_password.as_ref())
        .ok_or(ValidationError::DiscoveryPasswordMissing)?;

    Ok(TargetPlan::Discover {
        hosts,
        settings: DiscoverySettings {
            api_port: config.discovery_api_port,
            api_ssl_port: config.discovery_api_ssl_port,
            tls: TlsOptions {
                enabled: config.discovery_use_tls,
                skip_verify: config.discovery_tls_skip_verify,
            },
            username: username.to_owned(),
            password: password.to_owned(),
        },
        ssh_port: config.discovery_ssh_port,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackupConfig, DEFAULT_API_PORT, DEFAULT_API_SSL_PORT, LogConfig, SshConfig};
    use rstest::{fixture, rstest};

    fn some(value: &str) -> Option<String> {
        Some(value.to_owned())
    }

    #[fixture]
    fn settings() -> Settings {
        Settings {
            backup: BackupConfig {
                mode: String::from("single"),
                backup_dir: String::from("mt-backup"),
                retention_days: 5,
            },
            single: SingleRouterConfig {
                single_host: some("192.168.88.1"),
                single_ssh_port: 22,
                single_username: some("backup"),
                single_password: some("s3cret"),
            },
            discovery: DiscoveryConfig {
                discovery_hosts: vec![String::from("10.0.0.1")],
                discovery_username: some("api"),
                discovery_password: some("apipass"),
                discovery_api_port: DEFAULT_API_PORT,
                discovery_api_ssl_port: DEFAULT_API_SSL_PORT,
                discovery_ssh_port: 2222,
                discovery_use_tls: false,
                discovery_tls_skip_verify: false,
            },
            routers: vec![RouterEntry {
                host: some("10.1.0.1"),
                ssh_port: None,
                username: some("admin"),
                password: some("pw"),
            }],
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
        }
    }

    fn with_mode(mut settings: Settings, mode: &str) -> Settings {
        settings.backup.mode = mode.to_owned();
        settings
    }

    #[rstest]
    #[case("single", Mode::Single)]
    #[case(" Multi ", Mode::Multi)]
    #[case("L2TP", Mode::L2tp)]
    fn parses_modes(#[case] raw: &str, #[case] expected: Mode) {
        assert_eq!(raw.parse::<Mode>(), Ok(expected));
    }

    #[rstest]
    fn unknown_mode_is_rejected(settings: Settings) {
        let err = with_mode(settings, "ospf")
            .plan()
            .expect_err("unknown mode should fail");
        assert_eq!(
            err,
            ValidationError::UnknownMode {
                mode: String::from("ospf")
            }
        );
    }

    #[rstest]
    fn single_mode_builds_one_target(settings: Settings) {
        let plan = settings.plan().expect("single plan");
        assert_eq!(plan.mode, Mode::Single);
        assert_eq!(plan.backup_dir, Utf8PathBuf::from("mt-backup"));
        assert_eq!(
            plan.targets,
            TargetPlan::Static(vec![Target::new("192.168.88.1", 22, "backup", "s3cret")])
        );
    }

    #[rstest]
    #[case::host(|c: &mut SingleRouterConfig| c.single_host = some("  "), ValidationError::SingleHostMissing)]
    #[case::username(|c: &mut SingleRouterConfig| c.single_username = None, ValidationError::SingleUsernameMissing)]
    #[case::password(|c: &mut SingleRouterConfig| c.single_password = some(""), ValidationError::SinglePasswordMissing)]
    fn single_mode_reports_each_missing_field(
        mut settings: Settings,
        #[case] clear: fn(&mut SingleRouterConfig),
        #[case] expected: ValidationError,
    ) {
        clear(&mut settings.single);
        assert_eq!(settings.plan(), Err(expected));
    }

    #[rstest]
    fn multi_mode_defaults_the_port(settings: Settings) {
        let plan = with_mode(settings, "multi").plan().expect("multi plan");
        assert_eq!(
            plan.targets,
            TargetPlan::Static(vec![Target::new("10.1.0.1", DEFAULT_SSH_PORT, "admin", "pw")])
        );
    }

    #[rstest]
    fn multi_mode_needs_routers(mut settings: Settings) {
        settings.routers.clear();
        assert_eq!(
            with_mode(settings, "multi").plan(),
            Err(ValidationError::MultiRoutersMissing)
        );
    }

    #[rstest]
    #[case::host(|e: &mut RouterEntry| e.host = None, "host")]
    #[case::username(|e: &mut RouterEntry| e.username = some(" "), "username")]
    #[case::password(|e: &mut RouterEntry| e.password = None, "password")]
    fn multi_mode_reports_entry_index(
        mut settings: Settings,
        #[case] clear: fn(&mut RouterEntry),
        #[case] field: &'static str,
    ) {
        let mut broken = RouterEntry {
            host: some("10.1.0.2"),
            ssh_port: Some(22),
            username: some("admin"),
            password: some("pw"),
        };
        clear(&mut broken);
        settings.routers.push(broken);

        assert_eq!(
            with_mode(settings, "multi").plan(),
            Err(ValidationError::MultiRouterFieldMissing { index: 1, field })
        );
    }

    #[rstest]
    fn discovery_mode_carries_api_settings(mut settings: Settings) {
        settings.discovery.discovery_use_tls = true;
        settings.discovery.discovery_hosts = vec![String::from(" 10.0.0.1 "), String::new()];

        let plan = with_mode(settings, "l2tp").plan().expect("discovery plan");

        let TargetPlan::Discover {
            hosts,
            settings: api,
            ssh_port,
        } = plan.targets
        else {
            panic!("expected a discovery plan");
        };
        assert_eq!(hosts, vec![String::from("10.0.0.1")]);
        assert_eq!(ssh_port, 2222);
        assert!(api.tls.enabled);
        assert_eq!(api.address_for("10.0.0.1"), "10.0.0.1:8729");
    }

    #[rstest]
    #[case::hosts(|c: &mut DiscoveryConfig| c.discovery_hosts = vec![String::from(" ")], ValidationError::DiscoveryHostsMissing)]
    #[case::username(|c: &mut DiscoveryConfig| c.discovery_username = None, ValidationError::DiscoveryUsernameMissing)]
    #[case::password(|c: &mut DiscoveryConfig| c.discovery_password = None, ValidationError::DiscoveryPasswordMissing)]
    fn discovery_mode_reports_each_missing_field(
        mut settings: Settings,
        #[case] clear: fn(&mut DiscoveryConfig),
        #[case] expected: ValidationError,
    ) {
        clear(&mut settings.discovery);
        assert_eq!(with_mode(settings, "l2tp").plan(), Err(expected));
    }

    #[rstest]
    fn zero_retention_is_rejected(mut settings: Settings) {
        settings.backup.retention_days = 0;
        assert_eq!(settings.plan(), Err(ValidationError::RetentionDaysZero));
    }
}
