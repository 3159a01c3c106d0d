//! Core library for the `mtbak` MikroTik backup tool.
//!
//! A run picks its targets from static configuration or by discovering the
//! routers behind running L2TP tunnels over the RouterOS API, then backs each
//! one up concurrently over SSH: it resolves the router identity, skips
//! routers already handled in the run, exports the configuration, saves a
//! binary backup, downloads both and removes them from the router. Expired
//! local backups are swept once every job has finished.

pub mod api;
pub mod backup;
pub mod command;
pub mod config;
pub mod discovery;
pub mod identity;
pub mod orchestrator;
pub mod registry;
pub mod remote;
pub mod retention;
pub mod router_list;
pub mod schedule;
pub mod target;
pub mod telemetry;
pub mod test_support;

pub use api::{ApiClient, ApiConnector, ApiError, RouterOsConnector, TlsOptions};
pub use backup::{BackupArtifacts, BackupError, BackupJob, JobOutcome};
pub use command::{CommandOutput, CommandRequest, CommandRunner, ProcessCommandRunner};
pub use config::{
    BackupConfig, ConfigError, DiscoveryConfig, LogConfig, Mode, RunOverrides, RunPlan, Settings,
    SingleRouterConfig, SshConfig, TargetPlan, ValidationError,
};
pub use discovery::{DiscoveredAddresses, DiscoveryEngine, DiscoverySettings};
pub use identity::{IdentityError, IdentityResolver, RouterIdentity};
pub use orchestrator::{Orchestrator, RunError, RunReport};
pub use registry::DedupRegistry;
pub use remote::{RemoteConnector, RemoteError, RemoteSession, SshConnector, SshOptions};
pub use retention::{RetentionError, RetentionSweep, SweepSummary};
pub use router_list::{RouterEntry, RouterListError, RouterListStore};
pub use schedule::Schedule;
pub use target::Target;
pub use telemetry::TelemetryError;
