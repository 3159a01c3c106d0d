//! Router discovery through active L2TP tunnels.
//!
//! Each configured host is asked over the management API for its running
//! L2TP client and server interfaces and for the addresses bound to them.
//! Hosts are queried concurrently; their results land in one map keyed by
//! `host--interface`.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::api::{ApiClient, ApiConnector, ApiError, TlsOptions};
use crate::target::socket_address;

/// Lists running L2TP client interfaces.
pub const L2TP_CLIENT_PATH: &str = "/interface/l2tp-client/print";
/// Lists running L2TP server bindings.
pub const L2TP_SERVER_PATH: &str = "/interface/l2tp-server/print";
/// Lists addresses, filtered by interface.
pub const ADDRESS_PATH: &str = "/ip/address/print";

/// Discovered addresses keyed by `host--interface`.
pub type DiscoveredAddresses = BTreeMap<String, String>;

/// Builds the `host--interface` key.
#[must_use]
pub fn composite_key(host: &str, interface: &str) -> String {
    format!("{host}--{interface}")
}

/// Connection settings shared by every discovery host.
#[derive(Clone, Eq, PartialEq)]
pub struct DiscoverySettings {
    /// Plain API port.
    pub api_port: u16,
    /// API-SSL port.
    pub api_ssl_port: u16,
    /// Transport security.
    pub tls: TlsOptions,
    /// API login name.
    pub username: String,
    /// API password.
    pub password: String,
}

impl DiscoverySettings {
    /// Address to dial for `host`, choosing the port by TLS mode.
    #[must_use]
    pub fn address_for(&self, host: &str) -> String {
        let port = if self.tls.enabled {
            self.api_ssl_port
        } else {
            self.api_port
        };
        socket_address(host, port)
    }
}

impl fmt::Debug for DiscoverySettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiscoverySettings")
            .field("api_port", &self.api_port)
            .field("api_ssl_port", &self.api_ssl_port)
            .field("tls", &self.tls)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Per-host discovery failure. Logged, never escalated.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// Raised when the API session or one of its queries fails.
    #[error("api request to {host} failed: {source}")]
    Api {
        /// Host being queried.
        host: String,
        /// Underlying API error.
        source: ApiError,
    },
}

/// Queries hosts concurrently and merges their tunnel addresses.
#[derive(Debug)]
pub struct DiscoveryEngine<A: ApiConnector> {
    connector: Arc<A>,
    settings: Arc<DiscoverySettings>,
}

impl<A: ApiConnector + 'static> DiscoveryEngine<A> {
    /// Creates an engine that dials through `connector`.
    #[must_use]
    pub fn new(connector: Arc<A>, settings: DiscoverySettings) -> Self {
        Self {
            connector,
            settings: Arc::new(settings),
        }
    }

    /// Discovers addresses on every host in `hosts`.
    ///
    /// Returns once every host has finished. A host that fails at any step
    /// contributes nothing.
    pub async fn discover(&self, hosts: &[String]) -> DiscoveredAddresses {
        let merged = Arc::new(Mutex::new(DiscoveredAddresses::new()));
        let mut tasks = JoinSet::new();

        for raw_host in hosts {
            let host = raw_host.trim().to_owned();
            if host.is_empty() {
                continue;
            }
            let connector = Arc::clone(&self.connector);
            let settings = Arc::clone(&self.settings);
            let shared = Arc::clone(&merged);
            tasks.spawn(async move {
                match discover_host(connector.as_ref(), &settings, &host).await {
                    Ok(partial) => {
                        info!(host = %host, interfaces = partial.len(), "discovered tunnel addresses");
                        shared
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .extend(partial);
                    }
                    Err(err) => warn!(host = %host, err = %err, "discovery failed"),
                }
            });
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(err) = joined {
                warn!(err = %err, "discovery task aborted");
            }
        }

        let mut guard = merged.lock().unwrap_or_else(PoisonError::into_inner);
        std::mem::take(&mut *guard)
    }
}

async fn discover_host<A: ApiConnector>(
    connector: &A,
    settings: &DiscoverySettings,
    host: &str,
) -> Result<DiscoveredAddresses, DiscoveryError> {
    let api_error = |source: ApiError| DiscoveryError::Api {
        host: host.to_owned(),
        source,
    };

    let address = settings.address_for(host);
    let mut client = connector
        .connect(&address, &settings.username, &settings.password, &settings.tls)
        .await
        .map_err(api_error)?;

    let mut interfaces = running_interfaces(&mut client, L2TP_CLIENT_PATH)
        .await
        .map_err(api_error)?;
    interfaces.extend(
        running_interfaces(&mut client, L2TP_SERVER_PATH)
            .await
            .map_err(api_error)?,
    );

    let mut partial = DiscoveredAddresses::new();
    for interface in interfaces {
        let records = client
            .query(ADDRESS_PATH, &[("interface", interface.as_str())])
            .await
            .map_err(api_error)?;
        for record in records {
            if let Some(network) = record.get("network") {
                partial.insert(composite_key(host, &interface), network.clone());
            }
        }
    }
    Ok(partial)
}

async fn running_interfaces<C: ApiClient>(
    client: &mut C,
    path: &str,
) -> Result<Vec<String>, ApiError> {
    let records = client.query(path, &[("running", "true")]).await?;
    Ok(records
        .into_iter()
        .filter_map(|mut record| record.remove("name"))
        .collect())
}
