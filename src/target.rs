//! Backup targets: one router reachable over SSH.

use std::fmt;

/// Default SSH port used when configuration leaves it unset.
pub const DEFAULT_SSH_PORT: u16 = 22;

/// Connection details for a single router.
///
/// Built once from static configuration or a discovery result and then
/// moved into the job that backs the router up.
#[derive(Clone, Eq, PartialEq)]
pub struct Target {
    /// Hostname or IP address.
    pub host: String,
    /// SSH port.
    pub port: u16,
    /// Login name.
    pub username: String,
    /// Login password.
    pub password: String,
}

impl Target {
    /// Creates a target, trimming surrounding whitespace from the host and
    /// username.
    #[must_use]
    pub fn new(
        host: impl Into<String>,
        port: u16,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into().trim().to_owned(),
            port,
            username: username.into().trim().to_owned(),
            password: password.into(),
        }
    }

    /// Returns `user@host`, bracketing IPv6 literals when `bracket_ipv6` is
    /// set (required by `scp` remote specs).
    #[must_use]
    pub fn login(&self, bracket_ipv6: bool) -> String {
        if bracket_ipv6 && self.host.contains(':') && !self.host.starts_with('[') {
            format!("{}@[{}]", self.username, self.host)
        } else {
            format!("{}@{}", self.username, self.host)
        }
    }
}

impl fmt::Debug for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Target")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Joins a host and port into a dialable address, bracketing IPv6 literals.
#[must_use]
pub fn socket_address(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}
