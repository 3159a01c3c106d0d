//! Router identity lookup and normalisation.
//!
//! The identity names the backup artifacts and is the key the dedup registry
//! uses to notice that two discovered addresses lead to the same router.

use std::fmt;
use std::time::Duration;

use thiserror::Error;
use tokio::time::{Instant, sleep};
use tracing::debug;

use crate::remote::{RemoteError, RemoteSession};

/// Command that prints the router identity.
pub const IDENTITY_COMMAND: &str = "/system identity print";

/// Delay between attempts while the router returns an empty identity.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Total time allowed for a non-empty identity to appear.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Payloads up to this many bytes carry no header token.
const HEADER_LEN: usize = 9;

/// Normalised router identity: no whitespace, colons or path separators.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct RouterIdentity(String);

impl RouterIdentity {
    /// Normalises raw command output, returning `None` when nothing is left.
    #[must_use]
    pub fn from_raw(raw: &str) -> Option<Self> {
        let normalized = normalize(raw);
        (!normalized.is_empty()).then_some(Self(normalized))
    }

    /// Borrows the identity as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RouterIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for RouterIdentity {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Turns `/system identity print` output into a filesystem-safe token.
///
/// Longer payloads start with a header token (`name:`), which is dropped.
/// The rest is trimmed, inner whitespace and path separators become `-`,
/// colons are removed and a leading `.` becomes `_`, so the token is always
/// a plain file name. Applying the function to its own output returns it
/// unchanged.
#[must_use]
pub fn normalize(raw: &str) -> String {
    let body = if raw.len() > HEADER_LEN {
        strip_header(raw)
    } else {
        raw
    };
    let mut token: String = body
        .trim()
        .chars()
        .filter(|ch| *ch != ':')
        .map(|ch| {
            if ch.is_whitespace() || matches!(ch, '/' | '\\') {
                '-'
            } else {
                ch
            }
        })
        .collect();
    if token.starts_with('.') {
        token.replace_range(..1, "_");
    }
    token
}

fn strip_header(raw: &str) -> &str {
    raw.trim_start()
        .split_once(char::is_whitespace)
        .map_or(raw, |(_, body)| body)
}

/// Errors raised while resolving an identity.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum IdentityError {
    /// Raised when the router keeps returning an empty identity.
    #[error("timed out waiting for the identity of {host}")]
    Timeout {
        /// Router address.
        host: String,
    },
    /// Raised when the identity command cannot be run.
    #[error(transparent)]
    Command(#[from] RemoteError),
}

/// Fetches identities, retrying empty replies under a deadline.
#[derive(Clone, Debug)]
pub struct IdentityResolver {
    poll_interval: Duration,
    timeout: Duration,
}

impl Default for IdentityResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl IdentityResolver {
    /// Creates a resolver with the default interval and deadline.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Overrides the delay between attempts.
    #[must_use]
    pub const fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Overrides the overall deadline.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Resolves the identity of the router behind `session`.
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError::Timeout`] when no non-empty identity arrives
    /// before the deadline and [`IdentityError::Command`] on the first
    /// transport failure.
    pub async fn resolve<S>(&self, session: &S, host: &str) -> Result<RouterIdentity, IdentityError>
    where
        S: RemoteSession + Sync + ?Sized,
    {
        let deadline = Instant::now() + self.timeout;
        loop {
            let raw = session.run(IDENTITY_COMMAND).await?;
            if let Some(identity) = RouterIdentity::from_raw(&raw) {
                return Ok(identity);
            }

            if Instant::now() >= deadline {
                return Err(IdentityError::Timeout {
                    host: host.to_owned(),
                });
            }

            debug!(host, "router returned an empty identity, retrying");
            sleep(self.poll_interval).await;
        }
    }
}
