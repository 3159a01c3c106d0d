//! Remote command and file-transfer sessions on a router.
//!
//! The orchestrator only sees [`RemoteConnector`] and [`RemoteSession`]; the
//! concrete transport lives in [`ssh`].

use std::future::Future;
use std::pin::Pin;

use camino::Utf8Path;
use thiserror::Error;

use crate::target::Target;

pub mod ssh;

pub use ssh::{SshConnector, SshOptions, SshSession};

/// Future returned by remote operations.
pub type RemoteFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, RemoteError>> + Send + 'a>>;

/// Opens sessions to routers.
pub trait RemoteConnector: Send + Sync {
    /// Session type produced by this connector.
    type Session: RemoteSession + Send + Sync + 'static;

    /// Dials `target` and authenticates.
    fn connect<'a>(&'a self, target: &'a Target) -> RemoteFuture<'a, Self::Session>;
}

/// An open, authenticated session on one router.
pub trait RemoteSession {
    /// Runs `command` and returns its standard output.
    fn run<'a>(&'a self, command: &'a str) -> RemoteFuture<'a, String>;

    /// Copies `remote_path` to `local_path`.
    ///
    /// Implementations must never leave a partially written file at
    /// `local_path`.
    fn download<'a>(&'a self, remote_path: &'a str, local_path: &'a Utf8Path)
    -> RemoteFuture<'a, ()>;

    /// Removes `remote_path` from the router.
    fn delete<'a>(&'a self, remote_path: &'a str) -> RemoteFuture<'a, ()>;

    /// Tears the session down.
    fn close(&self) -> RemoteFuture<'_, ()>;
}

/// Errors raised by remote sessions.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum RemoteError {
    /// Raised when the router cannot be reached or authentication fails.
    #[error("could not connect to {host}: {message}")]
    Connect {
        /// Router address.
        host: String,
        /// Transport diagnostic.
        message: String,
    },
    /// Raised when a remote command cannot be executed.
    #[error("command `{command}` failed on {host}: {message}")]
    Command {
        /// Router address.
        host: String,
        /// Command that was attempted.
        command: String,
        /// Transport diagnostic.
        message: String,
    },
    /// Raised when a file transfer fails.
    #[error("could not download {remote_path} from {host}: {message}")]
    Download {
        /// Router address.
        host: String,
        /// File on the router.
        remote_path: String,
        /// Transport or filesystem diagnostic.
        message: String,
    },
    /// Raised when a remote file cannot be removed.
    #[error("could not delete {remote_path} on {host}: {message}")]
    Delete {
        /// Router address.
        host: String,
        /// File on the router.
        remote_path: String,
        /// Transport diagnostic.
        message: String,
    },
    /// Raised when the session cannot be closed cleanly.
    #[error("could not close session to {host}: {message}")]
    Close {
        /// Router address.
        host: String,
        /// Transport diagnostic.
        message: String,
    },
}
