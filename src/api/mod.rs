//! Router management API clients.
//!
//! Discovery talks to routers through [`ApiConnector`] and [`ApiClient`].
//! The production implementation in [`routeros`] speaks the RouterOS API
//! over plain TCP or TLS.

use std::collections::BTreeMap;
use std::future::Future;
use std::io;
use std::pin::Pin;

use thiserror::Error;

pub mod protocol;
pub mod routeros;
pub mod tls;

pub use routeros::{ApiStream, RouterOsClient, RouterOsConnector};
pub use tls::TlsOptions;

/// One result row: attribute name to value.
pub type Record = BTreeMap<String, String>;

/// Future returned by API operations.
pub type ApiFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, ApiError>> + Send + 'a>>;

/// Opens authenticated API sessions.
pub trait ApiConnector: Send + Sync {
    /// Client type produced by this connector.
    type Client: ApiClient + Send + 'static;

    /// Dials `address` (`host:port`) and logs in.
    fn connect<'a>(
        &'a self,
        address: &'a str,
        username: &'a str,
        password: &'a str,
        tls: &'a TlsOptions,
    ) -> ApiFuture<'a, Self::Client>;
}

/// An authenticated API session.
pub trait ApiClient {
    /// Runs the command at `path` with `?key=value` filters and collects
    /// every returned record.
    fn query<'a>(
        &'a mut self,
        path: &'a str,
        filters: &'a [(&'a str, &'a str)],
    ) -> ApiFuture<'a, Vec<Record>>;
}

/// Errors raised by API clients.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Raised when the TCP connection cannot be established.
    #[error("could not connect to {address}: {message}")]
    Connect {
        /// Address that was dialled.
        address: String,
        /// Transport diagnostic.
        message: String,
    },
    /// Raised when TLS setup or the handshake fails.
    #[error("tls error: {0}")]
    Tls(String),
    /// Raised when the connection breaks mid-conversation.
    #[error("api i/o error: {0}")]
    Io(#[from] io::Error),
    /// Raised when the router sends something the codec cannot parse.
    #[error("api protocol error: {0}")]
    Protocol(String),
    /// Raised when a command is rejected with `!trap`.
    #[error("router rejected command: {message}")]
    Trap {
        /// Message supplied by the router.
        message: String,
    },
    /// Raised when the router aborts the session with `!fatal`.
    #[error("router closed the session: {message}")]
    Fatal {
        /// Reason supplied by the router.
        message: String,
    },
    /// Raised when authentication fails.
    #[error("login failed: {0}")]
    Login(String),
}
