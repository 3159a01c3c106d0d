//! RouterOS API client over TCP or TLS.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use super::protocol::{Reply, parse_reply, read_sentence, write_sentence};
use super::tls::{self, TlsOptions};
use super::{ApiClient, ApiConnector, ApiError, ApiFuture, Record};

/// Default time allowed for the TCP connect and TLS handshake.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Byte stream an API session runs over.
pub trait ApiStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> ApiStream for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

/// Connects to the RouterOS API service.
#[derive(Clone, Debug)]
pub struct RouterOsConnector {
    connect_timeout: Duration,
}

impl Default for RouterOsConnector {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

impl RouterOsConnector {
    /// Creates a connector with the default timeout.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Overrides the connect timeout.
    #[must_use]
    pub const fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    async fn open_stream(
        &self,
        address: &str,
        tls_options: &TlsOptions,
    ) -> Result<Box<dyn ApiStream>, ApiError> {
        let connect_error = |message: String| ApiError::Connect {
            address: address.to_owned(),
            message,
        };
        let tcp = timeout(self.connect_timeout, TcpStream::connect(address))
            .await
            .map_err(|_| connect_error(String::from("timed out")))?
            .map_err(|err| connect_error(err.to_string()))?;

        if !tls_options.enabled {
            return Ok(Box::new(tcp));
        }

        let host = server_host(address);
        let stream = timeout(self.connect_timeout, tls::handshake(tcp, host, tls_options))
            .await
            .map_err(|_| ApiError::Tls(String::from("handshake timed out")))??;
        Ok(Box::new(stream))
    }
}

impl ApiConnector for RouterOsConnector {
    type Client = RouterOsClient;

    fn connect<'a>(
        &'a self,
        address: &'a str,
        username: &'a str,
        password: &'a str,
        tls: &'a TlsOptions,
    ) -> ApiFuture<'a, Self::Client> {
        Box::pin(async move {
            debug!(address, tls = tls.enabled, "opening api session");
            let stream = self.open_stream(address, tls).await?;
            let mut client = RouterOsClient::from_stream(stream);
            client.login(username, password).await?;
            Ok(client)
        })
    }
}

/// Strips the port and IPv6 brackets from `host:port`.
fn server_host(address: &str) -> &str {
    let host = address
        .rsplit_once(':')
        .map_or(address, |(host, port)| {
            if port.chars().all(|ch| ch.is_ascii_digit()) {
                host
            } else {
                address
            }
        });
    host.trim_start_matches('[').trim_end_matches(']')
}

/// Reply to one command: its rows and the attributes on `!done`.
#[derive(Debug, Default)]
struct Response {
    records: Vec<Record>,
    done: Record,
}

/// An authenticated RouterOS API session.
pub struct RouterOsClient {
    stream: Box<dyn ApiStream>,
}

impl std::fmt::Debug for RouterOsClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouterOsClient").finish_non_exhaustive()
    }
}

impl RouterOsClient {
    /// Wraps an already connected stream without logging in.
    #[must_use]
    pub fn from_stream(stream: Box<dyn ApiStream>) -> Self {
        Self { stream }
    }

    /// Authenticates with the post-6.43 plain login.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::Login`] when the router rejects the credentials
    /// or only offers the legacy challenge login.
    pub async fn login(&mut self, username: &str, password: &str) -> Result<(), ApiError> {
        let words = [
            String::from("/login"),
            format!("=name={username}"),
            format!("=password={password}"),
        ];
        let response = self.call(&words).await.map_err(|err| match err {
            ApiError::Trap { message } => ApiError::Login(message),
            other => other,
        })?;
        if response.done.contains_key("ret") {
            return Err(ApiError::Login(String::from(
                "router only supports the legacy challenge login",
            )));
        }
        Ok(())
    }

    async fn call(&mut self, words: &[String]) -> Result<Response, ApiError> {
        write_sentence(&mut self.stream, words).await?;

        let mut response = Response::default();
        let mut trap = None;
        loop {
            match parse_reply(read_sentence(&mut self.stream).await?)? {
                Reply::Record(record) => response.records.push(record),
                Reply::Empty => {}
                Reply::Trap(message) => trap = Some(message),
                Reply::Fatal(message) => return Err(ApiError::Fatal { message }),
                Reply::Done(attributes) => {
                    response.done = attributes;
                    break;
                }
            }
        }

        match trap {
            Some(message) => Err(ApiError::Trap { message }),
            None => Ok(response),
        }
    }
}

impl ApiClient for RouterOsClient {
    fn query<'a>(
        &'a mut self,
        path: &'a str,
        filters: &'a [(&'a str, &'a str)],
    ) -> ApiFuture<'a, Vec<Record>> {
        Box::pin(async move {
            let mut words = Vec::with_capacity(filters.len() + 1);
            words.push(path.to_owned());
            words.extend(
                filters
                    .iter()
                    .map(|(key, value)| format!("?{key}={value}")),
            );
            Ok(self.call(&words).await?.records)
        })
    }
}
