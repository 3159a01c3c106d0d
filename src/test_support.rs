//! Test support utilities shared across unit and integration tests.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::env;
use std::ffi::OsString;
use std::sync::{Arc, PoisonError};

use camino::{Utf8Path, Utf8PathBuf};
use tokio::sync::{Mutex, MutexGuard};

use crate::api::{ApiClient, ApiConnector, ApiError, ApiFuture, Record, TlsOptions};
use crate::command::{CommandError, CommandFuture, CommandOutput, CommandRequest, CommandRunner};
use crate::discovery::{ADDRESS_PATH, L2TP_CLIENT_PATH, L2TP_SERVER_PATH};
use crate::identity::IDENTITY_COMMAND;
use crate::remote::{RemoteConnector, RemoteError, RemoteFuture, RemoteSession};
use crate::target::Target;

/// Scripted command runner that returns pre-seeded outputs in FIFO order.
///
/// Clones share the same queue and invocation log, so a test can keep one
/// handle for assertions while the code under test owns another.
#[derive(Clone, Debug, Default)]
pub struct ScriptedRunner {
    responses: Arc<std::sync::Mutex<VecDeque<CommandOutput>>>,
    invocations: Arc<std::sync::Mutex<Vec<CommandRequest>>>,
}

impl ScriptedRunner {
    /// Creates a new runner with no queued responses.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of all invocations recorded so far.
    #[must_use]
    pub fn invocations(&self) -> Vec<CommandRequest> {
        self.invocations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Pushes a successful exit status.
    pub fn push_success(&self) {
        self.push_output(Some(0), "", "");
    }

    /// Pushes a failing exit code with stderr text.
    pub fn push_failure(&self, code: i32) {
        self.push_output(Some(code), "", "simulated failure");
    }

    /// Pushes an explicit command output response.
    pub fn push_output(
        &self,
        code: Option<i32>,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
    ) {
        self.responses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(CommandOutput {
                code,
                stdout: stdout.into(),
                stderr: stderr.into(),
            });
    }
}

impl CommandRunner for ScriptedRunner {
    fn run<'a>(&'a self, request: &'a CommandRequest) -> CommandFuture<'a> {
        self.invocations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request.clone());
        let next = self
            .responses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        Box::pin(async move {
            next.ok_or_else(|| CommandError::Spawn {
                program: request.program.clone(),
                message: String::from("no scripted response available"),
            })
        })
    }
}

/// Global mutex used to serialise environment mutation in tests.
pub static ENV_LOCK: Mutex<()> = Mutex::const_new(());

/// Guard that holds the env mutex and restores variables on drop.
pub struct EnvGuard {
    previous: Vec<(String, Option<OsString>)>,
    _guard: MutexGuard<'static, ()>,
}

impl EnvGuard {
    /// Sets and removes environment variables while holding a global mutex.
    ///
    /// Every key in `remove` is cleared so ambient settings on the developer
    /// machine cannot leak into a test.
    pub async fn set_vars(pairs: &[(&str, &str)], remove: &[&str]) -> Self {
        debug_assert!(
            {
                let mut seen = BTreeSet::new();
                pairs
                    .iter()
                    .map(|(key, _)| *key)
                    .chain(remove.iter().copied())
                    .all(|key| seen.insert(key))
            },
            "duplicate environment variable keys passed to EnvGuard::set_vars"
        );

        let guard = ENV_LOCK.lock().await;
        let mut previous = Vec::with_capacity(pairs.len() + remove.len());
        for (key, value) in pairs {
            previous.push(((*key).to_owned(), env::var_os(key)));
            // SAFETY: Environment mutation is serialised by `ENV_LOCK`, preventing races.
            unsafe { env::set_var(key, value) };
        }
        for key in remove {
            previous.push(((*key).to_owned(), env::var_os(key)));
            // SAFETY: Environment mutation is serialised by `ENV_LOCK`, preventing races.
            unsafe { env::remove_var(key) };
        }

        Self {
            previous,
            _guard: guard,
        }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, old) in self.previous.iter().rev() {
            // SAFETY: Environment mutation is serialised by holding `_guard`.
            unsafe {
                match old {
                    Some(val) => env::set_var(key, val),
                    None => env::remove_var(key),
                }
            }
        }
    }
}

/// Scripted behaviour of one router behind [`FakeConnector`].
#[derive(Clone, Debug, Default)]
pub struct FakeRouter {
    identity_replies: Vec<String>,
    refuse_connect: bool,
    failing_commands: BTreeSet<String>,
    failing_downloads: BTreeSet<String>,
    failing_deletes: bool,
}

impl FakeRouter {
    /// Router whose identity command prints `name: <name>`.
    #[must_use]
    pub fn named(name: &str) -> Self {
        Self {
            identity_replies: vec![format!("  name: {name}\r\n")],
            ..Self::default()
        }
    }

    /// Replaces the identity replies. Replies are consumed in order and the
    /// last one repeats.
    #[must_use]
    pub fn with_identity_replies<I, S>(mut self, replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.identity_replies = replies.into_iter().map(Into::into).collect();
        self
    }

    /// Rejects every connection attempt.
    #[must_use]
    pub const fn refusing_connections(mut self) -> Self {
        self.refuse_connect = true;
        self
    }

    /// Fails `command` with a transport error.
    #[must_use]
    pub fn failing_command(mut self, command: &str) -> Self {
        self.failing_commands.insert(command.to_owned());
        self
    }

    /// Fails downloads of `remote_path`.
    #[must_use]
    pub fn failing_download(mut self, remote_path: &str) -> Self {
        self.failing_downloads.insert(remote_path.to_owned());
        self
    }

    /// Fails every remote delete.
    #[must_use]
    pub const fn failing_deletes(mut self) -> Self {
        self.failing_deletes = true;
        self
    }
}

/// Observable step performed through a fake session.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RemoteEvent {
    /// A session was opened.
    Connected {
        /// Router address.
        host: String,
    },
    /// A command was run.
    Ran {
        /// Router address.
        host: String,
        /// Command text.
        command: String,
    },
    /// A file was downloaded.
    Downloaded {
        /// Router address.
        host: String,
        /// File on the router.
        remote_path: String,
        /// Local destination.
        local_path: Utf8PathBuf,
    },
    /// A remote file was removed.
    Deleted {
        /// Router address.
        host: String,
        /// File on the router.
        remote_path: String,
    },
    /// The session was closed.
    Closed {
        /// Router address.
        host: String,
    },
}

impl RemoteEvent {
    /// Router the event belongs to.
    #[must_use]
    pub fn host(&self) -> &str {
        match self {
            Self::Connected { host }
            | Self::Ran { host, .. }
            | Self::Downloaded { host, .. }
            | Self::Deleted { host, .. }
            | Self::Closed { host } => host,
        }
    }
}

type EventLog = Arc<std::sync::Mutex<Vec<RemoteEvent>>>;

fn record(log: &EventLog, event: RemoteEvent) {
    log.lock().unwrap_or_else(PoisonError::into_inner).push(event);
}

/// In-memory [`RemoteConnector`] keyed by host.
#[derive(Clone, Debug, Default)]
pub struct FakeConnector {
    routers: BTreeMap<String, FakeRouter>,
    log: EventLog,
}

impl FakeConnector {
    /// Creates a connector that knows no routers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `router` under `host`.
    #[must_use]
    pub fn with_router(mut self, host: &str, router: FakeRouter) -> Self {
        self.routers.insert(host.to_owned(), router);
        self
    }

    /// Every event recorded so far, across all sessions.
    #[must_use]
    pub fn events(&self) -> Vec<RemoteEvent> {
        self.log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Events recorded for `host`, in order.
    #[must_use]
    pub fn events_for(&self, host: &str) -> Vec<RemoteEvent> {
        self.events()
            .into_iter()
            .filter(|event| event.host() == host)
            .collect()
    }
}

impl RemoteConnector for FakeConnector {
    type Session = FakeSession;

    fn connect<'a>(&'a self, target: &'a Target) -> RemoteFuture<'a, Self::Session> {
        Box::pin(async move {
            let Some(router) = self.routers.get(&target.host) else {
                return Err(RemoteError::Connect {
                    host: target.host.clone(),
                    message: String::from("no route to host"),
                });
            };
            if router.refuse_connect {
                return Err(RemoteError::Connect {
                    host: target.host.clone(),
                    message: String::from("connection refused"),
                });
            }
            record(
                &self.log,
                RemoteEvent::Connected {
                    host: target.host.clone(),
                },
            );
            Ok(FakeSession::with_log(
                &target.host,
                router.clone(),
                Arc::clone(&self.log),
            ))
        })
    }
}

/// Session on a [`FakeRouter`]. Downloads write a small text file.
#[derive(Debug)]
pub struct FakeSession {
    host: String,
    router: FakeRouter,
    identity_replies: std::sync::Mutex<VecDeque<String>>,
    log: EventLog,
}

impl FakeSession {
    /// Opens a standalone session on `router`.
    #[must_use]
    pub fn new(host: &str, router: FakeRouter) -> Self {
        Self::with_log(host, router, EventLog::default())
    }

    fn with_log(host: &str, router: FakeRouter, log: EventLog) -> Self {
        let identity_replies = router.identity_replies.iter().cloned().collect();
        Self {
            host: host.to_owned(),
            router,
            identity_replies: std::sync::Mutex::new(identity_replies),
            log,
        }
    }

    /// Commands run through this session's log, in order.
    #[must_use]
    pub fn commands(&self) -> Vec<String> {
        self.log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter_map(|event| match event {
                RemoteEvent::Ran { host, command } if *host == self.host => Some(command.clone()),
                _ => None,
            })
            .collect()
    }

    fn next_identity(&self) -> String {
        let mut replies = self
            .identity_replies
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if replies.len() > 1 {
            replies.pop_front().unwrap_or_default()
        } else {
            replies.front().cloned().unwrap_or_default()
        }
    }
}

impl RemoteSession for FakeSession {
    fn run<'a>(&'a self, command: &'a str) -> RemoteFuture<'a, String> {
        Box::pin(async move {
            record(
                &self.log,
                RemoteEvent::Ran {
                    host: self.host.clone(),
                    command: command.to_owned(),
                },
            );
            if self.router.failing_commands.contains(command) {
                return Err(RemoteError::Command {
                    host: self.host.clone(),
                    command: command.to_owned(),
                    message: String::from("simulated failure"),
                });
            }
            if command == IDENTITY_COMMAND {
                return Ok(self.next_identity());
            }
            Ok(String::new())
        })
    }

    fn download<'a>(
        &'a self,
        remote_path: &'a str,
        local_path: &'a Utf8Path,
    ) -> RemoteFuture<'a, ()> {
        Box::pin(async move {
            let download_error = |message: String| RemoteError::Download {
                host: self.host.clone(),
                remote_path: remote_path.to_owned(),
                message,
            };
            if self.router.failing_downloads.contains(remote_path) {
                return Err(download_error(String::from("simulated failure")));
            }
            if let Some(parent) = local_path.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|err| download_error(err.to_string()))?;
            }
            tokio::fs::write(local_path, format!("{}:{remote_path}\n", self.host))
                .await
                .map_err(|err| download_error(err.to_string()))?;
            record(
                &self.log,
                RemoteEvent::Downloaded {
                    host: self.host.clone(),
                    remote_path: remote_path.to_owned(),
                    local_path: local_path.to_owned(),
                },
            );
            Ok(())
        })
    }

    fn delete<'a>(&'a self, remote_path: &'a str) -> RemoteFuture<'a, ()> {
        Box::pin(async move {
            if self.router.failing_deletes {
                return Err(RemoteError::Delete {
                    host: self.host.clone(),
                    remote_path: remote_path.to_owned(),
                    message: String::from("no such item"),
                });
            }
            record(
                &self.log,
                RemoteEvent::Deleted {
                    host: self.host.clone(),
                    remote_path: remote_path.to_owned(),
                },
            );
            Ok(())
        })
    }

    fn close(&self) -> RemoteFuture<'_, ()> {
        Box::pin(async move {
            record(
                &self.log,
                RemoteEvent::Closed {
                    host: self.host.clone(),
                },
            );
            Ok(())
        })
    }
}

/// Scripted management API of one discovery host.
#[derive(Clone, Debug, Default)]
pub struct FakeApiRouter {
    clients: Vec<String>,
    servers: Vec<String>,
    addresses: Vec<(String, String)>,
    refuse_connect: bool,
    failing_paths: BTreeSet<String>,
}

impl FakeApiRouter {
    /// Router with no tunnels.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a running L2TP client interface.
    #[must_use]
    pub fn client(mut self, name: &str) -> Self {
        self.clients.push(name.to_owned());
        self
    }

    /// Adds a running L2TP server binding.
    #[must_use]
    pub fn server(mut self, name: &str) -> Self {
        self.servers.push(name.to_owned());
        self
    }

    /// Binds an address whose `network` is `network` to `interface`.
    #[must_use]
    pub fn address(mut self, interface: &str, network: &str) -> Self {
        self.addresses
            .push((interface.to_owned(), network.to_owned()));
        self
    }

    /// Rejects API logins.
    #[must_use]
    pub const fn refusing(mut self) -> Self {
        self.refuse_connect = true;
        self
    }

    /// Traps every query on `path`.
    #[must_use]
    pub fn failing_query(mut self, path: &str) -> Self {
        self.failing_paths.insert(path.to_owned());
        self
    }
}

/// In-memory [`ApiConnector`] keyed by host.
#[derive(Clone, Debug, Default)]
pub struct FakeApiConnector {
    routers: BTreeMap<String, FakeApiRouter>,
    connections: Arc<std::sync::Mutex<Vec<String>>>,
}

impl FakeApiConnector {
    /// Creates a connector that knows no hosts.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `router` under `host`.
    #[must_use]
    pub fn with_router(mut self, host: &str, router: FakeApiRouter) -> Self {
        self.routers.insert(host.to_owned(), router);
        self
    }

    /// Addresses dialled so far.
    #[must_use]
    pub fn connections(&self) -> Vec<String> {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl ApiConnector for FakeApiConnector {
    type Client = FakeApiClient;

    fn connect<'a>(
        &'a self,
        address: &'a str,
        _username: &'a str,
        _password: &'a str,
        _tls: &'a TlsOptions,
    ) -> ApiFuture<'a, Self::Client> {
        Box::pin(async move {
            self.connections
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(address.to_owned());
            let host = address
                .rsplit_once(':')
                .map_or(address, |(host, _)| host)
                .trim_start_matches('[')
                .trim_end_matches(']');
            match self.routers.get(host) {
                Some(router) if !router.refuse_connect => Ok(FakeApiClient {
                    router: router.clone(),
                }),
                Some(_) => Err(ApiError::Login(String::from(
                    "invalid user name or password",
                ))),
                None => Err(ApiError::Connect {
                    address: address.to_owned(),
                    message: String::from("connection refused"),
                }),
            }
        })
    }
}

/// Client returned by [`FakeApiConnector`].
#[derive(Clone, Debug)]
pub struct FakeApiClient {
    router: FakeApiRouter,
}

fn named_records(names: &[String]) -> Vec<Record> {
    names
        .iter()
        .map(|name| {
            Record::from([
                (String::from("name"), name.clone()),
                (String::from("running"), String::from("true")),
            ])
        })
        .collect()
}

impl ApiClient for FakeApiClient {
    fn query<'a>(
        &'a mut self,
        path: &'a str,
        filters: &'a [(&'a str, &'a str)],
    ) -> ApiFuture<'a, Vec<Record>> {
        Box::pin(async move {
            if self.router.failing_paths.contains(path) {
                return Err(ApiError::Trap {
                    message: String::from("simulated failure"),
                });
            }
            match path {
                L2TP_CLIENT_PATH => Ok(named_records(&self.router.clients)),
                L2TP_SERVER_PATH => Ok(named_records(&self.router.servers)),
                ADDRESS_PATH => {
                    let wanted = filters
                        .iter()
                        .find(|(key, _)| *key == "interface")
                        .map(|(_, value)| *value);
                    Ok(self
                        .router
                        .addresses
                        .iter()
                        .filter(|(interface, _)| Some(interface.as_str()) == wanted)
                        .map(|(interface, network)| {
                            Record::from([
                                (String::from("interface"), interface.clone()),
                                (String::from("network"), network.clone()),
                            ])
                        })
                        .collect())
                }
                other => Err(ApiError::Trap {
                    message: format!("no such command prefix: {other}"),
                }),
            }
        })
    }
}
