//! Remote sessions over the system OpenSSH client.
//!
//! [`SshConnector::connect`] starts a multiplexing master (`ssh -M -N -f`)
//! on a private control socket. Every later command, `scp` transfer and the
//! final `-O exit` reuse that socket, so a router is authenticated once per
//! job no matter how many steps the backup takes.

use std::ffi::OsString;
use std::io;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use tracing::debug;
use uuid::Uuid;

use crate::command::{CommandRequest, CommandRunner, ProcessCommandRunner};
use crate::target::Target;

use super::{RemoteConnector, RemoteError, RemoteFuture, RemoteSession};

/// Key-exchange algorithm older RouterOS releases still negotiate.
pub const LEGACY_KEX_ALGORITHM: &str = "diffie-hellman-group-exchange-sha256";

/// Environment variable `sshpass -e` reads the password from.
const SSHPASS_ENV: &str = "SSHPASS";

/// Named connection behaviours applied when a session is opened.
#[derive(Clone, Debug, Eq, PartialEq)]
#[expect(
    clippy::struct_excessive_bools,
    reason = "each flag maps to one independent OpenSSH option"
)]
pub struct SshOptions {
    /// Path to the `ssh` executable.
    pub ssh_bin: String,
    /// Path to the `scp` executable.
    pub scp_bin: String,
    /// Path to the `sshpass` executable used for password logins.
    pub sshpass_bin: String,
    /// Accept any host key and never record it.
    pub ignore_host_key: bool,
    /// Offer [`LEGACY_KEX_ALGORITHM`] in addition to the client defaults.
    pub legacy_key_exchange: bool,
    /// Authenticate with the target password through `sshpass`.
    pub password_auth: bool,
    /// TCP connect timeout handed to OpenSSH.
    pub connect_timeout_secs: u32,
    /// Directory holding per-session control sockets.
    pub control_dir: Utf8PathBuf,
}

impl Default for SshOptions {
    fn default() -> Self {
        Self {
            ssh_bin: String::from("ssh"),
            scp_bin: String::from("scp"),
            sshpass_bin: String::from("sshpass"),
            ignore_host_key: true,
            legacy_key_exchange: true,
            password_auth: true,
            connect_timeout_secs: 10,
            control_dir: default_control_dir(),
        }
    }
}

impl SshOptions {
    /// Options shared by `ssh` and `scp`. `port_flag` is `-p` for `ssh` and
    /// `-P` for `scp`.
    fn common_args(&self, port_flag: &str, port: u16, control_path: &Utf8Path) -> Vec<OsString> {
        let mut args = vec![
            OsString::from(port_flag),
            OsString::from(port.to_string()),
            OsString::from("-o"),
            OsString::from(format!("ConnectTimeout={}", self.connect_timeout_secs)),
            OsString::from("-o"),
            OsString::from("LogLevel=ERROR"),
        ];

        if self.ignore_host_key {
            args.push(OsString::from("-o"));
            args.push(OsString::from("StrictHostKeyChecking=no"));
            args.push(OsString::from("-o"));
            args.push(OsString::from("UserKnownHostsFile=/dev/null"));
        }

        if self.legacy_key_exchange {
            args.push(OsString::from("-o"));
            args.push(OsString::from(format!("KexAlgorithms=+{LEGACY_KEX_ALGORITHM}")));
        }

        args.push(OsString::from("-o"));
        args.push(OsString::from(format!("ControlPath={control_path}")));
        args
    }

    fn uses_password(&self, target: &Target) -> bool {
        self.password_auth && !target.password.is_empty()
    }
}

fn default_control_dir() -> Utf8PathBuf {
    Utf8PathBuf::from_path_buf(std::env::temp_dir()).unwrap_or_else(|_| Utf8PathBuf::from("/tmp"))
}

/// Opens [`SshSession`]s through a [`CommandRunner`].
#[derive(Debug)]
pub struct SshConnector<R: CommandRunner> {
    options: Arc<SshOptions>,
    runner: Arc<R>,
}

impl SshConnector<ProcessCommandRunner> {
    /// Convenience constructor that wires the real process runner.
    #[must_use]
    pub fn with_process_runner(options: SshOptions) -> Self {
        Self::new(options, ProcessCommandRunner)
    }
}

impl<R: CommandRunner> SshConnector<R> {
    /// Creates a connector using the provided options and runner.
    #[must_use]
    pub fn new(options: SshOptions, runner: R) -> Self {
        Self {
            options: Arc::new(options),
            runner: Arc::new(runner),
        }
    }

    fn master_request(&self, target: &Target, control_path: &Utf8Path) -> CommandRequest {
        let mut ssh_args = self.options.common_args("-p", target.port, control_path);
        if self.options.uses_password(target) {
            ssh_args.push(OsString::from("-o"));
            ssh_args.push(OsString::from(
                "PreferredAuthentications=password,keyboard-interactive",
            ));
        } else {
            ssh_args.push(OsString::from("-o"));
            ssh_args.push(OsString::from("BatchMode=yes"));
        }
        ssh_args.extend(["-M", "-N", "-f"].map(OsString::from));
        ssh_args.push(OsString::from(target.login(false)));

        if self.options.uses_password(target) {
            CommandRequest::new(&self.options.sshpass_bin)
                .args([OsString::from("-e"), OsString::from(&self.options.ssh_bin)])
                .args(ssh_args)
                .env(SSHPASS_ENV, &target.password)
        } else {
            CommandRequest::new(&self.options.ssh_bin).args(ssh_args)
        }
    }
}

impl<R: CommandRunner + 'static> RemoteConnector for SshConnector<R> {
    type Session = SshSession<R>;

    fn connect<'a>(&'a self, target: &'a Target) -> RemoteFuture<'a, Self::Session> {
        Box::pin(async move {
            let control_path = self
                .options
                .control_dir
                .join(format!("mtbak-{}.sock", Uuid::new_v4().simple()));
            let request = self.master_request(target, &control_path);
            debug!(host = %target.host, port = target.port, "opening ssh master connection");

            let output = self
                .runner
                .run(&request)
                .await
                .map_err(|err| RemoteError::Connect {
                    host: target.host.clone(),
                    message: err.to_string(),
                })?;
            if !output.is_success() {
                return Err(RemoteError::Connect {
                    host: target.host.clone(),
                    message: format!(
                        "ssh exited with status {}: {}",
                        output.status_text(),
                        output.diagnostic()
                    ),
                });
            }

            Ok(SshSession {
                target: target.clone(),
                control_path,
                options: Arc::clone(&self.options),
                runner: Arc::clone(&self.runner),
            })
        })
    }
}

/// A multiplexed OpenSSH session on one router.
#[derive(Debug)]
pub struct SshSession<R: CommandRunner> {
    target: Target,
    control_path: Utf8PathBuf,
    options: Arc<SshOptions>,
    runner: Arc<R>,
}

impl<R: CommandRunner> SshSession<R> {
    /// Control socket backing this session.
    #[must_use]
    pub fn control_path(&self) -> &Utf8Path {
        &self.control_path
    }

    fn ssh_request(&self, trailing: &[&str]) -> CommandRequest {
        let mut args = self
            .options
            .common_args("-p", self.target.port, &self.control_path);
        args.push(OsString::from("-o"));
        args.push(OsString::from("BatchMode=yes"));
        args.extend(trailing.iter().map(OsString::from));
        CommandRequest::new(&self.options.ssh_bin).args(args)
    }

    fn command_request(&self, command: &str) -> CommandRequest {
        let login = self.target.login(false);
        self.ssh_request(&[login.as_str(), command])
    }

    fn scp_request(&self, remote_path: &str, local_path: &Utf8Path) -> CommandRequest {
        let mut args = self
            .options
            .common_args("-P", self.target.port, &self.control_path);
        args.push(OsString::from("-o"));
        args.push(OsString::from("BatchMode=yes"));
        args.push(OsString::from("-q"));
        args.push(OsString::from(format!(
            "{}:{remote_path}",
            self.target.login(true)
        )));
        args.push(OsString::from(local_path.as_str()));
        CommandRequest::new(&self.options.scp_bin).args(args)
    }

    fn download_error(&self, remote_path: &str, message: impl Into<String>) -> RemoteError {
        RemoteError::Download {
            host: self.target.host.clone(),
            remote_path: remote_path.to_owned(),
            message: message.into(),
        }
    }

    async fn fetch_to(
        &self,
        remote_path: &str,
        partial: &Utf8Path,
        local_path: &Utf8Path,
    ) -> Result<(), RemoteError> {
        let request = self.scp_request(remote_path, partial);
        let output = self
            .runner
            .run(&request)
            .await
            .map_err(|err| self.download_error(remote_path, err.to_string()))?;
        if !output.is_success() {
            return Err(self.download_error(
                remote_path,
                format!(
                    "scp exited with status {}: {}",
                    output.status_text(),
                    output.diagnostic()
                ),
            ));
        }

        tokio::fs::rename(partial, local_path)
            .await
            .map_err(|err| self.download_error(remote_path, err.to_string()))
    }
}

impl<R: CommandRunner> RemoteSession for SshSession<R> {
    fn run<'a>(&'a self, command: &'a str) -> RemoteFuture<'a, String> {
        Box::pin(async move {
            let request = self.command_request(command);
            let command_error = |message: String| RemoteError::Command {
                host: self.target.host.clone(),
                command: command.to_owned(),
                message,
            };

            let output = self
                .runner
                .run(&request)
                .await
                .map_err(|err| command_error(err.to_string()))?;
            if !output.is_success() {
                return Err(command_error(format!(
                    "ssh exited with status {}: {}",
                    output.status_text(),
                    output.diagnostic()
                )));
            }
            Ok(output.stdout)
        })
    }

    fn download<'a>(
        &'a self,
        remote_path: &'a str,
        local_path: &'a Utf8Path,
    ) -> RemoteFuture<'a, ()> {
        Box::pin(async move {
            if let Some(parent) = local_path.parent()
                && !parent.as_str().is_empty()
            {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|err| self.download_error(remote_path, err.to_string()))?;
            }

            let partial = Utf8PathBuf::from(format!("{local_path}.part"));
            let result = self.fetch_to(remote_path, &partial, local_path).await;
            if result.is_err() {
                remove_if_present(&partial).await;
            }
            result
        })
    }

    fn delete<'a>(&'a self, remote_path: &'a str) -> RemoteFuture<'a, ()> {
        Box::pin(async move {
            let name = remote_path.trim_start_matches('/');
            let command = format!("/file remove \"{name}\"");
            let delete_error = |message: String| RemoteError::Delete {
                host: self.target.host.clone(),
                remote_path: remote_path.to_owned(),
                message,
            };

            let output = self
                .runner
                .run(&self.command_request(&command))
                .await
                .map_err(|err| delete_error(err.to_string()))?;
            // RouterOS prints nothing when the removal succeeds.
            if !output.is_success() || !output.stdout.trim().is_empty() {
                return Err(delete_error(output.diagnostic()));
            }
            Ok(())
        })
    }

    fn close(&self) -> RemoteFuture<'_, ()> {
        Box::pin(async move {
            let login = self.target.login(false);
            let request = self.ssh_request(&["-O", "exit", login.as_str()]);
            let close_error = |message: String| RemoteError::Close {
                host: self.target.host.clone(),
                message,
            };

            let output = self
                .runner
                .run(&request)
                .await
                .map_err(|err| close_error(err.to_string()))?;
            remove_if_present(&self.control_path).await;
            if !output.is_success() {
                return Err(close_error(output.diagnostic()));
            }
            Ok(())
        })
    }
}

async fn remove_if_present(path: &Utf8Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => debug!(path = %path, err = %err, "could not remove file"),
    }
}
