//! External process execution behind a swappable runner.
//!
//! The SSH adapter never links an SSH library; it drives the system OpenSSH
//! client through [`CommandRunner`] so tests can substitute scripted output
//! for real processes.

use std::ffi::OsString;
use std::future::Future;
use std::pin::Pin;
use std::process::Stdio;

use thiserror::Error;
use tokio::process::Command;

/// Result of running an external command.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandOutput {
    /// Exit code reported by the process, if available.
    pub code: Option<i32>,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

impl CommandOutput {
    /// Returns `true` when the exit code equals zero.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self.code, Some(0))
    }

    /// Human readable exit status, `unknown` when the process was killed.
    #[must_use]
    pub fn status_text(&self) -> String {
        self.code
            .map_or_else(|| String::from("unknown"), |code| code.to_string())
    }

    /// Returns stderr when present, otherwise stdout, trimmed.
    ///
    /// RouterOS reports most command failures on stdout, so callers use this
    /// to build error messages without caring which stream carried them.
    #[must_use]
    pub fn diagnostic(&self) -> String {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            self.stdout.trim().to_owned()
        } else {
            stderr.to_owned()
        }
    }
}

/// A single process invocation.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CommandRequest {
    /// Program to execute.
    pub program: String,
    /// Arguments passed to the program.
    pub args: Vec<OsString>,
    /// Extra environment variables for the child process only.
    pub envs: Vec<(String, String)>,
}

impl CommandRequest {
    /// Starts a request for `program` with no arguments.
    #[must_use]
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
        }
    }

    /// Appends arguments.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Adds an environment variable visible only to the child.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    /// Returns a shell-like command string for logs and assertions.
    ///
    /// Environment values are never included.
    #[must_use]
    pub fn command_string(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(self.program.clone());
        parts.extend(
            self.args
                .iter()
                .map(|arg| arg.to_string_lossy().into_owned()),
        );
        parts.join(" ")
    }
}

/// Errors raised when a process cannot be run at all.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum CommandError {
    /// Raised when a command cannot be spawned.
    #[error("failed to spawn {program}: {message}")]
    Spawn {
        /// Command that failed to start.
        program: String,
        /// Operating system error string.
        message: String,
    },
}

/// Future returned by [`CommandRunner::run`].
pub type CommandFuture<'a> =
    Pin<Box<dyn Future<Output = Result<CommandOutput, CommandError>> + Send + 'a>>;

/// Abstraction over command execution to support fakes in tests.
pub trait CommandRunner: Send + Sync {
    /// Runs the request, capturing stdout and stderr.
    ///
    /// A non-zero exit status is not an error at this layer; callers inspect
    /// [`CommandOutput::code`].
    fn run<'a>(&'a self, request: &'a CommandRequest) -> CommandFuture<'a>;
}

/// Real command runner that spawns processes on the host operating system.
#[derive(Clone, Debug, Default)]
pub struct ProcessCommandRunner;

impl CommandRunner for ProcessCommandRunner {
    fn run<'a>(&'a self, request: &'a CommandRequest) -> CommandFuture<'a> {
        Box::pin(async move {
            let output = Command::new(&request.program)
                .args(&request.args)
                .envs(
                    request
                        .envs
                        .iter()
                        .map(|(key, value)| (key.as_str(), value.as_str())),
                )
                .stdin(Stdio::null())
                .kill_on_drop(true)
                .output()
                .await
                .map_err(|err| CommandError::Spawn {
                    program: request.program.clone(),
                    message: err.to_string(),
                })?;

            Ok(CommandOutput {
                code: output.status.code(),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(Some(0), true)]
    #[case(Some(1), false)]
    #[case(None, false)]
    fn is_success_requires_zero_exit(#[case] code: Option<i32>, #[case] expected: bool) {
        let output = CommandOutput {
            code,
            stdout: String::new(),
            stderr: String::new(),
        };
        assert_eq!(output.is_success(), expected);
    }

    #[test]
    fn diagnostic_prefers_stderr() {
        let output = CommandOutput {
            code: Some(1),
            stdout: String::from("stdout text"),
            stderr: String::from("  denied \n"),
        };
        assert_eq!(output.diagnostic(), "denied");
    }

    #[test]
    fn diagnostic_falls_back_to_stdout() {
        let output = CommandOutput {
            code: Some(1),
            stdout: String::from("bad command name\r\n"),
            stderr: String::new(),
        };
        assert_eq!(output.diagnostic(), "bad command name");
    }

    #[test]
    fn command_string_omits_environment() {
        let request = CommandRequest::new("sshpass")
            .args(["-e", "ssh", "admin@10.0.0.1"])
            .env("SSHPASS", "hunter2");
        let rendered = request.command_string();

        assert_eq!(rendered, "sshpass -e ssh admin@10.0.0.1");
        assert!(!rendered.contains("hunter2"));
    }

    #[tokio::test]
    async fn process_runner_captures_output_and_env() {
        let request = CommandRequest::new("sh")
            .args(["-c", "printf '%s' \"$MTBAK_TEST_VALUE\"; printf 'oops' >&2; exit 3"])
            .env("MTBAK_TEST_VALUE", "hello");
        let output = ProcessCommandRunner
            .run(&request)
            .await
            .expect("sh should spawn");

        assert_eq!(output.code, Some(3));
        assert_eq!(output.stdout, "hello");
        assert_eq!(output.stderr, "oops");
    }

    #[tokio::test]
    async fn process_runner_reports_spawn_failures() {
        let request = CommandRequest::new("/nonexistent/mtbak-test-binary");
        let err = ProcessCommandRunner
            .run(&request)
            .await
            .expect_err("missing binary should fail to spawn");

        assert!(matches!(err, CommandError::Spawn { ref program, .. } if program.contains("mtbak-test-binary")));
    }
}
