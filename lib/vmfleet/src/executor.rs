// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Runs shell commands on the host and, over SSH, inside guests.
//!
//! Every other component reaches the outside world through the [`Executor`]
//! trait. In production this is a [`HostExecutor`]; tests substitute the
//! scripted executor in [`crate::fakes`].

use std::io::Write;
use std::net::IpAddr;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::request::Credentials;

/// Captured output is cut down to this many trailing characters before it is
/// logged.
const MAX_LOGGED_OUTPUT: usize = 2000;

/// The captured result of a command that ran to completion.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// The exit code, or `None` if the process was killed by a signal.
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// Builds a successful output carrying `stdout`.
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self { status: Some(0), stdout: stdout.into(), stderr: String::new() }
    }

    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    /// Yields the non-empty lines of stdout with trailing whitespace removed.
    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.stdout.lines().map(str::trim_end).filter(|l| !l.is_empty())
    }

    /// Returns the first non-empty line of stdout, if there is one.
    pub fn first_line(&self) -> Option<&str> {
        self.lines().next()
    }
}

#[derive(Debug)]
pub struct CommandFailureInfo {
    pub command: String,
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl std::fmt::Display for CommandFailureInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self.status {
            Some(code) => write!(
                f,
                "Command [{}] executed and failed with status: {}",
                self.command, code
            )?,
            None => write!(
                f,
                "Command [{}] was terminated by a signal",
                self.command
            )?,
        }
        write!(f, "  stdout: {}", truncate_for_log(&self.stdout))?;
        write!(f, "  stderr: {}", truncate_for_log(&self.stderr))
    }
}

#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("Failed to start execution of [{command}]: {err}")]
    ExecutionStart { command: String, err: std::io::Error },

    #[error("{0}")]
    CommandFailure(Box<CommandFailureInfo>),
}

impl ExecutionError {
    /// Builds the error reported for a command that exited unsuccessfully.
    pub fn failure(
        command: impl Into<String>,
        status: Option<i32>,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
    ) -> Self {
        Self::CommandFailure(Box::new(CommandFailureInfo {
            command: command.into(),
            status,
            stdout: stdout.into(),
            stderr: stderr.into(),
        }))
    }

    /// The diagnostic text the failed command printed, stderr first.
    pub fn diagnostic(&self) -> String {
        match self {
            Self::ExecutionStart { err, .. } => err.to_string(),
            Self::CommandFailure(info) => {
                if info.stderr.trim().is_empty() {
                    info.stdout.clone()
                } else {
                    info.stderr.clone()
                }
            }
        }
    }
}

/// Runs commands locally or inside guests.
///
/// Commands are shell command lines. A command that starts but exits
/// unsuccessfully yields [`ExecutionError::CommandFailure`], which carries
/// everything the command printed.
pub trait Executor: Send + Sync {
    /// Runs `command` on the host and waits for it.
    fn run_local(&self, command: &str) -> Result<CommandOutput, ExecutionError>;

    /// Runs `command` on the host under `sudo`, feeding `host_password` to it,
    /// and waits for it.
    fn run_local_privileged(
        &self,
        command: &str,
        host_password: &str,
    ) -> Result<CommandOutput, ExecutionError>;

    /// Starts `command` on the host under `sudo` without waiting for it and
    /// returns the pid of the spawned wrapper process.
    fn spawn_local_privileged(
        &self,
        command: &str,
        host_password: &str,
    ) -> Result<u32, ExecutionError>;

    /// Collects the exit status of spawned commands that have finished and
    /// returns how many were collected. Commands still running are kept.
    fn reap_spawned(&self) -> usize {
        0
    }

    /// Runs `command` in the guest at `ip` over SSH.
    fn run_remote(
        &self,
        command: &str,
        ip: IpAddr,
        creds: &Credentials,
    ) -> Result<CommandOutput, ExecutionError>;

    /// Runs `command` in the guest at `ip` over SSH under `sudo`, using the
    /// guest password from `creds`.
    fn run_remote_privileged(
        &self,
        command: &str,
        ip: IpAddr,
        creds: &Credentials,
    ) -> Result<CommandOutput, ExecutionError>;
}

/// Quotes `s` so that a POSIX shell treats it as one word.
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Cuts `s` down to its trailing [`MAX_LOGGED_OUTPUT`] characters.
pub(crate) fn truncate_for_log(s: &str) -> std::borrow::Cow<'_, str> {
    let count = s.chars().count();
    if count <= MAX_LOGGED_OUTPUT {
        return s.into();
    }

    let tail: String = s.chars().skip(count - MAX_LOGGED_OUTPUT).collect();
    format!("...{tail}").into()
}

/// SSH options used for every guest connection. Guests are recreated
/// constantly, so their host keys are never recorded.
const SSH_OPTIONS: &[&str] = &[
    "-o",
    "StrictHostKeyChecking=no",
    "-o",
    "UserKnownHostsFile=/dev/null",
    "-o",
    "LogLevel=ERROR",
    "-o",
    "ConnectTimeout=10",
];

/// Waits on every child in `children` that has exited, dropping it from
/// the list, and returns the pid and status of each one.
pub(crate) fn reap_exited(children: &mut Vec<Child>) -> Vec<(u32, ExitStatus)> {
    let mut reaped = Vec::new();
    children.retain_mut(|child| match child.try_wait() {
        Ok(Some(status)) => {
            reaped.push((child.id(), status));
            false
        }
        Ok(None) => true,
        Err(error) => {
            warn!(pid = child.id(), %error, "cannot check spawned command");
            false
        }
    });
    reaped
}

/// An [`Executor`] that runs commands on this host with `sh`, `sudo`, and
/// `ssh`/`sshpass`.
#[derive(Debug, Default)]
pub struct HostExecutor {
    counter: AtomicU64,
    /// Spawned wrappers not yet waited on.
    spawned: Mutex<Vec<Child>>,
}

impl HostExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_id(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::Relaxed)
    }

    /// Runs `command`, optionally writing `stdin` to it, and collects its
    /// output. `display_cmd` is the loggable form of the command.
    fn execute(
        &self,
        mut command: Command,
        display_cmd: &str,
        stdin: Option<&str>,
    ) -> Result<CommandOutput, ExecutionError> {
        let id = self.next_id();
        info!(id, command = display_cmd, "running command via executor");

        command
            .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let start_err = |err| ExecutionError::ExecutionStart {
            command: display_cmd.to_string(),
            err,
        };

        let mut child = command.spawn().map_err(start_err)?;
        if let Some(input) = stdin {
            if let Some(mut pipe) = child.stdin.take() {
                // The child may exit without reading its input, in which
                // case its exit status tells the rest of the story.
                let _ = pipe.write_all(input.as_bytes());
            }
        }

        let output = child.wait_with_output().map_err(start_err)?;
        let result = CommandOutput {
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };

        info!(
            id,
            result = if result.success() { "OK" } else { "ERROR" },
            status = ?result.status,
            "finished running command via executor"
        );
        if !result.stdout.is_empty() {
            debug!(id, stdout = %truncate_for_log(&result.stdout));
        }
        if !result.stderr.is_empty() {
            debug!(id, stderr = %truncate_for_log(&result.stderr));
        }

        if result.success() {
            Ok(result)
        } else {
            Err(ExecutionError::failure(
                display_cmd,
                result.status,
                result.stdout,
                result.stderr,
            ))
        }
    }

    fn ssh_command(
        &self,
        remote_command: &str,
        ip: IpAddr,
        creds: &Credentials,
    ) -> Command {
        let destination = format!("{}@{}", creds.username, ip);
        let mut cmd = if creds.password.is_empty() {
            let mut cmd = Command::new("ssh");
            cmd.args(["-o", "BatchMode=yes"]);
            cmd
        } else {
            let mut cmd = Command::new("sshpass");
            cmd.env("SSHPASS", &creds.password).args(["-e", "ssh"]);
            cmd
        };
        cmd.args(SSH_OPTIONS).arg(destination).arg(remote_command);
        cmd
    }
}

impl Executor for HostExecutor {
    fn run_local(
        &self,
        command: &str,
    ) -> Result<CommandOutput, ExecutionError> {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command);
        self.execute(cmd, command, None)
    }

    fn run_local_privileged(
        &self,
        command: &str,
        host_password: &str,
    ) -> Result<CommandOutput, ExecutionError> {
        let mut cmd = Command::new("sudo");
        cmd.args(["-S", "-p", "", "sh", "-c", command]);
        let stdin = format!("{host_password}\n");
        self.execute(cmd, &format!("sudo {command}"), Some(&stdin))
    }

    fn spawn_local_privileged(
        &self,
        command: &str,
        host_password: &str,
    ) -> Result<u32, ExecutionError> {
        let display_cmd = format!("sudo {command}");
        info!(command = %display_cmd, "spawning background command");

        let mut child = Command::new("sudo")
            .args(["-S", "-p", "", "sh", "-c", command])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|err| ExecutionError::ExecutionStart {
                command: display_cmd.clone(),
                err,
            })?;

        if let Some(mut pipe) = child.stdin.take() {
            pipe.write_all(format!("{host_password}\n").as_bytes()).map_err(
                |err| ExecutionError::ExecutionStart { command: display_cmd, err },
            )?;
        }

        let pid = child.id();
        info!(pid, "spawned background command");
        match self.spawned.lock() {
            Ok(mut spawned) => spawned.push(child),
            Err(_) => warn!(pid, "spawned command list poisoned"),
        }
        Ok(pid)
    }

    fn reap_spawned(&self) -> usize {
        let Ok(mut spawned) = self.spawned.lock() else {
            return 0;
        };
        let reaped = reap_exited(&mut spawned);
        for (pid, status) in &reaped {
            info!(pid, %status, "spawned command exited");
        }
        reaped.len()
    }

    fn run_remote(
        &self,
        command: &str,
        ip: IpAddr,
        creds: &Credentials,
    ) -> Result<CommandOutput, ExecutionError> {
        let cmd = self.ssh_command(command, ip, creds);
        self.execute(cmd, &format!("{command} @ {ip}"), None)
    }

    fn run_remote_privileged(
        &self,
        command: &str,
        ip: IpAddr,
        creds: &Credentials,
    ) -> Result<CommandOutput, ExecutionError> {
        let remote = format!("sudo -S -p '' sh -c {}", shell_quote(command));
        let cmd = self.ssh_command(&remote, ip, creds);
        let stdin = format!("{}\n", creds.password);
        self.execute(cmd, &format!("sudo {command} @ {ip}"), Some(&stdin))
    }
}
