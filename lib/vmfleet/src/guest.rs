// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! One way to run commands in a guest, whichever channel carries them.

use std::net::IpAddr;

use thiserror::Error;

use crate::console::{ConsoleChannel, ConsoleError, ConsoleTransport};
use crate::executor::{CommandOutput, ExecutionError, Executor};
use crate::request::Credentials;

#[derive(Debug, Error)]
pub enum GuestError {
    #[error(transparent)]
    Exec(#[from] ExecutionError),

    #[error(transparent)]
    Console(#[from] ConsoleError),
}

impl GuestError {
    /// The text the failed command printed, if it got far enough to print
    /// anything.
    pub fn diagnostic(&self) -> String {
        match self {
            Self::Exec(e) => e.diagnostic(),
            Self::Console(e) => e.to_string(),
        }
    }
}

/// Runs shell commands inside one guest.
pub trait GuestShell {
    fn run(&mut self, cmd: &str) -> Result<CommandOutput, GuestError>;

    /// Runs `cmd` as root through `sudo`.
    fn run_privileged(
        &mut self,
        cmd: &str,
    ) -> Result<CommandOutput, GuestError>;
}

/// A guest reached over SSH.
pub struct SshShell<'a> {
    exec: &'a dyn Executor,
    ip: IpAddr,
    creds: &'a Credentials,
}

impl<'a> SshShell<'a> {
    pub fn new(
        exec: &'a dyn Executor,
        ip: IpAddr,
        creds: &'a Credentials,
    ) -> Self {
        Self { exec, ip, creds }
    }

    pub fn ip(&self) -> IpAddr {
        self.ip
    }
}

impl GuestShell for SshShell<'_> {
    fn run(&mut self, cmd: &str) -> Result<CommandOutput, GuestError> {
        Ok(self.exec.run_remote(cmd, self.ip, self.creds)?)
    }

    fn run_privileged(
        &mut self,
        cmd: &str,
    ) -> Result<CommandOutput, GuestError> {
        Ok(self.exec.run_remote_privileged(cmd, self.ip, self.creds)?)
    }
}

/// Console commands report no exit status, so anything that produced output
/// counts as success.
impl<T: ConsoleTransport> GuestShell for ConsoleChannel<T> {
    fn run(&mut self, cmd: &str) -> Result<CommandOutput, GuestError> {
        let timeout = self.command_timeout();
        Ok(CommandOutput::ok(self.run_command(cmd, timeout)?))
    }

    fn run_privileged(
        &mut self,
        cmd: &str,
    ) -> Result<CommandOutput, GuestError> {
        let timeout = self.command_timeout();
        Ok(CommandOutput::ok(self.run_sudo_command(cmd, timeout)?))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::fakes::{CallKind, FakeExecutor, ScriptedConsole};
    use crate::timing::{CommDelay, PollConfig};

    #[test]
    fn ssh_shell_targets_its_guest() {
        let exec = FakeExecutor::new(|_| Ok(CommandOutput::ok("ok\n")));
        let creds = Credentials::new("root", "root");
        let ip: IpAddr = "192.168.122.10".parse().unwrap();
        let mut shell = SshShell::new(&exec, ip, &creds);

        shell.run("uname -a").unwrap();
        shell.run_privileged("modprobe loop").unwrap();

        let calls = exec.calls();
        assert_eq!(calls[0].kind, CallKind::Remote(ip));
        assert_eq!(calls[1].kind, CallKind::RemotePrivileged(ip));
        assert_eq!(calls[1].command, "modprobe loop");
    }

    #[test]
    fn console_channel_is_a_guest_shell() {
        let console = ScriptedConsole::new(|input| {
            format!("{}\r\nline one\r\n$ ", input.trim_end())
        });
        let mut chan = ConsoleChannel::new(
            console,
            Credentials::new("root", "root"),
            &PollConfig::immediate(),
            CommDelay::BASE,
        );

        let shell: &mut dyn GuestShell = &mut chan;
        let out = shell.run("echo").unwrap();
        assert_eq!(out.stdout, "line one");
        assert!(out.success());
    }
}
