// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A command channel over a guest's serial console.
//!
//! Guests launched with the `pipe` feature have their serial port attached
//! to a pair of FIFOs, `<uuid>.in` and `<uuid>.out`, in the pipes directory.
//! [`ConsoleChannel`] logs in over that console and runs commands on it
//! without needing the guest's network to work. Console output has no
//! framing of its own: a command's output is whatever the console prints
//! within a timeout, minus the echoed command line and the trailing prompt.

use std::ffi::CString;
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::time::{Duration, Instant};

use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::executor::truncate_for_log;
use crate::request::Credentials;
use crate::timing::{pause, CommDelay, PollConfig};

/// The console is considered to be at a login prompt when this appears in
/// the tail of its output.
const LOGIN_PROMPT: &str = "login:";
const LOGIN_PROMPT_WINDOW: usize = 10;

/// Run after login to check that commands actually reach a shell.
const VERIFY_COMMAND: &str = "uname -a";
const VERIFY_EXPECTED: &str = "Linux";

#[derive(Debug, Error)]
pub enum ConsoleError {
    #[error("failed to create console pipe {path}")]
    CreatePipe {
        path: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },

    #[error("console I/O failed while {op}")]
    Io {
        op: &'static str,
        #[source]
        err: std::io::Error,
    },

    #[error("console printed nothing while {0}")]
    NoOutput(&'static str),

    #[error("no login prompt after {0} reads")]
    NoLoginPrompt(u32),

    #[error("console verification failed, got {0:?}")]
    VerifyFailed(String),
}

/// The pipe pair for the guest `uuid`: (guest input, guest output).
pub fn pipe_paths(
    pipes_dir: &Utf8Path,
    uuid: &Uuid,
) -> (Utf8PathBuf, Utf8PathBuf) {
    (
        pipes_dir.join(format!("{uuid}.in")),
        pipes_dir.join(format!("{uuid}.out")),
    )
}

/// The path prefix handed to qemu's `-serial pipe:` option.
pub fn pipe_prefix(pipes_dir: &Utf8Path, uuid: &Uuid) -> Utf8PathBuf {
    pipes_dir.join(uuid.to_string())
}

/// Creates the FIFO pair for `uuid`, replacing any stale files.
pub fn create_pipe_files(
    pipes_dir: &Utf8Path,
    uuid: &Uuid,
) -> Result<(), ConsoleError> {
    let (input, output) = pipe_paths(pipes_dir, uuid);
    for path in [input, output] {
        match std::fs::remove_file(&path) {
            Ok(()) => debug!(%path, "removed stale console pipe"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(ConsoleError::CreatePipe { path, err }),
        }

        let c_path = CString::new(path.as_str()).map_err(|e| {
            ConsoleError::CreatePipe {
                path: path.clone(),
                err: std::io::Error::new(ErrorKind::InvalidInput, e),
            }
        })?;

        // SAFETY: `c_path` is a valid NUL-terminated string that outlives
        // the call.
        let rc = unsafe { libc::mkfifo(c_path.as_ptr(), 0o600) };
        if rc != 0 {
            return Err(ConsoleError::CreatePipe {
                path,
                err: std::io::Error::last_os_error(),
            });
        }
    }

    debug!(%uuid, "created console pipes");
    Ok(())
}

/// Removes the FIFO pair for `uuid`. Failures are logged and otherwise
/// ignored.
pub fn delete_pipe_files(pipes_dir: &Utf8Path, uuid: &Uuid) {
    let (input, output) = pipe_paths(pipes_dir, uuid);
    for path in [input, output] {
        match std::fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(error) => warn!(%path, %error, "failed to delete console pipe"),
        }
    }
}

/// Drops the first line (the echoed command) and the last line (the shell
/// prompt) of raw console output.
pub fn strip_echo_and_prompt(raw: &str) -> String {
    let lines: Vec<&str> =
        raw.split('\n').map(|l| l.trim_end_matches('\r')).collect();
    if lines.len() <= 2 {
        return String::new();
    }
    lines[1..lines.len() - 1].join("\n")
}

/// The byte stream underneath a [`ConsoleChannel`].
pub trait ConsoleTransport {
    /// Collects whatever the console prints during `timeout`.
    fn read_for(&mut self, timeout: Duration) -> std::io::Result<String>;

    /// Sends `s` to the console.
    fn write_str(&mut self, s: &str) -> std::io::Result<()>;
}

impl<T: ConsoleTransport + ?Sized> ConsoleTransport for Box<T> {
    fn read_for(&mut self, timeout: Duration) -> std::io::Result<String> {
        (**self).read_for(timeout)
    }

    fn write_str(&mut self, s: &str) -> std::io::Result<()> {
        (**self).write_str(s)
    }
}

/// Opens the console of a guest by its UUID.
pub trait ConsoleOpener: Send + Sync {
    fn open(&self, uuid: &Uuid) -> Box<dyn ConsoleTransport>;
}

/// Opens the FIFO pairs in a pipes directory.
#[derive(Clone, Debug)]
pub struct FifoConsoles {
    pipes_dir: Utf8PathBuf,
}

impl FifoConsoles {
    pub fn new(pipes_dir: impl Into<Utf8PathBuf>) -> Self {
        Self { pipes_dir: pipes_dir.into() }
    }
}

impl ConsoleOpener for FifoConsoles {
    fn open(&self, uuid: &Uuid) -> Box<dyn ConsoleTransport> {
        Box::new(FifoTransport::new(&self.pipes_dir, uuid))
    }
}

/// A [`ConsoleTransport`] over a guest's FIFO pair.
pub struct FifoTransport {
    input: Utf8PathBuf,
    output: Utf8PathBuf,
    reader: Option<File>,
}

impl FifoTransport {
    const READ_POLL: Duration = Duration::from_millis(50);

    pub fn new(pipes_dir: &Utf8Path, uuid: &Uuid) -> Self {
        let (input, output) = pipe_paths(pipes_dir, uuid);
        Self { input, output, reader: None }
    }

    fn reader(&mut self) -> std::io::Result<&mut File> {
        if self.reader.is_none() {
            // A non-blocking open of a FIFO for reading succeeds whether or
            // not the hypervisor has its end open.
            let file = OpenOptions::new()
                .read(true)
                .custom_flags(libc::O_NONBLOCK)
                .open(&self.output)?;
            self.reader = Some(file);
        }

        self.reader.as_mut().ok_or_else(|| {
            std::io::Error::new(ErrorKind::NotFound, "console reader missing")
        })
    }
}

impl ConsoleTransport for FifoTransport {
    fn read_for(&mut self, timeout: Duration) -> std::io::Result<String> {
        let deadline = Instant::now() + timeout;
        let mut collected = Vec::new();
        let mut buf = [0u8; 4096];
        let reader = self.reader()?;

        loop {
            match reader.read(&mut buf) {
                Ok(0) => {}
                Ok(n) => {
                    collected.extend_from_slice(&buf[..n]);
                    continue;
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {}
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }

            let now = Instant::now();
            if now >= deadline {
                break;
            }
            pause(Self::READ_POLL.min(deadline - now));
        }

        Ok(String::from_utf8_lossy(&collected).into_owned())
    }

    fn write_str(&mut self, s: &str) -> std::io::Result<()> {
        // Non-blocking so that a missing hypervisor shows up as ENXIO
        // rather than a hang.
        let mut file = OpenOptions::new()
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(&self.input)?;
        file.write_all(s.as_bytes())
    }
}

/// Logs in and runs commands over a guest console.
pub struct ConsoleChannel<T> {
    transport: T,
    creds: Credentials,
    delay: CommDelay,
    login_read: Duration,
    login_read_attempts: u32,
    settle: Duration,
    flush: Duration,
    command_timeout: Duration,
}

impl<T: ConsoleTransport> ConsoleChannel<T> {
    pub fn new(
        transport: T,
        creds: Credentials,
        poll: &PollConfig,
        delay: CommDelay,
    ) -> Self {
        Self {
            transport,
            creds,
            delay,
            login_read: poll.login_read,
            login_read_attempts: poll.login_read_attempts,
            settle: poll.login_settle,
            flush: poll.console_flush,
            command_timeout: poll.console_command,
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// The read timeout used by [`crate::guest::GuestShell`] commands.
    pub fn command_timeout(&self) -> Duration {
        self.command_timeout
    }

    fn read(
        &mut self,
        timeout: Duration,
        op: &'static str,
    ) -> Result<String, ConsoleError> {
        let out = self
            .transport
            .read_for(timeout)
            .map_err(|err| ConsoleError::Io { op, err })?;
        trace!(op, output = %truncate_for_log(&out), "console read");
        Ok(out)
    }

    fn write(&mut self, s: &str, op: &'static str) -> Result<(), ConsoleError> {
        self.transport.write_str(s).map_err(|err| ConsoleError::Io { op, err })
    }

    /// Waits for the login prompt, logs in, and drains the login banner.
    pub fn login(&mut self) -> Result<(), ConsoleError> {
        let mut at_prompt = false;
        for _ in 0..self.login_read_attempts {
            let out = self.read(self.login_read, "waiting for login prompt")?;
            if out.is_empty() {
                return Err(ConsoleError::NoOutput("waiting for login prompt"));
            }

            let tail: String = {
                let trimmed = out.trim_end_matches(&['\r', '\n'][..]);
                let count = trimmed.chars().count();
                let skip = count.saturating_sub(LOGIN_PROMPT_WINDOW);
                trimmed.chars().skip(skip).collect()
            };
            if tail.contains(LOGIN_PROMPT) {
                at_prompt = true;
                break;
            }
        }
        if !at_prompt {
            return Err(ConsoleError::NoLoginPrompt(self.login_read_attempts));
        }

        let username = format!("{}\n", self.creds.username);
        self.write(&username, "sending username")?;
        pause(self.delay.scale(self.settle));

        let password = format!("{}\n", self.creds.password);
        self.write(&password, "sending password")?;
        pause(self.delay.scale(self.settle));

        let banner = self.read(
            self.delay.scale(self.command_timeout),
            "draining login banner",
        )?;
        if banner.is_empty() {
            return Err(ConsoleError::NoOutput("draining login banner"));
        }

        info!(user = %self.creds.username, "logged in over console");
        Ok(())
    }

    /// Runs `cmd` and returns what it printed within `timeout`, scaled by the
    /// communication delay.
    pub fn run_command(
        &mut self,
        cmd: &str,
        timeout: Duration,
    ) -> Result<String, ConsoleError> {
        debug!(cmd, "running command over console");
        self.read(self.flush, "flushing console")?;
        self.write(&format!("{cmd}\n"), "sending command")?;

        let raw =
            self.read(self.delay.scale(timeout), "reading command output")?;
        if raw.is_empty() {
            return Err(ConsoleError::NoOutput("reading command output"));
        }
        Ok(strip_echo_and_prompt(&raw))
    }

    /// Runs `cmd` under `sudo`, answering the password prompt.
    pub fn run_sudo_command(
        &mut self,
        cmd: &str,
        timeout: Duration,
    ) -> Result<String, ConsoleError> {
        debug!(cmd, "running privileged command over console");
        self.read(self.flush, "flushing console")?;
        self.write(&format!("sudo {cmd}\n"), "sending command")?;
        pause(self.delay.scale(self.settle));
        let password = format!("{}\n", self.creds.password);
        self.write(&password, "sending sudo password")?;

        let raw =
            self.read(self.delay.scale(timeout), "reading command output")?;
        if raw.is_empty() {
            return Err(ConsoleError::NoOutput("reading command output"));
        }
        Ok(strip_echo_and_prompt(&raw))
    }

    /// Checks that the console reaches a working shell.
    pub fn verify(&mut self) -> Result<(), ConsoleError> {
        let out = self.run_command(VERIFY_COMMAND, self.command_timeout)?;
        if !out.contains(VERIFY_EXPECTED) {
            return Err(ConsoleError::VerifyFailed(out));
        }
        debug!(output = %out, "console verified");
        Ok(())
    }
}
