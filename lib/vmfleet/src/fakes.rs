// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Scripted stand-ins for the host, used to drive the crate in tests.

use std::collections::{BTreeMap, VecDeque};
use std::net::IpAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use uuid::Uuid;

use crate::console::{ConsoleOpener, ConsoleTransport};
use crate::executor::{CommandOutput, ExecutionError, Executor};
use crate::registry::{ProcessProbe, ProcessStatus};
use crate::request::Credentials;

/// How a [`FakeCall`] was issued.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallKind {
    Local,
    LocalPrivileged,
    Spawn,
    Remote(IpAddr),
    RemotePrivileged(IpAddr),
}

/// One command received by a [`FakeExecutor`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FakeCall {
    pub kind: CallKind,
    pub command: String,
}

impl FakeCall {
    pub fn target(&self) -> Option<IpAddr> {
        match self.kind {
            CallKind::Remote(ip) | CallKind::RemotePrivileged(ip) => Some(ip),
            _ => None,
        }
    }
}

type Handler =
    Box<dyn FnMut(&FakeCall) -> Result<CommandOutput, ExecutionError> + Send>;

/// Builds the error a failing scripted command returns.
pub fn failure(command: &str, status: i32, stderr: &str) -> ExecutionError {
    ExecutionError::failure(command, Some(status), "", stderr)
}

/// An [`Executor`] that answers every command with a caller-supplied handler
/// and records what it was asked to run.
///
/// Spawned commands that the handler accepts are given increasing fake pids
/// starting at 1000.
pub struct FakeExecutor {
    handler: Mutex<Handler>,
    calls: Mutex<Vec<FakeCall>>,
    next_pid: AtomicU32,
    reaps: AtomicU32,
}

impl FakeExecutor {
    pub fn new<F>(handler: F) -> Self
    where
        F: FnMut(&FakeCall) -> Result<CommandOutput, ExecutionError>
            + Send
            + 'static,
    {
        Self {
            handler: Mutex::new(Box::new(handler)),
            calls: Mutex::new(Vec::new()),
            next_pid: AtomicU32::new(1000),
            reaps: AtomicU32::new(0),
        }
    }

    /// How many times spawned commands were reaped.
    pub fn reap_count(&self) -> u32 {
        self.reaps.load(Ordering::Relaxed)
    }

    /// Every call made so far, in order.
    pub fn calls(&self) -> Vec<FakeCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// The commands containing `needle`, in the order they were made.
    pub fn commands_containing(&self, needle: &str) -> Vec<FakeCall> {
        self.calls()
            .into_iter()
            .filter(|c| c.command.contains(needle))
            .collect()
    }

    fn dispatch(
        &self,
        kind: CallKind,
        command: &str,
    ) -> Result<CommandOutput, ExecutionError> {
        let call = FakeCall { kind, command: command.to_string() };
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call.clone());
        }

        let mut handler = match self.handler.lock() {
            Ok(handler) => handler,
            Err(poisoned) => poisoned.into_inner(),
        };
        (handler)(&call)
    }
}

impl Executor for FakeExecutor {
    fn run_local(
        &self,
        command: &str,
    ) -> Result<CommandOutput, ExecutionError> {
        self.dispatch(CallKind::Local, command)
    }

    fn run_local_privileged(
        &self,
        command: &str,
        _host_password: &str,
    ) -> Result<CommandOutput, ExecutionError> {
        self.dispatch(CallKind::LocalPrivileged, command)
    }

    fn spawn_local_privileged(
        &self,
        command: &str,
        _host_password: &str,
    ) -> Result<u32, ExecutionError> {
        self.dispatch(CallKind::Spawn, command)?;
        Ok(self.next_pid.fetch_add(1, Ordering::Relaxed))
    }

    fn run_remote(
        &self,
        command: &str,
        ip: IpAddr,
        _creds: &Credentials,
    ) -> Result<CommandOutput, ExecutionError> {
        self.dispatch(CallKind::Remote(ip), command)
    }

    fn run_remote_privileged(
        &self,
        command: &str,
        ip: IpAddr,
        _creds: &Credentials,
    ) -> Result<CommandOutput, ExecutionError> {
        self.dispatch(CallKind::RemotePrivileged(ip), command)
    }

    fn reap_spawned(&self) -> usize {
        self.reaps.fetch_add(1, Ordering::Relaxed);
        0
    }
}

/// A [`ProcessProbe`] with a fixed answer per pid. Unknown pids are
/// [`ProcessStatus::Gone`].
#[derive(Debug, Default)]
pub struct FakeProcessProbe {
    pids: Mutex<BTreeMap<u32, ProcessStatus>>,
}

impl FakeProcessProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, pid: u32, status: ProcessStatus) -> Self {
        self.set(pid, status);
        self
    }

    pub fn set(&self, pid: u32, status: ProcessStatus) {
        if let Ok(mut pids) = self.pids.lock() {
            pids.insert(pid, status);
        }
    }

    pub fn kill(&self, pid: u32) {
        self.set(pid, ProcessStatus::Gone);
    }
}

impl ProcessProbe for FakeProcessProbe {
    fn probe(&self, pid: u32) -> ProcessStatus {
        self.pids
            .lock()
            .ok()
            .and_then(|pids| pids.get(&pid).copied())
            .unwrap_or(ProcessStatus::Gone)
    }
}

#[derive(Default)]
struct ConsoleState {
    pending: VecDeque<String>,
    written: Vec<String>,
    reads: Vec<Duration>,
}

type Responder = Box<dyn FnMut(&str) -> String + Send>;

/// A [`ConsoleTransport`] that answers each write with scripted output.
///
/// Clones share state, so a test can keep a handle to inspect what was
/// written after handing the console to a channel.
#[derive(Clone)]
pub struct ScriptedConsole {
    state: Arc<Mutex<ConsoleState>>,
    responder: Arc<Mutex<Responder>>,
}

impl ScriptedConsole {
    pub fn new<F>(responder: F) -> Self
    where
        F: FnMut(&str) -> String + Send + 'static,
    {
        Self {
            state: Arc::new(Mutex::new(ConsoleState::default())),
            responder: Arc::new(Mutex::new(Box::new(responder))),
        }
    }

    /// Queues output the console prints before anything is written, such as
    /// boot messages ending in a login prompt.
    pub fn with_pending(self, output: &str) -> Self {
        if let Ok(mut state) = self.state.lock() {
            state.pending.push_back(output.to_string());
        }
        self
    }

    /// Everything written to the console so far.
    pub fn written(&self) -> Vec<String> {
        self.state.lock().map(|s| s.written.clone()).unwrap_or_default()
    }

    /// The timeout of every read made so far, in order.
    pub fn read_timeouts(&self) -> Vec<Duration> {
        self.state.lock().map(|s| s.reads.clone()).unwrap_or_default()
    }
}

fn poisoned(what: &str) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::Other, format!("{what} poisoned"))
}

impl ConsoleTransport for ScriptedConsole {
    fn read_for(&mut self, timeout: Duration) -> std::io::Result<String> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| poisoned("console state"))?;
        state.reads.push(timeout);
        Ok(state.pending.drain(..).collect())
    }

    fn write_str(&mut self, s: &str) -> std::io::Result<()> {
        let response = {
            let mut responder = self
                .responder
                .lock()
                .map_err(|_| poisoned("console responder"))?;
            (responder)(s)
        };

        let mut state = self
            .state
            .lock()
            .map_err(|_| poisoned("console state"))?;
        state.written.push(s.to_string());
        if !response.is_empty() {
            state.pending.push_back(response);
        }
        Ok(())
    }
}

/// A [`ConsoleOpener`] that builds a [`ScriptedConsole`] per guest and
/// remembers the ones it handed out.
pub struct ScriptedConsoles {
    make: Box<dyn Fn(&Uuid) -> ScriptedConsole + Send + Sync>,
    opened: Mutex<Vec<(Uuid, ScriptedConsole)>>,
}

impl ScriptedConsoles {
    pub fn new<F>(make: F) -> Self
    where
        F: Fn(&Uuid) -> ScriptedConsole + Send + Sync + 'static,
    {
        Self { make: Box::new(make), opened: Mutex::new(Vec::new()) }
    }

    /// The consoles opened so far, in order.
    pub fn opened(&self) -> Vec<(Uuid, ScriptedConsole)> {
        self.opened.lock().map(|o| o.clone()).unwrap_or_default()
    }
}

impl ConsoleOpener for ScriptedConsoles {
    fn open(&self, uuid: &Uuid) -> Box<dyn ConsoleTransport> {
        let console = (self.make)(uuid);
        if let Ok(mut opened) = self.opened.lock() {
            opened.push((*uuid, console.clone()));
        }
        Box::new(console)
    }
}
