// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The persisted set of running guests.
//!
//! The registry is a JSON object keyed by guest UUID. It is the only state
//! shared between invocations, so every [`RegistryStore::load`] checks each
//! record against the host before handing the registry out: records whose
//! hypervisor process is gone are dropped, and records whose process cannot
//! be signalled are pinged to refresh their network state. The reconciled
//! registry is written back before it is returned.

use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;
use std::net::IpAddr;
use std::str::FromStr;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::console;
use crate::data_dir::DataDir;
use crate::executor::Executor;
use crate::net::{self, MacAddr};
use crate::request::{OptionalFeature, VmClass, VmMode};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("failed to read registry {path}")]
    Read {
        path: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },

    #[error("registry {path} is corrupt")]
    Parse {
        path: Utf8PathBuf,
        #[source]
        err: serde_json::Error,
    },

    #[error("failed to write registry {path}")]
    Write {
        path: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },

    #[error("failed to serialize registry")]
    Serialize(#[from] serde_json::Error),
}

/// The last observed reachability of a guest.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetworkState {
    #[default]
    #[serde(rename = "Network Up")]
    Up,
    /// The hypervisor is running but the guest did not answer a ping.
    #[serde(rename = "Network Down (Maybe)")]
    DownMaybe,
}

impl std::fmt::Display for NetworkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Up => "Network Up",
            Self::DownMaybe => "Network Down (Maybe)",
        })
    }
}

/// One running guest.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmRecord {
    pub mode: VmMode,
    pub vm_type: VmClass,
    /// The persistent slot, or the index within its batch for snapshot
    /// guests.
    pub vm_num: u32,
    pub vm_name: String,
    #[serde(default)]
    pub kernel_code: Option<String>,
    pub ips: Vec<IpAddr>,
    pub pid: u32,
    pub state: NetworkState,
    pub macs: Vec<MacAddr>,
    pub bridges: Vec<String>,
    pub shared_9p_tag: String,
    pub base_image: Utf8PathBuf,
    #[serde(default)]
    pub scsi_images: Vec<Utf8PathBuf>,
    #[serde(default)]
    pub optional: BTreeSet<OptionalFeature>,
}

impl VmRecord {
    /// The slot this guest occupies, if it is a persistent guest.
    pub fn slot(&self) -> Option<u32> {
        match self.mode {
            VmMode::Persistent => Some(self.vm_num),
            VmMode::Snapshot => None,
        }
    }

    pub fn primary_ip(&self) -> Option<IpAddr> {
        self.ips.first().copied()
    }

    pub fn has_pipe(&self) -> bool {
        self.optional.contains(&OptionalFeature::Pipe)
    }
}

/// Which registered guests an operation applies to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Target {
    All,
    /// The first guest with a NIC holding this address.
    Ip(IpAddr),
}

#[derive(Debug, Error)]
#[error("{0:?} is neither \"all\" nor an IP address")]
pub struct TargetParseError(String);

impl FromStr for Target {
    type Err = TargetParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "all" | "a" => Ok(Self::All),
            _ => s
                .parse()
                .map(Self::Ip)
                .map_err(|_| TargetParseError(s.to_string())),
        }
    }
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::All => f.write_str("all"),
            Self::Ip(ip) => write!(f, "{ip}"),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VmRegistry {
    vms: BTreeMap<Uuid, VmRecord>,
}

impl VmRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.vms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vms.is_empty()
    }

    pub fn contains(&self, uuid: &Uuid) -> bool {
        self.vms.contains_key(uuid)
    }

    pub fn get(&self, uuid: &Uuid) -> Option<&VmRecord> {
        self.vms.get(uuid)
    }

    pub fn get_mut(&mut self, uuid: &Uuid) -> Option<&mut VmRecord> {
        self.vms.get_mut(uuid)
    }

    pub fn insert(&mut self, uuid: Uuid, record: VmRecord) -> Option<VmRecord> {
        self.vms.insert(uuid, record)
    }

    pub fn remove(&mut self, uuid: &Uuid) -> Option<VmRecord> {
        self.vms.remove(uuid)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Uuid, &VmRecord)> {
        self.vms.iter()
    }

    /// Every MAC address held by a registered guest.
    pub fn used_macs(&self) -> BTreeSet<MacAddr> {
        self.vms.values().flat_map(|r| r.macs.iter().copied()).collect()
    }

    /// The persistent slots taken by guests of `class`.
    pub fn used_slots(&self, class: VmClass) -> BTreeSet<u32> {
        self.vms
            .values()
            .filter(|r| r.vm_type == class)
            .filter_map(VmRecord::slot)
            .collect()
    }

    /// The guests `target` refers to.
    pub fn resolve(&self, target: Target) -> Vec<Uuid> {
        match target {
            Target::All => self.vms.keys().copied().collect(),
            Target::Ip(ip) => self
                .vms
                .iter()
                .find(|(_, r)| r.ips.contains(&ip))
                .map(|(uuid, _)| vec![*uuid])
                .unwrap_or_default(),
        }
    }
}

impl<'a> IntoIterator for &'a VmRegistry {
    type Item = (&'a Uuid, &'a VmRecord);
    type IntoIter = std::collections::btree_map::Iter<'a, Uuid, VmRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.vms.iter()
    }
}

/// What a zero signal sent to a recorded pid revealed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProcessStatus {
    /// No such process.
    Gone,
    /// The process exists and may be signalled.
    Alive,
    /// The process exists but belongs to another user, which is the normal
    /// case for hypervisors started under `sudo`.
    AliveUnsignalable,
}

/// Checks whether a process exists.
pub trait ProcessProbe: Send + Sync {
    fn probe(&self, pid: u32) -> ProcessStatus;
}

/// Probes processes on this host with `kill(pid, 0)`.
#[derive(Clone, Copy, Debug, Default)]
pub struct HostProcessProbe;

impl ProcessProbe for HostProcessProbe {
    fn probe(&self, pid: u32) -> ProcessStatus {
        // Zero and out-of-range values would address process groups.
        let pid = match libc::pid_t::try_from(pid) {
            Ok(pid) if pid > 0 => pid,
            _ => return ProcessStatus::Gone,
        };

        // SAFETY: signal 0 only checks for existence and permission.
        let rc = unsafe { libc::kill(pid, 0) };
        if rc == 0 {
            return ProcessStatus::Alive;
        }

        match std::io::Error::last_os_error().raw_os_error() {
            Some(libc::ESRCH) => ProcessStatus::Gone,
            Some(libc::EPERM) => ProcessStatus::AliveUnsignalable,
            errno => {
                warn!(pid, ?errno, "unexpected error probing process");
                ProcessStatus::Alive
            }
        }
    }
}

/// Loads, reconciles, and saves the registry file.
#[derive(Clone, Debug)]
pub struct RegistryStore {
    path: Utf8PathBuf,
    pipes_dir: Utf8PathBuf,
    ping_interval: Duration,
}

impl RegistryStore {
    pub fn new(data_dir: &DataDir) -> Self {
        Self {
            path: data_dir.registry_file(),
            pipes_dir: data_dir.pipes_dir(),
            ping_interval: Duration::from_millis(200),
        }
    }

    /// Sets the `ping -i` interval of the quick reachability check made for
    /// guests whose process cannot be signalled.
    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    /// Reads the registry file as written, without checking it against the
    /// host. A missing file is an empty registry.
    pub fn read_raw(&self) -> Result<VmRegistry, RegistryError> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path, "no registry file, starting empty");
                return Ok(VmRegistry::new());
            }
            Err(err) => {
                return Err(RegistryError::Read { path: self.path.clone(), err })
            }
        };

        if contents.trim().is_empty() {
            return Ok(VmRegistry::new());
        }

        serde_json::from_str(&contents).map_err(|err| RegistryError::Parse {
            path: self.path.clone(),
            err,
        })
    }

    /// Returns the registry after checking every record against the host,
    /// and saves the result.
    pub fn load(
        &self,
        exec: &dyn Executor,
        probe: &dyn ProcessProbe,
    ) -> Result<VmRegistry, RegistryError> {
        let mut registry = self.read_raw()?;
        self.reconcile(&mut registry, exec, probe);
        self.save(&registry)?;
        Ok(registry)
    }

    /// Drops records whose process is gone and refreshes the network state
    /// of the rest.
    pub fn reconcile(
        &self,
        registry: &mut VmRegistry,
        exec: &dyn Executor,
        probe: &dyn ProcessProbe,
    ) {
        let mut dead = Vec::new();
        for (uuid, record) in registry.vms.iter_mut() {
            match probe.probe(record.pid) {
                ProcessStatus::Gone => {
                    info!(
                        %uuid, pid = record.pid, name = %record.vm_name,
                        "guest is no longer running"
                    );
                    dead.push(*uuid);
                }
                ProcessStatus::Alive => {
                    debug!(%uuid, pid = record.pid, "guest found running");
                    record.state = NetworkState::Up;
                }
                ProcessStatus::AliveUnsignalable => {
                    let reachable = record.primary_ip().is_some_and(|ip| {
                        let interval = self.ping_interval;
                        net::ping_check(exec, ip, 1, interval, Duration::ZERO)
                    });
                    record.state = if reachable {
                        NetworkState::Up
                    } else {
                        NetworkState::DownMaybe
                    };
                    debug!(
                        %uuid, pid = record.pid, state = %record.state,
                        "guest found running"
                    );
                }
            }
        }

        for uuid in dead {
            if let Some(record) = registry.remove(&uuid) {
                if record.has_pipe() {
                    console::delete_pipe_files(&self.pipes_dir, &uuid);
                }
            }
        }
    }

    /// Replaces the registry file with `registry`.
    ///
    /// The new contents are written to a temporary file in the same
    /// directory, synced, and renamed over the old file, so readers see
    /// either the old or the new registry in full.
    pub fn save(&self, registry: &VmRegistry) -> Result<(), RegistryError> {
        let write_err = |err: std::io::Error| RegistryError::Write {
            path: self.path.clone(),
            err,
        };

        let dir = self.path.parent().unwrap_or(Utf8Path::new("."));
        let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(write_err)?;
        let json = serde_json::to_vec_pretty(registry)?;
        tmp.write_all(&json).map_err(write_err)?;
        tmp.write_all(b"\n").map_err(write_err)?;
        tmp.as_file().sync_all().map_err(write_err)?;
        tmp.persist(&self.path).map_err(|e| write_err(e.error))?;

        debug!(path = %self.path, count = registry.len(), "saved registry");
        Ok(())
    }
}
