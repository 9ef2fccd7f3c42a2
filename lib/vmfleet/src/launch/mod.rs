// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Starting guests and finding them on the network.
//!
//! A guest moves through [`LaunchState`] in order: its command line is
//! built, qemu is spawned under `sudo`, each of its NICs is located in the
//! host ARP table by MAC, and (for guests with a console pipe) a login over
//! the console is verified.

use std::net::IpAddr;

use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;
use tracing::{debug, info, info_span, warn};
use uuid::Uuid;

use crate::console::{ConsoleChannel, ConsoleError, ConsoleOpener};
use crate::executor::{ExecutionError, Executor};
use crate::net::{self, MacAddr};
use crate::request::{Credentials, VmClass, NICS_PER_VM};
use crate::timing::{pause, CommDelay, PollConfig};

pub mod qemu;

pub use qemu::{NicConfig, QemuCommand};

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("failed to spawn qemu for guest {uuid}")]
    Spawn {
        uuid: Uuid,
        #[source]
        err: ExecutionError,
    },

    #[error("qemu for guest {uuid} never appeared in the process table")]
    PidNotFound { uuid: Uuid },

    #[error(
        "no ARP entry for {mac} after {attempts} attempts; is the bridge \
         configured properly?"
    )]
    IpDiscoveryTimeout { mac: MacAddr, attempts: u32 },

    #[error("failed to read the host ARP table")]
    Arp(#[source] ExecutionError),

    #[error("console of guest {uuid} is unusable")]
    Console {
        uuid: Uuid,
        #[source]
        err: ConsoleError,
    },

    #[error("failed to stage image {path}")]
    Image {
        path: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },
}

/// How far a guest has come.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum LaunchState {
    Constructed,
    Spawned,
    IpDiscovered,
    Verified,
}

/// One guest of a batch, from command line to verified console.
#[derive(Clone, Debug)]
pub struct GuestLaunch {
    pub uuid: Uuid,
    /// The persistent slot, or the batch index for snapshot guests.
    pub slot: u32,
    pub qemu: QemuCommand,
    pub state: LaunchState,
    pub pid: Option<u32>,
    pub ips: Vec<IpAddr>,
}

impl GuestLaunch {
    pub fn new(uuid: Uuid, slot: u32, qemu: QemuCommand) -> Self {
        Self {
            uuid,
            slot,
            qemu,
            state: LaunchState::Constructed,
            pid: None,
            ips: Vec::new(),
        }
    }

    pub fn macs(&self) -> [MacAddr; NICS_PER_VM] {
        [self.qemu.nics[0].mac, self.qemu.nics[1].mac]
    }
}

/// Whether qemu should use KVM. Nested guests report the hypervisor they
/// run under in the kernel log, and get emulation instead.
pub fn kvm_available(exec: &dyn Executor) -> bool {
    let nested = exec.run_local("dmesg | grep -i Hypervisor").is_ok();
    if nested {
        info!("host runs under a hypervisor, not enabling KVM");
    }
    !nested
}

/// The per-slot copy of `source` used by persistent guests of `class`.
pub fn persistent_image_path(
    images_dir: &Utf8Path,
    class: VmClass,
    slot: u32,
    source: &Utf8Path,
) -> Utf8PathBuf {
    let name = source.file_name().unwrap_or(source.as_str());
    images_dir.join(class.name()).join(slot.to_string()).join(name)
}

/// Makes sure each slot has its own copy of `source`, copying it only into
/// slots that do not have one yet, and returns the per-slot paths.
pub fn stage_persistent_images(
    images_dir: &Utf8Path,
    class: VmClass,
    slots: &[u32],
    source: &Utf8Path,
) -> Result<Vec<Utf8PathBuf>, LaunchError> {
    let mut staged = Vec::with_capacity(slots.len());
    for &slot in slots {
        let path = persistent_image_path(images_dir, class, slot, source);
        if path.exists() {
            info!(%path, "image exists, not copying");
        } else {
            let image_err =
                |err| LaunchError::Image { path: path.clone(), err };
            if let Some(dir) = path.parent() {
                std::fs::create_dir_all(dir).map_err(image_err)?;
            }
            info!(%source, %path, "copying image for persistent slot");
            std::fs::copy(source, &path).map_err(image_err)?;
        }
        staged.push(path);
    }
    Ok(staged)
}

/// Spawns guests and discovers their addresses.
pub struct LaunchDriver<'a> {
    exec: &'a dyn Executor,
    poll: &'a PollConfig,
}

impl<'a> LaunchDriver<'a> {
    pub fn new(exec: &'a dyn Executor, poll: &'a PollConfig) -> Self {
        Self { exec, poll }
    }

    /// Starts qemu for `guest` in the background and records the pid of
    /// the qemu process itself.
    pub fn spawn(
        &self,
        guest: &mut GuestLaunch,
        host_password: &str,
    ) -> Result<u32, LaunchError> {
        let _span = info_span!("spawn", uuid = %guest.uuid).entered();
        let cmdline = guest.qemu.to_shell();
        info!(%cmdline, "starting guest");

        let wrapper = self
            .exec
            .spawn_local_privileged(&cmdline, host_password)
            .map_err(|err| LaunchError::Spawn { uuid: guest.uuid, err })?;

        let pid = self.find_qemu_pid(&guest.qemu.monitor).ok_or(
            LaunchError::PidNotFound { uuid: guest.uuid },
        )?;
        info!(wrapper, pid, "guest spawned");

        guest.pid = Some(pid);
        guest.state = LaunchState::Spawned;
        Ok(pid)
    }

    /// The spawned wrapper is `sudo`, so the qemu pid is found by the
    /// monitor socket path on its command line.
    fn find_qemu_pid(&self, monitor: &Utf8Path) -> Option<u32> {
        let cmd = format!("pgrep -n -f '^{}.*{monitor}'", qemu::QEMU_BINARY);
        for attempt in 1..=self.poll.pid_lookup_attempts {
            match self.exec.run_local(&cmd) {
                Ok(out) => {
                    if let Some(pid) =
                        out.first_line().and_then(|l| l.trim().parse().ok())
                    {
                        return Some(pid);
                    }
                }
                Err(e) => debug!(attempt, error = %e, "qemu not running yet"),
            }
            pause(self.poll.pid_lookup_interval);
        }
        None
    }

    /// Polls the ARP table until `mac` shows up.
    ///
    /// Returns the address along with the communication delay implied by how
    /// long the guest took to appear.
    pub fn discover_ip(
        &self,
        mac: MacAddr,
    ) -> Result<(IpAddr, CommDelay), LaunchError> {
        for attempt in 0..self.poll.arp_attempts {
            debug!(%mac, attempt = attempt + 1, "looking up guest address");
            if let Some(ip) =
                net::arp_lookup(self.exec, mac).map_err(LaunchError::Arp)?
            {
                let delay = CommDelay::from_attempts(attempt);
                info!(%mac, %ip, %delay, "found guest address");
                return Ok((ip, delay));
            }
            pause(self.poll.arp_interval);
        }

        Err(LaunchError::IpDiscoveryTimeout {
            mac,
            attempts: self.poll.arp_attempts,
        })
    }

    /// Finds the address of every NIC of `macs`, in order, and returns the
    /// largest delay any lookup implied.
    pub fn discover_ips(
        &self,
        macs: &[MacAddr],
    ) -> Result<(Vec<IpAddr>, CommDelay), LaunchError> {
        let mut delay = CommDelay::BASE;
        let mut ips = Vec::with_capacity(macs.len());
        for &mac in macs {
            let (ip, d) = self.discover_ip(mac)?;
            delay = delay.raise_to(d);
            ips.push(ip);
        }
        Ok((ips, delay))
    }

    /// Discovers the addresses of a spawned guest. Returns the communication
    /// delay the caller should raise its own to.
    pub fn discover(
        &self,
        guest: &mut GuestLaunch,
    ) -> Result<CommDelay, LaunchError> {
        let _span = info_span!("discover", uuid = %guest.uuid).entered();
        let (ips, delay) = self.discover_ips(&guest.macs())?;
        guest.ips = ips;
        guest.state = LaunchState::IpDiscovered;
        Ok(delay)
    }

    /// Logs in over the console of `guest` and checks that commands run.
    pub fn verify_console(
        &self,
        guest: &mut GuestLaunch,
        consoles: &dyn ConsoleOpener,
        creds: &Credentials,
        delay: CommDelay,
    ) -> Result<(), LaunchError> {
        let _span = info_span!("verify", uuid = %guest.uuid).entered();
        let uuid = guest.uuid;
        let console_err = |err| LaunchError::Console { uuid, err };

        let mut chan = ConsoleChannel::new(
            consoles.open(&uuid),
            creds.clone(),
            self.poll,
            delay,
        );
        chan.login().map_err(console_err)?;
        chan.verify().map_err(console_err)?;

        info!("guest console verified");
        guest.state = LaunchState::Verified;
        Ok(())
    }

    /// Marks a guest without a console pipe as ready once its addresses are
    /// known.
    pub fn skip_console(&self, guest: &mut GuestLaunch) {
        if guest.state < LaunchState::IpDiscovered {
            warn!(uuid = %guest.uuid, "marking undiscovered guest ready");
        }
        guest.state = LaunchState::Verified;
    }
}
